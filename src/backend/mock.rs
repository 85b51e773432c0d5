//! Deterministic headless backend used by the test suites.
//!
//! The mock keeps a manually-advanced clock, a scriptable headset status and
//! a journal of compositor calls, so protocol-level behavior (frame pacing,
//! commit ordering, session lifecycle) can be asserted without a headset or
//! a GPU. Submitting a frame advances the clock by one frame duration, which
//! keeps the pacer's sleep computation at zero during tests.

use {
    super::{
        Backend, BackendError, BackendResult, Eye, EyeRenderInfo, FovTangents, HiddenAreaMesh,
        HmdInfo, HmdStatus, Layer, PoseState, SwapchainDesc, SwapchainHandle, TextureHandle,
    },
    crate::space::Pose,
    derive_builder::{Builder, UninitializedFieldError},
    parking_lot::Mutex,
    std::collections::HashMap,
};

/// One recorded compositor call.
#[derive(Clone, Debug, PartialEq)]
pub enum JournalEvent {
    BeginFrame(u64),
    EndFrame { frame_index: u64, layer_count: usize },
    Commit(SwapchainHandle),
    DestroySwapchain(SwapchainHandle),
}

/// Information used to create a [`MockHmd`] instance.
#[derive(Builder, Clone, Debug, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "MockInfoBuilderError"),
    derive(Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct MockInfo {
    /// Display refresh rate in Hz.
    #[builder(default = "90.0")]
    pub refresh_rate: f32,

    /// Number of images in every swapchain ring.
    #[builder(default = "3")]
    pub image_count: u32,

    /// Configured eye height above the floor, in meters.
    #[builder(default = "1.7")]
    pub eye_height: f32,

    /// Recommended per-eye render size.
    #[builder(default = "(1024, 1024)")]
    pub eye_resolution: (u32, u32),

    /// Packed adapter LUID reported for the headset GPU.
    #[builder(default = "0x00ae_0001")]
    pub adapter_luid: u64,
}

impl Default for MockInfo {
    fn default() -> Self {
        MockInfoBuilder::default().build()
    }
}

impl MockInfoBuilder {
    /// Builds a new `MockInfo`.
    pub fn build(self) -> MockInfo {
        match self.fallible_build() {
            Err(MockInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

#[derive(Debug)]
struct MockInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for MockInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

struct MockSwapchain {
    desc: SwapchainDesc,
    len: u32,
    current: u32,
    commit_count: u64,
}

struct Inner {
    clock: f64,
    start: f64,
    status: HmdStatus,
    hmd_pose: PoseState,
    swapchains: HashMap<u64, MockSwapchain>,
    next_handle: u64,
    journal: Vec<JournalEvent>,
    last_layers: Vec<Layer>,
}

/// Headless compositor backend with a scriptable clock and status.
pub struct MockHmd {
    info: MockInfo,
    frame_duration: f64,
    inner: Mutex<Inner>,
}

impl MockHmd {
    pub fn new(info: impl Into<MockInfo>) -> Self {
        let info = info.into();
        let frame_duration = 1.0 / info.refresh_rate as f64;

        Self {
            info,
            frame_duration,
            inner: Mutex::new(Inner {
                clock: 1.0,
                start: 1.0,
                status: HmdStatus {
                    service_ready: true,
                    hmd_present: true,
                    hmd_mounted: true,
                    is_visible: true,
                    display_lost: false,
                    should_quit: false,
                },
                hmd_pose: PoseState {
                    pose: Pose::IDENTITY,
                    orientation_tracked: true,
                    position_tracked: true,
                },
                swapchains: HashMap::new(),
                next_handle: 1,
                journal: Vec::new(),
                last_layers: Vec::new(),
            }),
        }
    }

    /// Overrides the headset status returned to the runtime.
    pub fn set_status(&self, status: HmdStatus) {
        self.inner.lock().status = status;
    }

    /// Marks the headset as disconnected.
    pub fn disconnect(&self) {
        self.inner.lock().status.display_lost = true;
    }

    /// Overrides the tracked headset pose.
    pub fn set_hmd_pose(&self, state: PoseState) {
        self.inner.lock().hmd_pose = state;
    }

    /// Advances the backend clock.
    pub fn advance(&self, seconds: f64) {
        self.inner.lock().clock += seconds;
    }

    /// Snapshot of the recorded compositor calls.
    pub fn journal(&self) -> Vec<JournalEvent> {
        self.inner.lock().journal.clone()
    }

    /// Number of commits recorded for the given swapchain.
    pub fn commit_count(&self, swapchain: SwapchainHandle) -> u64 {
        self.inner
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|chain| chain.commit_count)
            .unwrap_or_default()
    }

    /// The creation descriptor the given swapchain was made with.
    pub fn swapchain_desc(&self, swapchain: SwapchainHandle) -> Option<SwapchainDesc> {
        self.inner
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|chain| chain.desc)
    }

    /// Number of live backend swapchains.
    pub fn swapchain_count(&self) -> usize {
        self.inner.lock().swapchains.len()
    }

    /// Layers submitted with the most recent `end_frame`.
    pub fn last_layers(&self) -> Vec<Layer> {
        self.inner.lock().last_layers.clone()
    }
}

impl Default for MockHmd {
    fn default() -> Self {
        Self::new(MockInfo::default())
    }
}

impl Backend for MockHmd {
    fn version(&self) -> String {
        "mock 1.0".to_owned()
    }

    fn hmd_info(&self) -> BackendResult<HmdInfo> {
        let inner = self.inner.lock();

        if !inner.status.service_ready || !inner.status.hmd_present {
            return Err(BackendError::new(-1));
        }

        let fov = FovTangents {
            up: 1.0,
            down: 1.0,
            left: 1.1,
            right: 1.1,
        };
        let (width, height) = self.info.eye_resolution;
        let eye = |sign: f32| EyeRenderInfo {
            fov,
            hmd_to_eye: Pose::from_translation(glam::vec3(sign * 0.032, 0.0, 0.0)),
            recommended_width: width,
            recommended_height: height,
        };

        Ok(HmdInfo {
            vendor_id: 0x2833,
            product_name: "Mock HMD".to_owned(),
            serial_number: "MOCK-0001".to_owned(),
            refresh_rate: self.info.refresh_rate,
            adapter_luid: self.info.adapter_luid,
            eyes: [eye(-1.0), eye(1.0)],
        })
    }

    fn hmd_status(&self) -> BackendResult<HmdStatus> {
        Ok(self.inner.lock().status)
    }

    fn eye_height(&self) -> f32 {
        self.info.eye_height
    }

    fn max_layer_count(&self) -> u32 {
        16
    }

    fn hidden_area_mesh(&self, _eye: Eye) -> Option<HiddenAreaMesh> {
        None
    }

    fn time_now(&self) -> f64 {
        self.inner.lock().clock
    }

    fn predicted_display_time(&self, frame_index: u64) -> f64 {
        let inner = self.inner.lock();

        inner.start + (frame_index + 1) as f64 * self.frame_duration
    }

    fn hmd_pose_state(&self, _time: f64) -> PoseState {
        self.inner.lock().hmd_pose
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> BackendResult<SwapchainHandle> {
        let mut inner = self.inner.lock();
        let handle = inner.next_handle;
        inner.next_handle += 1;

        // Static-image rings hold a single image.
        let len = if desc.static_image {
            1
        } else {
            self.info.image_count
        };

        inner.swapchains.insert(
            handle,
            MockSwapchain {
                desc: *desc,
                len,
                current: 0,
                commit_count: 0,
            },
        );

        Ok(SwapchainHandle(handle))
    }

    fn swapchain_len(&self, swapchain: SwapchainHandle) -> BackendResult<u32> {
        self.inner
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|chain| chain.len)
            .ok_or(BackendError::new(-2))
    }

    fn swapchain_current_index(&self, swapchain: SwapchainHandle) -> BackendResult<u32> {
        self.inner
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|chain| chain.current)
            .ok_or(BackendError::new(-2))
    }

    fn swapchain_texture(
        &self,
        swapchain: SwapchainHandle,
        index: u32,
    ) -> BackendResult<TextureHandle> {
        let inner = self.inner.lock();
        let chain = inner.swapchains.get(&swapchain.0).ok_or(BackendError::new(-2))?;

        if index >= chain.len {
            return Err(BackendError::new(-3));
        }

        Ok(TextureHandle(swapchain.0 << 8 | index as u64))
    }

    fn commit_swapchain(&self, swapchain: SwapchainHandle) -> BackendResult<()> {
        let mut inner = self.inner.lock();
        let chain = inner
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or(BackendError::new(-2))?;

        chain.current = (chain.current + 1) % chain.len;
        chain.commit_count += 1;
        inner.journal.push(JournalEvent::Commit(swapchain));

        Ok(())
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut inner = self.inner.lock();

        inner.swapchains.remove(&swapchain.0);
        inner.journal.push(JournalEvent::DestroySwapchain(swapchain));
    }

    fn begin_frame(&self, frame_index: u64) -> BackendResult<()> {
        let mut inner = self.inner.lock();

        if inner.status.display_lost {
            return Err(BackendError::new(-4));
        }

        inner.journal.push(JournalEvent::BeginFrame(frame_index));

        Ok(())
    }

    fn end_frame(&self, frame_index: u64, layers: &[Layer]) -> BackendResult<()> {
        let mut inner = self.inner.lock();

        if inner.status.display_lost {
            return Err(BackendError::new(-4));
        }

        inner.journal.push(JournalEvent::EndFrame {
            frame_index,
            layer_count: layers.len(),
        });
        inner.last_layers = layers.to_vec();
        inner.clock += self.frame_duration;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::backend::{BindFlags, MiscFlags, TextureFormat},
    };

    fn desc() -> SwapchainDesc {
        SwapchainDesc {
            format: TextureFormat::R8G8B8A8UnormSrgb,
            width: 64,
            height: 64,
            array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            static_image: false,
            bind_flags: BindFlags::RENDER_TARGET,
            misc_flags: MiscFlags::TYPELESS,
        }
    }

    #[test]
    pub fn commit_advances_ring() {
        let hmd = MockHmd::default();
        let chain = hmd.create_swapchain(&desc()).unwrap();

        assert_eq!(hmd.swapchain_current_index(chain).unwrap(), 0);

        hmd.commit_swapchain(chain).unwrap();

        assert_eq!(hmd.swapchain_current_index(chain).unwrap(), 1);
        assert_eq!(hmd.commit_count(chain), 1);
    }

    #[test]
    pub fn predicted_time_is_monotonic() {
        let hmd = MockHmd::default();

        let t0 = hmd.predicted_display_time(0);
        let t1 = hmd.predicted_display_time(1);

        assert!(t1 > t0);
    }

    #[test]
    pub fn end_frame_advances_clock() {
        let hmd = MockHmd::default();
        let before = hmd.time_now();

        hmd.end_frame(0, &[]).unwrap();

        assert!(hmd.time_now() > before);
    }

    #[test]
    pub fn static_image_ring_has_one_image() {
        let hmd = MockHmd::default();
        let chain = hmd
            .create_swapchain(&SwapchainDesc {
                static_image: true,
                ..desc()
            })
            .unwrap();

        assert_eq!(hmd.swapchain_len(chain).unwrap(), 1);
    }
}
