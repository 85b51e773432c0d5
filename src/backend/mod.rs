//! Compositor backend interface.
//!
//! The runtime never talks to the headset directly; everything below the
//! OpenXR surface goes through [`Backend`]. A production build links a binding
//! to the vendor compositor SDK; [`mock`] provides a deterministic headless
//! implementation used by the test suites.
//!
//! Backend time is fractional seconds as a `f64`, matching the SDK it fronts.
//! Conversion to `XrTime` lives in [`crate::time`].

pub mod mock;

use {
    crate::space::Pose,
    std::{
        error::Error,
        fmt::{Display, Formatter},
    },
};

/// Left/right eye selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    /// Both eyes, in view-index order.
    pub const BOTH: [Self; 2] = [Self::Left, Self::Right];

    /// The view index this eye occupies in a stereo configuration.
    pub fn index(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }
}

/// Error code surfaced by a backend call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackendError {
    /// Raw SDK error code.
    pub code: i32,
}

impl BackendError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend error {}", self.code)
    }
}

impl Error for BackendError {}

/// Result alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Opaque handle to a backend-owned texture swapchain.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SwapchainHandle(pub u64);

/// Opaque handle to one backend-owned texture.
///
/// On Windows this wraps the NT shared handle the submission device exports
/// for the texture; the interop bridges re-open it in the application API.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TextureHandle(pub u64);

/// Headset connection and visibility snapshot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HmdStatus {
    pub service_ready: bool,
    pub hmd_present: bool,
    pub hmd_mounted: bool,
    pub is_visible: bool,
    pub display_lost: bool,
    pub should_quit: bool,
}

impl HmdStatus {
    /// The headset is reachable and usable for a session.
    pub fn connected(&self) -> bool {
        self.service_ready && self.hmd_present && !self.display_lost && !self.should_quit
    }
}

/// Per-eye field of view in tangent form. All four values are positive
/// tangents of the half angles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FovTangents {
    pub up: f32,
    pub down: f32,
    pub left: f32,
    pub right: f32,
}

/// Per-eye render parameters cached from the headset.
#[derive(Clone, Copy, Debug)]
pub struct EyeRenderInfo {
    pub fov: FovTangents,
    pub hmd_to_eye: Pose,
    pub recommended_width: u32,
    pub recommended_height: u32,
}

/// Static headset description, cached once per instance.
#[derive(Clone, Debug)]
pub struct HmdInfo {
    pub vendor_id: u32,
    pub product_name: String,
    pub serial_number: String,
    pub refresh_rate: f32,

    /// LUID of the GPU the headset is attached to, as a packed 64-bit value.
    pub adapter_luid: u64,

    pub eyes: [EyeRenderInfo; 2],
}

/// Pose sample returned by the tracker.
#[derive(Clone, Copy, Debug)]
pub struct PoseState {
    pub pose: Pose,
    pub orientation_tracked: bool,
    pub position_tracked: bool,
}

/// Hidden-area mesh for one eye, in FOV-tangent space.
#[derive(Clone, Debug, Default)]
pub struct HiddenAreaMesh {
    pub vertices: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

/// Texture formats the backend compositor accepts.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TextureFormat {
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    B8G8R8X8Unorm,
    B8G8R8X8UnormSrgb,
    R16G16B16A16Float,
    R11G11B10Float,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8X24Uint,
    Bc1Unorm,
    Bc1UnormSrgb,
    Bc2Unorm,
    Bc2UnormSrgb,
    Bc3Unorm,
    Bc3UnormSrgb,
    Bc6hUf16,
    Bc6hSf16,
    Bc7Unorm,
    Bc7UnormSrgb,
}

bitflags::bitflags! {
    /// Bind flags requested for backend swapchain textures.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct BindFlags: u32 {
        const RENDER_TARGET = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const UNORDERED_ACCESS = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Misc creation flags for backend swapchain textures.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct MiscFlags: u32 {
        /// Create the underlying textures typeless so either-typed views
        /// can be made (OpenXR requires returning typeless textures).
        const TYPELESS = 1 << 0;
        const ALLOW_GENERATE_MIPS = 1 << 1;
    }
}

/// Backend swapchain creation descriptor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwapchainDesc {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub static_image: bool,
    pub bind_flags: BindFlags,
    pub misc_flags: MiscFlags,
}

/// Viewport into a backend texture, in texels.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// The three non-trivial terms of the clip-space projection matrix, used by
/// the compositor for depth-aware reprojection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthProjection {
    pub p22: f32,
    pub p23: f32,
    pub p32: f32,
}

impl DepthProjection {
    /// Derives the projection terms from clip planes.
    pub fn from_clip_planes(near: f32, far: f32) -> Self {
        Self {
            p22: far / (near - far),
            p23: (far * near) / (near - far),
            p32: -1.0,
        }
    }
}

/// Stereo projection layer, optionally with depth.
#[derive(Clone, Debug)]
pub struct ProjectionLayer {
    pub color: [SwapchainHandle; 2],
    pub viewport: [Viewport; 2],
    pub fov: [FovTangents; 2],

    /// Render pose per eye, relative to the compositor origin.
    pub pose: [Pose; 2],

    pub sensor_sample_time: f64,
    pub depth: Option<ProjectionDepth>,
}

/// Depth attachment for a projection layer.
#[derive(Clone, Debug)]
pub struct ProjectionDepth {
    pub texture: [SwapchainHandle; 2],
    pub projection: DepthProjection,
}

/// World- or head-locked quad layer.
#[derive(Clone, Debug)]
pub struct QuadLayer {
    pub color: SwapchainHandle,
    pub viewport: Viewport,
    pub pose: Pose,

    /// Quad extent in meters.
    pub size: [f32; 2],
}

/// Curved quad layer.
#[derive(Clone, Debug)]
pub struct CylinderLayer {
    pub color: SwapchainHandle,
    pub viewport: Viewport,
    pub pose: Pose,
    pub radius: f32,
    pub central_angle: f32,
    pub aspect_ratio: f32,
}

/// Skybox layer sourced from a cubemap swapchain.
#[derive(Clone, Debug)]
pub struct CubeLayer {
    pub color: SwapchainHandle,
    pub orientation: glam::Quat,
}

/// One composition layer, back-to-front ordered within a frame.
#[derive(Clone, Debug)]
pub enum Layer {
    Projection(ProjectionLayer),
    Quad(QuadLayer),
    Cylinder(CylinderLayer),
    Cube(CubeLayer),
}

/// The compositor backend surface the runtime consumes.
///
/// Implementations must be internally synchronized; the runtime serializes
/// `begin_frame`/`end_frame` pairs behind its frame lock but may call the
/// query methods from any application thread.
///
/// One contract quirk carried over from the vendor SDK: the very first frame
/// must be submitted with `end_frame` *before* any `begin_frame` call is
/// made. The runtime encodes this with its `can_begin_frame` latch; backends
/// that do not care simply accept either order.
pub trait Backend: Send + Sync {
    /// SDK version string, logged once at startup.
    fn version(&self) -> String;

    /// Static headset description. Fails while the compositor service or the
    /// headset is unavailable.
    fn hmd_info(&self) -> BackendResult<HmdInfo>;

    /// Current connection and visibility snapshot.
    fn hmd_status(&self) -> BackendResult<HmdStatus>;

    /// Configured eye height above the floor, in meters.
    fn eye_height(&self) -> f32;

    /// Maximum number of layers one frame may submit.
    fn max_layer_count(&self) -> u32;

    /// Hidden-area mesh for the given eye, when the headset provides one.
    fn hidden_area_mesh(&self, eye: Eye) -> Option<HiddenAreaMesh>;

    /// Current backend time in fractional seconds.
    fn time_now(&self) -> f64;

    /// Predicted mid-photon display time for the given frame index.
    fn predicted_display_time(&self, frame_index: u64) -> f64;

    /// Headset pose sampled (or predicted) at the given backend time.
    fn hmd_pose_state(&self, time: f64) -> PoseState;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> BackendResult<SwapchainHandle>;

    /// Number of images in the swapchain ring.
    fn swapchain_len(&self, swapchain: SwapchainHandle) -> BackendResult<u32>;

    /// Index of the image the next commit will publish.
    fn swapchain_current_index(&self, swapchain: SwapchainHandle) -> BackendResult<u32>;

    /// Shared handle for one image of the ring.
    fn swapchain_texture(
        &self,
        swapchain: SwapchainHandle,
        index: u32,
    ) -> BackendResult<TextureHandle>;

    /// Publishes the current image and advances the ring.
    fn commit_swapchain(&self, swapchain: SwapchainHandle) -> BackendResult<()>;

    fn destroy_swapchain(&self, swapchain: SwapchainHandle);

    fn begin_frame(&self, frame_index: u64) -> BackendResult<()>;

    fn end_frame(&self, frame_index: u64, layers: &[Layer]) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn depth_projection_terms() {
        let p = DepthProjection::from_clip_planes(0.1, 100.0);

        assert!((p.p22 - 100.0 / (0.1 - 100.0)).abs() < f32::EPSILON);
        assert!((p.p23 - (100.0 * 0.1) / (0.1 - 100.0)).abs() < f32::EPSILON);
        assert_eq!(p.p32, -1.0);
    }

    #[test]
    pub fn status_connected() {
        let mut status = HmdStatus {
            service_ready: true,
            hmd_present: true,
            ..Default::default()
        };

        assert!(status.connected());

        status.display_lost = true;

        assert!(!status.connected());
    }
}
