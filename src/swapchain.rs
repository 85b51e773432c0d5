//! Swapchain records: backend ring ownership plus acquire/wait/release
//! accounting.
//!
//! Two backend limitations shape this module. Texture arrays cannot be
//! committed per-slice, so slice 0 owns a full-array ring and further slices
//! lazily get rings of their own that are filled by copy at commit time. And
//! the compositor rejects the stencil-carrying 32-bit depth format, so such
//! swapchains render into private images and resolve on commit.

use {
    crate::{
        backend::{
            Backend, BindFlags, MiscFlags, SwapchainDesc, SwapchainHandle, TextureFormat,
        },
        config::RuntimeConfig,
        error::{RuntimeError, RuntimeResult},
        fixup::{plan_commit, CommitPlan, PlanInputs, UpscalePass},
        format::{self, DxgiFormat, GraphicsApi},
        upscale::scaled_size,
    },
    log::{debug, warn},
    openxr_sys as sys,
    std::collections::VecDeque,
};

fn usage_contains(flags: sys::SwapchainUsageFlags, bit: sys::SwapchainUsageFlags) -> bool {
    flags.into_raw() & bit.into_raw() != 0
}

fn create_contains(flags: sys::SwapchainCreateFlags, bit: sys::SwapchainCreateFlags) -> bool {
    flags.into_raw() & bit.into_raw() != 0
}

/// Creation parameters retained from `XrSwapchainCreateInfo`.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainInfo {
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_count: u32,
    pub sample_count: u32,
    pub format: i64,
    pub usage_flags: sys::SwapchainUsageFlags,
    pub static_image: bool,
}

/// One application swapchain and its backend rings.
pub struct Swapchain {
    pub info: SwapchainInfo,
    pub backend_desc: SwapchainDesc,

    /// Format the submission device uses for views over the ring.
    pub submission_format: DxgiFormat,

    /// The app format carries a stencil plane the compositor rejects.
    pub need_depth_resolve: bool,

    /// Backend texture size when render scaling is active; the application
    /// keeps rendering at `info` size and commit upscales.
    pub upscaled_size: Option<(u32, u32)>,

    /// Sharpening strength for the upscale pass.
    sharpen: f32,

    /// Backend ring per slice; index 0 is created eagerly with the full
    /// array size, the rest on first reference.
    chains: Vec<Option<SwapchainHandle>>,

    image_count: u32,

    /// Indices handed to the application, oldest first.
    acquired: VecDeque<u32>,

    /// Whether the oldest acquired index has been waited on.
    front_waited: bool,

    /// Static-image swapchains permit exactly one acquire.
    frozen: bool,

    /// Ring cursor for depth-resolve swapchains, which use private images.
    next_private_index: u32,

    last_released_index: Option<u32>,

    /// Last processed source index per slice.
    last_processed: Vec<Option<u32>>,
}

impl Swapchain {
    /// Validates the creation info and allocates the slice-0 backend ring.
    #[profiling::function]
    pub fn create(
        backend: &dyn Backend,
        api: GraphicsApi,
        create_info: &sys::SwapchainCreateInfo,
        config: &RuntimeConfig,
    ) -> RuntimeResult<Self> {
        // Cube swapchains are not composed.
        if create_info.face_count != 1 {
            return Err(RuntimeError::SwapchainFormatUnsupported);
        }

        if create_contains(
            create_info.create_flags,
            sys::SwapchainCreateFlags::PROTECTED_CONTENT,
        ) {
            return Err(RuntimeError::FeatureUnsupported);
        }

        if create_info.width == 0
            || create_info.height == 0
            || create_info.array_size == 0
            || create_info.mip_count == 0
        {
            return Err(RuntimeError::Validation);
        }

        let Some(mut backend_format) = format::app_format_to_backend(api, create_info.format)
        else {
            warn!("unsupported swapchain format {}", create_info.format);

            return Err(RuntimeError::SwapchainFormatUnsupported);
        };

        let mut need_depth_resolve = false;
        if backend_format == TextureFormat::D32FloatS8X24Uint {
            backend_format = TextureFormat::D32Float;
            need_depth_resolve = true;
        }

        let mut bind_flags = BindFlags::empty();
        if usage_contains(
            create_info.usage_flags,
            sys::SwapchainUsageFlags::COLOR_ATTACHMENT,
        ) {
            bind_flags |= BindFlags::RENDER_TARGET;
        }
        if usage_contains(
            create_info.usage_flags,
            sys::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        ) {
            bind_flags |= BindFlags::DEPTH_STENCIL;
        }
        if usage_contains(
            create_info.usage_flags,
            sys::SwapchainUsageFlags::UNORDERED_ACCESS,
        ) {
            bind_flags |= BindFlags::UNORDERED_ACCESS;
        }

        // Always typeless so either-typed application views can be created.
        let mut misc_flags = MiscFlags::TYPELESS;
        if create_info.mip_count > 1 {
            misc_flags |= MiscFlags::ALLOW_GENERATE_MIPS;
        }

        let static_image = create_contains(
            create_info.create_flags,
            sys::SwapchainCreateFlags::STATIC_IMAGE,
        );

        // Color swapchains grow to the scaled size when render scaling is
        // on; the application keeps its requested size and commit fills the
        // difference.
        let upscaled_size = config
            .upscale_percent
            .filter(|_| {
                !need_depth_resolve
                    && !format::backend_to_dxgi(backend_format).is_depth()
                    && create_info.sample_count == 1
                    && bind_flags.contains(BindFlags::RENDER_TARGET)
            })
            .map(|percent| scaled_size((create_info.width, create_info.height), percent))
            .filter(|scaled| *scaled != (create_info.width, create_info.height));

        let (backend_width, backend_height) =
            upscaled_size.unwrap_or((create_info.width, create_info.height));

        let backend_desc = SwapchainDesc {
            format: backend_format,
            width: backend_width,
            height: backend_height,
            array_size: create_info.array_size,
            mip_levels: create_info.mip_count,
            sample_count: create_info.sample_count,
            static_image,
            bind_flags,
            misc_flags,
        };

        let chain = backend.create_swapchain(&backend_desc)?;
        let image_count = backend.swapchain_len(chain)?;

        let mut chains = vec![None; create_info.array_size as usize];
        chains[0] = Some(chain);

        debug!(
            "swapchain {}x{}x{} fmt {} ({} images{})",
            create_info.width,
            create_info.height,
            create_info.array_size,
            create_info.format,
            image_count,
            if need_depth_resolve {
                ", depth resolve"
            } else {
                ""
            },
        );

        Ok(Self {
            info: SwapchainInfo {
                width: create_info.width,
                height: create_info.height,
                array_size: create_info.array_size,
                mip_count: create_info.mip_count,
                sample_count: create_info.sample_count,
                format: create_info.format,
                usage_flags: create_info.usage_flags,
                static_image,
            },
            backend_desc,
            submission_format: format::backend_to_dxgi(backend_format),
            need_depth_resolve,
            upscaled_size,
            sharpen: config.sharpen,
            chains,
            image_count,
            acquired: VecDeque::new(),
            front_waited: false,
            frozen: false,
            next_private_index: 0,
            last_released_index: None,
            last_processed: vec![None; create_info.array_size as usize],
        })
    }

    /// Number of images the application enumerates.
    pub fn image_count(&self) -> u32 {
        self.image_count
    }

    /// The slice-0 backend ring, which identifies this swapchain in the
    /// per-frame committed set.
    pub fn primary_chain(&self) -> SwapchainHandle {
        self.chains[0].expect("slice 0 is created eagerly")
    }

    /// The backend ring for a slice, if it exists yet.
    pub fn chain(&self, slice: u32) -> Option<SwapchainHandle> {
        self.chains.get(slice as usize).copied().flatten()
    }

    /// Whether the application renders into runtime-private images instead
    /// of the backend ring (depth resolve and render scaling both need the
    /// original pixels at commit time).
    pub fn uses_private_images(&self) -> bool {
        self.need_depth_resolve || self.upscaled_size.is_some()
    }

    /// `xrAcquireSwapchainImage`.
    pub fn acquire(&mut self, backend: &dyn Backend) -> RuntimeResult<u32> {
        if self.frozen {
            return Err(RuntimeError::CallOrderInvalid);
        }

        if self.acquired.len() as u32 >= self.image_count {
            return Err(RuntimeError::CallOrderInvalid);
        }

        let index = if self.uses_private_images() {
            // Private images are runtime-managed; advance our own cursor.
            let index = self.next_private_index;
            self.next_private_index = (index + 1) % self.image_count;

            index
        } else {
            backend.swapchain_current_index(self.primary_chain())?
        };

        self.acquired.push_back(index);

        if self.info.static_image {
            self.frozen = true;
        }

        Ok(index)
    }

    /// `xrWaitSwapchainImage`. Frame pacing guarantees availability, so this
    /// only validates ordering; a blocking implementation would return
    /// `XR_TIMEOUT_EXPIRED` when the timeout lapses.
    pub fn wait_image(&mut self) -> RuntimeResult<()> {
        if self.acquired.is_empty() || self.front_waited {
            return Err(RuntimeError::CallOrderInvalid);
        }

        self.front_waited = true;

        Ok(())
    }

    /// `xrReleaseSwapchainImage`, returning the released index. The commit
    /// itself is deferred to `xrEndFrame` so per-slice decisions see the
    /// final layer list.
    pub fn release(&mut self) -> RuntimeResult<u32> {
        if !self.front_waited {
            return Err(RuntimeError::CallOrderInvalid);
        }

        let index = self.acquired.pop_front().expect("front was waited");
        self.front_waited = false;
        self.last_released_index = Some(index);

        Ok(index)
    }

    /// Whether the application released anything yet; untouched swapchains
    /// are skipped at commit.
    pub fn has_released(&self) -> bool {
        self.last_released_index.is_some()
    }

    /// Validates a sub-image rectangle against the swapchain extent.
    pub fn is_rect_valid(&self, rect: &sys::Rect2Di) -> bool {
        rect.offset.x >= 0
            && rect.offset.y >= 0
            && rect.extent.width > 0
            && rect.extent.height > 0
            && rect.offset.x as i64 + rect.extent.width as i64 <= self.info.width as i64
            && rect.offset.y as i64 + rect.extent.height as i64 <= self.info.height as i64
    }

    /// Prepares this swapchain's slice for commit: lazily creates the slice
    /// ring, plans the fixup work and updates the accounting. The returned
    /// plan is executed by the submission device on the way to
    /// [`Backend::commit_swapchain`].
    pub fn prepare_commit(
        &mut self,
        backend: &dyn Backend,
        layer_index: u32,
        slice: u32,
        layer_flags: sys::CompositionLayerFlags,
    ) -> RuntimeResult<CommitPlan> {
        let Some(released) = self.last_released_index else {
            return Err(RuntimeError::CallOrderInvalid);
        };

        if slice >= self.info.array_size {
            return Err(RuntimeError::Validation);
        }

        // Slice rings hold one layer each; only slice 0 carries the array.
        if slice > 0 && self.chains[slice as usize].is_none() {
            let mut desc = self.backend_desc;
            desc.array_size = 1;

            // The sRGB finish renders a full-screen pass into the slice ring.
            if self.submission_format.is_srgb() {
                desc.bind_flags |= BindFlags::RENDER_TARGET;
            }

            let chain = backend.create_swapchain(&desc)?;
            let count = backend.swapchain_len(chain)?;

            if count != self.image_count {
                warn!("slice ring length {count} != {}", self.image_count);

                return Err(RuntimeError::RuntimeFailure);
            }

            self.chains[slice as usize] = Some(chain);
        }

        let mut plan = plan_commit(&PlanInputs {
            layer_index,
            slice,
            layer_flags,
            array_size: self.info.array_size,
            sample_count: self.info.sample_count,
            srgb_submission: self.submission_format.is_srgb(),
            need_depth_resolve: self.need_depth_resolve,
            last_released_index: released,
            last_processed_index: self.last_processed[slice as usize],
        });

        plan.upscale = self.upscaled_size.map(|output| UpscalePass {
            input: (self.info.width, self.info.height),
            output,
            sharpen: self.sharpen,
        });

        self.last_processed[slice as usize] = Some(released);

        Ok(plan)
    }

    /// Destroys all backend rings. The caller flushes the GPU queues first.
    pub fn destroy(&mut self, backend: &dyn Backend) {
        for chain in self.chains.drain(..).flatten() {
            backend.destroy_swapchain(chain);
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::backend::mock::MockHmd,
        openxr_sys::{Extent2Di, Offset2Di},
    };

    fn create_info(format: i64) -> sys::SwapchainCreateInfo {
        sys::SwapchainCreateInfo {
            ty: sys::StructureType::SWAPCHAIN_CREATE_INFO,
            next: std::ptr::null(),
            create_flags: sys::SwapchainCreateFlags::EMPTY,
            usage_flags: sys::SwapchainUsageFlags::COLOR_ATTACHMENT,
            format,
            sample_count: 1,
            width: 1024,
            height: 1024,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
        }
    }

    fn rgba_srgb() -> i64 {
        DxgiFormat::R8G8B8A8_UNORM_SRGB.0 as i64
    }

    #[test]
    pub fn rejects_cubes_and_unknown_formats() {
        let hmd = MockHmd::default();

        let mut info = create_info(rgba_srgb());
        info.face_count = 6;
        assert_eq!(
            Swapchain::create(&hmd, GraphicsApi::Headless, &info, &RuntimeConfig::default()).err(),
            Some(RuntimeError::SwapchainFormatUnsupported)
        );

        assert_eq!(
            Swapchain::create(&hmd, GraphicsApi::Headless, &create_info(77777), &RuntimeConfig::default()).err(),
            Some(RuntimeError::SwapchainFormatUnsupported)
        );
    }

    #[test]
    pub fn rejects_protected_content() {
        let hmd = MockHmd::default();
        let mut info = create_info(rgba_srgb());
        info.create_flags = sys::SwapchainCreateFlags::PROTECTED_CONTENT;

        assert_eq!(
            Swapchain::create(&hmd, GraphicsApi::Headless, &info, &RuntimeConfig::default()).err(),
            Some(RuntimeError::FeatureUnsupported)
        );
    }

    #[test]
    pub fn acquire_wait_release_cycle() {
        let hmd = MockHmd::default();
        let mut chain =
            Swapchain::create(&hmd, GraphicsApi::Headless, &create_info(rgba_srgb()), &RuntimeConfig::default()).unwrap();

        assert_eq!(chain.wait_image(), Err(RuntimeError::CallOrderInvalid));

        let index = chain.acquire(&hmd).unwrap();
        assert_eq!(index, 0);
        chain.wait_image().unwrap();
        assert_eq!(chain.wait_image(), Err(RuntimeError::CallOrderInvalid));
        chain.release().unwrap();

        assert!(chain.has_released());
        assert_eq!(chain.release(), Err(RuntimeError::CallOrderInvalid));
    }

    #[test]
    pub fn acquire_beyond_ring_depth_fails() {
        let hmd = MockHmd::default();
        let mut chain =
            Swapchain::create(&hmd, GraphicsApi::Headless, &create_info(rgba_srgb()), &RuntimeConfig::default()).unwrap();

        for _ in 0..chain.image_count() {
            chain.acquire(&hmd).unwrap();
        }

        assert_eq!(chain.acquire(&hmd), Err(RuntimeError::CallOrderInvalid));
    }

    #[test]
    pub fn static_image_permits_one_acquire() {
        let hmd = MockHmd::default();
        let mut info = create_info(rgba_srgb());
        info.create_flags = sys::SwapchainCreateFlags::STATIC_IMAGE;
        let mut chain = Swapchain::create(&hmd, GraphicsApi::Headless, &info, &RuntimeConfig::default()).unwrap();

        chain.acquire(&hmd).unwrap();

        assert_eq!(chain.acquire(&hmd), Err(RuntimeError::CallOrderInvalid));
    }

    #[test]
    pub fn depth_stencil_format_substitutes_and_cycles_privately() {
        let hmd = MockHmd::default();
        let mut info = create_info(DxgiFormat::D32_FLOAT_S8X24_UINT.0 as i64);
        info.usage_flags = sys::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        let mut chain = Swapchain::create(&hmd, GraphicsApi::Headless, &info, &RuntimeConfig::default()).unwrap();

        assert!(chain.need_depth_resolve);
        assert_eq!(chain.backend_desc.format, TextureFormat::D32Float);

        // Private indices advance on every acquire, unlike the backend ring.
        for expected in [0, 1, 2] {
            assert_eq!(chain.acquire(&hmd).unwrap(), expected);
            chain.wait_image().unwrap();
            chain.release().unwrap();
        }
    }

    #[test]
    pub fn rect_validation() {
        let hmd = MockHmd::default();
        let chain =
            Swapchain::create(&hmd, GraphicsApi::Headless, &create_info(rgba_srgb()), &RuntimeConfig::default()).unwrap();

        let rect = |x, y, width, height| sys::Rect2Di {
            offset: Offset2Di { x, y },
            extent: Extent2Di { width, height },
        };

        assert!(chain.is_rect_valid(&rect(0, 0, 1024, 1024)));
        assert!(chain.is_rect_valid(&rect(512, 0, 512, 1024)));
        assert!(!chain.is_rect_valid(&rect(0, 0, 0, 1024)));
        assert!(!chain.is_rect_valid(&rect(-1, 0, 512, 512)));
        assert!(!chain.is_rect_valid(&rect(513, 0, 512, 1024)));
    }

    #[test]
    pub fn slice_ring_is_created_on_first_commit() {
        let hmd = MockHmd::default();
        let mut info = create_info(rgba_srgb());
        info.array_size = 2;
        let mut chain = Swapchain::create(&hmd, GraphicsApi::Headless, &info, &RuntimeConfig::default()).unwrap();

        chain.acquire(&hmd).unwrap();
        chain.wait_image().unwrap();
        chain.release().unwrap();

        assert!(chain.chain(1).is_none());

        chain
            .prepare_commit(&hmd, 0, 1, sys::CompositionLayerFlags::EMPTY)
            .unwrap();

        let slice_chain = chain.chain(1).unwrap();
        let desc = hmd.swapchain_desc(slice_chain).unwrap();

        assert_eq!(desc.array_size, 1);
        // The sRGB finish pass needs a render-target binding on the ring.
        assert!(desc.bind_flags.contains(BindFlags::RENDER_TARGET));
    }

    #[test]
    pub fn render_scaling_grows_the_backend_ring() {
        let hmd = MockHmd::default();
        let config = RuntimeConfig {
            upscale_percent: Some(150),
            sharpen: 0.5,
            ..RuntimeConfig::default()
        };
        let mut chain =
            Swapchain::create(&hmd, GraphicsApi::Headless, &create_info(rgba_srgb()), &config)
                .unwrap();

        assert_eq!(chain.upscaled_size, Some((1536, 1536)));
        assert_eq!(chain.backend_desc.width, 1536);
        // Application-facing accounting keeps the requested size.
        assert_eq!(chain.info.width, 1024);

        chain.acquire(&hmd).unwrap();
        chain.wait_image().unwrap();
        chain.release().unwrap();

        let plan = chain
            .prepare_commit(&hmd, 0, 0, sys::CompositionLayerFlags::EMPTY)
            .unwrap();

        assert_eq!(
            plan.upscale,
            Some(UpscalePass {
                input: (1024, 1024),
                output: (1536, 1536),
                sharpen: 0.5,
            })
        );

        // Depth swapchains are never scaled.
        let mut info = create_info(DxgiFormat::D32_FLOAT.0 as i64);
        info.usage_flags = sys::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        let chain = Swapchain::create(&hmd, GraphicsApi::Headless, &info, &config).unwrap();

        assert_eq!(chain.upscaled_size, None);
    }

    #[test]
    pub fn commit_before_release_is_out_of_order() {
        let hmd = MockHmd::default();
        let mut chain =
            Swapchain::create(&hmd, GraphicsApi::Headless, &create_info(rgba_srgb()), &RuntimeConfig::default()).unwrap();

        assert_eq!(
            chain
                .prepare_commit(&hmd, 0, 0, sys::CompositionLayerFlags::EMPTY)
                .err(),
            Some(RuntimeError::CallOrderInvalid)
        );
    }

    #[test]
    pub fn destroy_releases_all_rings() {
        let hmd = MockHmd::default();
        let mut info = create_info(rgba_srgb());
        info.array_size = 2;
        let mut chain = Swapchain::create(&hmd, GraphicsApi::Headless, &info, &RuntimeConfig::default()).unwrap();

        chain.acquire(&hmd).unwrap();
        chain.wait_image().unwrap();
        chain.release().unwrap();
        chain
            .prepare_commit(&hmd, 0, 1, sys::CompositionLayerFlags::EMPTY)
            .unwrap();
        assert_eq!(hmd.swapchain_count(), 2);

        chain.destroy(&hmd);

        assert_eq!(hmd.swapchain_count(), 0);
    }
}
