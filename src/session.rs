//! The session: the lifetime during which rendering happens.
//!
//! A session owns the graphics bridge (and with it the submission device),
//! the frame pacer, the state machine and the swapchain/space tables. Locks
//! nest in a fixed order: swapchains, then spaces, then bridge, then the
//! frame lock inside the pacer.

use {
    crate::{
        backend::{Backend, Eye, HmdInfo},
        compose::ComposeContext,
        config::RuntimeConfig,
        error::{RuntimeError, RuntimeResult},
        format::GraphicsApi,
        frame::{FramePacer, WaitedFrame},
        handles::HandleTable,
        instance::{EnabledExtensions, Instance},
        interop::{Bridge, HeadlessBridge},
        space::{self, Location, Pose, Space, SpaceKind},
        state::StateMachine,
        swapchain::Swapchain,
        time::TimeConverter,
    },
    log::{info, warn},
    openxr_sys as sys,
    parking_lot::Mutex,
    std::sync::Arc,
};

/// Reference space types the runtime exposes, in enumeration order.
pub const REFERENCE_SPACES: [sys::ReferenceSpaceType; 3] = [
    sys::ReferenceSpaceType::VIEW,
    sys::ReferenceSpaceType::LOCAL,
    sys::ReferenceSpaceType::STAGE,
];

/// Outcome of `xrWaitFrame`.
#[derive(Clone, Copy, Debug)]
pub enum WaitFrameOutcome {
    /// The headset disconnected; the state machine moved to LOSS_PENDING.
    LossPending,

    Frame(WaitedFrame),
}

/// One running session.
pub struct Session {
    pub backend: Arc<dyn Backend>,
    pub api: GraphicsApi,
    pub enabled: EnabledExtensions,
    pub time: TimeConverter,
    pub config: RuntimeConfig,
    pub hmd_info: HmdInfo,
    pub frame_duration: f64,
    pub floor_height: f32,

    pub(crate) bridge: Mutex<Bridge>,
    pub(crate) machine: Mutex<StateMachine>,
    pub(crate) pacer: FramePacer,
    pub(crate) swapchains: Mutex<HandleTable<Swapchain>>,
    pub(crate) spaces: Mutex<HandleTable<Space>>,

    /// The compositor origin every layer pose is re-based into.
    origin: Space,

    pub origin_space: sys::Space,
    pub view_space: sys::Space,
}

impl Session {
    /// Builds a session around an initialized bridge.
    #[profiling::function]
    pub fn new(
        backend: Arc<dyn Backend>,
        bridge: Bridge,
        enabled: EnabledExtensions,
        time: TimeConverter,
        config: RuntimeConfig,
    ) -> RuntimeResult<Arc<Self>> {
        let hmd_info = backend.hmd_info()?;
        let frame_duration = 1.0 / hmd_info.refresh_rate as f64;
        let floor_height = backend.eye_height();
        let api = bridge.api();

        let origin = Space::reference(sys::ReferenceSpaceType::LOCAL, Pose::IDENTITY);
        let mut spaces = HandleTable::new();
        let origin_space = sys::Space::from_raw(spaces.insert(origin));
        let view_space = sys::Space::from_raw(spaces.insert(Space::reference(
            sys::ReferenceSpaceType::VIEW,
            Pose::IDENTITY,
        )));

        let mut machine = StateMachine::new();
        machine.on_create(backend.time_now());

        info!(
            "session on {api:?}, {}x{}@{}Hz",
            hmd_info.eyes[0].recommended_width,
            hmd_info.eyes[0].recommended_height,
            hmd_info.refresh_rate,
        );

        Ok(Arc::new(Self {
            backend,
            api,
            enabled,
            time,
            config,
            hmd_info,
            frame_duration,
            floor_height,
            bridge: Mutex::new(bridge),
            machine: Mutex::new(machine),
            pacer: FramePacer::new(),
            swapchains: Mutex::new(HandleTable::new()),
            spaces: Mutex::new(spaces),
            origin,
            origin_space,
            view_space,
        }))
    }

    /// Builds a session with no application graphics device. Everything but
    /// the GPU passes runs, which is what the protocol test suites drive.
    pub fn create_headless(backend: Arc<dyn Backend>) -> RuntimeResult<Arc<Self>> {
        let time = TimeConverter::calibrate(backend.as_ref());
        let enabled = EnabledExtensions {
            depth: true,
            cylinder: true,
            cube: true,
            visibility_mask: true,
            refresh_rate: true,
            ..EnabledExtensions::default()
        };

        Self::new(
            backend,
            Bridge::Headless(HeadlessBridge::default()),
            enabled,
            time,
            RuntimeConfig::default(),
        )
    }

    //
    // Lifecycle.
    //

    pub fn begin(&self, view_configuration: sys::ViewConfigurationType) -> RuntimeResult<()> {
        if view_configuration != sys::ViewConfigurationType::PRIMARY_STEREO {
            return Err(RuntimeError::ViewConfigurationUnsupported);
        }

        self.machine.lock().on_begin(self.backend.time_now())
    }

    pub fn end(&self) -> RuntimeResult<()> {
        self.machine.lock().on_end(self.backend.time_now())
    }

    pub fn request_exit(&self) -> RuntimeResult<()> {
        self.machine.lock().on_request_exit(self.backend.time_now())
    }

    /// Tears the session down: drains both GPU queues, then destroys every
    /// swapchain before the backend handle goes away.
    #[profiling::function]
    pub fn destroy(&self) {
        let mut swapchains = self.swapchains.lock();
        let mut bridge = self.bridge.lock();

        if let Err(err) = bridge.flush_submission() {
            warn!("submission flush on teardown: {err}");
        }
        if let Err(err) = bridge.flush_app_queue() {
            warn!("app queue flush on teardown: {err}");
        }

        for (_, mut swapchain) in swapchains.drain() {
            bridge.forget_swapchain(&swapchain);
            swapchain.destroy(self.backend.as_ref());
        }

        self.spaces.lock().drain().for_each(drop);
        self.pacer.reset();
    }

    //
    // Frame protocol.
    //

    /// `xrWaitFrame`.
    pub fn wait_frame(&self) -> RuntimeResult<WaitFrameOutcome> {
        let status = self.backend.hmd_status()?;
        let now = self.backend.time_now();

        if !status.connected() {
            self.machine.lock().lose(now);

            return Ok(WaitFrameOutcome::LossPending);
        }

        let should_render = self.machine.lock().update_from_status(&status, now);
        let waited = self
            .pacer
            .wait(self.backend.as_ref(), self.frame_duration, should_render);

        Ok(WaitFrameOutcome::Frame(waited))
    }

    /// `xrBeginFrame`; `true` means the previous frame was discarded.
    pub fn begin_frame(&self) -> RuntimeResult<bool> {
        self.pacer.begin(self.backend.as_ref())
    }

    /// The graphics bridge, exposed for embedders (fence inspection) and
    /// the test suites.
    pub fn bridge(&self) -> parking_lot::MutexGuard<'_, Bridge> {
        self.bridge.lock()
    }

    /// `xrEndFrame`.
    ///
    /// # Safety
    ///
    /// `layers` must satisfy the contract of
    /// [`ComposeContext::build_layers`].
    #[profiling::function]
    pub unsafe fn end_frame(
        &self,
        display_time: sys::Time,
        environment_blend_mode: sys::EnvironmentBlendMode,
        layers: *const *const sys::CompositionLayerBaseHeader,
        layer_count: u32,
    ) -> RuntimeResult<()> {
        if environment_blend_mode != sys::EnvironmentBlendMode::OPAQUE {
            return Err(RuntimeError::EnvironmentBlendModeUnsupported);
        }

        if layer_count > self.backend.max_layer_count() {
            return Err(RuntimeError::LayerLimitExceeded);
        }

        let mut swapchains = self.swapchains.lock();
        let spaces = self.spaces.lock();
        let mut bridge = self.bridge.lock();

        self.pacer.end(|frame_index| {
            bridge.serialize_app_frame()?;

            let built = {
                let mut executor = |swapchain: &mut Swapchain,
                                    slice: u32,
                                    plan: &crate::fixup::CommitPlan| {
                    bridge.execute_plan(self.backend.as_ref(), swapchain, slice, plan)
                };
                let mut ctx = ComposeContext {
                    backend: self.backend.as_ref(),
                    swapchains: &mut swapchains,
                    spaces: &spaces,
                    origin: self.origin,
                    floor_height: self.floor_height,
                    display_time_backend: self.time.xr_to_backend(display_time),
                    depth_extension: self.enabled.depth,
                    cylinder_extension: self.enabled.cylinder,
                    cube_extension: self.enabled.cube,
                    executor: &mut executor,
                };

                unsafe { ctx.build_layers(layers, layer_count) }?
            };

            let submitted = if built.is_empty() {
                false
            } else {
                self.backend.end_frame(frame_index, &built)?;

                true
            };

            bridge.present_debug_swapchain();

            Ok(submitted)
        })
    }

    //
    // Swapchains.
    //

    pub fn create_swapchain(
        &self,
        create_info: &sys::SwapchainCreateInfo,
    ) -> RuntimeResult<sys::Swapchain> {
        let swapchain = Swapchain::create(self.backend.as_ref(), self.api, create_info, &self.config)?;

        Ok(sys::Swapchain::from_raw(
            self.swapchains.lock().insert(swapchain),
        ))
    }

    /// Destroys one swapchain after draining both queues, so no in-flight
    /// work references the dying images.
    pub fn destroy_swapchain(&self, handle: sys::Swapchain) -> RuntimeResult<()> {
        let mut swapchains = self.swapchains.lock();
        let mut swapchain = swapchains
            .remove(handle.into_raw())
            .ok_or(RuntimeError::HandleInvalid)?;

        let mut bridge = self.bridge.lock();
        bridge.flush_submission()?;
        bridge.flush_app_queue()?;
        bridge.forget_swapchain(&swapchain);

        swapchain.destroy(self.backend.as_ref());

        Ok(())
    }

    pub fn swapchain_image_count(&self, handle: sys::Swapchain) -> RuntimeResult<u32> {
        self.swapchains
            .lock()
            .get(handle.into_raw())
            .map(Swapchain::image_count)
            .ok_or(RuntimeError::HandleInvalid)
    }

    /// Fills the API-specific image structs for a two-call enumeration.
    ///
    /// # Safety
    ///
    /// `images` must point at `count` structures of the bound API's
    /// swapchain-image type.
    pub unsafe fn write_swapchain_images(
        &self,
        handle: sys::Swapchain,
        images: *mut sys::SwapchainImageBaseHeader,
        count: u32,
    ) -> RuntimeResult<()> {
        let mut swapchains = self.swapchains.lock();
        let swapchain = swapchains
            .get_mut(handle.into_raw())
            .ok_or(RuntimeError::HandleInvalid)?;

        unsafe {
            self.bridge
                .lock()
                .write_swapchain_images(self.backend.as_ref(), swapchain, images, count)
        }
    }

    pub fn acquire_swapchain_image(&self, handle: sys::Swapchain) -> RuntimeResult<u32> {
        let mut swapchains = self.swapchains.lock();
        let swapchain = swapchains
            .get_mut(handle.into_raw())
            .ok_or(RuntimeError::HandleInvalid)?;

        let index = swapchain.acquire(self.backend.as_ref())?;
        self.bridge.lock().notify_acquired(swapchain, index)?;

        Ok(index)
    }

    pub fn wait_swapchain_image(&self, handle: sys::Swapchain) -> RuntimeResult<()> {
        self.swapchains
            .lock()
            .get_mut(handle.into_raw())
            .ok_or(RuntimeError::HandleInvalid)?
            .wait_image()
    }

    pub fn release_swapchain_image(&self, handle: sys::Swapchain) -> RuntimeResult<()> {
        let mut swapchains = self.swapchains.lock();
        let swapchain = swapchains
            .get_mut(handle.into_raw())
            .ok_or(RuntimeError::HandleInvalid)?;

        let index = swapchain.release()?;
        self.bridge.lock().notify_released(swapchain, index)?;

        Ok(())
    }

    //
    // Spaces.
    //

    pub fn create_reference_space(
        &self,
        create_info: &sys::ReferenceSpaceCreateInfo,
    ) -> RuntimeResult<sys::Space> {
        if !REFERENCE_SPACES.contains(&create_info.reference_space_type) {
            return Err(RuntimeError::ReferenceSpaceUnsupported);
        }

        let pose = Pose::validate_xr(&create_info.pose_in_reference_space)?;
        let space = Space::reference(create_info.reference_space_type, pose);

        Ok(sys::Space::from_raw(self.spaces.lock().insert(space)))
    }

    pub fn create_action_space(
        &self,
        action: u64,
        subaction_path: sys::Path,
        pose: &sys::Posef,
    ) -> RuntimeResult<sys::Space> {
        let space = Space {
            kind: SpaceKind::Action {
                action,
                subaction_path,
            },
            pose_in_space: Pose::validate_xr(pose)?,
        };

        Ok(sys::Space::from_raw(self.spaces.lock().insert(space)))
    }

    pub fn destroy_space(&self, handle: sys::Space) -> RuntimeResult<()> {
        self.spaces
            .lock()
            .remove(handle.into_raw())
            .map(|_| ())
            .ok_or(RuntimeError::HandleInvalid)
    }

    pub fn locate_space(
        &self,
        space: sys::Space,
        base: sys::Space,
        time: sys::Time,
    ) -> RuntimeResult<Location> {
        let spaces = self.spaces.lock();
        let space = spaces
            .get(space.into_raw())
            .ok_or(RuntimeError::HandleInvalid)?;
        let base = spaces
            .get(base.into_raw())
            .ok_or(RuntimeError::HandleInvalid)?;

        Ok(space::locate(
            space,
            base,
            self.time.xr_to_backend(time),
            self.backend.as_ref(),
            self.floor_height,
        ))
    }

    /// `xrLocateViews` for the primary stereo configuration.
    pub fn locate_views(
        &self,
        base: sys::Space,
        time: sys::Time,
    ) -> RuntimeResult<(sys::ViewStateFlags, [sys::View; 2])> {
        let view_location = self.locate_space(self.view_space, base, time)?;

        let mut state_flags = sys::ViewStateFlags::EMPTY;
        if view_location
            .flags
            .contains(sys::SpaceLocationFlags::ORIENTATION_VALID)
        {
            state_flags |= sys::ViewStateFlags::ORIENTATION_VALID;
        }
        if view_location
            .flags
            .contains(sys::SpaceLocationFlags::ORIENTATION_TRACKED)
        {
            state_flags |= sys::ViewStateFlags::ORIENTATION_TRACKED;
        }
        if view_location
            .flags
            .contains(sys::SpaceLocationFlags::POSITION_VALID)
        {
            state_flags |= sys::ViewStateFlags::POSITION_VALID;
        }
        if view_location
            .flags
            .contains(sys::SpaceLocationFlags::POSITION_TRACKED)
        {
            state_flags |= sys::ViewStateFlags::POSITION_TRACKED;
        }

        let mut views = [sys::View {
            ty: sys::StructureType::VIEW,
            next: std::ptr::null_mut(),
            pose: Pose::IDENTITY.to_xr(),
            fov: sys::Fovf {
                angle_left: 0.0,
                angle_right: 0.0,
                angle_up: 0.0,
                angle_down: 0.0,
            },
        }; 2];

        // All or nothing: partial validity reports as empty.
        if state_flags == sys::ViewStateFlags::EMPTY {
            return Ok((state_flags, views));
        }

        for (view, eye) in views.iter_mut().zip(Eye::BOTH) {
            let eye_info = &self.hmd_info.eyes[eye.index()];

            view.pose = eye_info.hmd_to_eye.then(view_location.pose).to_xr();
            view.fov = sys::Fovf {
                angle_left: -eye_info.fov.left.atan(),
                angle_right: eye_info.fov.right.atan(),
                angle_up: eye_info.fov.up.atan(),
                angle_down: -eye_info.fov.down.atan(),
            };
        }

        Ok((state_flags, views))
    }

    //
    // Extensions surfaced at session scope.
    //

    /// `xrGetVisibilityMaskKHR` source data; empty when the headset has no
    /// hidden-area mesh or the type is not the hidden triangle mesh.
    pub fn visibility_mask(
        &self,
        view_configuration: sys::ViewConfigurationType,
        view_index: u32,
        mask_type: sys::VisibilityMaskTypeKHR,
    ) -> RuntimeResult<crate::backend::HiddenAreaMesh> {
        if view_configuration != sys::ViewConfigurationType::PRIMARY_STEREO {
            return Err(RuntimeError::ViewConfigurationUnsupported);
        }

        let eye = match view_index {
            0 => Eye::Left,
            1 => Eye::Right,
            _ => return Err(RuntimeError::Validation),
        };

        if mask_type != sys::VisibilityMaskTypeKHR::HIDDEN_TRIANGLE_MESH {
            return Ok(Default::default());
        }

        Ok(self.backend.hidden_area_mesh(eye).unwrap_or_default())
    }

    /// `xrGetDisplayRefreshRateFB`.
    pub fn display_refresh_rate(&self) -> f32 {
        self.hmd_info.refresh_rate
    }

    /// `xrRequestDisplayRefreshRateFB`: only the cached rate is accepted.
    pub fn request_display_refresh_rate(&self, rate: f32) -> RuntimeResult<()> {
        if (rate - self.hmd_info.refresh_rate).abs() <= f32::EPSILON {
            Ok(())
        } else {
            Err(RuntimeError::DisplayRefreshRateUnsupported)
        }
    }
}

impl Instance {
    /// `xrCreateSession`: resolves the graphics binding from the `next`
    /// chain and brings up the matching bridge.
    ///
    /// # Safety
    ///
    /// `create_info.next` must be a valid OpenXR structure chain.
    pub unsafe fn create_session(
        &self,
        create_info: &sys::SessionCreateInfo,
    ) -> RuntimeResult<sys::Session> {
        if create_info.ty != sys::StructureType::SESSION_CREATE_INFO {
            return Err(RuntimeError::Validation);
        }

        self.check_system(create_info.system_id)?;

        if !self.graphics_requirement_queried() {
            return Err(RuntimeError::GraphicsRequirementsCallMissing);
        }

        let mut slot = self.session.write();
        if slot.is_some() {
            return Err(RuntimeError::LimitReached);
        }

        let bridge = unsafe { self.resolve_graphics_binding(create_info.next) }?;
        let session = Session::new(
            Arc::clone(&self.backend),
            bridge,
            self.enabled,
            self.time,
            RuntimeConfig::load(),
        )?;

        *slot = Some(session);

        Ok(sys::Session::from_raw(1))
    }

    pub fn destroy_session(&self, handle: sys::Session) -> RuntimeResult<()> {
        if handle.into_raw() != 1 {
            return Err(RuntimeError::HandleInvalid);
        }

        let session = self
            .session
            .write()
            .take()
            .ok_or(RuntimeError::HandleInvalid)?;

        session.destroy();

        Ok(())
    }

    #[cfg(windows)]
    unsafe fn resolve_graphics_binding(
        &self,
        mut next: *const std::ffi::c_void,
    ) -> RuntimeResult<Bridge> {
        use crate::interop::{d3d11, d3d12, opengl, vulkan};

        let hmd_info = self.hmd_info()?;

        while !next.is_null() {
            let header = unsafe { &*(next as *const sys::BaseInStructure) };

            match header.ty {
                sys::StructureType::GRAPHICS_BINDING_D3D11_KHR if self.enabled.d3d11 => {
                    let binding =
                        unsafe { &*(next as *const sys::GraphicsBindingD3D11KHR) };

                    return Ok(Bridge::D3d11(d3d11::D3d11Bridge::new(binding, &hmd_info)?));
                }
                sys::StructureType::GRAPHICS_BINDING_D3D12_KHR if self.enabled.d3d12 => {
                    let binding =
                        unsafe { &*(next as *const sys::GraphicsBindingD3D12KHR) };

                    return Ok(Bridge::D3d12(d3d12::D3d12Bridge::new(binding, &hmd_info)?));
                }
                sys::StructureType::GRAPHICS_BINDING_VULKAN_KHR if self.enabled.vulkan => {
                    let binding =
                        unsafe { &*(next as *const sys::GraphicsBindingVulkanKHR) };

                    return Ok(Bridge::Vulkan(vulkan::VulkanBridge::new(
                        binding, &hmd_info,
                    )?));
                }
                sys::StructureType::GRAPHICS_BINDING_OPENGL_WIN32_KHR if self.enabled.opengl => {
                    let binding =
                        unsafe { &*(next as *const sys::GraphicsBindingOpenGLWin32KHR) };

                    return Ok(Bridge::OpenGl(opengl::OpenGlBridge::new(
                        binding, &hmd_info,
                    )?));
                }
                _ => next = header.next as *const std::ffi::c_void,
            }
        }

        Err(RuntimeError::GraphicsDeviceInvalid)
    }

    #[cfg(not(windows))]
    unsafe fn resolve_graphics_binding(
        &self,
        _next: *const std::ffi::c_void,
    ) -> RuntimeResult<Bridge> {
        // The submission device is D3D11; without it no application binding
        // can be honored.
        Err(RuntimeError::GraphicsDeviceInvalid)
    }
}
