//! Frame layer assembly: the application's heterogeneous layer list becomes
//! the backend layer array submitted with `end_frame`.
//!
//! Layers render back-to-front by list position. Each referenced
//! `(swapchain, slice)` pair is prepared and committed at most once per
//! frame; the fixup plan for the pair is executed through the caller-supplied
//! executor (the submission device on Windows, a recorder in headless
//! sessions).

use {
    crate::{
        backend::{
            self, Backend, CubeLayer, CylinderLayer, FovTangents, Layer, ProjectionDepth,
            ProjectionLayer, QuadLayer, SwapchainHandle, Viewport,
        },
        error::{RuntimeError, RuntimeResult},
        fixup::CommitPlan,
        handles::HandleTable,
        space::{self, Pose, Space},
        swapchain::Swapchain,
    },
    glam::Quat,
    log::debug,
    openxr_sys as sys,
    std::collections::HashSet,
};

/// Executes one fixup plan against the GPU (or records it).
pub type PlanExecutor<'a> =
    &'a mut dyn FnMut(&mut Swapchain, u32, &CommitPlan) -> RuntimeResult<()>;

/// Everything layer assembly needs from the session.
pub struct ComposeContext<'a> {
    pub backend: &'a dyn Backend,
    pub swapchains: &'a mut HandleTable<Swapchain>,
    pub spaces: &'a HandleTable<Space>,

    /// The compositor origin all layer poses are re-based into.
    pub origin: Space,

    pub floor_height: f32,
    pub display_time_backend: f64,

    pub depth_extension: bool,
    pub cylinder_extension: bool,
    pub cube_extension: bool,

    pub executor: PlanExecutor<'a>,
}

impl ComposeContext<'_> {
    /// Re-bases a layer pose from its space into the compositor origin.
    fn origin_pose(&self, space_handle: sys::Space, pose: &sys::Posef) -> RuntimeResult<Pose> {
        let space = self
            .spaces
            .get(space_handle.into_raw())
            .ok_or(RuntimeError::HandleInvalid)?;
        let location = space::locate(
            space,
            &self.origin,
            self.display_time_backend,
            self.backend,
            self.floor_height,
        );

        Ok(Pose::validate_xr(pose)?.then(location.pose))
    }

    /// Prepares and commits one `(swapchain, slice)`, returning the backend
    /// ring holding the slice plus the validated viewport.
    fn commit_sub_image(
        &mut self,
        committed: &mut HashSet<(SwapchainHandle, u32)>,
        sub_image: &sys::SwapchainSubImage,
        layer_index: u32,
        layer_flags: sys::CompositionLayerFlags,
    ) -> RuntimeResult<(SwapchainHandle, Viewport)> {
        let handle = sub_image.swapchain.into_raw();
        let slice = sub_image.image_array_index;

        let swapchain = self
            .swapchains
            .get_mut(handle)
            .ok_or(RuntimeError::HandleInvalid)?;

        if !swapchain.is_rect_valid(&sub_image.image_rect) {
            return Err(RuntimeError::SwapchainRectInvalid);
        }

        // With render scaling the backend texture is larger than what the
        // application addressed; the upscaler fills it wall to wall.
        let viewport = match swapchain.upscaled_size {
            Some((width, height)) => Viewport {
                x: 0,
                y: 0,
                width: width as i32,
                height: height as i32,
            },
            None => Viewport {
                x: sub_image.image_rect.offset.x,
                y: sub_image.image_rect.offset.y,
                width: sub_image.image_rect.extent.width,
                height: sub_image.image_rect.extent.height,
            },
        };

        // A swapchain the application never released has nothing to commit;
        // the compositor keeps showing whatever the ring holds.
        if !swapchain.has_released() {
            debug!("layer references un-released swapchain {handle}");

            let chain = swapchain.chain(slice).unwrap_or(swapchain.primary_chain());

            return Ok((chain, viewport));
        }

        let key = (swapchain.primary_chain(), slice);

        if !committed.contains(&key) {
            let plan = swapchain.prepare_commit(self.backend, layer_index, slice, layer_flags)?;

            (self.executor)(swapchain, slice, &plan)?;

            let chain = swapchain
                .chain(slice)
                .expect("prepare_commit creates the slice ring");
            self.backend.commit_swapchain(chain)?;
            committed.insert(key);
        }

        let chain = swapchain
            .chain(slice)
            .expect("committed slices have a ring");

        Ok((chain, viewport))
    }

    fn projection(
        &mut self,
        committed: &mut HashSet<(SwapchainHandle, u32)>,
        layer_index: u32,
        proj: &sys::CompositionLayerProjection,
    ) -> RuntimeResult<Layer> {
        if proj.view_count != 2 || proj.views.is_null() {
            return Err(RuntimeError::Validation);
        }

        // Safety: the application guarantees `views` points at `view_count`
        // projection views for the duration of xrEndFrame.
        let views = unsafe { std::slice::from_raw_parts(proj.views, 2) };

        let mut color = [SwapchainHandle(0); 2];
        let mut viewport = [Viewport::default(); 2];
        let mut fov = [FovTangents {
            up: 0.0,
            down: 0.0,
            left: 0.0,
            right: 0.0,
        }; 2];
        let mut pose = [Pose::IDENTITY; 2];
        let mut depth_texture = [None; 2];
        let mut depth_projection = None;

        for (eye, view) in views.iter().enumerate() {
            if view.ty != sys::StructureType::COMPOSITION_LAYER_PROJECTION_VIEW {
                return Err(RuntimeError::Validation);
            }

            let (chain, rect) =
                self.commit_sub_image(committed, &view.sub_image, layer_index, proj.layer_flags)?;
            color[eye] = chain;
            viewport[eye] = rect;

            fov[eye] = FovTangents {
                up: view.fov.angle_up.tan(),
                down: -view.fov.angle_down.tan(),
                left: -view.fov.angle_left.tan(),
                right: view.fov.angle_right.tan(),
            };

            pose[eye] = self.origin_pose(proj.space, &view.pose)?;

            if self.depth_extension {
                // Safety: `next` chains are application-owned input structs;
                // each entry starts with (type, next).
                let mut entry = view.next as *const sys::BaseInStructure;
                while !entry.is_null() {
                    let header = unsafe { &*entry };

                    if header.ty == sys::StructureType::COMPOSITION_LAYER_DEPTH_INFO_KHR {
                        let depth =
                            unsafe { &*(entry as *const sys::CompositionLayerDepthInfoKHR) };

                        // Depth images only ever copy or resolve; alpha
                        // semantics do not apply to them.
                        let (chain, _) = self.commit_sub_image(
                            committed,
                            &depth.sub_image,
                            0,
                            sys::CompositionLayerFlags::EMPTY,
                        )?;

                        depth_texture[eye] = Some(chain);
                        depth_projection = Some(backend::DepthProjection::from_clip_planes(
                            depth.near_z,
                            depth.far_z,
                        ));

                        break;
                    }

                    entry = header.next;
                }
            }
        }

        let depth = match (depth_texture, depth_projection) {
            ([Some(left), Some(right)], Some(projection)) => Some(ProjectionDepth {
                texture: [left, right],
                projection,
            }),
            _ => None,
        };

        Ok(Layer::Projection(ProjectionLayer {
            color,
            viewport,
            fov,
            pose,
            sensor_sample_time: self.display_time_backend,
            depth,
        }))
    }

    fn quad(
        &mut self,
        committed: &mut HashSet<(SwapchainHandle, u32)>,
        layer_index: u32,
        quad: &sys::CompositionLayerQuad,
    ) -> RuntimeResult<Layer> {
        // eyeVisibility has no backend equivalent and is not emulated.
        let (chain, viewport) =
            self.commit_sub_image(committed, &quad.sub_image, layer_index, quad.layer_flags)?;

        Ok(Layer::Quad(QuadLayer {
            color: chain,
            viewport,
            pose: self.origin_pose(quad.space, &quad.pose)?,
            size: [quad.size.width, quad.size.height],
        }))
    }

    fn cylinder(
        &mut self,
        committed: &mut HashSet<(SwapchainHandle, u32)>,
        layer_index: u32,
        cylinder: &sys::CompositionLayerCylinderKHR,
    ) -> RuntimeResult<Layer> {
        let (chain, viewport) = self.commit_sub_image(
            committed,
            &cylinder.sub_image,
            layer_index,
            cylinder.layer_flags,
        )?;

        Ok(Layer::Cylinder(CylinderLayer {
            color: chain,
            viewport,
            pose: self.origin_pose(cylinder.space, &cylinder.pose)?,
            radius: cylinder.radius,
            central_angle: cylinder.central_angle,
            aspect_ratio: cylinder.aspect_ratio,
        }))
    }

    fn cube(
        &mut self,
        committed: &mut HashSet<(SwapchainHandle, u32)>,
        layer_index: u32,
        cube: &sys::CompositionLayerCubeKHR,
    ) -> RuntimeResult<Layer> {
        let handle = cube.swapchain.into_raw();
        let swapchain = self
            .swapchains
            .get_mut(handle)
            .ok_or(RuntimeError::HandleInvalid)?;
        let key = (swapchain.primary_chain(), cube.image_array_index);

        if swapchain.has_released() && !committed.contains(&key) {
            let plan = swapchain.prepare_commit(
                self.backend,
                layer_index,
                cube.image_array_index,
                cube.layer_flags,
            )?;

            (self.executor)(swapchain, cube.image_array_index, &plan)?;
            self.backend.commit_swapchain(swapchain.primary_chain())?;
            committed.insert(key);
        }

        let chain = self
            .swapchains
            .get(handle)
            .expect("checked above")
            .primary_chain();

        Ok(Layer::Cube(CubeLayer {
            color: chain,
            orientation: Quat::from_xyzw(
                cube.orientation.x,
                cube.orientation.y,
                cube.orientation.z,
                cube.orientation.w,
            )
            .normalize(),
        }))
    }

    /// Walks the frame's layer list and builds the backend layer array.
    ///
    /// # Safety
    ///
    /// `layers` must point at `layer_count` valid composition-layer
    /// pointers, each heading a structure of the type named by its `ty`
    /// field, live for the duration of the call.
    pub unsafe fn build_layers(
        &mut self,
        layers: *const *const sys::CompositionLayerBaseHeader,
        layer_count: u32,
    ) -> RuntimeResult<Vec<Layer>> {
        let mut committed = HashSet::new();
        let mut built = Vec::with_capacity(layer_count as usize);

        if layer_count > 0 && layers.is_null() {
            return Err(RuntimeError::LayerInvalid);
        }

        for layer_index in 0..layer_count {
            let header = unsafe { *layers.add(layer_index as usize) };

            if header.is_null() {
                return Err(RuntimeError::LayerInvalid);
            }

            let ty = unsafe { (*header).ty };
            let layer = match ty {
                sys::StructureType::COMPOSITION_LAYER_PROJECTION => self.projection(
                    &mut committed,
                    layer_index,
                    unsafe { &*(header as *const sys::CompositionLayerProjection) },
                )?,
                sys::StructureType::COMPOSITION_LAYER_QUAD => self.quad(
                    &mut committed,
                    layer_index,
                    unsafe { &*(header as *const sys::CompositionLayerQuad) },
                )?,
                sys::StructureType::COMPOSITION_LAYER_CYLINDER_KHR if self.cylinder_extension => {
                    self.cylinder(&mut committed, layer_index, unsafe {
                        &*(header as *const sys::CompositionLayerCylinderKHR)
                    })?
                }
                sys::StructureType::COMPOSITION_LAYER_CUBE_KHR if self.cube_extension => self
                    .cube(&mut committed, layer_index, unsafe {
                        &*(header as *const sys::CompositionLayerCubeKHR)
                    })?,
                _ => return Err(RuntimeError::LayerInvalid),
            };

            built.push(layer);
        }

        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            backend::mock::MockHmd,
            config::RuntimeConfig,
            format::{DxgiFormat, GraphicsApi},
        },
        std::ptr::null,
        openxr_sys::{Extent2Di, Offset2Di},
    };

    fn swapchain_info(array_size: u32) -> sys::SwapchainCreateInfo {
        sys::SwapchainCreateInfo {
            ty: sys::StructureType::SWAPCHAIN_CREATE_INFO,
            next: null(),
            create_flags: sys::SwapchainCreateFlags::EMPTY,
            usage_flags: sys::SwapchainUsageFlags::COLOR_ATTACHMENT,
            format: DxgiFormat::R8G8B8A8_UNORM_SRGB.0 as i64,
            sample_count: 1,
            width: 1024,
            height: 1024,
            face_count: 1,
            array_size,
            mip_count: 1,
        }
    }

    fn identity_pose() -> sys::Posef {
        Pose::IDENTITY.to_xr()
    }

    fn rect(x: i32, width: i32) -> sys::Rect2Di {
        sys::Rect2Di {
            offset: Offset2Di { x, y: 0 },
            extent: Extent2Di {
                width,
                height: 1024,
            },
        }
    }

    struct Fixture {
        hmd: MockHmd,
        swapchains: HandleTable<Swapchain>,
        spaces: HandleTable<Space>,
        local_space: sys::Space,
    }

    impl Fixture {
        fn new() -> Self {
            let hmd = MockHmd::default();
            let mut spaces = HandleTable::new();
            let local_space = sys::Space::from_raw(spaces.insert(Space::reference(
                sys::ReferenceSpaceType::LOCAL,
                Pose::IDENTITY,
            )));

            Self {
                hmd,
                swapchains: HandleTable::new(),
                spaces,
                local_space,
            }
        }

        fn released_swapchain(&mut self, array_size: u32) -> u64 {
            let mut chain =
                Swapchain::create(&self.hmd, GraphicsApi::Headless, &swapchain_info(array_size), &RuntimeConfig::default())
                    .unwrap();
            chain.acquire(&self.hmd).unwrap();
            chain.wait_image().unwrap();
            chain.release().unwrap();

            self.swapchains.insert(chain)
        }
    }

    fn compose<'a>(
        fixture: &'a mut Fixture,
        executor: PlanExecutor<'a>,
    ) -> ComposeContext<'a> {
        ComposeContext {
            backend: &fixture.hmd,
            swapchains: &mut fixture.swapchains,
            spaces: &fixture.spaces,
            origin: Space::reference(sys::ReferenceSpaceType::LOCAL, Pose::IDENTITY),
            floor_height: 1.7,
            display_time_backend: 1.0,
            depth_extension: true,
            cylinder_extension: true,
            cube_extension: false,
            executor,
        }
    }

    fn projection_view(
        swapchain: u64,
        slice: u32,
        image_rect: sys::Rect2Di,
    ) -> sys::CompositionLayerProjectionView {
        sys::CompositionLayerProjectionView {
            ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION_VIEW,
            next: null(),
            pose: identity_pose(),
            fov: sys::Fovf {
                angle_left: -0.8,
                angle_right: 0.8,
                angle_up: 0.7,
                angle_down: -0.7,
            },
            sub_image: sys::SwapchainSubImage {
                swapchain: sys::Swapchain::from_raw(swapchain),
                image_rect,
                image_array_index: slice,
            },
        }
    }

    #[test]
    pub fn stereo_projection_shares_one_commit() {
        let mut fixture = Fixture::new();
        let handle = fixture.released_swapchain(1);
        let local = fixture.local_space;

        let views = [
            projection_view(handle, 0, rect(0, 512)),
            projection_view(handle, 0, rect(512, 512)),
        ];
        let proj = sys::CompositionLayerProjection {
            ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION,
            next: null(),
            layer_flags: sys::CompositionLayerFlags::EMPTY,
            space: local,
            view_count: 2,
            views: views.as_ptr(),
        };

        let mut plans = Vec::new();
        let mut executor =
            |_: &mut Swapchain, slice: u32, plan: &CommitPlan| {
                plans.push((slice, *plan));
                Ok(())
            };
        let mut ctx = compose(&mut fixture, &mut executor);

        let headers = [&proj as *const _ as *const sys::CompositionLayerBaseHeader];
        let layers = unsafe { ctx.build_layers(headers.as_ptr(), 1) }.unwrap();

        assert_eq!(layers.len(), 1);
        assert_eq!(plans.len(), 1, "both eyes share one (swapchain, slice)");

        let Layer::Projection(layer) = &layers[0] else {
            panic!("expected projection");
        };

        assert_eq!(layer.viewport[1].x, 512);
        assert_eq!(layer.color[0], layer.color[1]);
        assert!(layer.fov[0].up > 0.0 && layer.fov[0].down > 0.0);
        assert!(layer.depth.is_none());
    }

    #[test]
    pub fn array_slices_fan_out_into_two_rings() {
        let mut fixture = Fixture::new();
        let handle = fixture.released_swapchain(2);
        let local = fixture.local_space;

        let views = [
            projection_view(handle, 0, rect(0, 1024)),
            projection_view(handle, 1, rect(0, 1024)),
        ];
        let proj = sys::CompositionLayerProjection {
            ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION,
            next: null(),
            layer_flags: sys::CompositionLayerFlags::EMPTY,
            space: local,
            view_count: 2,
            views: views.as_ptr(),
        };

        let mut slices = Vec::new();
        let mut executor = |_: &mut Swapchain, slice: u32, _: &CommitPlan| {
            slices.push(slice);
            Ok(())
        };
        let mut ctx = compose(&mut fixture, &mut executor);

        let headers = [&proj as *const _ as *const sys::CompositionLayerBaseHeader];
        let layers = unsafe { ctx.build_layers(headers.as_ptr(), 1) }.unwrap();

        assert_eq!(slices, vec![0, 1]);

        let Layer::Projection(layer) = &layers[0] else {
            panic!("expected projection");
        };
        assert_ne!(layer.color[0], layer.color[1]);

        // The lazily-created slice ring is single-layer.
        let desc = fixture.hmd.swapchain_desc(layer.color[1]).unwrap();
        assert_eq!(desc.array_size, 1);
        assert_eq!(fixture.hmd.swapchain_count(), 2);
    }

    #[test]
    pub fn out_of_bounds_rect_is_rejected() {
        let mut fixture = Fixture::new();
        let handle = fixture.released_swapchain(1);
        let local = fixture.local_space;

        let views = [
            projection_view(handle, 0, rect(0, 512)),
            projection_view(handle, 0, rect(513, 512)),
        ];
        let proj = sys::CompositionLayerProjection {
            ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION,
            next: null(),
            layer_flags: sys::CompositionLayerFlags::EMPTY,
            space: local,
            view_count: 2,
            views: views.as_ptr(),
        };

        let mut executor = |_: &mut Swapchain, _: u32, _: &CommitPlan| Ok(());
        let mut ctx = compose(&mut fixture, &mut executor);

        let headers = [&proj as *const _ as *const sys::CompositionLayerBaseHeader];
        let result = unsafe { ctx.build_layers(headers.as_ptr(), 1) };

        assert_eq!(result.err(), Some(RuntimeError::SwapchainRectInvalid));
    }

    #[test]
    pub fn unknown_swapchain_handles_are_rejected() {
        let mut fixture = Fixture::new();
        let local = fixture.local_space;

        let quad = sys::CompositionLayerQuad {
            ty: sys::StructureType::COMPOSITION_LAYER_QUAD,
            next: null(),
            layer_flags: sys::CompositionLayerFlags::EMPTY,
            space: local,
            eye_visibility: sys::EyeVisibility::BOTH,
            sub_image: sys::SwapchainSubImage {
                swapchain: sys::Swapchain::from_raw(99),
                image_rect: rect(0, 1024),
                image_array_index: 0,
            },
            pose: identity_pose(),
            size: sys::Extent2Df {
                width: 1.0,
                height: 1.0,
            },
        };

        let mut executor = |_: &mut Swapchain, _: u32, _: &CommitPlan| Ok(());
        let mut ctx = compose(&mut fixture, &mut executor);

        let headers = [&quad as *const _ as *const sys::CompositionLayerBaseHeader];
        let result = unsafe { ctx.build_layers(headers.as_ptr(), 1) };

        assert_eq!(result.err(), Some(RuntimeError::HandleInvalid));
    }

    #[test]
    pub fn depth_info_switches_layer_to_depth_variant() {
        let mut fixture = Fixture::new();
        let color = fixture.released_swapchain(1);
        let depth_handle = {
            let mut info = swapchain_info(1);
            info.format = DxgiFormat::D32_FLOAT.0 as i64;
            info.usage_flags = sys::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            let mut chain =
                Swapchain::create(&fixture.hmd, GraphicsApi::Headless, &info, &RuntimeConfig::default()).unwrap();
            chain.acquire(&fixture.hmd).unwrap();
            chain.wait_image().unwrap();
            chain.release().unwrap();

            fixture.swapchains.insert(chain)
        };
        let local = fixture.local_space;

        let depth_info = |_eye: usize| sys::CompositionLayerDepthInfoKHR {
            ty: sys::StructureType::COMPOSITION_LAYER_DEPTH_INFO_KHR,
            next: null(),
            sub_image: sys::SwapchainSubImage {
                swapchain: sys::Swapchain::from_raw(depth_handle),
                image_rect: rect(0, 1024),
                image_array_index: 0,
            },
            min_depth: 0.0,
            max_depth: 1.0,
            near_z: 0.1,
            far_z: 100.0,
        };
        let depth = [depth_info(0), depth_info(1)];

        let mut views = [
            projection_view(color, 0, rect(0, 512)),
            projection_view(color, 0, rect(512, 512)),
        ];
        views[0].next = &depth[0] as *const _ as *const std::ffi::c_void;
        views[1].next = &depth[1] as *const _ as *const std::ffi::c_void;

        let proj = sys::CompositionLayerProjection {
            ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION,
            next: null(),
            layer_flags: sys::CompositionLayerFlags::EMPTY,
            space: local,
            view_count: 2,
            views: views.as_ptr(),
        };

        let mut executor = |_: &mut Swapchain, _: u32, _: &CommitPlan| Ok(());
        let mut ctx = compose(&mut fixture, &mut executor);

        let headers = [&proj as *const _ as *const sys::CompositionLayerBaseHeader];
        let layers = unsafe { ctx.build_layers(headers.as_ptr(), 1) }.unwrap();

        let Layer::Projection(layer) = &layers[0] else {
            panic!("expected projection");
        };
        let depth = layer.depth.as_ref().expect("depth attached");

        assert!((depth.projection.p22 - 100.0 / (0.1 - 100.0)).abs() < 1e-6);
        assert_eq!(depth.projection.p32, -1.0);
    }

    #[test]
    pub fn unknown_layer_type_is_invalid() {
        let mut fixture = Fixture::new();

        let bogus = sys::CompositionLayerQuad {
            ty: sys::StructureType::COMPOSITION_LAYER_CUBE_KHR,
            next: null(),
            layer_flags: sys::CompositionLayerFlags::EMPTY,
            space: fixture.local_space,
            eye_visibility: sys::EyeVisibility::BOTH,
            sub_image: sys::SwapchainSubImage {
                swapchain: sys::Swapchain::from_raw(1),
                image_rect: rect(0, 1024),
                image_array_index: 0,
            },
            pose: identity_pose(),
            size: sys::Extent2Df {
                width: 1.0,
                height: 1.0,
            },
        };

        let mut executor = |_: &mut Swapchain, _: u32, _: &CommitPlan| Ok(());
        // Cube extension is disabled in this fixture.
        let mut ctx = compose(&mut fixture, &mut executor);

        let headers = [&bogus as *const _ as *const sys::CompositionLayerBaseHeader];
        let result = unsafe { ctx.build_layers(headers.as_ptr(), 1) };

        assert_eq!(result.err(), Some(RuntimeError::LayerInvalid));
    }
}
