//! End-to-end frame submission against the mock backend: a headless session
//! runs the full wait/begin/end protocol, swapchains move through
//! acquire/wait/release, and layer assembly commits the backend rings.

use {
    openxr_sys as sys,
    parallax_openxr::{
        backend::{mock::JournalEvent, mock::MockHmd, Backend, Layer},
        fixup::{CommitKind, CLEAR_ALPHA, PREMULTIPLY_ALPHA},
        interop::Bridge,
        session::{Session, WaitFrameOutcome},
        space::Pose,
    },
    std::{ptr::null, sync::Arc},
};

const RGBA_SRGB: i64 = 29; // DXGI_FORMAT_R8G8B8A8_UNORM_SRGB

fn swapchain_info(width: u32, height: u32, array_size: u32) -> sys::SwapchainCreateInfo {
    sys::SwapchainCreateInfo {
        ty: sys::StructureType::SWAPCHAIN_CREATE_INFO,
        next: null(),
        create_flags: sys::SwapchainCreateFlags::EMPTY,
        usage_flags: sys::SwapchainUsageFlags::COLOR_ATTACHMENT,
        format: RGBA_SRGB,
        sample_count: 1,
        width,
        height,
        face_count: 1,
        array_size,
        mip_count: 1,
    }
}

fn rect(x: i32, width: i32, height: i32) -> sys::Rect2Di {
    sys::Rect2Di {
        offset: sys::Offset2Di { x, y: 0 },
        extent: sys::Extent2Di { width, height },
    }
}

fn projection_view(
    swapchain: sys::Swapchain,
    slice: u32,
    image_rect: sys::Rect2Di,
) -> sys::CompositionLayerProjectionView {
    sys::CompositionLayerProjectionView {
        ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION_VIEW,
        next: null(),
        pose: Pose::IDENTITY.to_xr(),
        fov: sys::Fovf {
            angle_left: -0.8,
            angle_right: 0.8,
            angle_up: 0.7,
            angle_down: -0.7,
        },
        sub_image: sys::SwapchainSubImage {
            swapchain,
            image_rect,
            image_array_index: slice,
        },
    }
}

struct Harness {
    hmd: Arc<MockHmd>,
    session: Arc<Session>,
}

impl Harness {
    fn new() -> Self {
        let _ = pretty_env_logger::try_init();

        let hmd = Arc::new(MockHmd::default());
        let session = Session::create_headless(hmd.clone() as Arc<dyn Backend>).unwrap();
        session
            .begin(sys::ViewConfigurationType::PRIMARY_STEREO)
            .unwrap();

        Self { hmd, session }
    }

    fn render_cycle(&self, swapchain: sys::Swapchain) {
        self.session.acquire_swapchain_image(swapchain).unwrap();
        self.session.wait_swapchain_image(swapchain).unwrap();
        self.session.release_swapchain_image(swapchain).unwrap();
    }

    fn submit_projection(
        &self,
        display_time: sys::Time,
        layers: &[&sys::CompositionLayerProjection],
    ) {
        let headers = layers
            .iter()
            .map(|layer| *layer as *const _ as *const sys::CompositionLayerBaseHeader)
            .collect::<Vec<_>>();

        unsafe {
            self.session
                .end_frame(
                    display_time,
                    sys::EnvironmentBlendMode::OPAQUE,
                    headers.as_ptr(),
                    headers.len() as u32,
                )
                .unwrap();
        }
    }

    fn executed_plans(&self) -> Vec<(u32, parallax_openxr::fixup::CommitPlan)> {
        match &*self.session.bridge() {
            Bridge::Headless(bridge) => bridge.executed_plans.clone(),
            _ => unreachable!("headless session"),
        }
    }
}

#[test]
fn single_frame_end_to_end() {
    let harness = Harness::new();
    let swapchain = harness
        .session
        .create_swapchain(&swapchain_info(1024, 1024, 1))
        .unwrap();

    assert_eq!(
        harness.session.swapchain_image_count(swapchain).unwrap(),
        3
    );

    let WaitFrameOutcome::Frame(frame) = harness.session.wait_frame().unwrap() else {
        panic!("headset is connected");
    };
    let now = harness.hmd.time_now();
    assert!(frame.predicted_display_time >= now - 1e-9);
    assert!(!harness.session.begin_frame().unwrap());

    let index = harness.session.acquire_swapchain_image(swapchain).unwrap();
    assert_eq!(index, 0);
    harness.session.wait_swapchain_image(swapchain).unwrap();
    harness.session.release_swapchain_image(swapchain).unwrap();

    let views = [
        projection_view(swapchain, 0, rect(0, 512, 1024)),
        projection_view(swapchain, 0, rect(512, 512, 1024)),
    ];
    let projection = sys::CompositionLayerProjection {
        ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION,
        next: null(),
        layer_flags: sys::CompositionLayerFlags::EMPTY,
        space: harness.session.origin_space,
        view_count: 2,
        views: views.as_ptr(),
    };
    let display_time = harness.session.time.backend_to_xr(frame.predicted_display_time);

    harness.submit_projection(display_time, &[&projection]);

    // One commit (both eyes share the pair), then one compositor frame.
    let journal = harness.hmd.journal();
    assert!(journal.contains(&JournalEvent::EndFrame {
        frame_index: 0,
        layer_count: 1,
    }));
    assert_eq!(
        journal
            .iter()
            .filter(|event| matches!(event, JournalEvent::Commit(_)))
            .count(),
        1
    );

    // The next frame's predicted display time moves strictly forward.
    let WaitFrameOutcome::Frame(next) = harness.session.wait_frame().unwrap() else {
        panic!("headset is connected");
    };
    assert!(next.predicted_display_time > frame.predicted_display_time);
}

#[test]
fn array_slices_fan_out_to_single_layer_rings() {
    let harness = Harness::new();
    let swapchain = harness
        .session
        .create_swapchain(&swapchain_info(1024, 1024, 2))
        .unwrap();

    harness.session.wait_frame().unwrap();
    harness.session.begin_frame().unwrap();
    harness.render_cycle(swapchain);

    let views = [
        projection_view(swapchain, 0, rect(0, 1024, 1024)),
        projection_view(swapchain, 1, rect(0, 1024, 1024)),
    ];
    let projection = sys::CompositionLayerProjection {
        ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION,
        next: null(),
        layer_flags: sys::CompositionLayerFlags::EMPTY,
        space: harness.session.origin_space,
        view_count: 2,
        views: views.as_ptr(),
    };

    harness.submit_projection(sys::Time::from_nanos(1), &[&projection]);

    // The slice ring was created lazily, single-layer, and both slices
    // committed once each.
    assert_eq!(harness.hmd.swapchain_count(), 2);

    let layers = harness.hmd.last_layers();
    let Layer::Projection(layer) = &layers[0] else {
        panic!("expected projection");
    };
    assert_ne!(layer.color[0], layer.color[1]);
    assert_eq!(
        harness
            .hmd
            .swapchain_desc(layer.color[1])
            .unwrap()
            .array_size,
        1
    );

    let plans = harness.executed_plans();
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0].0, 0);
    assert_eq!(plans[1].0, 1);
    assert!(matches!(plans[1].1.kind, CommitKind::Copy { .. }));
}

#[test]
fn overlay_layer_is_alpha_corrected_but_base_is_not() {
    let harness = Harness::new();
    let base = harness
        .session
        .create_swapchain(&swapchain_info(1024, 1024, 1))
        .unwrap();
    let overlay = harness
        .session
        .create_swapchain(&swapchain_info(256, 256, 1))
        .unwrap();

    harness.session.wait_frame().unwrap();
    harness.session.begin_frame().unwrap();
    harness.render_cycle(base);
    harness.render_cycle(overlay);

    let base_views = [
        projection_view(base, 0, rect(0, 512, 1024)),
        projection_view(base, 0, rect(512, 512, 1024)),
    ];
    let base_layer = sys::CompositionLayerProjection {
        ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION,
        next: null(),
        layer_flags: sys::CompositionLayerFlags::EMPTY,
        space: harness.session.origin_space,
        view_count: 2,
        views: base_views.as_ptr(),
    };
    let overlay_views = [
        projection_view(overlay, 0, rect(0, 256, 256)),
        projection_view(overlay, 0, rect(0, 256, 256)),
    ];
    let overlay_layer = sys::CompositionLayerProjection {
        ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION,
        next: null(),
        layer_flags: sys::CompositionLayerFlags::UNPREMULTIPLIED_ALPHA,
        space: harness.session.origin_space,
        view_count: 2,
        views: overlay_views.as_ptr(),
    };

    harness.submit_projection(sys::Time::from_nanos(1), &[&base_layer, &overlay_layer]);

    let plans = harness.executed_plans();
    assert_eq!(plans.len(), 2);

    // Layer 0 commits untouched; layer 1 runs the alpha shader with both
    // bits set.
    assert_eq!(plans[0].1.kind, CommitKind::Direct);
    let CommitKind::AlphaCorrect {
        constants,
        srgb_finish,
        ..
    } = plans[1].1.kind
    else {
        panic!("expected alpha correction, got {:?}", plans[1].1.kind);
    };
    assert_eq!(constants, CLEAR_ALPHA | PREMULTIPLY_ALPHA);
    assert!(srgb_finish);
}

#[test]
fn discarded_frames_resubmit_under_the_new_index() {
    let harness = Harness::new();

    harness.session.wait_frame().unwrap();
    assert!(!harness.session.begin_frame().unwrap());
    harness.session.wait_frame().unwrap();

    // Begin again without an end: the open frame is discarded.
    assert!(harness.session.begin_frame().unwrap());

    let swapchain = harness
        .session
        .create_swapchain(&swapchain_info(64, 64, 1))
        .unwrap();
    harness.render_cycle(swapchain);

    let views = [
        projection_view(swapchain, 0, rect(0, 32, 64)),
        projection_view(swapchain, 0, rect(32, 32, 64)),
    ];
    let projection = sys::CompositionLayerProjection {
        ty: sys::StructureType::COMPOSITION_LAYER_PROJECTION,
        next: null(),
        layer_flags: sys::CompositionLayerFlags::EMPTY,
        space: harness.session.origin_space,
        view_count: 2,
        views: views.as_ptr(),
    };

    harness.submit_projection(sys::Time::from_nanos(1), &[&projection]);

    assert!(harness.hmd.journal().contains(&JournalEvent::EndFrame {
        frame_index: 1,
        layer_count: 1,
    }));
}

#[test]
fn disconnect_stops_the_frame_loop() {
    let harness = Harness::new();

    harness.session.wait_frame().unwrap();
    harness.session.begin_frame().unwrap();
    unsafe {
        harness
            .session
            .end_frame(
                sys::Time::from_nanos(1),
                sys::EnvironmentBlendMode::OPAQUE,
                null(),
                0,
            )
            .unwrap();
    }

    harness.hmd.disconnect();

    assert!(matches!(
        harness.session.wait_frame().unwrap(),
        WaitFrameOutcome::LossPending
    ));

    // Nothing further reaches the compositor.
    let frames = harness
        .hmd
        .journal()
        .iter()
        .filter(|event| matches!(event, JournalEvent::EndFrame { .. }))
        .count();
    assert_eq!(frames, 0);
}

#[test]
fn quad_layers_replay_when_rendered_at_a_lower_rate() {
    let harness = Harness::new();
    let quad_chain = harness
        .session
        .create_swapchain(&swapchain_info(256, 256, 1))
        .unwrap();

    let quad = sys::CompositionLayerQuad {
        ty: sys::StructureType::COMPOSITION_LAYER_QUAD,
        next: null(),
        layer_flags: sys::CompositionLayerFlags::UNPREMULTIPLIED_ALPHA,
        space: harness.session.origin_space,
        eye_visibility: sys::EyeVisibility::BOTH,
        sub_image: sys::SwapchainSubImage {
            swapchain: quad_chain,
            image_rect: rect(0, 256, 256),
            image_array_index: 0,
        },
        pose: Pose::IDENTITY.to_xr(),
        size: sys::Extent2Df {
            width: 0.5,
            height: 0.5,
        },
    };
    let headers = [&quad as *const _ as *const sys::CompositionLayerBaseHeader];

    // Frame 1: the quad is fresh, so it runs the alpha shader.
    harness.session.wait_frame().unwrap();
    harness.session.begin_frame().unwrap();
    harness.render_cycle(quad_chain);
    unsafe {
        harness
            .session
            .end_frame(
                sys::Time::from_nanos(1),
                sys::EnvironmentBlendMode::OPAQUE,
                headers.as_ptr(),
                1,
            )
            .unwrap();
    }

    // Frame 2: no new release; the processed result replays via copy.
    harness.session.wait_frame().unwrap();
    harness.session.begin_frame().unwrap();
    unsafe {
        harness
            .session
            .end_frame(
                sys::Time::from_nanos(2),
                sys::EnvironmentBlendMode::OPAQUE,
                headers.as_ptr(),
                1,
            )
            .unwrap();
    }

    let plans = harness.executed_plans();
    assert_eq!(plans.len(), 2);
    assert!(matches!(plans[0].1.kind, CommitKind::AlphaCorrect { .. }));
    assert!(matches!(plans[1].1.kind, CommitKind::Copy { .. }));

    // The ring advanced on both commits even though only one release
    // happened.
    let layers = harness.hmd.last_layers();
    let Layer::Quad(quad_layer) = &layers[0] else {
        panic!("expected quad");
    };
    assert_eq!(harness.hmd.commit_count(quad_layer.color), 2);
}
