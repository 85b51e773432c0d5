//! Per-slice commit planning for released swapchain images.
//!
//! Before a swapchain image reaches the compositor it may need work: slicing
//! a texture array into the per-slice backend chains, alpha correction,
//! linear-to-sRGB encoding, dropping the stencil plane of an unsupported
//! depth format, or an MSAA resolve. The decision table lives here as a pure
//! function over the swapchain's accounting state; execution belongs to the
//! submission device.

use openxr_sys as sys;

/// Constant-buffer bit asking the alpha-correct shader to force alpha to 1.
pub const CLEAR_ALPHA: u32 = 1 << 0;

/// Constant-buffer bit asking the alpha-correct shader to premultiply RGB.
pub const PREMULTIPLY_ALPHA: u32 = 1 << 1;

/// Accounting inputs for one `(swapchain, slice)` commit.
#[derive(Clone, Copy, Debug)]
pub struct PlanInputs {
    /// Position of the layer in the frame's back-to-front list.
    pub layer_index: u32,

    /// Array slice referenced by the sub-image.
    pub slice: u32,

    pub layer_flags: sys::CompositionLayerFlags,

    pub array_size: u32,
    pub sample_count: u32,

    /// The submission format encodes sRGB, so compute output must detour
    /// through the intermediate and finish with an encoding draw.
    pub srgb_submission: bool,

    /// The app format carries a stencil plane the compositor rejects.
    pub need_depth_resolve: bool,

    /// Image index the application released last.
    pub last_released_index: u32,

    /// Image index this slice last processed, if any.
    pub last_processed_index: Option<u32>,
}

/// How the released image reaches the backend texture.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitKind {
    /// The application rendered straight into the backend texture; commit
    /// as-is.
    Direct,

    /// Copy subresource `slice` of the released image into the slice chain's
    /// current image. Also taken when nothing new was released this frame:
    /// committing re-acquires the backend ring, so the prior result must be
    /// replayed into the fresh image.
    Copy { source_index: u32 },

    /// Run the alpha-correct compute shader into the intermediate, then
    /// either draw it through the sRGB-encoding full-screen pass or copy it
    /// into the backend texture.
    AlphaCorrect {
        /// `CLEAR_ALPHA` and/or `PREMULTIPLY_ALPHA`.
        constants: u32,

        /// Select the Tex2DArray shader variant.
        array_shader: bool,

        /// Finish with the encoding draw instead of a copy.
        srgb_finish: bool,

        source_index: u32,
    },

    /// Drop the stencil plane: depth-resolve compute from the private image
    /// into the intermediate, then copy into the backend texture.
    DepthResolve { source_index: u32 },
}

/// Optional scaling work appended to a commit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpscalePass {
    /// Application-facing size.
    pub input: (u32, u32),

    /// Backend texture size the upscaler writes.
    pub output: (u32, u32),

    /// Sharpening strength 0..1; zero skips the sharpening pass.
    pub sharpen: f32,
}

/// Plan for one `(swapchain, slice)` commit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CommitPlan {
    pub kind: CommitKind,

    /// Resolve multisampling while moving the image.
    pub msaa_resolve: bool,

    /// Upscale (and optionally sharpen) on the way into the backend
    /// texture. Set for color swapchains when render scaling is configured.
    pub upscale: Option<UpscalePass>,
}

fn contains(flags: sys::CompositionLayerFlags, bit: sys::CompositionLayerFlags) -> bool {
    flags.into_raw() & bit.into_raw() != 0
}

/// Decides how a released image reaches the compositor.
pub fn plan_commit(inputs: &PlanInputs) -> CommitPlan {
    // Layer 0 is the base layer; its alpha never blends against anything,
    // so only an explicit blend request above it forces correction.
    let need_clear_alpha = inputs.layer_index > 0
        && !contains(
            inputs.layer_flags,
            sys::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA,
        );
    let need_premultiply_alpha = contains(
        inputs.layer_flags,
        sys::CompositionLayerFlags::UNPREMULTIPLIED_ALPHA,
    );

    let already_processed = inputs.last_processed_index == Some(inputs.last_released_index);
    let alpha_work = need_clear_alpha || need_premultiply_alpha;

    let kind = if inputs.need_depth_resolve {
        if already_processed {
            CommitKind::Copy {
                source_index: inputs.last_released_index,
            }
        } else {
            CommitKind::DepthResolve {
                source_index: inputs.last_released_index,
            }
        }
    } else if already_processed || (inputs.slice > 0 && !alpha_work) {
        CommitKind::Copy {
            source_index: inputs.last_released_index,
        }
    } else if alpha_work {
        CommitKind::AlphaCorrect {
            constants: if need_clear_alpha { CLEAR_ALPHA } else { 0 }
                | if need_premultiply_alpha {
                    PREMULTIPLY_ALPHA
                } else {
                    0
                },
            array_shader: inputs.array_size > 1,
            srgb_finish: inputs.srgb_submission,
            source_index: inputs.last_released_index,
        }
    } else {
        CommitKind::Direct
    };

    CommitPlan {
        kind,
        msaa_resolve: inputs.sample_count > 1 && !already_processed,
        upscale: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> PlanInputs {
        PlanInputs {
            layer_index: 0,
            slice: 0,
            layer_flags: sys::CompositionLayerFlags::EMPTY,
            array_size: 1,
            sample_count: 1,
            srgb_submission: true,
            need_depth_resolve: false,
            last_released_index: 2,
            last_processed_index: None,
        }
    }

    #[test]
    pub fn base_layer_commits_directly() {
        let plan = plan_commit(&inputs());

        assert_eq!(plan.kind, CommitKind::Direct);
        assert!(!plan.msaa_resolve);
    }

    #[test]
    pub fn overlay_without_source_alpha_clears() {
        let plan = plan_commit(&PlanInputs {
            layer_index: 1,
            ..inputs()
        });

        assert_eq!(
            plan.kind,
            CommitKind::AlphaCorrect {
                constants: CLEAR_ALPHA,
                array_shader: false,
                srgb_finish: true,
                source_index: 2,
            }
        );
    }

    #[test]
    pub fn unpremultiplied_overlay_sets_both_bits() {
        let plan = plan_commit(&PlanInputs {
            layer_index: 1,
            layer_flags: sys::CompositionLayerFlags::UNPREMULTIPLIED_ALPHA,
            ..inputs()
        });

        assert_eq!(
            plan.kind,
            CommitKind::AlphaCorrect {
                constants: CLEAR_ALPHA | PREMULTIPLY_ALPHA,
                array_shader: false,
                srgb_finish: true,
                source_index: 2,
            }
        );
    }

    #[test]
    pub fn source_alpha_overlay_needs_no_clear() {
        let plan = plan_commit(&PlanInputs {
            layer_index: 1,
            layer_flags: sys::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA,
            ..inputs()
        });

        assert_eq!(plan.kind, CommitKind::Direct);
    }

    #[test]
    pub fn upper_slice_copies_without_alpha_work() {
        let plan = plan_commit(&PlanInputs {
            slice: 1,
            array_size: 2,
            ..inputs()
        });

        assert_eq!(plan.kind, CommitKind::Copy { source_index: 2 });
    }

    #[test]
    pub fn upper_slice_with_alpha_work_runs_the_shader() {
        let plan = plan_commit(&PlanInputs {
            layer_index: 1,
            slice: 1,
            array_size: 2,
            ..inputs()
        });

        assert_eq!(
            plan.kind,
            CommitKind::AlphaCorrect {
                constants: CLEAR_ALPHA,
                array_shader: true,
                srgb_finish: true,
                source_index: 2,
            }
        );
    }

    #[test]
    pub fn stale_release_replays_via_copy() {
        // A quad layer rendered at a lower rate than the frame loop: the
        // processed result is current, but the ring advanced on commit.
        let plan = plan_commit(&PlanInputs {
            layer_index: 1,
            layer_flags: sys::CompositionLayerFlags::UNPREMULTIPLIED_ALPHA,
            last_processed_index: Some(2),
            ..inputs()
        });

        assert_eq!(plan.kind, CommitKind::Copy { source_index: 2 });
    }

    #[test]
    pub fn depth_resolve_swapchains_always_convert_new_images() {
        let plan = plan_commit(&PlanInputs {
            need_depth_resolve: true,
            ..inputs()
        });

        assert_eq!(plan.kind, CommitKind::DepthResolve { source_index: 2 });

        let plan = plan_commit(&PlanInputs {
            need_depth_resolve: true,
            last_processed_index: Some(2),
            ..inputs()
        });

        assert_eq!(plan.kind, CommitKind::Copy { source_index: 2 });
    }

    #[test]
    pub fn msaa_swapchains_resolve_once_per_release() {
        let plan = plan_commit(&PlanInputs {
            sample_count: 4,
            ..inputs()
        });
        assert!(plan.msaa_resolve);

        let plan = plan_commit(&PlanInputs {
            sample_count: 4,
            last_processed_index: Some(2),
            ..inputs()
        });
        assert!(!plan.msaa_resolve);
    }
}
