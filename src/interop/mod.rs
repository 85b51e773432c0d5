//! Graphics-API interop bridges.
//!
//! A bridge owns the application-facing half of the swapchain story: it
//! re-opens backend textures in the application's graphics API and ties the
//! application queue to the submission device through one shared timeline
//! fence, so work submitted before `xrEndFrame` is visible to the compositor
//! reads that follow. One 64-bit fence value is shared by all bridges and
//! increments on every serialize and flush.
//!
//! The D3D11, D3D12 and OpenGL bridges and the submission device only exist
//! on Windows; Vulkan shares their submission device. The headless bridge
//! backs mock sessions and records what would have run on the GPU.

#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod d3d12;
#[cfg(windows)]
pub mod opengl;
#[cfg(windows)]
pub mod passes;
#[cfg(windows)]
pub mod submission;
#[cfg(windows)]
pub mod vulkan;

use {
    crate::{
        error::RuntimeResult,
        fixup::CommitPlan,
        format::GraphicsApi,
        swapchain::Swapchain,
    },
    openxr_sys as sys,
};

/// Bridge used by headless sessions: no GPU, but the same accounting, so
/// protocol tests observe fence values and executed plans.
#[derive(Debug, Default)]
pub struct HeadlessBridge {
    pub fence_value: u64,
    pub executed_plans: Vec<(u32, CommitPlan)>,
}

/// The per-session graphics bridge.
pub enum Bridge {
    Headless(HeadlessBridge),

    #[cfg(windows)]
    D3d11(d3d11::D3d11Bridge),

    #[cfg(windows)]
    D3d12(d3d12::D3d12Bridge),

    #[cfg(windows)]
    Vulkan(vulkan::VulkanBridge),

    #[cfg(windows)]
    OpenGl(opengl::OpenGlBridge),
}

impl Bridge {
    pub fn api(&self) -> GraphicsApi {
        match self {
            Self::Headless(_) => GraphicsApi::Headless,
            #[cfg(windows)]
            Self::D3d11(_) => GraphicsApi::D3D11,
            #[cfg(windows)]
            Self::D3d12(_) => GraphicsApi::D3D12,
            #[cfg(windows)]
            Self::Vulkan(_) => GraphicsApi::Vulkan,
            #[cfg(windows)]
            Self::OpenGl(_) => GraphicsApi::OpenGL,
        }
    }

    /// Current shared fence value.
    pub fn fence_value(&self) -> u64 {
        match self {
            Self::Headless(bridge) => bridge.fence_value,
            #[cfg(windows)]
            Self::D3d11(bridge) => bridge.fence_value(),
            #[cfg(windows)]
            Self::D3d12(bridge) => bridge.fence_value(),
            #[cfg(windows)]
            Self::Vulkan(bridge) => bridge.fence_value(),
            #[cfg(windows)]
            Self::OpenGl(bridge) => bridge.fence_value(),
        }
    }

    /// Orders "everything the app submitted" before "everything the
    /// submission device records next": signal the shared fence on the app
    /// queue, wait for it on the submission context.
    pub fn serialize_app_frame(&mut self) -> RuntimeResult<()> {
        match self {
            Self::Headless(bridge) => {
                bridge.fence_value += 1;

                Ok(())
            }
            #[cfg(windows)]
            Self::D3d11(bridge) => bridge.serialize_app_frame(),
            #[cfg(windows)]
            Self::D3d12(bridge) => bridge.serialize_app_frame(),
            #[cfg(windows)]
            Self::Vulkan(bridge) => bridge.serialize_app_frame(),
            #[cfg(windows)]
            Self::OpenGl(bridge) => bridge.serialize_app_frame(),
        }
    }

    /// Blocks the host until the application queue drained.
    pub fn flush_app_queue(&mut self) -> RuntimeResult<()> {
        match self {
            Self::Headless(bridge) => {
                bridge.fence_value += 1;

                Ok(())
            }
            #[cfg(windows)]
            Self::D3d11(bridge) => bridge.flush_app_queue(),
            #[cfg(windows)]
            Self::D3d12(bridge) => bridge.flush_app_queue(),
            #[cfg(windows)]
            Self::Vulkan(bridge) => bridge.flush_app_queue(),
            #[cfg(windows)]
            Self::OpenGl(bridge) => bridge.flush_app_queue(),
        }
    }

    /// Blocks the host until the submission context drained.
    pub fn flush_submission(&mut self) -> RuntimeResult<()> {
        match self {
            Self::Headless(bridge) => {
                bridge.fence_value += 1;

                Ok(())
            }
            #[cfg(windows)]
            Self::D3d11(bridge) => bridge.submission_mut().flush(),
            #[cfg(windows)]
            Self::D3d12(bridge) => bridge.submission_mut().flush(),
            #[cfg(windows)]
            Self::Vulkan(bridge) => bridge.submission_mut().flush(),
            #[cfg(windows)]
            Self::OpenGl(bridge) => bridge.submission_mut().flush(),
        }
    }

    /// Runs one fixup plan for `(swapchain, slice)` on the submission
    /// device.
    pub fn execute_plan(
        &mut self,
        backend: &dyn crate::backend::Backend,
        swapchain: &mut Swapchain,
        slice: u32,
        plan: &CommitPlan,
    ) -> RuntimeResult<()> {
        match self {
            Self::Headless(bridge) => {
                let _ = (backend, swapchain);
                bridge.executed_plans.push((slice, *plan));

                Ok(())
            }
            #[cfg(windows)]
            Self::D3d11(bridge) => bridge
                .submission_mut()
                .execute_plan(backend, swapchain, slice, plan),
            #[cfg(windows)]
            Self::D3d12(bridge) => bridge
                .submission_mut()
                .execute_plan(backend, swapchain, slice, plan),
            #[cfg(windows)]
            Self::Vulkan(bridge) => bridge
                .submission_mut()
                .execute_plan(backend, swapchain, slice, plan),
            #[cfg(windows)]
            Self::OpenGl(bridge) => bridge
                .submission_mut()
                .execute_plan(backend, swapchain, slice, plan),
        }
    }

    /// Presents the debug-tool swapchain once per frame, if one exists.
    pub fn present_debug_swapchain(&mut self) {
        match self {
            Self::Headless(_) => (),
            #[cfg(windows)]
            Self::D3d11(bridge) => bridge.submission_mut().present_debug_swapchain(),
            #[cfg(windows)]
            Self::D3d12(bridge) => bridge.submission_mut().present_debug_swapchain(),
            #[cfg(windows)]
            Self::Vulkan(bridge) => bridge.submission_mut().present_debug_swapchain(),
            #[cfg(windows)]
            Self::OpenGl(bridge) => bridge.submission_mut().present_debug_swapchain(),
        }
    }

    /// Fills the application-facing image structs for
    /// `xrEnumerateSwapchainImages`.
    ///
    /// # Safety
    ///
    /// `images` must point at `count` structures of the graphics-binding's
    /// swapchain-image type.
    pub unsafe fn write_swapchain_images(
        &mut self,
        backend: &dyn crate::backend::Backend,
        swapchain: &mut Swapchain,
        images: *mut sys::SwapchainImageBaseHeader,
        count: u32,
    ) -> RuntimeResult<()> {
        match self {
            // Headless sessions have no application device to export into.
            Self::Headless(_) => {
                let _ = (backend, swapchain, images, count);

                Ok(())
            }
            #[cfg(windows)]
            Self::D3d11(bridge) => unsafe {
                bridge.write_swapchain_images(backend, swapchain, images, count)
            },
            #[cfg(windows)]
            Self::D3d12(bridge) => unsafe {
                bridge.write_swapchain_images(backend, swapchain, images, count)
            },
            #[cfg(windows)]
            Self::Vulkan(bridge) => unsafe {
                bridge.write_swapchain_images(backend, swapchain, images, count)
            },
            #[cfg(windows)]
            Self::OpenGl(bridge) => unsafe {
                bridge.write_swapchain_images(backend, swapchain, images, count)
            },
        }
    }

    /// The application acquired an image; D3D12 moves it into its
    /// attachment state here.
    pub fn notify_acquired(&mut self, swapchain: &Swapchain, index: u32) -> RuntimeResult<()> {
        match self {
            #[cfg(windows)]
            Self::D3d12(bridge) => bridge.transition_acquired(swapchain, index),
            _ => {
                let _ = (swapchain, index);

                Ok(())
            }
        }
    }

    /// The application released an image; D3D12 returns it to COMMON so the
    /// submission device can read it.
    pub fn notify_released(&mut self, swapchain: &Swapchain, index: u32) -> RuntimeResult<()> {
        match self {
            #[cfg(windows)]
            Self::D3d12(bridge) => bridge.transition_released(swapchain, index),
            _ => {
                let _ = (swapchain, index);

                Ok(())
            }
        }
    }

    /// Drops the bridge's imported per-swapchain resources, called before
    /// the backend rings die.
    pub fn forget_swapchain(&mut self, swapchain: &Swapchain) {
        match self {
            Self::Headless(_) => {
                let _ = swapchain;
            }
            #[cfg(windows)]
            Self::D3d11(bridge) => bridge.forget_swapchain(swapchain),
            #[cfg(windows)]
            Self::D3d12(bridge) => bridge.forget_swapchain(swapchain),
            #[cfg(windows)]
            Self::Vulkan(bridge) => bridge.forget_swapchain(swapchain),
            #[cfg(windows)]
            Self::OpenGl(bridge) => bridge.forget_swapchain(swapchain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn headless_bridge_counts_fence_values() {
        let mut bridge = Bridge::Headless(HeadlessBridge::default());

        assert_eq!(bridge.fence_value(), 0);
        bridge.serialize_app_frame().unwrap();
        bridge.flush_app_queue().unwrap();
        bridge.flush_submission().unwrap();
        assert_eq!(bridge.fence_value(), 3);
        assert_eq!(bridge.api(), GraphicsApi::Headless);
    }
}
