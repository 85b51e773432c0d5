//! D3D12 application bridge.
//!
//! D3D12 shares the adapter with the submission device but needs two things
//! D3D11 does not: a fence created 12-side (then opened as an 11-fence on
//! the submission device), and explicit resource-state management around
//! acquire and release, batched through one reusable command list. The list
//! has a single slot, so the bridge host-flushes before reusing it.

use {
    super::submission::{pack_luid, SubmissionDevice},
    crate::{
        backend::{Backend, HmdInfo},
        error::{RuntimeError, RuntimeResult},
        swapchain::Swapchain,
    },
    log::warn,
    openxr_sys as sys,
    std::collections::HashMap,
    windows::{
        core::Interface,
        Win32::{
            Foundation::{CloseHandle, GENERIC_ALL},
            Graphics::Direct3D12::{
                ID3D12CommandAllocator, ID3D12CommandList, ID3D12CommandQueue, ID3D12Device,
                ID3D12Fence, ID3D12GraphicsCommandList, ID3D12Resource,
                D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_FENCE_FLAG_SHARED,
                D3D12_RESOURCE_BARRIER, D3D12_RESOURCE_BARRIER_0,
                D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES, D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
                D3D12_RESOURCE_STATES, D3D12_RESOURCE_STATE_COMMON,
                D3D12_RESOURCE_STATE_DEPTH_WRITE, D3D12_RESOURCE_STATE_RENDER_TARGET,
                D3D12_RESOURCE_TRANSITION_BARRIER,
            },
            System::Threading::{CreateEventA, WaitForSingleObject, INFINITE},
        },
    },
};

/// Bridge for `XrGraphicsBindingD3D12KHR` sessions.
pub struct D3d12Bridge {
    submission: SubmissionDevice,

    device: ID3D12Device,
    queue: ID3D12CommandQueue,

    /// Shared fence created on the 12 device.
    fence: ID3D12Fence,

    /// The same fence, opened on the submission device.
    fence_on_submission:
        windows::Win32::Graphics::Direct3D11::ID3D11Fence,

    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,

    /// Fence value of the last barrier batch; the single-slot list cannot
    /// be reset before it retires.
    last_barrier_value: u64,

    /// App-side opened resources per swapchain.
    images: HashMap<u64, Vec<ID3D12Resource>>,
}

impl D3d12Bridge {
    #[profiling::function]
    pub fn new(
        binding: &sys::GraphicsBindingD3D12KHR,
        hmd_info: &HmdInfo,
    ) -> RuntimeResult<Self> {
        if binding.device.is_null() || binding.queue.is_null() {
            return Err(RuntimeError::GraphicsDeviceInvalid);
        }

        // Safety: the application promises live COM pointers for the
        // session's lifetime; borrow and add our own references.
        let device = unsafe { ID3D12Device::from_raw_borrowed(&(binding.device as *mut _)) }
            .ok_or(RuntimeError::GraphicsDeviceInvalid)?
            .clone();
        let queue = unsafe { ID3D12CommandQueue::from_raw_borrowed(&(binding.queue as *mut _)) }
            .ok_or(RuntimeError::GraphicsDeviceInvalid)?
            .clone();

        let luid = unsafe { device.GetAdapterLuid() };
        if pack_luid(luid.LowPart, luid.HighPart) != hmd_info.adapter_luid {
            warn!("application D3D12 device is not on the headset adapter");

            return Err(RuntimeError::GraphicsDeviceInvalid);
        }

        let submission = SubmissionDevice::new(hmd_info.adapter_luid, "D3D12")?;

        // The serialize fence originates 12-side and crosses into D3D11.
        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_SHARED) }
            .map_err(|_| RuntimeError::RuntimeFailure)?;
        let fence_handle = unsafe { device.CreateSharedHandle(&fence, None, GENERIC_ALL.0, None) }
            .map_err(|_| RuntimeError::RuntimeFailure)?;
        let fence_on_submission = unsafe { submission.device.OpenSharedFence(fence_handle) }
            .map_err(|_| RuntimeError::RuntimeFailure)?;
        unsafe {
            let _ = CloseHandle(fence_handle);
        }

        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                .map_err(|_| RuntimeError::RuntimeFailure)?;
        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
        }
        .map_err(|_| RuntimeError::RuntimeFailure)?;
        // Created open; close so the first batch can reset it.
        unsafe { list.Close() }.map_err(|_| RuntimeError::RuntimeFailure)?;

        Ok(Self {
            submission,
            device,
            queue,
            fence,
            fence_on_submission,
            allocator,
            list,
            last_barrier_value: 0,
            images: HashMap::new(),
        })
    }

    pub fn submission_mut(&mut self) -> &mut SubmissionDevice {
        &mut self.submission
    }

    pub fn fence_value(&self) -> u64 {
        self.submission.fence_value
    }

    fn host_wait_app(&self, value: u64) -> RuntimeResult<()> {
        if unsafe { self.fence.GetCompletedValue() } >= value {
            return Ok(());
        }

        let event = unsafe { CreateEventA(None, false, false, None) }
            .map_err(|_| RuntimeError::RuntimeFailure)?;

        unsafe {
            self.fence
                .SetEventOnCompletion(value, event)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
            WaitForSingleObject(event, INFINITE);
            let _ = CloseHandle(event);
        }

        Ok(())
    }

    /// Signal on the app queue, wait on the submission context.
    #[profiling::function]
    pub fn serialize_app_frame(&mut self) -> RuntimeResult<()> {
        self.submission.fence_value += 1;
        let value = self.submission.fence_value;

        unsafe {
            self.queue
                .Signal(&self.fence, value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
            self.submission
                .context
                .Wait(&self.fence_on_submission, value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
        }

        Ok(())
    }

    /// Signal on the app queue and block the host until it retires.
    pub fn flush_app_queue(&mut self) -> RuntimeResult<()> {
        self.submission.fence_value += 1;
        let value = self.submission.fence_value;

        unsafe {
            self.queue
                .Signal(&self.fence, value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
        }

        self.host_wait_app(value)
    }

    fn attachment_state(swapchain: &Swapchain) -> D3D12_RESOURCE_STATES {
        if swapchain.submission_format.is_depth() || swapchain.need_depth_resolve {
            D3D12_RESOURCE_STATE_DEPTH_WRITE
        } else {
            D3D12_RESOURCE_STATE_RENDER_TARGET
        }
    }

    /// Records and submits one transition batch through the single-slot
    /// list.
    fn transition(
        &mut self,
        swapchain: &Swapchain,
        index: u32,
        before: D3D12_RESOURCE_STATES,
        after: D3D12_RESOURCE_STATES,
    ) -> RuntimeResult<()> {
        let Some(resources) = self.images.get(&swapchain.primary_chain().0) else {
            // The application never enumerated the images; nothing to move.
            return Ok(());
        };
        let Some(resource) = resources.get(index as usize) else {
            return Ok(());
        };

        // Single-slot command list: the previous batch must retire first.
        self.host_wait_app(self.last_barrier_value)?;

        unsafe {
            self.allocator
                .Reset()
                .map_err(|_| RuntimeError::RuntimeFailure)?;
            self.list
                .Reset(&self.allocator, None)
                .map_err(|_| RuntimeError::RuntimeFailure)?;

            let barrier = D3D12_RESOURCE_BARRIER {
                Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
                Anonymous: D3D12_RESOURCE_BARRIER_0 {
                    Transition: std::mem::ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                        pResource: std::mem::ManuallyDrop::new(Some(resource.clone())),
                        Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                        StateBefore: before,
                        StateAfter: after,
                    }),
                },
                ..Default::default()
            };
            self.list.ResourceBarrier(&[barrier]);

            self.list.Close().map_err(|_| RuntimeError::RuntimeFailure)?;

            let list: ID3D12CommandList =
                self.list.cast().map_err(|_| RuntimeError::RuntimeFailure)?;
            self.queue.ExecuteCommandLists(&[Some(list)]);

            self.submission.fence_value += 1;
            self.last_barrier_value = self.submission.fence_value;
            self.queue
                .Signal(&self.fence, self.last_barrier_value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
        }

        Ok(())
    }

    /// COMMON -> attachment state on acquire.
    pub fn transition_acquired(&mut self, swapchain: &Swapchain, index: u32) -> RuntimeResult<()> {
        self.transition(
            swapchain,
            index,
            D3D12_RESOURCE_STATE_COMMON,
            Self::attachment_state(swapchain),
        )
    }

    /// Attachment state -> COMMON on release, so the submission device can
    /// read the image.
    pub fn transition_released(&mut self, swapchain: &Swapchain, index: u32) -> RuntimeResult<()> {
        self.transition(
            swapchain,
            index,
            Self::attachment_state(swapchain),
            D3D12_RESOURCE_STATE_COMMON,
        )
    }

    /// Opens the swapchain's shared handles on the 12 device and fills
    /// `XrSwapchainImageD3D12KHR` entries.
    ///
    /// # Safety
    ///
    /// `images` must point at `count` `XrSwapchainImageD3D12KHR` structs.
    pub unsafe fn write_swapchain_images(
        &mut self,
        backend: &dyn Backend,
        swapchain: &mut Swapchain,
        images: *mut sys::SwapchainImageBaseHeader,
        count: u32,
    ) -> RuntimeResult<()> {
        let key = swapchain.primary_chain().0;

        if !self.images.contains_key(&key) {
            let handles = self.submission.export_handles(backend, swapchain)?;
            let mut opened = Vec::with_capacity(handles.len());

            for handle in handles {
                let mut resource: Option<ID3D12Resource> = None;
                unsafe { self.device.OpenSharedHandle(handle, &mut resource) }
                    .map_err(|_| RuntimeError::RuntimeFailure)?;

                opened.push(resource.ok_or(RuntimeError::RuntimeFailure)?);
            }

            self.images.insert(key, opened);
        }

        let opened = &self.images[&key];
        let out = unsafe {
            std::slice::from_raw_parts_mut(images as *mut sys::SwapchainImageD3D12KHR, count as usize)
        };

        for (entry, resource) in out.iter_mut().zip(opened) {
            if entry.ty != sys::StructureType::SWAPCHAIN_IMAGE_D3D12_KHR {
                return Err(RuntimeError::Validation);
            }

            entry.texture = resource.as_raw() as *mut _;
        }

        Ok(())
    }

    pub fn forget_swapchain(&mut self, swapchain: &Swapchain) {
        self.images.remove(&swapchain.primary_chain().0);
        self.submission.forget_swapchain(swapchain.primary_chain().0);
    }
}
