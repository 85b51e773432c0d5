//! D3D11 application bridge.
//!
//! The simplest of the four: the application device lives on the same
//! adapter as the submission device, so images cross over as shared
//! handles and the one shared fence is opened on both sides.

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
            Foundation::CloseHandle,
            Graphics::{
                Direct3D11::{
                    ID3D11Device, ID3D11Device5, ID3D11DeviceContext4, ID3D11Fence,
                    ID3D11Texture2D,
                },
                Dxgi::IDXGIDevice,
            },
            System::Threading::{CreateEventA, WaitForSingleObject, INFINITE},
        },
    },
};

/// Bridge for `XrGraphicsBindingD3D11KHR` sessions.
pub struct D3d11Bridge {
    submission: SubmissionDevice,

    app_device: ID3D11Device5,
    app_context: ID3D11DeviceContext4,

    /// The submission fence, opened on the application device.
    app_fence: ID3D11Fence,

    /// App-side opened textures, kept alive per swapchain.
    images: HashMap<u64, Vec<ID3D11Texture2D>>,
}

impl D3d11Bridge {
    /// Validates the binding against the headset adapter and opens the
    /// shared fence both ways.
    #[profiling::function]
    pub fn new(
        binding: &sys::GraphicsBindingD3D11KHR,
        hmd_info: &HmdInfo,
    ) -> RuntimeResult<Self> {
        if binding.device.is_null() {
            return Err(RuntimeError::GraphicsDeviceInvalid);
        }

        // Safety: the application promises a live ID3D11Device for the
        // session's lifetime; borrow and add our own reference.
        let device = unsafe {
            ID3D11Device::from_raw_borrowed(&(binding.device as *mut _))
        }
        .ok_or(RuntimeError::GraphicsDeviceInvalid)?
        .clone();

        // The device must sit on the headset's adapter.
        let dxgi: IDXGIDevice = device
            .cast()
            .map_err(|_| RuntimeError::GraphicsDeviceInvalid)?;
        let adapter = unsafe { dxgi.GetAdapter() }
            .map_err(|_| RuntimeError::GraphicsDeviceInvalid)?;
        let mut desc = Default::default();
        unsafe { adapter.GetDesc(&mut desc) }
            .map_err(|_| RuntimeError::GraphicsDeviceInvalid)?;

        if pack_luid(desc.AdapterLuid.LowPart, desc.AdapterLuid.HighPart) != hmd_info.adapter_luid
        {
            warn!("application D3D11 device is not on the headset adapter");

            return Err(RuntimeError::GraphicsDeviceInvalid);
        }

        // The fence-capable flavors.
        let app_device: ID3D11Device5 =
            device.cast().map_err(|_| RuntimeError::GraphicsDeviceInvalid)?;
        let mut context = None;
        unsafe { app_device.GetImmediateContext(&mut context) };
        let app_context: ID3D11DeviceContext4 = context
            .ok_or(RuntimeError::GraphicsDeviceInvalid)?
            .cast()
            .map_err(|_| RuntimeError::GraphicsDeviceInvalid)?;

        let submission = SubmissionDevice::new(hmd_info.adapter_luid, "D3D11")?;

        let app_fence: ID3D11Fence =
            unsafe { app_device.OpenSharedFence(submission.fence_handle) }
                .map_err(|_| RuntimeError::RuntimeFailure)?;

        Ok(Self {
            submission,
            app_device,
            app_context,
            app_fence,
            images: HashMap::new(),
        })
    }

    pub fn submission_mut(&mut self) -> &mut SubmissionDevice {
        &mut self.submission
    }

    pub fn fence_value(&self) -> u64 {
        self.submission.fence_value
    }

    /// Signal on the app immediate context, wait on the submission context.
    #[profiling::function]
    pub fn serialize_app_frame(&mut self) -> RuntimeResult<()> {
        self.submission.fence_value += 1;
        let value = self.submission.fence_value;

        unsafe {
            self.app_context
                .Signal(&self.app_fence, value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
            self.submission
                .context
                .Wait(&self.submission.fence, value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
        }

        Ok(())
    }

    /// Signal on the app context and block the host until it retires.
    pub fn flush_app_queue(&mut self) -> RuntimeResult<()> {
        self.submission.fence_value += 1;
        let value = self.submission.fence_value;

        unsafe {
            self.app_context
                .Signal(&self.app_fence, value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;

            if self.app_fence.GetCompletedValue() < value {
                let event = CreateEventA(None, false, false, None)
                    .map_err(|_| RuntimeError::RuntimeFailure)?;

                self.app_fence
                    .SetEventOnCompletion(value, event)
                    .map_err(|_| RuntimeError::RuntimeFailure)?;
                WaitForSingleObject(event, INFINITE);
                let _ = CloseHandle(event);
            }
        }

        Ok(())
    }

    /// Opens the swapchain's shared handles on the application device and
    /// fills `XrSwapchainImageD3D11KHR` entries.
    ///
    /// # Safety
    ///
    /// `images` must point at `count` `XrSwapchainImageD3D11KHR` structs.
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
                let texture: ID3D11Texture2D =
                    unsafe { self.app_device.OpenSharedResource1(handle) }
                        .map_err(|_| RuntimeError::RuntimeFailure)?;

                opened.push(texture);
            }

            self.images.insert(key, opened);
        }

        let opened = &self.images[&key];
        let out = unsafe {
            std::slice::from_raw_parts_mut(images as *mut sys::SwapchainImageD3D11KHR, count as usize)
        };

        for (entry, texture) in out.iter_mut().zip(opened) {
            if entry.ty != sys::StructureType::SWAPCHAIN_IMAGE_D3D11_KHR {
                return Err(RuntimeError::Validation);
            }

            entry.texture = texture.as_raw() as *mut _;
        }

        Ok(())
    }

    pub fn forget_swapchain(&mut self, swapchain: &Swapchain) {
        self.images.remove(&swapchain.primary_chain().0);
        self.submission.forget_swapchain(swapchain.primary_chain().0);
    }
}
