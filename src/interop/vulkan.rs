//! Vulkan application bridge.
//!
//! The submission fence crosses into Vulkan as an imported timeline
//! semaphore; swapchain images cross as dedicated memory imports of the
//! shared texture handles. A separate, non-imported timeline semaphore
//! backs host-side flushes: signaling and waiting the imported semaphore
//! from the same queue trips some drivers.

use {
    super::submission::SubmissionDevice,
    crate::{
        backend::{Backend, HmdInfo},
        error::{RuntimeError, RuntimeResult},
        swapchain::Swapchain,
    },
    ash::{khr, vk},
    log::warn,
    openxr_sys as sys,
    std::collections::HashMap,
};

struct ImportedImages {
    images: Vec<vk::Image>,
    memory: Vec<vk::DeviceMemory>,
}

/// Bridge for `XrGraphicsBindingVulkanKHR` sessions.
pub struct VulkanBridge {
    submission: SubmissionDevice,

    /// Keeps the loaded library (and with it every function pointer)
    /// alive.
    #[allow(dead_code)]
    entry: ash::Entry,
    device: ash::Device,
    queue: vk::Queue,

    external_memory: khr::external_memory_win32::Device,

    /// The shared fence, imported as a timeline semaphore.
    timeline: vk::Semaphore,

    /// Runtime-private timeline used for host flushes.
    flush_timeline: vk::Semaphore,
    flush_value: u64,

    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,

    images: HashMap<u64, ImportedImages>,
}

fn vkerr(what: &str) -> impl FnOnce(vk::Result) -> RuntimeError + '_ {
    move |err| {
        warn!("{what}: {err}");

        RuntimeError::RuntimeFailure
    }
}

impl VulkanBridge {
    #[profiling::function]
    pub fn new(
        binding: &sys::GraphicsBindingVulkanKHR,
        hmd_info: &HmdInfo,
    ) -> RuntimeResult<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|err| {
            warn!("Vulkan loader: {err}");

            RuntimeError::RuntimeFailure
        })?;

        let raw_instance = vk::Instance::from_raw(binding.instance as usize as u64);
        let raw_device = vk::Device::from_raw(binding.device as usize as u64);
        let physical_device = vk::PhysicalDevice::from_raw(binding.physical_device as usize as u64);

        if raw_instance == vk::Instance::null() || raw_device == vk::Device::null() {
            return Err(RuntimeError::GraphicsDeviceInvalid);
        }

        let instance = unsafe { ash::Instance::load(entry.static_fn(), raw_instance) };

        // The physical device must expose a LUID and it must match.
        let mut id_properties = vk::PhysicalDeviceIDProperties::default();
        let mut properties =
            vk::PhysicalDeviceProperties2::default().push_next(&mut id_properties);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut properties);
        }

        let luid = u64::from_le_bytes(id_properties.device_luid);
        if id_properties.device_luid_valid == vk::FALSE || luid != hmd_info.adapter_luid {
            warn!("application Vulkan device is not on the headset adapter");

            return Err(RuntimeError::GraphicsDeviceInvalid);
        }

        let device = unsafe { ash::Device::load(instance.fp_v1_0(), raw_device) };
        let queue = unsafe {
            device.get_device_queue(binding.queue_family_index, binding.queue_index)
        };

        let submission = SubmissionDevice::new(hmd_info.adapter_luid, "Vulkan")?;

        let external_semaphore = khr::external_semaphore_win32::Device::new(&instance, &device);
        let external_memory = khr::external_memory_win32::Device::new(&instance, &device);

        let mut timeline_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);

        let timeline = unsafe {
            device.create_semaphore(
                &vk::SemaphoreCreateInfo::default().push_next(&mut timeline_info),
                None,
            )
        }
        .map_err(vkerr("create timeline semaphore"))?;

        // D3D11 and D3D12 fences share one external handle type.
        let import_info = vk::ImportSemaphoreWin32HandleInfoKHR::default()
            .semaphore(timeline)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::D3D12_FENCE)
            .handle(submission.fence_handle.0);
        unsafe { external_semaphore.import_semaphore_win32_handle(&import_info) }
            .map_err(vkerr("import shared fence"))?;

        let mut flush_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let flush_timeline = unsafe {
            device.create_semaphore(
                &vk::SemaphoreCreateInfo::default().push_next(&mut flush_info),
                None,
            )
        }
        .map_err(vkerr("create flush semaphore"))?;

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(binding.queue_family_index),
                None,
            )
        }
        .map_err(vkerr("create command pool"))?;

        let command_buffer = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        }
        .map_err(vkerr("allocate command buffer"))?[0];

        Ok(Self {
            submission,
            entry,
            device,
            queue,
            external_memory,
            timeline,
            flush_timeline,
            flush_value: 0,
            command_pool,
            command_buffer,
            images: HashMap::new(),
        })
    }

    pub fn submission_mut(&mut self) -> &mut SubmissionDevice {
        &mut self.submission
    }

    pub fn fence_value(&self) -> u64 {
        self.submission.fence_value
    }

    /// Signal the imported timeline on the app queue, wait on the
    /// submission context.
    #[profiling::function]
    pub fn serialize_app_frame(&mut self) -> RuntimeResult<()> {
        self.submission.fence_value += 1;
        let value = self.submission.fence_value;

        let values = [value];
        let semaphores = [self.timeline];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit], vk::Fence::null())
        }
        .map_err(vkerr("queue_submit"))?;

        unsafe {
            self.submission
                .context
                .Wait(&self.submission.fence, value)
                .map_err(|_| RuntimeError::RuntimeFailure)?;
        }

        Ok(())
    }

    /// Drains the app queue through the private flush timeline.
    pub fn flush_app_queue(&mut self) -> RuntimeResult<()> {
        self.flush_value += 1;
        let value = self.flush_value;

        let values = [value];
        let semaphores = [self.flush_timeline];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit], vk::Fence::null())
        }
        .map_err(vkerr("queue_submit"))?;

        let wait = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        unsafe { self.device.wait_semaphores(&wait, u64::MAX) }
            .map_err(vkerr("wait_semaphores"))?;

        Ok(())
    }

    fn xr_usage_to_vk(usage: sys::SwapchainUsageFlags, depth: bool) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;

        if usage.into_raw() & sys::SwapchainUsageFlags::COLOR_ATTACHMENT.into_raw() != 0 {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if depth
            || usage.into_raw() & sys::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT.into_raw()
                != 0
        {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if usage.into_raw() & sys::SwapchainUsageFlags::SAMPLED.into_raw() != 0 {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if usage.into_raw() & sys::SwapchainUsageFlags::UNORDERED_ACCESS.into_raw() != 0 {
            flags |= vk::ImageUsageFlags::STORAGE;
        }

        flags
    }

    /// Imports one shared texture as a dedicated allocation bound to a new
    /// image.
    fn import_image(
        &self,
        swapchain: &Swapchain,
        handle: windows::Win32::Foundation::HANDLE,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> RuntimeResult<(vk::Image, vk::DeviceMemory)> {
        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::D3D11_TEXTURE);

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: swapchain.info.width,
                height: swapchain.info.height,
                depth: 1,
            })
            .mip_levels(swapchain.info.mip_count)
            .array_layers(swapchain.info.array_size)
            .samples(vk::SampleCountFlags::from_raw(swapchain.info.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_info);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(vkerr("create_image"))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let handle_properties = unsafe {
            self.external_memory.get_memory_win32_handle_properties(
                vk::ExternalMemoryHandleTypeFlags::D3D11_TEXTURE,
                handle.0,
            )
        }
        .map_err(vkerr("get_memory_win32_handle_properties"))?;

        let memory_type_bits =
            requirements.memory_type_bits & handle_properties.memory_type_bits;
        let memory_type_index = memory_type_bits.trailing_zeros();

        if memory_type_index >= vk::MAX_MEMORY_TYPES as u32 {
            return Err(RuntimeError::RuntimeFailure);
        }

        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let mut import_info = vk::ImportMemoryWin32HandleInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::D3D11_TEXTURE)
            .handle(handle.0);
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut dedicated)
            .push_next(&mut import_info);

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }
            .map_err(vkerr("allocate_memory"))?;

        unsafe { self.device.bind_image_memory(image, memory, 0) }
            .map_err(vkerr("bind_image_memory"))?;

        Ok((image, memory))
    }

    /// Moves freshly-imported images out of UNDEFINED into their attachment
    /// layout.
    fn transition_initial_layouts(
        &mut self,
        images: &[vk::Image],
        swapchain: &Swapchain,
    ) -> RuntimeResult<()> {
        let depth = swapchain.submission_format.is_depth() || swapchain.need_depth_resolve;
        let (layout, aspect) = if depth {
            (
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::ImageAspectFlags::DEPTH,
            )
        } else {
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageAspectFlags::COLOR,
            )
        };

        unsafe {
            self.device
                .begin_command_buffer(
                    self.command_buffer,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(vkerr("begin_command_buffer"))?;

            let barriers = images
                .iter()
                .map(|image| {
                    vk::ImageMemoryBarrier::default()
                        .src_access_mask(vk::AccessFlags::empty())
                        .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(layout)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(*image)
                        .subresource_range(
                            vk::ImageSubresourceRange::default()
                                .aspect_mask(aspect)
                                .base_mip_level(0)
                                .level_count(vk::REMAINING_MIP_LEVELS)
                                .base_array_layer(0)
                                .layer_count(vk::REMAINING_ARRAY_LAYERS),
                        )
                })
                .collect::<Vec<_>>();

            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );

            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(vkerr("end_command_buffer"))?;

            let buffers = [self.command_buffer];
            let submit = vk::SubmitInfo::default().command_buffers(&buffers);
            self.device
                .queue_submit(self.queue, &[submit], vk::Fence::null())
                .map_err(vkerr("queue_submit"))?;
        }

        self.flush_app_queue()
    }

    /// Imports the swapchain's shared handles as Vulkan images and fills
    /// `XrSwapchainImageVulkanKHR` entries.
    ///
    /// # Safety
    ///
    /// `images` must point at `count` `XrSwapchainImageVulkanKHR` structs.
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
            let format = vk::Format::from_raw(
                i32::try_from(swapchain.info.format).map_err(|_| RuntimeError::Validation)?,
            );
            let usage = Self::xr_usage_to_vk(
                swapchain.info.usage_flags,
                swapchain.need_depth_resolve,
            );

            let mut imported = ImportedImages {
                images: Vec::with_capacity(handles.len()),
                memory: Vec::with_capacity(handles.len()),
            };

            for handle in handles {
                let (image, memory) = self.import_image(swapchain, handle, format, usage)?;

                imported.images.push(image);
                imported.memory.push(memory);
            }

            let image_list = imported.images.clone();
            self.images.insert(key, imported);
            self.transition_initial_layouts(&image_list, swapchain)?;
        }

        let imported = &self.images[&key];
        let out = unsafe {
            std::slice::from_raw_parts_mut(
                images as *mut sys::SwapchainImageVulkanKHR,
                count as usize,
            )
        };

        for (entry, image) in out.iter_mut().zip(&imported.images) {
            if entry.ty != sys::StructureType::SWAPCHAIN_IMAGE_VULKAN_KHR {
                return Err(RuntimeError::Validation);
            }

            entry.image = image.as_raw();
        }

        Ok(())
    }

    pub fn forget_swapchain(&mut self, swapchain: &Swapchain) {
        if let Some(imported) = self.images.remove(&swapchain.primary_chain().0) {
            unsafe {
                for image in imported.images {
                    self.device.destroy_image(image, None);
                }
                for memory in imported.memory {
                    self.device.free_memory(memory, None);
                }
            }
        }

        self.submission.forget_swapchain(swapchain.primary_chain().0);
    }
}

impl Drop for VulkanBridge {
    fn drop(&mut self) {
        unsafe {
            for imported in self.images.values() {
                for image in &imported.images {
                    self.device.destroy_image(*image, None);
                }
                for memory in &imported.memory {
                    self.device.free_memory(*memory, None);
                }
            }

            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_semaphore(self.timeline, None);
            self.device.destroy_semaphore(self.flush_timeline, None);
        }
    }
}
