//! System-scope queries: properties, view configurations, blend modes and
//! the graphics-requirements handshake.

use {
    crate::{
        error::{RuntimeError, RuntimeResult},
        instance::{write_c_string, Instance},
    },
    openxr_sys as sys,
};

/// Largest swapchain extent accepted by the submission device (feature
/// level 11.0 texture limit).
pub const MAX_SWAPCHAIN_EXTENT: u32 = 16384;

/// View configurations the compositor drives.
pub const VIEW_CONFIGURATIONS: [sys::ViewConfigurationType; 1] =
    [sys::ViewConfigurationType::PRIMARY_STEREO];

/// Blend modes the compositor supports.
pub const ENVIRONMENT_BLEND_MODES: [sys::EnvironmentBlendMode; 1] =
    [sys::EnvironmentBlendMode::OPAQUE];

impl Instance {
    /// `xrGetSystemProperties`.
    pub fn system_properties(
        &self,
        system_id: sys::SystemId,
    ) -> RuntimeResult<sys::SystemProperties> {
        self.check_system(system_id)?;

        let info = self.hmd_info()?;

        let mut properties = sys::SystemProperties {
            ty: sys::StructureType::SYSTEM_PROPERTIES,
            next: std::ptr::null_mut(),
            system_id,
            vendor_id: info.vendor_id,
            system_name: [0; sys::MAX_SYSTEM_NAME_SIZE],
            graphics_properties: sys::SystemGraphicsProperties {
                max_swapchain_image_height: MAX_SWAPCHAIN_EXTENT,
                max_swapchain_image_width: MAX_SWAPCHAIN_EXTENT,
                max_layer_count: self.backend.max_layer_count(),
            },
            tracking_properties: sys::SystemTrackingProperties {
                orientation_tracking: true.into(),
                position_tracking: true.into(),
            },
        };
        write_c_string(&mut properties.system_name, &info.product_name);

        Ok(properties)
    }

    /// `xrEnumerateViewConfigurations`.
    pub fn view_configurations(
        &self,
        system_id: sys::SystemId,
    ) -> RuntimeResult<&'static [sys::ViewConfigurationType]> {
        self.check_system(system_id)?;

        Ok(&VIEW_CONFIGURATIONS)
    }

    /// `xrGetViewConfigurationProperties`.
    pub fn view_configuration_properties(
        &self,
        system_id: sys::SystemId,
        ty: sys::ViewConfigurationType,
    ) -> RuntimeResult<sys::ViewConfigurationProperties> {
        self.check_system(system_id)?;

        if ty != sys::ViewConfigurationType::PRIMARY_STEREO {
            return Err(RuntimeError::ViewConfigurationUnsupported);
        }

        Ok(sys::ViewConfigurationProperties {
            ty: sys::StructureType::VIEW_CONFIGURATION_PROPERTIES,
            next: std::ptr::null_mut(),
            view_configuration_type: ty,
            fov_mutable: false.into(),
        })
    }

    /// `xrEnumerateViewConfigurationViews`: one entry per eye.
    pub fn view_configuration_views(
        &self,
        system_id: sys::SystemId,
        ty: sys::ViewConfigurationType,
    ) -> RuntimeResult<[sys::ViewConfigurationView; 2]> {
        self.check_system(system_id)?;

        if ty != sys::ViewConfigurationType::PRIMARY_STEREO {
            return Err(RuntimeError::ViewConfigurationUnsupported);
        }

        let info = self.hmd_info()?;
        let view = |eye: usize| sys::ViewConfigurationView {
            ty: sys::StructureType::VIEW_CONFIGURATION_VIEW,
            next: std::ptr::null_mut(),
            recommended_image_rect_width: info.eyes[eye].recommended_width,
            max_image_rect_width: MAX_SWAPCHAIN_EXTENT,
            recommended_image_rect_height: info.eyes[eye].recommended_height,
            max_image_rect_height: MAX_SWAPCHAIN_EXTENT,
            recommended_swapchain_sample_count: 1,
            max_swapchain_sample_count: 4,
        };

        Ok([view(0), view(1)])
    }

    /// `xrEnumerateEnvironmentBlendModes`.
    pub fn environment_blend_modes(
        &self,
        system_id: sys::SystemId,
        ty: sys::ViewConfigurationType,
    ) -> RuntimeResult<&'static [sys::EnvironmentBlendMode]> {
        self.check_system(system_id)?;

        if ty != sys::ViewConfigurationType::PRIMARY_STEREO {
            return Err(RuntimeError::ViewConfigurationUnsupported);
        }

        Ok(&ENVIRONMENT_BLEND_MODES)
    }

    /// Shared body of the `xrGet*GraphicsRequirements*` calls: caches the
    /// headset description and records that the handshake happened. Returns
    /// the adapter LUID the application must create its device on.
    pub fn graphics_requirements(&self, system_id: sys::SystemId) -> RuntimeResult<u64> {
        self.check_system(system_id)?;

        let info = self.hmd_info()?;
        self.mark_graphics_requirement_queried();

        Ok(info.adapter_luid)
    }

    /// `xrGetVulkanGraphicsDeviceKHR`: the physical device whose LUID
    /// matches the headset adapter.
    pub fn vulkan_graphics_device(
        &self,
        system_id: sys::SystemId,
        vk_instance: u64,
    ) -> RuntimeResult<u64> {
        use ash::vk::{self, Handle};

        let luid = self.graphics_requirements(system_id)?;

        let entry = unsafe { ash::Entry::load() }.map_err(|_| RuntimeError::RuntimeFailure)?;
        let instance = unsafe {
            ash::Instance::load(entry.static_fn(), vk::Instance::from_raw(vk_instance))
        };

        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|_| RuntimeError::RuntimeFailure)?;

        for device in devices {
            let mut id_properties = vk::PhysicalDeviceIDProperties::default();
            let mut properties =
                vk::PhysicalDeviceProperties2::default().push_next(&mut id_properties);
            unsafe {
                instance.get_physical_device_properties2(device, &mut properties);
            }

            if id_properties.device_luid_valid == vk::TRUE
                && u64::from_le_bytes(id_properties.device_luid) == luid
            {
                return Ok(device.as_raw());
            }
        }

        Err(RuntimeError::RuntimeFailure)
    }
}

/// Vulkan instance extensions the application must enable
/// (`xrGetVulkanInstanceExtensionsKHR`).
pub const VULKAN_INSTANCE_EXTENSIONS: &str =
    "VK_KHR_external_memory_capabilities VK_KHR_get_physical_device_properties2";

/// Vulkan device extensions the application must enable
/// (`xrGetVulkanDeviceExtensionsKHR`).
pub const VULKAN_DEVICE_EXTENSIONS: &str = "VK_KHR_external_memory \
     VK_KHR_external_memory_win32 VK_KHR_external_semaphore \
     VK_KHR_external_semaphore_win32 VK_KHR_timeline_semaphore \
     VK_KHR_dedicated_allocation VK_KHR_get_memory_requirements2 \
     VK_KHR_bind_memory2";

#[cfg(test)]
mod tests {
    use {super::*, crate::instance::tests::test_instance};

    #[test]
    pub fn system_properties_carry_hmd_identity() {
        let instance = test_instance();
        let system = instance
            .get_system(sys::FormFactor::HEAD_MOUNTED_DISPLAY)
            .unwrap();

        let properties = instance.system_properties(system).unwrap();

        assert_eq!(properties.vendor_id, 0x2833);
        assert_eq!(properties.graphics_properties.max_layer_count, 16);
    }

    #[test]
    pub fn queries_before_get_system_fail() {
        let instance = test_instance();

        assert_eq!(
            instance
                .system_properties(sys::SystemId::from_raw(1))
                .err(),
            Some(RuntimeError::SystemInvalid)
        );
    }

    #[test]
    pub fn only_primary_stereo_exists() {
        let instance = test_instance();
        let system = instance
            .get_system(sys::FormFactor::HEAD_MOUNTED_DISPLAY)
            .unwrap();

        assert_eq!(
            instance
                .view_configuration_properties(
                    system,
                    sys::ViewConfigurationType::PRIMARY_MONO
                )
                .err(),
            Some(RuntimeError::ViewConfigurationUnsupported)
        );

        let views = instance
            .view_configuration_views(system, sys::ViewConfigurationType::PRIMARY_STEREO)
            .unwrap();

        assert_eq!(views[0].recommended_image_rect_width, 1024);
    }

    #[test]
    pub fn graphics_requirements_arm_session_creation() {
        let instance = test_instance();
        let system = instance
            .get_system(sys::FormFactor::HEAD_MOUNTED_DISPLAY)
            .unwrap();

        assert!(!instance.graphics_requirement_queried());

        let luid = instance.graphics_requirements(system).unwrap();

        assert_ne!(luid, 0);
        assert!(instance.graphics_requirement_queried());
    }
}
