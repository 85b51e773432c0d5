//! Drives the runtime the way a loader and application would: negotiate,
//! resolve entry points, create the instance and walk the system queries.
//!
//! The process-wide instance slot makes this a single sequential journey
//! rather than independent tests.

use {
    openxr_sys as sys,
    parallax_openxr::entry::{
        xrGetInstanceProcAddr, xrNegotiateLoaderRuntimeInterface, NegotiateLoaderInfo,
        NegotiateRuntimeRequest,
    },
    std::ffi::CString,
    std::mem::transmute,
    std::ptr::{null, null_mut},
};

unsafe fn resolve<T: Copy>(name: &str) -> T {
    let name = CString::new(name).unwrap();
    let mut function = None;

    let result = unsafe { xrGetInstanceProcAddr(sys::Instance::NULL, name.as_ptr(), &mut function) };
    assert_eq!(result, sys::Result::SUCCESS, "{name:?}");

    let function = function.expect("resolved");

    // Function pointers all share one representation; this is exactly the
    // cast a loader performs on the table it receives.
    unsafe { std::mem::transmute_copy(&function) }
}

#[test]
fn loader_journey() {
    // Negotiate.
    let loader_info = NegotiateLoaderInfo {
        struct_type: 1,
        struct_version: 1,
        struct_size: std::mem::size_of::<NegotiateLoaderInfo>(),
        min_interface_version: 1,
        max_interface_version: 1,
        min_api_version: sys::Version::new(1, 0, 0),
        max_api_version: sys::Version::new(1, 0, u32::MAX),
    };
    let mut request = NegotiateRuntimeRequest {
        struct_type: 3,
        struct_version: 1,
        struct_size: std::mem::size_of::<NegotiateRuntimeRequest>(),
        runtime_interface_version: 0,
        runtime_api_version: sys::Version::new(0, 0, 0),
        get_instance_proc_addr: None,
    };
    assert_eq!(
        unsafe { xrNegotiateLoaderRuntimeInterface(&loader_info, &mut request) },
        sys::Result::SUCCESS
    );
    let get_proc = request.get_instance_proc_addr.expect("published");

    // Enumerate extensions through the published entry point.
    let enumerate: sys::pfn::EnumerateInstanceExtensionProperties = unsafe {
        let name = CString::new("xrEnumerateInstanceExtensionProperties").unwrap();
        let mut function = None;
        assert_eq!(
            get_proc(sys::Instance::NULL, name.as_ptr(), &mut function),
            sys::Result::SUCCESS
        );

        transmute(function.expect("resolved"))
    };

    let mut count = 0;
    assert_eq!(
        unsafe { enumerate(null(), 0, &mut count, null_mut()) },
        sys::Result::SUCCESS
    );
    assert!(count >= 5, "extension table looks too small: {count}");

    let mut properties = vec![
        sys::ExtensionProperties {
            ty: sys::StructureType::EXTENSION_PROPERTIES,
            next: null_mut(),
            extension_name: [0; sys::MAX_EXTENSION_NAME_SIZE],
            extension_version: 0,
        };
        count as usize
    ];
    assert_eq!(
        unsafe { enumerate(null(), count, &mut count, properties.as_mut_ptr()) },
        sys::Result::SUCCESS
    );

    let names = properties
        .iter()
        .map(|property| {
            unsafe { std::ffi::CStr::from_ptr(property.extension_name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect::<Vec<_>>();
    assert!(names.iter().any(|name| name == "XR_KHR_vulkan_enable"));
    assert!(names
        .iter()
        .any(|name| name == "XR_KHR_composition_layer_depth"));

    // Create the instance (mock backend; no vendor binding installed).
    let create_instance: sys::pfn::CreateInstance = unsafe { resolve("xrCreateInstance") };

    let vulkan_enable = CString::new("XR_KHR_vulkan_enable").unwrap();
    let depth = CString::new("XR_KHR_composition_layer_depth").unwrap();
    let extensions = [vulkan_enable.as_ptr(), depth.as_ptr()];

    let mut application_info = sys::ApplicationInfo {
        application_name: [0; sys::MAX_APPLICATION_NAME_SIZE],
        application_version: 1,
        engine_name: [0; sys::MAX_ENGINE_NAME_SIZE],
        engine_version: 0,
        api_version: sys::Version::new(1, 0, 34),
    };
    application_info.application_name[0] = b'l' as _;

    let create_info = sys::InstanceCreateInfo {
        ty: sys::StructureType::INSTANCE_CREATE_INFO,
        next: null(),
        create_flags: sys::InstanceCreateFlags::EMPTY,
        application_info,
        enabled_api_layer_count: 0,
        enabled_api_layer_names: null(),
        enabled_extension_count: extensions.len() as u32,
        enabled_extension_names: extensions.as_ptr(),
    };

    let mut instance = sys::Instance::NULL;
    assert_eq!(
        unsafe { create_instance(&create_info, &mut instance) },
        sys::Result::SUCCESS
    );
    assert_eq!(instance.into_raw(), 1);

    // A second instance is refused.
    let mut second = sys::Instance::NULL;
    assert_eq!(
        unsafe { create_instance(&create_info, &mut second) },
        sys::Result::ERROR_LIMIT_REACHED
    );

    // Instance properties carry a non-zero runtime version.
    let get_properties: sys::pfn::GetInstanceProperties =
        unsafe { resolve("xrGetInstanceProperties") };
    let mut properties = sys::InstanceProperties {
        ty: sys::StructureType::INSTANCE_PROPERTIES,
        next: null_mut(),
        runtime_version: sys::Version::new(0, 0, 0),
        runtime_name: [0; sys::MAX_RUNTIME_NAME_SIZE],
    };
    assert_eq!(
        unsafe { get_properties(instance, &mut properties) },
        sys::Result::SUCCESS
    );
    assert_ne!(properties.runtime_version.into_raw(), 0);

    // Path interning round-trips through the ABI.
    let string_to_path: sys::pfn::StringToPath = unsafe { resolve("xrStringToPath") };
    let path_to_string: sys::pfn::PathToString = unsafe { resolve("xrPathToString") };

    let left = CString::new("/user/hand/left").unwrap();
    let mut path = sys::Path::from_raw(0);
    assert_eq!(
        unsafe { string_to_path(instance, left.as_ptr(), &mut path) },
        sys::Result::SUCCESS
    );

    let mut same = sys::Path::from_raw(0);
    assert_eq!(
        unsafe { string_to_path(instance, left.as_ptr(), &mut same) },
        sys::Result::SUCCESS
    );
    assert_eq!(path, same);

    let mut length = 0;
    let mut buffer = [0i8; 64];
    assert_eq!(
        unsafe {
            path_to_string(
                instance,
                path,
                buffer.len() as u32,
                &mut length,
                buffer.as_mut_ptr() as *mut _,
            )
        },
        sys::Result::SUCCESS
    );
    assert_eq!(length as usize, "/user/hand/left".len() + 1);

    // System queries.
    let get_system: sys::pfn::GetSystem = unsafe { resolve("xrGetSystem") };
    let get_info = sys::SystemGetInfo {
        ty: sys::StructureType::SYSTEM_GET_INFO,
        next: null(),
        form_factor: sys::FormFactor::HEAD_MOUNTED_DISPLAY,
    };
    let mut system_id = sys::SystemId::from_raw(0);
    assert_eq!(
        unsafe { get_system(instance, &get_info, &mut system_id) },
        sys::Result::SUCCESS
    );

    // Session creation requires the graphics-requirements handshake first.
    let create_session: sys::pfn::CreateSession = unsafe { resolve("xrCreateSession") };
    let session_info = sys::SessionCreateInfo {
        ty: sys::StructureType::SESSION_CREATE_INFO,
        next: null(),
        create_flags: sys::SessionCreateFlags::EMPTY,
        system_id,
    };
    let mut session = sys::Session::NULL;
    assert_eq!(
        unsafe { create_session(instance, &session_info, &mut session) },
        sys::Result::ERROR_GRAPHICS_REQUIREMENTS_CALL_MISSING
    );

    let vulkan_requirements: sys::pfn::GetVulkanGraphicsRequirementsKHR =
        unsafe { resolve("xrGetVulkanGraphicsRequirementsKHR") };
    let mut requirements = sys::GraphicsRequirementsVulkanKHR {
        ty: sys::StructureType::GRAPHICS_REQUIREMENTS_VULKAN_KHR,
        next: null_mut(),
        min_api_version_supported: sys::Version::new(0, 0, 0),
        max_api_version_supported: sys::Version::new(0, 0, 0),
    };
    assert_eq!(
        unsafe { vulkan_requirements(instance, system_id, &mut requirements) },
        sys::Result::SUCCESS
    );
    assert_eq!(requirements.min_api_version_supported.major(), 1);

    // With no graphics binding in the chain the session is still refused,
    // but past the handshake gate now.
    assert_eq!(
        unsafe { create_session(instance, &session_info, &mut session) },
        sys::Result::ERROR_GRAPHICS_DEVICE_INVALID
    );

    // Tear down and confirm the singleton slot frees up.
    let destroy_instance: sys::pfn::DestroyInstance = unsafe { resolve("xrDestroyInstance") };
    assert_eq!(
        unsafe { destroy_instance(instance) },
        sys::Result::SUCCESS
    );

    let mut again = sys::Instance::NULL;
    assert_eq!(
        unsafe { create_instance(&create_info, &mut again) },
        sys::Result::SUCCESS
    );
    assert_eq!(
        unsafe { destroy_instance(again) },
        sys::Result::SUCCESS
    );
}
