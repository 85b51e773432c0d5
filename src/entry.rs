//! Loader negotiation and the C ABI surface.
//!
//! The shared library exports a single symbol,
//! `xrNegotiateLoaderRuntimeInterface`; everything else is reached through
//! the function table `xrGetInstanceProcAddr` hands out. The process-wide
//! instance slot lives here, as does the factory hook a vendor backend
//! binding uses to install itself (tests and the headless mode fall back to
//! the mock backend).

use {
    crate::{
        backend::{mock::MockHmd, Backend},
        error::{to_xr, RuntimeError},
        instance::{self, write_c_string, Event, Instance, EXTENSION_TABLE},
        logging,
        session::{Session, WaitFrameOutcome, REFERENCE_SPACES},
        system,
    },
    log::{debug, error},
    openxr_sys as sys,
    parking_lot::RwLock,
    std::{
        ffi::{c_char, c_void, CStr},
        sync::Arc,
    },
};

/// The one loader interface version this runtime speaks.
const LOADER_INTERFACE_VERSION: u32 = 1;

/// API version reported to the loader and `xrGetInstanceProperties`.
const API_VERSION: sys::Version = sys::Version::new(1, 0, 34);

/// `XrLoaderInterfaceStructs` values from the loader ABI.
const LOADER_STRUCT_LOADER_INFO: i32 = 1;
const LOADER_STRUCT_RUNTIME_REQUEST: i32 = 3;

/// `XrNegotiateLoaderInfo`, declared here because the loader-negotiation
/// header is not part of the core ABI bindings.
#[repr(C)]
pub struct NegotiateLoaderInfo {
    pub struct_type: i32,
    pub struct_version: u32,
    pub struct_size: usize,
    pub min_interface_version: u32,
    pub max_interface_version: u32,
    pub min_api_version: sys::Version,
    pub max_api_version: sys::Version,
}

/// `XrNegotiateRuntimeRequest`.
#[repr(C)]
pub struct NegotiateRuntimeRequest {
    pub struct_type: i32,
    pub struct_version: u32,
    pub struct_size: usize,
    pub runtime_interface_version: u32,
    pub runtime_api_version: sys::Version,
    pub get_instance_proc_addr: Option<sys::pfn::GetInstanceProcAddr>,
}

/// Builds the backend the next instance talks to.
pub type BackendFactory = fn() -> Arc<dyn Backend>;

static BACKEND_FACTORY: RwLock<Option<BackendFactory>> = RwLock::new(None);

/// The process-wide instance slot; at most one instance exists.
static RUNTIME: RwLock<Option<Arc<Instance>>> = RwLock::new(None);

/// Installs the vendor backend binding. Call before the application creates
/// its instance; without a factory the deterministic mock backend is used.
pub fn set_backend_factory(factory: BackendFactory) {
    *BACKEND_FACTORY.write() = Some(factory);
}

fn create_backend() -> Arc<dyn Backend> {
    match *BACKEND_FACTORY.read() {
        Some(factory) => factory(),
        None => Arc::new(MockHmd::default()),
    }
}

/// The negotiation export. Validates the loader's interface and API version
/// windows and publishes the dispatch entry point.
///
/// # Safety
///
/// Called by the OpenXR loader with valid, writable structures.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn xrNegotiateLoaderRuntimeInterface(
    loader_info: *const NegotiateLoaderInfo,
    runtime_request: *mut NegotiateRuntimeRequest,
) -> sys::Result {
    logging::init();

    if loader_info.is_null() || runtime_request.is_null() {
        return sys::Result::ERROR_INITIALIZATION_FAILED;
    }

    let info = unsafe { &*loader_info };
    let request = unsafe { &mut *runtime_request };

    if info.struct_type != LOADER_STRUCT_LOADER_INFO
        || info.struct_version != 1
        || info.struct_size != std::mem::size_of::<NegotiateLoaderInfo>()
        || request.struct_type != LOADER_STRUCT_RUNTIME_REQUEST
        || request.struct_version != 1
        || request.struct_size != std::mem::size_of::<NegotiateRuntimeRequest>()
    {
        error!("loader negotiation: malformed structures");

        return sys::Result::ERROR_INITIALIZATION_FAILED;
    }

    if info.min_interface_version > LOADER_INTERFACE_VERSION
        || info.max_interface_version < LOADER_INTERFACE_VERSION
    {
        error!(
            "loader negotiation: interface window {}..{} excludes {LOADER_INTERFACE_VERSION}",
            info.min_interface_version, info.max_interface_version
        );

        return sys::Result::ERROR_INITIALIZATION_FAILED;
    }

    let min = info.min_api_version;
    let max = info.max_api_version;
    if (min.major(), min.minor()) > (1, 0) || (max.major(), max.minor()) < (1, 0) {
        error!("loader negotiation: API window excludes 1.0");

        return sys::Result::ERROR_INITIALIZATION_FAILED;
    }

    request.runtime_interface_version = LOADER_INTERFACE_VERSION;
    request.runtime_api_version = API_VERSION;
    request.get_instance_proc_addr = Some(xrGetInstanceProcAddr);

    debug!("loader negotiation complete");

    sys::Result::SUCCESS
}

//
// Dispatch plumbing.
//

fn instance() -> Result<Arc<Instance>, sys::Result> {
    RUNTIME
        .read()
        .clone()
        .ok_or(sys::Result::ERROR_HANDLE_INVALID)
}

fn checked_instance(handle: sys::Instance) -> Result<Arc<Instance>, sys::Result> {
    if handle.into_raw() != 1 {
        return Err(sys::Result::ERROR_HANDLE_INVALID);
    }

    instance()
}

fn session_of(handle: sys::Session) -> Result<Arc<Session>, sys::Result> {
    instance()?
        .check_session(handle)
        .map_err(RuntimeError::xr)
}

/// The two-call enumeration idiom.
///
/// # Safety
///
/// `output` must point at `capacity_input` elements when non-null.
unsafe fn write_array<T: Copy>(
    items: &[T],
    capacity_input: u32,
    count_output: *mut u32,
    output: *mut T,
) -> sys::Result {
    if count_output.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    unsafe {
        *count_output = items.len() as u32;
    }

    if capacity_input == 0 || items.is_empty() {
        return sys::Result::SUCCESS;
    }

    if (capacity_input as usize) < items.len() || output.is_null() {
        return sys::Result::ERROR_SIZE_INSUFFICIENT;
    }

    unsafe {
        std::ptr::copy_nonoverlapping(items.as_ptr(), output, items.len());
    }

    sys::Result::SUCCESS
}

/// Two-call idiom for NUL-terminated strings; the count includes the NUL.
unsafe fn write_string(
    value: &str,
    capacity_input: u32,
    count_output: *mut u32,
    buffer: *mut c_char,
) -> sys::Result {
    if count_output.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let required = value.len() + 1;

    unsafe {
        *count_output = required as u32;
    }

    if capacity_input == 0 {
        return sys::Result::SUCCESS;
    }

    if (capacity_input as usize) < required || buffer.is_null() {
        return sys::Result::ERROR_SIZE_INSUFFICIENT;
    }

    unsafe {
        std::ptr::copy_nonoverlapping(value.as_ptr() as *const c_char, buffer, value.len());
        *buffer.add(value.len()) = 0;
    }

    sys::Result::SUCCESS
}

unsafe fn read_cstr<'a>(pointer: *const c_char) -> Result<&'a str, sys::Result> {
    if pointer.is_null() {
        return Err(sys::Result::ERROR_VALIDATION_FAILURE);
    }

    unsafe { CStr::from_ptr(pointer) }
        .to_str()
        .map_err(|_| sys::Result::ERROR_VALIDATION_FAILURE)
}

//
// Instance and system.
//

unsafe extern "system" fn xr_enumerate_api_layer_properties(
    capacity_input: u32,
    count_output: *mut u32,
    _properties: *mut c_void,
) -> sys::Result {
    unsafe { write_array::<u8>(&[], capacity_input, count_output, std::ptr::null_mut()) }
}

unsafe extern "system" fn xr_enumerate_instance_extension_properties(
    _layer_name: *const c_char,
    capacity_input: u32,
    count_output: *mut u32,
    properties: *mut sys::ExtensionProperties,
) -> sys::Result {
    if count_output.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    unsafe {
        *count_output = EXTENSION_TABLE.len() as u32;
    }

    if capacity_input == 0 {
        return sys::Result::SUCCESS;
    }

    if (capacity_input as usize) < EXTENSION_TABLE.len() || properties.is_null() {
        return sys::Result::ERROR_SIZE_INSUFFICIENT;
    }

    for (index, entry) in EXTENSION_TABLE.iter().enumerate() {
        let property = unsafe { &mut *properties.add(index) };

        if property.ty != sys::StructureType::EXTENSION_PROPERTIES {
            return sys::Result::ERROR_VALIDATION_FAILURE;
        }

        write_c_string(&mut property.extension_name, entry.name);
        property.extension_version = entry.version;
    }

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_create_instance(
    create_info: *const sys::InstanceCreateInfo,
    out_instance: *mut sys::Instance,
) -> sys::Result {
    logging::init();

    if create_info.is_null() || out_instance.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let mut slot = RUNTIME.write();
    if slot.is_some() {
        return sys::Result::ERROR_LIMIT_REACHED;
    }

    match Instance::create(create_backend(), unsafe { &*create_info }) {
        Ok(created) => {
            *slot = Some(Arc::new(created));

            unsafe {
                *out_instance = sys::Instance::from_raw(1);
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_destroy_instance(handle: sys::Instance) -> sys::Result {
    if handle.into_raw() != 1 {
        return sys::Result::ERROR_HANDLE_INVALID;
    }

    let Some(old) = RUNTIME.write().take() else {
        return sys::Result::ERROR_HANDLE_INVALID;
    };

    // Sessions must not outlive the instance; GPU teardown runs now, not at
    // process exit.
    let _ = old.destroy_session(sys::Session::from_raw(1));

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_get_instance_properties(
    handle: sys::Instance,
    properties: *mut sys::InstanceProperties,
) -> sys::Result {
    if let Err(err) = checked_instance(handle) {
        return err;
    }

    if properties.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let properties = unsafe { &mut *properties };
    if properties.ty != sys::StructureType::INSTANCE_PROPERTIES {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    properties.runtime_version = instance::RUNTIME_VERSION;
    write_c_string(&mut properties.runtime_name, instance::RUNTIME_NAME);

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_poll_event(
    handle: sys::Instance,
    event_data: *mut sys::EventDataBuffer,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if event_data.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match runtime.poll_event() {
        Some(Event::SessionStateChanged { state, time }) => {
            let buffer = event_data as *mut sys::EventDataSessionStateChanged;

            unsafe {
                *buffer = sys::EventDataSessionStateChanged {
                    ty: sys::StructureType::EVENT_DATA_SESSION_STATE_CHANGED,
                    next: std::ptr::null(),
                    session: sys::Session::from_raw(1),
                    state,
                    time,
                };
            }

            sys::Result::SUCCESS
        }
        Some(Event::InteractionProfileChanged) => {
            let buffer = event_data as *mut sys::EventDataInteractionProfileChanged;

            unsafe {
                *buffer = sys::EventDataInteractionProfileChanged {
                    ty: sys::StructureType::EVENT_DATA_INTERACTION_PROFILE_CHANGED,
                    next: std::ptr::null(),
                    session: sys::Session::from_raw(1),
                };
            }

            sys::Result::SUCCESS
        }
        None => sys::Result::EVENT_UNAVAILABLE,
    }
}

unsafe extern "system" fn xr_result_to_string(
    handle: sys::Instance,
    value: sys::Result,
    buffer: *mut c_char,
) -> sys::Result {
    if checked_instance(handle).is_err() {
        return sys::Result::ERROR_HANDLE_INVALID;
    }

    if buffer.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let text = format!("{value:?}");
    let out =
        unsafe { std::slice::from_raw_parts_mut(buffer, sys::MAX_RESULT_STRING_SIZE) };
    write_c_string(out, &text);

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_structure_type_to_string(
    handle: sys::Instance,
    value: sys::StructureType,
    buffer: *mut c_char,
) -> sys::Result {
    if checked_instance(handle).is_err() {
        return sys::Result::ERROR_HANDLE_INVALID;
    }

    if buffer.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let text = format!("{value:?}");
    let out =
        unsafe { std::slice::from_raw_parts_mut(buffer, sys::MAX_STRUCTURE_NAME_SIZE) };
    write_c_string(out, &text);

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_get_system(
    handle: sys::Instance,
    get_info: *const sys::SystemGetInfo,
    system_id: *mut sys::SystemId,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if get_info.is_null() || system_id.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let get_info = unsafe { &*get_info };
    if get_info.ty != sys::StructureType::SYSTEM_GET_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match runtime.get_system(get_info.form_factor) {
        Ok(id) => {
            unsafe {
                *system_id = id;
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_get_system_properties(
    handle: sys::Instance,
    system_id: sys::SystemId,
    properties: *mut sys::SystemProperties,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if properties.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match runtime.system_properties(system_id) {
        Ok(filled) => {
            let out = unsafe { &mut *properties };
            if out.ty != sys::StructureType::SYSTEM_PROPERTIES {
                return sys::Result::ERROR_VALIDATION_FAILURE;
            }

            let next = out.next;
            *out = filled;
            out.next = next;

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_enumerate_environment_blend_modes(
    handle: sys::Instance,
    system_id: sys::SystemId,
    view_configuration_type: sys::ViewConfigurationType,
    capacity_input: u32,
    count_output: *mut u32,
    blend_modes: *mut sys::EnvironmentBlendMode,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    match runtime.environment_blend_modes(system_id, view_configuration_type) {
        Ok(modes) => unsafe { write_array(modes, capacity_input, count_output, blend_modes) },
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_enumerate_view_configurations(
    handle: sys::Instance,
    system_id: sys::SystemId,
    capacity_input: u32,
    count_output: *mut u32,
    view_configurations: *mut sys::ViewConfigurationType,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    match runtime.view_configurations(system_id) {
        Ok(list) => unsafe {
            write_array(list, capacity_input, count_output, view_configurations)
        },
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_get_view_configuration_properties(
    handle: sys::Instance,
    system_id: sys::SystemId,
    view_configuration_type: sys::ViewConfigurationType,
    properties: *mut sys::ViewConfigurationProperties,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if properties.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match runtime.view_configuration_properties(system_id, view_configuration_type) {
        Ok(filled) => {
            let out = unsafe { &mut *properties };
            let next = out.next;
            *out = filled;
            out.next = next;

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_enumerate_view_configuration_views(
    handle: sys::Instance,
    system_id: sys::SystemId,
    view_configuration_type: sys::ViewConfigurationType,
    capacity_input: u32,
    count_output: *mut u32,
    views: *mut sys::ViewConfigurationView,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    match runtime.view_configuration_views(system_id, view_configuration_type) {
        Ok(list) => unsafe { write_array(&list, capacity_input, count_output, views) },
        Err(err) => err.xr(),
    }
}

//
// Paths.
//

unsafe extern "system" fn xr_string_to_path(
    handle: sys::Instance,
    path_string: *const c_char,
    path: *mut sys::Path,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    let string = match unsafe { read_cstr(path_string) } {
        Ok(string) => string,
        Err(err) => return err,
    };

    if path.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match runtime.string_to_path(string) {
        Ok(interned) => {
            unsafe {
                *path = interned;
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_path_to_string(
    handle: sys::Instance,
    path: sys::Path,
    capacity_input: u32,
    count_output: *mut u32,
    buffer: *mut c_char,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    match runtime.path_to_string(path) {
        Ok(string) => unsafe { write_string(&string, capacity_input, count_output, buffer) },
        Err(err) => err.xr(),
    }
}

//
// Session lifecycle.
//

unsafe extern "system" fn xr_create_session(
    handle: sys::Instance,
    create_info: *const sys::SessionCreateInfo,
    session: *mut sys::Session,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if create_info.is_null() || session.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match unsafe { runtime.create_session(&*create_info) } {
        Ok(created) => {
            unsafe {
                *session = created;
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_destroy_session(handle: sys::Session) -> sys::Result {
    match instance() {
        Ok(runtime) => to_xr(runtime.destroy_session(handle).map(|_| sys::Result::SUCCESS)),
        Err(err) => err,
    }
}

unsafe extern "system" fn xr_begin_session(
    handle: sys::Session,
    begin_info: *const sys::SessionBeginInfo,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if begin_info.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let begin_info = unsafe { &*begin_info };
    if begin_info.ty != sys::StructureType::SESSION_BEGIN_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    to_xr(
        session
            .begin(begin_info.primary_view_configuration_type)
            .map(|_| sys::Result::SUCCESS),
    )
}

unsafe extern "system" fn xr_end_session(handle: sys::Session) -> sys::Result {
    match session_of(handle) {
        Ok(session) => to_xr(session.end().map(|_| sys::Result::SUCCESS)),
        Err(err) => err,
    }
}

unsafe extern "system" fn xr_request_exit_session(handle: sys::Session) -> sys::Result {
    match session_of(handle) {
        Ok(session) => to_xr(session.request_exit().map(|_| sys::Result::SUCCESS)),
        Err(err) => err,
    }
}

//
// Spaces.
//

unsafe extern "system" fn xr_enumerate_reference_spaces(
    handle: sys::Session,
    capacity_input: u32,
    count_output: *mut u32,
    spaces: *mut sys::ReferenceSpaceType,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    unsafe { write_array(&REFERENCE_SPACES, capacity_input, count_output, spaces) }
}

unsafe extern "system" fn xr_create_reference_space(
    handle: sys::Session,
    create_info: *const sys::ReferenceSpaceCreateInfo,
    space: *mut sys::Space,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if create_info.is_null() || space.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let create_info = unsafe { &*create_info };
    if create_info.ty != sys::StructureType::REFERENCE_SPACE_CREATE_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match session.create_reference_space(create_info) {
        Ok(created) => {
            unsafe {
                *space = created;
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_get_reference_space_bounds_rect(
    handle: sys::Session,
    _reference_space_type: sys::ReferenceSpaceType,
    bounds: *mut sys::Extent2Df,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    if bounds.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    // No guardian-derived play area is surfaced.
    unsafe {
        (*bounds).width = 0.0;
        (*bounds).height = 0.0;
    }

    sys::Result::SPACE_BOUNDS_UNAVAILABLE
}

unsafe extern "system" fn xr_create_action_space(
    handle: sys::Session,
    create_info: *const sys::ActionSpaceCreateInfo,
    space: *mut sys::Space,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if create_info.is_null() || space.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let create_info = unsafe { &*create_info };
    if create_info.ty != sys::StructureType::ACTION_SPACE_CREATE_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let runtime = match instance() {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    let unknown_action = runtime
        .input
        .lock()
        .action(create_info.action.into_raw())
        .err();
    if let Some(err) = unknown_action {
        return err.xr();
    }

    match session.create_action_space(
        create_info.action.into_raw(),
        create_info.subaction_path,
        &create_info.pose_in_action_space,
    ) {
        Ok(created) => {
            unsafe {
                *space = created;
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_locate_space(
    space: sys::Space,
    base_space: sys::Space,
    time: sys::Time,
    location: *mut sys::SpaceLocation,
) -> sys::Result {
    let session = match instance().and_then(|runtime| runtime.session().map_err(RuntimeError::xr))
    {
        Ok(session) => session,
        Err(err) => return err,
    };

    if location.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let out = unsafe { &mut *location };
    if out.ty != sys::StructureType::SPACE_LOCATION {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match session.locate_space(space, base_space, time) {
        Ok(located) => {
            out.location_flags = located.flags;
            out.pose = located.pose.to_xr();

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_destroy_space(space: sys::Space) -> sys::Result {
    match instance().and_then(|runtime| runtime.session().map_err(RuntimeError::xr)) {
        Ok(session) => to_xr(session.destroy_space(space).map(|_| sys::Result::SUCCESS)),
        Err(err) => err,
    }
}

//
// Swapchains.
//

unsafe extern "system" fn xr_enumerate_swapchain_formats(
    handle: sys::Session,
    capacity_input: u32,
    count_output: *mut u32,
    formats: *mut i64,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    let list = crate::format::supported_formats(session.api);

    unsafe { write_array(&list, capacity_input, count_output, formats) }
}

unsafe extern "system" fn xr_create_swapchain(
    handle: sys::Session,
    create_info: *const sys::SwapchainCreateInfo,
    swapchain: *mut sys::Swapchain,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if create_info.is_null() || swapchain.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let create_info = unsafe { &*create_info };
    if create_info.ty != sys::StructureType::SWAPCHAIN_CREATE_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match session.create_swapchain(create_info) {
        Ok(created) => {
            unsafe {
                *swapchain = created;
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_destroy_swapchain(handle: sys::Swapchain) -> sys::Result {
    match instance().and_then(|runtime| runtime.session().map_err(RuntimeError::xr)) {
        Ok(session) => to_xr(
            session
                .destroy_swapchain(handle)
                .map(|_| sys::Result::SUCCESS),
        ),
        Err(err) => err,
    }
}

unsafe extern "system" fn xr_enumerate_swapchain_images(
    handle: sys::Swapchain,
    capacity_input: u32,
    count_output: *mut u32,
    images: *mut sys::SwapchainImageBaseHeader,
) -> sys::Result {
    let session = match instance().and_then(|runtime| runtime.session().map_err(RuntimeError::xr))
    {
        Ok(session) => session,
        Err(err) => return err,
    };

    let count = match session.swapchain_image_count(handle) {
        Ok(count) => count,
        Err(err) => return err.xr(),
    };

    if count_output.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    unsafe {
        *count_output = count;
    }

    if capacity_input == 0 {
        return sys::Result::SUCCESS;
    }

    if capacity_input < count || images.is_null() {
        return sys::Result::ERROR_SIZE_INSUFFICIENT;
    }

    to_xr(
        unsafe { session.write_swapchain_images(handle, images, count) }
            .map(|_| sys::Result::SUCCESS),
    )
}

unsafe extern "system" fn xr_acquire_swapchain_image(
    handle: sys::Swapchain,
    acquire_info: *const sys::SwapchainImageAcquireInfo,
    index: *mut u32,
) -> sys::Result {
    let session = match instance().and_then(|runtime| runtime.session().map_err(RuntimeError::xr))
    {
        Ok(session) => session,
        Err(err) => return err,
    };

    if !acquire_info.is_null()
        && unsafe { (*acquire_info).ty } != sys::StructureType::SWAPCHAIN_IMAGE_ACQUIRE_INFO
    {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    if index.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match session.acquire_swapchain_image(handle) {
        Ok(acquired) => {
            unsafe {
                *index = acquired;
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_wait_swapchain_image(
    handle: sys::Swapchain,
    wait_info: *const sys::SwapchainImageWaitInfo,
) -> sys::Result {
    let session = match instance().and_then(|runtime| runtime.session().map_err(RuntimeError::xr))
    {
        Ok(session) => session,
        Err(err) => return err,
    };

    if wait_info.is_null()
        || unsafe { (*wait_info).ty } != sys::StructureType::SWAPCHAIN_IMAGE_WAIT_INFO
    {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    to_xr(session.wait_swapchain_image(handle).map(|_| sys::Result::SUCCESS))
}

unsafe extern "system" fn xr_release_swapchain_image(
    handle: sys::Swapchain,
    release_info: *const sys::SwapchainImageReleaseInfo,
) -> sys::Result {
    let session = match instance().and_then(|runtime| runtime.session().map_err(RuntimeError::xr))
    {
        Ok(session) => session,
        Err(err) => return err,
    };

    if !release_info.is_null()
        && unsafe { (*release_info).ty } != sys::StructureType::SWAPCHAIN_IMAGE_RELEASE_INFO
    {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    to_xr(
        session
            .release_swapchain_image(handle)
            .map(|_| sys::Result::SUCCESS),
    )
}

//
// Frame loop.
//

unsafe extern "system" fn xr_wait_frame(
    handle: sys::Session,
    wait_info: *const sys::FrameWaitInfo,
    frame_state: *mut sys::FrameState,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if !wait_info.is_null() && unsafe { (*wait_info).ty } != sys::StructureType::FRAME_WAIT_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    if frame_state.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let out = unsafe { &mut *frame_state };
    if out.ty != sys::StructureType::FRAME_STATE {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match session.wait_frame() {
        Ok(WaitFrameOutcome::LossPending) => sys::Result::SESSION_LOSS_PENDING,
        Ok(WaitFrameOutcome::Frame(waited)) => {
            out.predicted_display_time = session.time.backend_to_xr(waited.predicted_display_time);
            out.predicted_display_period = sys::Duration::from_nanos(
                (waited.predicted_display_period * 1e9).round() as i64,
            );
            out.should_render = waited.should_render.into();

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_begin_frame(
    handle: sys::Session,
    begin_info: *const sys::FrameBeginInfo,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if !begin_info.is_null() && unsafe { (*begin_info).ty } != sys::StructureType::FRAME_BEGIN_INFO
    {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match session.begin_frame() {
        Ok(true) => sys::Result::FRAME_DISCARDED,
        Ok(false) => sys::Result::SUCCESS,
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_end_frame(
    handle: sys::Session,
    frame_end_info: *const sys::FrameEndInfo,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if frame_end_info.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let info = unsafe { &*frame_end_info };
    if info.ty != sys::StructureType::FRAME_END_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    to_xr(
        unsafe {
            session.end_frame(
                info.display_time,
                info.environment_blend_mode,
                info.layers,
                info.layer_count,
            )
        }
        .map(|_| sys::Result::SUCCESS),
    )
}

unsafe extern "system" fn xr_locate_views(
    handle: sys::Session,
    view_locate_info: *const sys::ViewLocateInfo,
    view_state: *mut sys::ViewState,
    capacity_input: u32,
    count_output: *mut u32,
    views: *mut sys::View,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if view_locate_info.is_null() || view_state.is_null() || count_output.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let info = unsafe { &*view_locate_info };
    if info.ty != sys::StructureType::VIEW_LOCATE_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    if info.view_configuration_type != sys::ViewConfigurationType::PRIMARY_STEREO {
        return sys::Result::ERROR_VIEW_CONFIGURATION_TYPE_UNSUPPORTED;
    }

    unsafe {
        *count_output = 2;
    }

    if capacity_input == 0 {
        return sys::Result::SUCCESS;
    }

    if capacity_input < 2 || views.is_null() {
        return sys::Result::ERROR_SIZE_INSUFFICIENT;
    }

    match session.locate_views(info.space, info.display_time) {
        Ok((flags, located)) => {
            unsafe {
                (*view_state).view_state_flags = flags;
                std::ptr::copy_nonoverlapping(located.as_ptr(), views, 2);
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

//
// Input passthrough.
//

unsafe extern "system" fn xr_create_action_set(
    handle: sys::Instance,
    create_info: *const sys::ActionSetCreateInfo,
    action_set: *mut sys::ActionSet,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if create_info.is_null() || action_set.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let create_info = unsafe { &*create_info };
    if create_info.ty != sys::StructureType::ACTION_SET_CREATE_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let name = unsafe { CStr::from_ptr(create_info.action_set_name.as_ptr()) }.to_string_lossy();
    let localized =
        unsafe { CStr::from_ptr(create_info.localized_action_set_name.as_ptr()) }
            .to_string_lossy();

    let result = runtime
        .input
        .lock()
        .create_action_set(&name, &localized, create_info.priority);

    match result {
        Ok(created) => {
            unsafe {
                *action_set = sys::ActionSet::from_raw(created);
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_destroy_action_set(handle: sys::ActionSet) -> sys::Result {
    match instance() {
        Ok(runtime) => to_xr(
            runtime
                .input
                .lock()
                .destroy_action_set(handle.into_raw())
                .map(|_| sys::Result::SUCCESS),
        ),
        Err(err) => err,
    }
}

unsafe extern "system" fn xr_create_action(
    handle: sys::ActionSet,
    create_info: *const sys::ActionCreateInfo,
    action: *mut sys::Action,
) -> sys::Result {
    let runtime = match instance() {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if create_info.is_null() || action.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let create_info = unsafe { &*create_info };
    if create_info.ty != sys::StructureType::ACTION_CREATE_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let name = unsafe { CStr::from_ptr(create_info.action_name.as_ptr()) }.to_string_lossy();
    let localized =
        unsafe { CStr::from_ptr(create_info.localized_action_name.as_ptr()) }.to_string_lossy();

    let subaction_paths = if create_info.count_subaction_paths == 0 {
        Vec::new()
    } else {
        unsafe {
            std::slice::from_raw_parts(
                create_info.subaction_paths,
                create_info.count_subaction_paths as usize,
            )
        }
        .to_vec()
    };

    let result = runtime.input.lock().create_action(
        handle.into_raw(),
        &name,
        &localized,
        create_info.action_type,
        subaction_paths,
    );

    match result {
        Ok(created) => {
            unsafe {
                *action = sys::Action::from_raw(created);
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_destroy_action(handle: sys::Action) -> sys::Result {
    match instance() {
        Ok(runtime) => to_xr(
            runtime
                .input
                .lock()
                .destroy_action(handle.into_raw())
                .map(|_| sys::Result::SUCCESS),
        ),
        Err(err) => err,
    }
}

unsafe extern "system" fn xr_suggest_interaction_profile_bindings(
    handle: sys::Instance,
    suggested_bindings: *const sys::InteractionProfileSuggestedBinding,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if suggested_bindings.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let bindings = unsafe { &*suggested_bindings };
    if bindings.ty != sys::StructureType::INTERACTION_PROFILE_SUGGESTED_BINDING {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let result = runtime
        .input
        .lock()
        .suggest_bindings(
            bindings.interaction_profile,
            bindings.count_suggested_bindings as usize,
        )
        .map(|_| sys::Result::SUCCESS);

    to_xr(result)
}

unsafe extern "system" fn xr_attach_session_action_sets(
    handle: sys::Session,
    attach_info: *const sys::SessionActionSetsAttachInfo,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    let runtime = match instance() {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if attach_info.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let attach_info = unsafe { &*attach_info };
    if attach_info.ty != sys::StructureType::SESSION_ACTION_SETS_ATTACH_INFO {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let handles = unsafe {
        std::slice::from_raw_parts(
            attach_info.action_sets,
            attach_info.count_action_sets as usize,
        )
    }
    .iter()
    .map(|set| set.into_raw())
    .collect::<Vec<_>>();

    let result = runtime
        .input
        .lock()
        .attach(&handles)
        .map(|_| sys::Result::SUCCESS);

    to_xr(result)
}

unsafe extern "system" fn xr_get_current_interaction_profile(
    handle: sys::Session,
    _top_level_user_path: sys::Path,
    interaction_profile: *mut sys::InteractionProfileState,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    if interaction_profile.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let out = unsafe { &mut *interaction_profile };
    if out.ty != sys::StructureType::INTERACTION_PROFILE_STATE {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    // Input is a passthrough; no profile is ever bound.
    out.interaction_profile = sys::Path::from_raw(0);

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_get_action_state_boolean(
    handle: sys::Session,
    get_info: *const sys::ActionStateGetInfo,
    state: *mut sys::ActionStateBoolean,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    if get_info.is_null() || state.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let out = unsafe { &mut *state };
    out.current_state = false.into();
    out.changed_since_last_sync = false.into();
    out.last_change_time = sys::Time::from_nanos(0);
    out.is_active = false.into();

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_get_action_state_float(
    handle: sys::Session,
    get_info: *const sys::ActionStateGetInfo,
    state: *mut sys::ActionStateFloat,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    if get_info.is_null() || state.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let out = unsafe { &mut *state };
    out.current_state = 0.0;
    out.changed_since_last_sync = false.into();
    out.last_change_time = sys::Time::from_nanos(0);
    out.is_active = false.into();

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_get_action_state_vector2f(
    handle: sys::Session,
    get_info: *const sys::ActionStateGetInfo,
    state: *mut sys::ActionStateVector2f,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    if get_info.is_null() || state.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let out = unsafe { &mut *state };
    out.current_state = sys::Vector2f { x: 0.0, y: 0.0 };
    out.changed_since_last_sync = false.into();
    out.last_change_time = sys::Time::from_nanos(0);
    out.is_active = false.into();

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_get_action_state_pose(
    handle: sys::Session,
    get_info: *const sys::ActionStateGetInfo,
    state: *mut sys::ActionStatePose,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    if get_info.is_null() || state.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    unsafe {
        (*state).is_active = false.into();
    }

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_sync_actions(
    handle: sys::Session,
    sync_info: *const sys::ActionsSyncInfo,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if sync_info.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    // Actions only sync while the session has focus.
    if session.machine.lock().state() != sys::SessionState::FOCUSED {
        return sys::Result::SESSION_NOT_FOCUSED;
    }

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_enumerate_bound_sources_for_action(
    handle: sys::Session,
    _enumerate_info: *const sys::BoundSourcesForActionEnumerateInfo,
    capacity_input: u32,
    count_output: *mut u32,
    sources: *mut sys::Path,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    unsafe { write_array::<sys::Path>(&[], capacity_input, count_output, sources) }
}

unsafe extern "system" fn xr_get_input_source_localized_name(
    handle: sys::Session,
    _get_info: *const sys::InputSourceLocalizedNameGetInfo,
    capacity_input: u32,
    count_output: *mut u32,
    buffer: *mut c_char,
) -> sys::Result {
    if let Err(err) = session_of(handle) {
        return err;
    }

    unsafe { write_string("", capacity_input, count_output, buffer) }
}

unsafe extern "system" fn xr_apply_haptic_feedback(
    handle: sys::Session,
    _haptic_action_info: *const sys::HapticActionInfo,
    _haptic_feedback: *const sys::HapticBaseHeader,
) -> sys::Result {
    match session_of(handle) {
        Ok(_) => sys::Result::SUCCESS,
        Err(err) => err,
    }
}

unsafe extern "system" fn xr_stop_haptic_feedback(
    handle: sys::Session,
    _haptic_action_info: *const sys::HapticActionInfo,
) -> sys::Result {
    match session_of(handle) {
        Ok(_) => sys::Result::SUCCESS,
        Err(err) => err,
    }
}

//
// Extensions.
//

unsafe extern "system" fn xr_get_visibility_mask(
    handle: sys::Session,
    view_configuration_type: sys::ViewConfigurationType,
    view_index: u32,
    visibility_mask_type: sys::VisibilityMaskTypeKHR,
    visibility_mask: *mut sys::VisibilityMaskKHR,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if !session.enabled.visibility_mask {
        return sys::Result::ERROR_FUNCTION_UNSUPPORTED;
    }

    if visibility_mask.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let out = unsafe { &mut *visibility_mask };
    if out.ty != sys::StructureType::VISIBILITY_MASK_KHR {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let mesh =
        match session.visibility_mask(view_configuration_type, view_index, visibility_mask_type)
        {
            Ok(mesh) => mesh,
            Err(err) => return err.xr(),
        };

    out.vertex_count_output = mesh.vertices.len() as u32;
    out.index_count_output = mesh.indices.len() as u32;

    if out.vertex_capacity_input == 0 || out.index_capacity_input == 0 {
        return sys::Result::SUCCESS;
    }

    if (out.vertex_capacity_input as usize) < mesh.vertices.len()
        || (out.index_capacity_input as usize) < mesh.indices.len()
    {
        return sys::Result::ERROR_SIZE_INSUFFICIENT;
    }

    unsafe {
        for (index, vertex) in mesh.vertices.iter().enumerate() {
            *out.vertices.add(index) = sys::Vector2f {
                x: vertex[0],
                y: vertex[1],
            };
        }
        std::ptr::copy_nonoverlapping(mesh.indices.as_ptr(), out.indices, mesh.indices.len());
    }

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_enumerate_display_refresh_rates(
    handle: sys::Session,
    capacity_input: u32,
    count_output: *mut u32,
    rates: *mut f32,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    unsafe {
        write_array(
            &[session.display_refresh_rate()],
            capacity_input,
            count_output,
            rates,
        )
    }
}

unsafe extern "system" fn xr_get_display_refresh_rate(
    handle: sys::Session,
    rate: *mut f32,
) -> sys::Result {
    let session = match session_of(handle) {
        Ok(session) => session,
        Err(err) => return err,
    };

    if rate.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    unsafe {
        *rate = session.display_refresh_rate();
    }

    sys::Result::SUCCESS
}

unsafe extern "system" fn xr_request_display_refresh_rate(
    handle: sys::Session,
    rate: f32,
) -> sys::Result {
    match session_of(handle) {
        Ok(session) => to_xr(
            session
                .request_display_refresh_rate(rate)
                .map(|_| sys::Result::SUCCESS),
        ),
        Err(err) => err,
    }
}

unsafe extern "system" fn xr_get_vulkan_instance_extensions(
    handle: sys::Instance,
    system_id: sys::SystemId,
    capacity_input: u32,
    count_output: *mut u32,
    buffer: *mut c_char,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if let Err(err) = runtime.check_system(system_id) {
        return err.xr();
    }

    unsafe {
        write_string(
            system::VULKAN_INSTANCE_EXTENSIONS,
            capacity_input,
            count_output,
            buffer,
        )
    }
}

unsafe extern "system" fn xr_get_vulkan_device_extensions(
    handle: sys::Instance,
    system_id: sys::SystemId,
    capacity_input: u32,
    count_output: *mut u32,
    buffer: *mut c_char,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if let Err(err) = runtime.check_system(system_id) {
        return err.xr();
    }

    unsafe {
        write_string(
            system::VULKAN_DEVICE_EXTENSIONS,
            capacity_input,
            count_output,
            buffer,
        )
    }
}

unsafe extern "system" fn xr_get_vulkan_graphics_device(
    handle: sys::Instance,
    system_id: sys::SystemId,
    vk_instance: sys::platform::VkInstance,
    vk_physical_device: *mut sys::platform::VkPhysicalDevice,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if vk_physical_device.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match runtime.vulkan_graphics_device(system_id, vk_instance as usize as u64) {
        Ok(device) => {
            unsafe {
                *vk_physical_device = device as usize as sys::platform::VkPhysicalDevice;
            }

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

unsafe extern "system" fn xr_get_vulkan_graphics_requirements(
    handle: sys::Instance,
    system_id: sys::SystemId,
    requirements: *mut sys::GraphicsRequirementsVulkanKHR,
) -> sys::Result {
    let runtime = match checked_instance(handle) {
        Ok(runtime) => runtime,
        Err(err) => return err,
    };

    if requirements.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let out = unsafe { &mut *requirements };
    if out.ty != sys::StructureType::GRAPHICS_REQUIREMENTS_VULKAN_KHR {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    match runtime.graphics_requirements(system_id) {
        Ok(_) => {
            out.min_api_version_supported = sys::Version::new(1, 1, 0);
            out.max_api_version_supported = sys::Version::new(1, 3, 0);

            sys::Result::SUCCESS
        }
        Err(err) => err.xr(),
    }
}

#[cfg(windows)]
mod windows_exts {
    use super::*;

    pub unsafe extern "system" fn xr_get_d3d11_graphics_requirements(
        handle: sys::Instance,
        system_id: sys::SystemId,
        requirements: *mut sys::GraphicsRequirementsD3D11KHR,
    ) -> sys::Result {
        let runtime = match checked_instance(handle) {
            Ok(runtime) => runtime,
            Err(err) => return err,
        };

        if !runtime.enabled.d3d11 {
            return sys::Result::ERROR_FUNCTION_UNSUPPORTED;
        }

        if requirements.is_null() {
            return sys::Result::ERROR_VALIDATION_FAILURE;
        }

        match runtime.graphics_requirements(system_id) {
            Ok(luid) => {
                let out = unsafe { &mut *requirements };

                out.adapter_luid = unsafe { std::mem::transmute(luid) };
                out.min_feature_level = 0xb000; // D3D_FEATURE_LEVEL_11_0

                sys::Result::SUCCESS
            }
            Err(err) => err.xr(),
        }
    }

    pub unsafe extern "system" fn xr_get_d3d12_graphics_requirements(
        handle: sys::Instance,
        system_id: sys::SystemId,
        requirements: *mut sys::GraphicsRequirementsD3D12KHR,
    ) -> sys::Result {
        let runtime = match checked_instance(handle) {
            Ok(runtime) => runtime,
            Err(err) => return err,
        };

        if !runtime.enabled.d3d12 {
            return sys::Result::ERROR_FUNCTION_UNSUPPORTED;
        }

        if requirements.is_null() {
            return sys::Result::ERROR_VALIDATION_FAILURE;
        }

        match runtime.graphics_requirements(system_id) {
            Ok(luid) => {
                let out = unsafe { &mut *requirements };

                out.adapter_luid = unsafe { std::mem::transmute(luid) };
                out.min_feature_level = 0xb000;

                sys::Result::SUCCESS
            }
            Err(err) => err.xr(),
        }
    }

    pub unsafe extern "system" fn xr_get_opengl_graphics_requirements(
        handle: sys::Instance,
        system_id: sys::SystemId,
        requirements: *mut sys::GraphicsRequirementsOpenGLKHR,
    ) -> sys::Result {
        let runtime = match checked_instance(handle) {
            Ok(runtime) => runtime,
            Err(err) => return err,
        };

        if !runtime.enabled.opengl {
            return sys::Result::ERROR_FUNCTION_UNSUPPORTED;
        }

        if requirements.is_null() {
            return sys::Result::ERROR_VALIDATION_FAILURE;
        }

        match runtime.graphics_requirements(system_id) {
            Ok(_) => {
                let out = unsafe { &mut *requirements };

                out.min_api_version_supported = sys::Version::new(4, 5, 0);
                out.max_api_version_supported = sys::Version::new(4, 6, 0);

                sys::Result::SUCCESS
            }
            Err(err) => err.xr(),
        }
    }

    pub unsafe extern "system" fn xr_convert_win32_performance_counter_to_time(
        handle: sys::Instance,
        performance_counter: *const i64,
        time: *mut sys::Time,
    ) -> sys::Result {
        let runtime = match checked_instance(handle) {
            Ok(runtime) => runtime,
            Err(err) => return err,
        };

        if performance_counter.is_null() || time.is_null() {
            return sys::Result::ERROR_VALIDATION_FAILURE;
        }

        let counter = unsafe { *performance_counter };
        if counter <= 0 {
            return sys::Result::ERROR_TIME_INVALID;
        }

        unsafe {
            *time = runtime.time.counter_to_xr(counter);
        }

        sys::Result::SUCCESS
    }

    pub unsafe extern "system" fn xr_convert_time_to_win32_performance_counter(
        handle: sys::Instance,
        time: sys::Time,
        performance_counter: *mut i64,
    ) -> sys::Result {
        let runtime = match checked_instance(handle) {
            Ok(runtime) => runtime,
            Err(err) => return err,
        };

        if performance_counter.is_null() {
            return sys::Result::ERROR_VALIDATION_FAILURE;
        }

        if time.as_nanos() <= 0 {
            return sys::Result::ERROR_TIME_INVALID;
        }

        unsafe {
            *performance_counter = runtime.time.xr_to_counter(time);
        }

        sys::Result::SUCCESS
    }
}

//
// The function table.
//

macro_rules! proc_addr {
    ($func:expr) => {{
        let pointer = $func as *const ();

        Some(unsafe { std::mem::transmute::<*const (), sys::pfn::VoidFunction>(pointer) })
    }};
}

/// `xrGetInstanceProcAddr`.
///
/// # Safety
///
/// Called by the loader/application with a valid output pointer.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn xrGetInstanceProcAddr(
    _instance: sys::Instance,
    name: *const c_char,
    function: *mut Option<sys::pfn::VoidFunction>,
) -> sys::Result {
    if function.is_null() {
        return sys::Result::ERROR_VALIDATION_FAILURE;
    }

    let name = match unsafe { read_cstr(name) } {
        Ok(name) => name,
        Err(err) => return err,
    };

    let resolved: Option<sys::pfn::VoidFunction> = match name {
        "xrGetInstanceProcAddr" => proc_addr!(xrGetInstanceProcAddr),
        "xrEnumerateApiLayerProperties" => proc_addr!(xr_enumerate_api_layer_properties),
        "xrEnumerateInstanceExtensionProperties" => {
            proc_addr!(xr_enumerate_instance_extension_properties)
        }
        "xrCreateInstance" => proc_addr!(xr_create_instance),
        "xrDestroyInstance" => proc_addr!(xr_destroy_instance),
        "xrGetInstanceProperties" => proc_addr!(xr_get_instance_properties),
        "xrPollEvent" => proc_addr!(xr_poll_event),
        "xrResultToString" => proc_addr!(xr_result_to_string),
        "xrStructureTypeToString" => proc_addr!(xr_structure_type_to_string),
        "xrGetSystem" => proc_addr!(xr_get_system),
        "xrGetSystemProperties" => proc_addr!(xr_get_system_properties),
        "xrEnumerateEnvironmentBlendModes" => proc_addr!(xr_enumerate_environment_blend_modes),
        "xrCreateSession" => proc_addr!(xr_create_session),
        "xrDestroySession" => proc_addr!(xr_destroy_session),
        "xrEnumerateReferenceSpaces" => proc_addr!(xr_enumerate_reference_spaces),
        "xrCreateReferenceSpace" => proc_addr!(xr_create_reference_space),
        "xrGetReferenceSpaceBoundsRect" => proc_addr!(xr_get_reference_space_bounds_rect),
        "xrCreateActionSpace" => proc_addr!(xr_create_action_space),
        "xrLocateSpace" => proc_addr!(xr_locate_space),
        "xrDestroySpace" => proc_addr!(xr_destroy_space),
        "xrEnumerateViewConfigurations" => proc_addr!(xr_enumerate_view_configurations),
        "xrGetViewConfigurationProperties" => proc_addr!(xr_get_view_configuration_properties),
        "xrEnumerateViewConfigurationViews" => proc_addr!(xr_enumerate_view_configuration_views),
        "xrEnumerateSwapchainFormats" => proc_addr!(xr_enumerate_swapchain_formats),
        "xrCreateSwapchain" => proc_addr!(xr_create_swapchain),
        "xrDestroySwapchain" => proc_addr!(xr_destroy_swapchain),
        "xrEnumerateSwapchainImages" => proc_addr!(xr_enumerate_swapchain_images),
        "xrAcquireSwapchainImage" => proc_addr!(xr_acquire_swapchain_image),
        "xrWaitSwapchainImage" => proc_addr!(xr_wait_swapchain_image),
        "xrReleaseSwapchainImage" => proc_addr!(xr_release_swapchain_image),
        "xrBeginSession" => proc_addr!(xr_begin_session),
        "xrEndSession" => proc_addr!(xr_end_session),
        "xrRequestExitSession" => proc_addr!(xr_request_exit_session),
        "xrWaitFrame" => proc_addr!(xr_wait_frame),
        "xrBeginFrame" => proc_addr!(xr_begin_frame),
        "xrEndFrame" => proc_addr!(xr_end_frame),
        "xrLocateViews" => proc_addr!(xr_locate_views),
        "xrStringToPath" => proc_addr!(xr_string_to_path),
        "xrPathToString" => proc_addr!(xr_path_to_string),
        "xrCreateActionSet" => proc_addr!(xr_create_action_set),
        "xrDestroyActionSet" => proc_addr!(xr_destroy_action_set),
        "xrCreateAction" => proc_addr!(xr_create_action),
        "xrDestroyAction" => proc_addr!(xr_destroy_action),
        "xrSuggestInteractionProfileBindings" => {
            proc_addr!(xr_suggest_interaction_profile_bindings)
        }
        "xrAttachSessionActionSets" => proc_addr!(xr_attach_session_action_sets),
        "xrGetCurrentInteractionProfile" => proc_addr!(xr_get_current_interaction_profile),
        "xrGetActionStateBoolean" => proc_addr!(xr_get_action_state_boolean),
        "xrGetActionStateFloat" => proc_addr!(xr_get_action_state_float),
        "xrGetActionStateVector2f" => proc_addr!(xr_get_action_state_vector2f),
        "xrGetActionStatePose" => proc_addr!(xr_get_action_state_pose),
        "xrSyncActions" => proc_addr!(xr_sync_actions),
        "xrEnumerateBoundSourcesForAction" => proc_addr!(xr_enumerate_bound_sources_for_action),
        "xrGetInputSourceLocalizedName" => proc_addr!(xr_get_input_source_localized_name),
        "xrApplyHapticFeedback" => proc_addr!(xr_apply_haptic_feedback),
        "xrStopHapticFeedback" => proc_addr!(xr_stop_haptic_feedback),
        "xrGetVisibilityMaskKHR" => proc_addr!(xr_get_visibility_mask),
        "xrEnumerateDisplayRefreshRatesFB" => proc_addr!(xr_enumerate_display_refresh_rates),
        "xrGetDisplayRefreshRateFB" => proc_addr!(xr_get_display_refresh_rate),
        "xrRequestDisplayRefreshRateFB" => proc_addr!(xr_request_display_refresh_rate),
        "xrGetVulkanInstanceExtensionsKHR" => proc_addr!(xr_get_vulkan_instance_extensions),
        "xrGetVulkanDeviceExtensionsKHR" => proc_addr!(xr_get_vulkan_device_extensions),
        "xrGetVulkanGraphicsDeviceKHR" => proc_addr!(xr_get_vulkan_graphics_device),
        "xrGetVulkanGraphicsRequirementsKHR" => {
            proc_addr!(xr_get_vulkan_graphics_requirements)
        }
        #[cfg(windows)]
        "xrGetD3D11GraphicsRequirementsKHR" => {
            proc_addr!(windows_exts::xr_get_d3d11_graphics_requirements)
        }
        #[cfg(windows)]
        "xrGetD3D12GraphicsRequirementsKHR" => {
            proc_addr!(windows_exts::xr_get_d3d12_graphics_requirements)
        }
        #[cfg(windows)]
        "xrGetOpenGLGraphicsRequirementsKHR" => {
            proc_addr!(windows_exts::xr_get_opengl_graphics_requirements)
        }
        #[cfg(windows)]
        "xrConvertWin32PerformanceCounterToTimeKHR" => {
            proc_addr!(windows_exts::xr_convert_win32_performance_counter_to_time)
        }
        #[cfg(windows)]
        "xrConvertTimeToWin32PerformanceCounterKHR" => {
            proc_addr!(windows_exts::xr_convert_time_to_win32_performance_counter)
        }
        _ => None,
    };

    unsafe {
        *function = resolved;
    }

    if unsafe { (*function).is_some() } {
        sys::Result::SUCCESS
    } else {
        sys::Result::ERROR_FUNCTION_UNSUPPORTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader_info() -> NegotiateLoaderInfo {
        NegotiateLoaderInfo {
            struct_type: LOADER_STRUCT_LOADER_INFO,
            struct_version: 1,
            struct_size: std::mem::size_of::<NegotiateLoaderInfo>(),
            min_interface_version: 1,
            max_interface_version: 1,
            min_api_version: sys::Version::new(1, 0, 0),
            max_api_version: sys::Version::new(1, 0, u32::MAX),
        }
    }

    fn runtime_request() -> NegotiateRuntimeRequest {
        NegotiateRuntimeRequest {
            struct_type: LOADER_STRUCT_RUNTIME_REQUEST,
            struct_version: 1,
            struct_size: std::mem::size_of::<NegotiateRuntimeRequest>(),
            runtime_interface_version: 0,
            runtime_api_version: sys::Version::new(0, 0, 0),
            get_instance_proc_addr: None,
        }
    }

    #[test]
    pub fn negotiation_fills_the_request() {
        let info = loader_info();
        let mut request = runtime_request();

        let result =
            unsafe { xrNegotiateLoaderRuntimeInterface(&info, &mut request) };

        assert_eq!(result, sys::Result::SUCCESS);
        assert_eq!(request.runtime_interface_version, LOADER_INTERFACE_VERSION);
        assert_eq!(request.runtime_api_version.major(), 1);
        assert!(request.get_instance_proc_addr.is_some());
    }

    #[test]
    pub fn negotiation_rejects_incompatible_windows() {
        let mut info = loader_info();
        info.min_interface_version = 2;
        info.max_interface_version = 3;
        let mut request = runtime_request();

        assert_eq!(
            unsafe { xrNegotiateLoaderRuntimeInterface(&info, &mut request) },
            sys::Result::ERROR_INITIALIZATION_FAILED
        );

        let mut info = loader_info();
        info.max_api_version = sys::Version::new(0, 9, 0);

        assert_eq!(
            unsafe { xrNegotiateLoaderRuntimeInterface(&info, &mut request) },
            sys::Result::ERROR_INITIALIZATION_FAILED
        );
    }

    #[test]
    pub fn proc_addr_resolves_core_functions() {
        let mut function = None;
        let name = std::ffi::CString::new("xrCreateInstance").unwrap();

        let result = unsafe {
            xrGetInstanceProcAddr(sys::Instance::NULL, name.as_ptr(), &mut function)
        };

        assert_eq!(result, sys::Result::SUCCESS);
        assert!(function.is_some());

        let name = std::ffi::CString::new("xrNotARealFunction").unwrap();
        let result = unsafe {
            xrGetInstanceProcAddr(sys::Instance::NULL, name.as_ptr(), &mut function)
        };

        assert_eq!(result, sys::Result::ERROR_FUNCTION_UNSUPPORTED);
        assert!(function.is_none());
    }

    #[test]
    pub fn two_call_array_idiom() {
        let items = [1u32, 2, 3];
        let mut count = 0;

        let result =
            unsafe { write_array(&items, 0, &mut count, std::ptr::null_mut()) };
        assert_eq!(result, sys::Result::SUCCESS);
        assert_eq!(count, 3);

        let mut small = [0u32; 2];
        let result = unsafe { write_array(&items, 2, &mut count, small.as_mut_ptr()) };
        assert_eq!(result, sys::Result::ERROR_SIZE_INSUFFICIENT);

        let mut exact = [0u32; 3];
        let result = unsafe { write_array(&items, 3, &mut count, exact.as_mut_ptr()) };
        assert_eq!(result, sys::Result::SUCCESS);
        assert_eq!(exact, items);
    }

    #[test]
    pub fn string_counts_include_the_terminator() {
        let mut count = 0;
        let mut buffer = [0 as c_char; 8];

        let result =
            unsafe { write_string("abc", buffer.len() as u32, &mut count, buffer.as_mut_ptr()) };

        assert_eq!(result, sys::Result::SUCCESS);
        assert_eq!(count, 4);
        assert_eq!(buffer[3], 0);
    }
}
