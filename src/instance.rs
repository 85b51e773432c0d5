//! The runtime instance: extension negotiation, path interning, event
//! delivery and the entity tables that outlive any session.
//!
//! At most one instance exists per process; the slot lives in
//! [`crate::entry`] and enforces the limit.

use {
    crate::{
        backend::{Backend, HmdInfo},
        error::{RuntimeError, RuntimeResult},
        input::InputState,
        session::Session,
        time::TimeConverter,
    },
    log::info,
    openxr_sys as sys,
    parking_lot::{Mutex, RwLock},
    std::{
        collections::HashMap,
        ffi::CStr,
        os::raw::c_char,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

pub const RUNTIME_NAME: &str = "parallax-openxr";

/// Reported through `xrGetInstanceProperties`.
pub const RUNTIME_VERSION: sys::Version = sys::Version::new(0, 9, 2);

/// One row of the extension table.
#[derive(Clone, Copy, Debug)]
pub struct ExtensionEntry {
    pub name: &'static str,
    pub version: u32,
}

/// Extensions this runtime implements, in enumeration order.
pub const EXTENSION_TABLE: &[ExtensionEntry] = &[
    #[cfg(windows)]
    ExtensionEntry {
        name: "XR_KHR_D3D11_enable",
        version: 9,
    },
    #[cfg(windows)]
    ExtensionEntry {
        name: "XR_KHR_D3D12_enable",
        version: 9,
    },
    ExtensionEntry {
        name: "XR_KHR_vulkan_enable",
        version: 8,
    },
    #[cfg(windows)]
    ExtensionEntry {
        name: "XR_KHR_opengl_enable",
        version: 10,
    },
    ExtensionEntry {
        name: "XR_KHR_composition_layer_depth",
        version: 6,
    },
    ExtensionEntry {
        name: "XR_KHR_composition_layer_cylinder",
        version: 4,
    },
    ExtensionEntry {
        name: "XR_KHR_composition_layer_cube",
        version: 8,
    },
    #[cfg(windows)]
    ExtensionEntry {
        name: "XR_KHR_win32_convert_performance_counter_time",
        version: 1,
    },
    ExtensionEntry {
        name: "XR_KHR_visibility_mask",
        version: 2,
    },
    ExtensionEntry {
        name: "XR_FB_display_refresh_rate",
        version: 1,
    },
];

/// Which extensions the application enabled at instance creation.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnabledExtensions {
    pub d3d11: bool,
    pub d3d12: bool,
    pub vulkan: bool,
    pub opengl: bool,
    pub depth: bool,
    pub cylinder: bool,
    pub cube: bool,
    pub win32_time: bool,
    pub visibility_mask: bool,
    pub refresh_rate: bool,
}

impl EnabledExtensions {
    fn enable(&mut self, name: &str) -> RuntimeResult<()> {
        if !EXTENSION_TABLE.iter().any(|entry| entry.name == name) {
            return Err(RuntimeError::ExtensionNotPresent);
        }

        match name {
            "XR_KHR_D3D11_enable" => self.d3d11 = true,
            "XR_KHR_D3D12_enable" => self.d3d12 = true,
            "XR_KHR_vulkan_enable" => self.vulkan = true,
            "XR_KHR_opengl_enable" => self.opengl = true,
            "XR_KHR_composition_layer_depth" => self.depth = true,
            "XR_KHR_composition_layer_cylinder" => self.cylinder = true,
            "XR_KHR_composition_layer_cube" => self.cube = true,
            "XR_KHR_win32_convert_performance_counter_time" => self.win32_time = true,
            "XR_KHR_visibility_mask" => self.visibility_mask = true,
            "XR_FB_display_refresh_rate" => self.refresh_rate = true,
            _ => (),
        }

        Ok(())
    }
}

/// Interned `XrPath` strings. Paths are 1-based indices into the vector.
#[derive(Debug, Default)]
struct PathTable {
    strings: Vec<String>,
    by_string: HashMap<String, u64>,
}

impl PathTable {
    fn intern(&mut self, string: &str) -> RuntimeResult<u64> {
        if !Self::is_well_formed(string) {
            return Err(RuntimeError::PathInvalid);
        }

        if let Some(path) = self.by_string.get(string) {
            return Ok(*path);
        }

        self.strings.push(string.to_owned());
        let path = self.strings.len() as u64;
        self.by_string.insert(string.to_owned(), path);

        Ok(path)
    }

    fn lookup(&self, path: u64) -> Option<&str> {
        let index = usize::try_from(path).ok()?.checked_sub(1)?;

        self.strings.get(index).map(String::as_str)
    }

    fn is_well_formed(string: &str) -> bool {
        if string.is_empty() || string.len() > 255 || !string.starts_with('/') {
            return false;
        }

        if string.ends_with('/') {
            return false;
        }

        string.split('/').skip(1).all(|component| {
            !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c))
        })
    }
}

/// An event ready to be returned from `xrPollEvent`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    SessionStateChanged {
        state: sys::SessionState,
        time: sys::Time,
    },
    InteractionProfileChanged,
}

/// The per-process runtime instance.
pub struct Instance {
    pub backend: Arc<dyn Backend>,
    pub enabled: EnabledExtensions,
    pub time: TimeConverter,
    pub application_name: String,

    /// Cached headset description, filled by `xrGetSystem` and the
    /// graphics-requirements queries.
    hmd_info: Mutex<Option<HmdInfo>>,

    system_created: AtomicBool,
    graphics_requirement_queried: AtomicBool,

    paths: Mutex<PathTable>,
    pub(crate) input: Mutex<InputState>,
    pub(crate) session: RwLock<Option<Arc<Session>>>,
}

impl Instance {
    /// Validates the create info and builds the instance.
    #[profiling::function]
    pub fn create(
        backend: Arc<dyn Backend>,
        create_info: &sys::InstanceCreateInfo,
    ) -> RuntimeResult<Self> {
        if create_info.ty != sys::StructureType::INSTANCE_CREATE_INFO {
            return Err(RuntimeError::Validation);
        }

        if create_info.application_info.api_version.major() != 1 {
            return Err(RuntimeError::ApiVersionUnsupported);
        }

        let mut enabled = EnabledExtensions::default();

        if create_info.enabled_extension_count > 0 && create_info.enabled_extension_names.is_null()
        {
            return Err(RuntimeError::Validation);
        }

        // Safety: the loader hands over `enabled_extension_count` C strings.
        let names = if create_info.enabled_extension_count == 0 {
            &[]
        } else {
            unsafe {
                std::slice::from_raw_parts(
                    create_info.enabled_extension_names,
                    create_info.enabled_extension_count as usize,
                )
            }
        };
        for name in names {
            let name = unsafe { CStr::from_ptr(*name) }
                .to_str()
                .map_err(|_| RuntimeError::Validation)?;

            enabled.enable(name)?;
        }

        let application_name = unsafe {
            CStr::from_ptr(create_info.application_info.application_name.as_ptr())
        }
        .to_string_lossy()
        .into_owned();

        let time = TimeConverter::calibrate(backend.as_ref());

        info!(
            "instance for {:?} (backend {})",
            application_name,
            backend.version()
        );

        Ok(Self {
            backend,
            enabled,
            time,
            application_name,
            hmd_info: Mutex::new(None),
            system_created: AtomicBool::new(false),
            graphics_requirement_queried: AtomicBool::new(false),
            paths: Mutex::new(PathTable::default()),
            input: Mutex::new(InputState::default()),
            session: RwLock::new(None),
        })
    }

    /// `xrGetSystem`: flags the system as created once the headset answers.
    pub fn get_system(&self, form_factor: sys::FormFactor) -> RuntimeResult<sys::SystemId> {
        if form_factor != sys::FormFactor::HEAD_MOUNTED_DISPLAY {
            return Err(RuntimeError::FormFactorUnsupported);
        }

        let info = self
            .backend
            .hmd_info()
            .map_err(|_| RuntimeError::FormFactorUnavailable)?;

        *self.hmd_info.lock() = Some(info);
        self.system_created.store(true, Ordering::Release);

        Ok(sys::SystemId::from_raw(1))
    }

    pub fn system_created(&self) -> bool {
        self.system_created.load(Ordering::Acquire)
    }

    pub fn check_system(&self, system_id: sys::SystemId) -> RuntimeResult<()> {
        if !self.system_created() || system_id.into_raw() != 1 {
            return Err(RuntimeError::SystemInvalid);
        }

        Ok(())
    }

    /// Cached headset description; present after a successful `xrGetSystem`.
    pub fn hmd_info(&self) -> RuntimeResult<HmdInfo> {
        self.hmd_info
            .lock()
            .clone()
            .ok_or(RuntimeError::SystemInvalid)
    }

    /// Records that a `xrGet*GraphicsRequirements*` query ran, which
    /// `xrCreateSession` requires.
    pub fn mark_graphics_requirement_queried(&self) {
        self.graphics_requirement_queried
            .store(true, Ordering::Release);
    }

    pub fn graphics_requirement_queried(&self) -> bool {
        self.graphics_requirement_queried.load(Ordering::Acquire)
    }

    /// The live session, if any.
    pub fn session(&self) -> RuntimeResult<Arc<Session>> {
        self.session
            .read()
            .clone()
            .ok_or(RuntimeError::HandleInvalid)
    }

    pub fn check_session(&self, session: sys::Session) -> RuntimeResult<Arc<Session>> {
        if session.into_raw() != 1 {
            return Err(RuntimeError::HandleInvalid);
        }

        self.session()
    }

    /// `xrStringToPath`.
    pub fn string_to_path(&self, string: &str) -> RuntimeResult<sys::Path> {
        self.paths
            .lock()
            .intern(string)
            .map(sys::Path::from_raw)
    }

    /// `xrPathToString`.
    pub fn path_to_string(&self, path: sys::Path) -> RuntimeResult<String> {
        self.paths
            .lock()
            .lookup(path.into_raw())
            .map(str::to_owned)
            .ok_or(RuntimeError::PathInvalid)
    }

    /// `xrPollEvent`: session state changes first, then input notifications.
    pub fn poll_event(&self) -> Option<Event> {
        let session = self.session.read().clone();

        if let Some(session) = session {
            let hmd_ready = self
                .backend
                .hmd_status()
                .map(|status| status.connected())
                .unwrap_or_default();
            let now = self.backend.time_now();

            if let Some(event) = session.machine.lock().pop_event(hmd_ready, now) {
                return Some(Event::SessionStateChanged {
                    state: event.state,
                    time: self.time.backend_to_xr(event.time),
                });
            }
        }

        if self.input.lock().take_profile_changed() {
            return Some(Event::InteractionProfileChanged);
        }

        None
    }
}

/// Copies a UTF-8 string into a fixed-size `char` array field, truncating to
/// fit and always NUL-terminating.
pub fn write_c_string(target: &mut [c_char], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(target.len() - 1);

    for (i, byte) in bytes[..len].iter().enumerate() {
        target[i] = *byte as c_char;
    }

    target[len] = 0;
}

#[cfg(test)]
pub mod tests {
    use {super::*, crate::backend::mock::MockHmd};

    pub fn test_instance() -> Instance {
        let backend = Arc::new(MockHmd::default());
        let names = EXTENSION_TABLE
            .iter()
            .map(|entry| std::ffi::CString::new(entry.name).unwrap())
            .collect::<Vec<_>>();
        let pointers = names.iter().map(|name| name.as_ptr()).collect::<Vec<_>>();

        let mut application_info = sys::ApplicationInfo {
            application_name: [0; sys::MAX_APPLICATION_NAME_SIZE],
            application_version: 1,
            engine_name: [0; sys::MAX_ENGINE_NAME_SIZE],
            engine_version: 0,
            api_version: sys::Version::new(1, 0, 34),
        };
        write_c_string(&mut application_info.application_name, "instance tests");

        let create_info = sys::InstanceCreateInfo {
            ty: sys::StructureType::INSTANCE_CREATE_INFO,
            next: std::ptr::null(),
            create_flags: sys::InstanceCreateFlags::EMPTY,
            application_info,
            enabled_api_layer_count: 0,
            enabled_api_layer_names: std::ptr::null(),
            enabled_extension_count: pointers.len() as u32,
            enabled_extension_names: pointers.as_ptr(),
        };

        Instance::create(backend, &create_info).unwrap()
    }

    #[test]
    pub fn rejects_wrong_major_version() {
        let backend = Arc::new(MockHmd::default());
        let create_info = sys::InstanceCreateInfo {
            ty: sys::StructureType::INSTANCE_CREATE_INFO,
            next: std::ptr::null(),
            create_flags: sys::InstanceCreateFlags::EMPTY,
            application_info: sys::ApplicationInfo {
                application_name: [0; sys::MAX_APPLICATION_NAME_SIZE],
                application_version: 0,
                engine_name: [0; sys::MAX_ENGINE_NAME_SIZE],
                engine_version: 0,
                api_version: sys::Version::new(2, 0, 0),
            },
            enabled_api_layer_count: 0,
            enabled_api_layer_names: std::ptr::null(),
            enabled_extension_count: 0,
            enabled_extension_names: std::ptr::null(),
        };

        assert_eq!(
            Instance::create(backend, &create_info).err(),
            Some(RuntimeError::ApiVersionUnsupported)
        );
    }

    #[test]
    pub fn rejects_unknown_extension() {
        let backend = Arc::new(MockHmd::default());
        let bogus = std::ffi::CString::new("XR_EXT_does_not_exist").unwrap();
        let pointers = [bogus.as_ptr()];

        let create_info = sys::InstanceCreateInfo {
            ty: sys::StructureType::INSTANCE_CREATE_INFO,
            next: std::ptr::null(),
            create_flags: sys::InstanceCreateFlags::EMPTY,
            application_info: sys::ApplicationInfo {
                application_name: [0; sys::MAX_APPLICATION_NAME_SIZE],
                application_version: 0,
                engine_name: [0; sys::MAX_ENGINE_NAME_SIZE],
                engine_version: 0,
                api_version: sys::Version::new(1, 0, 0),
            },
            enabled_api_layer_count: 0,
            enabled_api_layer_names: std::ptr::null(),
            enabled_extension_count: 1,
            enabled_extension_names: pointers.as_ptr(),
        };

        assert_eq!(
            Instance::create(backend, &create_info).err(),
            Some(RuntimeError::ExtensionNotPresent)
        );
    }

    #[test]
    pub fn path_round_trip_and_interning() {
        let instance = test_instance();

        let path = instance.string_to_path("/user/hand/left").unwrap();
        let same = instance.string_to_path("/user/hand/left").unwrap();
        let other = instance.string_to_path("/user/hand/right").unwrap();

        assert_eq!(path, same);
        assert_ne!(path, other);
        assert_eq!(instance.path_to_string(path).unwrap(), "/user/hand/left");
    }

    #[test]
    pub fn malformed_paths_are_rejected() {
        let instance = test_instance();

        for bad in ["", "user/hand", "/user/hand/", "/User/Hand", "/user//hand"] {
            assert_eq!(
                instance.string_to_path(bad).err(),
                Some(RuntimeError::PathInvalid),
                "{bad:?}"
            );
        }
    }

    #[test]
    pub fn unknown_path_lookup_fails() {
        let instance = test_instance();

        assert_eq!(
            instance.path_to_string(sys::Path::from_raw(42)).err(),
            Some(RuntimeError::PathInvalid)
        );
    }

    #[test]
    pub fn get_system_requires_hmd() {
        let instance = test_instance();

        assert_eq!(
            instance.get_system(sys::FormFactor::HANDHELD_DISPLAY).err(),
            Some(RuntimeError::FormFactorUnsupported)
        );

        instance
            .get_system(sys::FormFactor::HEAD_MOUNTED_DISPLAY)
            .unwrap();
        assert!(instance.system_created());
    }

    #[test]
    pub fn poll_event_drains_session_states_in_order() {
        let instance = test_instance();
        let session =
            crate::session::Session::create_headless(Arc::clone(&instance.backend)).unwrap();
        *instance.session.write() = Some(session);

        // Creation queued IDLE; delivering it arms READY.
        let Some(Event::SessionStateChanged { state, .. }) = instance.poll_event() else {
            panic!("expected a state event");
        };
        assert_eq!(state, sys::SessionState::IDLE);

        let Some(Event::SessionStateChanged { state, time }) = instance.poll_event() else {
            panic!("expected a state event");
        };
        assert_eq!(state, sys::SessionState::READY);
        assert!(time.as_nanos() > 0);

        assert_eq!(instance.poll_event(), None);
    }

    #[test]
    pub fn c_string_writer_truncates_and_terminates() {
        let mut buffer = [0 as c_char; 8];

        write_c_string(&mut buffer, "a-very-long-name");

        assert_eq!(buffer[7], 0);
        assert_eq!(buffer[0], b'a' as c_char);
    }
}
