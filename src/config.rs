//! Per-install runtime settings.
//!
//! On Windows the settings live under the `SOFTWARE\Parallax` registry key,
//! which the vendor tray tool writes. Elsewhere (developer builds, CI) the
//! same keys are read from a TOML file in the per-user data directory. Both
//! sources are optional; missing keys keep their defaults.

use {serde::Deserialize, std::path::PathBuf};

#[cfg(windows)]
const REGISTRY_KEY: &str = "SOFTWARE\\Parallax";

const CONFIG_FILENAME: &str = "parallax-openxr.toml";

/// Resolved settings with defaults applied.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// Re-center the seated origin when a session starts.
    pub recenter_on_startup: bool,

    /// Let applications hard-coded to the legacy vendor runtime start
    /// anyway.
    pub allow_legacy_runtime: bool,

    pub joystick_deadzone: f32,
    pub mirror_window: bool,

    /// Render-scale percentage for the upscaling pass; `None` disables it.
    pub upscale_percent: Option<u32>,

    /// Sharpening strength 0..1; zero disables the pass.
    pub sharpen: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recenter_on_startup: false,
            allow_legacy_runtime: true,
            joystick_deadzone: 0.0,
            mirror_window: false,
            upscale_percent: None,
            sharpen: 0.0,
        }
    }
}

/// Raw file representation; every key optional.
#[derive(Default, Deserialize)]
struct Data {
    recenter_on_startup: Option<i64>,
    allow_legacy_runtime: Option<i64>,
    joystick_deadzone: Option<f32>,
    mirror_window: Option<i64>,
    upscale_percent: Option<u32>,
    sharpen: Option<f32>,
}

impl RuntimeConfig {
    /// Reads the active settings; any failure falls back to defaults.
    pub fn load() -> Self {
        Self::from_data(read_data())
    }

    fn from_data(data: Data) -> Self {
        let defaults = Self::default();

        Self {
            recenter_on_startup: data
                .recenter_on_startup
                .map(|value| value != 0)
                .unwrap_or(defaults.recenter_on_startup),
            allow_legacy_runtime: data
                .allow_legacy_runtime
                .map(|value| value != 0)
                .unwrap_or(defaults.allow_legacy_runtime),
            joystick_deadzone: data
                .joystick_deadzone
                .unwrap_or(defaults.joystick_deadzone)
                .clamp(0.0, 1.0),
            mirror_window: data
                .mirror_window
                .map(|value| value != 0)
                .unwrap_or(defaults.mirror_window),
            upscale_percent: data
                .upscale_percent
                .filter(|percent| (25..=400).contains(percent)),
            sharpen: data.sharpen.unwrap_or(defaults.sharpen).clamp(0.0, 1.0),
        }
    }
}

/// Per-user data directory; the log file lives here too.
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "parallax-openxr")
        .map(|dirs| dirs.data_dir().to_owned())
}

#[cfg(not(windows))]
fn read_data() -> Data {
    use {log::warn, std::fs::read_to_string};

    let Some(path) = data_dir().map(|dir| dir.join(CONFIG_FILENAME)) else {
        return Data::default();
    };

    match read_to_string(&path) {
        Ok(text) => toml::from_str(&text).unwrap_or_else(|err| {
            warn!("unable to parse {}: {err}", path.display());

            Data::default()
        }),
        Err(_) => Data::default(),
    }
}

#[cfg(windows)]
fn read_data() -> Data {
    use windows::{
        core::HSTRING,
        Win32::System::Registry::{RegGetValueW, HKEY_LOCAL_MACHINE, RRF_RT_REG_DWORD},
    };

    fn read_dword(value_name: &str) -> Option<i64> {
        let mut data = 0u32;
        let mut size = std::mem::size_of::<u32>() as u32;

        // Safety: fixed-size out-parameters, sized by `size`.
        let status = unsafe {
            RegGetValueW(
                HKEY_LOCAL_MACHINE,
                &HSTRING::from(REGISTRY_KEY),
                &HSTRING::from(value_name),
                RRF_RT_REG_DWORD,
                None,
                Some(&mut data as *mut _ as *mut _),
                Some(&mut size),
            )
        };

        status.is_ok().then_some(data as i64)
    }

    Data {
        recenter_on_startup: read_dword("recenter_on_startup"),
        allow_legacy_runtime: read_dword("allow_legacy_runtime"),
        joystick_deadzone: read_dword("joystick_deadzone_percent")
            .map(|value| value as f32 / 100.0),
        mirror_window: read_dword("mirror_window"),
        upscale_percent: read_dword("upscale_percent")
            .and_then(|value| u32::try_from(value).ok()),
        sharpen: read_dword("sharpen_percent").map(|value| value as f32 / 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn defaults_apply_to_missing_keys() {
        let config = RuntimeConfig::from_data(Data::default());

        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    pub fn integers_become_switches() {
        let config = RuntimeConfig::from_data(Data {
            recenter_on_startup: Some(1),
            allow_legacy_runtime: Some(0),
            ..Data::default()
        });

        assert!(config.recenter_on_startup);
        assert!(!config.allow_legacy_runtime);
    }

    #[test]
    pub fn out_of_range_values_are_clamped_or_dropped() {
        let config = RuntimeConfig::from_data(Data {
            joystick_deadzone: Some(3.0),
            upscale_percent: Some(999),
            sharpen: Some(-1.0),
            ..Data::default()
        });

        assert_eq!(config.joystick_deadzone, 1.0);
        assert_eq!(config.upscale_percent, None);
        assert_eq!(config.sharpen, 0.0);
    }

    #[test]
    pub fn toml_keys_parse() {
        let data: Data =
            toml::from_str("recenter_on_startup = 1\nupscale_percent = 150\nsharpen = 0.4")
                .unwrap();
        let config = RuntimeConfig::from_data(data);

        assert!(config.recenter_on_startup);
        assert_eq!(config.upscale_percent, Some(150));
        assert!((config.sharpen - 0.4).abs() < f32::EPSILON);
    }
}
