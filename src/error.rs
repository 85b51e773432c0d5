//! Runtime error types and their mapping onto the OpenXR result codes.

use {
    log::warn,
    openxr_sys as sys,
    std::{
        error::Error,
        fmt::{Display, Formatter},
    },
};

/// Internal error carried by the fallible runtime paths.
///
/// Every variant corresponds to exactly one `XrResult` error code; the
/// conversion happens once, at the API boundary, through [`RuntimeError::xr`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeError {
    /// A caller-supplied structure type, enum or pointer is wrong.
    Validation,

    /// The given handle does not refer to a live object.
    HandleInvalid,

    /// The system id is unknown or the system was never queried.
    SystemInvalid,

    /// The requested path string is malformed.
    PathInvalid,

    /// The call violates the required ordering of the protocol.
    CallOrderInvalid,

    /// `xrBeginSession` before the session reached READY.
    SessionNotReady,

    /// The session is not in a running state.
    SessionNotRunning,

    /// `xrEndSession` outside of STOPPING.
    SessionNotStopping,

    /// A singleton (instance, session) already exists.
    LimitReached,

    /// An action or action-set name collides with a live sibling.
    NameDuplicated,

    /// A two-call enumeration was given a buffer that is too small.
    SizeInsufficient,

    /// The swapchain format is not in the supported set.
    SwapchainFormatUnsupported,

    /// A sub-image rectangle falls outside of its swapchain.
    SwapchainRectInvalid,

    /// The frame's layer list exceeds the backend maximum.
    LayerLimitExceeded,

    /// A layer structure type is not one the runtime composes.
    LayerInvalid,

    /// The requested create flag or capability is not available.
    FeatureUnsupported,

    /// The function belongs to an extension that is not enabled.
    FunctionUnsupported,

    /// A requested extension is not in the runtime table.
    ExtensionNotPresent,

    /// The application requested an incompatible API major version.
    ApiVersionUnsupported,

    /// Only head-mounted-display form factors exist here.
    FormFactorUnsupported,

    /// The HMD service or headset is not reachable right now.
    FormFactorUnavailable,

    /// Only primary-stereo view configurations are composed.
    ViewConfigurationUnsupported,

    /// Reference space type outside of VIEW/LOCAL/STAGE.
    ReferenceSpaceUnsupported,

    /// Only the OPAQUE environment blend mode is composed.
    EnvironmentBlendModeUnsupported,

    /// The application device does not match the HMD adapter, or no
    /// graphics binding was supplied.
    GraphicsDeviceInvalid,

    /// `xrCreateSession` before any `xrGet*GraphicsRequirements*` call.
    GraphicsRequirementsCallMissing,

    /// The requested display refresh rate is not the cached rate.
    DisplayRefreshRateUnsupported,

    /// The headset disconnected; the session is lost.
    SessionLost,

    /// A backend or graphics call failed in a way the runtime does not
    /// recover from.
    RuntimeFailure,
}

impl RuntimeError {
    /// The `XrResult` this error surfaces as.
    pub fn xr(self) -> sys::Result {
        match self {
            Self::Validation => sys::Result::ERROR_VALIDATION_FAILURE,
            Self::HandleInvalid => sys::Result::ERROR_HANDLE_INVALID,
            Self::SystemInvalid => sys::Result::ERROR_SYSTEM_INVALID,
            Self::PathInvalid => sys::Result::ERROR_PATH_FORMAT_INVALID,
            Self::CallOrderInvalid => sys::Result::ERROR_CALL_ORDER_INVALID,
            Self::SessionNotReady => sys::Result::ERROR_SESSION_NOT_READY,
            Self::SessionNotRunning => sys::Result::ERROR_SESSION_NOT_RUNNING,
            Self::SessionNotStopping => sys::Result::ERROR_SESSION_NOT_STOPPING,
            Self::LimitReached => sys::Result::ERROR_LIMIT_REACHED,
            Self::NameDuplicated => sys::Result::ERROR_NAME_DUPLICATED,
            Self::SizeInsufficient => sys::Result::ERROR_SIZE_INSUFFICIENT,
            Self::SwapchainFormatUnsupported => sys::Result::ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED,
            Self::SwapchainRectInvalid => sys::Result::ERROR_SWAPCHAIN_RECT_INVALID,
            Self::LayerLimitExceeded => sys::Result::ERROR_LAYER_LIMIT_EXCEEDED,
            Self::LayerInvalid => sys::Result::ERROR_LAYER_INVALID,
            Self::FeatureUnsupported => sys::Result::ERROR_FEATURE_UNSUPPORTED,
            Self::FunctionUnsupported => sys::Result::ERROR_FUNCTION_UNSUPPORTED,
            Self::ExtensionNotPresent => sys::Result::ERROR_EXTENSION_NOT_PRESENT,
            Self::ApiVersionUnsupported => sys::Result::ERROR_API_VERSION_UNSUPPORTED,
            Self::FormFactorUnsupported => sys::Result::ERROR_FORM_FACTOR_UNSUPPORTED,
            Self::FormFactorUnavailable => sys::Result::ERROR_FORM_FACTOR_UNAVAILABLE,
            Self::ViewConfigurationUnsupported => {
                sys::Result::ERROR_VIEW_CONFIGURATION_TYPE_UNSUPPORTED
            }
            Self::ReferenceSpaceUnsupported => sys::Result::ERROR_REFERENCE_SPACE_UNSUPPORTED,
            Self::EnvironmentBlendModeUnsupported => {
                sys::Result::ERROR_ENVIRONMENT_BLEND_MODE_UNSUPPORTED
            }
            Self::GraphicsDeviceInvalid => sys::Result::ERROR_GRAPHICS_DEVICE_INVALID,
            Self::GraphicsRequirementsCallMissing => {
                sys::Result::ERROR_GRAPHICS_REQUIREMENTS_CALL_MISSING
            }
            Self::DisplayRefreshRateUnsupported => {
                sys::Result::ERROR_DISPLAY_REFRESH_RATE_UNSUPPORTED_FB
            }
            Self::SessionLost => sys::Result::ERROR_SESSION_LOST,
            Self::RuntimeFailure => sys::Result::ERROR_RUNTIME_FAILURE,
        }
    }
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for RuntimeError {}

impl From<crate::backend::BackendError> for RuntimeError {
    fn from(err: crate::backend::BackendError) -> Self {
        warn!("backend: {err}");

        Self::RuntimeFailure
    }
}

/// Result alias used throughout the fallible runtime paths.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Collapses an internal result into the `XrResult` returned over the ABI.
pub fn to_xr(result: RuntimeResult<sys::Result>) -> sys::Result {
    match result {
        Ok(code) => code,
        Err(err) => err.xr(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn maps_one_to_one() {
        assert_eq!(
            RuntimeError::Validation.xr(),
            sys::Result::ERROR_VALIDATION_FAILURE
        );
        assert_eq!(
            RuntimeError::SwapchainRectInvalid.xr(),
            sys::Result::ERROR_SWAPCHAIN_RECT_INVALID
        );
        assert_eq!(
            RuntimeError::RuntimeFailure.xr(),
            sys::Result::ERROR_RUNTIME_FAILURE
        );
        assert_eq!(to_xr(Ok(sys::Result::FRAME_DISCARDED)), sys::Result::FRAME_DISCARDED);
        assert_eq!(
            to_xr(Err(RuntimeError::CallOrderInvalid)),
            sys::Result::ERROR_CALL_ORDER_INVALID
        );
    }
}
