//! Closed error taxonomy for the core (spec §6/§7).
//!
//! Mirrors how `keepkey-rust::transport::hid::HidError` derives
//! `thiserror::Error` over a closed set of failure modes instead of
//! stringly-typed errors. `Device`/`Method` are this crate's own traits, not
//! a foreign error surface, so their fallible methods already return
//! `CoreError` directly; there is no heterogeneous boundary here for
//! `anyhow` to paper over.

use thiserror::Error;

/// The string-stable error codes from spec §6. `Display` renders exactly the
/// code name so it can be serialized into `payload.error` unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Transport_Missing")]
    TransportMissing,
    #[error("Device_NotFound")]
    DeviceNotFound,
    #[error("Device_CallInProgress")]
    DeviceCallInProgress,
    #[error("Device_Disconnected")]
    DeviceDisconnected,
    #[error("Device_InvalidState")]
    DeviceInvalidState,
    #[error("Device_FwException: {0}")]
    DeviceFwException(String),
    #[error("Device_ModeException: {0}")]
    DeviceModeException(String),
    #[error("Method_InvalidParameter: {0}")]
    MethodInvalidParameter(String),
    #[error("Method_NotAllowed")]
    MethodNotAllowed,
    #[error("Method_Override")]
    MethodOverride,
    #[error("Method_Cancel: {0}")]
    MethodCancel(String),
    #[error("Method_Interrupted")]
    MethodInterrupted,
    #[error("Method_PermissionsNotGranted")]
    MethodPermissionsNotGranted,
    /// Escape hatch for a method's own `run()` failure; the message is
    /// carried verbatim into `payload.error` but the code stays generic.
    #[error("{0}")]
    MethodFailure(String),
}

impl CoreError {
    /// The stable code string, independent of any interpolated detail.
    /// This is what spec §6 calls the "string-stable" error code.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::TransportMissing => "Transport_Missing",
            CoreError::DeviceNotFound => "Device_NotFound",
            CoreError::DeviceCallInProgress => "Device_CallInProgress",
            CoreError::DeviceDisconnected => "Device_Disconnected",
            CoreError::DeviceInvalidState => "Device_InvalidState",
            CoreError::DeviceFwException(_) => "Device_FwException",
            CoreError::DeviceModeException(_) => "Device_ModeException",
            CoreError::MethodInvalidParameter(_) => "Method_InvalidParameter",
            CoreError::MethodNotAllowed => "Method_NotAllowed",
            CoreError::MethodOverride => "Method_Override",
            CoreError::MethodCancel(_) => "Method_Cancel",
            CoreError::MethodInterrupted => "Method_Interrupted",
            CoreError::MethodPermissionsNotGranted => "Method_PermissionsNotGranted",
            CoreError::MethodFailure(_) => "Method_Failure",
        }
    }

    /// Two string-matched error messages the device layer must preserve
    /// verbatim (spec §7); these helpers are the single place that matches
    /// them so retry/enumerate logic never re-implements the comparison.
    pub fn is_invalid_pin(message: &str) -> bool {
        message == INVALID_PIN_ERROR_MESSAGE
    }

    pub fn is_wrong_previous_session(message: &str) -> bool {
        message == WRONG_PREVIOUS_SESSION_ERROR_MESSAGE
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({ "code": self.code(), "error": self.to_string() })
    }
}

pub const INVALID_PIN_ERROR_MESSAGE: &str = "Invalid PIN";
pub const WRONG_PREVIOUS_SESSION_ERROR_MESSAGE: &str = "wrong previous session";
