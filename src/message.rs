//! The `CoreMessage` envelope and event-tag vocabulary (spec §3, §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four broad event classes an envelope can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventClass {
    CoreEvent,
    ResponseEvent,
    DeviceEvent,
    TransportEvent,
    UiEvent,
}

/// A `{event, type, id?, payload?, success?}` envelope, serialized exactly
/// as spec §6 describes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreMessage {
    pub event: EventClass,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl CoreMessage {
    pub fn response(id: u32, success: bool, payload: Value) -> Self {
        CoreMessage {
            event: EventClass::ResponseEvent,
            kind: "RESPONSE".into(),
            id: Some(id),
            payload: Some(payload),
            success: Some(success),
        }
    }

    pub fn ui(kind: impl Into<String>, payload: Option<Value>) -> Self {
        CoreMessage {
            event: EventClass::UiEvent,
            kind: kind.into(),
            id: None,
            payload,
            success: None,
        }
    }

    pub fn device(kind: impl Into<String>, payload: Option<Value>) -> Self {
        CoreMessage {
            event: EventClass::DeviceEvent,
            kind: kind.into(),
            id: None,
            payload,
            success: None,
        }
    }

    pub fn transport(kind: impl Into<String>, payload: Option<Value>) -> Self {
        CoreMessage {
            event: EventClass::TransportEvent,
            kind: kind.into(),
            id: None,
            payload,
            success: None,
        }
    }

    pub fn popup(kind: impl Into<String>) -> Self {
        CoreMessage {
            event: EventClass::CoreEvent,
            kind: kind.into(),
            id: None,
            payload: None,
            success: None,
        }
    }
}

/// Inbound event types accepted even from an untrusted origin (spec §4.3/§6).
pub const SAFE_SET: &[&str] = &[
    "IFRAME.CALL",
    "POPUP.CLOSED",
    "UI.CUSTOM_MESSAGE_RESPONSE",
    "UI.LOGIN_CHALLENGE_RESPONSE",
    "TRANSPORT.DISABLE_WEBUSB",
];

pub fn is_safe_type(kind: &str) -> bool {
    SAFE_SET.contains(&kind)
}

pub mod tags {
    pub const POPUP_HANDSHAKE: &str = "POPUP.HANDSHAKE";
    pub const POPUP_CLOSED: &str = "POPUP.CLOSED";
    pub const POPUP_CANCEL_POPUP_REQUEST: &str = "POPUP.CANCEL_POPUP_REQUEST";
    pub const TRANSPORT_DISABLE_WEBUSB: &str = "TRANSPORT.DISABLE_WEBUSB";
    pub const TRANSPORT_ERROR: &str = "TRANSPORT.ERROR";
    pub const TRANSPORT_START: &str = "TRANSPORT.START";
    pub const IFRAME_CALL: &str = "IFRAME.CALL";

    pub const UI_RECEIVE_DEVICE: &str = "UI.RECEIVE_DEVICE";
    pub const UI_SELECT_DEVICE: &str = "UI.SELECT_DEVICE";
    pub const UI_RECEIVE_PIN: &str = "UI.RECEIVE_PIN";
    pub const UI_RECEIVE_WORD: &str = "UI.RECEIVE_WORD";
    pub const UI_RECEIVE_PASSPHRASE: &str = "UI.RECEIVE_PASSPHRASE";
    pub const UI_CHANGE_ACCOUNT: &str = "UI.CHANGE_ACCOUNT";
    pub const UI_INVALID_PASSPHRASE_ACTION: &str = "UI.INVALID_PASSPHRASE_ACTION";
    pub const UI_CUSTOM_MESSAGE_RESPONSE: &str = "UI.CUSTOM_MESSAGE_RESPONSE";
    pub const UI_LOGIN_CHALLENGE_RESPONSE: &str = "UI.LOGIN_CHALLENGE_RESPONSE";

    pub const UI_REQUEST_UI_WINDOW: &str = "UI.REQUEST_UI_WINDOW";
    pub const UI_CLOSE_UI_WINDOW: &str = "UI.CLOSE_UI_WINDOW";
    pub const UI_TRANSPORT: &str = "UI.TRANSPORT";
    pub const UI_REQUEST_BUTTON: &str = "UI.REQUEST_BUTTON";
    pub const UI_REQUEST_PIN: &str = "UI.REQUEST_PIN";
    pub const UI_INVALID_PIN: &str = "UI.INVALID_PIN";
    pub const UI_REQUEST_WORD: &str = "UI.REQUEST_WORD";
    pub const UI_REQUEST_PASSPHRASE: &str = "UI.REQUEST_PASSPHRASE";
    pub const UI_REQUEST_PASSPHRASE_ON_DEVICE: &str = "UI.REQUEST_PASSPHRASE_ON_DEVICE";
    pub const UI_INVALID_PASSPHRASE: &str = "UI.INVALID_PASSPHRASE";
    pub const UI_DEVICE_NEEDS_BACKUP: &str = "UI.DEVICE_NEEDS_BACKUP";
    pub const UI_FIRMWARE_OUTDATED: &str = "UI.FIRMWARE_OUTDATED";
    pub const UI_ADDRESS_VALIDATION: &str = "UI.ADDRESS_VALIDATION";

    pub const DEVICE_BUTTON: &str = "DEVICE.BUTTON";
    pub const DEVICE_CONNECT: &str = "DEVICE.CONNECT";
    pub const DEVICE_CONNECT_UNACQUIRED: &str = "DEVICE.CONNECT_UNACQUIRED";
    pub const DEVICE_DISCONNECT: &str = "DEVICE.DISCONNECT";
    pub const DEVICE_CHANGED: &str = "DEVICE.CHANGED";
}
