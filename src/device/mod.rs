//! The Device capability set (spec §3) and the session-event handler
//! plumbing of §4.6.
//!
//! The per-device low-level session acquire/release is an external
//! collaborator per spec §1 (it just exposes a `run(body, options)`
//! contract); this module therefore defines the *trait*, not a concrete
//! transport-backed implementation. [`friendly_usb::FriendlyUsbDevice`] is
//! kept from the teacher verbatim as the enumeration-time representation
//! DeviceList hands out before a device is acquired.

pub mod friendly_usb;
pub mod list;
pub mod mock;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::CoreError;

/// The four device-mode buckets a method can allow or require (spec §3's
/// `{normal, bootloader, initialize, seedless}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    Normal,
    Bootloader,
    Initialize,
    Seedless,
}

/// Returned by `hasUnexpectedMode` when the device's actual mode is not in
/// the method's allowed/required set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeException(pub DeviceMode);

impl ModeException {
    /// The single outbound tag used regardless of which mode tripped the
    /// check; the mode itself rides in the message payload (spec §4.5
    /// step 2).
    pub fn ui_tag(&self) -> &'static str {
        "UI.DEVICE_UNEXPECTED_MODE"
    }
}

/// Returned by `checkFirmwareRange`; each variant maps to one `UI.<name>`
/// outbound tag (spec §4.5 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareException {
    Outdated,
    UpdateRequired,
    Unknown,
}

impl FirmwareException {
    pub fn ui_tag(&self) -> &'static str {
        match self {
            FirmwareException::Outdated => "UI.FIRMWARE_OUTDATED",
            FirmwareException::UpdateRequired => "UI.FIRMWARE_NOT_SUPPORTED",
            FirmwareException::Unknown => "UI.FIRMWARE_NOT_COMPATIBLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStatus {
    Valid,
    Outdated,
    Required,
    Unknown,
}

/// Opaque feature blob, flattened only where the core itself branches on a
/// field (`needs_backup`, spec §4.5 step 4).
#[derive(Debug, Clone, Default)]
pub struct DeviceFeatures {
    pub needs_backup: bool,
    pub raw: Value,
}

/// One of the button-request codes the core recognizes by name; anything
/// else passes through as `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonRequestCode {
    Address,
    Other(String),
}

/// The user's response to a passphrase prompt, already NFKD-normalized by
/// the event bridge before it reaches the device (spec §4.6).
#[derive(Debug, Clone)]
pub struct PassphraseResponse {
    pub passphrase: String,
    pub passphrase_on_device: bool,
    pub cache: bool,
}

type Fut<T> = BoxFuture<'static, T>;

/// Handlers the Call Dispatcher attaches for the duration of a device
/// session (spec §4.5 "Event bridge wiring", §4.6). Each handler is the
/// full round trip: it awaits the popup, creates the UiPromise, emits the
/// outbound UI message, and resolves with whatever the device protocol
/// layer needs to continue.
pub struct DeviceEventHandlers {
    pub on_button: Box<dyn Fn(ButtonRequestCode, Option<Value>) -> Fut<()> + Send + Sync>,
    pub on_pin: Box<dyn Fn() -> Fut<Result<String, CoreError>> + Send + Sync>,
    pub on_word: Box<dyn Fn() -> Fut<Result<String, CoreError>> + Send + Sync>,
    pub on_passphrase: Box<dyn Fn() -> Fut<Result<PassphraseResponse, CoreError>> + Send + Sync>,
    pub on_passphrase_on_device: Box<dyn Fn() -> Fut<()> + Send + Sync>,
}

/// Options passed to `device.run` (spec §4.5 "Inner loop").
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub keep_session: bool,
    pub use_empty_passphrase: bool,
    pub skip_final_reload: bool,
}

/// The body executed inside a device session; returns the method's
/// success payload or a `CoreError` on failure.
pub type BodyFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<Value, CoreError>> + Send + 'a>;

#[async_trait]
pub trait Device: Send + Sync {
    fn device_path(&self) -> &str;

    async fn is_running(&self) -> bool;
    async fn is_loaded(&self) -> bool;
    async fn is_used_here(&self) -> bool;

    /// True when the device entry carries an enumeration-time error that
    /// makes it unusable for auto-selection (spec §4.4's "unreadable
    /// error" rule).
    async fn has_unreadable_error(&self) -> bool;

    async fn features(&self) -> DeviceFeatures;
    async fn firmware_status(&self) -> FirmwareStatus;

    async fn keep_session(&self) -> bool;
    async fn set_keep_session(&self, value: bool);

    async fn wait_for_first_run(&self);
    async fn set_instance(&self, instance: u32);
    async fn set_external_state(&self, state: Option<Vec<u8>>);
    async fn set_internal_state(&self, state: Option<Vec<u8>>);

    /// Returns `Some(state)` when the device's current state does not
    /// match `network`'s expectation (spec §4.5 step 8).
    async fn validate_state(&self, network: Option<Value>) -> Option<Vec<u8>>;

    async fn has_unexpected_mode(
        &self,
        allow: &[DeviceMode],
        require: &[DeviceMode],
    ) -> Option<ModeException>;

    async fn initialize(&self, use_empty_passphrase: bool) -> Result<(), CoreError>;
    async fn get_version(&self) -> Option<String>;

    /// Injects `err` into whatever `run` body is currently executing
    /// (spec §4.5 "Preemption").
    async fn override_with(&self, err: CoreError);

    async fn attach_handlers(&self, handlers: DeviceEventHandlers);
    async fn detach_handlers(&self);

    /// Runs `body` under the device's internal session queue, which
    /// serializes concurrent callers (spec §5 ordering guarantee (b)).
    async fn run<'a>(&'a self, body: BodyFn<'a>, opts: RunOptions) -> Result<Value, CoreError>;

    async fn cleanup(&self);

    /// Called when a popup-closed or timeout cancellation needs to unwind
    /// a session currently in use (spec §5 "Suspension points").
    async fn interruption_from_user(&self, err: CoreError);

    async fn to_message_object(&self) -> Value;
}
