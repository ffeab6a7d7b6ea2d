//! The Method capability set (spec §3) and the `MethodContext` that
//! replaces the original's `method.postMessage = …` callback plumbing
//! (spec §9 design note).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::deferred::UiPromiseRegistry;
use crate::device::{ButtonRequestCode, DeviceMode, FirmwareException};
use crate::error::CoreError;
use crate::message::CoreMessage;
use crate::popup::PopupPromise;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
    Management,
}

/// The fixed input shape every method call carries (spec §3 "Method
/// *Inputs*"). Concrete `Method` implementations own their own extra
/// parameters; this is only the subset the core itself branches on.
#[derive(Debug, Clone)]
pub struct MethodParams {
    pub response_id: u32,
    pub device_path: Option<String>,
    pub device_instance: u32,
    pub device_state: Option<Vec<u8>>,
    pub network: Option<Value>,
    pub required_permissions: Vec<Permission>,
    pub allow_device_mode: Vec<DeviceMode>,
    pub require_device_mode: Vec<DeviceMode>,
    pub use_device: bool,
    pub use_ui: bool,
    pub use_empty_passphrase: bool,
    pub use_device_state: bool,
    pub keep_session: bool,
    pub skip_final_reload: bool,
    pub override_previous_call: bool,
    pub debug_link: bool,
    pub has_expected_device_state: bool,
    pub name: String,
}

impl Default for MethodParams {
    fn default() -> Self {
        MethodParams {
            response_id: 0,
            device_path: None,
            device_instance: 0,
            device_state: None,
            network: None,
            required_permissions: Vec::new(),
            allow_device_mode: Vec::new(),
            require_device_mode: Vec::new(),
            use_device: true,
            use_ui: true,
            use_empty_passphrase: false,
            use_device_state: false,
            keep_session: false,
            skip_final_reload: false,
            override_previous_call: false,
            debug_link: false,
            has_expected_device_state: false,
            name: String::new(),
        }
    }
}

/// The three entry points a method's `run()` needs back into the core
/// (spec §9): emitting outbound messages, awaiting popup readiness, and
/// the UiPromise registry's create/find/remove operations.
#[derive(Clone)]
pub struct MethodContext {
    pub emit: Arc<dyn Fn(CoreMessage) + Send + Sync>,
    pub popup: PopupPromise,
    pub ui_promises: Arc<Mutex<UiPromiseRegistry>>,
}

#[async_trait]
pub trait Method: Send + Sync {
    fn params(&self) -> &MethodParams;

    async fn check_firmware_range(&self, using_popup: bool) -> Option<FirmwareException>;
    async fn check_permissions(&self) -> bool;
    async fn request_permissions(&self) -> bool;

    /// `None` means the method does not require this confirmation step at
    /// all (spec §3's `confirmation?()`); `Some(granted)` means it was
    /// asked.
    async fn confirmation(&self) -> Option<bool> {
        None
    }

    async fn no_backup_confirmation(&self) -> Option<bool> {
        None
    }

    async fn get_button_request_data(&self, _code: &ButtonRequestCode) -> Option<Value> {
        None
    }

    fn get_custom_messages(&self) -> Option<Value> {
        None
    }

    async fn run(&self, ctx: &MethodContext) -> Result<Value, CoreError>;

    async fn dispose(&self) {}
}
