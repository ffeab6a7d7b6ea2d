//! In-memory `Device`/`DeviceList` test doubles, colocated the way the
//! teacher keeps `#[cfg(test)]` fixtures next to the module under test -
//! exposed crate-wide (not `#[cfg(test)]`-gated) so the `tests/`
//! integration suite can drive the Core Controller end-to-end per spec §8.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use super::{
    BodyFn, ButtonRequestCode, Device, DeviceEventHandlers, DeviceFeatures, DeviceMode,
    FirmwareStatus, ModeException, PassphraseResponse, RunOptions,
};
use crate::device::list::{DeviceList, TransportKind};
use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct MockDeviceConfig {
    pub unreadable: bool,
    pub running: bool,
    pub loaded: bool,
    pub used_here: bool,
    pub needs_backup: bool,
    pub firmware_status: FirmwareStatus,
    pub mode: DeviceMode,
    pub version: Option<String>,
    /// When `Some`, `validate_state` returns this once then the mock
    /// treats the state as reconciled (models the "retry" resolution).
    pub state_mismatch: Option<Vec<u8>>,
    /// When set, the first call to `initialize` during a
    /// state-mismatch retry fails with this message (drives S3's bad-PIN
    /// scenario); subsequent calls succeed.
    pub fail_initialize_with: Option<String>,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        MockDeviceConfig {
            unreadable: false,
            running: false,
            loaded: false,
            used_here: false,
            needs_backup: false,
            firmware_status: FirmwareStatus::Valid,
            mode: DeviceMode::Normal,
            version: Some("7.7.0".to_string()),
            state_mismatch: None,
            fail_initialize_with: None,
        }
    }
}

struct MockState {
    config: MockDeviceConfig,
    keep_session: bool,
    instance: u32,
    external_state: Option<Vec<u8>>,
    internal_state: Option<Vec<u8>>,
    override_pending: Option<CoreError>,
    initialize_attempts: u32,
}

pub struct MockDevice {
    path: String,
    state: Mutex<MockState>,
    handlers: Mutex<Option<DeviceEventHandlers>>,
    session_lock: Mutex<()>,
    /// Wakes a currently-executing `run()` when `override_with` lands, so
    /// preemption actually interrupts the in-flight body rather than only
    /// taking effect on the *next* call (spec §4.5 "Preemption": "this is
    /// expected to raise inside the other call's `inner` loop").
    override_notify: Notify,
}

impl MockDevice {
    pub fn new(path: impl Into<String>, config: MockDeviceConfig) -> Arc<Self> {
        Arc::new(MockDevice {
            path: path.into(),
            state: Mutex::new(MockState {
                config,
                keep_session: false,
                instance: 0,
                external_state: None,
                internal_state: None,
                override_pending: None,
                initialize_attempts: 0,
            }),
            handlers: Mutex::new(None),
            session_lock: Mutex::new(()),
            override_notify: Notify::new(),
        })
    }

    async fn wait_for_override_signal(&self) -> CoreError {
        loop {
            let notified = self.override_notify.notified();
            if let Some(err) = self.state.lock().await.override_pending.take() {
                return err;
            }
            notified.await;
            if let Some(err) = self.state.lock().await.override_pending.take() {
                return err;
            }
        }
    }
}

#[async_trait]
impl Device for MockDevice {
    fn device_path(&self) -> &str {
        &self.path
    }

    async fn is_running(&self) -> bool {
        self.state.lock().await.config.running
    }

    async fn is_loaded(&self) -> bool {
        self.state.lock().await.config.loaded
    }

    async fn is_used_here(&self) -> bool {
        self.state.lock().await.config.used_here
    }

    async fn has_unreadable_error(&self) -> bool {
        self.state.lock().await.config.unreadable
    }

    async fn features(&self) -> DeviceFeatures {
        let state = self.state.lock().await;
        DeviceFeatures {
            needs_backup: state.config.needs_backup,
            raw: Value::Null,
        }
    }

    async fn firmware_status(&self) -> FirmwareStatus {
        self.state.lock().await.config.firmware_status
    }

    async fn keep_session(&self) -> bool {
        self.state.lock().await.keep_session
    }

    async fn set_keep_session(&self, value: bool) {
        self.state.lock().await.keep_session = value;
    }

    async fn wait_for_first_run(&self) {
        loop {
            if self.state.lock().await.config.loaded {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn set_instance(&self, instance: u32) {
        self.state.lock().await.instance = instance;
    }

    async fn set_external_state(&self, state: Option<Vec<u8>>) {
        self.state.lock().await.external_state = state;
    }

    async fn set_internal_state(&self, state: Option<Vec<u8>>) {
        self.state.lock().await.internal_state = state;
    }

    async fn validate_state(&self, _network: Option<Value>) -> Option<Vec<u8>> {
        self.state.lock().await.config.state_mismatch.take()
    }

    async fn has_unexpected_mode(
        &self,
        allow: &[DeviceMode],
        require: &[DeviceMode],
    ) -> Option<ModeException> {
        let mode = self.state.lock().await.config.mode;
        if !require.is_empty() && !require.contains(&mode) {
            return Some(ModeException(mode));
        }
        if !allow.is_empty() && !allow.contains(&mode) {
            return Some(ModeException(mode));
        }
        None
    }

    async fn initialize(&self, _use_empty_passphrase: bool) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state.initialize_attempts += 1;
        if state.initialize_attempts == 1 {
            if let Some(msg) = state.config.fail_initialize_with.clone() {
                return Err(CoreError::MethodFailure(msg));
            }
        }
        Ok(())
    }

    async fn get_version(&self) -> Option<String> {
        self.state.lock().await.config.version.clone()
    }

    async fn override_with(&self, err: CoreError) {
        self.state.lock().await.override_pending = Some(err);
        self.override_notify.notify_waiters();
    }

    async fn attach_handlers(&self, handlers: DeviceEventHandlers) {
        *self.handlers.lock().await = Some(handlers);
    }

    async fn detach_handlers(&self) {
        *self.handlers.lock().await = None;
    }

    async fn run<'a>(&'a self, body: BodyFn<'a>, opts: RunOptions) -> Result<Value, CoreError> {
        let _permit = self.session_lock.lock().await;
        {
            let mut state = self.state.lock().await;
            if let Some(err) = state.override_pending.take() {
                return Err(err);
            }
            state.config.running = true;
            state.config.loaded = true;
            state.config.used_here = true;
            state.keep_session = opts.keep_session;
        }
        let result = tokio::select! {
            r = body() => r,
            err = self.wait_for_override_signal() => Err(err),
        };
        {
            let mut state = self.state.lock().await;
            if !opts.keep_session {
                state.config.running = false;
            }
        }
        result
    }

    async fn cleanup(&self) {
        self.detach_handlers().await;
        let mut state = self.state.lock().await;
        if !state.keep_session {
            state.config.used_here = false;
        }
    }

    async fn interruption_from_user(&self, err: CoreError) {
        self.state.lock().await.override_pending = Some(err);
        self.override_notify.notify_waiters();
    }

    async fn to_message_object(&self) -> Value {
        let state = self.state.lock().await;
        serde_json::json!({
            "path": self.path,
            // device state is hex-encoded the way the wire protocol carries
            // it, matching the teacher's `FriendlyUsbDevice` JSON shape.
            "state": state.internal_state.as_ref().map(|s| hex::encode(s)),
        })
    }
}

/// Fires a registered button/PIN/word/passphrase handler from test code,
/// mimicking a device protocol layer emitting an event mid-session.
impl MockDevice {
    pub async fn fire_button(&self, code: ButtonRequestCode, data: Option<Value>) {
        let guard = self.handlers.lock().await;
        if let Some(h) = guard.as_ref() {
            (h.on_button)(code, data).await;
        }
    }

    pub async fn fire_pin(&self) -> Result<String, CoreError> {
        let guard = self.handlers.lock().await;
        (guard.as_ref().unwrap().on_pin)().await
    }

    pub async fn fire_word(&self) -> Result<String, CoreError> {
        let guard = self.handlers.lock().await;
        (guard.as_ref().unwrap().on_word)().await
    }

    pub async fn fire_passphrase(&self) -> Result<PassphraseResponse, CoreError> {
        let guard = self.handlers.lock().await;
        (guard.as_ref().unwrap().on_passphrase)().await
    }
}

pub struct MockDeviceList {
    kind: TransportKind,
    available: Mutex<bool>,
    devices: Mutex<HashMap<String, Arc<dyn Device>>>,
}

impl MockDeviceList {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(MockDeviceList {
            kind,
            available: Mutex::new(true),
            devices: Mutex::new(HashMap::new()),
        })
    }

    pub async fn insert(&self, device: Arc<dyn Device>) {
        self.devices
            .lock()
            .await
            .insert(device.device_path().to_string(), device);
    }

    pub async fn remove(&self, path: &str) {
        self.devices.lock().await.remove(path);
    }

    pub async fn set_available(&self, value: bool) {
        *self.available.lock().await = value;
    }
}

#[async_trait]
impl DeviceList for MockDeviceList {
    fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        *self.available.lock().await
    }

    async fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices.lock().await.values().cloned().collect()
    }

    async fn get_device(&self, path: &str) -> Option<Arc<dyn Device>> {
        self.devices.lock().await.get(path).cloned()
    }

    async fn configure_protocol(
        &self,
        _version: Option<String>,
        _custom: Option<Value>,
        _force: bool,
    ) {
    }

    async fn enumerate(&self) {}

    async fn dispose(&self) {
        self.devices.lock().await.clear();
    }
}
