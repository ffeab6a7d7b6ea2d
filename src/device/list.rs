//! The transport enumerator / `DeviceList` contract (spec §1 lists it as an
//! external collaborator; spec §4.7 specifies the events it must emit).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Hid,
    WebUsb,
    Bridge,
}

/// Events DeviceList emits; the Core Controller bridges these into
/// outbound `DeviceMessage`s and feeds connect/disconnect into Device
/// Selection's live-update path (spec §4.7).
#[derive(Debug, Clone)]
pub enum DeviceListEvent {
    Connect(Arc<dyn Device>),
    ConnectUnacquired(String),
    Disconnect(String),
    Changed,
    TransportError(String),
    TransportStart,
}

#[async_trait]
pub trait DeviceList: Send + Sync {
    fn transport_kind(&self) -> TransportKind;

    /// `false` triggers `Transport_Missing` in Device Selection (spec §4.4
    /// step 1).
    async fn is_available(&self) -> bool;

    async fn devices(&self) -> Vec<Arc<dyn Device>>;
    async fn get_device(&self, path: &str) -> Option<Arc<dyn Device>>;

    /// Reconfigures protocol definitions for a device's firmware version,
    /// or loads custom messages when `force` is set (spec §4.5 "Protocol
    /// reconfiguration" / step 11).
    async fn configure_protocol(&self, version: Option<String>, custom: Option<Value>, force: bool);

    /// Forces a fresh transport enumerate, used after a
    /// `WRONG_PREVIOUS_SESSION_ERROR_MESSAGE` failure (spec §4.5
    /// "Disconnect-during-auth").
    async fn enumerate(&self);

    async fn dispose(&self);
}

/// The `DeviceList` the Core Controller hands the dispatcher before
/// `init_transport` has ever been called (spec §4.5 "Transport
/// bootstrapping": "If there is no DeviceList ... attempt one synchronous
/// init; then continue" - until that succeeds, selection must still see a
/// well-formed, permanently-unavailable list rather than `None`).
pub struct UnavailableDeviceList;

#[async_trait]
impl DeviceList for UnavailableDeviceList {
    fn transport_kind(&self) -> TransportKind {
        TransportKind::Hid
    }

    async fn is_available(&self) -> bool {
        false
    }

    async fn devices(&self) -> Vec<Arc<dyn Device>> {
        Vec::new()
    }

    async fn get_device(&self, _path: &str) -> Option<Arc<dyn Device>> {
        None
    }

    async fn configure_protocol(&self, _version: Option<String>, _custom: Option<Value>, _force: bool) {}

    async fn enumerate(&self) {}

    async fn dispose(&self) {}
}
