//! C3: Message Gateway - origin firewall, inbound routing, outbound fan-out
//! (spec §4.3).

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::deferred::UiPromiseRegistry;
use crate::message::{is_safe_type, tags, CoreMessage};
use crate::popup::PopupPromise;

type UnitFut = BoxFuture<'static, ()>;

/// The single outbound fan-out point (spec §4.3 "Outbound"). Cloning is
/// cheap; every clone shares the same broadcast sender.
#[derive(Clone)]
pub struct MessageGateway {
    outbound: broadcast::Sender<CoreMessage>,
}

impl MessageGateway {
    pub fn new() -> Self {
        let (outbound, _rx) = broadcast::channel(256);
        MessageGateway { outbound }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreMessage> {
        self.outbound.subscribe()
    }

    /// Publishes `msg` to every current subscriber, preserving submission
    /// order per subscriber (spec §5 ordering guarantee (a)). A lagging
    /// subscriber only loses its own backlog, never another's.
    pub fn publish(&self, msg: CoreMessage) {
        let _ = self.outbound.send(msg);
    }
}

impl Default for MessageGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Callbacks the Core Controller wires in so the gateway doesn't need to
/// know about the dispatcher, DeviceList, or transport directly.
pub struct GatewayContext {
    pub popup: PopupPromise,
    pub ui_promises: Arc<Mutex<UiPromiseRegistry>>,
    pub on_popup_closed: Arc<dyn Fn(Option<Value>) -> UnitFut + Send + Sync>,
    pub on_disable_webusb: Arc<dyn Fn() -> UnitFut + Send + Sync>,
    pub on_call: Arc<dyn Fn(CoreMessage) -> UnitFut + Send + Sync>,
}

/// Routes one inbound `CoreMessage` (spec §4.3). Untrusted messages whose
/// type is outside the safe-set are dropped silently (spec §8 invariant 5).
pub async fn handle_inbound(ctx: &GatewayContext, msg: CoreMessage, trusted: bool) {
    if !trusted && !is_safe_type(&msg.kind) {
        debug!(kind = %msg.kind, "dropping untrusted message outside safe-set");
        return;
    }

    match msg.kind.as_str() {
        tags::POPUP_HANDSHAKE => ctx.popup.resolve(),
        tags::POPUP_CLOSED => (ctx.on_popup_closed)(msg.payload.clone()).await,
        tags::TRANSPORT_DISABLE_WEBUSB => (ctx.on_disable_webusb)().await,
        tags::UI_RECEIVE_PIN
        | tags::UI_RECEIVE_WORD
        | tags::UI_RECEIVE_PASSPHRASE
        | tags::UI_RECEIVE_DEVICE
        | tags::UI_CHANGE_ACCOUNT
        | tags::UI_INVALID_PASSPHRASE_ACTION
        | tags::UI_CUSTOM_MESSAGE_RESPONSE
        | tags::UI_LOGIN_CHALLENGE_RESPONSE => {
            let mut registry = ctx.ui_promises.lock().await;
            registry.resolve(&msg.kind, msg.payload.clone().unwrap_or(Value::Null));
        }
        tags::IFRAME_CALL => (ctx.on_call)(msg).await,
        other => debug!(kind = %other, "no gateway handler for inbound message type"),
    }
}
