//! C7: Core Controller (spec §4.7) - owns every other component and
//! exposes `init`, `handle_message`, `dispose`. Replaces the original's
//! module-level singletons (`_core`, `_deviceList`, `_popupPromise`, ...)
//! with fields of one value whose lifetime spans `init` → `dispose` (spec
//! §9 design note).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::auth_penalty::AuthPenalties;
use crate::call_registry::{CallEntry, CallRegistry};
use crate::deferred::UiPromiseRegistry;
use crate::device::list::{DeviceList, DeviceListEvent, TransportKind};
use crate::dispatcher::{self, CallRequest, DispatcherContext};
use crate::error::CoreError;
use crate::gateway::{self, GatewayContext, MessageGateway};
use crate::message::{tags, CoreMessage};
use crate::method::Method;
use crate::popup::PopupPromise;
use crate::selection::PreferredDeviceSlot;
use crate::settings::Settings;
use crate::timeout::InteractionTimeout;

type UnitFut = BoxFuture<'static, ()>;

/// A method-name → [`Method`] resolver. Supplied by the embedder; the
/// per-coin signing methods themselves are external collaborators (spec
/// §1), so the core only needs a way to turn an inbound payload into one.
pub trait MethodFactory: Send + Sync {
    fn build(&self, name: &str, response_id: u32, payload: Option<&Value>) -> Result<Arc<dyn Method>, CoreError>;
}

/// `{type, version, outdated}` reported by [`CoreController::transport_info`].
#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    pub kind: String,
    pub version: String,
    pub outdated: bool,
}

pub struct CoreController {
    settings: Settings,
    device_list: Mutex<Option<Arc<dyn DeviceList>>>,
    method_factory: Arc<dyn MethodFactory>,
    gateway: MessageGateway,
    call_registry: Arc<Mutex<CallRegistry>>,
    ui_promises: Arc<Mutex<UiPromiseRegistry>>,
    popup: PopupPromise,
    preferred_device: PreferredDeviceSlot,
    timeout: InteractionTimeout,
    list_changed: Arc<Notify>,
    auth_penalties: Arc<AuthPenalties>,
    next_call_id: AtomicU32,
    /// Cancels the background transport watchdog; fired by [`Self::dispose`]
    /// so it doesn't outlive the controller (spec §5 "Resource discipline").
    shutdown: CancellationToken,
}

impl CoreController {
    /// spec §4.7 `init(settings)`.
    pub fn init(settings: Settings, method_factory: Arc<dyn MethodFactory>) -> Arc<Self> {
        let timeout = InteractionTimeout::new(settings.effective_interaction_timeout_ms());
        let controller = Arc::new(CoreController {
            settings,
            device_list: Mutex::new(None),
            method_factory,
            gateway: MessageGateway::new(),
            call_registry: Arc::new(Mutex::new(CallRegistry::new())),
            ui_promises: Arc::new(Mutex::new(UiPromiseRegistry::new())),
            popup: PopupPromise::new(),
            preferred_device: Arc::new(Mutex::new(None)),
            timeout,
            list_changed: Arc::new(Notify::new()),
            auth_penalties: Arc::new(AuthPenalties::new()),
            next_call_id: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
        });
        controller.popup.set_emitter(controller.emit_fn());
        let watchdog = controller.clone();
        tokio::spawn(async move {
            watchdog.interaction_timeout_watchdog().await;
        });
        controller
    }

    /// Drives [`InteractionTimeout::wait_expired`] for the controller's
    /// whole lifetime: on expiry it behaves identically to "popup closed
    /// by user" (spec §4.2), reusing [`Self::cancel_active`] with the
    /// fixed reason string the timer is documented to carry.
    async fn interaction_timeout_watchdog(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                fired = self.timeout.wait_expired() => {
                    if fired {
                        warn!("interaction timeout fired");
                        self.cancel_active(CoreError::MethodInterrupted).await;
                    }
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreMessage> {
        self.gateway.subscribe()
    }

    fn emit_fn(self: &Arc<Self>) -> Arc<dyn Fn(CoreMessage) + Send + Sync> {
        let gateway = self.gateway.clone();
        Arc::new(move |m: CoreMessage| {
            gateway.publish(m);
        })
    }

    /// spec §4.7 `initTransport(settings)`. `transport_reconnect` drives a
    /// dispose + 1s backoff + forever retry on any transport failure;
    /// otherwise one init attempt is made and its result returned.
    #[instrument(level = "info", skip(self, list))]
    pub async fn init_transport(self: &Arc<Self>, list: Arc<dyn DeviceList>) {
        *self.device_list.lock().await = Some(list);
        if self.settings.transport_reconnect {
            let controller = self.clone();
            tokio::spawn(async move {
                controller.transport_watchdog().await;
            });
        }
    }

    async fn transport_watchdog(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
            }
            let available = {
                let guard = self.device_list.lock().await;
                match guard.as_ref() {
                    Some(list) => list.is_available().await,
                    None => false,
                }
            };
            if !available {
                warn!("transport unavailable, retrying in 1s");
                self.emit_fn()(CoreMessage::transport(
                    tags::TRANSPORT_ERROR,
                    Some(serde_json::json!({ "error": "transport unavailable" })),
                ));
                let mut guard = self.device_list.lock().await;
                if let Some(list) = guard.take() {
                    list.dispose().await;
                }
            }
        }
    }

    /// spec §4.7 `getTransportInfo()`.
    pub async fn transport_info(&self) -> TransportInfo {
        match self.device_list.lock().await.as_ref() {
            Some(list) => TransportInfo {
                kind: match list.transport_kind() {
                    TransportKind::Hid => "hid".to_string(),
                    TransportKind::WebUsb => "webusb".to_string(),
                    TransportKind::Bridge => "bridge".to_string(),
                },
                version: String::new(),
                outdated: false,
            },
            None => TransportInfo {
                kind: String::new(),
                version: String::new(),
                outdated: true,
            },
        }
    }

    /// spec §4.7 `getCurrentMethod()`.
    pub async fn current_calls(&self) -> Vec<CallEntry> {
        self.call_registry.lock().await.snapshot()
    }

    /// spec §4.3 `handleMessage(msg, trusted)`.
    #[instrument(level = "debug", skip(self, msg), fields(kind = %msg.kind))]
    pub async fn handle_message(self: &Arc<Self>, msg: CoreMessage, trusted: bool) {
        let controller = self.clone();
        let controller_for_disable = self.clone();
        let controller_for_call = self.clone();
        let ctx = GatewayContext {
            popup: self.popup.clone(),
            ui_promises: self.ui_promises.clone(),
            on_popup_closed: Arc::new(move |payload: Option<Value>| {
                let controller = controller.clone();
                Box::pin(async move { controller.handle_popup_closed(payload).await }) as UnitFut
            }),
            on_disable_webusb: Arc::new(move || {
                let controller = controller_for_disable.clone();
                Box::pin(async move { controller.handle_disable_webusb().await }) as UnitFut
            }),
            on_call: Arc::new(move |call_msg: CoreMessage| {
                let controller = controller_for_call.clone();
                Box::pin(async move { controller.dispatch_call(call_msg).await }) as UnitFut
            }),
        };
        gateway::handle_inbound(&ctx, msg, trusted).await;
    }

    async fn dispatch_call(self: &Arc<Self>, msg: CoreMessage) {
        let payload = msg.payload.unwrap_or(Value::Null);
        let name = payload.get("method").and_then(Value::as_str).unwrap_or("").to_string();
        let response_id = msg.id.unwrap_or(0);
        let call_id = if response_id != 0 {
            response_id
        } else {
            self.next_call_id.fetch_add(1, Ordering::SeqCst)
        };
        let trusted = self.settings.trusted_host;
        let management_allowed = payload
            .get("managementAllowed")
            .and_then(Value::as_bool)
            .unwrap_or(!self.settings.popup);
        let requested_device_path = payload
            .get("devicePath")
            .and_then(Value::as_str)
            .map(str::to_string);

        let method = self.method_factory.build(&name, call_id, Some(&payload));

        let device_list: Arc<dyn DeviceList> = {
            let guard = self.device_list.lock().await;
            match guard.as_ref() {
                Some(list) => list.clone(),
                None => Arc::new(crate::device::list::UnavailableDeviceList),
            }
        };

        let dctx = DispatcherContext {
            device_list,
            call_registry: self.call_registry.clone(),
            ui_promises: self.ui_promises.clone(),
            popup: self.popup.clone(),
            preferred_device: self.preferred_device.clone(),
            timeout: self.timeout.clone(),
            emit: self.emit_fn(),
            list_changed: self.list_changed.clone(),
            settings: self.settings.clone(),
            auth_penalties: self.auth_penalties.clone(),
        };

        dispatcher::handle_call(
            &dctx,
            CallRequest {
                call_id,
                method,
                trusted,
                management_allowed,
                requested_device_path,
            },
        )
        .await;
    }

    /// spec §5 "Popup closed (or Interaction Timeout fired)".
    async fn handle_popup_closed(self: &Arc<Self>, payload: Option<Value>) {
        let reason = payload
            .as_ref()
            .and_then(|p| p.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("Popup closed")
            .to_string();
        info!(reason = %reason, "popup closed");
        self.cancel_active(CoreError::MethodInterrupted).await;
    }

    /// The cancellation behavior shared by "popup closed" and "interaction
    /// timeout fired" (spec §5): if a device session is currently in use,
    /// the cancellation is delivered to it via `interruptionFromUser` so it
    /// unwinds whatever `device.run` body is in flight (the same
    /// mechanism as override, spec §4.5 "Preemption"); otherwise there is
    /// no in-flight session to race, so every pending UiPromise and the
    /// PopupPromise itself are rejected directly.
    async fn cancel_active(self: &Arc<Self>, err: CoreError) {
        let devices = {
            let guard = self.device_list.lock().await;
            match guard.as_ref() {
                Some(list) => list.devices().await,
                None => Vec::new(),
            }
        };

        // Stop unconditionally, not just on the no-session branch below:
        // `wait_expired` keeps firing on the same duration until `stop`/
        // `restart` bumps its generation, so skipping this would re-run
        // cancellation on every poll once a session is in use.
        self.timeout.stop();

        let mut any_in_use = false;
        for device in devices {
            if device.is_used_here().await {
                any_in_use = true;
                device.interruption_from_user(err.clone()).await;
            }
        }

        if !any_in_use {
            self.ui_promises.lock().await.reject_all(err.clone());
            self.popup.reject(err);
        }
    }

    async fn handle_disable_webusb(self: &Arc<Self>) {
        let mut guard = self.device_list.lock().await;
        let was_webusb = guard
            .as_ref()
            .map(|l| l.transport_kind() == TransportKind::WebUsb)
            .unwrap_or(false);
        if was_webusb {
            if let Some(list) = guard.take() {
                list.dispose().await;
            }
        }
    }

    /// Bridges `DeviceList` events (spec §4.7): CONNECT/DISCONNECT/CHANGED
    /// become `DeviceMessage`s, feed Device Selection's live-update path,
    /// and TRANSPORT.ERROR triggers dispose + reconnect when enabled.
    pub async fn handle_device_list_event(self: &Arc<Self>, event: DeviceListEvent) {
        match event {
            DeviceListEvent::Connect(device) => {
                self.emit_fn()(CoreMessage::device(
                    tags::DEVICE_CONNECT,
                    Some(device.to_message_object().await),
                ));
                self.list_changed.notify_waiters();
            }
            DeviceListEvent::ConnectUnacquired(path) => {
                self.emit_fn()(CoreMessage::device(
                    tags::DEVICE_CONNECT_UNACQUIRED,
                    Some(serde_json::json!({ "path": path })),
                ));
            }
            DeviceListEvent::Disconnect(path) => {
                self.emit_fn()(CoreMessage::device(
                    tags::DEVICE_DISCONNECT,
                    Some(serde_json::json!({ "path": path })),
                ));
                let resolved = self.ui_promises.lock().await.disconnect_device(&path);
                if resolved > 0 {
                    self.emit_fn()(CoreMessage::popup(tags::POPUP_CANCEL_POPUP_REQUEST));
                }
                let mut preferred = self.preferred_device.lock().await;
                if preferred.as_ref().map(|p| p.path == path).unwrap_or(false) {
                    *preferred = None;
                }
                self.list_changed.notify_waiters();
            }
            DeviceListEvent::Changed => {
                self.emit_fn()(CoreMessage::device(tags::DEVICE_CHANGED, None));
                self.list_changed.notify_waiters();
            }
            DeviceListEvent::TransportError(error) => {
                self.emit_fn()(CoreMessage::transport(
                    tags::TRANSPORT_ERROR,
                    Some(serde_json::json!({ "error": error })),
                ));
                let mut guard = self.device_list.lock().await;
                if let Some(list) = guard.take() {
                    list.dispose().await;
                }
                drop(guard);
                if self.settings.transport_reconnect {
                    let controller = self.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = controller.shutdown.cancelled() => {}
                            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                                // A fresh transport must be supplied by the embedder
                                // via `init_transport` again; this just signals
                                // readiness to retry.
                                controller.emit_fn()(CoreMessage::transport(tags::TRANSPORT_START, None));
                            }
                        }
                    });
                }
            }
            DeviceListEvent::TransportStart => {
                self.emit_fn()(CoreMessage::transport(tags::TRANSPORT_START, None));
            }
        }
    }

    /// spec §4.7 `dispose()`.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let mut guard = self.device_list.lock().await;
        if let Some(list) = guard.take() {
            list.dispose().await;
        }
        drop(guard);
        self.timeout.stop();
        self.ui_promises.lock().await.clear();
    }
}
