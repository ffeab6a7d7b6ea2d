//! C5: Call Dispatcher - the per-call lifecycle state machine (spec §4.5).
//!
//! This is the largest component in the budget for a reason: it is the
//! only piece of the core that touches every other component (C1 Deferred
//! registry, C2 Interaction Timeout, C4 Device Selection, C6 Event Bridge)
//! across a single call's `Parsing → AwaitTransport? → ResolvingDevice →
//! SessionOpen(inner-loop) → Cleanup → Done` lifecycle. Grounded in the
//! shape of `keepkey-rust::device_queue::DeviceWorker::run`'s per-command
//! dispatch loop, generalized from "one queue per device" to "one call
//! state machine, serialized per device by `Device::run`".

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::auth_penalty::AuthPenalties;
use crate::call_registry::CallRegistry;
use crate::deferred::UiPromiseRegistry;
use crate::device::list::DeviceList;
use crate::device::{Device, FirmwareStatus, RunOptions};
use crate::error::CoreError;
use crate::event_bridge;
use crate::message::{tags, CoreMessage};
use crate::method::{Method, MethodContext};
use crate::popup::PopupPromise;
use crate::selection::{self, PreferredDevice, PreferredDeviceSlot, SelectionContext};
use crate::settings::Settings;
use crate::timeout::InteractionTimeout;

/// A pending `IFRAME.CALL` handed to the dispatcher. Method construction
/// (matching a payload's `method` name to a concrete [`Method`]
/// implementation) is an external collaborator's job per spec §1; `method`
/// is already `Err` when that lookup failed (spec §4.5 "Preamble").
pub struct CallRequest {
    pub call_id: u32,
    pub method: Result<Arc<dyn Method>, CoreError>,
    /// Whether the caller frame is a trusted host (spec §4.5 steps 3, 6).
    pub trusted: bool,
    /// Whether the running context permits calls requiring the
    /// `management` permission (spec §4.5 "Management gate").
    pub management_allowed: bool,
    pub requested_device_path: Option<String>,
}

/// Everything the Call Dispatcher needs from the Core Controller, bundled
/// so one call's state machine doesn't need the whole controller type.
#[derive(Clone)]
pub struct DispatcherContext {
    pub device_list: Arc<dyn DeviceList>,
    pub call_registry: Arc<Mutex<CallRegistry>>,
    pub ui_promises: Arc<Mutex<UiPromiseRegistry>>,
    pub popup: PopupPromise,
    pub preferred_device: PreferredDeviceSlot,
    pub timeout: InteractionTimeout,
    pub emit: Arc<dyn Fn(CoreMessage) + Send + Sync>,
    pub list_changed: Arc<Notify>,
    pub settings: Settings,
    pub auth_penalties: Arc<AuthPenalties>,
}

impl DispatcherContext {
    fn selection_ctx(&self) -> SelectionContext {
        SelectionContext {
            device_list: self.device_list.clone(),
            ui_promises: self.ui_promises.clone(),
            popup: self.popup.clone(),
            preferred_device: self.preferred_device.clone(),
            emit: self.emit.clone(),
            list_changed: self.list_changed.clone(),
            auth_penalties: self.auth_penalties.clone(),
        }
    }

    fn emit(&self, msg: CoreMessage) {
        (self.emit)(msg);
    }

    fn cancel_popup(&self) {
        self.emit(CoreMessage::popup(tags::POPUP_CANCEL_POPUP_REQUEST));
    }

    async fn respond(&self, call_id: u32, result: &Result<Value, CoreError>) {
        let mut registry = self.call_registry.lock().await;
        registry.remove(call_id);
        drop(registry);
        let msg = match result {
            Ok(payload) => CoreMessage::response(call_id, true, payload.clone()),
            Err(err) => CoreMessage::response(call_id, false, err.to_payload()),
        };
        self.emit(msg);
    }
}

/// Entry point for one `IFRAME.CALL` (spec §4.5, top to bottom). Every
/// path through this function ends in exactly one `respond` (spec §8
/// invariant 1) and, once a device session opened, exactly one
/// `cleanup_session` (spec §8 invariant 4).
#[instrument(level = "debug", skip(ctx, request), fields(call_id = request.call_id))]
pub async fn handle_call(ctx: &DispatcherContext, mut request: CallRequest) {
    let call_id = request.call_id;

    // Preamble: attach the preferred device if the call didn't name one.
    if request.requested_device_path.is_none() {
        if let Some(preferred) = ctx.preferred_device.lock().await.clone() {
            request.requested_device_path = Some(preferred.path);
        }
    }

    let method = match request.method {
        Ok(m) => m,
        Err(err) => {
            warn!(error = %err, "method lookup failed");
            ctx.cancel_popup();
            ctx.respond(call_id, &Err(err)).await;
            return;
        }
    };

    {
        let mut registry = ctx.call_registry.lock().await;
        registry.register(call_id, request.requested_device_path.clone(), method.params().name.clone());
    }

    if !method.params().use_device {
        run_device_less(ctx, call_id, &method, request.trusted).await;
        return;
    }

    if !ctx.device_list.is_available().await && !ctx.settings.transport_reconnect {
        debug!("no device list yet, attempting a synchronous enumerate before selection");
        ctx.device_list.enumerate().await;
    }

    if ctx.settings.popup
        && method.params().required_permissions.contains(&crate::method::Permission::Management)
        && !request.management_allowed
    {
        ctx.cancel_popup();
        ctx.respond(call_id, &Err(CoreError::MethodNotAllowed)).await;
        return;
    }

    let device = match selection::select(&ctx.selection_ctx(), request.requested_device_path.as_deref()).await {
        Ok(device) => device,
        Err(CoreError::TransportMissing) => {
            let _ = ctx.popup.wait().await;
            ctx.emit(CoreMessage::ui(tags::UI_TRANSPORT, None));
            ctx.respond(call_id, &Err(CoreError::TransportMissing)).await;
            return;
        }
        Err(err) => {
            ctx.cancel_popup();
            ctx.respond(call_id, &Err(err)).await;
            return;
        }
    };

    if method.params().debug_link {
        let method_ctx = method_context(ctx);
        let result = method.run(&method_ctx).await;
        method.dispose().await;
        ctx.respond(call_id, &result).await;
        return;
    }

    // Preemption: scan for other calls on this device path and override.
    let did_override = if method.params().override_previous_call {
        let marked = {
            let mut registry = ctx.call_registry.lock().await;
            registry.mark_overridden_on_device(device.device_path(), call_id)
        };
        if !marked.is_empty() {
            info!(device = device.device_path(), overridden = ?marked, "overriding in-flight call(s)");
            device.override_with(CoreError::MethodOverride).await;
        }
        !marked.is_empty()
    } else {
        false
    };

    // Re-read this call's own `overridden` flag: the override above may
    // have raced a concurrent override of *this* call too (spec §5, §9(b)).
    let self_overridden = { ctx.call_registry.lock().await.is_overridden(call_id) };
    if self_overridden {
        ctx.respond(call_id, &Err(CoreError::MethodOverride)).await;
        return;
    }

    if device.is_running().await && !did_override {
        if !device.is_loaded().await {
            device.wait_for_first_run().await;
        } else {
            ctx.respond(call_id, &Err(CoreError::DeviceCallInProgress)).await;
            return;
        }
    }

    device.set_instance(method.params().device_instance).await;
    if method.params().has_expected_device_state {
        device.set_external_state(method.params().device_state.clone()).await;
    }

    let handlers = event_bridge::build_handlers(
        ctx.emit.clone(),
        ctx.popup.clone(),
        ctx.ui_promises.clone(),
        ctx.timeout.clone(),
        method.clone(),
        method.params().use_empty_passphrase,
    );
    device.attach_handlers(handlers).await;

    let version = device.get_version().await;
    ctx.device_list.configure_protocol(version, None, false).await;

    let method_ctx = method_context(ctx);
    let inner = InnerCtx {
        device: &device,
        method: &method,
        popup: &ctx.popup,
        ui_promises: &ctx.ui_promises,
        emit: &ctx.emit,
        device_list: &ctx.device_list,
        popup_mode: ctx.settings.popup,
        trusted: request.trusted,
        method_ctx: &method_ctx,
    };

    let run_opts = RunOptions {
        keep_session: method.params().keep_session,
        use_empty_passphrase: method.params().use_empty_passphrase,
        skip_final_reload: method.params().skip_final_reload,
    };

    let body: crate::device::BodyFn<'_> = Box::new(move || Box::pin(async move { run_session(inner).await }));
    let result = device.run(body, run_opts).await;

    cleanup_session(ctx, &device, &method, &result).await;
    ctx.respond(call_id, &result).await;
}

fn method_context(ctx: &DispatcherContext) -> MethodContext {
    MethodContext {
        emit: ctx.emit.clone(),
        popup: ctx.popup.clone(),
        ui_promises: ctx.ui_promises.clone(),
    }
}

/// spec §4.5 "Device-less branch": no device session is opened at all.
async fn run_device_less(ctx: &DispatcherContext, call_id: u32, method: &Arc<dyn Method>, _trusted: bool) {
    if method.params().use_ui {
        if let Err(err) = ctx.popup.wait().await {
            ctx.respond(call_id, &Err(err)).await;
            return;
        }
    } else {
        ctx.cancel_popup();
    }
    let method_ctx = method_context(ctx);
    let result = method.run(&method_ctx).await;
    method.dispose().await;
    ctx.respond(call_id, &result).await;
}

struct InnerCtx<'a> {
    device: &'a Arc<dyn Device>,
    method: &'a Arc<dyn Method>,
    popup: &'a PopupPromise,
    ui_promises: &'a Arc<Mutex<UiPromiseRegistry>>,
    emit: &'a Arc<dyn Fn(CoreMessage) + Send + Sync>,
    device_list: &'a Arc<dyn DeviceList>,
    popup_mode: bool,
    trusted: bool,
    method_ctx: &'a MethodContext,
}

impl<'a> InnerCtx<'a> {
    fn emit(&self, msg: CoreMessage) {
        (self.emit)(msg);
    }
}

enum InnerOutcome {
    Done(Result<Value, CoreError>),
    RestartState,
    RestartPin,
}

/// The recursive `inner` of spec §4.5, turned into an explicit loop with a
/// PIN-retry counter (spec §9 design note: "naturally a loop with an
/// explicit counter").
async fn run_session(ctx: InnerCtx<'_>) -> Result<Value, CoreError> {
    let mut pin_tries: u32 = 1;
    loop {
        match run_inner_once(&ctx, pin_tries).await {
            InnerOutcome::Done(result) => return result,
            InnerOutcome::RestartState => continue,
            InnerOutcome::RestartPin => {
                pin_tries += 1;
                continue;
            }
        }
    }
}

async fn run_inner_once(ctx: &InnerCtx<'_>, pin_tries: u32) -> InnerOutcome {
    // 1. Firmware range.
    if let Some(exc) = ctx.method.check_firmware_range(ctx.popup_mode).await {
        if ctx.popup_mode {
            if let Err(err) = ctx.popup.wait().await {
                return InnerOutcome::Done(Err(err));
            }
            ctx.emit(CoreMessage::ui(exc.ui_tag(), None));
            let future = {
                let mut reg = ctx.ui_promises.lock().await;
                reg.create(tags::DEVICE_DISCONNECT, Some(ctx.device.device_path().to_string()))
            };
            let _ = future.wait().await;
            return InnerOutcome::Done(Err(CoreError::MethodCancel("firmware exception".into())));
        }
        return InnerOutcome::Done(Err(CoreError::DeviceFwException(format!("{:?}", exc))));
    }

    // 2. Device mode.
    if let Some(mode_exc) = ctx
        .device
        .has_unexpected_mode(&ctx.method.params().allow_device_mode, &ctx.method.params().require_device_mode)
        .await
    {
        ctx.device.set_keep_session(false).await;
        if ctx.popup_mode {
            if let Err(err) = ctx.popup.wait().await {
                return InnerOutcome::Done(Err(err));
            }
            ctx.emit(CoreMessage::ui(
                mode_exc.ui_tag(),
                Some(serde_json::json!({ "mode": format!("{:?}", mode_exc.0) })),
            ));
            let future = {
                let mut reg = ctx.ui_promises.lock().await;
                reg.create(tags::DEVICE_DISCONNECT, Some(ctx.device.device_path().to_string()))
            };
            let _ = future.wait().await;
            return InnerOutcome::Done(Err(CoreError::MethodCancel("device mode exception".into())));
        }
        return InnerOutcome::Done(Err(CoreError::DeviceModeException(format!("{:?}", mode_exc.0))));
    }

    // 3. Permissions. A trusted host is auto-permitted regardless of
    // `check_permissions()`'s cached answer; only an untrusted host can
    // actually be denied here, after a prompt.
    if !ctx.trusted && !ctx.method.check_permissions().await {
        let may_prompt = !ctx.method.params().required_permissions.is_empty();
        let granted = if may_prompt {
            ctx.method.request_permissions().await
        } else {
            false
        };
        if !granted {
            return InnerOutcome::Done(Err(CoreError::MethodPermissionsNotGranted));
        }
    }

    // 4. No-backup confirmation.
    let features = ctx.device.features().await;
    if features.needs_backup {
        if let Some(granted) = ctx.method.no_backup_confirmation().await {
            if !granted {
                return InnerOutcome::Done(Err(CoreError::MethodPermissionsNotGranted));
            }
        }
        if let Err(err) = ctx.popup.wait().await {
            return InnerOutcome::Done(Err(err));
        }
        ctx.emit(CoreMessage::ui(tags::UI_DEVICE_NEEDS_BACKUP, None));
    }

    // 5. Outdated firmware notice.
    if ctx.device.firmware_status().await == FirmwareStatus::Outdated {
        if let Err(err) = ctx.popup.wait().await {
            return InnerOutcome::Done(Err(err));
        }
        ctx.emit(CoreMessage::ui(tags::UI_FIRMWARE_OUTDATED, None));
    }

    // 6. Method confirmation.
    if !ctx.trusted {
        if let Some(granted) = ctx.method.confirmation().await {
            if !granted {
                return InnerOutcome::Done(Err(CoreError::MethodCancel("confirmation denied".into())));
            }
        }
    }

    // 7. Protocol reconfigure.
    let version = ctx.device.get_version().await;
    ctx.device_list.configure_protocol(version, None, false).await;

    // 8. Device-state validation (+ 9. PIN retry, folded in since the
    // only error this step can throw in practice is the device's own
    // `initialize` call during the "retry" resolution).
    if ctx.method.params().use_device_state {
        if let Some(returned_state) = ctx.device.validate_state(ctx.method.params().network.clone()).await {
            if ctx.popup_mode {
                let future = {
                    let mut reg = ctx.ui_promises.lock().await;
                    reg.create(tags::UI_INVALID_PASSPHRASE_ACTION, None)
                };
                ctx.emit(CoreMessage::ui(tags::UI_INVALID_PASSPHRASE, None));
                let result = match future.wait().await {
                    Ok(r) => r,
                    Err(e) => return InnerOutcome::Done(Err(e)),
                };
                let action = result.payload.as_str().unwrap_or("");
                if action == "retry" {
                    ctx.device.set_internal_state(None).await;
                    if let Err(e) = ctx.device.initialize(ctx.method.params().use_empty_passphrase).await {
                        let message = e.to_string();
                        if CoreError::is_invalid_pin(&message) && pin_tries < 3 {
                            ctx.emit(CoreMessage::ui(tags::UI_INVALID_PIN, None));
                            return InnerOutcome::RestartPin;
                        }
                        ctx.device.set_internal_state(None).await;
                        return InnerOutcome::Done(Err(e));
                    }
                    return InnerOutcome::RestartState;
                } else if action == "accept" {
                    ctx.device.set_external_state(Some(returned_state)).await;
                }
            } else {
                return InnerOutcome::Done(Err(CoreError::DeviceInvalidState));
            }
        }
    }

    // 10. Popup state.
    if ctx.method.params().use_ui {
        if let Err(err) = ctx.popup.wait().await {
            return InnerOutcome::Done(Err(err));
        }
    } else {
        ctx.emit(CoreMessage::popup(tags::POPUP_CANCEL_POPUP_REQUEST));
    }

    // 11. Custom protocol.
    if let Some(custom) = ctx.method.get_custom_messages() {
        ctx.device_list.configure_protocol(None, Some(custom), true).await;
    }

    // 12. Execute.
    InnerOutcome::Done(ctx.method.run(ctx.method_ctx).await)
}

/// spec §4.5 "Cleanup (always)" plus "Disconnect-during-auth". Runs
/// regardless of whether the session succeeded, and is the single release
/// site for the device session, popup state, UiPromise registry, and
/// Interaction Timeout (spec §5 "Resource discipline").
async fn cleanup_session(
    ctx: &DispatcherContext,
    device: &Arc<dyn Device>,
    method: &Arc<dyn Method>,
    result: &Result<Value, CoreError>,
) {
    if method.params().name == "rebootToBootloader" && result.is_ok() {
        tokio::time::sleep(std::time::Duration::from_millis(501)).await;
        let refresh: crate::device::BodyFn<'_> = Box::new(|| Box::pin(async { Ok(Value::Null) }));
        let _ = device
            .run(
                refresh,
                RunOptions {
                    keep_session: false,
                    use_empty_passphrase: false,
                    skip_final_reload: true,
                },
            )
            .await;
    }

    device.cleanup().await;

    ctx.cancel_popup();
    ctx.emit(CoreMessage::ui(tags::UI_CLOSE_UI_WINDOW, None));
    ctx.popup.reset();
    ctx.ui_promises.lock().await.clear();
    ctx.timeout.stop();
    method.dispose().await;

    match result {
        Ok(_) => {
            ctx.auth_penalties.clear(device.device_path()).await;
            ctx.device_list.configure_protocol(None, None, false).await;
        }
        Err(CoreError::DeviceDisconnected) => {
            ctx.auth_penalties.penalize(device.device_path()).await;
        }
        Err(CoreError::MethodFailure(message)) if CoreError::is_wrong_previous_session(message) => {
            ctx.device_list.enumerate().await;
        }
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_registry::CallRegistry;
    use crate::device::list::TransportKind;
    use crate::device::mock::{MockDevice, MockDeviceConfig, MockDeviceList};
    use crate::method::MethodParams;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct EchoMethod {
        params: MethodParams,
    }

    #[async_trait::async_trait]
    impl Method for EchoMethod {
        fn params(&self) -> &MethodParams {
            &self.params
        }
        async fn check_firmware_range(&self, _using_popup: bool) -> Option<crate::device::FirmwareException> {
            None
        }
        async fn check_permissions(&self) -> bool {
            true
        }
        async fn request_permissions(&self) -> bool {
            true
        }
        async fn run(&self, _ctx: &MethodContext) -> Result<Value, CoreError> {
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    fn test_ctx(list: Arc<MockDeviceList>, emitted: Arc<StdMutex<Vec<CoreMessage>>>) -> DispatcherContext {
        let emitted_clone = emitted.clone();
        DispatcherContext {
            device_list: list,
            call_registry: Arc::new(AsyncMutex::new(CallRegistry::new())),
            ui_promises: Arc::new(AsyncMutex::new(UiPromiseRegistry::new())),
            popup: PopupPromise::new(),
            preferred_device: Arc::new(AsyncMutex::new(None)),
            timeout: InteractionTimeout::new(0),
            emit: Arc::new(move |m: CoreMessage| emitted_clone.lock().unwrap().push(m)),
            list_changed: Arc::new(Notify::new()),
            settings: Settings::default(),
            auth_penalties: Arc::new(AuthPenalties::new()),
        }
    }

    #[tokio::test]
    async fn device_less_call_skips_selection_and_responds_once() {
        let list = MockDeviceList::new(TransportKind::Hid);
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let ctx = test_ctx(list, emitted.clone());
        let mut params = MethodParams::default();
        params.use_device = false;
        params.use_ui = false;
        params.name = "getFeatures".into();
        let method: Arc<dyn Method> = Arc::new(EchoMethod { params });

        handle_call(
            &ctx,
            CallRequest {
                call_id: 1,
                method: Ok(method),
                trusted: true,
                management_allowed: true,
                requested_device_path: None,
            },
        )
        .await;

        let seen = emitted.lock().unwrap();
        assert!(seen.iter().any(|m| m.kind == tags::POPUP_CANCEL_POPUP_REQUEST));
        let response = seen.iter().find(|m| m.id == Some(1)).expect("response emitted");
        assert_eq!(response.success, Some(true));
        assert!(ctx.call_registry.try_lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_device_call_runs_session_and_cleans_up() {
        ctx_with_single_device_runs().await;
    }

    async fn ctx_with_single_device_runs() {
        let list = MockDeviceList::new(TransportKind::Hid);
        list.insert(MockDevice::new("p1", MockDeviceConfig::default())).await;
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let ctx = test_ctx(list, emitted.clone());
        let mut params = MethodParams::default();
        params.name = "getAddress".into();
        params.use_ui = false;
        ctx.popup.resolve();
        let method: Arc<dyn Method> = Arc::new(EchoMethod { params });

        handle_call(
            &ctx,
            CallRequest {
                call_id: 2,
                method: Ok(method),
                trusted: true,
                management_allowed: true,
                requested_device_path: None,
            },
        )
        .await;

        let seen = emitted.lock().unwrap();
        let response = seen.iter().find(|m| m.id == Some(2)).expect("response emitted");
        assert_eq!(response.success, Some(true));
        assert!(seen.iter().any(|m| m.kind == tags::UI_CLOSE_UI_WINDOW));
        assert!(ctx.call_registry.try_lock().unwrap().is_empty());
        assert!(!ctx.popup.is_ready(), "cleanup resets the popup slot");
    }

    #[tokio::test]
    async fn override_fails_the_victim_and_succeeds_the_new_call() {
        let list = MockDeviceList::new(TransportKind::Hid);
        let device = MockDevice::new("p1", MockDeviceConfig::default());
        list.insert(device.clone()).await;
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let ctx = test_ctx(list, emitted.clone());
        ctx.popup.resolve();

        {
            let mut registry = ctx.call_registry.lock().await;
            registry.register(10, Some("p1".to_string()), "getAddress");
        }
        // simulate call 10 already being marked overridden and responded,
        // as the dispatcher itself would have done once device.override_with
        // unwound its in-flight `run`.
        let marked = {
            let mut registry = ctx.call_registry.lock().await;
            registry.mark_overridden_on_device("p1", 11)
        };
        assert_eq!(marked, vec![10]);
        ctx.respond(10, &Err(CoreError::MethodOverride)).await;

        let mut params = MethodParams::default();
        params.name = "signTransaction".into();
        params.use_ui = false;
        params.override_previous_call = true;
        let method: Arc<dyn Method> = Arc::new(EchoMethod { params });

        handle_call(
            &ctx,
            CallRequest {
                call_id: 11,
                method: Ok(method),
                trusted: true,
                management_allowed: true,
                requested_device_path: Some("p1".to_string()),
            },
        )
        .await;

        let seen = emitted.lock().unwrap();
        let victim = seen.iter().find(|m| m.id == Some(10)).expect("victim response");
        assert_eq!(victim.success, Some(false));
        let winner = seen.iter().find(|m| m.id == Some(11)).expect("winner response");
        assert_eq!(winner.success, Some(true));
        assert!(ctx.call_registry.try_lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_device_without_override_fails_call_in_progress() {
        let list = MockDeviceList::new(TransportKind::Hid);
        let mut config = MockDeviceConfig::default();
        config.running = true;
        config.loaded = true;
        let device = MockDevice::new("p1", config);
        list.insert(device).await;
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let ctx = test_ctx(list, emitted.clone());
        ctx.popup.resolve();

        let mut params = MethodParams::default();
        params.name = "getAddress".into();
        let method: Arc<dyn Method> = Arc::new(EchoMethod { params });

        handle_call(
            &ctx,
            CallRequest {
                call_id: 5,
                method: Ok(method),
                trusted: true,
                management_allowed: true,
                requested_device_path: Some("p1".to_string()),
            },
        )
        .await;

        let seen = emitted.lock().unwrap();
        let response = seen.iter().find(|m| m.id == Some(5)).expect("response emitted");
        assert_eq!(response.success, Some(false));
        assert_eq!(
            response.payload.as_ref().and_then(|p| p.get("code")).and_then(Value::as_str),
            Some("Device_CallInProgress")
        );
    }

    #[tokio::test]
    async fn bad_pin_then_good_pin_retries_and_succeeds() {
        let list = MockDeviceList::new(TransportKind::Hid);
        let mut config = MockDeviceConfig::default();
        config.state_mismatch = Some(vec![1, 2, 3]);
        config.fail_initialize_with = Some(crate::error::INVALID_PIN_ERROR_MESSAGE.to_string());
        let device = MockDevice::new("p1", config);
        list.insert(device).await;
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let ctx = test_ctx(list, emitted.clone());
        ctx.popup.resolve();

        let mut params = MethodParams::default();
        params.name = "getAddress".into();
        params.use_device_state = true;
        params.use_ui = false;
        let method: Arc<dyn Method> = Arc::new(EchoMethod { params });

        let registry = ctx.ui_promises.clone();
        let feeder = tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                let mut reg = registry.lock().await;
                if reg.resolve(tags::UI_INVALID_PASSPHRASE_ACTION, serde_json::json!("retry")) {
                    break;
                }
            }
        });

        handle_call(
            &ctx,
            CallRequest {
                call_id: 3,
                method: Ok(method),
                trusted: true,
                management_allowed: true,
                requested_device_path: Some("p1".to_string()),
            },
        )
        .await;
        feeder.await.unwrap();

        let seen = emitted.lock().unwrap();
        assert!(seen.iter().any(|m| m.kind == tags::UI_INVALID_PIN));
        let response = seen.iter().find(|m| m.id == Some(3)).expect("response emitted");
        assert_eq!(response.success, Some(true));
    }

    struct UnpermittedMethod {
        params: MethodParams,
    }

    #[async_trait::async_trait]
    impl Method for UnpermittedMethod {
        fn params(&self) -> &MethodParams {
            &self.params
        }
        async fn check_firmware_range(&self, _using_popup: bool) -> Option<crate::device::FirmwareException> {
            None
        }
        async fn check_permissions(&self) -> bool {
            false
        }
        async fn request_permissions(&self) -> bool {
            false
        }
        async fn run(&self, _ctx: &MethodContext) -> Result<Value, CoreError> {
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    #[tokio::test]
    async fn trusted_host_proceeds_despite_unretrieved_permissions() {
        let list = MockDeviceList::new(TransportKind::Hid);
        list.insert(MockDevice::new("p1", MockDeviceConfig::default())).await;
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let ctx = test_ctx(list, emitted.clone());
        ctx.popup.resolve();

        let mut params = MethodParams::default();
        params.name = "getAddress".into();
        params.use_ui = false;
        params.required_permissions = vec![crate::method::Permission::Read];
        let method: Arc<dyn Method> = Arc::new(UnpermittedMethod { params });

        handle_call(
            &ctx,
            CallRequest {
                call_id: 20,
                method: Ok(method),
                trusted: true,
                management_allowed: true,
                requested_device_path: Some("p1".to_string()),
            },
        )
        .await;

        let seen = emitted.lock().unwrap();
        let response = seen.iter().find(|m| m.id == Some(20)).expect("response emitted");
        assert_eq!(
            response.success,
            Some(true),
            "a trusted host is auto-permitted even when check_permissions() hasn't cached a grant"
        );
    }

    #[tokio::test]
    async fn untrusted_host_is_denied_when_permissions_prompt_fails() {
        let list = MockDeviceList::new(TransportKind::Hid);
        list.insert(MockDevice::new("p1", MockDeviceConfig::default())).await;
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let ctx = test_ctx(list, emitted.clone());
        ctx.popup.resolve();

        let mut params = MethodParams::default();
        params.name = "getAddress".into();
        params.use_ui = false;
        params.required_permissions = vec![crate::method::Permission::Read];
        let method: Arc<dyn Method> = Arc::new(UnpermittedMethod { params });

        handle_call(
            &ctx,
            CallRequest {
                call_id: 21,
                method: Ok(method),
                trusted: false,
                management_allowed: true,
                requested_device_path: Some("p1".to_string()),
            },
        )
        .await;

        let seen = emitted.lock().unwrap();
        let response = seen.iter().find(|m| m.id == Some(21)).expect("response emitted");
        assert_eq!(response.success, Some(false));
        assert_eq!(
            response.payload.as_ref().and_then(|p| p.get("code")).and_then(Value::as_str),
            Some("Method_PermissionsNotGranted")
        );
    }
}
