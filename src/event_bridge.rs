//! C6: Device Event Bridge - turns device button/PIN/passphrase/word
//! requests into UI round-trips (spec §4.6).

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use unicode_normalization::UnicodeNormalization;

use crate::deferred::UiPromiseRegistry;
use crate::device::{ButtonRequestCode, DeviceEventHandlers, PassphraseResponse};
use crate::error::CoreError;
use crate::message::{tags, CoreMessage};
use crate::method::Method;
use crate::popup::PopupPromise;
use crate::timeout::InteractionTimeout;

type Fut<T> = BoxFuture<'static, T>;

/// Builds the handler set the Call Dispatcher attaches to a device for the
/// lifetime of one session (spec §4.5 "Event bridge wiring").
pub fn build_handlers(
    emit: Arc<dyn Fn(CoreMessage) + Send + Sync>,
    popup: PopupPromise,
    ui_promises: Arc<Mutex<UiPromiseRegistry>>,
    timeout: InteractionTimeout,
    method: Arc<dyn Method>,
    use_empty_passphrase: bool,
) -> DeviceEventHandlers {
    DeviceEventHandlers {
        on_button: {
            let emit = emit.clone();
            let popup = popup.clone();
            let timeout = timeout.clone();
            let method = method.clone();
            Box::new(move |code: ButtonRequestCode, _data: Option<Value>| {
                let emit = emit.clone();
                let popup = popup.clone();
                let timeout = timeout.clone();
                let method = method.clone();
                Box::pin(async move {
                    let use_ui = method.params().use_ui;
                    let is_unattended_address = matches!(code, ButtonRequestCode::Address) && !use_ui;
                    if is_unattended_address {
                        emit(CoreMessage::device(tags::DEVICE_BUTTON, None));
                        emit(CoreMessage::ui(tags::UI_REQUEST_BUTTON, None));
                        emit(CoreMessage::ui(tags::UI_ADDRESS_VALIDATION, None));
                    } else {
                        let _ = popup.wait().await;
                        let data = method.get_button_request_data(&code).await;
                        emit(CoreMessage::device(tags::DEVICE_BUTTON, None));
                        emit(CoreMessage::ui(tags::UI_REQUEST_BUTTON, data));
                    }
                    timeout.restart();
                }) as Fut<()>
            })
        },

        on_pin: {
            let emit = emit.clone();
            let popup = popup.clone();
            let ui_promises = ui_promises.clone();
            Box::new(move || {
                let emit = emit.clone();
                let popup = popup.clone();
                let ui_promises = ui_promises.clone();
                Box::pin(async move {
                    popup.wait().await?;
                    let future = {
                        let mut registry = ui_promises.lock().await;
                        registry.create(tags::UI_RECEIVE_PIN, None)
                    };
                    emit(CoreMessage::ui(tags::UI_REQUEST_PIN, None));
                    let result = future.wait().await?;
                    Ok(result.payload.as_str().unwrap_or_default().to_string())
                }) as Fut<Result<String, CoreError>>
            })
        },

        on_word: {
            let emit = emit.clone();
            let popup = popup.clone();
            let ui_promises = ui_promises.clone();
            Box::new(move || {
                let emit = emit.clone();
                let popup = popup.clone();
                let ui_promises = ui_promises.clone();
                Box::pin(async move {
                    popup.wait().await?;
                    let future = {
                        let mut registry = ui_promises.lock().await;
                        registry.create(tags::UI_RECEIVE_WORD, None)
                    };
                    emit(CoreMessage::ui(tags::UI_REQUEST_WORD, None));
                    let result = future.wait().await?;
                    Ok(result.payload.as_str().unwrap_or_default().to_string())
                }) as Fut<Result<String, CoreError>>
            })
        },

        on_passphrase: {
            let emit = emit.clone();
            let popup = popup.clone();
            let ui_promises = ui_promises.clone();
            Box::new(move || {
                let emit = emit.clone();
                let popup = popup.clone();
                let ui_promises = ui_promises.clone();
                Box::pin(async move {
                    if use_empty_passphrase {
                        return Ok(PassphraseResponse {
                            passphrase: String::new(),
                            passphrase_on_device: false,
                            cache: false,
                        });
                    }
                    popup.wait().await?;
                    let future = {
                        let mut registry = ui_promises.lock().await;
                        registry.create(tags::UI_RECEIVE_PASSPHRASE, None)
                    };
                    emit(CoreMessage::ui(tags::UI_REQUEST_PASSPHRASE, None));
                    let result = future.wait().await?;
                    let raw = result.payload.get("passphrase").and_then(Value::as_str).unwrap_or("");
                    let normalized: String = raw.nfkd().collect();
                    let passphrase_on_device = result
                        .payload
                        .get("passphraseOnDevice")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let cache = result.payload.get("save").and_then(Value::as_bool).unwrap_or(false);
                    Ok(PassphraseResponse {
                        passphrase: normalized,
                        passphrase_on_device,
                        cache,
                    })
                }) as Fut<Result<PassphraseResponse, CoreError>>
            })
        },

        on_passphrase_on_device: {
            let emit = emit.clone();
            Box::new(move || {
                let emit = emit.clone();
                Box::pin(async move {
                    emit(CoreMessage::ui(tags::UI_REQUEST_PASSPHRASE_ON_DEVICE, None));
                }) as Fut<()>
            })
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodParams;
    use std::sync::Mutex as StdMutex;

    struct StubMethod {
        params: MethodParams,
    }

    #[async_trait::async_trait]
    impl Method for StubMethod {
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
        async fn run(&self, _ctx: &crate::method::MethodContext) -> Result<Value, CoreError> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn empty_passphrase_shortcuts_without_ui_roundtrip() {
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let emitted_clone = emitted.clone();
        let emit: Arc<dyn Fn(CoreMessage) + Send + Sync> =
            Arc::new(move |m: CoreMessage| emitted_clone.lock().unwrap().push(m.kind));
        let method: Arc<dyn Method> = Arc::new(StubMethod {
            params: MethodParams::default(),
        });
        let handlers = build_handlers(
            emit,
            PopupPromise::new(),
            Arc::new(Mutex::new(UiPromiseRegistry::new())),
            InteractionTimeout::new(0),
            method,
            true,
        );
        let response = (handlers.on_passphrase)().await.unwrap();
        assert_eq!(response.passphrase, "");
        assert!(emitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn button_for_address_without_ui_emits_address_validation() {
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let emitted_clone = emitted.clone();
        let emit: Arc<dyn Fn(CoreMessage) + Send + Sync> =
            Arc::new(move |m: CoreMessage| emitted_clone.lock().unwrap().push(m.kind));
        let mut params = MethodParams::default();
        params.use_ui = false;
        let method: Arc<dyn Method> = Arc::new(StubMethod { params });
        let handlers = build_handlers(
            emit,
            PopupPromise::new(),
            Arc::new(Mutex::new(UiPromiseRegistry::new())),
            InteractionTimeout::new(0),
            method,
            false,
        );
        (handlers.on_button)(ButtonRequestCode::Address, None).await;
        let seen = emitted.lock().unwrap().clone();
        assert!(seen.contains(&tags::UI_ADDRESS_VALIDATION.to_string()));
        assert!(seen.contains(&tags::DEVICE_BUTTON.to_string()));
    }
}
