//! C4: Device Selection (spec §4.4).

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::auth_penalty::AuthPenalties;
use crate::deferred::UiPromiseRegistry;
use crate::device::list::{DeviceList, TransportKind};
use crate::device::Device;
use crate::error::CoreError;
use crate::message::{tags, CoreMessage};
use crate::popup::PopupPromise;

/// Sticky "use this device again" hint (spec §3). Cleared when that
/// device disconnects or the user un-sets "remember".
#[derive(Debug, Clone)]
pub struct PreferredDevice {
    pub path: String,
}

pub type PreferredDeviceSlot = Arc<Mutex<Option<PreferredDevice>>>;

/// Everything Device Selection needs that otherwise lives on the Core
/// Controller; bundled so `select` doesn't need the whole controller.
pub struct SelectionContext {
    pub device_list: Arc<dyn DeviceList>,
    pub ui_promises: Arc<Mutex<UiPromiseRegistry>>,
    pub popup: PopupPromise,
    pub preferred_device: PreferredDeviceSlot,
    pub emit: Arc<dyn Fn(CoreMessage) + Send + Sync>,
    /// Notified whenever the device list's contents change (connect /
    /// disconnect), so a pending picker can re-evaluate live (spec §4.4
    /// "Concurrent list changes").
    pub list_changed: Arc<Notify>,
    /// Paths that recently disconnected mid-authentication (spec §4.5
    /// "Disconnect-during-auth") are held back from auto-selection here,
    /// the one place new connection attempts actually originate.
    pub auth_penalties: Arc<AuthPenalties>,
}

async fn readable_non_webusb_devices(ctx: &SelectionContext) -> Vec<Arc<dyn Device>> {
    let mut out = Vec::new();
    if ctx.device_list.transport_kind() == TransportKind::WebUsb {
        return out;
    }
    for device in ctx.device_list.devices().await {
        if !device.has_unreadable_error().await && !ctx.auth_penalties.is_penalized(device.device_path()).await {
            out.push(device);
        }
    }
    out
}

pub async fn select(ctx: &SelectionContext, requested_path: Option<&str>) -> Result<Arc<dyn Device>, CoreError> {
    if !ctx.device_list.is_available().await {
        return Err(CoreError::TransportMissing);
    }

    let is_webusb = ctx.device_list.transport_kind() == TransportKind::WebUsb;
    let mut show_picker = is_webusb;
    let mut resolved: Option<Arc<dyn Device>> = None;

    if let Some(path) = requested_path {
        if let Some(device) = ctx.device_list.get_device(path).await {
            // A penalized path is held back exactly like an unreadable one:
            // route it through the picker instead of auto-reconnecting
            // immediately, giving the penalty window (spec §4.5) a chance
            // to delay the retry.
            show_picker = device.has_unreadable_error().await || ctx.auth_penalties.is_penalized(path).await;
            resolved = Some(device);
        } else {
            show_picker = true;
        }
    } else {
        let candidates = readable_non_webusb_devices(ctx).await;
        if !is_webusb && candidates.len() == 1 {
            let device = candidates.into_iter().next().unwrap();
            show_picker = device.has_unreadable_error().await;
            resolved = Some(device);
        } else {
            show_picker = true;
        }
    }

    if show_picker {
        resolved = run_picker(ctx).await?;
    }

    resolved.ok_or(CoreError::DeviceNotFound)
}

async fn run_picker(ctx: &SelectionContext) -> Result<Option<Arc<dyn Device>>, CoreError> {
    let future = {
        let mut registry = ctx.ui_promises.lock().await;
        registry.create(tags::UI_RECEIVE_DEVICE, None)
    };
    if let Err(err) = ctx.popup.wait().await {
        let mut registry = ctx.ui_promises.lock().await;
        registry.resolve(tags::UI_RECEIVE_DEVICE, Value::Null);
        drop(registry);
        return Err(err);
    }

    let candidates = readable_non_webusb_devices(ctx).await;
    if candidates.len() == 1 {
        let mut registry = ctx.ui_promises.lock().await;
        registry.resolve(tags::UI_RECEIVE_DEVICE, Value::Null);
        drop(registry);
        let device = candidates.into_iter().next().unwrap();
        return Ok(Some(device));
    }

    let device_list = serde_json::Value::Array(
        futures::future::join_all(candidates.iter().map(|d| d.to_message_object())).await,
    );
    (ctx.emit)(CoreMessage::ui(tags::UI_SELECT_DEVICE, Some(device_list)));

    loop {
        tokio::select! {
            result = wait_for_selection(ctx, future) => return result,
            _ = ctx.list_changed.notified() => {
                let candidates = readable_non_webusb_devices(ctx).await;
                if candidates.len() == 1 {
                    let mut registry = ctx.ui_promises.lock().await;
                    registry.resolve(tags::UI_RECEIVE_DEVICE, Value::Null);
                    return Ok(Some(candidates.into_iter().next().unwrap()));
                }
                let device_list = serde_json::Value::Array(
                    futures::future::join_all(candidates.iter().map(|d| d.to_message_object())).await,
                );
                (ctx.emit)(CoreMessage::ui(tags::UI_SELECT_DEVICE, Some(device_list)));
            }
        }
    }
}

async fn wait_for_selection(
    ctx: &SelectionContext,
    future: crate::deferred::DeferredFuture<crate::deferred::UiPromiseResult>,
) -> Result<Option<Arc<dyn Device>>, CoreError> {
    let result = future.wait().await?;
    if result.event == tags::DEVICE_DISCONNECT {
        return Ok(None);
    }
    let path = result
        .payload
        .get("path")
        .and_then(Value::as_str)
        .map(str::to_string);
    let remember = result
        .payload
        .get("remember")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let device = match &path {
        Some(p) => ctx.device_list.get_device(p).await,
        None => None,
    };

    if remember {
        if let Some(p) = path {
            *ctx.preferred_device.lock().await = Some(PreferredDevice { path: p });
        }
    }

    Ok(device)
}
