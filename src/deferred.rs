//! C1: Deferred completion cells and the UiPromise registry (spec §4.1).
//!
//! Grounded in `keepkey-rust::device_queue`'s `oneshot::Sender` pattern for
//! a single resolvable slot, generalized here to a named, cancelable
//! registry the way `vault-v2`'s `device/pending_operations.rs` keeps an
//! ordered, sweepable collection of in-flight entries instead of a single
//! global.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::CoreError;

/// A single-shot completion cell. `resolve`/`reject` after the receiver
/// has already been consumed (or dropped) are no-ops, matching spec
/// §4.1's idempotence requirement.
pub struct Deferred<T> {
    tx: Option<oneshot::Sender<Result<T, CoreError>>>,
}

pub struct DeferredFuture<T> {
    rx: oneshot::Receiver<Result<T, CoreError>>,
}

impl<T> Deferred<T> {
    pub fn new() -> (Deferred<T>, DeferredFuture<T>) {
        let (tx, rx) = oneshot::channel();
        (Deferred { tx: Some(tx) }, DeferredFuture { rx })
    }

    pub fn resolve(&mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(value));
        }
    }

    pub fn reject(&mut self, err: CoreError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    pub fn is_settled(&self) -> bool {
        self.tx.is_none()
    }
}

impl<T> DeferredFuture<T> {
    /// Awaits the deferred result. A dropped `Deferred` (the producer went
    /// away without resolving) surfaces as `Method_Interrupted`.
    pub async fn wait(self) -> Result<T, CoreError> {
        match self.rx.await {
            Ok(r) => r,
            Err(_) => Err(CoreError::MethodInterrupted),
        }
    }
}

/// Payload delivered to a resolved UiPromise: the event tag it matched
/// plus whatever JSON payload the inbound message carried.
#[derive(Debug, Clone)]
pub struct UiPromiseResult {
    pub event: String,
    pub payload: Value,
}

/// One outstanding UI round-trip, optionally bound to a device path.
///
/// `request_id` exists purely for log correlation - grounded in
/// `vault-v2`'s `device/interaction_state.rs`, which tags each
/// `AwaitingPIN`/`AwaitingButton`/... variant with a `Uuid` so a
/// late-arriving response can be traced back to the interaction that
/// requested it. The core's own matching stays tag-only per spec §4.1.
pub struct UiPromiseEntry {
    pub tag: String,
    pub device_path: Option<String>,
    pub request_id: uuid::Uuid,
    deferred: Deferred<UiPromiseResult>,
}

/// Ordered collection of outstanding UiPromises, FIFO per tag (spec §4.1,
/// §5 ordering guarantee (c)).
#[derive(Default)]
pub struct UiPromiseRegistry {
    entries: Vec<UiPromiseEntry>,
}

impl UiPromiseRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registers a new promise for `tag`, optionally bound to a device.
    pub fn create(
        &mut self,
        tag: impl Into<String>,
        device_path: Option<String>,
    ) -> DeferredFuture<UiPromiseResult> {
        let (deferred, future) = Deferred::new();
        let request_id = uuid::Uuid::new_v4();
        self.entries.push(UiPromiseEntry {
            tag: tag.into(),
            device_path,
            request_id,
            deferred,
        });
        tracing::trace!(%request_id, "registered UiPromise");
        future
    }

    /// Finds the first registered promise matching `tag`, ignoring call id
    /// per the Open Question decision in SPEC_FULL.md §C(a) - device-scoped
    /// disambiguation is available via [`Self::resolve_for_device`].
    fn index_of(&self, tag: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.tag == tag)
    }

    fn index_of_for_device(&self, tag: &str, device_path: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.tag == tag && e.device_path.as_deref() == Some(device_path))
    }

    /// Resolves the first promise matching `tag` with `payload`, removing
    /// it from the registry. Returns `false` if no match was found.
    pub fn resolve(&mut self, tag: &str, payload: Value) -> bool {
        if let Some(idx) = self.index_of(tag) {
            let mut entry = self.entries.remove(idx);
            entry.deferred.resolve(UiPromiseResult {
                event: entry.tag.clone(),
                payload,
            });
            true
        } else {
            false
        }
    }

    /// Resolves the promise bound to `device_path` matching `tag`, used by
    /// the disconnect path to synthesize a `DISCONNECT` event (spec §5).
    pub fn resolve_for_device(&mut self, tag: &str, device_path: &str, payload: Value) -> bool {
        if let Some(idx) = self.index_of_for_device(tag, device_path) {
            let mut entry = self.entries.remove(idx);
            entry.deferred.resolve(UiPromiseResult {
                event: entry.tag.clone(),
                payload,
            });
            true
        } else {
            false
        }
    }

    /// Removes and resolves every promise bound to `device_path` with a
    /// synthetic DISCONNECT payload (spec §5's disconnect cancellation
    /// point). Returns the number of promises resolved.
    pub fn disconnect_device(&mut self, device_path: &str) -> usize {
        let mut resolved = 0;
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].device_path.as_deref() == Some(device_path) {
                let mut entry = self.entries.remove(i);
                entry.deferred.resolve(UiPromiseResult {
                    event: crate::message::tags::DEVICE_DISCONNECT.to_string(),
                    payload: Value::Null,
                });
                resolved += 1;
            } else {
                i += 1;
            }
        }
        resolved
    }

    /// Rejects and clears every outstanding promise (popup-closed / timeout
    /// cancellation path, spec §5).
    pub fn reject_all(&mut self, err: CoreError) {
        for mut entry in self.entries.drain(..) {
            entry.deferred.reject(err.clone());
        }
    }

    /// Drops every outstanding entry without an explicit reject; any
    /// future still awaiting one resolves `Err(Method_Interrupted)` via
    /// the closed oneshot channel (spec §4.5 Cleanup (c), "clear the
    /// UiPromise registry").
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_matches_fifo_by_tag_only() {
        let mut reg = UiPromiseRegistry::new();
        let f1 = reg.create("UI.RECEIVE_PIN", None);
        let f2 = reg.create("UI.RECEIVE_PIN", None);
        assert!(reg.resolve("UI.RECEIVE_PIN", serde_json::json!("1111")));
        let r1 = f1.wait().await.unwrap();
        assert_eq!(r1.payload, serde_json::json!("1111"));
        assert_eq!(reg.len(), 1);
        assert!(reg.resolve("UI.RECEIVE_PIN", serde_json::json!("2222")));
        let r2 = f2.wait().await.unwrap();
        assert_eq!(r2.payload, serde_json::json!("2222"));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn resolve_after_completion_is_noop() {
        let mut deferred_holder = UiPromiseRegistry::new();
        let fut = deferred_holder.create("UI.RECEIVE_WORD", None);
        assert!(deferred_holder.resolve("UI.RECEIVE_WORD", Value::Null));
        assert!(!deferred_holder.resolve("UI.RECEIVE_WORD", Value::Null));
        fut.wait().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_resolves_only_bound_device_entries() {
        let mut reg = UiPromiseRegistry::new();
        let bound = reg.create("UI.RECEIVE_PIN", Some("p1".into()));
        let unbound = reg.create("UI.RECEIVE_PIN", None);
        let resolved = reg.disconnect_device("p1");
        assert_eq!(resolved, 1);
        let r = bound.wait().await.unwrap();
        assert_eq!(r.event, "DEVICE.DISCONNECT");
        assert_eq!(reg.len(), 1);
        drop(unbound);
    }

    #[tokio::test]
    async fn dropped_deferred_surfaces_as_interrupted() {
        let (deferred, future) = Deferred::<u32>::new();
        drop(deferred);
        let err = future.wait().await.unwrap_err();
        assert_eq!(err, CoreError::MethodInterrupted);
    }
}
