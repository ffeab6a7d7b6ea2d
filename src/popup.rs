//! PopupPromise: the single-slot "popup is alive and ready" resolver
//! (spec §3, §5). Shaped like [`crate::timeout::InteractionTimeout`] -
//! an `Arc`-shared atomic flag plus a `Notify` - since both are
//! single-slot, many-waiters primitives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Notify;

use crate::error::CoreError;
use crate::message::{tags, CoreMessage};

type Emitter = Arc<dyn Fn(CoreMessage) + Send + Sync>;

struct Inner {
    ready: AtomicBool,
    /// Set once a waiter has already asked the embedder to open the popup
    /// window since the last `reset()`/`reject()`, so `UI.REQUEST_UI_WINDOW`
    /// (spec §6, scenario S2) is only emitted once per open cycle.
    requested: AtomicBool,
    /// Bumped on every `resolve()`/`reject()`/`reset()`. A waiter captures
    /// the epoch in place when it starts `wait()`ing; only a rejection
    /// stamped with an epoch strictly newer than that applies to it. This
    /// keeps `reject()` from poisoning calls that start *after* the popup
    /// was already closed - those get a fresh open/handshake cycle instead
    /// of an immediate, stale error.
    epoch: AtomicU64,
    /// Set by [`PopupPromise::reject`] (popup closed / timeout fired while
    /// no device session is in use, spec §5) so every current waiter
    /// unblocks with the same error instead of hanging until the next
    /// handshake.
    rejected: StdMutex<Option<(u64, CoreError)>>,
    notify: Notify,
    emitter: StdMutex<Option<Emitter>>,
}

#[derive(Clone)]
pub struct PopupPromise {
    inner: Arc<Inner>,
}

impl PopupPromise {
    pub fn new() -> Self {
        PopupPromise {
            inner: Arc::new(Inner {
                ready: AtomicBool::new(false),
                requested: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                rejected: StdMutex::new(None),
                notify: Notify::new(),
                emitter: StdMutex::new(None),
            }),
        }
    }

    /// Wires the outbound emitter used to ask the embedder to open the
    /// popup window. The Core Controller calls this once at `init` time.
    pub fn set_emitter(&self, emit: Emitter) {
        *self.inner.emitter.lock().unwrap() = Some(emit);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// `POPUP.HANDSHAKE` resolves the slot (spec §4.3); a resolve with no
    /// pending waiters is harmless - the slot just stays ready. Clears any
    /// prior rejection: a fresh handshake supersedes it.
    pub fn resolve(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        *self.inner.rejected.lock().unwrap() = None;
        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Unblocks every *currently pending* waiter with `err` (spec §5
    /// "reject ... the PopupPromise with Method_Interrupted") - used when
    /// popup-closed/timeout fires and no device session is currently using
    /// the popup, so there is no `device.run` to race the cancellation
    /// against. Also clears `requested`, so the next call to ask for the
    /// popup gets a fresh `UI.REQUEST_UI_WINDOW` instead of silently
    /// inheriting a closed cycle's flag. A call that starts `wait()` after
    /// this returns is unaffected - it belongs to the next open cycle.
    pub fn reject(&self, err: CoreError) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.rejected.lock().unwrap() = Some((epoch, err));
        self.inner.requested.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Cleanup resets the slot to "none" (spec §4.5 Cleanup (c)); the next
    /// caller to `wait()` blocks until the next handshake, and will ask for
    /// a fresh popup window again.
    pub fn reset(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.requested.store(false, Ordering::SeqCst);
        *self.inner.rejected.lock().unwrap() = None;
    }

    pub async fn wait(&self) -> Result<(), CoreError> {
        let start_epoch = self.inner.epoch.load(Ordering::SeqCst);
        if !self.is_ready() && !self.inner.requested.swap(true, Ordering::SeqCst) {
            if let Some(emit) = self.inner.emitter.lock().unwrap().as_ref() {
                emit(CoreMessage::ui(tags::UI_REQUEST_UI_WINDOW, None));
            }
        }
        loop {
            // Register interest before checking, so a `resolve()`/`reject()`
            // racing with this check is never missed (tokio::sync::Notify's
            // documented-safe pattern).
            let notified = self.inner.notify.notified();
            if let Some((epoch, err)) = self.inner.rejected.lock().unwrap().clone() {
                if epoch > start_epoch {
                    return Err(err);
                }
            }
            if self.is_ready() {
                return Ok(());
            }
            notified.await;
        }
    }
}

impl Default for PopupPromise {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_once_ready() {
        let p = PopupPromise::new();
        p.resolve();
        tokio::time::timeout(Duration::from_millis(10), p.wait())
            .await
            .expect("should not block once ready")
            .unwrap();
    }

    #[tokio::test]
    async fn reset_makes_wait_block_again() {
        let p = PopupPromise::new();
        p.resolve();
        p.reset();
        assert!(!p.is_ready());
        let handle = p.clone();
        let waiter = tokio::spawn(async move { handle.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        p.resolve();
        tokio::time::timeout(Duration::from_millis(50), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn reject_wakes_only_the_waiters_already_pending() {
        let p = PopupPromise::new();
        let handle = p.clone();
        let waiter = tokio::spawn(async move { handle.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        p.reject(CoreError::MethodInterrupted);
        let first = tokio::time::timeout(Duration::from_millis(50), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.unwrap_err(), CoreError::MethodInterrupted);

        // A call that starts waiting *after* the reject belongs to the next
        // open cycle: it must not inherit the stale error and hang forever
        // waiting for a handshake that already happened.
        let second = p.clone();
        let waiter2 = tokio::spawn(async move { second.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter2.is_finished());
        p.resolve();
        tokio::time::timeout(Duration::from_millis(50), waiter2)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn resolve_after_reject_clears_it() {
        let p = PopupPromise::new();
        p.reject(CoreError::MethodInterrupted);
        p.resolve();
        tokio::time::timeout(Duration::from_millis(10), p.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn first_wait_requests_ui_window_once_per_open_cycle() {
        let p = PopupPromise::new();
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let emitted_clone = emitted.clone();
        p.set_emitter(Arc::new(move |m: CoreMessage| emitted_clone.lock().unwrap().push(m.kind)));

        let handle = p.clone();
        let waiter = tokio::spawn(async move { handle.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        p.resolve();
        waiter.await.unwrap().unwrap();

        let second = p.clone();
        tokio::time::timeout(Duration::from_millis(10), second.wait()).await.unwrap().unwrap();

        let seen = emitted.lock().unwrap();
        assert_eq!(seen.iter().filter(|k| k.as_str() == tags::UI_REQUEST_UI_WINDOW).count(), 1);
    }
}
