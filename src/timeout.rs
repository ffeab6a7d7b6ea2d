//! C2: Interaction Timeout - a single restartable "user went idle" timer
//! (spec §4.2).
//!
//! Restart-on-activity timers in the teacher are done ad hoc per poll loop
//! (`event_controller.rs`'s 1s `tokio::select!` tick); here it is pulled
//! into one small reusable primitive backed by a generation counter plus
//! `tokio::time::sleep`, the same shape `tokio_util::sync::CancellationToken`
//! encourages for cooperative cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Reason string spec §4.2 requires on expiry.
pub const INTERACTION_TIMEOUT_REASON: &str = "Interaction timeout";

struct Inner {
    duration_ms: AtomicU64,
    generation: AtomicU64,
    notify: Notify,
    stopped: AtomicU64,
}

/// Handle to the timer; clone freely, all clones share the same state.
#[derive(Clone)]
pub struct InteractionTimeout {
    inner: Arc<Inner>,
}

impl InteractionTimeout {
    /// `duration_ms == 0` disables the timer entirely (spec §4.2, used when
    /// `!settings.popup`).
    pub fn new(duration_ms: u32) -> Self {
        InteractionTimeout {
            inner: Arc::new(Inner {
                duration_ms: AtomicU64::new(duration_ms as u64),
                generation: AtomicU64::new(0),
                notify: Notify::new(),
                stopped: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.duration_ms.load(Ordering::SeqCst) == 0
    }

    /// Restarts the timer: every UI-bound wait calls this (spec §4.2, and
    /// the button-request handler in §4.6).
    pub fn restart(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.stopped.store(0, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Stops the timer so it never fires again until the next `restart`.
    /// Called unconditionally in Call Dispatcher Cleanup (spec §4.5 (d)).
    pub fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.stopped.store(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Waits until the timer fires (returns `true`) or is stopped/restarted
    /// before expiry (returns `false`, caller should poll again if still
    /// interested). Never resolves if disabled.
    pub async fn wait_expired(&self) -> bool {
        if self.is_disabled() {
            std::future::pending::<()>().await;
            unreachable!();
        }
        loop {
            // Register interest before checking state, so a concurrent
            // `restart`/`stop` is never missed (tokio::sync::Notify's
            // documented-safe pattern).
            let notified = self.inner.notify.notified();
            let gen_at_start = self.inner.generation.load(Ordering::SeqCst);
            if self.inner.stopped.load(Ordering::SeqCst) == 1 {
                notified.await;
                continue;
            }
            let duration = Duration::from_millis(self.inner.duration_ms.load(Ordering::SeqCst));
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    if self.inner.generation.load(Ordering::SeqCst) == gen_at_start {
                        return true;
                    }
                }
                _ = notified => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_timer_never_fires() {
        let t = InteractionTimeout::new(0);
        assert!(t.is_disabled());
        let fired = tokio::time::timeout(Duration::from_millis(50), t.wait_expired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_pushes_expiry_back() {
        let t = InteractionTimeout::new(100);
        let handle = t.clone();
        let waiter = tokio::spawn(async move { handle.wait_expired().await });
        tokio::time::advance(Duration::from_millis(60)).await;
        t.restart();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!waiter.is_finished());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_suppresses_expiry_until_restart() {
        let t = InteractionTimeout::new(50);
        t.stop();
        let handle = t.clone();
        let waiter = tokio::spawn(async move { handle.wait_expired().await });
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());
        t.restart();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(waiter.await.unwrap());
    }
}
