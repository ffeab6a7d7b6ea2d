//! Per-device auth-penalty bookkeeping (SPEC_FULL.md §B), grounded in the
//! teacher's `device_registry.rs` queue-handle-preserving insert/remove: a
//! small table keyed by `devicePath` instead of a whole registry.
//!
//! A penalized path is one that recently disconnected mid-authentication
//! (spec §4.5 "Disconnect-during-auth"); Device Selection doesn't consult
//! this table directly, but the Call Dispatcher clears it on every
//! successful call (spec §4.5 Cleanup (f)) and records it on every
//! `Device_Disconnected` failure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const PENALTY_DURATION: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct AuthPenalties {
    inner: Mutex<HashMap<String, Instant>>,
}

impl AuthPenalties {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn penalize(&self, device_path: &str) {
        self.inner
            .lock()
            .await
            .insert(device_path.to_string(), Instant::now());
    }

    /// Removed on Cleanup (f) for a call that ended in success (spec §4.5).
    pub async fn clear(&self, device_path: &str) {
        self.inner.lock().await.remove(device_path);
    }

    pub async fn is_penalized(&self, device_path: &str) -> bool {
        match self.inner.lock().await.get(device_path) {
            Some(since) => since.elapsed() < PENALTY_DURATION,
            None => false,
        }
    }
}
