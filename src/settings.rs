//! Core settings (spec §4.7, §6). The core owns the in-memory type and its
//! defaults; loading a config file remains an external collaborator's job
//! per spec §1.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_interaction_timeout() -> u32 {
    // kept in line with the teacher's popup-timeout defaults
    600_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_true")]
    pub popup: bool,
    #[serde(default = "default_interaction_timeout")]
    pub interaction_timeout: u32,
    #[serde(default)]
    pub trusted_host: bool,
    #[serde(default)]
    pub transport_reconnect: bool,
    #[serde(default = "default_true")]
    pub webusb: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            debug: false,
            popup: true,
            interaction_timeout: default_interaction_timeout(),
            trusted_host: false,
            transport_reconnect: false,
            webusb: true,
        }
    }
}

impl Settings {
    /// The effective interaction-timeout duration the Interaction Timeout
    /// is constructed with: disabled entirely when `!popup` (spec §4.7).
    pub fn effective_interaction_timeout_ms(&self) -> u32 {
        if self.popup {
            self.interaction_timeout
        } else {
            0
        }
    }

    /// Reads `KEEPKEY_CORE_*` environment variables over the defaults.
    /// Missing or unparsable variables fall back silently to the default,
    /// matching the teacher's permissive environment-config layering.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        if let Ok(v) = std::env::var("KEEPKEY_CORE_DEBUG") {
            if let Ok(b) = v.parse() {
                settings.debug = b;
            }
        }
        if let Ok(v) = std::env::var("KEEPKEY_CORE_POPUP") {
            if let Ok(b) = v.parse() {
                settings.popup = b;
            }
        }
        if let Ok(v) = std::env::var("KEEPKEY_CORE_INTERACTION_TIMEOUT") {
            if let Ok(n) = v.parse() {
                settings.interaction_timeout = n;
            }
        }
        if let Ok(v) = std::env::var("KEEPKEY_CORE_TRUSTED_HOST") {
            if let Ok(b) = v.parse() {
                settings.trusted_host = b;
            }
        }
        if let Ok(v) = std::env::var("KEEPKEY_CORE_TRANSPORT_RECONNECT") {
            if let Ok(b) = v.parse() {
                settings.transport_reconnect = b;
            }
        }
        if let Ok(v) = std::env::var("KEEPKEY_CORE_WEBUSB") {
            if let Ok(b) = v.parse() {
                settings.webusb = b;
            }
        }
        settings
    }
}
