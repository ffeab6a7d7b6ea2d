//! Core Session Orchestrator for a hardware-wallet client bridge.
//!
//! Mediates between an untrusted caller, a trusted UI popup, and one or
//! more physical signing devices reached through a pluggable transport.
//! See `SPEC_FULL.md` for the full component breakdown; in short:
//!
//! - [`deferred`] / [`call_registry`] - the named, cancelable one-shot
//!   promise registry and the in-flight call table (C1, part of §3).
//! - [`timeout`] - the single restartable "user idle" timer (C2).
//! - [`gateway`] - origin firewall and inbound/outbound routing (C3).
//! - [`selection`] - device-picking logic (C4).
//! - [`dispatcher`] - the call lifecycle state machine (C5).
//! - [`event_bridge`] - device button/PIN/passphrase/word round-trips (C6).
//! - [`controller`] - owns everything above (C7).

pub mod auth_penalty;
pub mod call_registry;
pub mod controller;
pub mod deferred;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod event_bridge;
pub mod gateway;
pub mod message;
pub mod method;
pub mod popup;
pub mod selection;
pub mod settings;
pub mod timeout;

pub use controller::{CoreController, MethodFactory, TransportInfo};
pub use error::CoreError;
pub use message::CoreMessage;
pub use method::{Method, MethodContext, MethodParams, Permission};
pub use settings::Settings;
