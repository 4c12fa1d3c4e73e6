//! Console session admission and lifecycle for hearth.
//!
//! The [`SessionBroker`] enforces per-user concurrency caps, idle and
//! absolute timeouts and a reconnect throttle, and hands each console proxy
//! a cancellation handle that fires when its session ends.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod broker;
pub mod config;
pub mod error;
pub mod session;

pub use broker::SessionBroker;
pub use config::BrokerConfig;
pub use error::SessionError;
pub use session::{generate_session_id, ActiveSession, SESSION_ID_BYTES};
