//! Broker limits and timeouts.

use std::time::Duration;

use hearth_core::{env, CoreError};
use serde::{Deserialize, Serialize};

/// Admission and expiry settings for the [`SessionBroker`](crate::SessionBroker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Live sessions one user may hold at once.
    pub max_concurrent: usize,
    /// A session with no activity for this long expires.
    pub idle_timeout: Duration,
    /// Absolute session lifetime.
    pub max_duration: Duration,
    /// Look-back window of the reconnect throttle.
    pub reconnect_window: Duration,
    /// Sessions a user may start within the window before being throttled.
    pub reconnect_max: usize,
    pub reap_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            idle_timeout: Duration::from_secs(15 * 60),
            max_duration: Duration::from_secs(4 * 60 * 60),
            reconnect_window: Duration::from_secs(30),
            reconnect_max: 3,
            reap_interval: Duration::from_secs(60),
        }
    }
}

impl BrokerConfig {
    /// Reads `HEARTH_SESSION_*`, `HEARTH_RECONNECT_*` and
    /// `HEARTH_REAP_INTERVAL_SECS`, falling back to the defaults.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] for unparsable values or a zero
    /// reap interval.
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();
        let config = Self {
            max_concurrent: env::parse_or(
                "HEARTH_SESSION_MAX_CONCURRENT",
                defaults.max_concurrent,
            )?,
            idle_timeout: env::secs_or("HEARTH_SESSION_IDLE_SECS", defaults.idle_timeout)?,
            max_duration: env::secs_or("HEARTH_SESSION_MAX_SECS", defaults.max_duration)?,
            reconnect_window: env::secs_or(
                "HEARTH_RECONNECT_WINDOW_SECS",
                defaults.reconnect_window,
            )?,
            reconnect_max: env::parse_or("HEARTH_RECONNECT_MAX", defaults.reconnect_max)?,
            reap_interval: env::secs_or("HEARTH_REAP_INTERVAL_SECS", defaults.reap_interval)?,
        };
        if config.reap_interval.is_zero() {
            return Err(CoreError::InvalidConfig {
                key: "HEARTH_REAP_INTERVAL_SECS".to_owned(),
                value: "0".to_owned(),
                reason: "reap interval must be positive".to_owned(),
            });
        }
        Ok(config)
    }
}
