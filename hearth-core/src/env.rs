//! Helpers for reading `HEARTH_*` environment variables with defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

/// Parses `key` from the environment, falling back to `default` when unset.
///
/// # Errors
/// Returns [`CoreError::InvalidConfig`] if the variable is set but does not
/// parse as `T`.
pub fn parse_or<T>(key: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

/// Reads a whole number of seconds.
///
/// # Errors
/// Returns [`CoreError::InvalidConfig`] on a non-numeric value.
pub fn secs_or(key: &str, default: Duration) -> Result<Duration, CoreError> {
    parse_or(key, default.as_secs()).map(Duration::from_secs)
}

/// Reads a whole number of milliseconds.
///
/// # Errors
/// Returns [`CoreError::InvalidConfig`] on a non-numeric value.
pub fn millis_or(key: &str, default: Duration) -> Result<Duration, CoreError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(key, default_ms).map(Duration::from_millis)
}

/// Reads a string, falling back to `default`.
#[must_use]
pub fn string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Reads a filesystem path, falling back to `default`.
#[must_use]
pub fn path_or(key: &str, default: &str) -> PathBuf {
    PathBuf::from(string_or(key, default))
}

/// Parses a raw value the same way [`parse_or`] does.
///
/// # Errors
/// Returns [`CoreError::InvalidConfig`] naming `key` when parsing fails.
pub fn parse_value<T>(key: &str, raw: &str) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| CoreError::InvalidConfig {
        key: key.to_owned(),
        value: raw.to_owned(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_value_trims_whitespace() {
        let v: u32 = match parse_value("HEARTH_TEST", " 42 ") {
            Ok(v) => v,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(v, 42);
    }

    #[test]
    fn parse_value_reports_key_on_failure() {
        let err = parse_value::<u32>("HEARTH_GUARD_CAPACITY", "five");
        match err {
            Err(CoreError::InvalidConfig { key, value, .. }) => {
                assert_eq!(key, "HEARTH_GUARD_CAPACITY");
                assert_eq!(value, "five");
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn unset_variable_uses_default() {
        let d = match secs_or("HEARTH_SURELY_UNSET_VARIABLE_FOR_TESTS", Duration::from_secs(7)) {
            Ok(d) => d,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(d, Duration::from_secs(7));
    }
}
