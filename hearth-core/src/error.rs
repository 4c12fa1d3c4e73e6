use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors produced by the `hearth-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A VM name cannot be used as a domain name and file prefix.
    #[error("invalid vm name '{name}': {reason}")]
    InvalidVmName { name: String, reason: String },

    /// A resource size (vCPU count, memory) is out of range.
    #[error("invalid {field}: {reason}")]
    InvalidResource { field: &'static str, reason: String },

    /// An environment variable could not be parsed.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidConfig { key: String, value: String, reason: String },
}

/// Coarse classification of every error the control plane surfaces.
///
/// The API layer maps these to retry-with-backoff or an immediate client
/// error without matching on individual error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// The named resource is absent in the hypervisor or the store.
    NotFound,
    /// The hypervisor backend is disabled or unreachable.
    Unavailable,
    /// Admission was refused because all operation slots are busy.
    Overload,
    /// An admitted operation ran past its deadline; outcome unknown.
    Timeout,
    /// A precondition does not hold (active domain, session limits, name taken).
    Conflict,
    /// The request itself is malformed.
    Invalid,
    /// Anything else: store failures, I/O, hypervisor command failures.
    Internal,
}

impl ErrorCategory {
    /// Returns `true` if the same request may succeed after a backoff.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Overload | Self::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Overload => "overload",
            Self::Timeout => "timeout",
            Self::Conflict => "conflict",
            Self::Invalid => "invalid",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl CoreError {
    /// Category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Invalid
    }
}
