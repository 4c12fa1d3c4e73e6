use std::time::Duration;

use hearth_core::{ErrorCategory, SessionId};

/// Errors returned by the [`SessionBroker`](crate::SessionBroker).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The user already holds the maximum number of live sessions.
    #[error("maximum concurrent console sessions ({max}) reached")]
    LimitReached { max: usize },

    /// The user started too many sessions within the reconnect window.
    #[error("too many reconnection attempts ({recent} in {window:?}), please wait")]
    ReconnectThrottled { recent: usize, window: Duration },

    #[error("console session {0} not found")]
    NotFound(SessionId),

    /// The system random source failed.
    #[error("failed to generate session id: {0}")]
    IdGeneration(String),
}

impl SessionError {
    /// Category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::LimitReached { .. } => ErrorCategory::Conflict,
            Self::ReconnectThrottled { .. } => ErrorCategory::Overload,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::IdGeneration(_) => ErrorCategory::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_throttling_is_retryable() {
        let throttled =
            SessionError::ReconnectThrottled { recent: 3, window: Duration::from_secs(30) };
        assert!(throttled.category().is_retryable());
        assert!(!SessionError::LimitReached { max: 2 }.category().is_retryable());
        assert_eq!(
            SessionError::NotFound(SessionId::from("abc".to_owned())).to_string(),
            "console session abc not found"
        );
    }
}
