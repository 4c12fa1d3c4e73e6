//! Persisted mirror of console sessions.
//!
//! The mirror is written best-effort for auditing and for the reconnect
//! throttle. Admission decisions are made from the broker's in-memory state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{SessionId, UserId, VmId};

/// Why a console session ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndReason {
    /// The client closed the console.
    ClientClosed,
    /// No activity within the idle timeout.
    IdleTimeout,
    /// The session outlived the absolute duration limit.
    MaxDuration,
    /// The target VM was deleted.
    VmDeleted,
    /// Ended by an administrator or another component.
    Other(String),
}

impl EndReason {
    /// Returns the persisted string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::MaxDuration => "max_duration",
            Self::VmDeleted => "vm_deleted",
            Self::Other(reason) => reason,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the session mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSessionRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub vm_id: VmId,
    pub vm_uuid: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub client_ip: String,
    pub client_agent: String,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_reason_persisted_strings_are_stable() {
        assert_eq!(EndReason::IdleTimeout.as_str(), "idle_timeout");
        assert_eq!(EndReason::MaxDuration.as_str(), "max_duration");
        assert_eq!(EndReason::ClientClosed.to_string(), "client_closed");
        assert_eq!(EndReason::Other("admin_kick".to_owned()).as_str(), "admin_kick");
    }
}
