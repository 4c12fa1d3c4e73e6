//! Live session entries and session id minting.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hearth_core::{ConsoleSessionRecord, EndReason, SessionId, UserId, VmId};
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::SessionError;

/// Bytes of entropy in a session id.
pub const SESSION_ID_BYTES: usize = 32;

/// Mints a session id from [`SESSION_ID_BYTES`] random bytes, URL-safe
/// base64 encoded with padding.
///
/// # Errors
/// [`SessionError::IdGeneration`] if the OS random source fails.
pub fn generate_session_id() -> Result<SessionId, SessionError> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    getrandom::getrandom(&mut bytes).map_err(|e| SessionError::IdGeneration(e.to_string()))?;
    Ok(SessionId::from(URL_SAFE.encode(bytes)))
}

/// Read-only view of a live console session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub vm_id: VmId,
    pub vm_uuid: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub client_ip: String,
    pub client_agent: String,
}

impl ActiveSession {
    /// The mirror row written when the session is admitted.
    #[must_use]
    pub fn to_record(&self) -> ConsoleSessionRecord {
        ConsoleSessionRecord {
            session_id: self.session_id.clone(),
            user_id: self.user_id,
            vm_id: self.vm_id,
            vm_uuid: self.vm_uuid,
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
            client_ip: self.client_ip.clone(),
            client_agent: self.client_agent.clone(),
            ended_at: None,
            end_reason: None,
        }
    }
}

/// Registry entry: the public view plus monotonic clocks and the liveness
/// handle, which never leaves the broker.
#[derive(Debug)]
pub(crate) struct SessionEntry {
    pub(crate) info: ActiveSession,
    pub(crate) started: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) liveness: CancellationToken,
}

impl SessionEntry {
    pub(crate) fn new(info: ActiveSession) -> Self {
        let now = Instant::now();
        Self { info, started: now, last_activity: now, liveness: CancellationToken::new() }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.info.last_activity_at = Utc::now();
    }

    /// Why the session has expired at `now`, if it has. The duration limit
    /// takes precedence over the idle limit.
    pub(crate) fn expiry(
        &self,
        now: Instant,
        idle_timeout: Duration,
        max_duration: Duration,
    ) -> Option<EndReason> {
        if now.saturating_duration_since(self.started) >= max_duration {
            Some(EndReason::MaxDuration)
        } else if now.saturating_duration_since(self.last_activity) >= idle_timeout {
            Some(EndReason::IdleTimeout)
        } else {
            None
        }
    }
}
