//! Structured audit events and the sinks that receive them.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditAction {
    VmCreated,
    VmStarted,
    VmStopped,
    VmUpdated,
    VmDeleted,
    MediaAttached,
    MediaDetached,
    BootOrderChanged,
    InstallFinalized,
    SnapshotCreated,
    SnapshotRestored,
    SnapshotDeleted,
    SessionCreated,
    SessionEnded,
    SessionReaped,
}

/// Kind of resource an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ResourceKind {
    Vm,
    Snapshot,
    ConsoleSession,
}

/// Result of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// One structured audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub resource: ResourceKind,
    pub resource_id: String,
    pub outcome: Outcome,
    /// Acting or owning user, when known.
    pub actor: Option<UserId>,
    /// Free-form detail: an error message or an end reason.
    pub detail: Option<String>,
}

impl AuditEvent {
    /// A successful event with no actor or detail.
    pub fn success(
        action: AuditAction,
        resource: ResourceKind,
        resource_id: impl fmt::Display,
    ) -> Self {
        Self {
            action,
            resource,
            resource_id: resource_id.to_string(),
            outcome: Outcome::Success,
            actor: None,
            detail: None,
        }
    }

    /// A failed event carrying the error message as detail.
    pub fn failure(
        action: AuditAction,
        resource: ResourceKind,
        resource_id: impl fmt::Display,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            action,
            resource,
            resource_id: resource_id.to_string(),
            outcome: Outcome::Failure,
            actor: None,
            detail: Some(error.to_string()),
        }
    }

    /// Attaches the acting user.
    #[must_use]
    pub fn with_actor(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Attaches a detail string.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receiver of audit events. Recording must not fail or block for long.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits every event as a `tracing` event on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match event.outcome {
            Outcome::Success => tracing::info!(target: "audit", event = %payload, "audit"),
            Outcome::Failure => tracing::warn!(target: "audit", event = %payload, "audit"),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event recorded so far.
    ///
    /// # Panics
    /// Panics if the internal `Mutex` is poisoned.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let events = self.events.lock().expect("audit sink lock poisoned");
        events.clone()
    }

    /// Events recorded for `action`.
    #[must_use]
    pub fn events_for(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|e| e.action == action).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.events.lock().expect("audit sink lock poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_event_serializes_snake_case_fields() {
        let event = AuditEvent::success(AuditAction::VmCreated, ResourceKind::Vm, "alpha")
            .with_actor(UserId(7));
        let json = match serde_json::to_string(&event) {
            Ok(s) => s,
            Err(e) => panic!("serialization failed: {e}"),
        };
        assert!(json.contains("\"action\":\"vm_created\""), "got {json}");
        assert!(json.contains("\"outcome\":\"success\""), "got {json}");
        assert!(json.contains("\"resource_id\":\"alpha\""), "got {json}");
    }

    #[test]
    fn memory_sink_filters_by_action() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::success(AuditAction::VmStarted, ResourceKind::Vm, "a"));
        sink.record(AuditEvent::failure(AuditAction::VmStopped, ResourceKind::Vm, "a", "boom"));
        let stopped = sink.events_for(AuditAction::VmStopped);
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].outcome, Outcome::Failure);
        assert_eq!(stopped[0].detail.as_deref(), Some("boom"));
    }
}
