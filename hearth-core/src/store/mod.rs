//! Persistence abstraction for VM, snapshot, image and session-mirror rows.
//!
//! Storage mechanics live behind [`Store`]; the control plane only relies on
//! the operations below. [`MemoryStore`] is the bundled implementation.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ErrorCategory;
use crate::id::{SessionId, SnapshotId, UserId, VmId};
use crate::session::ConsoleSessionRecord;
use crate::snapshot::{NewSnapshot, SnapshotRecord};
use crate::vm::{NewOsImage, NewVm, OsImage, VmRecord};

pub use memory::MemoryStore;

/// Errors reported by a [`Store`] implementation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A uniqueness constraint was violated.
    #[error("{entity} '{key}' already exists")]
    Duplicate { entity: &'static str, key: String },

    /// An update or delete targeted a row that does not exist.
    #[error("{entity} {key} not found")]
    Missing { entity: &'static str, key: String },

    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Duplicate { .. } => ErrorCategory::Conflict,
            Self::Missing { .. } => ErrorCategory::NotFound,
            Self::Backend(_) => ErrorCategory::Internal,
        }
    }
}

/// Persisted-record store used by the orchestrator and the session broker.
///
/// Implementations must be safe for concurrent use; callers add no locking.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a VM record and returns it with its assigned id.
    ///
    /// # Errors
    /// Returns [`StoreError::Duplicate`] if the name is already taken.
    async fn insert_vm(&self, vm: NewVm) -> Result<VmRecord, StoreError>;

    /// Fetches a VM record by id.
    async fn vm(&self, id: VmId) -> Result<Option<VmRecord>, StoreError>;

    /// Fetches a VM record by name.
    async fn vm_by_name(&self, name: &str) -> Result<Option<VmRecord>, StoreError>;

    /// Lists every VM record ordered by id.
    async fn list_vms(&self) -> Result<Vec<VmRecord>, StoreError>;

    /// Replaces the stored record with `vm`, refreshing `updated_at`.
    ///
    /// # Errors
    /// Returns [`StoreError::Missing`] if no record has `vm.id`.
    async fn update_vm(&self, vm: &VmRecord) -> Result<(), StoreError>;

    /// Hard-deletes a VM record. Returns `true` if a row was removed.
    async fn delete_vm(&self, id: VmId) -> Result<bool, StoreError>;

    /// Registers installation media for an OS type.
    async fn insert_image(&self, image: NewOsImage) -> Result<OsImage, StoreError>;

    /// Returns the first catalog entry registered for `os_type`.
    async fn image_for_os(&self, os_type: &str) -> Result<Option<OsImage>, StoreError>;

    /// Inserts a snapshot record.
    async fn insert_snapshot(&self, snapshot: NewSnapshot) -> Result<SnapshotRecord, StoreError>;

    /// Fetches a snapshot record by id.
    async fn snapshot(&self, id: SnapshotId) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Lists the snapshots of one VM ordered by id.
    async fn snapshots_for_vm(&self, vm_id: VmId) -> Result<Vec<SnapshotRecord>, StoreError>;

    /// Lists every snapshot record ordered by id.
    async fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>, StoreError>;

    /// Deletes a snapshot record. Returns `true` if a row was removed.
    async fn delete_snapshot(&self, id: SnapshotId) -> Result<bool, StoreError>;

    /// Deletes every snapshot record of a VM, returning how many were removed.
    async fn delete_snapshots_for_vm(&self, vm_id: VmId) -> Result<usize, StoreError>;

    /// Inserts a session mirror row.
    async fn insert_session(&self, session: ConsoleSessionRecord) -> Result<(), StoreError>;

    /// Updates the last-activity timestamp of a mirror row.
    async fn touch_session(&self, id: &SessionId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Records the end time and reason of a mirror row.
    async fn end_session(
        &self,
        id: &SessionId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StoreError>;

    /// Mirror rows of `user` whose start time is strictly after `since`.
    async fn sessions_started_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConsoleSessionRecord>, StoreError>;

    /// Deletes every mirror row of a VM, returning how many were removed.
    async fn delete_sessions_for_vm(&self, vm_id: VmId) -> Result<usize, StoreError>;
}
