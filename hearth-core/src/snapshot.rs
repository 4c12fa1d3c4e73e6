//! Persisted snapshot records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{SnapshotId, VmId};
use crate::vm::VmRecord;

/// A point-in-time snapshot of a VM as recorded in the store.
///
/// The record is immutable once created; it is only ever deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub vm_id: VmId,
    /// User-facing display name.
    pub name: String,
    pub description: String,
    /// Name of the snapshot inside the hypervisor. Unique per domain.
    pub internal_name: String,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to insert a [`SnapshotRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NewSnapshot {
    pub vm_id: VmId,
    pub name: String,
    pub description: String,
    pub internal_name: String,
}

impl NewSnapshot {
    /// Creates the insert payload for a snapshot record.
    pub fn new(
        vm_id: VmId,
        name: impl Into<String>,
        description: impl Into<String>,
        internal_name: impl Into<String>,
    ) -> Self {
        Self {
            vm_id,
            name: name.into(),
            description: description.into(),
            internal_name: internal_name.into(),
        }
    }
}

/// A snapshot together with its owning VM, for administrative listings.
///
/// `vm` is `None` when the owning record no longer exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWithVm {
    pub snapshot: SnapshotRecord,
    pub vm: Option<VmRecord>,
}
