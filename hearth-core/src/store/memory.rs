use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Store, StoreError};
use crate::id::{ImageId, SessionId, SnapshotId, UserId, VmId};
use crate::session::ConsoleSessionRecord;
use crate::snapshot::{NewSnapshot, SnapshotRecord};
use crate::vm::{NewOsImage, NewVm, OsImage, VmRecord};

#[derive(Debug, Default)]
struct Tables {
    next_vm: u64,
    next_image: u64,
    next_snapshot: u64,
    vms: BTreeMap<VmId, VmRecord>,
    images: BTreeMap<ImageId, OsImage>,
    snapshots: BTreeMap<SnapshotId, SnapshotRecord>,
    sessions: BTreeMap<SessionId, ConsoleSessionRecord>,
}

/// In-process [`Store`] backed by ordered maps.
///
/// Ids are assigned sequentially from 1. Used by the daemon when no external
/// store is wired in, and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of every session mirror row, ended or not.
    pub async fn session_rows(&self) -> Vec<ConsoleSessionRecord> {
        self.tables.read().await.sessions.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_vm(&self, vm: NewVm) -> Result<VmRecord, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.vms.values().any(|existing| existing.name == vm.name) {
            return Err(StoreError::Duplicate { entity: "vm", key: vm.name });
        }
        tables.next_vm += 1;
        let now = Utc::now();
        let record = VmRecord {
            id: VmId(tables.next_vm),
            name: vm.name,
            uuid: vm.uuid,
            cpu: vm.cpu,
            memory_mib: vm.memory_mib,
            os_type: vm.os_type,
            status: vm.status,
            owner: vm.owner,
            created_at: now,
            updated_at: now,
        };
        tables.vms.insert(record.id, record.clone());
        Ok(record)
    }

    async fn vm(&self, id: VmId) -> Result<Option<VmRecord>, StoreError> {
        Ok(self.tables.read().await.vms.get(&id).cloned())
    }

    async fn vm_by_name(&self, name: &str) -> Result<Option<VmRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .vms
            .values()
            .find(|vm| vm.name == name)
            .cloned())
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>, StoreError> {
        Ok(self.tables.read().await.vms.values().cloned().collect())
    }

    async fn update_vm(&self, vm: &VmRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let Some(slot) = tables.vms.get_mut(&vm.id) else {
            return Err(StoreError::Missing { entity: "vm", key: vm.id.to_string() });
        };
        *slot = vm.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_vm(&self, id: VmId) -> Result<bool, StoreError> {
        Ok(self.tables.write().await.vms.remove(&id).is_some())
    }

    async fn insert_image(&self, image: NewOsImage) -> Result<OsImage, StoreError> {
        let mut tables = self.tables.write().await;
        tables.next_image += 1;
        let record = OsImage {
            id: ImageId(tables.next_image),
            name: image.name,
            os_type: image.os_type,
            path: image.path,
            is_iso: image.is_iso,
            description: image.description,
        };
        tables.images.insert(record.id, record.clone());
        Ok(record)
    }

    async fn image_for_os(&self, os_type: &str) -> Result<Option<OsImage>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .images
            .values()
            .find(|image| image.os_type == os_type)
            .cloned())
    }

    async fn insert_snapshot(&self, snapshot: NewSnapshot) -> Result<SnapshotRecord, StoreError> {
        let mut tables = self.tables.write().await;
        tables.next_snapshot += 1;
        let record = SnapshotRecord {
            id: SnapshotId(tables.next_snapshot),
            vm_id: snapshot.vm_id,
            name: snapshot.name,
            description: snapshot.description,
            internal_name: snapshot.internal_name,
            created_at: Utc::now(),
        };
        tables.snapshots.insert(record.id, record.clone());
        Ok(record)
    }

    async fn snapshot(&self, id: SnapshotId) -> Result<Option<SnapshotRecord>, StoreError> {
        Ok(self.tables.read().await.snapshots.get(&id).cloned())
    }

    async fn snapshots_for_vm(&self, vm_id: VmId) -> Result<Vec<SnapshotRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .snapshots
            .values()
            .filter(|snap| snap.vm_id == vm_id)
            .cloned()
            .collect())
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>, StoreError> {
        Ok(self.tables.read().await.snapshots.values().cloned().collect())
    }

    async fn delete_snapshot(&self, id: SnapshotId) -> Result<bool, StoreError> {
        Ok(self.tables.write().await.snapshots.remove(&id).is_some())
    }

    async fn delete_snapshots_for_vm(&self, vm_id: VmId) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.snapshots.len();
        tables.snapshots.retain(|_, snap| snap.vm_id != vm_id);
        Ok(before - tables.snapshots.len())
    }

    async fn insert_session(&self, session: ConsoleSessionRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Duplicate {
                entity: "console session",
                key: session.session_id.to_string(),
            });
        }
        tables.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn touch_session(&self, id: &SessionId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let Some(row) = tables.sessions.get_mut(id) else {
            return Err(StoreError::Missing { entity: "console session", key: id.to_string() });
        };
        row.last_activity_at = at;
        Ok(())
    }

    async fn end_session(
        &self,
        id: &SessionId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let Some(row) = tables.sessions.get_mut(id) else {
            return Err(StoreError::Missing { entity: "console session", key: id.to_string() });
        };
        row.ended_at = Some(at);
        row.end_reason = Some(reason.to_owned());
        Ok(())
    }

    async fn sessions_started_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConsoleSessionRecord>, StoreError> {
        let mut rows: Vec<_> = self
            .tables
            .read()
            .await
            .sessions
            .values()
            .filter(|row| row.user_id == user && row.started_at > since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(rows)
    }

    async fn delete_sessions_for_vm(&self, vm_id: VmId) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.sessions.len();
        tables.sessions.retain(|_, row| row.vm_id != vm_id);
        Ok(before - tables.sessions.len())
    }
}
