//! Snapshot management.
//!
//! A snapshot exists in two places: the hypervisor (an external disk-only
//! snapshot named `<vm id>-<unix millis>-<8 hex chars>`) and the store (a
//! [`SnapshotRecord`] carrying the display name). Creation writes the
//! hypervisor side first and undoes it if the record cannot be written;
//! deletion removes the hypervisor side best-effort and the record always.

use chrono::Utc;
use hearth_core::{
    AuditAction, NewSnapshot, ResourceKind, SnapshotId, SnapshotRecord, SnapshotWithVm, VmId,
    VmRecord, VmStatus,
};
use uuid::Uuid;

use crate::backend::{RevertFlags, SnapshotCreateFlags, SnapshotDeleteFlags};
use crate::cleanup::CleanupReport;
use crate::{descriptor, Orchestrator, OrchestratorError};

/// Hypervisor-side snapshot name. The random suffix keeps names taken in
/// the same millisecond apart.
fn internal_snapshot_name(vm_id: VmId) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{vm_id}-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

impl Orchestrator {
    /// Takes a disk-only snapshot of a VM.
    ///
    /// # Errors
    /// - [`OrchestratorError::VmNotFound`] if no record has `vm_id`.
    /// - Hypervisor and guard errors from creating the snapshot.
    /// - [`OrchestratorError::Store`] if the record cannot be written; the
    ///   hypervisor snapshot has been deleted again by then.
    pub async fn create_snapshot(
        &self,
        vm_id: VmId,
        name: &str,
        description: &str,
    ) -> Result<SnapshotRecord, OrchestratorError> {
        let vm = self.get_vm_by_id(vm_id).await?;
        let internal_name = internal_snapshot_name(vm_id);
        let overlay = self.config.vm_dir.join(format!("{}-{internal_name}.qcow2", vm.name));
        let xml = descriptor::snapshot_xml(&internal_name, description, &overlay);
        let new = NewSnapshot::new(vm_id, name, description, internal_name);
        let vm_name = vm.name.clone();

        let result = self
            .guarded("create_snapshot", move |this| async move {
                let domain = this.hypervisor.lookup_domain(&vm_name).await?;
                let snapshot = domain
                    .create_snapshot(&xml, SnapshotCreateFlags::ATOMIC_DISK_ONLY)
                    .await?;
                tracing::info!(
                    vm_name = %vm_name,
                    snapshot = %snapshot.name(),
                    "hypervisor snapshot created"
                );

                match this.store.insert_snapshot(new).await {
                    Ok(record) => Ok(record),
                    Err(store_err) => {
                        tracing::error!(
                            vm_name = %vm_name,
                            snapshot = %snapshot.name(),
                            error = %store_err,
                            "failed to persist snapshot record, deleting hypervisor snapshot"
                        );
                        if let Err(e) = snapshot.delete(SnapshotDeleteFlags::CHILDREN).await {
                            tracing::error!(
                                vm_name = %vm_name,
                                snapshot = %snapshot.name(),
                                error = %e,
                                "failed to delete hypervisor snapshot after persistence failure"
                            );
                        }
                        Err(store_err.into())
                    }
                }
            })
            .await;

        self.record_audit(
            AuditAction::SnapshotCreated,
            ResourceKind::Snapshot,
            name,
            Some(vm.owner),
            &result,
        );
        result
    }

    /// Reverts a VM to a snapshot.
    ///
    /// A running VM is shut down first (gracefully, falling back to a forced
    /// stop) and polled until inactive. The snapshot is reverted with
    /// `running` and `force`, and the record is marked `Stopped` either way;
    /// the next reconciliation pass corrects it.
    ///
    /// # Errors
    /// - [`OrchestratorError::SnapshotNotFound`] or
    ///   [`OrchestratorError::VmNotFound`] for missing records.
    /// - Hypervisor and guard errors from stopping or reverting.
    pub async fn restore_snapshot(&self, snapshot_id: SnapshotId) -> Result<(), OrchestratorError> {
        let snapshot = self.get_snapshot(snapshot_id).await?;
        let vm = self.get_vm_by_id(snapshot.vm_id).await?;

        let result = self.revert_to(&vm, &snapshot).await;

        self.set_persisted_status(&vm.name, VmStatus::Stopped).await;
        if result.is_ok() {
            tracing::info!(
                vm_name = %vm.name,
                snapshot = %snapshot.internal_name,
                "snapshot restored"
            );
        }
        self.record_audit(
            AuditAction::SnapshotRestored,
            ResourceKind::Snapshot,
            snapshot_id,
            Some(vm.owner),
            &result,
        );
        result
    }

    async fn revert_to(
        &self,
        vm: &VmRecord,
        snapshot: &SnapshotRecord,
    ) -> Result<(), OrchestratorError> {
        self.stop_and_wait(&vm.name, "restore_snapshot").await?;

        let name = vm.name.clone();
        let internal_name = snapshot.internal_name.clone();
        self.guarded("restore_snapshot", move |this| async move {
            let domain = this.hypervisor.lookup_domain(&name).await?;
            let snapshot = domain.lookup_snapshot(&internal_name).await?;
            snapshot.revert(RevertFlags::RUNNING_FORCE).await?;
            Ok(())
        })
        .await
    }

    /// Shuts an active domain down, gracefully with a forced fallback, and
    /// polls until it is inactive. Returns whether the domain was running.
    pub(crate) async fn stop_and_wait(
        &self,
        name: &str,
        operation: &'static str,
    ) -> Result<bool, OrchestratorError> {
        let target = name.to_owned();
        let was_active = self
            .guarded(operation, move |this| async move {
                let domain = this.hypervisor.lookup_domain(&target).await?;
                if !domain.is_active().await? {
                    return Ok(false);
                }
                if let Err(e) = domain.graceful_stop().await {
                    tracing::warn!(
                        vm_name = %target,
                        error = %e,
                        "graceful shutdown failed, forcing stop"
                    );
                    domain.force_stop().await?;
                }
                Ok(true)
            })
            .await?;

        if was_active {
            self.wait_until_inactive(name, operation).await?;
        }
        Ok(was_active)
    }

    /// Polls until the domain is inactive or the attempts run out. Running
    /// out is logged and the caller proceeds.
    async fn wait_until_inactive(
        &self,
        name: &str,
        operation: &'static str,
    ) -> Result<(), OrchestratorError> {
        let attempts = self.config.restore_poll_attempts;
        let interval = self.config.restore_poll_interval;
        for attempt in 1..=attempts {
            let target = name.to_owned();
            let active = self
                .guarded(operation, move |this| async move {
                    let domain = this.hypervisor.lookup_domain(&target).await?;
                    Ok(domain.is_active().await?)
                })
                .await?;
            if !active {
                tracing::debug!(vm_name = %name, attempt, "domain stopped");
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
        tracing::warn!(vm_name = %name, attempts, operation, "domain still active after shutdown");
        Ok(())
    }

    /// Deletes a snapshot. Hypervisor-side failures are tolerated.
    ///
    /// # Errors
    /// [`OrchestratorError::SnapshotNotFound`] or store failures.
    pub async fn delete_snapshot(&self, snapshot_id: SnapshotId) -> Result<(), OrchestratorError> {
        self.delete_snapshot_report(snapshot_id).await.map(drop)
    }

    /// Same as [`delete_snapshot`](Self::delete_snapshot) but returns the
    /// cleanup warnings.
    ///
    /// # Errors
    /// [`OrchestratorError::SnapshotNotFound`] or store failures.
    pub async fn delete_snapshot_report(
        &self,
        snapshot_id: SnapshotId,
    ) -> Result<CleanupReport, OrchestratorError> {
        let snapshot = self.get_snapshot(snapshot_id).await?;
        let mut report = CleanupReport::new(&snapshot.internal_name);
        let vm = self.store.vm(snapshot.vm_id).await?;

        match &vm {
            Some(vm) => {
                let name = vm.name.clone();
                let internal_name = snapshot.internal_name.clone();
                let removed = self
                    .guarded("delete_snapshot", move |this| async move {
                        let domain = this.hypervisor.lookup_domain(&name).await?;
                        let handle = domain.lookup_snapshot(&internal_name).await?;
                        handle.delete(SnapshotDeleteFlags::CHILDREN_METADATA_ONLY).await?;
                        Ok(())
                    })
                    .await;
                if let Err(e) = removed {
                    report.warn("delete_hypervisor_snapshot", e);
                }
            }
            None => report.warn("lookup_vm", format!("vm {} no longer exists", snapshot.vm_id)),
        }

        self.store.delete_snapshot(snapshot_id).await?;
        tracing::info!(
            snapshot_id = %snapshot_id,
            snapshot = %snapshot.internal_name,
            "snapshot record deleted"
        );

        let result: Result<(), OrchestratorError> = Ok(());
        self.record_audit(
            AuditAction::SnapshotDeleted,
            ResourceKind::Snapshot,
            snapshot_id,
            vm.map(|v| v.owner),
            &result,
        );
        Ok(report)
    }

    /// Snapshots of one VM, oldest first.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn list_snapshots(
        &self,
        vm_id: VmId,
    ) -> Result<Vec<SnapshotRecord>, OrchestratorError> {
        Ok(self.store.snapshots_for_vm(vm_id).await?)
    }

    /// Every snapshot with its owning VM attached.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn list_all_snapshots(&self) -> Result<Vec<SnapshotWithVm>, OrchestratorError> {
        let snapshots = self.store.list_snapshots().await?;
        let vms = self.store.list_vms().await?;
        Ok(snapshots
            .into_iter()
            .map(|snapshot| {
                let vm = vms.iter().find(|vm| vm.id == snapshot.vm_id).cloned();
                SnapshotWithVm { snapshot, vm }
            })
            .collect())
    }

    /// # Errors
    /// [`OrchestratorError::SnapshotNotFound`] if no record has `id`.
    pub async fn get_snapshot(&self, id: SnapshotId) -> Result<SnapshotRecord, OrchestratorError> {
        self.store.snapshot(id).await?.ok_or(OrchestratorError::SnapshotNotFound(id))
    }
}
