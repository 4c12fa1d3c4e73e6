//! Reconciliation of persisted VM status with live hypervisor state.

use hearth_core::{VmRecord, VmStatus};
use serde::Serialize;

use crate::{Orchestrator, OrchestratorError};

/// Outcome counts of one [`Orchestrator::reconcile_all`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

impl Orchestrator {
    /// Observes the live status of the named domain without writing
    /// anything. A domain the hypervisor does not know is `Stopped`.
    ///
    /// # Errors
    /// Hypervisor errors other than not-found, and guard errors.
    pub async fn query_live_status(&self, name: &str) -> Result<VmStatus, OrchestratorError> {
        let target = name.to_owned();
        self.guarded("query_live_status", move |this| async move {
            match this.hypervisor.lookup_domain(&target).await {
                Ok(domain) => Ok(VmStatus::from_active(domain.is_active().await?)),
                Err(e) if e.is_not_found() => Ok(VmStatus::Stopped),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Brings `record.status` in line with the hypervisor and persists it
    /// when it changed. Returns whether a write happened.
    ///
    /// # Errors
    /// Hypervisor, guard and store errors. `record` is left untouched on
    /// error.
    pub async fn reconcile_one(&self, record: &mut VmRecord) -> Result<bool, OrchestratorError> {
        let observed = self.query_live_status(&record.name).await?;
        if record.status == observed {
            return Ok(false);
        }
        let previous = record.status;
        let mut updated = record.clone();
        updated.status = observed;
        self.store.update_vm(&updated).await?;
        *record = updated;
        tracing::info!(
            vm_name = %record.name,
            from = %previous,
            to = %observed,
            "vm status reconciled"
        );
        Ok(true)
    }

    /// Reconciles every persisted VM, one after another. A failing record is
    /// logged and counted; the sweep continues.
    ///
    /// # Errors
    /// Only if the record list cannot be loaded.
    pub async fn reconcile_all(&self) -> Result<SweepReport, OrchestratorError> {
        let records = self.store.list_vms().await?;
        let mut report = SweepReport::default();
        for mut record in records {
            report.checked += 1;
            match self.reconcile_one(&mut record).await {
                Ok(true) => report.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(vm_name = %record.name, error = %e, "vm reconciliation failed");
                }
            }
        }
        tracing::debug!(
            checked = report.checked,
            updated = report.updated,
            failed = report.failed,
            "reconcile sweep done"
        );
        Ok(report)
    }

    /// Reports whether the domain of `record` exists. A missing domain heals
    /// the record to `Stopped` and is not an error.
    ///
    /// # Errors
    /// Hypervisor errors other than not-found, guard and store errors.
    pub async fn ensure_exists(&self, record: &mut VmRecord) -> Result<bool, OrchestratorError> {
        let target = record.name.clone();
        let exists = self
            .guarded("ensure_exists", move |this| async move {
                match this.hypervisor.lookup_domain(&target).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if !exists && record.status != VmStatus::Stopped {
            tracing::warn!(
                vm_name = %record.name,
                "domain missing from hypervisor, marking vm stopped"
            );
            let mut healed = record.clone();
            healed.status = VmStatus::Stopped;
            self.store.update_vm(&healed).await?;
            *record = healed;
        }
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hearth_core::{MemoryAuditSink, MemoryStore, NewOsImage, Store, UserId};

    use super::*;
    use crate::config::{BackendKind, OrchestratorConfig};
    use crate::orchestrator::CreateVmRequest;
    use crate::simulated::SimulatedHypervisor;

    async fn running_vm(name: &str) -> (tempfile::TempDir, SimulatedHypervisor, Orchestrator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig::local(BackendKind::Simulated, dir.path());
        std::fs::create_dir_all(&config.media_dir).expect("media dir");
        std::fs::write(config.media_dir.join("linux.iso"), b"iso").expect("media");
        let hv = SimulatedHypervisor::new();
        let orch = Orchestrator::new(
            Arc::new(hv.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAuditSink::new()),
            config,
        );
        orch.register_image(NewOsImage::iso("Linux", "linux", "linux.iso"))
            .await
            .expect("image");
        orch.create_vm(CreateVmRequest::new(name, 1, 512, "linux", UserId(7)))
            .await
            .expect("create");
        (dir, hv, orch)
    }

    #[tokio::test]
    async fn reconcile_one_follows_external_shutdown() {
        let (_dir, hv, orch) = running_vm("alpha").await;
        assert!(hv.set_active("alpha", false).await);

        let mut record = orch.get_vm("alpha").await.expect("get");
        assert!(orch.reconcile_one(&mut record).await.expect("reconcile"));
        assert_eq!(record.status, VmStatus::Stopped);
        assert_eq!(orch.get_vm("alpha").await.expect("get").status, VmStatus::Stopped);

        assert!(!orch.reconcile_one(&mut record).await.expect("second pass is a no-op"));
    }

    #[tokio::test]
    async fn missing_domain_reads_as_stopped() {
        let (_dir, hv, orch) = running_vm("alpha").await;
        hv.remove_domain("alpha").await;
        assert_eq!(orch.query_live_status("alpha").await.expect("query"), VmStatus::Stopped);
        assert_eq!(
            orch.get_vm("alpha").await.expect("get").status,
            VmStatus::Running,
            "query must not write"
        );
    }

    #[tokio::test]
    async fn reconcile_all_counts_failures_and_continues() {
        let (_dir, hv, orch) = running_vm("alpha").await;
        orch.create_vm(CreateVmRequest::new("beta", 1, 512, "linux", UserId(7)))
            .await
            .expect("create beta");
        hv.set_active("beta", false).await;
        let report = orch.reconcile_all().await.expect("sweep");
        assert_eq!(report, SweepReport { checked: 2, updated: 1, failed: 0 });

        hv.fail_operation("is_active", "connection reset").await;
        let report = orch.reconcile_all().await.expect("sweep");
        assert_eq!(report, SweepReport { checked: 2, updated: 0, failed: 2 });
    }

    #[tokio::test]
    async fn ensure_exists_heals_missing_domain() {
        let (_dir, hv, orch) = running_vm("alpha").await;
        let mut record = orch.get_vm("alpha").await.expect("get");
        assert!(orch.ensure_exists(&mut record).await.expect("exists"));

        hv.remove_domain("alpha").await;
        assert!(!orch.ensure_exists(&mut record).await.expect("heals"));
        assert_eq!(record.status, VmStatus::Stopped);
        let stored = orch.store().vm(record.id).await.expect("store").expect("record");
        assert_eq!(stored.status, VmStatus::Stopped);
    }
}
