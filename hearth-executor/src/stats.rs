//! Resource usage sampling of running VMs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::DomainInfo;
use crate::{Orchestrator, OrchestratorError};

/// One resource usage sample of a running VM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VmStats {
    /// Configured maximum memory.
    pub memory_total_mib: u64,
    /// Memory currently assigned to the guest.
    pub memory_used_mib: u64,
    pub memory_usage_percent: f64,
    pub vcpus: u32,
    /// Cumulative guest CPU time.
    pub cpu_time_ns: u64,
    pub sampled_at: DateTime<Utc>,
}

impl VmStats {
    #[allow(clippy::cast_precision_loss)]
    fn from_info(info: &DomainInfo, sampled_at: DateTime<Utc>) -> Self {
        let memory_usage_percent = if info.max_memory_kib == 0 {
            0.0
        } else {
            info.memory_kib as f64 / info.max_memory_kib as f64 * 100.0
        };
        Self {
            memory_total_mib: info.max_memory_kib / 1024,
            memory_used_mib: info.memory_kib / 1024,
            memory_usage_percent,
            vcpus: info.vcpus,
            cpu_time_ns: info.cpu_time_ns,
            sampled_at,
        }
    }
}

impl Orchestrator {
    /// Samples the resource usage of a running VM.
    ///
    /// # Errors
    /// - [`OrchestratorError::Conflict`] if the domain is not running.
    /// - Hypervisor and guard errors.
    pub async fn vm_stats(&self, name: &str) -> Result<VmStats, OrchestratorError> {
        let target = name.to_owned();
        self.guarded("vm_stats", move |this| async move {
            let domain = this.hypervisor.lookup_domain(&target).await?;
            let info = domain.info().await?;
            if !info.state.is_active() {
                return Err(OrchestratorError::Conflict(format!(
                    "vm '{target}' is not running"
                )));
            }
            Ok(VmStats::from_info(&info, Utc::now()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hearth_core::{MemoryAuditSink, MemoryStore, NewOsImage, UserId};

    use super::*;
    use crate::backend::{Domain, DomainState, Hypervisor, ResizeScope};
    use crate::config::{BackendKind, OrchestratorConfig};
    use crate::orchestrator::CreateVmRequest;
    use crate::simulated::SimulatedHypervisor;

    async fn running_vm() -> (tempfile::TempDir, SimulatedHypervisor, Orchestrator) {
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
        orch.create_vm(CreateVmRequest::new("alpha", 2, 2048, "linux", UserId(1)))
            .await
            .expect("create");
        (dir, hv, orch)
    }

    #[tokio::test]
    async fn stats_report_memory_share() {
        let (_dir, hv, orch) = running_vm().await;
        let domain = hv.lookup_domain("alpha").await.expect("lookup");
        domain.set_memory_kib(512 * 1024, ResizeScope::Live).await.expect("balloon");

        let stats = orch.vm_stats("alpha").await.expect("stats");
        assert_eq!(stats.memory_total_mib, 2048);
        assert_eq!(stats.memory_used_mib, 512);
        assert!((stats.memory_usage_percent - 25.0).abs() < f64::EPSILON);
        assert_eq!(stats.vcpus, 2);
        assert!(stats.cpu_time_ns > 0);
    }

    #[tokio::test]
    async fn stats_of_stopped_vm_is_a_conflict() {
        let (_dir, _hv, orch) = running_vm().await;
        orch.stop_vm("alpha").await.expect("stop");
        assert!(matches!(orch.vm_stats("alpha").await, Err(OrchestratorError::Conflict(_))));
    }

    #[test]
    fn zero_maximum_does_not_divide_by_zero() {
        let info = DomainInfo {
            state: DomainState::Running,
            max_memory_kib: 0,
            memory_kib: 0,
            vcpus: 1,
            cpu_time_ns: 0,
        };
        let stats = VmStats::from_info(&info, Utc::now());
        assert!(stats.memory_usage_percent.abs() < f64::EPSILON);
    }
}
