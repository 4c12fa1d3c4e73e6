//! VM lifecycle orchestration on top of a [`Hypervisor`].
//!
//! The orchestrator owns the persisted VM record, the disk image and the
//! hypervisor domain of every VM, and keeps the three consistent. Every
//! hypervisor interaction goes through the shared [`OperationGuard`].
//!
//! State reconciliation lives in [`crate::sync`] and snapshot handling in
//! [`crate::snapshot`]; both are further `impl Orchestrator` blocks sharing
//! the same guard and store.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use hearth_core::{
    validate_resources, validate_vm_name, AuditAction, AuditEvent, AuditSink, NewOsImage, NewVm,
    OsImage, ResourceKind, Store, UserId, VmId, VmRecord, VmStatus,
};

use crate::backend::{Domain, DomainState, Hypervisor, ResizeScope};
use crate::cleanup::CleanupReport;
use crate::config::OrchestratorConfig;
use crate::descriptor::{self, DomainSpec, GraphicsKind};
use crate::guard::OperationGuard;
use crate::{disk, OrchestratorError};

/// Parameters of [`Orchestrator::create_vm`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct CreateVmRequest {
    pub name: String,
    pub cpu: u32,
    pub memory_mib: u32,
    /// Catalog key used to pick the installation media.
    pub os_type: String,
    pub owner: UserId,
    pub graphics: GraphicsKind,
}

impl CreateVmRequest {
    /// A request with VNC graphics.
    pub fn new(
        name: impl Into<String>,
        cpu: u32,
        memory_mib: u32,
        os_type: impl Into<String>,
        owner: UserId,
    ) -> Self {
        Self {
            name: name.into(),
            cpu,
            memory_mib,
            os_type: os_type.into(),
            owner,
            graphics: GraphicsKind::default(),
        }
    }

    #[must_use]
    pub fn with_graphics(mut self, graphics: GraphicsKind) -> Self {
        self.graphics = graphics;
        self
    }
}

/// Lifecycle manager for the VMs of one host.
///
/// Cheap to clone; clones share the hypervisor handle, store, audit sink
/// and guard slots.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) hypervisor: Arc<dyn Hypervisor>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) guard: OperationGuard,
    pub(crate) config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    /// Creates an orchestrator whose guard is sized from `config.guard`.
    #[must_use]
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let guard = OperationGuard::from_config(&config.guard);
        Self { hypervisor, store, audit, guard, config: Arc::new(config) }
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn guard(&self) -> &OperationGuard {
        &self.guard
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Name of the hypervisor backend in use.
    #[must_use]
    pub fn backend_kind(&self) -> &'static str {
        self.hypervisor.kind()
    }

    /// Runs `f` on a clone of `self` under the guard.
    pub(crate) async fn guarded<T, F, Fut>(
        &self,
        operation: &'static str,
        f: F,
    ) -> Result<T, OrchestratorError>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
    {
        self.guard.run(operation, f(self.clone())).await
    }

    pub(crate) fn record_audit<T>(
        &self,
        action: AuditAction,
        resource: ResourceKind,
        resource_id: impl fmt::Display,
        actor: Option<UserId>,
        result: &Result<T, OrchestratorError>,
    ) {
        let event = match result {
            Ok(_) => AuditEvent::success(action, resource, resource_id),
            Err(e) => AuditEvent::failure(action, resource, resource_id, e),
        };
        let event = match actor {
            Some(actor) => event.with_actor(actor),
            None => event,
        };
        self.audit.record(event);
    }

    /// Reports whether the hypervisor connection is usable.
    pub async fn is_alive(&self) -> bool {
        self.guarded("is_alive", |this| async move { Ok(this.hypervisor.is_alive().await) })
            .await
            .unwrap_or(false)
    }

    /// Registers installation media for an OS type.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn register_image(&self, image: NewOsImage) -> Result<OsImage, OrchestratorError> {
        Ok(self.store.insert_image(image).await?)
    }

    /// Provisions a new VM and boots it from its installation media.
    ///
    /// The record is inserted as `Creating` before the hypervisor is touched
    /// and ends up `Running` or `Error`. A disk image allocated before a
    /// failure is left in place.
    ///
    /// # Errors
    /// - [`OrchestratorError::InvalidRequest`] for a bad name or sizes.
    /// - [`OrchestratorError::Conflict`] if a `Running` or `Creating` record
    ///   already uses the name. A record in any other state is replaced
    ///   along with its snapshot and session rows.
    /// - [`OrchestratorError::ImageNotFound`] / [`OrchestratorError::MediaMissing`]
    ///   when the installation media cannot be resolved.
    /// - Guard, disk and hypervisor errors from provisioning.
    pub async fn create_vm(&self, request: CreateVmRequest) -> Result<VmRecord, OrchestratorError> {
        validate_vm_name(&request.name)?;
        validate_resources(request.cpu, request.memory_mib)?;

        if let Some(existing) = self.store.vm_by_name(&request.name).await? {
            if matches!(existing.status, VmStatus::Running | VmStatus::Creating) {
                return Err(OrchestratorError::Conflict(format!(
                    "vm '{}' already exists",
                    request.name
                )));
            }
            self.retire_record(&existing).await?;
        }

        let mut record = self
            .store
            .insert_vm(NewVm::creating(
                request.name.clone(),
                request.cpu,
                request.memory_mib,
                request.os_type.clone(),
                request.owner,
            ))
            .await?;
        tracing::info!(
            vm_name = %record.name,
            vm_id = %record.id,
            "vm record created, provisioning"
        );

        let provision_record = record.clone();
        let graphics = request.graphics;
        let result = self
            .guarded("create_vm", move |this| async move {
                this.provision(&provision_record, graphics).await
            })
            .await;

        let outcome = match result {
            Ok(()) => {
                record.status = VmStatus::Running;
                self.store.update_vm(&record).await?;
                tracing::info!(vm_name = %record.name, "vm created and running");
                Ok(record)
            }
            Err(e) => {
                tracing::error!(vm_name = %record.name, error = %e, "vm provisioning failed");
                record.status = VmStatus::Error;
                if let Err(store_err) = self.store.update_vm(&record).await {
                    tracing::warn!(
                        vm_name = %record.name,
                        error = %store_err,
                        "failed to mark vm as errored"
                    );
                }
                Err(e)
            }
        };
        self.record_audit(
            AuditAction::VmCreated,
            ResourceKind::Vm,
            &request.name,
            Some(request.owner),
            &outcome,
        );
        outcome
    }

    /// Removes a stale record and the rows that reference it so its name can
    /// be reused. The domain and disk are replaced later by provisioning.
    async fn retire_record(&self, record: &VmRecord) -> Result<(), OrchestratorError> {
        let snapshots = self.store.delete_snapshots_for_vm(record.id).await?;
        let sessions = self.store.delete_sessions_for_vm(record.id).await?;
        self.store.delete_vm(record.id).await?;
        tracing::info!(
            vm_name = %record.name,
            vm_id = %record.id,
            status = %record.status,
            snapshots,
            sessions,
            "stale vm record replaced"
        );
        Ok(())
    }

    /// Hypervisor half of create: replace any same-named domain, allocate
    /// the disk, resolve media, define and start.
    async fn provision(
        &self,
        record: &VmRecord,
        graphics: GraphicsKind,
    ) -> Result<(), OrchestratorError> {
        self.replace_existing_domain(&record.name).await?;

        let disk_path = self.config.disk_path(&record.name);
        disk::allocate(&disk_path, self.config.disk_format, self.config.disk_size_gib).await?;

        let image = self
            .store
            .image_for_os(&record.os_type)
            .await?
            .ok_or_else(|| OrchestratorError::ImageNotFound { os_type: record.os_type.clone() })?;
        let media_path = disk::resolve_media(&self.config.media_dir, &image.path).await?;

        let xml = descriptor::domain_xml(&DomainSpec {
            name: record.name.clone(),
            uuid: record.uuid,
            vcpus: record.cpu,
            memory_mib: record.memory_mib,
            disk_path,
            disk_format: self.config.disk_format,
            media_path,
            network: self.config.network.clone(),
            graphics,
        });

        let domain = self.hypervisor.define_domain(&xml).await?;
        start_and_verify(domain.as_ref()).await
    }

    /// Stops and undefines a leftover domain with the same name, if any.
    async fn replace_existing_domain(&self, name: &str) -> Result<(), OrchestratorError> {
        let domain = match self.hypervisor.lookup_domain(name).await {
            Ok(domain) => domain,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(vm_name = %name, "replacing existing domain with the same name");
        if matches!(domain.is_active().await, Ok(true)) {
            if let Err(e) = domain.force_stop().await {
                tracing::warn!(vm_name = %name, error = %e, "failed to stop existing domain");
            }
        }
        if let Err(e) = domain.undefine().await {
            tracing::warn!(vm_name = %name, error = %e, "failed to undefine existing domain");
        }
        Ok(())
    }

    /// Starts a stopped VM. Starting a running VM is a no-op.
    ///
    /// # Errors
    /// - The hypervisor lookup error, unchanged, if the domain is unknown.
    /// - [`OrchestratorError::StartFailed`] if the domain stops right after
    ///   starting.
    /// - Guard errors.
    pub async fn start_vm(&self, name: &str) -> Result<(), OrchestratorError> {
        let target = name.to_owned();
        let result = self
            .guarded("start_vm", move |this| async move {
                let domain = this.hypervisor.lookup_domain(&target).await?;
                if domain.is_active().await? {
                    tracing::info!(vm_name = %target, "vm already running");
                    return Ok(());
                }
                start_and_verify(domain.as_ref()).await
            })
            .await;

        if result.is_ok() {
            self.set_persisted_status(name, VmStatus::Running).await;
        }
        let owner = self.owner_of(name).await;
        self.record_audit(AuditAction::VmStarted, ResourceKind::Vm, name, owner, &result);
        result
    }

    /// Powers a VM off immediately.
    ///
    /// # Errors
    /// The hypervisor lookup or stop error, or a guard error.
    pub async fn stop_vm(&self, name: &str) -> Result<(), OrchestratorError> {
        let target = name.to_owned();
        let result = self
            .guarded("stop_vm", move |this| async move {
                let domain = this.hypervisor.lookup_domain(&target).await?;
                domain.force_stop().await?;
                Ok(())
            })
            .await;

        if result.is_ok() {
            self.set_persisted_status(name, VmStatus::Stopped).await;
        }
        let owner = self.owner_of(name).await;
        self.record_audit(AuditAction::VmStopped, ResourceKind::Vm, name, owner, &result);
        result
    }

    /// Deletes a VM. Hypervisor and file cleanup failures are tolerated.
    ///
    /// # Errors
    /// Only store failures while reading or removing the record.
    pub async fn delete_vm(&self, name: &str) -> Result<(), OrchestratorError> {
        self.delete_vm_report(name).await.map(drop)
    }

    /// Same as [`delete_vm`](Self::delete_vm) but returns the cleanup
    /// warnings.
    ///
    /// Marks the record `Deleting`, tears down the domain, removes the disk
    /// and every file in the VM directory starting with the VM name, removes
    /// dependent snapshot and session rows, and finally the record itself.
    ///
    /// # Errors
    /// Only store failures while reading or removing the record.
    pub async fn delete_vm_report(&self, name: &str) -> Result<CleanupReport, OrchestratorError> {
        let mut report = CleanupReport::new(name);
        let record = self.store.vm_by_name(name).await?;

        if let Some(mut rec) = record.clone() {
            rec.status = VmStatus::Deleting;
            if let Err(e) = self.store.update_vm(&rec).await {
                report.warn("mark_deleting", e);
            }
        } else {
            tracing::warn!(
                vm_name = %name,
                "vm not found in store, cleaning up hypervisor and files only"
            );
        }

        let target = name.to_owned();
        match self
            .guarded("delete_vm", move |this| async move {
                Ok(this.teardown_domain(&target).await)
            })
            .await
        {
            Ok(teardown) => report.merge(teardown),
            Err(e) => report.warn("teardown", e),
        }

        match disk::remove_file(&self.config.disk_path(name)).await {
            Ok(true) => tracing::info!(vm_name = %name, "vm disk removed"),
            Ok(false) => {}
            Err(e) => report.warn("remove_disk", e),
        }
        let (removed, failures) = disk::remove_prefixed(&self.config.vm_dir, name).await;
        for path in &removed {
            tracing::info!(vm_name = %name, path = %path.display(), "vm related file removed");
        }
        for failure in failures {
            report.warn("remove_files", failure);
        }

        if let Some(rec) = &record {
            match self.store.delete_snapshots_for_vm(rec.id).await {
                Ok(n) if n > 0 => {
                    tracing::info!(vm_name = %name, count = n, "snapshot records removed");
                }
                Ok(_) => {}
                Err(e) => report.warn("delete_snapshot_records", e),
            }
            match self.store.delete_sessions_for_vm(rec.id).await {
                Ok(n) if n > 0 => {
                    tracing::info!(vm_name = %name, count = n, "console session rows removed");
                }
                Ok(_) => {}
                Err(e) => report.warn("delete_session_rows", e),
            }
            self.store.delete_vm(rec.id).await?;
            tracing::info!(vm_name = %name, vm_id = %rec.id, "vm record deleted");
        }

        let event = AuditEvent::success(AuditAction::VmDeleted, ResourceKind::Vm, name)
            .with_detail(format!("{} cleanup warning(s)", report.warnings.len()));
        let event = match &record {
            Some(rec) => event.with_actor(rec.owner),
            None => event,
        };
        self.audit.record(event);
        Ok(report)
    }

    /// Force-stops (if active) and undefines the named domain.
    async fn teardown_domain(&self, name: &str) -> CleanupReport {
        let mut report = CleanupReport::new(name);
        let domain = match self.hypervisor.lookup_domain(name).await {
            Ok(domain) => domain,
            Err(e) if e.is_not_found() => {
                tracing::info!(
                    vm_name = %name,
                    "domain not found in hypervisor, continuing cleanup"
                );
                return report;
            }
            Err(e) => {
                report.warn("lookup", e);
                return report;
            }
        };
        match domain.is_active().await {
            Ok(true) => {
                if let Err(e) = domain.force_stop().await {
                    report.warn("force_stop", e);
                }
            }
            Ok(false) => {}
            Err(e) => report.warn("is_active", e),
        }
        if let Err(e) = domain.undefine().await {
            report.warn("undefine", e);
        }
        report
    }

    /// Resizes a stopped VM. Changes take effect on the next boot.
    ///
    /// # Errors
    /// - [`OrchestratorError::InvalidRequest`] for zero sizes.
    /// - [`OrchestratorError::VmNotFound`] if no record has `name`.
    /// - [`OrchestratorError::Conflict`] if the domain is running.
    /// - Guard and hypervisor errors.
    pub async fn update_vm(
        &self,
        name: &str,
        cpu: u32,
        memory_mib: u32,
    ) -> Result<VmRecord, OrchestratorError> {
        validate_resources(cpu, memory_mib)?;
        let mut record = self
            .store
            .vm_by_name(name)
            .await?
            .ok_or_else(|| OrchestratorError::VmNotFound(name.to_owned()))?;
        let owner = record.owner;

        let target = name.to_owned();
        let result = self
            .guarded("update_vm", move |this| async move {
                let domain = this.hypervisor.lookup_domain(&target).await?;
                if domain.is_active().await? {
                    return Err(OrchestratorError::Conflict(format!(
                        "vm '{target}' must be stopped before it can be resized"
                    )));
                }
                resize_config(domain.as_ref(), cpu, memory_mib).await
            })
            .await;

        let result = match result {
            Ok(()) => {
                record.cpu = cpu;
                record.memory_mib = memory_mib;
                self.store.update_vm(&record).await?;
                tracing::info!(vm_name = %name, cpu, memory_mib, "vm resized");
                Ok(record)
            }
            Err(e) => Err(e),
        };
        self.record_audit(AuditAction::VmUpdated, ResourceKind::Vm, name, Some(owner), &result);
        result
    }

    /// Every VM record, ordered by id.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn list_vms(&self) -> Result<Vec<VmRecord>, OrchestratorError> {
        Ok(self.store.list_vms().await?)
    }

    /// # Errors
    /// [`OrchestratorError::VmNotFound`] if no record has `name`.
    pub async fn get_vm(&self, name: &str) -> Result<VmRecord, OrchestratorError> {
        self.store
            .vm_by_name(name)
            .await?
            .ok_or_else(|| OrchestratorError::VmNotFound(name.to_owned()))
    }

    /// # Errors
    /// [`OrchestratorError::VmNotFound`] if no record has `id`.
    pub async fn get_vm_by_id(&self, id: VmId) -> Result<VmRecord, OrchestratorError> {
        self.store
            .vm(id)
            .await?
            .ok_or_else(|| OrchestratorError::VmNotFound(id.to_string()))
    }

    /// Best-effort status write after a successful hypervisor operation.
    ///
    /// Re-reads the record so concurrent edits to other fields survive.
    pub(crate) async fn set_persisted_status(&self, name: &str, status: VmStatus) {
        match self.store.vm_by_name(name).await {
            Ok(Some(mut record)) if record.status != status => {
                record.status = status;
                if let Err(e) = self.store.update_vm(&record).await {
                    tracing::warn!(vm_name = %name, error = %e, "failed to persist vm status");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(
                vm_name = %name,
                error = %e,
                "failed to load vm record for status update"
            ),
        }
    }

    pub(crate) async fn owner_of(&self, name: &str) -> Option<UserId> {
        self.store.vm_by_name(name).await.ok().flatten().map(|r| r.owner)
    }
}

/// Starts `domain` and fails if it is shut off or crashed right afterwards.
async fn start_and_verify(domain: &dyn Domain) -> Result<(), OrchestratorError> {
    domain.start().await?;
    let (state, reason) = domain.state().await?;
    if matches!(state, DomainState::Shutoff | DomainState::Crashed) {
        tracing::error!(
            vm_name = %domain.name(),
            %state,
            %reason,
            "domain stopped right after start"
        );
        return Err(OrchestratorError::StartFailed {
            name: domain.name().to_owned(),
            state,
            reason,
        });
    }
    tracing::info!(vm_name = %domain.name(), %state, "domain started");
    Ok(())
}

/// Applies new sizes to the persisted configuration, raising the maxima
/// first when the request exceeds them.
async fn resize_config(
    domain: &dyn Domain,
    cpu: u32,
    memory_mib: u32,
) -> Result<(), OrchestratorError> {
    let xml = domain.descriptor(false).await?;
    let max_cpu = descriptor::max_vcpus(&xml).ok_or_else(|| {
        OrchestratorError::Internal("domain descriptor has no vcpu element".to_owned())
    })?;
    let memory_kib = u64::from(memory_mib) * 1024;

    if cpu > max_cpu {
        tracing::debug!(vm_name = %domain.name(), from = max_cpu, to = cpu, "raising vcpu maximum");
        domain.set_vcpus(cpu, ResizeScope::ConfigMaximum).await?;
    }
    if descriptor::max_memory_kib(&xml).is_some_and(|max| memory_kib > max) {
        domain.set_memory_kib(memory_kib, ResizeScope::ConfigMaximum).await?;
    }
    domain.set_memory_kib(memory_kib, ResizeScope::Config).await?;
    domain.set_vcpus(cpu, ResizeScope::Config).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use hearth_core::{MemoryAuditSink, MemoryStore};

    use super::*;
    use crate::config::BackendKind;
    use crate::simulated::SimulatedHypervisor;

    struct Fixture {
        _dir: tempfile::TempDir,
        hv: SimulatedHypervisor,
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditSink>,
        orch: Orchestrator,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig::local(BackendKind::Simulated, dir.path());
        std::fs::create_dir_all(&config.media_dir).expect("media dir");
        std::fs::write(config.media_dir.join("linux.iso"), b"iso").expect("media file");

        let hv = SimulatedHypervisor::new();
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let orch = Orchestrator::new(Arc::new(hv.clone()), store.clone(), audit.clone(), config);
        orch.register_image(NewOsImage::iso("Linux", "linux", "linux.iso"))
            .await
            .expect("register image");
        Fixture { _dir: dir, hv, store, audit, orch }
    }

    fn alpha() -> CreateVmRequest {
        CreateVmRequest::new("alpha", 2, 1024, "linux", UserId(1))
    }

    #[tokio::test]
    async fn create_vm_defines_and_starts_domain() {
        let f = fixture().await;
        let record = f.orch.create_vm(alpha()).await.expect("create");
        assert_eq!(record.status, VmStatus::Running);
        assert_eq!(f.hv.is_domain_active("alpha").await, Some(true));
        assert!(f.orch.config().disk_path("alpha").exists());
        assert_eq!(f.audit.events_for(AuditAction::VmCreated).len(), 1);
    }

    #[tokio::test]
    async fn create_vm_rejects_invalid_input_before_touching_store() {
        let f = fixture().await;
        let bad_name =
            f.orch.create_vm(CreateVmRequest::new("../x", 1, 512, "linux", UserId(1))).await;
        assert!(matches!(bad_name, Err(OrchestratorError::InvalidRequest(_))));
        let zero_cpu =
            f.orch.create_vm(CreateVmRequest::new("ok", 0, 512, "linux", UserId(1))).await;
        assert!(matches!(zero_cpu, Err(OrchestratorError::InvalidRequest(_))));
        assert!(f.store.list_vms().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn create_vm_with_taken_name_is_a_conflict() {
        let f = fixture().await;
        f.orch.create_vm(alpha()).await.expect("first create");
        let second = f.orch.create_vm(alpha()).await;
        assert!(matches!(second, Err(OrchestratorError::Conflict(_))));

        let mut record = f.orch.get_vm("alpha").await.expect("get");
        record.status = VmStatus::Creating;
        f.store.update_vm(&record).await.expect("mark creating");
        let third = f.orch.create_vm(alpha()).await;
        assert!(matches!(third, Err(OrchestratorError::Conflict(_))));
    }

    #[tokio::test]
    async fn create_vm_retry_replaces_errored_record() {
        let f = fixture().await;
        f.orch
            .register_image(NewOsImage::iso("BSD", "bsd", "bsd.iso"))
            .await
            .expect("register image");
        let request = CreateVmRequest::new("gamma", 1, 512, "bsd", UserId(3));

        let first = f.orch.create_vm(request.clone()).await;
        assert!(matches!(first, Err(OrchestratorError::MediaMissing { .. })));
        let failed = f.orch.get_vm("gamma").await.expect("errored record kept");
        assert_eq!(failed.status, VmStatus::Error);
        f.store
            .insert_session(hearth_core::ConsoleSessionRecord {
                session_id: hearth_core::SessionId::new("stale-session"),
                user_id: UserId(3),
                vm_id: failed.id,
                vm_uuid: failed.uuid,
                started_at: chrono::Utc::now(),
                last_activity_at: chrono::Utc::now(),
                client_ip: "192.0.2.1".to_owned(),
                client_agent: "console".to_owned(),
                ended_at: None,
                end_reason: None,
            })
            .await
            .expect("session row");

        std::fs::write(f.orch.config().media_dir.join("bsd.iso"), b"iso").expect("media file");
        let retried = f.orch.create_vm(request).await.expect("retry succeeds");
        assert_eq!(retried.status, VmStatus::Running);
        assert_ne!(retried.id, failed.id);
        assert_eq!(f.store.list_vms().await.expect("list").len(), 1);
        assert!(f.store.session_rows().await.is_empty());
    }

    #[tokio::test]
    async fn create_vm_replaces_stopped_record() {
        let f = fixture().await;
        let first = f.orch.create_vm(alpha()).await.expect("create");
        f.orch.stop_vm("alpha").await.expect("stop");
        let second = f.orch.create_vm(alpha()).await.expect("replace stopped vm");
        assert_ne!(second.id, first.id);
        assert_eq!(f.hv.is_domain_active("alpha").await, Some(true));
    }

    #[tokio::test]
    async fn create_vm_without_catalog_entry_marks_record_error() {
        let f = fixture().await;
        let result =
            f.orch.create_vm(CreateVmRequest::new("beta", 1, 512, "plan9", UserId(1))).await;
        assert!(matches!(result, Err(OrchestratorError::ImageNotFound { .. })));
        let record = f.orch.get_vm("beta").await.expect("record kept");
        assert_eq!(record.status, VmStatus::Error);
    }

    #[tokio::test]
    async fn create_vm_replaces_leftover_domain() {
        let f = fixture().await;
        f.orch.create_vm(alpha()).await.expect("create");
        f.store
            .delete_vm(f.orch.get_vm("alpha").await.expect("get").id)
            .await
            .expect("drop record");
        let again = f.orch.create_vm(alpha()).await.expect("create over leftover domain");
        assert_eq!(again.status, VmStatus::Running);
        assert_eq!(f.hv.domain_names().await, vec!["alpha".to_owned()]);
    }

    #[tokio::test]
    async fn start_of_crashing_domain_reports_start_failed() {
        let f = fixture().await;
        f.orch.create_vm(alpha()).await.expect("create");
        f.orch.stop_vm("alpha").await.expect("stop");
        f.hv.crash_on_start("alpha").await;
        let result = f.orch.start_vm("alpha").await;
        assert!(matches!(
            result,
            Err(OrchestratorError::StartFailed { state: DomainState::Shutoff, .. })
        ));
    }

    #[tokio::test]
    async fn start_and_stop_move_persisted_status() {
        let f = fixture().await;
        f.orch.create_vm(alpha()).await.expect("create");
        f.orch.stop_vm("alpha").await.expect("stop");
        assert_eq!(f.orch.get_vm("alpha").await.expect("get").status, VmStatus::Stopped);
        f.orch.start_vm("alpha").await.expect("start");
        assert_eq!(f.orch.get_vm("alpha").await.expect("get").status, VmStatus::Running);
        f.orch.start_vm("alpha").await.expect("second start is a no-op");
    }

    #[tokio::test]
    async fn start_unknown_domain_surfaces_lookup_error() {
        let f = fixture().await;
        let result = f.orch.start_vm("ghost").await;
        assert!(matches!(result, Err(OrchestratorError::Hypervisor(e)) if e.is_not_found()));
    }

    #[tokio::test]
    async fn update_vm_requires_stopped_domain() {
        let f = fixture().await;
        f.orch.create_vm(alpha()).await.expect("create");
        let running = f.orch.update_vm("alpha", 4, 2048).await;
        assert!(matches!(running, Err(OrchestratorError::Conflict(_))));

        f.orch.stop_vm("alpha").await.expect("stop");
        let record = f.orch.update_vm("alpha", 4, 2048).await.expect("resize");
        assert_eq!((record.cpu, record.memory_mib), (4, 2048));
        assert_eq!(f.hv.domain_sizes("alpha").await, Some((4, 4, 2048 * 1024)));
    }

    #[tokio::test]
    async fn delete_vm_tolerates_hypervisor_failures() {
        let f = fixture().await;
        f.orch.create_vm(alpha()).await.expect("create");
        f.hv.fail_operation("undefine", "permission denied").await;

        let report = f.orch.delete_vm_report("alpha").await.expect("delete succeeds");
        assert!(report.has_step("undefine"));
        assert!(f.orch.get_vm("alpha").await.is_err(), "record must be gone");
        assert!(!f.orch.config().disk_path("alpha").exists());
    }

    #[tokio::test]
    async fn delete_unknown_vm_succeeds() {
        let f = fixture().await;
        assert!(f.orch.delete_vm("ghost").await.is_ok());
    }

    #[tokio::test]
    async fn is_alive_follows_backend() {
        let f = fixture().await;
        assert!(f.orch.is_alive().await);
        f.hv.set_offline(true).await;
        assert!(!f.orch.is_alive().await);
    }
}
