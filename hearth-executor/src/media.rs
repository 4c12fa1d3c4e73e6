//! Installation media, boot order and the switch from installer to disk.
//!
//! Every change here edits the persisted domain descriptor and redefines
//! the domain, so it takes effect on the next boot of a running VM.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hearth_core::{AuditAction, ResourceKind, VmStatus};
use serde::{Deserialize, Serialize};

use crate::descriptor::{self, BootOrder};
use crate::{disk, Orchestrator, OrchestratorError};

/// Installation media found in the media directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    /// File name without the directory.
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

fn is_media(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("iso") || ext.eq_ignore_ascii_case("img"))
}

fn no_cdrom(name: &str) -> OrchestratorError {
    OrchestratorError::Conflict(format!("vm '{name}' has no cd-rom device"))
}

impl Orchestrator {
    /// `.iso` and `.img` files in the media directory, sorted by name.
    /// A missing directory holds no media.
    ///
    /// # Errors
    /// [`OrchestratorError::Internal`] if the directory cannot be read.
    pub async fn list_media(&self) -> Result<Vec<MediaFile>, OrchestratorError> {
        let dir = &self.config.media_dir;
        let read_failed = |e: std::io::Error| {
            OrchestratorError::Internal(format!("read media directory {}: {e}", dir.display()))
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_failed(e)),
        };

        let mut media = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_failed)? {
            let path = entry.path();
            if !is_media(&path) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable media");
                    continue;
                }
            };
            media.push(MediaFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: meta.len(),
                modified: meta.modified().map(DateTime::from).unwrap_or_default(),
                path,
            });
        }
        media.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(media)
    }

    /// Media loaded in the CD-ROM drive of `name`, `None` when empty.
    ///
    /// # Errors
    /// - [`OrchestratorError::Conflict`] if the domain has no CD-ROM device.
    /// - Hypervisor and guard errors.
    pub async fn current_media(&self, name: &str) -> Result<Option<PathBuf>, OrchestratorError> {
        let target = name.to_owned();
        self.guarded("current_media", move |this| async move {
            let domain = this.hypervisor.lookup_domain(&target).await?;
            let xml = domain.descriptor(false).await?;
            descriptor::cdrom_source(&xml).ok_or_else(|| no_cdrom(&target))
        })
        .await
    }

    /// Loads media into the CD-ROM drive of `name`. Relative paths resolve
    /// against the media directory. Returns the resolved path.
    ///
    /// # Errors
    /// - [`OrchestratorError::MediaMissing`] if the file does not exist.
    /// - [`OrchestratorError::Conflict`] if the domain has no CD-ROM device.
    /// - Hypervisor and guard errors.
    pub async fn attach_media(
        &self,
        name: &str,
        media: &Path,
    ) -> Result<PathBuf, OrchestratorError> {
        let result = match disk::resolve_media(&self.config.media_dir, media).await {
            Ok(path) => {
                let source = path.clone();
                let target = name.to_owned();
                self.redefine_with("attach_media", name, move |xml| {
                    descriptor::set_cdrom_source(xml, Some(&source))
                        .ok_or_else(|| no_cdrom(&target))
                })
                .await
                .map(|()| path)
            }
            Err(e) => Err(e),
        };
        if let Ok(path) = &result {
            tracing::info!(vm_name = %name, media = %path.display(), "media attached");
        }
        let owner = self.owner_of(name).await;
        self.record_audit(AuditAction::MediaAttached, ResourceKind::Vm, name, owner, &result);
        result
    }

    /// Empties the CD-ROM drive of `name`. The device itself stays.
    ///
    /// # Errors
    /// - [`OrchestratorError::Conflict`] if the domain has no CD-ROM device.
    /// - Hypervisor and guard errors.
    pub async fn detach_media(&self, name: &str) -> Result<(), OrchestratorError> {
        let target = name.to_owned();
        let result = self
            .redefine_with("detach_media", name, move |xml| {
                descriptor::set_cdrom_source(xml, None).ok_or_else(|| no_cdrom(&target))
            })
            .await;
        if result.is_ok() {
            tracing::info!(vm_name = %name, "media detached");
        }
        let owner = self.owner_of(name).await;
        self.record_audit(AuditAction::MediaDetached, ResourceKind::Vm, name, owner, &result);
        result
    }

    /// Replaces the boot device sequence of `name`.
    ///
    /// # Errors
    /// - [`OrchestratorError::Internal`] if the descriptor has no `<os>`
    ///   type element to anchor the boot entries.
    /// - Hypervisor and guard errors.
    pub async fn set_boot_order(
        &self,
        name: &str,
        order: BootOrder,
    ) -> Result<(), OrchestratorError> {
        let result = self
            .redefine_with("set_boot_order", name, move |xml| {
                descriptor::set_boot_order(xml, order).ok_or_else(|| {
                    OrchestratorError::Internal("domain descriptor has no <os> type".to_owned())
                })
            })
            .await;
        if result.is_ok() {
            tracing::info!(vm_name = %name, boot_order = %order, "boot order updated");
        }
        let owner = self.owner_of(name).await;
        self.record_audit(AuditAction::BootOrderChanged, ResourceKind::Vm, name, owner, &result);
        result
    }

    /// Ends the installation phase of `name`: shuts the domain down, then
    /// removes the CD-ROM device and its boot entry so the VM boots from
    /// disk. The record is marked `Stopped`.
    ///
    /// # Errors
    /// Hypervisor and guard errors from stopping or redefining.
    pub async fn finalize_install(&self, name: &str) -> Result<(), OrchestratorError> {
        let result = async {
            if self.stop_and_wait(name, "finalize_install").await? {
                tracing::info!(vm_name = %name, "vm shut down for install finalization");
            }
            self.redefine_with("finalize_install", name, |xml| Ok(descriptor::remove_cdrom(xml)))
                .await
        }
        .await;

        if result.is_ok() {
            self.set_persisted_status(name, VmStatus::Stopped).await;
            tracing::info!(vm_name = %name, "installation finalized, booting from disk");
        }
        let owner = self.owner_of(name).await;
        self.record_audit(AuditAction::InstallFinalized, ResourceKind::Vm, name, owner, &result);
        result
    }

    /// Applies `edit` to the current descriptor of `name` and redefines
    /// the domain with the result, all in one guard slot.
    async fn redefine_with<F>(
        &self,
        operation: &'static str,
        name: &str,
        edit: F,
    ) -> Result<(), OrchestratorError>
    where
        F: FnOnce(&str) -> Result<String, OrchestratorError> + Send + 'static,
    {
        let target = name.to_owned();
        self.guarded(operation, move |this| async move {
            let domain = this.hypervisor.lookup_domain(&target).await?;
            let current = domain.descriptor(false).await?;
            let updated = edit(&current)?;
            this.hypervisor.define_domain(&updated).await?;
            tracing::debug!(vm_name = %target, operation, "domain redefined");
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hearth_core::{MemoryAuditSink, MemoryStore, NewOsImage, Outcome, UserId};

    use super::*;
    use crate::backend::{Domain, Hypervisor};
    use crate::config::{BackendKind, OrchestratorConfig};
    use crate::orchestrator::CreateVmRequest;
    use crate::simulated::SimulatedHypervisor;

    struct Fixture {
        _dir: tempfile::TempDir,
        hv: SimulatedHypervisor,
        audit: Arc<MemoryAuditSink>,
        orch: Orchestrator,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = OrchestratorConfig::local(BackendKind::Simulated, dir.path());
        config.restore_poll_interval = Duration::from_millis(5);
        std::fs::create_dir_all(&config.media_dir).expect("media dir");
        std::fs::write(config.media_dir.join("linux.iso"), b"installer").expect("media");
        std::fs::write(config.media_dir.join("drivers.IMG"), b"drv").expect("media");
        std::fs::write(config.media_dir.join("notes.txt"), b"not media").expect("other file");

        let hv = SimulatedHypervisor::new();
        let audit = Arc::new(MemoryAuditSink::new());
        let orch = Orchestrator::new(
            Arc::new(hv.clone()),
            Arc::new(MemoryStore::new()),
            audit.clone(),
            config,
        );
        orch.register_image(NewOsImage::iso("Linux", "linux", "linux.iso"))
            .await
            .expect("image");
        orch.create_vm(CreateVmRequest::new("alpha", 1, 512, "linux", UserId(2)))
            .await
            .expect("create");
        Fixture { _dir: dir, hv, audit, orch }
    }

    #[tokio::test]
    async fn list_media_filters_and_sorts() {
        let f = fixture().await;
        let media = f.orch.list_media().await.expect("list");
        let names: Vec<_> = media.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["drivers.IMG", "linux.iso"]);
        assert_eq!(media[1].size_bytes, 9);
        assert_eq!(media[1].path, f.orch.config().media_dir.join("linux.iso"));
    }

    #[tokio::test]
    async fn list_media_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig::local(BackendKind::Simulated, dir.path());
        let orch = Orchestrator::new(
            Arc::new(SimulatedHypervisor::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAuditSink::new()),
            config,
        );
        assert!(orch.list_media().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn detach_then_attach_swaps_drive_contents() {
        let f = fixture().await;
        let installer = f.orch.config().media_dir.join("linux.iso");
        assert_eq!(f.orch.current_media("alpha").await.expect("media"), Some(installer));

        f.orch.detach_media("alpha").await.expect("detach");
        assert_eq!(f.orch.current_media("alpha").await.expect("media"), None);

        let attached = f
            .orch
            .attach_media("alpha", Path::new("drivers.IMG"))
            .await
            .expect("attach");
        assert_eq!(attached, f.orch.config().media_dir.join("drivers.IMG"));
        assert_eq!(f.orch.current_media("alpha").await.expect("media"), Some(attached));
        assert_eq!(f.audit.events_for(AuditAction::MediaAttached).len(), 1);
        assert_eq!(f.audit.events_for(AuditAction::MediaDetached).len(), 1);
    }

    #[tokio::test]
    async fn attach_missing_media_fails_and_is_audited() {
        let f = fixture().await;
        let result = f.orch.attach_media("alpha", Path::new("ghost.iso")).await;
        assert!(matches!(result, Err(OrchestratorError::MediaMissing { .. })));
        let events = f.audit.events_for(AuditAction::MediaAttached);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Failure);
        assert_eq!(events[0].actor, Some(UserId(2)));
    }

    #[tokio::test]
    async fn set_boot_order_rewrites_descriptor() {
        let f = fixture().await;
        f.orch.set_boot_order("alpha", BootOrder::HdCdrom).await.expect("boot order");
        let domain = f.hv.lookup_domain("alpha").await.expect("lookup");
        let xml = domain.descriptor(false).await.expect("descriptor");
        assert_eq!(descriptor::boot_devices(&xml), vec!["hd", "cdrom"]);
        assert_eq!(f.hv.is_domain_active("alpha").await, Some(true), "redefine keeps it running");
    }

    #[tokio::test]
    async fn finalize_install_ejects_cdrom_and_stops() {
        let f = fixture().await;
        f.orch.finalize_install("alpha").await.expect("finalize");

        assert_eq!(f.hv.is_domain_active("alpha").await, Some(false));
        assert_eq!(f.orch.get_vm("alpha").await.expect("get").status, VmStatus::Stopped);
        let domain = f.hv.lookup_domain("alpha").await.expect("lookup");
        let xml = domain.descriptor(false).await.expect("descriptor");
        assert_eq!(descriptor::boot_devices(&xml), vec!["hd"]);
        assert!(matches!(
            f.orch.current_media("alpha").await,
            Err(OrchestratorError::Conflict(_))
        ));
        assert!(matches!(f.orch.detach_media("alpha").await, Err(OrchestratorError::Conflict(_))));
        assert_eq!(f.audit.events_for(AuditAction::InstallFinalized).len(), 1);
    }

    #[tokio::test]
    async fn finalize_install_falls_back_to_force_stop() {
        let f = fixture().await;
        f.hv.fail_operation("graceful_stop", "acpi ignored").await;
        f.orch.finalize_install("alpha").await.expect("finalize");
        assert_eq!(f.hv.is_domain_active("alpha").await, Some(false));
    }

    #[tokio::test]
    async fn media_operations_on_unknown_vm_surface_not_found() {
        let f = fixture().await;
        let result = f.orch.detach_media("ghost").await;
        assert!(matches!(result, Err(OrchestratorError::Hypervisor(e)) if e.is_not_found()));
    }
}
