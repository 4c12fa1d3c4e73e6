//! Hypervisor capability interface and VM lifecycle orchestration for hearth.
//!
//! Handles domain definition from synthesized descriptors, disk and media
//! management, state reconciliation and snapshots, with every hypervisor
//! call bounded by a shared concurrency guard.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod cleanup;
pub mod config;
pub mod descriptor;
pub mod disabled;
pub mod disk;
pub mod error;
pub mod guard;
#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod media;
pub mod orchestrator;
pub mod simulated;
pub mod snapshot;
pub mod stats;
pub mod sync;

use std::sync::Arc;

pub use backend::{Domain, DomainInfo, DomainSnapshot, DomainState, Hypervisor, ResizeScope};
pub use cleanup::{CleanupReport, CleanupWarning};
pub use config::{BackendKind, DiskFormat, GuardConfig, OrchestratorConfig};
pub use descriptor::{BootOrder, GraphicsKind};
pub use disabled::DisabledBackend;
pub use error::{HypervisorError, OrchestratorError};
pub use guard::OperationGuard;
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
pub use media::MediaFile;
pub use orchestrator::{CreateVmRequest, Orchestrator};
pub use simulated::SimulatedHypervisor;
pub use stats::VmStats;
pub use sync::SweepReport;

/// Builds the hypervisor backend selected by `config.backend`.
///
/// # Errors
/// - [`HypervisorError::NotConnected`] if libvirt cannot be reached at the
///   configured URI.
/// - [`HypervisorError::Unavailable`] if libvirt is selected in a build
///   without the `libvirt` feature.
pub async fn connect_backend(
    config: &OrchestratorConfig,
) -> Result<Arc<dyn Hypervisor>, HypervisorError> {
    let backend: Arc<dyn Hypervisor> = match config.backend {
        BackendKind::Libvirt => connect_libvirt(&config.libvirt_uri).await?,
        BackendKind::Disabled => Arc::new(DisabledBackend),
        BackendKind::Simulated => Arc::new(SimulatedHypervisor::new()),
    };
    tracing::info!(backend = backend.kind(), "hypervisor backend ready");
    Ok(backend)
}

#[cfg(feature = "libvirt")]
async fn connect_libvirt(uri: &str) -> Result<Arc<dyn Hypervisor>, HypervisorError> {
    Ok(Arc::new(LibvirtBackend::connect(uri).await?))
}

#[cfg(not(feature = "libvirt"))]
#[allow(clippy::unused_async)]
async fn connect_libvirt(uri: &str) -> Result<Arc<dyn Hypervisor>, HypervisorError> {
    Err(HypervisorError::Unavailable(format!(
        "libvirt backend for {uri} requires building with the `libvirt` feature"
    )))
}
