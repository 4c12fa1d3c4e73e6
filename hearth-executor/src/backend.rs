//! Hypervisor capability interface.
//!
//! The orchestrator only needs the operations below. Backends are picked at
//! startup ([`crate::connect_backend`]), so the same control plane runs
//! against libvirt, against nothing at all, or against an in-process
//! simulation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::HypervisorError;

/// Connection to a hypervisor.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Short backend name used in logs.
    fn kind(&self) -> &'static str;

    /// Looks up a domain by name.
    ///
    /// # Errors
    /// Returns [`HypervisorError::NotFound`] if no such domain is defined.
    async fn lookup_domain(&self, name: &str) -> Result<Box<dyn Domain>, HypervisorError>;

    /// Defines (persistently registers) a domain from a descriptor.
    ///
    /// # Errors
    /// Returns [`HypervisorError::Command`] if the descriptor is rejected.
    async fn define_domain(&self, descriptor: &str) -> Result<Box<dyn Domain>, HypervisorError>;

    /// Reports whether the hypervisor connection is usable.
    async fn is_alive(&self) -> bool;
}

/// A domain known to the hypervisor.
#[async_trait]
pub trait Domain: Send + Sync {
    /// Domain name.
    fn name(&self) -> &str;

    /// Returns `true` if the domain is running (or paused, blocked, etc.).
    async fn is_active(&self) -> Result<bool, HypervisorError>;

    /// Current state together with the hypervisor's reason text.
    async fn state(&self) -> Result<(DomainState, String), HypervisorError>;

    /// Resource counters of the domain.
    async fn info(&self) -> Result<DomainInfo, HypervisorError>;

    /// Current descriptor. `secure` includes security-sensitive fields.
    async fn descriptor(&self, secure: bool) -> Result<String, HypervisorError>;

    async fn start(&self) -> Result<(), HypervisorError>;

    /// Immediate power-off.
    async fn force_stop(&self) -> Result<(), HypervisorError>;

    /// Asks the guest to shut down; returns before the guest has stopped.
    async fn graceful_stop(&self) -> Result<(), HypervisorError>;

    /// Removes the persistent definition.
    async fn undefine(&self) -> Result<(), HypervisorError>;

    async fn set_vcpus(&self, count: u32, scope: ResizeScope) -> Result<(), HypervisorError>;

    async fn set_memory_kib(&self, kib: u64, scope: ResizeScope) -> Result<(), HypervisorError>;

    async fn create_snapshot(
        &self,
        descriptor: &str,
        flags: SnapshotCreateFlags,
    ) -> Result<Box<dyn DomainSnapshot>, HypervisorError>;

    /// Names of every snapshot of this domain.
    async fn list_snapshots(&self) -> Result<Vec<String>, HypervisorError>;

    /// # Errors
    /// Returns [`HypervisorError::NotFound`] if the domain has no such snapshot.
    async fn lookup_snapshot(
        &self,
        name: &str,
    ) -> Result<Box<dyn DomainSnapshot>, HypervisorError>;
}

/// A snapshot handle belonging to one domain.
#[async_trait]
pub trait DomainSnapshot: Send + Sync {
    fn name(&self) -> &str;

    async fn descriptor(&self) -> Result<String, HypervisorError>;

    async fn revert(&self, flags: RevertFlags) -> Result<(), HypervisorError>;

    async fn delete(&self, flags: SnapshotDeleteFlags) -> Result<(), HypervisorError>;
}

/// Domain run state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Suspended,
}

impl DomainState {
    /// Returns `true` for states in which the domain holds a running process.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Shutoff | Self::NoState)
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoState => "no state",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::ShuttingDown => "in shutdown",
            Self::Shutoff => "shut off",
            Self::Crashed => "crashed",
            Self::Suspended => "pmsuspended",
        };
        f.write_str(s)
    }
}

/// Point-in-time resource counters of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub state: DomainState,
    pub max_memory_kib: u64,
    /// Memory currently assigned to the guest.
    pub memory_kib: u64,
    pub vcpus: u32,
    /// Cumulative CPU time consumed by the guest.
    pub cpu_time_ns: u64,
}

/// Which configuration a resize applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeScope {
    /// The running domain only.
    Live,
    /// The persisted configuration, effective on next boot.
    Config,
    /// The persisted upper bound.
    ConfigMaximum,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SnapshotCreateFlags {
    /// All disks are snapshotted or none are.
    pub atomic: bool,
    /// Capture disk state only, no memory.
    pub disk_only: bool,
}

impl SnapshotCreateFlags {
    pub const ATOMIC_DISK_ONLY: Self = Self { atomic: true, disk_only: true };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RevertFlags {
    /// Leave the domain running after the revert.
    pub running: bool,
    /// Revert even when the hypervisor considers it risky.
    pub force: bool,
}

impl RevertFlags {
    pub const RUNNING_FORCE: Self = Self { running: true, force: true };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SnapshotDeleteFlags {
    /// Also delete descendant snapshots.
    pub children: bool,
    /// Drop hypervisor metadata only, leaving overlay files in place.
    pub metadata_only: bool,
}

impl SnapshotDeleteFlags {
    pub const CHILDREN: Self = Self { children: true, metadata_only: false };
    pub const CHILDREN_METADATA_ONLY: Self = Self { children: true, metadata_only: true };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_libvirt_wording() {
        assert_eq!(DomainState::Shutoff.to_string(), "shut off");
        assert_eq!(DomainState::ShuttingDown.to_string(), "in shutdown");
        assert_eq!(DomainState::Suspended.to_string(), "pmsuspended");
    }

    #[test]
    fn only_shutoff_and_no_state_are_inactive() {
        assert!(!DomainState::Shutoff.is_active());
        assert!(!DomainState::NoState.is_active());
        assert!(DomainState::Running.is_active());
        assert!(DomainState::Paused.is_active());
        assert!(DomainState::Crashed.is_active());
    }
}
