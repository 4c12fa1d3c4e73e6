//! VM records, lifecycle status and the OS image catalog.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::id::{ImageId, UserId, VmId};

/// Longest accepted VM name.
pub const MAX_VM_NAME_LEN: usize = 64;

/// Lifecycle status stored on a [`VmRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmStatus {
    /// Accepted, not yet defined and started in the hypervisor.
    Creating,
    /// Domain observed active.
    Running,
    /// Domain observed inactive or missing.
    Stopped,
    /// Teardown in progress; the record is removed when it finishes.
    Deleting,
    /// Provisioning failed.
    Error,
}

impl VmStatus {
    /// Returns the persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "Creating",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Deleting => "Deleting",
            Self::Error => "Error",
        }
    }

    /// Maps a live "is the domain active" observation to a status.
    #[must_use]
    pub const fn from_active(active: bool) -> Self {
        if active {
            Self::Running
        } else {
            Self::Stopped
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: VmId,
    /// Domain name; unique within the hypervisor namespace.
    pub name: String,
    /// Stable external identifier, also written into the domain descriptor.
    pub uuid: Uuid,
    pub cpu: u32,
    pub memory_mib: u32,
    pub os_type: String,
    pub status: VmStatus,
    pub owner: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to insert a new [`VmRecord`]; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NewVm {
    pub name: String,
    pub uuid: Uuid,
    pub cpu: u32,
    pub memory_mib: u32,
    pub os_type: String,
    pub status: VmStatus,
    pub owner: UserId,
}

impl NewVm {
    /// Builds a new `Creating` record with a fresh UUID.
    pub fn creating(
        name: impl Into<String>,
        cpu: u32,
        memory_mib: u32,
        os_type: impl Into<String>,
        owner: UserId,
    ) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            cpu,
            memory_mib,
            os_type: os_type.into(),
            status: VmStatus::Creating,
            owner,
        }
    }
}

/// Installation media registered for an OS type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsImage {
    pub id: ImageId,
    pub name: String,
    /// Catalog key matched against [`VmRecord::os_type`].
    pub os_type: String,
    /// Absolute, or relative to the configured media directory.
    pub path: PathBuf,
    pub is_iso: bool,
    pub description: String,
}

/// Fields needed to register an [`OsImage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NewOsImage {
    pub name: String,
    pub os_type: String,
    pub path: PathBuf,
    pub is_iso: bool,
    pub description: String,
}

impl NewOsImage {
    /// An ISO catalog entry with an empty description.
    pub fn iso(
        name: impl Into<String>,
        os_type: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            os_type: os_type.into(),
            path: path.into(),
            is_iso: true,
            description: String::new(),
        }
    }
}

/// Checks that `name` is usable both as a domain name and as a file prefix
/// inside the VM directory.
///
/// # Errors
/// Returns [`CoreError::InvalidVmName`] for empty or overlong names, names
/// starting with `.` or `-`, or names containing characters outside
/// `[A-Za-z0-9._-]`.
pub fn validate_vm_name(name: &str) -> Result<(), CoreError> {
    let invalid = |reason: &str| CoreError::InvalidVmName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };

    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.len() > MAX_VM_NAME_LEN {
        return Err(invalid("name is longer than 64 characters"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(invalid("name must not start with '.' or '-'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(invalid(&format!("character '{c}' is not allowed")));
    }
    Ok(())
}

/// Checks requested vCPU and memory sizes.
///
/// # Errors
/// Returns [`CoreError::InvalidResource`] when either value is zero.
pub fn validate_resources(cpu: u32, memory_mib: u32) -> Result<(), CoreError> {
    if cpu == 0 {
        return Err(CoreError::InvalidResource {
            field: "cpu",
            reason: "at least one vCPU is required".to_owned(),
        });
    }
    if memory_mib == 0 {
        return Err(CoreError::InvalidResource {
            field: "memory",
            reason: "memory must be at least 1 MiB".to_owned(),
        });
    }
    Ok(())
}
