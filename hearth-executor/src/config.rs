//! Orchestrator configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use hearth_core::{env, CoreError};
use serde::{Deserialize, Serialize};

/// Which hypervisor backend to connect at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// libvirt through the `virt` bindings.
    #[default]
    Libvirt,
    /// Every operation fails with an "unavailable" error.
    Disabled,
    /// In-process simulation.
    Simulated,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "libvirt" | "qemu" => Ok(Self::Libvirt),
            "disabled" | "none" => Ok(Self::Disabled),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(format!(
                "unknown backend '{other}' (expected libvirt, disabled or simulated)"
            )),
        }
    }
}

/// On-disk format of VM disk images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFormat {
    /// Copy-on-write image created with `qemu-img`.
    #[default]
    Qcow2,
    /// Sparse raw file.
    Raw,
}

impl DiskFormat {
    /// File extension and descriptor driver type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Qcow2 => "qcow2",
            Self::Raw => "raw",
        }
    }
}

impl FromStr for DiskFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qcow2" => Ok(Self::Qcow2),
            "raw" | "img" => Ok(Self::Raw),
            other => Err(format!("unknown disk format '{other}' (expected qcow2 or raw)")),
        }
    }
}

/// Settings for the [`OperationGuard`](crate::OperationGuard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Maximum number of hypervisor operations executing at once.
    pub capacity: usize,
    /// How long a caller may wait for a slot.
    pub admission_timeout: Duration,
    /// How long an admitted operation may run before the caller gives up.
    pub execution_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            admission_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the [`Orchestrator`](crate::Orchestrator) and its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct OrchestratorConfig {
    pub backend: BackendKind,
    /// libvirt connection URI.
    pub libvirt_uri: String,
    /// Directory holding VM disk images and snapshot overlays.
    pub vm_dir: PathBuf,
    /// Base directory for relative installation media paths.
    pub media_dir: PathBuf,
    pub disk_format: DiskFormat,
    pub disk_size_gib: u64,
    /// libvirt network the VM NIC attaches to.
    pub network: String,
    pub guard: GuardConfig,
    /// How many times restore checks whether the domain has stopped.
    pub restore_poll_attempts: u32,
    pub restore_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            libvirt_uri: "qemu:///system".to_owned(),
            vm_dir: PathBuf::from("/var/lib/hearth/vms"),
            media_dir: PathBuf::from("/var/lib/hearth/iso"),
            disk_format: DiskFormat::default(),
            disk_size_gib: 20,
            network: "default".to_owned(),
            guard: GuardConfig::default(),
            restore_poll_attempts: 30,
            restore_poll_interval: Duration::from_secs(1),
        }
    }
}

impl OrchestratorConfig {
    /// A configuration rooted in `base`, using the given backend and raw
    /// disks. Convenient for tests and local development.
    #[must_use]
    pub fn local(backend: BackendKind, base: &std::path::Path) -> Self {
        Self {
            backend,
            vm_dir: base.join("vms"),
            media_dir: base.join("media"),
            disk_format: DiskFormat::Raw,
            disk_size_gib: 1,
            ..Self::default()
        }
    }

    /// Reads `HEARTH_*` environment variables, falling back to the defaults.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] for any variable that is set but
    /// cannot be parsed, or for a zero guard capacity.
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();
        let guard = GuardConfig {
            capacity: env::parse_or("HEARTH_GUARD_CAPACITY", defaults.guard.capacity)?,
            admission_timeout: env::secs_or(
                "HEARTH_GUARD_ADMISSION_SECS",
                defaults.guard.admission_timeout,
            )?,
            execution_timeout: env::secs_or(
                "HEARTH_GUARD_EXECUTION_SECS",
                defaults.guard.execution_timeout,
            )?,
        };
        if guard.capacity == 0 {
            return Err(CoreError::InvalidConfig {
                key: "HEARTH_GUARD_CAPACITY".to_owned(),
                value: "0".to_owned(),
                reason: "at least one slot is required".to_owned(),
            });
        }

        Ok(Self {
            backend: env::parse_or("HEARTH_BACKEND", defaults.backend)?,
            libvirt_uri: env::string_or("HEARTH_LIBVIRT_URI", &defaults.libvirt_uri),
            vm_dir: env::path_or("HEARTH_VM_DIR", "/var/lib/hearth/vms"),
            media_dir: env::path_or("HEARTH_MEDIA_DIR", "/var/lib/hearth/iso"),
            disk_format: env::parse_or("HEARTH_DISK_FORMAT", defaults.disk_format)?,
            disk_size_gib: env::parse_or("HEARTH_DISK_SIZE_GIB", defaults.disk_size_gib)?,
            network: env::string_or("HEARTH_NETWORK", &defaults.network),
            guard,
            restore_poll_attempts: env::parse_or(
                "HEARTH_RESTORE_POLL_ATTEMPTS",
                defaults.restore_poll_attempts,
            )?,
            restore_poll_interval: env::millis_or(
                "HEARTH_RESTORE_POLL_INTERVAL_MS",
                defaults.restore_poll_interval,
            )?,
        })
    }

    /// Path of the disk image for VM `name`.
    #[must_use]
    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.vm_dir.join(format!("{name}.{}", self.disk_format.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.guard.capacity, 5);
        assert_eq!(config.guard.admission_timeout, Duration::from_secs(5));
        assert_eq!(config.guard.execution_timeout, Duration::from_secs(30));
        assert_eq!(config.disk_size_gib, 20);
        assert_eq!(config.restore_poll_attempts, 30);
        assert_eq!(config.libvirt_uri, "qemu:///system");
    }

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("LIBVIRT".parse::<BackendKind>(), Ok(BackendKind::Libvirt));
        assert_eq!("disabled".parse::<BackendKind>(), Ok(BackendKind::Disabled));
        assert_eq!("Simulated".parse::<BackendKind>(), Ok(BackendKind::Simulated));
        assert!("xen".parse::<BackendKind>().is_err());
    }

    #[test]
    fn disk_path_uses_format_extension() {
        let mut config = OrchestratorConfig::default();
        config.vm_dir = PathBuf::from("/vms");
        assert_eq!(config.disk_path("alpha"), PathBuf::from("/vms/alpha.qcow2"));
        config.disk_format = DiskFormat::Raw;
        assert_eq!(config.disk_path("alpha"), PathBuf::from("/vms/alpha.raw"));
    }
}
