//! Error types for the executor crate.

use std::path::PathBuf;
use std::time::Duration;

use hearth_core::{CoreError, ErrorCategory, SnapshotId, StoreError};

use crate::backend::DomainState;

/// Errors reported by a [`Hypervisor`](crate::Hypervisor) backend.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HypervisorError {
    /// The named domain or snapshot does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// The backend is disabled or was not compiled in.
    #[error("hypervisor backend unavailable: {0}")]
    Unavailable(String),

    /// The hypervisor connection could not be established.
    #[error("cannot connect to hypervisor at {uri}: {reason}")]
    NotConnected { uri: String, reason: String },

    /// A hypervisor command ran and reported failure.
    #[error("{operation} failed: {message}")]
    Command { operation: String, message: String },

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HypervisorError {
    /// Shorthand for a missing domain.
    pub fn domain_not_found(name: impl Into<String>) -> Self {
        Self::NotFound { kind: "domain", name: name.into() }
    }

    /// Shorthand for a missing snapshot.
    pub fn snapshot_not_found(name: impl Into<String>) -> Self {
        Self::NotFound { kind: "snapshot", name: name.into() }
    }

    /// Returns `true` for [`HypervisorError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Unavailable(_) | Self::NotConnected { .. } => ErrorCategory::Unavailable,
            Self::Command { .. } | Self::Io(_) => ErrorCategory::Internal,
        }
    }
}

/// Errors returned by [`Orchestrator`](crate::Orchestrator) operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    /// No operation slot became free within the admission timeout.
    #[error(
        "too many concurrent hypervisor operations ({operation} waited {waited:?}), try again later"
    )]
    Overloaded { operation: &'static str, waited: Duration },

    /// The operation was admitted but did not finish within its deadline.
    #[error("hypervisor operation {operation} timed out after {limit:?}")]
    Timeout { operation: &'static str, limit: Duration },

    /// A precondition for the operation does not hold.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No persisted record for the named VM.
    #[error("vm '{0}' not found")]
    VmNotFound(String),

    /// No persisted record for the snapshot id.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    /// The image catalog has no entry for the OS type.
    #[error("no installation image registered for os type '{os_type}'")]
    ImageNotFound { os_type: String },

    /// The catalog entry points at a file that does not exist.
    #[error("installation media missing at {}", path.display())]
    MediaMissing { path: PathBuf },

    /// The VM disk image could not be created.
    #[error("disk allocation failed at {}: {reason}", path.display())]
    DiskAllocation { path: PathBuf, reason: String },

    /// The domain stopped immediately after being started.
    #[error("domain '{name}' failed to start (state: {state}, reason: {reason})")]
    StartFailed { name: String, state: DomainState, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Hypervisor(e) => e.category(),
            Self::Overloaded { .. } => ErrorCategory::Overload,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::VmNotFound(_) | Self::SnapshotNotFound(_) | Self::ImageNotFound { .. } => {
                ErrorCategory::NotFound
            }
            Self::InvalidRequest(_) => ErrorCategory::Invalid,
            Self::Store(e) => e.category(),
            Self::MediaMissing { .. }
            | Self::DiskAllocation { .. }
            | Self::StartFailed { .. }
            | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns `true` if the caller may retry after a backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_errors_are_retryable() {
        let overloaded =
            OrchestratorError::Overloaded { operation: "start", waited: Duration::from_secs(5) };
        let timeout =
            OrchestratorError::Timeout { operation: "start", limit: Duration::from_secs(30) };
        assert!(overloaded.is_retryable());
        assert!(timeout.is_retryable());
        assert_eq!(overloaded.category(), ErrorCategory::Overload);
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
    }

    #[test]
    fn hypervisor_not_found_keeps_its_category_through_wrapping() {
        let err = OrchestratorError::from(HypervisorError::domain_not_found("alpha"));
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "domain 'alpha' not found");
    }

    #[test]
    fn disabled_backend_maps_to_unavailable() {
        let err = OrchestratorError::from(HypervisorError::Unavailable("disabled".to_owned()));
        assert_eq!(err.category(), ErrorCategory::Unavailable);
    }

    #[test]
    fn duplicate_store_row_is_a_conflict() {
        let duplicate = StoreError::Duplicate { entity: "vm", key: "alpha".to_owned() };
        let err = OrchestratorError::from(duplicate);
        assert_eq!(err.category(), ErrorCategory::Conflict);
    }
}
