use hearth_core::{CoreError, ErrorCategory};
use hearth_executor::{HypervisorError, OrchestratorError};

/// Errors surfaced by the composition root.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] CoreError),

    #[error("hypervisor backend unavailable: {0}")]
    Backend(#[from] HypervisorError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl DaemonError {
    /// Category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(e) => e.category(),
            Self::Backend(e) => e.category(),
            Self::Orchestrator(e) => e.category(),
        }
    }
}
