//! Backend used when no hypervisor is configured.

use async_trait::async_trait;

use crate::backend::{Domain, Hypervisor};
use crate::HypervisorError;

/// Fails every operation with [`HypervisorError::Unavailable`].
///
/// Lets the control plane start on hosts without a hypervisor; callers see
/// an ordinary operational error and can report the backend as down.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBackend;

impl DisabledBackend {
    fn unavailable() -> HypervisorError {
        HypervisorError::Unavailable("hypervisor backend is disabled".to_owned())
    }
}

#[async_trait]
impl Hypervisor for DisabledBackend {
    fn kind(&self) -> &'static str {
        "disabled"
    }

    async fn lookup_domain(&self, _name: &str) -> Result<Box<dyn Domain>, HypervisorError> {
        Err(Self::unavailable())
    }

    async fn define_domain(&self, _descriptor: &str) -> Result<Box<dyn Domain>, HypervisorError> {
        Err(Self::unavailable())
    }

    async fn is_alive(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use hearth_core::ErrorCategory;

    use super::*;

    #[tokio::test]
    async fn disabled_backend_rejects_everything() {
        let backend = DisabledBackend;
        assert!(!backend.is_alive().await);
        let lookup = backend.lookup_domain("alpha").await;
        assert!(matches!(&lookup, Err(e) if e.category() == ErrorCategory::Unavailable));
        let define = backend.define_domain("<domain/>").await;
        assert!(matches!(define, Err(HypervisorError::Unavailable(_))));
    }
}
