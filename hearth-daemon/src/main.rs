//! Entry point for the `hearthd` control-plane service.

use std::sync::Arc;

use hearth_core::{MemoryStore, TracingAuditSink};
use hearth_daemon::{Daemon, DaemonConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match DaemonConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let store = Arc::new(MemoryStore::new());
    let daemon = match Daemon::start(config, store, Arc::new(TracingAuditSink)).await {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
    daemon.shutdown().await;
}
