//! Composition root for the hearth VM control plane.
//!
//! Wires the configured hypervisor backend, the store, the audit sink, the
//! [`Orchestrator`] and the [`SessionBroker`] together and owns the two
//! background tasks: the console session reaper and the periodic state
//! reconciliation sweep.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;

use std::sync::Arc;
use std::time::Duration;

use hearth_console::{BrokerConfig, SessionBroker};
use hearth_core::{env, AuditSink, CoreError, EndReason, Store};
use hearth_executor::{
    connect_backend, CleanupReport, Orchestrator, OrchestratorConfig, OrchestratorError,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub use error::DaemonError;

/// Everything the daemon reads from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub orchestrator: OrchestratorConfig,
    pub broker: BrokerConfig,
    /// Pause between reconciliation sweeps.
    pub sync_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            broker: BrokerConfig::default(),
            sync_interval: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] for the first invalid variable.
    pub fn from_env() -> Result<Self, CoreError> {
        let sync_interval = env::secs_or("HEARTH_SYNC_INTERVAL_SECS", Duration::from_secs(30))?;
        if sync_interval.is_zero() {
            return Err(CoreError::InvalidConfig {
                key: "HEARTH_SYNC_INTERVAL_SECS".to_owned(),
                value: "0".to_owned(),
                reason: "sync interval must be positive".to_owned(),
            });
        }
        Ok(Self {
            orchestrator: OrchestratorConfig::from_env()?,
            broker: BrokerConfig::from_env()?,
            sync_interval,
        })
    }
}

/// Runs [`Orchestrator::reconcile_all`] every `interval` until `shutdown`
/// is cancelled. The first sweep runs immediately.
#[must_use]
pub fn spawn_sync_loop(
    orchestrator: Orchestrator,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("reconciliation loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match orchestrator.reconcile_all().await {
                        Ok(report) if report.updated > 0 || report.failed > 0 => tracing::info!(
                            checked = report.checked,
                            updated = report.updated,
                            failed = report.failed,
                            "reconciliation sweep corrected drift"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "reconciliation sweep failed"),
                    }
                }
            }
        }
    })
}

/// The running control plane.
pub struct Daemon {
    orchestrator: Orchestrator,
    broker: SessionBroker,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Connects the configured backend and starts the background tasks.
    ///
    /// # Errors
    /// [`DaemonError::Backend`] if the backend cannot be reached.
    pub async fn start(
        config: DaemonConfig,
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, DaemonError> {
        let hypervisor = connect_backend(&config.orchestrator).await?;
        let orchestrator = Orchestrator::new(
            hypervisor,
            Arc::clone(&store),
            Arc::clone(&audit),
            config.orchestrator,
        );
        let broker = SessionBroker::new(store, audit, config.broker);
        let shutdown = CancellationToken::new();

        let tasks = vec![
            broker.spawn_reaper(shutdown.child_token()),
            spawn_sync_loop(orchestrator.clone(), config.sync_interval, shutdown.child_token()),
        ];
        tracing::info!(
            backend = orchestrator.backend_kind(),
            sync_interval = ?config.sync_interval,
            "hearth control plane started"
        );
        Ok(Self { orchestrator, broker, shutdown, tasks })
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn broker(&self) -> &SessionBroker {
        &self.broker
    }

    /// Deletes a VM after ending its console sessions.
    ///
    /// # Errors
    /// Store failures from [`Orchestrator::delete_vm_report`].
    pub async fn delete_vm(&self, name: &str) -> Result<CleanupReport, OrchestratorError> {
        if let Ok(record) = self.orchestrator.get_vm(name).await {
            let ended = self.broker.end_sessions_for_vm(record.id, EndReason::VmDeleted).await;
            if ended > 0 {
                tracing::info!(
                    vm_name = %name,
                    count = ended,
                    "console sessions closed for deleted vm"
                );
            }
        }
        self.orchestrator.delete_vm_report(name).await
    }

    /// Stops the background tasks and waits for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task failed");
            }
        }
        tracing::info!("hearth control plane stopped");
    }
}
