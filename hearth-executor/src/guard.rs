//! Bounded-concurrency and deadline guard around hypervisor calls.
//!
//! Every hypervisor operation is admitted through one shared semaphore. A
//! caller that cannot get a slot within the admission timeout fails fast
//! with [`OrchestratorError::Overloaded`]. An admitted operation runs in its
//! own task holding the slot; if it outlives the execution timeout the
//! caller gets [`OrchestratorError::Timeout`] while the task keeps running
//! and keeps its slot until it finishes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::config::GuardConfig;
use crate::OrchestratorError;

/// Admission-controlled runner for hypervisor operations.
///
/// Cloning shares the underlying slot pool.
#[derive(Debug, Clone)]
pub struct OperationGuard {
    slots: Arc<Semaphore>,
    capacity: usize,
    admission_timeout: Duration,
    execution_timeout: Duration,
}

impl OperationGuard {
    /// Creates a guard with `capacity` slots (at least one).
    #[must_use]
    pub fn new(capacity: usize, admission_timeout: Duration, execution_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            admission_timeout,
            execution_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new(config.capacity, config.admission_timeout, config.execution_timeout)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held by an executing operation.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Runs `fut` once a slot is free.
    ///
    /// # Errors
    /// - [`OrchestratorError::Overloaded`] if no slot frees up within the
    ///   admission timeout; `fut` never runs.
    /// - [`OrchestratorError::Timeout`] if `fut` does not finish within the
    ///   execution timeout. Its outcome is unknown.
    /// - [`OrchestratorError::Internal`] if `fut` panics.
    /// - Whatever `fut` itself returns.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, OrchestratorError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
    {
        let acquire = Arc::clone(&self.slots).acquire_owned();
        let permit = match tokio::time::timeout(self.admission_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(OrchestratorError::Internal("operation guard closed".to_owned()));
            }
            Err(_) => {
                tracing::warn!(
                    operation,
                    waited = ?self.admission_timeout,
                    "hypervisor operation queued too long, too many concurrent operations"
                );
                return Err(OrchestratorError::Overloaded {
                    operation,
                    waited: self.admission_timeout,
                });
            }
        };

        let task = tokio::spawn(async move {
            let result = fut.await;
            drop(permit);
            result
        });

        match tokio::time::timeout(self.execution_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                tracing::error!(operation, error = %join_err, "hypervisor operation task failed");
                Err(OrchestratorError::Internal(format!("{operation} task failed: {join_err}")))
            }
            Err(_) => {
                tracing::warn!(
                    operation,
                    timeout = ?self.execution_timeout,
                    "hypervisor operation ran too long, abandoning wait"
                );
                Err(OrchestratorError::Timeout { operation, limit: self.execution_timeout })
            }
        }
    }
}

impl Default for OperationGuard {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn guard_returns_inner_result() {
        let guard = OperationGuard::default();
        let value = guard.run("noop", async { Ok(41 + 1) }).await;
        assert!(matches!(value, Ok(42)));
        assert_eq!(guard.available(), 5, "slot must be returned after completion");
    }

    #[tokio::test]
    async fn guard_propagates_inner_error() {
        let guard = OperationGuard::default();
        let result: Result<(), _> = guard
            .run("fail", async { Err(OrchestratorError::Conflict("busy".to_owned())) })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Conflict(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_times_out_but_keeps_slot_until_inner_finishes() {
        let guard = OperationGuard::new(1, Duration::from_secs(1), Duration::from_secs(2));
        let result: Result<(), _> = guard
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Timeout { operation: "slow", .. })));
        assert_eq!(guard.available(), 0, "timed-out call must still hold its slot");

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(guard.available(), 1, "slot must be released once the inner call ends");
    }

    #[tokio::test(start_paused = true)]
    async fn guard_rejects_when_full_past_admission_timeout() {
        let guard = OperationGuard::new(1, Duration::from_secs(1), Duration::from_secs(30));
        let busy = guard.clone();
        let holder = tokio::spawn(async move {
            busy.run("hold", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
        });
        tokio::task::yield_now().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let result = guard
            .run("second", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Overloaded { operation: "second", .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0, "rejected operation must not run");

        assert!(matches!(holder.await, Ok(Ok(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_admits_waiter_once_slot_frees() {
        let guard = OperationGuard::new(1, Duration::from_secs(5), Duration::from_secs(30));
        let busy = guard.clone();
        let holder = tokio::spawn(async move {
            busy.run("hold", async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(())
            })
            .await
        });
        tokio::task::yield_now().await;

        let result = guard.run("waiter", async { Ok("admitted") }).await;
        assert!(matches!(result, Ok("admitted")));
        assert!(matches!(holder.await, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn guard_never_exceeds_capacity() {
        let guard = OperationGuard::new(3, Duration::from_secs(10), Duration::from_secs(10));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let guard = guard.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                guard
                    .run("count", async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            assert!(matches!(task.await, Ok(Ok(()))));
        }
        assert!(peak.load(Ordering::SeqCst) <= 3, "peak concurrency exceeded capacity");
    }
}
