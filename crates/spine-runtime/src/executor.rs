//! Executor seam
//!
//! The Dispatcher never knows whether execution is inline or pooled; it
//! routes admitted work to an Executor chosen at startup by capability flag.
//! Sync and async never mix in one code path.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use spine_core::{Capabilities, Result};
use spine_storage::models::Execution;

use crate::cancel::CancellationRegistry;
use crate::runner::{PipelineRunner, RunOutcome};

/// How submissions behave, observable via capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// `submit` blocks until the run is terminal
    Sync,
    /// `submit` returns immediately; the worker pool leases the row
    Async,
}

/// Drives an admitted execution according to the deployment tier
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Execute or enqueue. Sync mode returns the terminal execution; async
    /// mode returns the queued snapshot.
    async fn execute(&self, execution: Execution) -> Result<Execution>;

    fn mode(&self) -> ExecutionMode;
}

/// Basic tier: one caller thread runs the execution inline to completion,
/// including the retry chain with cancellation-aware backoff sleeps.
pub struct InlineExecutor {
    runner: Arc<PipelineRunner>,
    cancellations: Arc<CancellationRegistry>,
}

impl InlineExecutor {
    pub fn new(runner: Arc<PipelineRunner>, cancellations: Arc<CancellationRegistry>) -> Self {
        Self {
            runner,
            cancellations,
        }
    }
}

#[async_trait]
impl Executor for InlineExecutor {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn execute(&self, execution: Execution) -> Result<Execution> {
        let mut current = execution;

        loop {
            let outcome = self.runner.run_execution(current).await?;
            match outcome {
                RunOutcome::Completed(e)
                | RunOutcome::Cancelled(e)
                | RunOutcome::DeadLettered(e)
                | RunOutcome::Failed(e) => return Ok(e),
                RunOutcome::FailedWillRetry { next, delay, .. } => {
                    debug!(next_execution_id = %next.id, ?delay, "waiting out retry backoff");
                    // Backoff is a suspension point: a cancel of the pending
                    // retry wakes the sleep and ends the chain.
                    let token = self.cancellations.token_for(next.id);
                    tokio::select! {
                        _ = token.cancelled() => {
                            let cancelled = self.runner.ledger().cancel(next.id).await?;
                            return Ok(cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {
                            let refreshed = self.runner.refetch(next.id).await?;
                            if refreshed.status.is_terminal() {
                                return Ok(refreshed);
                            }
                            current = refreshed;
                        }
                    }
                }
            }
        }
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Sync
    }
}

/// Intermediate/full tier: submissions queue; the worker pool leases them.
pub struct PooledExecutor {
    runner: Arc<PipelineRunner>,
}

impl PooledExecutor {
    pub fn new(runner: Arc<PipelineRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Executor for PooledExecutor {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn execute(&self, execution: Execution) -> Result<Execution> {
        let queued = self.runner.ledger().mark_queued(execution.id).await?;
        debug!(execution_id = %queued.id, "queued for worker pool");
        Ok(queued)
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }
}

/// Select the executor for the deployment tier
pub fn create_executor(
    capabilities: Capabilities,
    runner: Arc<PipelineRunner>,
    cancellations: Arc<CancellationRegistry>,
) -> Arc<dyn Executor> {
    if capabilities.async_execution {
        Arc::new(PooledExecutor::new(runner))
    } else {
        Arc::new(InlineExecutor::new(runner, cancellations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{register_flaky, register_noop, test_runner};
    use serde_json::json;
    use spine_core::ExecutionStatus;
    use spine_storage::models::NewExecution;
    use spine_storage::LedgerStore;

    #[tokio::test]
    async fn test_inline_executor_runs_to_terminal() {
        let (runner, ledger, _registry) = test_runner(|r| register_noop(r, "noop"));
        let executor = InlineExecutor::new(runner, Arc::new(CancellationRegistry::new()));

        let execution = ledger
            .admit(NewExecution::new("noop", json!({})))
            .await
            .unwrap();
        let done = executor.execute(execution).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_inline_executor_drains_retry_chain() {
        // Fails twice, succeeds on the third attempt; backoff is ~1ms.
        let (runner, ledger, _registry) = test_runner(|r| register_flaky(r, "flaky", 2));
        let executor = InlineExecutor::new(runner, Arc::new(CancellationRegistry::new()));

        let execution = ledger
            .admit(NewExecution::new("flaky", json!({})))
            .await
            .unwrap();
        let done = executor.execute(execution).await.unwrap();

        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.retry_count, 2);
        assert!(done.parent_execution_id.is_some());
    }

    #[tokio::test]
    async fn test_pooled_executor_returns_queued() {
        let (runner, ledger, _registry) = test_runner(|r| register_noop(r, "noop"));
        let executor = PooledExecutor::new(runner);

        let execution = ledger
            .admit(NewExecution::new("noop", json!({})))
            .await
            .unwrap();
        let queued = executor.execute(execution).await.unwrap();
        assert_eq!(queued.status, ExecutionStatus::Queued);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_ends_chain() {
        let (runner, ledger, _registry) = test_runner(|r| register_flaky(r, "flaky", u32::MAX));
        let cancellations = Arc::new(CancellationRegistry::new());

        // Slow the backoff down so the cancel lands inside it.
        let store = ledger.store().clone();
        let slow_runner = Arc::new(crate::runner::PipelineRunner::new(
            {
                let registry = Arc::new(crate::registry::PipelineRegistry::new());
                register_flaky(&registry, "flaky", u32::MAX);
                registry
            },
            store,
            cancellations.clone(),
            None,
            std::time::Duration::from_secs(3600),
            crate::retry::RetryPolicy::fixed(std::time::Duration::from_secs(30), 4),
        ));
        drop(runner);
        let executor = Arc::new(InlineExecutor::new(slow_runner, cancellations.clone()));

        let execution = ledger
            .admit(NewExecution::new("flaky", json!({})))
            .await
            .unwrap();
        let first_id = execution.id;

        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(execution).await })
        };

        // Wait for the first attempt to fail and the retry to be scheduled,
        // then cancel the pending retry.
        let retry = loop {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let events = ledger.store().list_events(first_id).await.unwrap();
            if let Some(event) = events
                .iter()
                .find(|e| e.event_type == crate::ledger::events::RETRY_SCHEDULED)
            {
                let id: uuid::Uuid =
                    serde_json::from_value(event.payload["next_execution_id"].clone()).unwrap();
                break id;
            }
        };
        cancellations.cancel(retry);

        let ended = handle.await.unwrap().unwrap();
        assert_eq!(ended.status, ExecutionStatus::Cancelled);
        assert_eq!(ended.id, retry);
    }
}
