//! Pipeline runtime
//!
//! Drives one execution end to end: transition to running, build the
//! context, invoke the pipeline under the hard timeout with cooperative
//! cancellation, classify the outcome, and close the ledger entry (terminal
//! transition plus retry chain or dead letter).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use spine_core::{ExecutionStatus, Result, SpineError};
use spine_storage::models::Execution;
use spine_storage::{CoreStore, Database, LedgerStore, StoreError};

use crate::cancel::CancellationRegistry;
use crate::ledger::{FailureDisposition, Ledger};
use crate::pipeline::PipelineContext;
use crate::registry::PipelineRegistry;
use crate::retry::RetryPolicy;

/// Outcome of driving one execution
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Execution),
    Cancelled(Execution),
    /// Failed; a retry execution was created
    FailedWillRetry {
        failed: Execution,
        next: Execution,
        delay: Duration,
    },
    /// Failed; retries exhausted, dead letter written
    DeadLettered(Execution),
    /// Failed with a non-retryable error
    Failed(Execution),
}

impl RunOutcome {
    /// The execution this outcome settles (the retry, when one was created,
    /// is separate and still pending).
    pub fn execution(&self) -> &Execution {
        match self {
            RunOutcome::Completed(e)
            | RunOutcome::Cancelled(e)
            | RunOutcome::DeadLettered(e)
            | RunOutcome::Failed(e) => e,
            RunOutcome::FailedWillRetry { failed, .. } => failed,
        }
    }

    pub fn next_attempt(&self) -> Option<&Execution> {
        match self {
            RunOutcome::FailedWillRetry { next, .. } => Some(next),
            _ => None,
        }
    }
}

/// Runs registered pipelines against the ledger
pub struct PipelineRunner {
    registry: Arc<PipelineRegistry>,
    ledger: Ledger,
    cancellations: Arc<CancellationRegistry>,
    db: Option<Database>,
    default_timeout: Duration,
    backoff: RetryPolicy,
}

impl PipelineRunner {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        store: Arc<dyn CoreStore>,
        cancellations: Arc<CancellationRegistry>,
        db: Option<Database>,
        default_timeout: Duration,
        backoff: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            ledger: Ledger::new(store),
            cancellations,
            db,
            default_timeout,
            backoff,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Drive one execution to a terminal state.
    ///
    /// Accepts the row in pending, queued (inline path) or running (already
    /// leased by a worker).
    #[instrument(skip(self, execution), fields(execution_id = %execution.id, pipeline = %execution.pipeline))]
    pub async fn run_execution(&self, execution: Execution) -> Result<RunOutcome> {
        let execution = match execution.status {
            ExecutionStatus::Running => {
                self.ledger.record_started(execution.id).await?;
                execution
            }
            ExecutionStatus::Pending | ExecutionStatus::Queued => {
                match self.ledger.mark_running(execution.id).await {
                    Ok(e) => e,
                    // Cancelled between admission and start
                    Err(SpineError::Orchestration(_)) => {
                        let current = self.ledger.get(execution.id).await?;
                        if current.status == ExecutionStatus::Cancelled {
                            return Ok(RunOutcome::Cancelled(current));
                        }
                        return Err(SpineError::orchestration(format!(
                            "execution {} in unexpected status {}",
                            current.id, current.status
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
            status => {
                return Err(SpineError::orchestration(format!(
                    "execution {} already terminal ({status})",
                    execution.id
                )))
            }
        };

        let token = self.cancellations.token_for(execution.id);
        let result = self.invoke_pipeline(&execution, token.clone()).await;
        self.cancellations.remove(execution.id);

        match result {
            Ok(metrics) => {
                match self.ledger.complete(execution.id, metrics).await {
                    Ok(done) => Ok(RunOutcome::Completed(done)),
                    // A cancel can land between the last write and this
                    // transition; the cancel wins.
                    Err(SpineError::Orchestration(_)) => {
                        let current = self.ledger.get(execution.id).await?;
                        if current.status == ExecutionStatus::Cancelled {
                            Ok(RunOutcome::Cancelled(current))
                        } else {
                            Err(SpineError::orchestration(format!(
                                "completion rejected for {} in status {}",
                                current.id, current.status
                            )))
                        }
                    }
                    Err(e) => Err(e),
                }
            }
            Err(SpineError::Cancelled) => {
                // The dispatcher may have already set cancelled; tolerate
                // losing that race.
                match self.ledger.cancel(execution.id).await {
                    Ok(e) => Ok(RunOutcome::Cancelled(e)),
                    Err(SpineError::NotCancellable(_)) => {
                        Ok(RunOutcome::Cancelled(self.ledger.get(execution.id).await?))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(error) => {
                let failed = match self.ledger.fail(execution.id, &error).await {
                    Ok(e) => e,
                    // Cancelled mid-flight: the failure lost the race
                    Err(SpineError::Orchestration(_)) => {
                        let current = self.ledger.get(execution.id).await?;
                        if current.status == ExecutionStatus::Cancelled {
                            return Ok(RunOutcome::Cancelled(current));
                        }
                        error!(execution_id = %execution.id, "failed to record failure");
                        return Err(error);
                    }
                    Err(e) => return Err(e),
                };

                match self
                    .ledger
                    .dispose_failure(&failed, &error, &self.backoff)
                    .await?
                {
                    FailureDisposition::WillRetry { next, delay } => {
                        Ok(RunOutcome::FailedWillRetry {
                            failed,
                            next,
                            delay,
                        })
                    }
                    FailureDisposition::DeadLettered(_) => Ok(RunOutcome::DeadLettered(failed)),
                    FailureDisposition::Failed => Ok(RunOutcome::Failed(failed)),
                }
            }
        }
    }

    /// Invoke the pipeline body under timeout + cancellation
    async fn invoke_pipeline(
        &self,
        execution: &Execution,
        token: tokio_util::sync::CancellationToken,
    ) -> Result<Value> {
        let pipeline = self
            .registry
            .get(&execution.pipeline)
            .ok_or_else(|| SpineError::PipelineNotFound(execution.pipeline.clone()))?;

        let spec = pipeline.describe();
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let params: BTreeMap<String, Value> = match &execution.params {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => BTreeMap::new(),
        };

        let ctx = PipelineContext::new(
            self.ledger.store().clone(),
            self.db.clone(),
            execution.id,
            execution.batch_id,
            token.clone(),
        );

        debug!(execution_id = %execution.id, ?timeout, "invoking pipeline");

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SpineError::Cancelled),
            result = tokio::time::timeout(timeout, pipeline.run(&params, &ctx)) => {
                match result {
                    Ok(Ok(result)) => {
                        let mut metrics = result.metrics.clone();
                        if !result.capture_ids.is_empty() {
                            metrics.insert(
                                "capture_ids".to_string(),
                                Value::from(
                                    result
                                        .capture_ids
                                        .iter()
                                        .map(|c| c.as_str().to_string())
                                        .collect::<Vec<_>>(),
                                ),
                            );
                        }
                        if let Some(resolution) = result.ingest_resolution {
                            metrics.insert("ingest_resolution".to_string(), resolution);
                        }
                        Ok(Value::Object(metrics))
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(SpineError::Timeout(timeout)),
                }
            }
        }
    }

    /// Resolve the next execution of a retry chain once its backoff has
    /// elapsed (inline mode re-runs it in-process).
    pub async fn refetch(&self, id: Uuid) -> Result<Execution> {
        match self.ledger.store().get_execution(id).await {
            Ok(e) => Ok(e),
            Err(StoreError::ExecutionNotFound(_)) => {
                Err(SpineError::NotFound(format!("execution {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, PipelineResult, PipelineSpec};
    use crate::testsupport::{register_flaky, register_noop, test_runner};
    use async_trait::async_trait;
    use serde_json::json;
    use spine_storage::models::NewExecution;
    use spine_storage::MemoryStore;

    #[tokio::test]
    async fn test_happy_path_completes_with_metrics() {
        let (runner, ledger, _registry) = test_runner(|registry| {
            register_noop(registry, "noop");
        });

        let execution = ledger
            .admit(NewExecution::new("noop", json!({})))
            .await
            .unwrap();
        let outcome = runner.run_execution(execution).await.unwrap();

        match outcome {
            RunOutcome::Completed(e) => {
                assert_eq!(e.status, ExecutionStatus::Completed);
                let metrics = e.metrics.unwrap();
                assert_eq!(metrics["records"], json!(3));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let (runner, ledger, _registry) = test_runner(|registry| {
            register_flaky(registry, "flaky", u32::MAX);
        });

        let execution = ledger
            .admit(NewExecution::new("flaky", json!({})))
            .await
            .unwrap();
        let outcome = runner.run_execution(execution).await.unwrap();

        match outcome {
            RunOutcome::FailedWillRetry { failed, next, .. } => {
                assert_eq!(failed.status, ExecutionStatus::Failed);
                assert_eq!(next.parent_execution_id, Some(failed.id));
                assert_eq!(next.retry_count, 1);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_pipeline_is_error() {
        let (runner, ledger, _registry) = test_runner(|_| {});

        let execution = ledger
            .admit(NewExecution::new("ghost", json!({})))
            .await
            .unwrap();
        let outcome = runner.run_execution(execution).await.unwrap();

        // The pipeline lookup failure is an ORCHESTRATION failure recorded
        // on the ledger, not a panic.
        match outcome {
            RunOutcome::Failed(e) => {
                assert_eq!(e.error_kind.as_deref(), Some("ORCHESTRATION"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    struct SlowPipeline;

    #[async_trait]
    impl Pipeline for SlowPipeline {
        fn name(&self) -> &str {
            "slow"
        }

        fn describe(&self) -> PipelineSpec {
            PipelineSpec::new("slow").with_timeout(Duration::from_millis(20))
        }

        async fn run(
            &self,
            _params: &BTreeMap<String, Value>,
            _ctx: &PipelineContext,
        ) -> Result<PipelineResult> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(PipelineResult::new())
        }
    }

    #[tokio::test]
    async fn test_timeout_fails_execution() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PipelineRegistry::new());
        registry.register(Arc::new(SlowPipeline));
        let runner = PipelineRunner::new(
            registry,
            store.clone(),
            Arc::new(CancellationRegistry::new()),
            None,
            Duration::from_secs(3600),
            RetryPolicy::no_retry(),
        );

        let execution = runner
            .ledger()
            .admit(NewExecution::new("slow", json!({})))
            .await
            .unwrap();
        let outcome = runner.run_execution(execution).await.unwrap();

        let failed = outcome.execution();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error_kind.as_deref(), Some("TRANSIENT_NETWORK"));
    }

    struct BlockingPipeline;

    #[async_trait]
    impl Pipeline for BlockingPipeline {
        fn name(&self) -> &str {
            "blocking"
        }

        fn describe(&self) -> PipelineSpec {
            PipelineSpec::new("blocking")
        }

        async fn run(
            &self,
            _params: &BTreeMap<String, Value>,
            ctx: &PipelineContext,
        ) -> Result<PipelineResult> {
            // Cooperative suspension point
            ctx.cancellation_token().cancelled().await;
            Err(SpineError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_cancellation_during_run() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PipelineRegistry::new());
        registry.register(Arc::new(BlockingPipeline));
        let cancellations = Arc::new(CancellationRegistry::new());
        let runner = Arc::new(PipelineRunner::new(
            registry,
            store.clone(),
            cancellations.clone(),
            None,
            Duration::from_secs(3600),
            RetryPolicy::no_retry(),
        ));

        let execution = runner
            .ledger()
            .admit(NewExecution::new("blocking", json!({})))
            .await
            .unwrap();
        let id = execution.id;

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run_execution(execution).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellations.cancel(id);

        let outcome = handle.await.unwrap().unwrap();
        match outcome {
            RunOutcome::Cancelled(e) => assert_eq!(e.status, ExecutionStatus::Cancelled),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
