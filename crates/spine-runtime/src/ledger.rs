//! Execution ledger service
//!
//! High-level lifecycle operations over the ledger store: each transition
//! writes exactly one event; terminal transitions carry idempotency keys so
//! a crashed-and-recovered worker cannot double-apply them. Retries create
//! new executions linked by parent_execution_id; the original row is never
//! re-activated.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use spine_core::{ExecutionStatus, Result, SpineError, TriggerSource};
use spine_storage::models::{DeadLetter, Execution, NewDeadLetter, NewExecution, NewExecutionEvent};
use spine_storage::{CoreStore, LedgerStore, StoreError};

/// Lifecycle event types written by the ledger
pub mod events {
    pub const SUBMITTED: &str = "execution.submitted";
    pub const QUEUED: &str = "execution.queued";
    pub const STARTED: &str = "execution.started";
    pub const COMPLETED: &str = "execution.completed";
    pub const FAILED: &str = "execution.failed";
    pub const CANCELLED: &str = "execution.cancelled";
    pub const RETRY_SCHEDULED: &str = "execution.retry_scheduled";
    pub const DEAD_LETTERED: &str = "execution.dead_lettered";
}

/// Outcome of closing out a failed execution
#[derive(Debug)]
pub enum FailureDisposition {
    /// A retry execution was created, leasable after the backoff delay
    WillRetry { next: Execution, delay: Duration },
    /// Retries exhausted; a dead letter was written
    DeadLettered(DeadLetter),
    /// Non-retryable failure; the execution simply stays failed
    Failed,
}

/// High-level ledger operations shared by the executors, worker pool and DLQ
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn CoreStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn CoreStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CoreStore> {
        &self.store
    }

    /// Admit a new execution and write the submitted event
    #[instrument(skip(self, new), fields(pipeline = %new.pipeline))]
    pub async fn admit(&self, new: NewExecution) -> Result<Execution> {
        let lane = new.lane;
        let trigger = new.trigger_source;
        let execution = self.store.insert_execution(new).await?;
        self.store
            .append_event(
                NewExecutionEvent::new(execution.id, events::SUBMITTED).with_payload(json!({
                    "pipeline": execution.pipeline,
                    "lane": lane.as_str(),
                    "trigger_source": trigger.as_str(),
                    "logical_key": execution.logical_key,
                })),
            )
            .await?;
        debug!(execution_id = %execution.id, "execution admitted");
        Ok(execution)
    }

    pub async fn get(&self, id: Uuid) -> Result<Execution> {
        Ok(self.store.get_execution(id).await?)
    }

    /// Queue an admitted execution for the worker pool
    pub async fn mark_queued(&self, id: Uuid) -> Result<Execution> {
        Ok(self
            .store
            .transition(
                id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Queued,
                NewExecutionEvent::new(id, events::QUEUED)
                    .with_idempotency_key(format!("exec:{id}:queued")),
            )
            .await?)
    }

    /// Move to running (inline path; leased workers transition in the lease)
    pub async fn mark_running(&self, id: Uuid) -> Result<Execution> {
        Ok(self
            .store
            .transition(
                id,
                &[ExecutionStatus::Pending, ExecutionStatus::Queued],
                ExecutionStatus::Running,
                NewExecutionEvent::new(id, events::STARTED)
                    .with_idempotency_key(format!("exec:{id}:started")),
            )
            .await?)
    }

    /// Record the started event for an execution leased directly into running
    pub async fn record_started(&self, id: Uuid) -> Result<()> {
        self.store
            .append_event(
                NewExecutionEvent::new(id, events::STARTED)
                    .with_idempotency_key(format!("exec:{id}:started")),
            )
            .await?;
        Ok(())
    }

    /// Terminal success
    pub async fn complete(&self, id: Uuid, metrics: serde_json::Value) -> Result<Execution> {
        let execution = self
            .store
            .record_completion(
                id,
                metrics.clone(),
                NewExecutionEvent::new(id, events::COMPLETED)
                    .with_payload(json!({ "metrics": metrics }))
                    .with_idempotency_key(format!("exec:{id}:completed")),
            )
            .await?;
        info!(execution_id = %id, "execution completed");
        Ok(execution)
    }

    /// Terminal failure; the event carries kind, message and truncated detail
    pub async fn fail(&self, id: Uuid, error: &SpineError) -> Result<Execution> {
        let kind = error.kind().as_str();
        let message = truncate(&error.to_string(), 2000);
        let execution = self
            .store
            .record_failure(
                id,
                kind,
                &message,
                NewExecutionEvent::new(id, events::FAILED)
                    .with_payload(json!({ "kind": kind, "message": message }))
                    .with_idempotency_key(format!("exec:{id}:failed")),
            )
            .await?;
        warn!(execution_id = %id, kind, "execution failed");
        Ok(execution)
    }

    /// Cancel a pre-terminal execution. Terminal rows are not cancellable.
    pub async fn cancel(&self, id: Uuid) -> Result<Execution> {
        let current = self.store.get_execution(id).await?;
        if current.status.is_terminal() {
            return Err(SpineError::NotCancellable(id));
        }

        match self
            .store
            .transition(
                id,
                &[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Queued,
                    ExecutionStatus::Running,
                ],
                ExecutionStatus::Cancelled,
                NewExecutionEvent::new(id, events::CANCELLED)
                    .with_idempotency_key(format!("exec:{id}:cancelled")),
            )
            .await
        {
            Ok(execution) => Ok(execution),
            // Lost the race against a terminal transition
            Err(StoreError::InvalidTransition { .. }) => Err(SpineError::NotCancellable(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Close out a failed execution: schedule a retry when the error is
    /// retryable and attempts remain, dead-letter when the retry budget is
    /// exhausted. Non-retryable failures never dead-letter; they surface to
    /// the caller and the execution simply stays failed.
    #[instrument(skip(self, failed, error), fields(execution_id = %failed.id))]
    pub async fn dispose_failure(
        &self,
        failed: &Execution,
        error: &SpineError,
        backoff: &crate::retry::RetryPolicy,
    ) -> Result<FailureDisposition> {
        if !error.retryable() {
            return Ok(FailureDisposition::Failed);
        }

        let attempts_spent = failed.retry_count;
        if attempts_spent < failed.max_retries {
            let delay = backoff.delay_for_attempt(attempts_spent + 2);
            let next = self.schedule_retry(failed, delay).await?;
            return Ok(FailureDisposition::WillRetry { next, delay });
        }

        let dead_letter = self.dead_letter(failed, error).await?;
        Ok(FailureDisposition::DeadLettered(dead_letter))
    }

    /// Create the next execution in a retry chain
    async fn schedule_retry(&self, failed: &Execution, delay: Duration) -> Result<Execution> {
        let available_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        let next = self
            .store
            .insert_execution(NewExecution {
                pipeline: failed.pipeline.clone(),
                params: failed.params.clone(),
                lane: failed.lane,
                trigger_source: TriggerSource::Retry,
                logical_key: failed.logical_key.clone(),
                idempotency_key: None,
                parent_execution_id: Some(failed.id),
                max_retries: failed.max_retries,
                retry_count: failed.retry_count + 1,
                available_at: Some(available_at),
            })
            .await?;

        self.store
            .append_event(
                NewExecutionEvent::new(failed.id, events::RETRY_SCHEDULED).with_payload(json!({
                    "next_execution_id": next.id,
                    "retry_count": next.retry_count,
                    "delay_ms": delay.as_millis() as u64,
                })),
            )
            .await?;

        info!(
            execution_id = %failed.id,
            next_execution_id = %next.id,
            retry_count = next.retry_count,
            "retry scheduled"
        );
        Ok(next)
    }

    /// Write the dead letter for an exhausted execution
    async fn dead_letter(&self, failed: &Execution, error: &SpineError) -> Result<DeadLetter> {
        let dead_letter = self
            .store
            .insert_dead_letter(NewDeadLetter {
                execution_id: failed.id,
                pipeline: failed.pipeline.clone(),
                params: failed.params.clone(),
                error_kind: error.kind().as_str().to_string(),
                error_message: truncate(&error.to_string(), 2000),
                retry_count: failed.retry_count,
            })
            .await?;

        self.store
            .append_event(
                NewExecutionEvent::new(failed.id, events::DEAD_LETTERED)
                    .with_payload(json!({ "dead_letter_id": dead_letter.id })),
            )
            .await?;

        warn!(execution_id = %failed.id, dead_letter_id = %dead_letter.id, "execution dead-lettered");
        Ok(dead_letter)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use spine_storage::MemoryStore;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let ledger = ledger();
        let execution = ledger
            .admit(NewExecution::new("p", json!({})))
            .await
            .unwrap();

        let running = ledger.mark_running(execution.id).await.unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);

        let done = ledger
            .complete(execution.id, json!({ "records": 10 }))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_rejected() {
        let ledger = ledger();
        let execution = ledger
            .admit(NewExecution::new("p", json!({})))
            .await
            .unwrap();
        ledger.mark_running(execution.id).await.unwrap();
        ledger.complete(execution.id, json!({})).await.unwrap();

        let err = ledger.cancel(execution.id).await.unwrap_err();
        assert!(matches!(err, SpineError::NotCancellable(_)));
    }

    #[tokio::test]
    async fn test_retry_chain_lineage() {
        let ledger = ledger();
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        let execution = ledger
            .admit(NewExecution::new("p", json!({})))
            .await
            .unwrap();
        ledger.mark_running(execution.id).await.unwrap();
        let failed = ledger
            .fail(execution.id, &SpineError::network("reset"))
            .await
            .unwrap();

        let disposition = ledger
            .dispose_failure(&failed, &SpineError::network("reset"), &policy)
            .await
            .unwrap();

        match disposition {
            FailureDisposition::WillRetry { next, .. } => {
                assert_eq!(next.parent_execution_id, Some(failed.id));
                assert_eq!(next.retry_count, 1);
                assert_eq!(next.status, ExecutionStatus::Pending);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let ledger = ledger();
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        let mut new = NewExecution::new("p", json!({}));
        new.retry_count = 3;
        new.max_retries = 3;
        let execution = ledger.admit(new).await.unwrap();
        ledger.mark_running(execution.id).await.unwrap();
        let failed = ledger
            .fail(execution.id, &SpineError::network("reset"))
            .await
            .unwrap();

        let disposition = ledger
            .dispose_failure(&failed, &SpineError::network("reset"), &policy)
            .await
            .unwrap();

        match disposition {
            FailureDisposition::DeadLettered(dl) => {
                assert_eq!(dl.execution_id, failed.id);
                assert_eq!(dl.retry_count, 3);
            }
            other => panic!("expected dead letter, got {other:?}"),
        }

        // The original remains failed forever
        let original = ledger.get(failed.id).await.unwrap();
        assert_eq!(original.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_stays_failed() {
        let ledger = ledger();
        let policy = RetryPolicy::exponential();

        let execution = ledger
            .admit(NewExecution::new("p", json!({})))
            .await
            .unwrap();
        ledger.mark_running(execution.id).await.unwrap();
        let error = SpineError::validation("bad record");
        let failed = ledger.fail(execution.id, &error).await.unwrap();

        let disposition = ledger.dispose_failure(&failed, &error, &policy).await.unwrap();
        assert!(matches!(disposition, FailureDisposition::Failed));
    }

    #[tokio::test]
    async fn test_zero_retry_budget_non_retryable_does_not_dead_letter() {
        // With max_retries=0 the attempt count equals the budget from the
        // start; a non-retryable first failure must still stay a plain
        // failure, not a dead letter.
        let ledger = ledger();
        let policy = RetryPolicy::exponential();

        let mut new = NewExecution::new("p", json!({}));
        new.max_retries = 0;
        let execution = ledger.admit(new).await.unwrap();
        ledger.mark_running(execution.id).await.unwrap();
        let error = SpineError::config("missing required parameter");
        let failed = ledger.fail(execution.id, &error).await.unwrap();

        let disposition = ledger.dispose_failure(&failed, &error, &policy).await.unwrap();
        assert!(matches!(disposition, FailureDisposition::Failed));
    }

    #[tokio::test]
    async fn test_zero_retry_budget_retryable_dead_letters_immediately() {
        let ledger = ledger();
        let policy = RetryPolicy::exponential();

        let mut new = NewExecution::new("p", json!({}));
        new.max_retries = 0;
        let execution = ledger.admit(new).await.unwrap();
        ledger.mark_running(execution.id).await.unwrap();
        let error = SpineError::network("reset");
        let failed = ledger.fail(execution.id, &error).await.unwrap();

        let disposition = ledger.dispose_failure(&failed, &error, &policy).await.unwrap();
        match disposition {
            FailureDisposition::DeadLettered(dl) => assert_eq!(dl.retry_count, 0),
            other => panic!("expected dead letter, got {other:?}"),
        }
    }
}
