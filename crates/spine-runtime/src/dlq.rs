//! Dead-letter queue operations
//!
//! Terminal failures after retry exhaustion. Operators inspect, retry or
//! resolve. A retry admits a fresh execution through the Dispatcher with
//! `parent_execution_id` pointing at the dead execution; the original row
//! stays failed forever.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use spine_core::{Result, SpineError, TriggerSource};
use spine_storage::models::{DeadLetter, Execution};
use spine_storage::{CoreStore, DeadLetterFilter, LedgerStore, Pagination};

use crate::dispatcher::{Dispatcher, SubmitRequest};

/// Operator surface over `core_dead_letters`
pub struct DlqService {
    store: Arc<dyn CoreStore>,
    dispatcher: Arc<Dispatcher>,
}

impl DlqService {
    pub fn new(store: Arc<dyn CoreStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub async fn list(
        &self,
        pipeline: Option<String>,
        include_resolved: bool,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetter>> {
        Ok(self
            .store
            .list_dead_letters(
                DeadLetterFilter {
                    pipeline,
                    include_resolved,
                },
                pagination,
            )
            .await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<DeadLetter> {
        Ok(self.store.get_dead_letter(id).await?)
    }

    /// Replay a dead letter as a fresh execution.
    ///
    /// Does not revive the dead-lettered execution; lineage is preserved via
    /// `parent_execution_id`.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: Uuid) -> Result<Execution> {
        let dead_letter = self.store.get_dead_letter(id).await?;
        if dead_letter.resolved_at.is_some() {
            return Err(SpineError::orchestration(format!(
                "dead letter {id} is already resolved"
            )));
        }

        let params = match &dead_letter.params {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };

        let execution = self
            .dispatcher
            .submit(SubmitRequest {
                pipeline: dead_letter.pipeline.clone(),
                params,
                lane: spine_core::Lane::Normal,
                trigger_source: TriggerSource::Retry,
                logical_key: None,
                idempotency_key: None,
                parent_execution_id: Some(dead_letter.execution_id),
                max_retries: None,
            })
            .await?;

        self.store
            .mark_dead_letter_retried(id, Utc::now())
            .await?;

        info!(
            dead_letter_id = %id,
            execution_id = %execution.id,
            "dead letter replayed"
        );
        Ok(execution)
    }

    /// Mark resolved without replaying. Returns false when already resolved.
    pub async fn resolve(&self, id: Uuid) -> Result<bool> {
        Ok(self.store.resolve_dead_letter(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationRegistry;
    use crate::executor::InlineExecutor;
    use crate::testsupport::{register_flaky, test_runner};
    use serde_json::json;
    use spine_core::{ExecutionStatus, TierDateNormalizer};
    use spine_storage::models::NewDeadLetter;

    fn fixture(fail_times: u32) -> (DlqService, Arc<dyn CoreStore>, Arc<Dispatcher>) {
        let (runner, ledger, registry) = test_runner(|r| register_flaky(r, "flaky", fail_times));
        let store = ledger.store().clone();
        let cancellations = Arc::new(CancellationRegistry::new());
        let executor = Arc::new(InlineExecutor::new(runner, cancellations.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            ledger,
            executor,
            cancellations,
            Arc::new(TierDateNormalizer),
        ));
        (
            DlqService::new(store.clone(), dispatcher.clone()),
            store,
            dispatcher,
        )
    }

    #[tokio::test]
    async fn test_exhausted_chain_lands_in_dlq() {
        // Fails forever: retries exhaust and the chain dead-letters.
        let (dlq, _store, dispatcher) = fixture(u32::MAX);

        let terminal = dispatcher
            .submit(SubmitRequest::new("flaky").with_param("week_ending", "2025-12-19"))
            .await
            .unwrap();
        assert_eq!(terminal.status, ExecutionStatus::Failed);
        assert_eq!(terminal.retry_count, 3);

        let entries = dlq.list(None, false, Pagination::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].execution_id, terminal.id);
        assert_eq!(entries[0].retry_count, 3);
    }

    #[tokio::test]
    async fn test_retry_preserves_lineage() {
        // The first chain exhausts its 4 attempts; the replay succeeds.
        let (dlq, store, dispatcher) = fixture(4);

        let terminal = dispatcher
            .submit(SubmitRequest::new("flaky"))
            .await
            .unwrap();
        let entry = dlq
            .list(None, false, Pagination::default())
            .await
            .unwrap()
            .remove(0);

        let replay = dlq.retry(entry.id).await.unwrap();
        assert_eq!(replay.status, ExecutionStatus::Completed);
        assert_eq!(replay.parent_execution_id, Some(entry.execution_id));

        // The original stays failed forever
        let original = store.get_execution(terminal.id).await.unwrap();
        assert_eq!(original.status, ExecutionStatus::Failed);

        let refreshed = dlq.get(entry.id).await.unwrap();
        assert!(refreshed.last_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_resolve_is_one_shot() {
        let (dlq, store, _dispatcher) = fixture(0);
        let execution = store
            .insert_execution(spine_storage::models::NewExecution::new("flaky", json!({})))
            .await
            .unwrap();
        let entry = store
            .insert_dead_letter(NewDeadLetter {
                execution_id: execution.id,
                pipeline: "flaky".to_string(),
                params: json!({}),
                error_kind: "TRANSIENT_NETWORK".to_string(),
                error_message: "reset".to_string(),
                retry_count: 3,
            })
            .await
            .unwrap();

        assert!(dlq.resolve(entry.id).await.unwrap());
        assert!(!dlq.resolve(entry.id).await.unwrap());

        // Resolved entries cannot be replayed
        let err = dlq.retry(entry.id).await.unwrap_err();
        assert_eq!(err.kind(), spine_core::ErrorKind::Orchestration);
    }
}
