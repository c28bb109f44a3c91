//! Dispatcher: the sole admission point
//!
//! All submissions — CLI, HTTP, scheduler, retry — pass through `submit`.
//! Admission is a bounded sequence: resolve pipeline, validate + normalize
//! params, derive the logical key, insert (the partial unique index detects
//! live duplicates), replay on idempotency key, emit the submitted event,
//! route to the lane's executor.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use spine_core::{
    logical_key, validate_params, Lane, ParamNormalizer, Result, SpineError, TriggerSource,
};
use spine_storage::models::{Execution, NewExecution};
use spine_storage::LedgerStore;

use crate::cancel::CancellationRegistry;
use crate::executor::Executor;
use crate::ledger::Ledger;
use crate::registry::PipelineRegistry;

/// A request to run a pipeline
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub pipeline: String,
    pub params: serde_json::Map<String, Value>,
    pub lane: Lane,
    pub trigger_source: TriggerSource,
    pub logical_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub max_retries: Option<u32>,
}

impl SubmitRequest {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            params: serde_json::Map::new(),
            lane: Lane::Normal,
            trigger_source: TriggerSource::Manual,
            logical_key: None,
            idempotency_key: None,
            parent_execution_id: None,
            max_retries: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSource) -> Self {
        self.trigger_source = trigger;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_execution_id = Some(parent);
        self
    }
}

/// The validated admission plan for a request (also the dry-run output)
#[derive(Debug, Clone)]
pub struct AdmissionPlan {
    pub pipeline: String,
    pub params: BTreeMap<String, Value>,
    pub logical_key: String,
    pub lane: Lane,
}

/// The sole admission point for executable work
pub struct Dispatcher {
    registry: Arc<PipelineRegistry>,
    ledger: Ledger,
    executor: Arc<dyn Executor>,
    cancellations: Arc<CancellationRegistry>,
    normalizer: Arc<dyn ParamNormalizer>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        ledger: Ledger,
        executor: Arc<dyn Executor>,
        cancellations: Arc<CancellationRegistry>,
        normalizer: Arc<dyn ParamNormalizer>,
    ) -> Self {
        Self {
            registry,
            ledger,
            executor,
            cancellations,
            normalizer,
        }
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Validate and normalize a request without admitting it.
    ///
    /// This is the first half of `submit`, and the whole of a dry run.
    pub fn plan(&self, request: &SubmitRequest) -> Result<AdmissionPlan> {
        let pipeline = self
            .registry
            .get(&request.pipeline)
            .ok_or_else(|| SpineError::PipelineNotFound(request.pipeline.clone()))?;

        let spec = pipeline.describe();
        let params = validate_params(&spec.all_params(), &request.params, self.normalizer.as_ref())?;

        let key = request
            .logical_key
            .clone()
            .unwrap_or_else(|| logical_key(&request.pipeline, &params));

        Ok(AdmissionPlan {
            pipeline: request.pipeline.clone(),
            params,
            logical_key: key,
            lane: request.lane,
        })
    }

    /// Admit and route a submission.
    ///
    /// Returns the terminal execution in sync mode, the queued snapshot in
    /// async mode. An idempotency-key match replays the existing execution
    /// without inserting a new row.
    #[instrument(skip(self, request), fields(pipeline = %request.pipeline))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Execution> {
        let plan = self.plan(&request)?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self
                .ledger
                .store()
                .find_by_idempotency_key(&request.pipeline, key)
                .await?
            {
                debug!(execution_id = %existing.id, key, "idempotency replay");
                return Ok(existing);
            }
        }

        let spec_max_retries = self
            .registry
            .get(&request.pipeline)
            .map(|p| p.describe().max_retries)
            .unwrap_or(None);

        let execution = self
            .ledger
            .admit(NewExecution {
                pipeline: plan.pipeline,
                params: Value::Object(plan.params.into_iter().collect()),
                lane: plan.lane,
                trigger_source: request.trigger_source,
                logical_key: Some(plan.logical_key),
                idempotency_key: request.idempotency_key,
                parent_execution_id: request.parent_execution_id,
                max_retries: request.max_retries.or(spec_max_retries).unwrap_or(3),
                retry_count: 0,
                available_at: None,
            })
            .await?;

        info!(
            execution_id = %execution.id,
            pipeline = %execution.pipeline,
            lane = %execution.lane,
            "submission admitted"
        );

        self.executor.execute(execution).await
    }

    /// Cancel a pre-terminal execution and signal its worker.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool> {
        self.ledger.cancel(execution_id).await?;
        // Cooperative: a worker mid-I/O observes the token at its next
        // suspension point.
        self.cancellations.cancel(execution_id);
        Ok(true)
    }

    /// Snapshot of an execution
    pub async fn status(&self, execution_id: Uuid) -> Result<Execution> {
        self.ledger.get(execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationRegistry;
    use crate::executor::InlineExecutor;
    use crate::testsupport::{register_noop, test_runner};
    use serde_json::json;
    use spine_core::{ExecutionStatus, TierDateNormalizer};

    fn dispatcher() -> Dispatcher {
        let (runner, ledger, registry) = test_runner(|r| register_noop(r, "finra.ingest"));
        let cancellations = Arc::new(CancellationRegistry::new());
        let executor = Arc::new(InlineExecutor::new(runner, cancellations.clone()));
        Dispatcher::new(
            registry,
            ledger,
            executor,
            cancellations,
            Arc::new(TierDateNormalizer),
        )
    }

    #[tokio::test]
    async fn test_submit_unknown_pipeline() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .submit(SubmitRequest::new("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_submit_invalid_params() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .submit(SubmitRequest::new("finra.ingest").with_param("bogus", 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn test_sync_submit_returns_terminal() {
        let dispatcher = dispatcher();
        let execution = dispatcher
            .submit(SubmitRequest::new("finra.ingest").with_param("week_ending", "2025-12-19"))
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.logical_key.is_some());
    }

    #[tokio::test]
    async fn test_idempotency_key_replays_same_execution() {
        let dispatcher = dispatcher();
        let request = SubmitRequest::new("finra.ingest")
            .with_param("week_ending", "2025-12-19")
            .with_idempotency_key("submit-once");

        let first = dispatcher.submit(request.clone()).await.unwrap();
        let second = dispatcher.submit(request).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_plan_normalizes_aliases() {
        let dispatcher = dispatcher();
        let plan = dispatcher
            .plan(
                &SubmitRequest::new("finra.ingest")
                    .with_param("tier", "t1")
                    .with_param("week_ending", "20251219"),
            )
            .unwrap();
        assert_eq!(plan.params.get("tier"), Some(&json!("NMS_TIER_1")));
        assert_eq!(plan.params.get("week_ending"), Some(&json!("2025-12-19")));

        // Aliased and canonical spellings derive the same logical key
        let canonical = dispatcher
            .plan(
                &SubmitRequest::new("finra.ingest")
                    .with_param("tier", "NMS_TIER_1")
                    .with_param("week_ending", "2025-12-19"),
            )
            .unwrap();
        assert_eq!(plan.logical_key, canonical.logical_key);
    }

    #[tokio::test]
    async fn test_duplicate_logical_key_in_async_mode() {
        // Pooled mode leaves the first submission live, so the second hits
        // the partial unique index.
        let (runner, ledger, registry) = test_runner(|r| register_noop(r, "finra.ingest"));
        let cancellations = Arc::new(CancellationRegistry::new());
        let executor = Arc::new(crate::executor::PooledExecutor::new(runner));
        let dispatcher = Dispatcher::new(
            registry,
            ledger,
            executor,
            cancellations,
            Arc::new(TierDateNormalizer),
        );

        let request = SubmitRequest::new("finra.ingest").with_param("week_ending", "2025-12-19");
        let first = dispatcher.submit(request.clone()).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Queued);

        let err = dispatcher.submit(request).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_LOGICAL_KEY");
    }

    #[tokio::test]
    async fn test_cancel_queued_execution() {
        let (runner, ledger, registry) = test_runner(|r| register_noop(r, "finra.ingest"));
        let cancellations = Arc::new(CancellationRegistry::new());
        let executor = Arc::new(crate::executor::PooledExecutor::new(runner));
        let dispatcher = Dispatcher::new(
            registry,
            ledger,
            executor,
            cancellations,
            Arc::new(TierDateNormalizer),
        );

        let queued = dispatcher
            .submit(SubmitRequest::new("finra.ingest"))
            .await
            .unwrap();
        assert!(dispatcher.cancel(queued.id).await.unwrap());

        let cancelled = dispatcher.status(queued.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

        // Terminal executions are not cancellable
        let err = dispatcher.cancel(queued.id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_CANCELLABLE");
    }

    #[tokio::test]
    async fn test_status_not_found() {
        let dispatcher = dispatcher();
        let err = dispatcher.status(Uuid::now_v7()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
