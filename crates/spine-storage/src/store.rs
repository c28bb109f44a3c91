//! Store trait definitions
//!
//! The store traits are the dialect seam: `PostgresStore` is the production
//! implementation, `MemoryStore` backs unit tests with identical semantics.
//! Implementations must be thread-safe and support concurrent access.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use spine_core::{ExecutionStatus, Lane, ScheduleRunStatus, StepStatus, WorkItemStatus, WorkflowRunStatus};

use crate::models::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Schedule not found
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// Workflow run not found
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// Dead letter not found
    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(Uuid),

    /// Another live execution holds this logical key
    #[error("duplicate logical key: {0}")]
    DuplicateLogicalKey(String),

    /// The status predicate did not match; the row moved underneath us
    #[error("invalid transition for {id}: expected one of {expected:?}, found {actual}")]
    InvalidTransition {
        id: Uuid,
        expected: Vec<ExecutionStatus>,
        actual: ExecutionStatus,
    },

    /// Monotonicity guard rejected the write (manifest stage rank, watermark)
    #[error("monotonicity violation: {0}")]
    Monotonicity(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for spine_core::SpineError {
    fn from(err: StoreError) -> Self {
        use spine_core::SpineError;
        match err {
            StoreError::ExecutionNotFound(id) => SpineError::NotFound(format!("execution {id}")),
            StoreError::ScheduleNotFound(name) => SpineError::NotFound(format!("schedule {name}")),
            StoreError::RunNotFound(id) => SpineError::NotFound(format!("workflow run {id}")),
            StoreError::DeadLetterNotFound(id) => SpineError::NotFound(format!("dead letter {id}")),
            StoreError::DuplicateLogicalKey(key) => SpineError::DuplicateLogicalKey(key),
            StoreError::InvalidTransition { .. } => SpineError::Orchestration(err.to_string()),
            StoreError::Monotonicity(msg) => SpineError::Validation(msg),
            StoreError::Database(msg) => SpineError::Database(msg),
            StoreError::Serialization(msg) => SpineError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

/// Filter for listing dead letters
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub pipeline: Option<String>,
    pub include_resolved: bool,
}

/// Filter for listing anomalies
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub domain: Option<String>,
    pub partition_key: Option<String>,
    pub min_severity: Option<spine_core::Severity>,
    pub include_resolved: bool,
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Execution ledger: executions, events, dead letters, leases, concurrency locks
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Insert a new execution.
    ///
    /// Relies on the partial unique index over live logical keys: a second
    /// live execution with the same key returns `DuplicateLogicalKey`.
    async fn insert_execution(&self, new: NewExecution) -> Result<Execution, StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError>;

    /// Find an existing execution by (pipeline, idempotency_key) for replay
    async fn find_by_idempotency_key(
        &self,
        pipeline: &str,
        key: &str,
    ) -> Result<Option<Execution>, StoreError>;

    /// Status-guarded transition: updates the row only if its current status
    /// is in `from`, appending exactly one event in the same transaction.
    ///
    /// If the event carries an idempotency key that already exists, the
    /// transition is treated as already applied and the current row is
    /// returned unchanged.
    async fn transition(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        event: NewExecutionEvent,
    ) -> Result<Execution, StoreError>;

    /// Record terminal error details alongside a transition to `failed`
    async fn record_failure(
        &self,
        id: Uuid,
        error_kind: &str,
        error_message: &str,
        event: NewExecutionEvent,
    ) -> Result<Execution, StoreError>;

    /// Record result metrics alongside a transition to `completed`
    async fn record_completion(
        &self,
        id: Uuid,
        metrics: serde_json::Value,
        event: NewExecutionEvent,
    ) -> Result<Execution, StoreError>;

    /// Append a bare event (no status change). Returns false when the
    /// idempotency key already exists.
    async fn append_event(&self, event: NewExecutionEvent) -> Result<bool, StoreError>;

    /// All events for an execution, ordered by (created_at, id)
    async fn list_events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError>;

    /// Lease the next available execution for a worker.
    ///
    /// Orders by lane priority then created_at; uses FOR UPDATE SKIP LOCKED
    /// so exactly one worker wins each row.
    async fn lease_next(
        &self,
        worker_id: &str,
        lanes: &[Lane],
    ) -> Result<Option<Execution>, StoreError>;

    /// Refresh the lease heartbeat. Returns false when the row is no longer
    /// running under this worker.
    async fn heartbeat(&self, execution_id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Running executions whose heartbeat is older than the threshold
    async fn stale_executions(&self, older_than: Duration) -> Result<Vec<Execution>, StoreError>;

    async fn insert_dead_letter(&self, new: NewDeadLetter) -> Result<DeadLetter, StoreError>;

    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetter, StoreError>;

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetter>, StoreError>;

    async fn mark_dead_letter_retried(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark resolved. Returns false when already resolved.
    async fn resolve_dead_letter(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Acquire or refresh a keyed concurrency lease. Expired locks are
    /// reclaimed by any caller; a live lock held by another owner returns
    /// false.
    async fn acquire_lock(
        &self,
        lock_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release a lease held by `owner`. Returns false if not held.
    async fn release_lock(&self, lock_key: &str, owner: &str) -> Result<bool, StoreError>;
}

/// Declarative schedules, their locks, and materialized runs
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    /// Create or update a schedule by unique name
    async fn upsert_schedule(&self, new: NewSchedule) -> Result<Schedule, StoreError>;

    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>, StoreError>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError>;

    async fn set_schedule_enabled(&self, name: &str, enabled: bool) -> Result<bool, StoreError>;

    /// Enabled schedules with next_run_at <= now
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError>;

    /// Insert-or-reclaim the per-schedule tick lock
    async fn try_acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn release_schedule_lock(&self, schedule_id: Uuid, owner: &str)
        -> Result<bool, StoreError>;

    async fn insert_schedule_run(
        &self,
        schedule_id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<ScheduleRun, StoreError>;

    /// One status transition per run
    async fn finish_schedule_run(
        &self,
        run_id: Uuid,
        status: ScheduleRunStatus,
        execution_id: Option<Uuid>,
        reason: Option<String>,
    ) -> Result<(), StoreError>;

    /// Recompute bookkeeping after a firing
    async fn record_schedule_fired(
        &self,
        schedule_id: Uuid,
        last_run_at: DateTime<Utc>,
        last_run_status: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Outstanding submissions for max_instances enforcement: schedule runs
    /// whose execution is still live.
    async fn count_outstanding(&self, schedule_id: Uuid) -> Result<u32, StoreError>;
}

/// Workflow runs, step attempts, and event edges
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    async fn insert_run(
        &self,
        workflow: &str,
        params: serde_json::Value,
        steps_total: u32,
        parent_run_id: Option<Uuid>,
    ) -> Result<WorkflowRun, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError>;

    /// Bump counters after each step
    async fn record_step_outcome(
        &self,
        run_id: Uuid,
        completed: bool,
    ) -> Result<(), StoreError>;

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: WorkflowRunStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// One row per step attempt
    async fn insert_step(
        &self,
        run_id: Uuid,
        name: &str,
        kind: &str,
        attempt: u32,
    ) -> Result<WorkflowStep, StoreError>;

    async fn finish_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError>;

    /// Append-only; returns false on idempotency-key collision
    async fn append_workflow_event(&self, event: NewWorkflowEvent) -> Result<bool, StoreError>;

    async fn list_workflow_events(&self, run_id: Uuid) -> Result<Vec<WorkflowEvent>, StoreError>;
}

/// Manifest, rejects, anomalies, quality, readiness, watermarks, work items,
/// backfill plans
#[async_trait]
pub trait BookkeepingStore: Send + Sync + 'static {
    /// Upsert on (domain, partition_key, stage).
    ///
    /// Stage rank is monotonic: a lower rank than the stored one is
    /// rejected unless the mark is an explicit replace capture.
    async fn mark_manifest(&self, mark: ManifestMark) -> Result<ManifestEntry, StoreError>;

    async fn get_manifest(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<Option<ManifestEntry>, StoreError>;

    async fn list_manifest(
        &self,
        domain: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, StoreError>;

    async fn insert_reject(&self, new: NewReject) -> Result<Reject, StoreError>;

    async fn count_rejects(&self, execution_id: Uuid) -> Result<u64, StoreError>;

    async fn insert_anomaly(&self, new: NewAnomaly) -> Result<Anomaly, StoreError>;

    async fn resolve_anomaly(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn list_anomalies(&self, filter: AnomalyFilter) -> Result<Vec<Anomaly>, StoreError>;

    /// Unresolved CRITICAL anomalies for a partition (readiness precondition)
    async fn has_critical_anomalies(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError>;

    async fn insert_quality(&self, new: NewQualityResult) -> Result<QualityResult, StoreError>;

    async fn list_quality(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<Vec<QualityResult>, StoreError>;

    async fn upsert_readiness(
        &self,
        domain: &str,
        partition_key: &str,
        ready_for: &str,
        is_ready: bool,
        details: Option<serde_json::Value>,
    ) -> Result<DataReadiness, StoreError>;

    async fn get_readiness(
        &self,
        domain: &str,
        partition_key: &str,
        ready_for: &str,
    ) -> Result<Option<DataReadiness>, StoreError>;

    /// Monotonic upsert (lexicographic on the watermark value); non-monotonic
    /// updates are rejected unless forced.
    async fn advance_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        new_high: &str,
        force: bool,
    ) -> Result<Watermark, StoreError>;

    async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, StoreError>;

    /// Idempotent enqueue on (domain, workflow, partition_key)
    async fn enqueue_work_item(
        &self,
        domain: &str,
        workflow: &str,
        partition_key: &str,
    ) -> Result<WorkItem, StoreError>;

    async fn transition_work_item(
        &self,
        id: Uuid,
        status: WorkItemStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn list_work_items(
        &self,
        domain: &str,
        status: Option<WorkItemStatus>,
    ) -> Result<Vec<WorkItem>, StoreError>;

    async fn insert_backfill_plan(&self, new: NewBackfillPlan) -> Result<BackfillPlan, StoreError>;

    async fn update_backfill_status(
        &self,
        plan_id: Uuid,
        status: spine_core::BackfillStatus,
    ) -> Result<(), StoreError>;

    async fn record_backfill_progress(
        &self,
        plan_id: Uuid,
        items_total: u32,
        items_completed: u32,
    ) -> Result<(), StoreError>;

    async fn get_backfill_plan(&self, plan_id: Uuid) -> Result<Option<BackfillPlan>, StoreError>;
}

/// Everything the orchestration runtime needs from persistence
pub trait CoreStore: LedgerStore + ScheduleStore + WorkflowStore + BookkeepingStore {}

impl<T: LedgerStore + ScheduleStore + WorkflowStore + BookkeepingStore> CoreStore for T {}
