// Typed rows and insert inputs for the core tables.
//
// Statuses are parsed from TEXT columns at the store boundary so everything
// above the store traits works with real enums, never raw strings.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use spine_core::{
    BackfillStatus, ExecutionStatus, Lane, QualityOutcome, ScheduleRunStatus, Severity,
    StepStatus, TriggerSource, WorkItemStatus, WorkflowRunStatus,
};

// ============================================
// Execution ledger
// ============================================

/// One row of `core_executions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub pipeline: String,
    pub params: Value,
    pub lane: Lane,
    pub trigger_source: TriggerSource,
    pub logical_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub batch_id: Uuid,
    pub status: ExecutionStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub metrics: Option<Value>,
    pub available_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Input for admitting a new execution
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub pipeline: String,
    pub params: Value,
    pub lane: Lane,
    pub trigger_source: TriggerSource,
    pub logical_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Delayed visibility for retry backoff; None means leasable immediately
    pub available_at: Option<DateTime<Utc>>,
}

impl NewExecution {
    pub fn new(pipeline: impl Into<String>, params: Value) -> Self {
        Self {
            pipeline: pipeline.into(),
            params,
            lane: Lane::Normal,
            trigger_source: TriggerSource::Manual,
            logical_key: None,
            idempotency_key: None,
            parent_execution_id: None,
            max_retries: 3,
            retry_count: 0,
            available_at: None,
        }
    }
}

/// One row of `core_execution_events` (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for appending an execution event
#[derive(Debug, Clone)]
pub struct NewExecutionEvent {
    pub execution_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

impl NewExecutionEvent {
    pub fn new(execution_id: Uuid, event_type: impl Into<String>) -> Self {
        Self {
            execution_id,
            event_type: event_type.into(),
            payload: Value::Object(Default::default()),
            idempotency_key: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// One row of `core_dead_letters`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub pipeline: String,
    pub params: Value,
    pub error_kind: String,
    pub error_message: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input for dead-lettering an exhausted execution
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub params: Value,
    pub error_kind: String,
    pub error_message: String,
    pub retry_count: u32,
}

// ============================================
// Scheduler
// ============================================

/// One row of `core_schedules`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub pipeline: String,
    pub params: Value,
    pub lane: Lane,
    pub cron: String,
    pub timezone: String,
    pub enabled: bool,
    pub max_instances: u32,
    pub misfire_grace_secs: u64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for declaring a schedule (upsert on name)
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub pipeline: String,
    pub params: Value,
    pub lane: Lane,
    pub cron: String,
    pub timezone: String,
    pub enabled: bool,
    pub max_instances: u32,
    pub misfire_grace_secs: u64,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// One row of `core_schedule_runs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub status: ScheduleRunStatus,
    pub execution_id: Option<Uuid>,
    pub reason: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================
// Workflow runner
// ============================================

/// One row of `core_workflow_runs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow: String,
    pub params: Value,
    pub status: WorkflowRunStatus,
    pub steps_total: u32,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub error: Option<String>,
    pub parent_run_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One per-attempt row of `core_workflow_steps`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub kind: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One row of `core_workflow_events` (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for appending a workflow event
#[derive(Debug, Clone)]
pub struct NewWorkflowEvent {
    pub run_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

// ============================================
// Bookkeeping
// ============================================

/// One row of `core_manifest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub stage_rank: i32,
    pub row_count: i64,
    pub metrics: Value,
    pub capture_id: Option<String>,
    pub execution_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for marking a manifest stage complete
#[derive(Debug, Clone)]
pub struct ManifestMark {
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub stage_rank: i32,
    pub row_count: i64,
    pub metrics: Value,
    pub capture_id: Option<String>,
    pub execution_id: Uuid,
    pub batch_id: Option<Uuid>,
    /// Explicit replace capture: permits stage-rank regression
    pub replace: bool,
}

/// One row of `core_rejects` (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reject {
    pub id: Uuid,
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub reason_code: String,
    pub reason_detail: Option<String>,
    pub record_key: Option<String>,
    pub raw: Value,
    pub execution_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Input for recording a reject
#[derive(Debug, Clone)]
pub struct NewReject {
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub reason_code: String,
    pub reason_detail: Option<String>,
    pub record_key: Option<String>,
    pub raw: Value,
    pub execution_id: Uuid,
}

/// One row of `core_anomalies`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub domain: String,
    pub workflow: Option<String>,
    pub partition_key: Option<String>,
    pub stage: Option<String>,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub details: Option<Value>,
    pub affected_records: Option<i64>,
    pub execution_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input for recording an anomaly
#[derive(Debug, Clone)]
pub struct NewAnomaly {
    pub domain: String,
    pub workflow: Option<String>,
    pub partition_key: Option<String>,
    pub stage: Option<String>,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub details: Option<Value>,
    pub affected_records: Option<i64>,
    pub execution_id: Option<Uuid>,
}

impl NewAnomaly {
    pub fn new(
        domain: impl Into<String>,
        severity: Severity,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            workflow: None,
            partition_key: None,
            stage: None,
            severity,
            category: category.into(),
            message: message.into(),
            details: None,
            affected_records: None,
            execution_id: None,
        }
    }

    pub fn with_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One row of `core_quality` (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityResult {
    pub id: Uuid,
    pub domain: String,
    pub partition_key: String,
    pub check_name: String,
    pub outcome: QualityOutcome,
    pub actual: Option<f64>,
    pub expected: Option<f64>,
    pub details: Option<Value>,
    pub execution_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Input for recording a quality result
#[derive(Debug, Clone)]
pub struct NewQualityResult {
    pub domain: String,
    pub partition_key: String,
    pub check_name: String,
    pub outcome: QualityOutcome,
    pub actual: Option<f64>,
    pub expected: Option<f64>,
    pub details: Option<Value>,
    pub execution_id: Uuid,
}

/// One row of `core_work_items`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub domain: String,
    pub workflow: String,
    pub partition_key: String,
    pub status: WorkItemStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of `core_data_readiness`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReadiness {
    pub domain: String,
    pub partition_key: String,
    pub ready_for: String,
    pub is_ready: bool,
    pub details: Option<Value>,
    pub certified_at: DateTime<Utc>,
}

/// One row of `core_watermarks`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermark {
    pub domain: String,
    pub source: String,
    pub partition_key: String,
    pub high_watermark: String,
    pub updated_at: DateTime<Utc>,
}

/// One row of `core_backfill_plans`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillPlan {
    pub plan_id: Uuid,
    pub domain: String,
    pub workflow: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub lane: Lane,
    pub status: BackfillStatus,
    pub items_total: u32,
    pub items_completed: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a backfill plan
#[derive(Debug, Clone)]
pub struct NewBackfillPlan {
    pub domain: String,
    pub workflow: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub lane: Lane,
}
