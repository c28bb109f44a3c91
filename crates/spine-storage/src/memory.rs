//! In-memory implementation of the core store traits for testing
//!
//! Provides the same semantics as the PostgreSQL implementation — live
//! logical-key uniqueness, status-guarded transitions, idempotent event
//! appends, single-winner leasing, TTL locks, monotonic bookkeeping — with
//! all state behind parking_lot RwLocks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use spine_core::{
    BackfillStatus, ExecutionStatus, Lane, ScheduleRunStatus, Severity, StepStatus,
    WorkItemStatus, WorkflowRunStatus,
};

use crate::models::*;
use crate::store::*;

type LockEntry = (String, DateTime<Utc>);

/// In-memory store. Primarily for unit tests of the orchestration runtime.
#[derive(Default)]
pub struct MemoryStore {
    executions: RwLock<HashMap<Uuid, Execution>>,
    events: RwLock<Vec<ExecutionEvent>>,
    dead_letters: RwLock<HashMap<Uuid, DeadLetter>>,
    locks: RwLock<HashMap<String, LockEntry>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    schedule_locks: RwLock<HashMap<Uuid, LockEntry>>,
    schedule_runs: RwLock<HashMap<Uuid, ScheduleRun>>,
    workflow_runs: RwLock<HashMap<Uuid, WorkflowRun>>,
    workflow_steps: RwLock<HashMap<Uuid, WorkflowStep>>,
    workflow_events: RwLock<Vec<WorkflowEvent>>,
    manifest: RwLock<HashMap<(String, String, String), ManifestEntry>>,
    rejects: RwLock<Vec<Reject>>,
    anomalies: RwLock<HashMap<Uuid, Anomaly>>,
    quality: RwLock<Vec<QualityResult>>,
    readiness: RwLock<HashMap<(String, String, String), DataReadiness>>,
    watermarks: RwLock<HashMap<(String, String, String), Watermark>>,
    work_items: RwLock<HashMap<Uuid, WorkItem>>,
    backfills: RwLock<HashMap<Uuid, BackfillPlan>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.read().len()
    }

    fn event_key_exists(&self, key: &str) -> bool {
        self.events
            .read()
            .iter()
            .any(|e| e.idempotency_key.as_deref() == Some(key))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write();

        if let Some(key) = &new.logical_key {
            let live_duplicate = executions
                .values()
                .any(|e| e.logical_key.as_ref() == Some(key) && e.status.is_live());
            if live_duplicate {
                return Err(StoreError::DuplicateLogicalKey(key.clone()));
            }
        }

        let execution = Execution {
            id: Uuid::now_v7(),
            pipeline: new.pipeline,
            params: new.params,
            lane: new.lane,
            trigger_source: new.trigger_source,
            logical_key: new.logical_key,
            idempotency_key: new.idempotency_key,
            parent_execution_id: new.parent_execution_id,
            batch_id: Uuid::now_v7(),
            status: ExecutionStatus::Pending,
            retry_count: new.retry_count,
            max_retries: new.max_retries,
            error_kind: None,
            error_message: None,
            metrics: None,
            available_at: new.available_at.unwrap_or_else(Utc::now),
            locked_by: None,
            heartbeat_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.executions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn find_by_idempotency_key(
        &self,
        pipeline: &str,
        key: &str,
    ) -> Result<Option<Execution>, StoreError> {
        Ok(self
            .executions
            .read()
            .values()
            .find(|e| e.pipeline == pipeline && e.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        event: NewExecutionEvent,
    ) -> Result<Execution, StoreError> {
        self.transition_inner(id, from, to, event, None, None)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error_kind: &str,
        error_message: &str,
        event: NewExecutionEvent,
    ) -> Result<Execution, StoreError> {
        self.transition_inner(
            id,
            &[ExecutionStatus::Running],
            ExecutionStatus::Failed,
            event,
            Some((error_kind.to_string(), error_message.to_string())),
            None,
        )
    }

    async fn record_completion(
        &self,
        id: Uuid,
        metrics: serde_json::Value,
        event: NewExecutionEvent,
    ) -> Result<Execution, StoreError> {
        self.transition_inner(
            id,
            &[ExecutionStatus::Running],
            ExecutionStatus::Completed,
            event,
            None,
            Some(metrics),
        )
    }

    async fn append_event(&self, event: NewExecutionEvent) -> Result<bool, StoreError> {
        if let Some(key) = &event.idempotency_key {
            if self.event_key_exists(key) {
                return Ok(false);
            }
        }
        self.events.write().push(ExecutionEvent {
            id: Uuid::now_v7(),
            execution_id: event.execution_id,
            event_type: event.event_type,
            payload: event.payload,
            idempotency_key: event.idempotency_key,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn list_events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError> {
        let mut events: Vec<ExecutionEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(events)
    }

    async fn lease_next(
        &self,
        worker_id: &str,
        lanes: &[Lane],
    ) -> Result<Option<Execution>, StoreError> {
        let now = Utc::now();
        let mut executions = self.executions.write();

        let mut candidates: Vec<&Execution> = executions
            .values()
            .filter(|e| {
                matches!(e.status, ExecutionStatus::Pending | ExecutionStatus::Queued)
                    && e.available_at <= now
                    && lanes.contains(&e.lane)
            })
            .collect();
        candidates.sort_by_key(|e| (e.lane.priority(), e.created_at));

        let Some(id) = candidates.first().map(|e| e.id) else {
            return Ok(None);
        };

        let execution = executions.get_mut(&id).expect("candidate exists");
        execution.status = ExecutionStatus::Running;
        execution.locked_by = Some(worker_id.to_string());
        execution.started_at.get_or_insert(now);
        execution.heartbeat_at = Some(now);
        Ok(Some(execution.clone()))
    }

    async fn heartbeat(&self, execution_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        match executions.get_mut(&execution_id) {
            Some(e)
                if e.status == ExecutionStatus::Running
                    && e.locked_by.as_deref() == Some(worker_id) =>
            {
                e.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stale_executions(&self, older_than: Duration) -> Result<Vec<Execution>, StoreError> {
        let threshold = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        Ok(self
            .executions
            .read()
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Running
                    && e.heartbeat_at.map(|h| h < threshold).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn insert_dead_letter(&self, new: NewDeadLetter) -> Result<DeadLetter, StoreError> {
        let dead_letter = DeadLetter {
            id: Uuid::now_v7(),
            execution_id: new.execution_id,
            pipeline: new.pipeline,
            params: new.params,
            error_kind: new.error_kind,
            error_message: new.error_message,
            retry_count: new.retry_count,
            created_at: Utc::now(),
            last_retry_at: None,
            resolved_at: None,
        };
        self.dead_letters
            .write()
            .insert(dead_letter.id, dead_letter.clone());
        Ok(dead_letter)
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetter, StoreError> {
        self.dead_letters
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::DeadLetterNotFound(id))
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let mut entries: Vec<DeadLetter> = self
            .dead_letters
            .read()
            .values()
            .filter(|d| {
                filter
                    .pipeline
                    .as_ref()
                    .map(|p| &d.pipeline == p)
                    .unwrap_or(true)
                    && (filter.include_resolved || d.resolved_at.is_none())
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn mark_dead_letter_retried(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(d) = self.dead_letters.write().get_mut(&id) {
            d.last_retry_at = Some(at);
        }
        Ok(())
    }

    async fn resolve_dead_letter(&self, id: Uuid) -> Result<bool, StoreError> {
        match self.dead_letters.write().get_mut(&id) {
            Some(d) if d.resolved_at.is_none() => {
                d.resolved_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn acquire_lock(
        &self,
        lock_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut locks = self.locks.write();

        match locks.get(lock_key) {
            Some((held_by, held_until)) if *held_until >= now && held_by != owner => Ok(false),
            _ => {
                locks.insert(lock_key.to_string(), (owner.to_string(), expires_at));
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, lock_key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.write();
        match locks.get(lock_key) {
            Some((held_by, _)) if held_by == owner => {
                locks.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl MemoryStore {
    fn transition_inner(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        event: NewExecutionEvent,
        failure: Option<(String, String)>,
        metrics: Option<serde_json::Value>,
    ) -> Result<Execution, StoreError> {
        if let Some(key) = &event.idempotency_key {
            if self.event_key_exists(key) {
                // Duplicate idempotency key: the transition already happened.
                return self
                    .executions
                    .read()
                    .get(&id)
                    .cloned()
                    .ok_or(StoreError::ExecutionNotFound(id));
            }
        }

        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if !from.contains(&execution.status) {
            return Err(StoreError::InvalidTransition {
                id,
                expected: from.to_vec(),
                actual: execution.status,
            });
        }

        execution.status = to;
        let now = Utc::now();
        if to == ExecutionStatus::Running {
            execution.started_at.get_or_insert(now);
        }
        if to.is_terminal() {
            execution.finished_at = Some(now);
        }
        if let Some((kind, message)) = failure {
            execution.error_kind = Some(kind);
            execution.error_message = Some(message);
        }
        if let Some(metrics) = metrics {
            execution.metrics = Some(metrics);
        }
        let snapshot = execution.clone();
        drop(executions);

        self.events.write().push(ExecutionEvent {
            id: Uuid::now_v7(),
            execution_id: event.execution_id,
            event_type: event.event_type,
            payload: event.payload,
            idempotency_key: event.idempotency_key,
            created_at: now,
        });

        Ok(snapshot)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn upsert_schedule(&self, new: NewSchedule) -> Result<Schedule, StoreError> {
        let mut schedules = self.schedules.write();
        let now = Utc::now();

        if let Some(existing) = schedules.values_mut().find(|s| s.name == new.name) {
            existing.pipeline = new.pipeline;
            existing.params = new.params;
            existing.lane = new.lane;
            existing.cron = new.cron;
            existing.timezone = new.timezone;
            existing.enabled = new.enabled;
            existing.max_instances = new.max_instances;
            existing.misfire_grace_secs = new.misfire_grace_secs;
            existing.next_run_at = new.next_run_at;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let schedule = Schedule {
            id: Uuid::now_v7(),
            name: new.name,
            pipeline: new.pipeline,
            params: new.params,
            lane: new.lane,
            cron: new.cron,
            timezone: new.timezone,
            enabled: new.enabled,
            max_instances: new.max_instances,
            misfire_grace_secs: new.misfire_grace_secs,
            next_run_at: new.next_run_at,
            last_run_at: None,
            last_run_status: None,
            created_at: now,
            updated_at: now,
        };
        schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>, StoreError> {
        Ok(self
            .schedules
            .read()
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut schedules: Vec<Schedule> = self.schedules.read().values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    async fn set_schedule_enabled(&self, name: &str, enabled: bool) -> Result<bool, StoreError> {
        let mut schedules = self.schedules.write();
        match schedules.values_mut().find(|s| s.name == name) {
            Some(s) => {
                s.enabled = enabled;
                s.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.enabled && s.next_run_at.map(|n| n <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn try_acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut locks = self.schedule_locks.write();

        match locks.get(&schedule_id) {
            Some((held_by, held_until)) if *held_until >= now && held_by != owner => Ok(false),
            _ => {
                locks.insert(schedule_id, (owner.to_string(), expires_at));
                Ok(true)
            }
        }
    }

    async fn release_schedule_lock(
        &self,
        schedule_id: Uuid,
        owner: &str,
    ) -> Result<bool, StoreError> {
        let mut locks = self.schedule_locks.write();
        match locks.get(&schedule_id) {
            Some((held_by, _)) if held_by == owner => {
                locks.remove(&schedule_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_schedule_run(
        &self,
        schedule_id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<ScheduleRun, StoreError> {
        let now = Utc::now();
        let run = ScheduleRun {
            id: Uuid::now_v7(),
            schedule_id,
            status: ScheduleRunStatus::Pending,
            execution_id: None,
            reason: None,
            scheduled_for,
            created_at: now,
            updated_at: now,
        };
        self.schedule_runs.write().insert(run.id, run.clone());
        Ok(run)
    }

    async fn finish_schedule_run(
        &self,
        run_id: Uuid,
        status: ScheduleRunStatus,
        execution_id: Option<Uuid>,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        let mut runs = self.schedule_runs.write();
        if let Some(run) = runs.get_mut(&run_id) {
            if run.status == ScheduleRunStatus::Pending {
                run.status = status;
                run.execution_id = execution_id;
                run.reason = reason;
                run.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn record_schedule_fired(
        &self,
        schedule_id: Uuid,
        last_run_at: DateTime<Utc>,
        last_run_status: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if let Some(s) = self.schedules.write().get_mut(&schedule_id) {
            s.last_run_at = Some(last_run_at);
            s.last_run_status = Some(last_run_status.to_string());
            s.next_run_at = next_run_at;
            s.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn count_outstanding(&self, schedule_id: Uuid) -> Result<u32, StoreError> {
        let executions = self.executions.read();
        let count = self
            .schedule_runs
            .read()
            .values()
            .filter(|r| r.schedule_id == schedule_id)
            .filter_map(|r| r.execution_id)
            .filter(|eid| {
                executions
                    .get(eid)
                    .map(|e| e.status.is_live())
                    .unwrap_or(false)
            })
            .count();
        Ok(count as u32)
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn insert_run(
        &self,
        workflow: &str,
        params: serde_json::Value,
        steps_total: u32,
        parent_run_id: Option<Uuid>,
    ) -> Result<WorkflowRun, StoreError> {
        let run = WorkflowRun {
            run_id: Uuid::now_v7(),
            workflow: workflow.to_string(),
            params,
            status: WorkflowRunStatus::Running,
            steps_total,
            steps_completed: 0,
            steps_failed: 0,
            error: None,
            parent_run_id,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.workflow_runs.write().insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        self.workflow_runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn record_step_outcome(&self, run_id: Uuid, completed: bool) -> Result<(), StoreError> {
        if let Some(run) = self.workflow_runs.write().get_mut(&run_id) {
            if completed {
                run.steps_completed += 1;
            } else {
                run.steps_failed += 1;
            }
        }
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: WorkflowRunStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        if let Some(run) = self.workflow_runs.write().get_mut(&run_id) {
            if run.status == WorkflowRunStatus::Running {
                run.status = status;
                run.error = error;
                run.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn insert_step(
        &self,
        run_id: Uuid,
        name: &str,
        kind: &str,
        attempt: u32,
    ) -> Result<WorkflowStep, StoreError> {
        let step = WorkflowStep {
            step_id: Uuid::now_v7(),
            run_id,
            name: name.to_string(),
            kind: kind.to_string(),
            attempt,
            status: StepStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.workflow_steps.write().insert(step.step_id, step.clone());
        Ok(step)
    }

    async fn finish_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        if let Some(step) = self.workflow_steps.write().get_mut(&step_id) {
            step.status = status;
            step.output = output;
            step.error = error;
            step.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let mut steps: Vec<WorkflowStep> = self
            .workflow_steps
            .read()
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| (a.started_at, a.step_id).cmp(&(b.started_at, b.step_id)));
        Ok(steps)
    }

    async fn append_workflow_event(&self, event: NewWorkflowEvent) -> Result<bool, StoreError> {
        if let Some(key) = &event.idempotency_key {
            let exists = self
                .workflow_events
                .read()
                .iter()
                .any(|e| e.idempotency_key.as_deref() == Some(key));
            if exists {
                return Ok(false);
            }
        }
        self.workflow_events.write().push(WorkflowEvent {
            id: Uuid::now_v7(),
            run_id: event.run_id,
            event_type: event.event_type,
            payload: event.payload,
            idempotency_key: event.idempotency_key,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn list_workflow_events(&self, run_id: Uuid) -> Result<Vec<WorkflowEvent>, StoreError> {
        let mut events: Vec<WorkflowEvent> = self
            .workflow_events
            .read()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(events)
    }
}

#[async_trait]
impl BookkeepingStore for MemoryStore {
    async fn mark_manifest(&self, mark: ManifestMark) -> Result<ManifestEntry, StoreError> {
        let key = (
            mark.domain.clone(),
            mark.partition_key.clone(),
            mark.stage.clone(),
        );
        let mut manifest = self.manifest.write();

        if !mark.replace {
            let max_rank = manifest
                .iter()
                .filter(|((d, p, _), _)| *d == mark.domain && *p == mark.partition_key)
                .map(|(_, e)| e.stage_rank)
                .max();
            let stage_exists = manifest.contains_key(&key);
            if let Some(max_rank) = max_rank {
                if mark.stage_rank < max_rank && !stage_exists {
                    return Err(StoreError::Monotonicity(format!(
                        "manifest stage '{}' (rank {}) regresses below rank {} for {}/{}",
                        mark.stage, mark.stage_rank, max_rank, mark.domain, mark.partition_key
                    )));
                }
            }
        }

        let now = Utc::now();
        let entry = manifest
            .entry(key)
            .and_modify(|e| {
                e.stage_rank = mark.stage_rank;
                e.row_count = mark.row_count;
                e.metrics = mark.metrics.clone();
                e.capture_id = mark.capture_id.clone();
                e.execution_id = mark.execution_id;
                e.batch_id = mark.batch_id;
                e.updated_at = now;
            })
            .or_insert_with(|| ManifestEntry {
                domain: mark.domain.clone(),
                partition_key: mark.partition_key.clone(),
                stage: mark.stage.clone(),
                stage_rank: mark.stage_rank,
                row_count: mark.row_count,
                metrics: mark.metrics.clone(),
                capture_id: mark.capture_id.clone(),
                execution_id: mark.execution_id,
                batch_id: mark.batch_id,
                created_at: now,
                updated_at: now,
            });
        Ok(entry.clone())
    }

    async fn get_manifest(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<Option<ManifestEntry>, StoreError> {
        Ok(self
            .manifest
            .read()
            .get(&(domain.to_string(), partition_key.to_string(), stage.to_string()))
            .cloned())
    }

    async fn list_manifest(
        &self,
        domain: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut entries: Vec<ManifestEntry> = self
            .manifest
            .read()
            .values()
            .filter(|e| e.domain == domain && partition_key.map(|p| e.partition_key == p).unwrap_or(true))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            (a.partition_key.as_str(), a.stage_rank).cmp(&(b.partition_key.as_str(), b.stage_rank))
        });
        Ok(entries)
    }

    async fn insert_reject(&self, new: NewReject) -> Result<Reject, StoreError> {
        let reject = Reject {
            id: Uuid::now_v7(),
            domain: new.domain,
            partition_key: new.partition_key,
            stage: new.stage,
            reason_code: new.reason_code,
            reason_detail: new.reason_detail,
            record_key: new.record_key,
            raw: new.raw,
            execution_id: new.execution_id,
            created_at: Utc::now(),
        };
        self.rejects.write().push(reject.clone());
        Ok(reject)
    }

    async fn count_rejects(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .rejects
            .read()
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .count() as u64)
    }

    async fn insert_anomaly(&self, new: NewAnomaly) -> Result<Anomaly, StoreError> {
        let anomaly = Anomaly {
            id: Uuid::now_v7(),
            domain: new.domain,
            workflow: new.workflow,
            partition_key: new.partition_key,
            stage: new.stage,
            severity: new.severity,
            category: new.category,
            message: new.message,
            details: new.details,
            affected_records: new.affected_records,
            execution_id: new.execution_id,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.anomalies.write().insert(anomaly.id, anomaly.clone());
        Ok(anomaly)
    }

    async fn resolve_anomaly(&self, id: Uuid) -> Result<bool, StoreError> {
        match self.anomalies.write().get_mut(&id) {
            Some(a) if a.resolved_at.is_none() => {
                a.resolved_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_anomalies(&self, filter: AnomalyFilter) -> Result<Vec<Anomaly>, StoreError> {
        let mut anomalies: Vec<Anomaly> = self
            .anomalies
            .read()
            .values()
            .filter(|a| {
                filter.domain.as_ref().map(|d| &a.domain == d).unwrap_or(true)
                    && filter
                        .partition_key
                        .as_ref()
                        .map(|p| a.partition_key.as_ref() == Some(p))
                        .unwrap_or(true)
                    && (filter.include_resolved || a.resolved_at.is_none())
                    && filter.min_severity.map(|s| a.severity >= s).unwrap_or(true)
            })
            .cloned()
            .collect();
        anomalies.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(anomalies)
    }

    async fn has_critical_anomalies(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.anomalies.read().values().any(|a| {
            a.domain == domain
                && a.partition_key.as_deref() == Some(partition_key)
                && a.severity == Severity::Critical
                && a.resolved_at.is_none()
        }))
    }

    async fn insert_quality(&self, new: NewQualityResult) -> Result<QualityResult, StoreError> {
        let result = QualityResult {
            id: Uuid::now_v7(),
            domain: new.domain,
            partition_key: new.partition_key,
            check_name: new.check_name,
            outcome: new.outcome,
            actual: new.actual,
            expected: new.expected,
            details: new.details,
            execution_id: new.execution_id,
            created_at: Utc::now(),
        };
        self.quality.write().push(result.clone());
        Ok(result)
    }

    async fn list_quality(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<Vec<QualityResult>, StoreError> {
        Ok(self
            .quality
            .read()
            .iter()
            .filter(|q| q.domain == domain && q.partition_key == partition_key)
            .cloned()
            .collect())
    }

    async fn upsert_readiness(
        &self,
        domain: &str,
        partition_key: &str,
        ready_for: &str,
        is_ready: bool,
        details: Option<serde_json::Value>,
    ) -> Result<DataReadiness, StoreError> {
        let readiness = DataReadiness {
            domain: domain.to_string(),
            partition_key: partition_key.to_string(),
            ready_for: ready_for.to_string(),
            is_ready,
            details,
            certified_at: Utc::now(),
        };
        self.readiness.write().insert(
            (
                domain.to_string(),
                partition_key.to_string(),
                ready_for.to_string(),
            ),
            readiness.clone(),
        );
        Ok(readiness)
    }

    async fn get_readiness(
        &self,
        domain: &str,
        partition_key: &str,
        ready_for: &str,
    ) -> Result<Option<DataReadiness>, StoreError> {
        Ok(self
            .readiness
            .read()
            .get(&(
                domain.to_string(),
                partition_key.to_string(),
                ready_for.to_string(),
            ))
            .cloned())
    }

    async fn advance_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        new_high: &str,
        force: bool,
    ) -> Result<Watermark, StoreError> {
        let key = (
            domain.to_string(),
            source.to_string(),
            partition_key.to_string(),
        );
        let mut watermarks = self.watermarks.write();

        if let Some(existing) = watermarks.get(&key) {
            if !force && existing.high_watermark.as_str() > new_high {
                return Err(StoreError::Monotonicity(format!(
                    "watermark for {domain}/{source}/{partition_key} would move backwards to '{new_high}'"
                )));
            }
        }

        let watermark = Watermark {
            domain: domain.to_string(),
            source: source.to_string(),
            partition_key: partition_key.to_string(),
            high_watermark: new_high.to_string(),
            updated_at: Utc::now(),
        };
        watermarks.insert(key, watermark.clone());
        Ok(watermark)
    }

    async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, StoreError> {
        Ok(self
            .watermarks
            .read()
            .get(&(
                domain.to_string(),
                source.to_string(),
                partition_key.to_string(),
            ))
            .cloned())
    }

    async fn enqueue_work_item(
        &self,
        domain: &str,
        workflow: &str,
        partition_key: &str,
    ) -> Result<WorkItem, StoreError> {
        let mut items = self.work_items.write();

        if let Some(existing) = items.values_mut().find(|i| {
            i.domain == domain && i.workflow == workflow && i.partition_key == partition_key
        }) {
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let item = WorkItem {
            id: Uuid::now_v7(),
            domain: domain.to_string(),
            workflow: workflow.to_string(),
            partition_key: partition_key.to_string(),
            status: WorkItemStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn transition_work_item(
        &self,
        id: Uuid,
        status: WorkItemStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        if let Some(item) = self.work_items.write().get_mut(&id) {
            if status == WorkItemStatus::InProgress {
                item.attempts += 1;
            }
            item.status = status;
            item.last_error = error;
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_work_items(
        &self,
        domain: &str,
        status: Option<WorkItemStatus>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut items: Vec<WorkItem> = self
            .work_items
            .read()
            .values()
            .filter(|i| i.domain == domain && status.map(|s| i.status == s).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by_key(|i| i.created_at);
        Ok(items)
    }

    async fn insert_backfill_plan(&self, new: NewBackfillPlan) -> Result<BackfillPlan, StoreError> {
        let now = Utc::now();
        let plan = BackfillPlan {
            plan_id: Uuid::now_v7(),
            domain: new.domain,
            workflow: new.workflow,
            start_date: new.start_date,
            end_date: new.end_date,
            lane: new.lane,
            status: BackfillStatus::Pending,
            items_total: 0,
            items_completed: 0,
            created_at: now,
            updated_at: now,
        };
        self.backfills.write().insert(plan.plan_id, plan.clone());
        Ok(plan)
    }

    async fn update_backfill_status(
        &self,
        plan_id: Uuid,
        status: BackfillStatus,
    ) -> Result<(), StoreError> {
        if let Some(plan) = self.backfills.write().get_mut(&plan_id) {
            plan.status = status;
            plan.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_backfill_progress(
        &self,
        plan_id: Uuid,
        items_total: u32,
        items_completed: u32,
    ) -> Result<(), StoreError> {
        if let Some(plan) = self.backfills.write().get_mut(&plan_id) {
            plan.items_total = items_total;
            plan.items_completed = items_completed;
            plan.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_backfill_plan(&self, plan_id: Uuid) -> Result<Option<BackfillPlan>, StoreError> {
        Ok(self.backfills.read().get(&plan_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_live_logical_key_uniqueness() {
        let store = MemoryStore::new();
        let mut new = NewExecution::new("p", json!({}));
        new.logical_key = Some("p:abc".to_string());

        store.insert_execution(new.clone()).await.unwrap();
        let err = store.insert_execution(new.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateLogicalKey(_)));
    }

    #[tokio::test]
    async fn test_logical_key_reusable_after_terminal() {
        let store = MemoryStore::new();
        let mut new = NewExecution::new("p", json!({}));
        new.logical_key = Some("p:abc".to_string());

        let first = store.insert_execution(new.clone()).await.unwrap();
        store
            .transition(
                first.id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Cancelled,
                NewExecutionEvent::new(first.id, "execution.cancelled"),
            )
            .await
            .unwrap();

        // Terminal rows free the key for a new live execution.
        store.insert_execution(new).await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_edge() {
        let store = MemoryStore::new();
        let execution = store
            .insert_execution(NewExecution::new("p", json!({})))
            .await
            .unwrap();

        let err = store
            .transition(
                execution.id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Completed,
                NewExecutionEvent::new(execution.id, "execution.completed"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_idempotent_transition_replay() {
        let store = MemoryStore::new();
        let execution = store
            .insert_execution(NewExecution::new("p", json!({})))
            .await
            .unwrap();

        let event = NewExecutionEvent::new(execution.id, "execution.queued")
            .with_idempotency_key("queue-once");
        store
            .transition(
                execution.id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Queued,
                event.clone(),
            )
            .await
            .unwrap();

        // Replay with the same key: no error, no second event, state unchanged.
        let replayed = store
            .transition(
                execution.id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Queued,
                event,
            )
            .await
            .unwrap();
        assert_eq!(replayed.status, ExecutionStatus::Queued);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_lease_orders_by_lane_priority() {
        let store = MemoryStore::new();
        let mut backfill = NewExecution::new("p", json!({}));
        backfill.lane = Lane::Backfill;
        let mut realtime = NewExecution::new("p", json!({}));
        realtime.lane = Lane::Realtime;

        store.insert_execution(backfill).await.unwrap();
        let rt = store.insert_execution(realtime).await.unwrap();

        let leased = store
            .lease_next("w1", &[Lane::Normal, Lane::Backfill, Lane::Realtime])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, rt.id);
    }

    #[tokio::test]
    async fn test_lease_single_winner() {
        let store = MemoryStore::new();
        store
            .insert_execution(NewExecution::new("p", json!({})))
            .await
            .unwrap();

        let first = store.lease_next("w1", &[Lane::Normal]).await.unwrap();
        let second = store.lease_next("w2", &[Lane::Normal]).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_lock_ttl_reclaim() {
        let store = MemoryStore::new();
        assert!(store
            .acquire_lock("finra.otc:NMS_TIER_1:w1", "a", Duration::from_secs(0))
            .await
            .unwrap());
        // Expired immediately; another owner may reclaim.
        assert!(store
            .acquire_lock("finra.otc:NMS_TIER_1:w1", "b", Duration::from_secs(60))
            .await
            .unwrap());
        // Live lock held by b: contended for a.
        assert!(!store
            .acquire_lock("finra.otc:NMS_TIER_1:w1", "a", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_manifest_monotonicity() {
        let store = MemoryStore::new();
        let exec_id = Uuid::now_v7();
        let mark = |stage: &str, rank: i32, replace: bool| ManifestMark {
            domain: "finra.otc".to_string(),
            partition_key: "tier=NMS_TIER_1&week_ending=2025-12-19".to_string(),
            stage: stage.to_string(),
            stage_rank: rank,
            row_count: 10,
            metrics: json!({}),
            capture_id: None,
            execution_id: exec_id,
            batch_id: None,
            replace,
        };

        store.mark_manifest(mark("INGESTED", 1, false)).await.unwrap();
        store.mark_manifest(mark("PARSED", 2, false)).await.unwrap();

        // New stage below the high-water rank is a regression.
        let err = store
            .mark_manifest(mark("STAGED", 1, false))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Monotonicity(_)));

        // Re-marking an existing stage is an idempotent refresh.
        store.mark_manifest(mark("INGESTED", 1, false)).await.unwrap();

        // Replace capture may regress explicitly.
        store.mark_manifest(mark("STAGED", 1, true)).await.unwrap();
    }

    #[tokio::test]
    async fn test_watermark_monotonic_and_force() {
        let store = MemoryStore::new();
        store
            .advance_watermark("finra.otc", "sftp", "tier=OTC_TIER", "2025-12-19", false)
            .await
            .unwrap();

        let err = store
            .advance_watermark("finra.otc", "sftp", "tier=OTC_TIER", "2025-12-12", false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Monotonicity(_)));

        let forced = store
            .advance_watermark("finra.otc", "sftp", "tier=OTC_TIER", "2025-12-12", true)
            .await
            .unwrap();
        assert_eq!(forced.high_watermark, "2025-12-12");
    }
}
