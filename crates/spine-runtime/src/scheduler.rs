//! Cron scheduler
//!
//! Declarative `Schedule` rows fire through the Dispatcher. Each tick:
//! select due schedules, take the per-schedule lock (reclaiming expired
//! ones), materialize a ScheduleRun, submit, recompute next_run_at in the
//! schedule's timezone, release the lock. Misfires beyond the grace window
//! and max_instances overruns are recorded as SKIPPED runs.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use spine_core::{Lane, Result, ScheduleRunStatus, SpineError, TriggerSource};
use spine_storage::models::{NewSchedule, Schedule};
use spine_storage::{CoreStore, ScheduleStore};

use crate::dispatcher::{Dispatcher, SubmitRequest};

/// Validate a 5-field cron expression (minute hour day month weekday)
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(SpineError::config(format!(
            "cron expression must have 5 fields (minute hour day month weekday), got {fields}: '{expr}'"
        )));
    }
    // The cron crate wants a seconds field; pin it to zero.
    let with_seconds = format!("0 {expr}");
    cron::Schedule::from_str(&with_seconds)
        .map_err(|e| SpineError::config(format!("invalid cron expression '{expr}': {e}")))
}

/// Next firing strictly after `after`, evaluated in the schedule's timezone
pub fn next_fire_after(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let schedule = parse_cron(expr)?;
    let tz: chrono_tz::Tz = timezone
        .parse()
        .map_err(|_| SpineError::config(format!("invalid timezone: {timezone}")))?;

    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| SpineError::config(format!("cron '{expr}' has no future firing")))
}

/// Input for declaring a schedule
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    pub name: String,
    pub pipeline: String,
    pub params: Value,
    pub lane: Lane,
    pub cron: String,
    pub timezone: String,
    pub enabled: bool,
    pub max_instances: u32,
    pub misfire_grace: Duration,
}

impl ScheduleSpec {
    pub fn new(
        name: impl Into<String>,
        pipeline: impl Into<String>,
        cron: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pipeline: pipeline.into(),
            params: Value::Object(Default::default()),
            lane: Lane::Normal,
            cron: cron.into(),
            timezone: "UTC".to_string(),
            enabled: true,
            max_instances: 1,
            misfire_grace: Duration::from_secs(300),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_max_instances(mut self, max: u32) -> Self {
        self.max_instances = max.max(1);
        self
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub owner: String,
    pub tick_interval: Duration,
    /// Schedule locks are held only during a tick
    pub lock_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            owner: format!("scheduler-{}", Uuid::now_v7()),
            tick_interval: Duration::from_secs(15),
            lock_ttl: Duration::from_secs(60),
        }
    }
}

/// What one tick did, for logging and tests
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub fired: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Periodically triggers pipelines by cron through the Dispatcher
pub struct Scheduler {
    store: Arc<dyn CoreStore>,
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CoreStore>,
        dispatcher: Arc<Dispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Create or update a schedule; validates the cron expression and
    /// computes the initial next_run_at.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn declare(&self, spec: ScheduleSpec) -> Result<Schedule> {
        let next_run_at = next_fire_after(&spec.cron, &spec.timezone, Utc::now())?;

        let schedule = self
            .store
            .upsert_schedule(NewSchedule {
                name: spec.name,
                pipeline: spec.pipeline,
                params: spec.params,
                lane: spec.lane,
                cron: spec.cron,
                timezone: spec.timezone,
                enabled: spec.enabled,
                max_instances: spec.max_instances,
                misfire_grace_secs: spec.misfire_grace.as_secs(),
                next_run_at: Some(next_run_at),
            })
            .await?;

        info!(name = %schedule.name, next_run_at = %next_run_at, "schedule declared");
        Ok(schedule)
    }

    /// One pass over due schedules
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickSummary> {
        let now = Utc::now();
        let due = self.store.due_schedules(now).await?;
        let mut summary = TickSummary::default();

        for schedule in due {
            let locked = self
                .store
                .try_acquire_schedule_lock(schedule.id, &self.config.owner, self.config.lock_ttl)
                .await?;
            if !locked {
                debug!(name = %schedule.name, "schedule locked by another orchestrator");
                continue;
            }

            let outcome = self.fire(&schedule, now).await;
            if let Err(e) = self
                .store
                .release_schedule_lock(schedule.id, &self.config.owner)
                .await
            {
                error!(name = %schedule.name, "failed to release schedule lock: {e}");
            }

            match outcome {
                Ok(ScheduleRunStatus::Submitted) => summary.fired += 1,
                Ok(ScheduleRunStatus::Skipped) => summary.skipped += 1,
                Ok(_) | Err(_) => summary.failed += 1,
            }
        }

        Ok(summary)
    }

    /// Fire one due schedule: materialize the run, submit, recompute.
    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<ScheduleRunStatus> {
        let scheduled_for = schedule.next_run_at.unwrap_or(now);
        let run = self
            .store
            .insert_schedule_run(schedule.id, scheduled_for)
            .await?;

        let next_run_at = next_fire_after(&schedule.cron, &schedule.timezone, now).ok();

        // Misfire: fired too late for the grace window
        let lateness = (now - scheduled_for).to_std().unwrap_or_default();
        let status = if lateness > Duration::from_secs(schedule.misfire_grace_secs) {
            let reason = format!(
                "misfire: {}s past scheduled time (grace {}s)",
                lateness.as_secs(),
                schedule.misfire_grace_secs
            );
            warn!(name = %schedule.name, %reason, "skipping schedule run");
            self.store
                .finish_schedule_run(run.id, ScheduleRunStatus::Skipped, None, Some(reason))
                .await?;
            ScheduleRunStatus::Skipped
        } else if self.store.count_outstanding(schedule.id).await? >= schedule.max_instances {
            let reason = format!("max_instances: {} outstanding", schedule.max_instances);
            debug!(name = %schedule.name, %reason, "skipping schedule run");
            self.store
                .finish_schedule_run(run.id, ScheduleRunStatus::Skipped, None, Some(reason))
                .await?;
            ScheduleRunStatus::Skipped
        } else {
            let params = match &schedule.params {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            let request = SubmitRequest {
                pipeline: schedule.pipeline.clone(),
                params,
                lane: schedule.lane,
                trigger_source: TriggerSource::Schedule,
                logical_key: None,
                idempotency_key: None,
                parent_execution_id: None,
                max_retries: None,
            };

            match self.dispatcher.submit(request).await {
                Ok(execution) => {
                    self.store
                        .finish_schedule_run(
                            run.id,
                            ScheduleRunStatus::Submitted,
                            Some(execution.id),
                            None,
                        )
                        .await?;
                    info!(name = %schedule.name, execution_id = %execution.id, "schedule fired");
                    ScheduleRunStatus::Submitted
                }
                // A live duplicate means the previous firing is still going
                Err(SpineError::DuplicateLogicalKey(key)) => {
                    self.store
                        .finish_schedule_run(
                            run.id,
                            ScheduleRunStatus::Skipped,
                            None,
                            Some(format!("duplicate logical key: {key}")),
                        )
                        .await?;
                    ScheduleRunStatus::Skipped
                }
                Err(e) => {
                    warn!(name = %schedule.name, "schedule submission failed: {e}");
                    self.store
                        .finish_schedule_run(
                            run.id,
                            ScheduleRunStatus::Failed,
                            None,
                            Some(e.to_string()),
                        )
                        .await?;
                    ScheduleRunStatus::Failed
                }
            }
        };

        self.store
            .record_schedule_fired(schedule.id, now, status.as_str(), next_run_at)
            .await?;
        Ok(status)
    }

    /// Tick loop; exits on shutdown signal
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            owner = %self.config.owner,
            interval = ?self.config.tick_interval,
            "scheduler started"
        );
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary != TickSummary::default() => {
                            debug!(?summary, "scheduler tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!("scheduler tick failed: {e}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }
}
