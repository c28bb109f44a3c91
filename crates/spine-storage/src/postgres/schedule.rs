//! ScheduleStore implementation

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use spine_core::{Lane, ScheduleRunStatus};

use super::{db_err, parse_enum, PostgresStore};
use crate::models::{NewSchedule, Schedule, ScheduleRun};
use crate::store::{ScheduleStore, StoreError};

const SCHEDULE_COLUMNS: &str = "id, name, pipeline, params, lane, cron, timezone, enabled, \
    max_instances, misfire_grace_secs, next_run_at, last_run_at, last_run_status, \
    created_at, updated_at";

fn schedule_from_row(row: &PgRow) -> Result<Schedule, StoreError> {
    let lane: String = row.get("lane");
    Ok(Schedule {
        id: row.get("id"),
        name: row.get("name"),
        pipeline: row.get("pipeline"),
        params: row.get("params"),
        lane: parse_enum::<Lane>(&lane)?,
        cron: row.get("cron"),
        timezone: row.get("timezone"),
        enabled: row.get("enabled"),
        max_instances: row.get::<i32, _>("max_instances") as u32,
        misfire_grace_secs: row.get::<i64, _>("misfire_grace_secs") as u64,
        next_run_at: row.get("next_run_at"),
        last_run_at: row.get("last_run_at"),
        last_run_status: row.get("last_run_status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn schedule_run_from_row(row: &PgRow) -> Result<ScheduleRun, StoreError> {
    let status: String = row.get("status");
    Ok(ScheduleRun {
        id: row.get("id"),
        schedule_id: row.get("schedule_id"),
        status: parse_enum::<ScheduleRunStatus>(&status)?,
        execution_id: row.get("execution_id"),
        reason: row.get("reason"),
        scheduled_for: row.get("scheduled_for"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl ScheduleStore for PostgresStore {
    #[instrument(skip(self, new), fields(name = %new.name))]
    async fn upsert_schedule(&self, new: NewSchedule) -> Result<Schedule, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO core_schedules (
                id, name, pipeline, params, lane, cron, timezone, enabled,
                max_instances, misfire_grace_secs, next_run_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (name) DO UPDATE SET
                pipeline = EXCLUDED.pipeline,
                params = EXCLUDED.params,
                lane = EXCLUDED.lane,
                cron = EXCLUDED.cron,
                timezone = EXCLUDED.timezone,
                enabled = EXCLUDED.enabled,
                max_instances = EXCLUDED.max_instances,
                misfire_grace_secs = EXCLUDED.misfire_grace_secs,
                next_run_at = EXCLUDED.next_run_at,
                updated_at = NOW()
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(&new.name)
        .bind(&new.pipeline)
        .bind(&new.params)
        .bind(new.lane.as_str())
        .bind(&new.cron)
        .bind(&new.timezone)
        .bind(new.enabled)
        .bind(new.max_instances as i32)
        .bind(new.misfire_grace_secs as i64)
        .bind(new.next_run_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        schedule_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM core_schedules WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM core_schedules ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn set_schedule_enabled(&self, name: &str, enabled: bool) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE core_schedules SET enabled = $2, updated_at = NOW() WHERE name = $1",
        )
        .bind(name)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM core_schedules
            WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn try_acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        let result = sqlx::query(
            r#"
            INSERT INTO core_schedule_locks (schedule_id, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (schedule_id) DO UPDATE
                SET owner = EXCLUDED.owner,
                    acquired_at = NOW(),
                    expires_at = EXCLUDED.expires_at
                WHERE core_schedule_locks.expires_at < NOW()
                   OR core_schedule_locks.owner = EXCLUDED.owner
            "#,
        )
        .bind(schedule_id)
        .bind(owner)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn release_schedule_lock(
        &self,
        schedule_id: Uuid,
        owner: &str,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM core_schedule_locks WHERE schedule_id = $1 AND owner = $2")
                .bind(schedule_id)
                .bind(owner)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn insert_schedule_run(
        &self,
        schedule_id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<ScheduleRun, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_schedule_runs (id, schedule_id, status, scheduled_for)
            VALUES ($1, $2, 'PENDING', $3)
            RETURNING id, schedule_id, status, execution_id, reason, scheduled_for,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(schedule_id)
        .bind(scheduled_for)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        schedule_run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn finish_schedule_run(
        &self,
        run_id: Uuid,
        status: ScheduleRunStatus,
        execution_id: Option<Uuid>,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        // One status transition per run: only PENDING rows move.
        sqlx::query(
            r#"
            UPDATE core_schedule_runs
            SET status = $2, execution_id = $3, reason = $4, updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(execution_id)
        .bind(&reason)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%run_id, status = %status, "schedule run finished");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_schedule_fired(
        &self,
        schedule_id: Uuid,
        last_run_at: DateTime<Utc>,
        last_run_status: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE core_schedules
            SET last_run_at = $2, last_run_status = $3, next_run_at = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(schedule_id)
        .bind(last_run_at)
        .bind(last_run_status)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn count_outstanding(&self, schedule_id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM core_schedule_runs r
            JOIN core_executions e ON e.id = r.execution_id
            WHERE r.schedule_id = $1
              AND e.status IN ('pending', 'queued', 'running')
            "#,
        )
        .bind(schedule_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("n") as u32)
    }
}
