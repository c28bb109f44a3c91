//! WorkflowStore implementation

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use spine_core::{StepStatus, WorkflowRunStatus};

use super::{db_err, new_event_id, parse_enum, PostgresStore};
use crate::models::{NewWorkflowEvent, WorkflowEvent, WorkflowRun, WorkflowStep};
use crate::store::{StoreError, WorkflowStore};

fn run_from_row(row: &PgRow) -> Result<WorkflowRun, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowRun {
        run_id: row.get("run_id"),
        workflow: row.get("workflow"),
        params: row.get("params"),
        status: parse_enum::<WorkflowRunStatus>(&status)?,
        steps_total: row.get::<i32, _>("steps_total") as u32,
        steps_completed: row.get::<i32, _>("steps_completed") as u32,
        steps_failed: row.get::<i32, _>("steps_failed") as u32,
        error: row.get("error"),
        parent_run_id: row.get("parent_run_id"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

fn step_from_row(row: &PgRow) -> Result<WorkflowStep, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowStep {
        step_id: row.get("step_id"),
        run_id: row.get("run_id"),
        name: row.get("name"),
        kind: row.get("kind"),
        attempt: row.get::<i32, _>("attempt") as u32,
        status: parse_enum::<StepStatus>(&status)?,
        output: row.get("output"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

#[async_trait]
impl WorkflowStore for PostgresStore {
    #[instrument(skip(self, params))]
    async fn insert_run(
        &self,
        workflow: &str,
        params: serde_json::Value,
        steps_total: u32,
        parent_run_id: Option<Uuid>,
    ) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_workflow_runs (run_id, workflow, params, status, steps_total, parent_run_id)
            VALUES ($1, $2, $3, 'running', $4, $5)
            RETURNING run_id, workflow, params, status, steps_total, steps_completed,
                      steps_failed, error, parent_run_id, started_at, finished_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow)
        .bind(&params)
        .bind(steps_total as i32)
        .bind(parent_run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, workflow, params, status, steps_total, steps_completed,
                   steps_failed, error, parent_run_id, started_at, finished_at
            FROM core_workflow_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::RunNotFound(run_id))?;

        run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn record_step_outcome(&self, run_id: Uuid, completed: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE core_workflow_runs
            SET steps_completed = steps_completed + CASE WHEN $2 THEN 1 ELSE 0 END,
                steps_failed = steps_failed + CASE WHEN $2 THEN 0 ELSE 1 END
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(completed)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn finish_run(
        &self,
        run_id: Uuid,
        status: WorkflowRunStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        // Runs are never re-activated: only a running run can finish.
        sqlx::query(
            r#"
            UPDATE core_workflow_runs
            SET status = $2, error = $3, finished_at = NOW()
            WHERE run_id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(%run_id, status = %status, "workflow run finished");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn insert_step(
        &self,
        run_id: Uuid,
        name: &str,
        kind: &str,
        attempt: u32,
    ) -> Result<WorkflowStep, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_workflow_steps (step_id, run_id, name, kind, attempt, status)
            VALUES ($1, $2, $3, $4, $5, 'running')
            RETURNING step_id, run_id, name, kind, attempt, status, output, error,
                      started_at, finished_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(run_id)
        .bind(name)
        .bind(kind)
        .bind(attempt as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        step_from_row(&row)
    }

    #[instrument(skip(self, output))]
    async fn finish_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE core_workflow_steps
            SET status = $2, output = $3, error = $4, finished_at = NOW()
            WHERE step_id = $1
            "#,
        )
        .bind(step_id)
        .bind(status.as_str())
        .bind(&output)
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT step_id, run_id, name, kind, attempt, status, output, error,
                   started_at, finished_at
            FROM core_workflow_steps
            WHERE run_id = $1
            ORDER BY started_at, step_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self, event))]
    async fn append_workflow_event(&self, event: NewWorkflowEvent) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO core_workflow_events (id, run_id, event_type, payload, idempotency_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            "#,
        )
        .bind(new_event_id())
        .bind(event.run_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.idempotency_key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_workflow_events(&self, run_id: Uuid) -> Result<Vec<WorkflowEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, event_type, payload, idempotency_key, created_at
            FROM core_workflow_events
            WHERE run_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| WorkflowEvent {
                id: row.get("id"),
                run_id: row.get("run_id"),
                event_type: row.get("event_type"),
                payload: row.get("payload"),
                idempotency_key: row.get("idempotency_key"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
