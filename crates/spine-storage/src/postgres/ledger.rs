//! LedgerStore implementation: executions, events, DLQ, leases, locks

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use spine_core::{ExecutionStatus, Lane};

use super::{db_err, execution_from_row, is_unique_violation, new_event_id, PostgresStore, EXECUTION_COLUMNS};
use crate::models::{
    DeadLetter, Execution, ExecutionEvent, NewDeadLetter, NewExecution, NewExecutionEvent,
};
use crate::store::{DeadLetterFilter, LedgerStore, Pagination, StoreError};

fn dead_letter_from_row(row: &sqlx::postgres::PgRow) -> DeadLetter {
    DeadLetter {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        pipeline: row.get("pipeline"),
        params: row.get("params"),
        error_kind: row.get("error_kind"),
        error_message: row.get("error_message"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        created_at: row.get("created_at"),
        last_retry_at: row.get("last_retry_at"),
        resolved_at: row.get("resolved_at"),
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    #[instrument(skip(self, new), fields(pipeline = %new.pipeline))]
    async fn insert_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let id = Uuid::now_v7();
        let batch_id = Uuid::now_v7();
        let available_at = new.available_at.unwrap_or_else(Utc::now);

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO core_executions (
                id, pipeline, params, lane, trigger_source, logical_key,
                idempotency_key, parent_execution_id, batch_id, status,
                retry_count, max_retries, available_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10, $11, $12)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&new.pipeline)
        .bind(&new.params)
        .bind(new.lane.as_str())
        .bind(new.trigger_source.as_str())
        .bind(&new.logical_key)
        .bind(&new.idempotency_key)
        .bind(new.parent_execution_id)
        .bind(batch_id)
        .bind(new.retry_count as i32)
        .bind(new.max_retries as i32)
        .bind(available_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => {
                debug!(%id, "inserted execution");
                execution_from_row(&row)
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateLogicalKey(
                new.logical_key.unwrap_or_default(),
            )),
            Err(e) => {
                error!("failed to insert execution: {}", e);
                Err(db_err(e))
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM core_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ExecutionNotFound(id))?;

        execution_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn find_by_idempotency_key(
        &self,
        pipeline: &str,
        key: &str,
    ) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM core_executions
            WHERE pipeline = $1 AND idempotency_key = $2
            "#
        ))
        .bind(pipeline)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(execution_from_row).transpose()
    }

    #[instrument(skip(self, event))]
    async fn transition(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        event: NewExecutionEvent,
    ) -> Result<Execution, StoreError> {
        self.transition_inner(id, from, to, event, None, None).await
    }

    #[instrument(skip(self, event))]
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
            Some((error_kind, error_message)),
            None,
        )
        .await
    }

    #[instrument(skip(self, metrics, event))]
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
        .await
    }

    #[instrument(skip(self, event))]
    async fn append_event(&self, event: NewExecutionEvent) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO core_execution_events (id, execution_id, event_type, payload, idempotency_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            "#,
        )
        .bind(new_event_id())
        .bind(event.execution_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.idempotency_key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError> {
        // Event timestamps are not strictly monotonic across writers; order
        // by (created_at, id) per the ledger contract.
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, event_type, payload, idempotency_key, created_at
            FROM core_execution_events
            WHERE execution_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| ExecutionEvent {
                id: row.get("id"),
                execution_id: row.get("execution_id"),
                event_type: row.get("event_type"),
                payload: row.get("payload"),
                idempotency_key: row.get("idempotency_key"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn lease_next(
        &self,
        worker_id: &str,
        lanes: &[Lane],
    ) -> Result<Option<Execution>, StoreError> {
        if lanes.is_empty() {
            return Ok(None);
        }
        let lane_names: Vec<String> = lanes.iter().map(|l| l.as_str().to_string()).collect();

        // SKIP LOCKED: concurrent workers each lease a distinct row, no
        // double-lease, no lock queueing.
        let row = sqlx::query(&format!(
            r#"
            WITH leasable AS (
                SELECT id
                FROM core_executions
                WHERE status IN ('pending', 'queued')
                  AND available_at <= NOW()
                  AND lane = ANY($2)
                ORDER BY
                    CASE lane WHEN 'realtime' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
                    created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE core_executions e
            SET status = 'running',
                locked_by = $1,
                started_at = COALESCE(e.started_at, NOW()),
                heartbeat_at = NOW()
            FROM leasable l
            WHERE e.id = l.id
            RETURNING {EXECUTION_COLUMNS_E}
            "#,
            EXECUTION_COLUMNS_E = EXECUTION_COLUMNS
                .split(", ")
                .map(|c| format!("e.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(worker_id)
        .bind(&lane_names)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let execution = execution_from_row(&row)?;
                debug!(worker_id, execution_id = %execution.id, "leased execution");
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn heartbeat(&self, execution_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE core_executions
            SET heartbeat_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn stale_executions(&self, older_than: Duration) -> Result<Vec<Execution>, StoreError> {
        let threshold = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM core_executions
            WHERE status = 'running' AND heartbeat_at IS NOT NULL AND heartbeat_at < $1
            ORDER BY heartbeat_at
            "#
        ))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self, new))]
    async fn insert_dead_letter(&self, new: NewDeadLetter) -> Result<DeadLetter, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_dead_letters (
                id, execution_id, pipeline, params, error_kind, error_message, retry_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, execution_id, pipeline, params, error_kind, error_message,
                      retry_count, created_at, last_retry_at, resolved_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(new.execution_id)
        .bind(&new.pipeline)
        .bind(&new.params)
        .bind(&new.error_kind)
        .bind(&new.error_message)
        .bind(new.retry_count as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(execution_id = %new.execution_id, "dead-lettered execution");
        Ok(dead_letter_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetter, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, execution_id, pipeline, params, error_kind, error_message,
                   retry_count, created_at, last_retry_at, resolved_at
            FROM core_dead_letters
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::DeadLetterNotFound(id))?;

        Ok(dead_letter_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, pipeline, params, error_kind, error_message,
                   retry_count, created_at, last_retry_at, resolved_at
            FROM core_dead_letters
            WHERE ($1::text IS NULL OR pipeline = $1)
              AND ($2 OR resolved_at IS NULL)
            ORDER BY created_at DESC
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(&filter.pipeline)
        .bind(filter.include_resolved)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(dead_letter_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn mark_dead_letter_retried(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE core_dead_letters SET last_retry_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resolve_dead_letter(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE core_dead_letters SET resolved_at = NOW() WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn acquire_lock(
        &self,
        lock_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        // Insert wins, refresh by the same owner wins, reclaim of an expired
        // lease wins; a live lease held by someone else does not update.
        let result = sqlx::query(
            r#"
            INSERT INTO core_concurrency_locks (lock_key, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE
                SET owner = EXCLUDED.owner,
                    acquired_at = NOW(),
                    expires_at = EXCLUDED.expires_at
                WHERE core_concurrency_locks.expires_at < NOW()
                   OR core_concurrency_locks.owner = EXCLUDED.owner
            "#,
        )
        .bind(lock_key)
        .bind(owner)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn release_lock(&self, lock_key: &str, owner: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM core_concurrency_locks WHERE lock_key = $1 AND owner = $2")
                .bind(lock_key)
                .bind(owner)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }
}

impl PostgresStore {
    /// Shared body for status transitions: event append + guarded update in
    /// one transaction. Either both land or neither does.
    async fn transition_inner(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        event: NewExecutionEvent,
        failure: Option<(&str, &str)>,
        metrics: Option<serde_json::Value>,
    ) -> Result<Execution, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(key) = &event.idempotency_key {
            let inserted = sqlx::query(
                r#"
                INSERT INTO core_execution_events (id, execution_id, event_type, payload, idempotency_key)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
                "#,
            )
            .bind(new_event_id())
            .bind(event.execution_id)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if inserted.rows_affected() == 0 {
                // Duplicate idempotency key: the transition already happened.
                tx.rollback().await.map_err(db_err)?;
                debug!(%id, key, "idempotent transition replay ignored");
                return self.get_execution(id).await;
            }
        } else {
            sqlx::query(
                r#"
                INSERT INTO core_execution_events (id, execution_id, event_type, payload)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(new_event_id())
            .bind(event.execution_id)
            .bind(&event.event_type)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let from_names: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let set_finished = to.is_terminal();
        let set_started = to == ExecutionStatus::Running;

        let row = sqlx::query(&format!(
            r#"
            UPDATE core_executions
            SET status = $2,
                started_at = CASE WHEN $3 THEN COALESCE(started_at, NOW()) ELSE started_at END,
                finished_at = CASE WHEN $4 THEN NOW() ELSE finished_at END,
                error_kind = COALESCE($5, error_kind),
                error_message = COALESCE($6, error_message),
                metrics = COALESCE($7, metrics)
            WHERE id = $1 AND status = ANY($8)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(set_started)
        .bind(set_finished)
        .bind(failure.map(|(k, _)| k))
        .bind(failure.map(|(_, m)| m))
        .bind(&metrics)
        .bind(&from_names)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(db_err)?;
            let actual = self.get_execution(id).await?.status;
            return Err(StoreError::InvalidTransition {
                id,
                expected: from.to_vec(),
                actual,
            });
        };

        tx.commit().await.map_err(db_err)?;

        let execution = execution_from_row(&row)?;
        debug!(%id, status = %execution.status, "execution transitioned");
        Ok(execution)
    }
}
