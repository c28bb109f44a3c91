//! BookkeepingStore implementation
//!
//! The manifest upsert and the watermark upsert both carry monotonicity
//! guards evaluated inside the database so concurrent writers cannot race
//! past them.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use spine_core::{BackfillStatus, Lane, QualityOutcome, Severity, WorkItemStatus};

use super::{db_err, parse_enum, PostgresStore};
use crate::models::{
    Anomaly, BackfillPlan, DataReadiness, ManifestEntry, ManifestMark, NewAnomaly,
    NewBackfillPlan, NewQualityResult, NewReject, QualityResult, Reject, Watermark, WorkItem,
};
use crate::store::{AnomalyFilter, BookkeepingStore, StoreError};

fn manifest_from_row(row: &PgRow) -> ManifestEntry {
    ManifestEntry {
        domain: row.get("domain"),
        partition_key: row.get("partition_key"),
        stage: row.get("stage"),
        stage_rank: row.get("stage_rank"),
        row_count: row.get("row_count"),
        metrics: row.get("metrics"),
        capture_id: row.get("capture_id"),
        execution_id: row.get("execution_id"),
        batch_id: row.get("batch_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn anomaly_from_row(row: &PgRow) -> Result<Anomaly, StoreError> {
    let severity: String = row.get("severity");
    Ok(Anomaly {
        id: row.get("id"),
        domain: row.get("domain"),
        workflow: row.get("workflow"),
        partition_key: row.get("partition_key"),
        stage: row.get("stage"),
        severity: parse_enum::<Severity>(&severity)?,
        category: row.get("category"),
        message: row.get("message"),
        details: row.get("details"),
        affected_records: row.get("affected_records"),
        execution_id: row.get("execution_id"),
        created_at: row.get("created_at"),
        resolved_at: row.get("resolved_at"),
    })
}

fn work_item_from_row(row: &PgRow) -> Result<WorkItem, StoreError> {
    let status: String = row.get("status");
    Ok(WorkItem {
        id: row.get("id"),
        domain: row.get("domain"),
        workflow: row.get("workflow"),
        partition_key: row.get("partition_key"),
        status: parse_enum::<WorkItemStatus>(&status)?,
        attempts: row.get::<i32, _>("attempts") as u32,
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn backfill_from_row(row: &PgRow) -> Result<BackfillPlan, StoreError> {
    let status: String = row.get("status");
    let lane: String = row.get("lane");
    Ok(BackfillPlan {
        plan_id: row.get("plan_id"),
        domain: row.get("domain"),
        workflow: row.get("workflow"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        lane: parse_enum::<Lane>(&lane)?,
        status: parse_enum::<BackfillStatus>(&status)?,
        items_total: row.get::<i32, _>("items_total") as u32,
        items_completed: row.get::<i32, _>("items_completed") as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl BookkeepingStore for PostgresStore {
    #[instrument(skip(self, mark), fields(domain = %mark.domain, stage = %mark.stage))]
    async fn mark_manifest(&self, mark: ManifestMark) -> Result<ManifestEntry, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Stage rank only advances for a partition. Re-marking an
        // existing stage is an idempotent refresh; a rank below the
        // partition's high-water mark needs an explicit replace capture.
        // Row locks (not an aggregate) so concurrent markers serialize.
        if !mark.replace {
            let rows = sqlx::query(
                r#"
                SELECT stage, stage_rank
                FROM core_manifest
                WHERE domain = $1 AND partition_key = $2
                FOR UPDATE
                "#,
            )
            .bind(&mark.domain)
            .bind(&mark.partition_key)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;

            let max_rank = rows.iter().map(|r| r.get::<i32, _>("stage_rank")).max();
            let stage_exists = rows
                .iter()
                .any(|r| r.get::<String, _>("stage") == mark.stage);

            if let Some(max_rank) = max_rank {
                if mark.stage_rank < max_rank && !stage_exists {
                    return Err(StoreError::Monotonicity(format!(
                        "manifest stage '{}' (rank {}) regresses below rank {} for {}/{}",
                        mark.stage, mark.stage_rank, max_rank, mark.domain, mark.partition_key
                    )));
                }
            }
        }

        let row = sqlx::query(
            r#"
            INSERT INTO core_manifest (
                domain, partition_key, stage, stage_rank, row_count, metrics,
                capture_id, execution_id, batch_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (domain, partition_key, stage) DO UPDATE SET
                stage_rank = EXCLUDED.stage_rank,
                row_count = EXCLUDED.row_count,
                metrics = EXCLUDED.metrics,
                capture_id = EXCLUDED.capture_id,
                execution_id = EXCLUDED.execution_id,
                batch_id = EXCLUDED.batch_id,
                updated_at = NOW()
            RETURNING domain, partition_key, stage, stage_rank, row_count, metrics,
                      capture_id, execution_id, batch_id, created_at, updated_at
            "#,
        )
        .bind(&mark.domain)
        .bind(&mark.partition_key)
        .bind(&mark.stage)
        .bind(mark.stage_rank)
        .bind(mark.row_count)
        .bind(&mark.metrics)
        .bind(&mark.capture_id)
        .bind(mark.execution_id)
        .bind(mark.batch_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(domain = %mark.domain, stage = %mark.stage, "manifest marked");
        Ok(manifest_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn get_manifest(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<Option<ManifestEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT domain, partition_key, stage, stage_rank, row_count, metrics,
                   capture_id, execution_id, batch_id, created_at, updated_at
            FROM core_manifest
            WHERE domain = $1 AND partition_key = $2 AND stage = $3
            "#,
        )
        .bind(domain)
        .bind(partition_key)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.as_ref().map(manifest_from_row))
    }

    #[instrument(skip(self))]
    async fn list_manifest(
        &self,
        domain: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT domain, partition_key, stage, stage_rank, row_count, metrics,
                   capture_id, execution_id, batch_id, created_at, updated_at
            FROM core_manifest
            WHERE domain = $1 AND ($2::text IS NULL OR partition_key = $2)
            ORDER BY partition_key, stage_rank
            "#,
        )
        .bind(domain)
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(manifest_from_row).collect())
    }

    #[instrument(skip(self, new))]
    async fn insert_reject(&self, new: NewReject) -> Result<Reject, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_rejects (
                id, domain, partition_key, stage, reason_code, reason_detail,
                record_key, raw, execution_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, domain, partition_key, stage, reason_code, reason_detail,
                      record_key, raw, execution_id, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&new.domain)
        .bind(&new.partition_key)
        .bind(&new.stage)
        .bind(&new.reason_code)
        .bind(&new.reason_detail)
        .bind(&new.record_key)
        .bind(&new.raw)
        .bind(new.execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Reject {
            id: row.get("id"),
            domain: row.get("domain"),
            partition_key: row.get("partition_key"),
            stage: row.get("stage"),
            reason_code: row.get("reason_code"),
            reason_detail: row.get("reason_detail"),
            record_key: row.get("record_key"),
            raw: row.get("raw"),
            execution_id: row.get("execution_id"),
            created_at: row.get("created_at"),
        })
    }

    #[instrument(skip(self))]
    async fn count_rejects(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM core_rejects WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.get::<i64, _>("n") as u64)
    }

    #[instrument(skip(self, new), fields(domain = %new.domain, category = %new.category))]
    async fn insert_anomaly(&self, new: NewAnomaly) -> Result<Anomaly, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_anomalies (
                id, domain, workflow, partition_key, stage, severity, category,
                message, details, affected_records, execution_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, domain, workflow, partition_key, stage, severity, category,
                      message, details, affected_records, execution_id, created_at, resolved_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&new.domain)
        .bind(&new.workflow)
        .bind(&new.partition_key)
        .bind(&new.stage)
        .bind(new.severity.as_str())
        .bind(&new.category)
        .bind(&new.message)
        .bind(&new.details)
        .bind(new.affected_records)
        .bind(new.execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        if new.severity >= Severity::Error {
            warn!(domain = %new.domain, category = %new.category, severity = %new.severity, "anomaly recorded");
        }
        anomaly_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn resolve_anomaly(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE core_anomalies SET resolved_at = NOW() WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_anomalies(&self, filter: AnomalyFilter) -> Result<Vec<Anomaly>, StoreError> {
        let min_severity = filter.min_severity.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"
            SELECT id, domain, workflow, partition_key, stage, severity, category,
                   message, details, affected_records, execution_id, created_at, resolved_at
            FROM core_anomalies
            WHERE ($1::text IS NULL OR domain = $1)
              AND ($2::text IS NULL OR partition_key = $2)
              AND ($3 OR resolved_at IS NULL)
              AND CASE $4::text
                    WHEN 'CRITICAL' THEN severity = 'CRITICAL'
                    WHEN 'ERROR' THEN severity IN ('ERROR', 'CRITICAL')
                    ELSE TRUE
                  END
            ORDER BY created_at DESC
            "#,
        )
        .bind(&filter.domain)
        .bind(&filter.partition_key)
        .bind(filter.include_resolved)
        .bind(min_severity)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(anomaly_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn has_critical_anomalies(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM core_anomalies
                WHERE domain = $1 AND partition_key = $2
                  AND severity = 'CRITICAL' AND resolved_at IS NULL
            ) AS present
            "#,
        )
        .bind(domain)
        .bind(partition_key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("present"))
    }

    #[instrument(skip(self, new))]
    async fn insert_quality(&self, new: NewQualityResult) -> Result<QualityResult, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_quality (
                id, domain, partition_key, check_name, outcome, actual, expected,
                details, execution_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, domain, partition_key, check_name, outcome, actual, expected,
                      details, execution_id, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&new.domain)
        .bind(&new.partition_key)
        .bind(&new.check_name)
        .bind(new.outcome.as_str())
        .bind(new.actual)
        .bind(new.expected)
        .bind(&new.details)
        .bind(new.execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let outcome: String = row.get("outcome");
        Ok(QualityResult {
            id: row.get("id"),
            domain: row.get("domain"),
            partition_key: row.get("partition_key"),
            check_name: row.get("check_name"),
            outcome: parse_enum::<QualityOutcome>(&outcome)?,
            actual: row.get("actual"),
            expected: row.get("expected"),
            details: row.get("details"),
            execution_id: row.get("execution_id"),
            created_at: row.get("created_at"),
        })
    }

    #[instrument(skip(self))]
    async fn list_quality(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<Vec<QualityResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, domain, partition_key, check_name, outcome, actual, expected,
                   details, execution_id, created_at
            FROM core_quality
            WHERE domain = $1 AND partition_key = $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(domain)
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let outcome: String = row.get("outcome");
                Ok(QualityResult {
                    id: row.get("id"),
                    domain: row.get("domain"),
                    partition_key: row.get("partition_key"),
                    check_name: row.get("check_name"),
                    outcome: parse_enum::<QualityOutcome>(&outcome)?,
                    actual: row.get("actual"),
                    expected: row.get("expected"),
                    details: row.get("details"),
                    execution_id: row.get("execution_id"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    #[instrument(skip(self, details))]
    async fn upsert_readiness(
        &self,
        domain: &str,
        partition_key: &str,
        ready_for: &str,
        is_ready: bool,
        details: Option<serde_json::Value>,
    ) -> Result<DataReadiness, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_data_readiness (domain, partition_key, ready_for, is_ready, details)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (domain, partition_key, ready_for) DO UPDATE SET
                is_ready = EXCLUDED.is_ready,
                details = EXCLUDED.details,
                certified_at = NOW()
            RETURNING domain, partition_key, ready_for, is_ready, details, certified_at
            "#,
        )
        .bind(domain)
        .bind(partition_key)
        .bind(ready_for)
        .bind(is_ready)
        .bind(&details)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(DataReadiness {
            domain: row.get("domain"),
            partition_key: row.get("partition_key"),
            ready_for: row.get("ready_for"),
            is_ready: row.get("is_ready"),
            details: row.get("details"),
            certified_at: row.get("certified_at"),
        })
    }

    #[instrument(skip(self))]
    async fn get_readiness(
        &self,
        domain: &str,
        partition_key: &str,
        ready_for: &str,
    ) -> Result<Option<DataReadiness>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT domain, partition_key, ready_for, is_ready, details, certified_at
            FROM core_data_readiness
            WHERE domain = $1 AND partition_key = $2 AND ready_for = $3
            "#,
        )
        .bind(domain)
        .bind(partition_key)
        .bind(ready_for)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| DataReadiness {
            domain: row.get("domain"),
            partition_key: row.get("partition_key"),
            ready_for: row.get("ready_for"),
            is_ready: row.get("is_ready"),
            details: row.get("details"),
            certified_at: row.get("certified_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn advance_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        new_high: &str,
        force: bool,
    ) -> Result<Watermark, StoreError> {
        // The monotonic guard lives in the upsert predicate: without force,
        // a lower watermark simply matches no row.
        let row = sqlx::query(
            r#"
            INSERT INTO core_watermarks (domain, source, partition_key, high_watermark)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (domain, source, partition_key) DO UPDATE SET
                high_watermark = EXCLUDED.high_watermark,
                updated_at = NOW()
                WHERE $5 OR core_watermarks.high_watermark <= EXCLUDED.high_watermark
            RETURNING domain, source, partition_key, high_watermark, updated_at
            "#,
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .bind(new_high)
        .bind(force)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Watermark {
                domain: row.get("domain"),
                source: row.get("source"),
                partition_key: row.get("partition_key"),
                high_watermark: row.get("high_watermark"),
                updated_at: row.get("updated_at"),
            }),
            None => Err(StoreError::Monotonicity(format!(
                "watermark for {domain}/{source}/{partition_key} would move backwards to '{new_high}'"
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT domain, source, partition_key, high_watermark, updated_at
            FROM core_watermarks
            WHERE domain = $1 AND source = $2 AND partition_key = $3
            "#,
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| Watermark {
            domain: row.get("domain"),
            source: row.get("source"),
            partition_key: row.get("partition_key"),
            high_watermark: row.get("high_watermark"),
            updated_at: row.get("updated_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn enqueue_work_item(
        &self,
        domain: &str,
        workflow: &str,
        partition_key: &str,
    ) -> Result<WorkItem, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_work_items (id, domain, workflow, partition_key, status)
            VALUES ($1, $2, $3, $4, 'pending')
            ON CONFLICT (domain, workflow, partition_key) DO UPDATE SET updated_at = NOW()
            RETURNING id, domain, workflow, partition_key, status, attempts, last_error,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(domain)
        .bind(workflow)
        .bind(partition_key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        work_item_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn transition_work_item(
        &self,
        id: Uuid,
        status: WorkItemStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE core_work_items
            SET status = $2,
                attempts = attempts + CASE WHEN $2 = 'in_progress' THEN 1 ELSE 0 END,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_work_items(
        &self,
        domain: &str,
        status: Option<WorkItemStatus>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let status_str = status.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"
            SELECT id, domain, workflow, partition_key, status, attempts, last_error,
                   created_at, updated_at
            FROM core_work_items
            WHERE domain = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at
            "#,
        )
        .bind(domain)
        .bind(status_str)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(work_item_from_row).collect()
    }

    #[instrument(skip(self, new))]
    async fn insert_backfill_plan(&self, new: NewBackfillPlan) -> Result<BackfillPlan, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO core_backfill_plans (plan_id, domain, workflow, start_date, end_date, lane)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING plan_id, domain, workflow, start_date, end_date, lane, status,
                      items_total, items_completed, created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&new.domain)
        .bind(&new.workflow)
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(new.lane.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        backfill_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn update_backfill_status(
        &self,
        plan_id: Uuid,
        status: BackfillStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE core_backfill_plans SET status = $2, updated_at = NOW() WHERE plan_id = $1",
        )
        .bind(plan_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_backfill_progress(
        &self,
        plan_id: Uuid,
        items_total: u32,
        items_completed: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE core_backfill_plans
            SET items_total = $2, items_completed = $3, updated_at = NOW()
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .bind(items_total as i32)
        .bind(items_completed as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_backfill_plan(&self, plan_id: Uuid) -> Result<Option<BackfillPlan>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT plan_id, domain, workflow, start_date, end_date, lane, status,
                   items_total, items_completed, created_at, updated_at
            FROM core_backfill_plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(backfill_from_row).transpose()
    }
}
