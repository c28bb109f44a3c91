// Ordered-file migration applier
//
// DDL files are embedded at compile time and applied in numeric order, each
// inside its own transaction. `_migrations` records applied filenames and is
// the only table safe to reason about pre-migration; re-running the applier
// is a no-op for files already recorded.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::store::StoreError;

/// Embedded migration files, ordered
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "000_executions.sql",
        include_str!("../migrations/000_executions.sql"),
    ),
    (
        "001_scheduler.sql",
        include_str!("../migrations/001_scheduler.sql"),
    ),
    (
        "002_workflows.sql",
        include_str!("../migrations/002_workflows.sql"),
    ),
    (
        "003_bookkeeping.sql",
        include_str!("../migrations/003_bookkeeping.sql"),
    ),
];

/// Apply all pending migrations. Returns the filenames applied this run.
pub async fn apply_migrations(pool: &PgPool) -> Result<Vec<String>, StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            filename   TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;

    let mut applied = Vec::new();

    for &(filename, sql) in MIGRATIONS {
        let already: Option<(String,)> =
            sqlx::query_as("SELECT filename FROM _migrations WHERE filename = $1")
                .bind(filename)
                .fetch_optional(pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

        if already.is_some() {
            debug!(filename, "migration already applied");
            continue;
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(format!("{filename}: {e}")))?;

        sqlx::query("INSERT INTO _migrations (filename) VALUES ($1)")
            .bind(filename)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        info!(filename, "applied migration");
        applied.push(filename.to_string());
    }

    Ok(applied)
}

/// Filenames recorded in `_migrations`
pub async fn applied_migrations(pool: &PgPool) -> Result<Vec<String>, StoreError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT filename FROM _migrations ORDER BY filename")
            .fetch_all(pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(rows.into_iter().map(|(f,)| f).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_numerically_ordered() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|(n, _)| *n).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_migrations_cover_all_core_tables() {
        let all_sql: String = MIGRATIONS.iter().map(|(_, s)| *s).collect();
        for table in [
            "core_executions",
            "core_execution_events",
            "core_dead_letters",
            "core_concurrency_locks",
            "core_schedules",
            "core_schedule_runs",
            "core_schedule_locks",
            "core_workflow_runs",
            "core_workflow_steps",
            "core_workflow_events",
            "core_manifest",
            "core_rejects",
            "core_quality",
            "core_anomalies",
            "core_work_items",
            "core_data_readiness",
            "core_watermarks",
            "core_backfill_plans",
        ] {
            assert!(all_sql.contains(table), "missing DDL for {table}");
        }
    }
}
