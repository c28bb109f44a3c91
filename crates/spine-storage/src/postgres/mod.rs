//! PostgreSQL implementation of the core store traits
//!
//! - Execution leasing via `FOR UPDATE SKIP LOCKED` (no thundering herd)
//! - Status-guarded single-row updates (no lost updates)
//! - Event appends and status transitions share one transaction
//! - TTL leases for concurrency and schedule locks

mod bookkeeping;
mod ledger;
mod schedule;
mod workflow;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use spine_core::{ExecutionStatus, Lane, SpineError, TriggerSource};

use crate::models::Execution;
use crate::store::StoreError;

/// PostgreSQL store over a shared connection pool
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Unique-constraint violation (SQLSTATE 23505)
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|c| c == "23505")
        .unwrap_or(false)
}

pub(crate) fn parse_enum<T>(raw: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = SpineError>,
{
    raw.parse()
        .map_err(|e: SpineError| StoreError::Database(e.to_string()))
}

pub(crate) const EXECUTION_COLUMNS: &str = "id, pipeline, params, lane, trigger_source, \
    logical_key, idempotency_key, parent_execution_id, batch_id, status, retry_count, \
    max_retries, error_kind, error_message, metrics, available_at, locked_by, heartbeat_at, \
    created_at, started_at, finished_at";

pub(crate) fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    let lane: String = row.get("lane");
    let trigger: String = row.get("trigger_source");
    let status: String = row.get("status");

    Ok(Execution {
        id: row.get("id"),
        pipeline: row.get("pipeline"),
        params: row.get("params"),
        lane: parse_enum::<Lane>(&lane)?,
        trigger_source: parse_enum::<TriggerSource>(&trigger)?,
        logical_key: row.get("logical_key"),
        idempotency_key: row.get("idempotency_key"),
        parent_execution_id: row.get("parent_execution_id"),
        batch_id: row.get("batch_id"),
        status: parse_enum::<ExecutionStatus>(&status)?,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        error_kind: row.get("error_kind"),
        error_message: row.get("error_message"),
        metrics: row.get("metrics"),
        available_at: row.get::<DateTime<Utc>, _>("available_at"),
        locked_by: row.get("locked_by"),
        heartbeat_at: row.get("heartbeat_at"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

pub(crate) fn new_event_id() -> Uuid {
    Uuid::now_v7()
}
