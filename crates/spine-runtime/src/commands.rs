//! Command layer: transport-neutral request/response types
//!
//! Each command is a concrete type exposing `execute`, shared by the CLI and
//! the HTTP API. Commands receive their collaborators explicitly; there is
//! no container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use spine_core::{
    Capabilities, ExecutionStatus, Lane, Result, SpineError, Tier, TriggerSource,
};
use spine_storage::{applied_migrations, BookkeepingStore, CoreStore, Database};

use crate::dispatcher::{Dispatcher, SubmitRequest};
use crate::pipeline::PipelineSpec;
use crate::registry::PipelineRegistry;

// ============================================
// ListPipelines
// ============================================

/// One row of `ListPipelines` output
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PipelineSummary {
    pub name: String,
    pub description: String,
    pub is_ingest: bool,
}

/// Enumerate registered pipelines, optionally prefix-filtered
#[derive(Debug, Clone, Default)]
pub struct ListPipelines {
    pub prefix: Option<String>,
}

impl ListPipelines {
    pub fn execute(&self, registry: &PipelineRegistry) -> Vec<PipelineSummary> {
        registry
            .list(self.prefix.as_deref())
            .into_iter()
            .map(|spec| PipelineSummary {
                name: spec.name,
                description: spec.description,
                is_ingest: spec.is_ingest,
            })
            .collect()
    }
}

// ============================================
// DescribePipeline
// ============================================

/// Return a pipeline's parameter schema
#[derive(Debug, Clone)]
pub struct DescribePipeline {
    pub name: String,
}

impl DescribePipeline {
    pub fn execute(&self, registry: &PipelineRegistry) -> Result<PipelineSpec> {
        registry
            .get(&self.name)
            .map(|p| p.describe())
            .ok_or_else(|| SpineError::PipelineNotFound(self.name.clone()))
    }
}

// ============================================
// RunPipeline
// ============================================

/// Admission via the Dispatcher
#[derive(Debug, Clone)]
pub struct RunPipeline {
    pub name: String,
    pub params: serde_json::Map<String, Value>,
    pub lane: Lane,
    pub trigger_source: TriggerSource,
    pub idempotency_key: Option<String>,
    pub dry_run: bool,
}

impl RunPipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Map::new(),
            lane: Lane::Normal,
            trigger_source: TriggerSource::Manual,
            idempotency_key: None,
            dry_run: false,
        }
    }

    pub async fn execute(&self, dispatcher: &Dispatcher) -> Result<ExecutionResponse> {
        let request = SubmitRequest {
            pipeline: self.name.clone(),
            params: self.params.clone(),
            lane: self.lane,
            trigger_source: self.trigger_source,
            logical_key: None,
            idempotency_key: self.idempotency_key.clone(),
            parent_execution_id: None,
            max_retries: None,
        };

        if self.dry_run {
            let plan = dispatcher.plan(&request)?;
            return Ok(ExecutionResponse {
                execution_id: None,
                pipeline: plan.pipeline,
                status: None,
                logical_key: Some(plan.logical_key),
                dry_run: true,
                metrics: None,
                error_kind: None,
                error_message: None,
            });
        }

        let execution = dispatcher.submit(request).await?;
        Ok(ExecutionResponse {
            execution_id: Some(execution.id),
            pipeline: execution.pipeline,
            status: Some(execution.status),
            logical_key: execution.logical_key,
            dry_run: false,
            metrics: execution.metrics,
            error_kind: execution.error_kind,
            error_message: execution.error_message,
        })
    }
}

/// What a submission did
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ExecutionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    pub pipeline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_key: Option<String>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub metrics: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ============================================
// QueryWeeks
// ============================================

/// Stage completion for one business partition
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WeekSummary {
    pub partition_key: String,
    pub stages: Vec<String>,
    pub row_count: i64,
    pub last_updated: DateTime<Utc>,
}

/// The weeks the platform knows for a domain, from the manifest ledger
#[derive(Debug, Clone)]
pub struct QueryWeeks {
    pub domain: String,
}

impl QueryWeeks {
    pub async fn execute(&self, store: &dyn CoreStore) -> Result<Vec<WeekSummary>> {
        let entries = store.list_manifest(&self.domain, None).await?;

        let mut summaries: Vec<WeekSummary> = Vec::new();
        for entry in entries {
            match summaries
                .iter_mut()
                .find(|s| s.partition_key == entry.partition_key)
            {
                Some(summary) => {
                    summary.stages.push(entry.stage);
                    summary.row_count += entry.row_count;
                    summary.last_updated = summary.last_updated.max(entry.updated_at);
                }
                None => summaries.push(WeekSummary {
                    partition_key: entry.partition_key,
                    stages: vec![entry.stage],
                    row_count: entry.row_count,
                    last_updated: entry.updated_at,
                }),
            }
        }

        summaries.sort_by(|a, b| b.partition_key.cmp(&a.partition_key));
        Ok(summaries)
    }
}

// ============================================
// QuerySymbols
// ============================================

/// Distinct symbols from a domain table's latest-capture view.
///
/// Domain tables are owned by pipelines; the caller names the table and
/// column. Identifiers are validated before interpolation.
#[derive(Debug, Clone)]
pub struct QuerySymbols {
    pub table: String,
    pub symbol_column: String,
    pub partition_column: Option<String>,
    pub partition_value: Option<String>,
    pub limit: i64,
}

/// `DISTINCT ON (business key) … ORDER BY captured_at DESC`: the shared
/// definition of a "latest" view over co-existing captures.
pub fn latest_view_sql(table: &str, business_key_columns: &[&str]) -> Result<String> {
    validate_identifier(table)?;
    for column in business_key_columns {
        validate_identifier(column)?;
    }
    let keys = business_key_columns.join(", ");
    Ok(format!(
        "SELECT DISTINCT ON ({keys}) * FROM {table} ORDER BY {keys}, captured_at DESC"
    ))
}

fn validate_identifier(ident: &str) -> Result<()> {
    let ok = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(SpineError::validation(format!(
            "invalid SQL identifier: '{ident}'"
        )))
    }
}

impl QuerySymbols {
    pub async fn execute(&self, db: &Database) -> Result<Vec<String>> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.symbol_column)?;

        let mut sql = format!(
            "SELECT DISTINCT {symbol} FROM {table}",
            symbol = self.symbol_column,
            table = self.table,
        );
        if let Some(column) = &self.partition_column {
            validate_identifier(column)?;
            sql.push_str(&format!(" WHERE {column} = $1"));
        }
        sql.push_str(&format!(
            " ORDER BY {symbol} LIMIT {limit}",
            symbol = self.symbol_column,
            limit = self.limit.max(1),
        ));

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        if self.partition_column.is_some() {
            query = query.bind(self.partition_value.clone().unwrap_or_default());
        }

        query
            .fetch_all(db.pool())
            .await
            .map_err(|e| SpineError::Database(e.to_string()))
    }
}

// ============================================
// CheckHealth
// ============================================

/// Liveness and readiness report
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct HealthReport {
    pub healthy: bool,
    pub database: bool,
    pub migrations_applied: usize,
    pub version: String,
}

/// Liveness, readiness, DB connectivity
#[derive(Debug, Clone, Default)]
pub struct CheckHealth;

impl CheckHealth {
    pub async fn execute(&self, db: &Database) -> HealthReport {
        let database = db.ping().await.is_ok();
        let migrations_applied = if database {
            applied_migrations(db.pool()).await.map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        HealthReport {
            healthy: database,
            database,
            migrations_applied,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ============================================
// GetCapabilities
// ============================================

/// Tier feature flags
#[derive(Debug, Clone)]
pub struct GetCapabilities {
    pub tier: Tier,
}

impl GetCapabilities {
    pub fn execute(&self) -> Capabilities {
        Capabilities::for_tier(self.tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationRegistry;
    use crate::executor::InlineExecutor;
    use crate::testsupport::{register_noop, test_runner};
    use std::sync::Arc;
    use spine_core::TierDateNormalizer;
    use spine_storage::models::ManifestMark;
    use spine_storage::MemoryStore;

    fn dispatcher() -> Dispatcher {
        let (runner, ledger, registry) = test_runner(|r| register_noop(r, "finra.ingest"));
        let cancellations = Arc::new(CancellationRegistry::new());
        let executor = Arc::new(InlineExecutor::new(runner, cancellations.clone()));
        Dispatcher::new(
            registry,
            ledger,
            executor,
            cancellations,
            Arc::new(TierDateNormalizer),
        )
    }

    #[test]
    fn test_list_and_describe() {
        let dispatcher = dispatcher();
        let listed = ListPipelines::default().execute(dispatcher.registry());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "finra.ingest");

        let described = DescribePipeline {
            name: "finra.ingest".to_string(),
        }
        .execute(dispatcher.registry())
        .unwrap();
        assert_eq!(described.name, "finra.ingest");

        let err = DescribePipeline {
            name: "ghost".to_string(),
        }
        .execute(dispatcher.registry())
        .unwrap_err();
        assert_eq!(err.code(), "PIPELINE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_run_pipeline_dry_run_inserts_nothing() {
        let dispatcher = dispatcher();
        let mut command = RunPipeline::new("finra.ingest");
        command.params.insert("week_ending".to_string(), "2025-12-19".into());
        command.dry_run = true;

        let response = command.execute(&dispatcher).await.unwrap();
        assert!(response.dry_run);
        assert!(response.execution_id.is_none());
        assert!(response.logical_key.is_some());

        // Nothing was admitted
        let run = RunPipeline {
            dry_run: false,
            ..command
        };
        let real = run.execute(&dispatcher).await.unwrap();
        assert_eq!(real.logical_key, response.logical_key);
        assert_eq!(real.status, Some(ExecutionStatus::Completed));
    }

    #[tokio::test]
    async fn test_query_weeks_groups_manifest() {
        let store = MemoryStore::new();
        let execution_id = Uuid::now_v7();

        for (partition, stage, rank) in [
            ("tier=NMS_TIER_1&week_ending=2025-12-19", "INGESTED", 1),
            ("tier=NMS_TIER_1&week_ending=2025-12-19", "PARSED", 2),
            ("tier=NMS_TIER_1&week_ending=2025-12-12", "INGESTED", 1),
        ] {
            store
                .mark_manifest(ManifestMark {
                    domain: "finra.otc".to_string(),
                    partition_key: partition.to_string(),
                    stage: stage.to_string(),
                    stage_rank: rank,
                    row_count: 5,
                    metrics: serde_json::json!({}),
                    capture_id: None,
                    execution_id,
                    batch_id: None,
                    replace: false,
                })
                .await
                .unwrap();
        }

        let weeks = QueryWeeks {
            domain: "finra.otc".to_string(),
        }
        .execute(&store)
        .await
        .unwrap();

        assert_eq!(weeks.len(), 2);
        // Newest partition first
        assert!(weeks[0].partition_key.contains("2025-12-19"));
        assert_eq!(weeks[0].stages, vec!["INGESTED", "PARSED"]);
        assert_eq!(weeks[0].row_count, 10);
    }

    #[test]
    fn test_latest_view_sql() {
        let sql = latest_view_sql("finra_otc_weekly", &["symbol", "week_ending"]).unwrap();
        assert_eq!(
            sql,
            "SELECT DISTINCT ON (symbol, week_ending) * FROM finra_otc_weekly \
             ORDER BY symbol, week_ending, captured_at DESC"
        );
        assert!(latest_view_sql("bad; drop table", &["x"]).is_err());
    }

    #[test]
    fn test_capabilities_by_tier() {
        let caps = GetCapabilities { tier: Tier::Basic }.execute();
        assert!(!caps.async_execution);
        let caps = GetCapabilities { tier: Tier::Full }.execute();
        assert!(caps.scheduling);
    }
}
