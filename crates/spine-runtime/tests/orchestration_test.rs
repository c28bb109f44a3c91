//! End-to-end orchestration scenarios over the in-memory store
//!
//! These tests drive the public API the way a deployment does: register
//! pipelines, build a dispatcher with the inline executor, submit, and
//! inspect the ledger and bookkeeping tables afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use spine_core::{
    ExecutionStatus, ParamDef, ParamType, PartitionKey, Result, Severity, TierDateNormalizer,
};
use spine_storage::{BookkeepingStore, CoreStore, LedgerStore, MemoryStore};

use spine_runtime::{
    CancellationRegistry, Dispatcher, InlineExecutor, Pipeline, PipelineContext,
    PipelineRegistry, PipelineResult, PipelineRunner, PipelineSpec, RetryPolicy, SubmitRequest,
};

const DOMAIN: &str = "finra.otc_transparency";
const INGESTED: &str = "INGESTED";
const ROLLING: &str = "ROLLING_COMPUTED";

fn partition(tier: &str, week_ending: &str) -> PartitionKey {
    PartitionKey::new()
        .with("tier", tier)
        .with("week_ending", week_ending)
}

/// Weekly ingest: derives a capture, takes the per-tier partition lock,
/// marks the manifest, rejects one malformed record.
struct IngestWeekPipeline;

#[async_trait]
impl Pipeline for IngestWeekPipeline {
    fn name(&self) -> &str {
        "finra.otc_transparency.ingest_week"
    }

    fn describe(&self) -> PipelineSpec {
        PipelineSpec::new(self.name())
            .with_description("Ingest one weekly OTC transparency file")
            .ingest()
            .with_required(ParamDef::required("week_ending", ParamType::Date))
            .with_required(
                ParamDef::required("tier", ParamType::String).with_choices([
                    "NMS_TIER_1",
                    "NMS_TIER_2",
                    "OTC_TIER",
                ]),
            )
    }

    async fn run(
        &self,
        params: &BTreeMap<String, Value>,
        ctx: &PipelineContext,
    ) -> Result<PipelineResult> {
        ctx.check_cancelled()?;
        let week_ending = params["week_ending"].as_str().unwrap_or_default();
        let tier = params["tier"].as_str().unwrap_or_default();
        let partition = partition(tier, week_ending);

        let lock = ctx
            .acquire_partition_lock(DOMAIN, tier, week_ending, Duration::from_secs(60))
            .await?;

        // Capture identity is seeded by the logical input so retries of the
        // same week reuse it.
        let stamp = ctx.capture(DOMAIN, tier, week_ending, week_ending);

        // One of the four source records is malformed.
        ctx.rejects
            .record(
                DOMAIN,
                &partition,
                INGESTED,
                "MALFORMED_ROW",
                Some("share quantity is not numeric"),
                json!({ "raw": "AAPL|x|12" }),
                Some("AAPL"),
            )
            .await?;

        ctx.manifest
            .mark(
                DOMAIN,
                &partition,
                INGESTED,
                1,
                3,
                json!({ "records": 4, "inserted": 3, "rejected": 1 }),
                Some(&stamp.capture_id),
            )
            .await?;

        lock.release().await?;

        Ok(PipelineResult::new()
            .with_metric("records", 4)
            .with_metric("inserted", 3)
            .with_capture(stamp.capture_id))
    }
}

/// Rolling compute: gated on six weeks of ingest history. Short windows
/// record an anomaly and produce no output rows.
struct ComputeRollingPipeline;

#[async_trait]
impl Pipeline for ComputeRollingPipeline {
    fn name(&self) -> &str {
        "finra.otc_transparency.compute_rolling"
    }

    fn describe(&self) -> PipelineSpec {
        PipelineSpec::new(self.name())
            .with_description("Six-week rolling aggregates per symbol")
            .with_required(ParamDef::required("week_ending", ParamType::Date))
            .with_required(ParamDef::required("tier", ParamType::String))
    }

    async fn run(
        &self,
        params: &BTreeMap<String, Value>,
        ctx: &PipelineContext,
    ) -> Result<PipelineResult> {
        let week_ending = params["week_ending"].as_str().unwrap_or_default();
        let tier = params["tier"].as_str().unwrap_or_default();
        let week = NaiveDate::parse_from_str(week_ending, "%Y-%m-%d")
            .map_err(|e| spine_core::SpineError::Parse(e.to_string()))?;

        let window = ctx
            .quality
            .require_history_window(DOMAIN, tier, week, INGESTED, 6)
            .await?;
        if !window.is_complete() {
            // Gate failed: anomaly is already recorded, write nothing.
            return Ok(PipelineResult::new().with_metric("rows_written", 0));
        }

        let partition = partition(tier, week_ending);
        let stamp = ctx.capture(DOMAIN, tier, week_ending, "rolling");
        ctx.manifest
            .mark(
                DOMAIN,
                &partition,
                ROLLING,
                2,
                120,
                json!({ "rows": 120 }),
                Some(&stamp.capture_id),
            )
            .await?;

        Ok(PipelineResult::new()
            .with_metric("rows_written", 120)
            .with_capture(stamp.capture_id))
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    dispatcher: Dispatcher,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let core: Arc<dyn CoreStore> = store.clone();
    let registry = Arc::new(PipelineRegistry::new());
    registry.register(Arc::new(IngestWeekPipeline));
    registry.register(Arc::new(ComputeRollingPipeline));

    let cancellations = Arc::new(CancellationRegistry::new());
    let runner = Arc::new(PipelineRunner::new(
        registry.clone(),
        core,
        cancellations.clone(),
        None,
        Duration::from_secs(3600),
        RetryPolicy::exponential()
            .with_initial_interval(Duration::from_millis(1))
            .with_jitter(0.0),
    ));
    let executor = Arc::new(InlineExecutor::new(runner, cancellations.clone()));
    let dispatcher = Dispatcher::new(
        registry,
        spine_runtime::Ledger::new(store.clone()),
        executor,
        cancellations,
        Arc::new(TierDateNormalizer),
    );

    Fixture { store, dispatcher }
}

fn ingest_request(tier: &str, week_ending: &str) -> SubmitRequest {
    SubmitRequest::new("finra.otc_transparency.ingest_week")
        .with_param("tier", tier)
        .with_param("week_ending", week_ending)
}

#[tokio::test]
async fn test_happy_path_ingest() {
    let f = fixture();

    let execution = f
        .dispatcher
        .submit(ingest_request("NMS_TIER_1", "2025-12-19"))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let metrics = execution.metrics.clone().unwrap();
    assert_eq!(metrics["records"], json!(4));
    assert_eq!(metrics["inserted"], json!(3));

    // Manifest stage present for the partition with the capture id
    let partition_key = partition("NMS_TIER_1", "2025-12-19").to_string();
    let entry = f
        .store
        .get_manifest(DOMAIN, &partition_key, INGESTED)
        .await
        .unwrap()
        .expect("manifest entry");
    assert_eq!(entry.row_count, 3);
    assert_eq!(entry.execution_id, execution.id);
    let capture_id = entry.capture_id.unwrap();
    assert!(capture_id.starts_with("finra.otc_transparency:NMS_TIER_1:2025-12-19:"));

    // Reject recorded with the execution stamp
    assert_eq!(f.store.count_rejects(execution.id).await.unwrap(), 1);

    // Full event trail
    let events = f.store.list_events(execution.id).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["execution.submitted", "execution.started", "execution.completed"]
    );
}

#[tokio::test]
async fn test_duplicate_submission_with_idempotency_key() {
    let f = fixture();

    let request = ingest_request("NMS_TIER_1", "2025-12-19").with_idempotency_key("weekly-load");
    let first = f.dispatcher.submit(request.clone()).await.unwrap();
    let second = f.dispatcher.submit(request).await.unwrap();

    // Both calls return the same execution; one terminal event only
    assert_eq!(first.id, second.id);
    let events = f.store.list_events(first.id).await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == "execution.completed")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_quality_gate_skip_on_short_history() {
    let f = fixture();

    // Only 3 of the 6 required weeks ingested
    for week in ["2025-12-19", "2025-12-12", "2025-12-05"] {
        f.dispatcher
            .submit(ingest_request("NMS_TIER_1", week))
            .await
            .unwrap();
    }

    let execution = f
        .dispatcher
        .submit(
            SubmitRequest::new("finra.otc_transparency.compute_rolling")
                .with_param("tier", "NMS_TIER_1")
                .with_param("week_ending", "2025-12-19"),
        )
        .await
        .unwrap();

    // Completed, not failed; no rolling rows written
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.metrics.clone().unwrap()["rows_written"], json!(0));

    let partition_key = partition("NMS_TIER_1", "2025-12-19").to_string();
    assert!(f
        .store
        .get_manifest(DOMAIN, &partition_key, ROLLING)
        .await
        .unwrap()
        .is_none());

    // One ERROR anomaly tagged with the gate category
    let anomalies = f
        .store
        .list_anomalies(spine_storage::AnomalyFilter {
            domain: Some(DOMAIN.to_string()),
            partition_key: Some(partition_key),
            min_severity: Some(Severity::Error),
            include_resolved: false,
        })
        .await
        .unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].category, "HISTORY_WINDOW_INSUFFICIENT");
}

#[tokio::test]
async fn test_quality_gate_passes_with_full_history() {
    let f = fixture();

    for week in [
        "2025-12-19",
        "2025-12-12",
        "2025-12-05",
        "2025-11-28",
        "2025-11-21",
        "2025-11-14",
    ] {
        f.dispatcher
            .submit(ingest_request("NMS_TIER_1", week))
            .await
            .unwrap();
    }

    let execution = f
        .dispatcher
        .submit(
            SubmitRequest::new("finra.otc_transparency.compute_rolling")
                .with_param("tier", "NMS_TIER_1")
                .with_param("week_ending", "2025-12-19"),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.metrics.clone().unwrap()["rows_written"],
        json!(120)
    );

    let partition_key = partition("NMS_TIER_1", "2025-12-19").to_string();
    let entry = f
        .store
        .get_manifest(DOMAIN, &partition_key, ROLLING)
        .await
        .unwrap()
        .expect("rolling manifest entry");
    assert_eq!(entry.stage_rank, 2);
}

#[tokio::test]
async fn test_sibling_tiers_do_not_contend() {
    let f = fixture();

    // Same week, different tiers: per-tier lock keys, both succeed
    let t1 = f
        .dispatcher
        .submit(ingest_request("NMS_TIER_1", "2025-12-19"))
        .await
        .unwrap();
    let t2 = f
        .dispatcher
        .submit(ingest_request("NMS_TIER_2", "2025-12-19"))
        .await
        .unwrap();

    assert_eq!(t1.status, ExecutionStatus::Completed);
    assert_eq!(t2.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_retry_reuses_capture_identity() {
    let f = fixture();

    // Two runs of the same logical week (the first terminal frees the key)
    let first = f
        .dispatcher
        .submit(ingest_request("OTC_TIER", "2025-12-19"))
        .await
        .unwrap();
    let partition_key = partition("OTC_TIER", "2025-12-19").to_string();
    let first_capture = f
        .store
        .get_manifest(DOMAIN, &partition_key, INGESTED)
        .await
        .unwrap()
        .unwrap()
        .capture_id;

    let second = f
        .dispatcher
        .submit(ingest_request("OTC_TIER", "2025-12-19"))
        .await
        .unwrap();
    let second_capture = f
        .store
        .get_manifest(DOMAIN, &partition_key, INGESTED)
        .await
        .unwrap()
        .unwrap()
        .capture_id;

    // Replays of the same logical input do not fork capture identity
    assert_ne!(first.id, second.id);
    assert_eq!(first_capture, second_capture);
}
