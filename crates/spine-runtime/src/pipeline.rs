//! Pipeline contract
//!
//! A pipeline is one unit of work: fetch → parse → validate → write, with
//! full bookkeeping. Implementations live outside the core; their only
//! contract is this trait plus the bookkeeping sinks carried by the context.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use spine_core::{CaptureId, CaptureStamp, ParamDef, Result, SpineError};
use spine_storage::{CoreStore, Database, LedgerStore};

use crate::bookkeeping::{
    AnomalyRecorder, Manifest, QualityRunner, Readiness, RejectSink, Watermarks,
};

/// Static description of a pipeline, served by `DescribePipeline`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct PipelineSpec {
    pub name: String,
    pub description: String,
    pub required_params: Vec<ParamDef>,
    pub optional_params: Vec<ParamDef>,
    /// Ingest pipelines create captures; compute pipelines read them
    pub is_ingest: bool,
    /// Hard timeout override; the runtime default applies when None
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry budget override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required_params: vec![],
            optional_params: vec![],
            is_ingest: false,
            timeout_secs: None,
            max_retries: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_required(mut self, def: ParamDef) -> Self {
        self.required_params.push(def);
        self
    }

    pub fn with_optional(mut self, def: ParamDef) -> Self {
        self.optional_params.push(def);
        self
    }

    pub fn ingest(mut self) -> Self {
        self.is_ingest = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// All parameter definitions, required first
    pub fn all_params(&self) -> Vec<ParamDef> {
        self.required_params
            .iter()
            .chain(self.optional_params.iter())
            .cloned()
            .collect()
    }
}

/// Result of one pipeline invocation.
///
/// Carries small metadata only; bulk data flows through the database.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PipelineResult {
    /// Row counts and other numeric metrics
    pub metrics: serde_json::Map<String, Value>,
    /// Captures produced by this invocation
    pub capture_ids: Vec<CaptureId>,
    /// Optional ingest resolution metadata (what source the input resolved to)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_resolution: Option<Value>,
}

impl PipelineResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    pub fn with_capture(mut self, capture_id: CaptureId) -> Self {
        self.capture_ids.push(capture_id);
        self
    }

    pub fn with_ingest_resolution(mut self, resolution: Value) -> Self {
        self.ingest_resolution = Some(resolution);
        self
    }
}

/// Everything a pipeline needs from the runtime for one invocation
#[derive(Clone)]
pub struct PipelineContext {
    pub execution_id: Uuid,
    pub batch_id: Uuid,
    store: Arc<dyn CoreStore>,
    /// Raw connection handle for domain-table writes; absent in unit tests
    /// running against the memory store
    db: Option<Database>,
    cancel: CancellationToken,
    pub manifest: Manifest,
    pub rejects: RejectSink,
    pub anomalies: AnomalyRecorder,
    pub quality: QualityRunner,
    pub readiness: Readiness,
    pub watermarks: Watermarks,
}

impl PipelineContext {
    pub fn new(
        store: Arc<dyn CoreStore>,
        db: Option<Database>,
        execution_id: Uuid,
        batch_id: Uuid,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            batch_id,
            manifest: Manifest::new(store.clone(), execution_id, batch_id),
            rejects: RejectSink::new(store.clone(), execution_id),
            anomalies: AnomalyRecorder::new(store.clone(), execution_id),
            quality: QualityRunner::new(store.clone(), execution_id),
            readiness: Readiness::new(store.clone()),
            watermarks: Watermarks::new(store.clone(), execution_id),
            store,
            db,
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<dyn CoreStore> {
        &self.store
    }

    /// The database connection, when running against PostgreSQL
    pub fn db(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    /// Derive the capture identity for this invocation and stamp it.
    ///
    /// Seeded from the execution's logical input, so a retry of the same
    /// logical work reuses the identity of the first attempt.
    pub fn capture(&self, domain: &str, tier: &str, partition: &str, seed: &str) -> CaptureStamp {
        let capture_id = CaptureId::derive(domain, tier, partition, seed);
        CaptureStamp::new(capture_id, self.execution_id)
    }

    /// Cooperative cancellation probe. Pipelines call this at suspension
    /// points (before fetches, between batches).
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SpineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Exclusive processing lease for a business partition. Lock keys are
    /// per-tier: sibling tiers of the same week do not contend.
    pub async fn acquire_partition_lock(
        &self,
        domain: &str,
        tier: &str,
        partition: &str,
        ttl: Duration,
    ) -> Result<PartitionLock> {
        let lock_key = format!("{domain}:{tier}:{partition}");
        let owner = self.execution_id.to_string();
        let acquired = self.store.acquire_lock(&lock_key, &owner, ttl).await?;
        if !acquired {
            return Err(SpineError::LockContended(lock_key));
        }
        Ok(PartitionLock {
            store: self.store.clone(),
            lock_key,
            owner,
        })
    }
}

/// Held partition lease; release when the stage transaction commits.
pub struct PartitionLock {
    store: Arc<dyn CoreStore>,
    lock_key: String,
    owner: String,
}

impl PartitionLock {
    pub fn key(&self) -> &str {
        &self.lock_key
    }

    pub async fn release(self) -> Result<()> {
        self.store.release_lock(&self.lock_key, &self.owner).await?;
        Ok(())
    }
}

/// A registered unit of work
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// Unique name, e.g. `finra.otc_transparency.ingest_week`
    fn name(&self) -> &str;

    fn describe(&self) -> PipelineSpec;

    /// Run one invocation. `params` has already been validated against the
    /// spec's ParamDef list and normalized.
    async fn run(
        &self,
        params: &BTreeMap<String, Value>,
        ctx: &PipelineContext,
    ) -> Result<PipelineResult>;
}
