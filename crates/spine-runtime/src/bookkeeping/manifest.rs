//! Manifest facade: the progress ledger

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use spine_core::{CaptureId, PartitionKey, Result};
use spine_storage::models::{ManifestEntry, ManifestMark};
use spine_storage::{BookkeepingStore, CoreStore};

/// Progress ledger keyed by `(domain, partition_key, stage)`.
///
/// Stage ranks advance monotonically per partition; regression requires an
/// explicit replace capture.
#[derive(Clone)]
pub struct Manifest {
    store: Arc<dyn CoreStore>,
    execution_id: Uuid,
    batch_id: Uuid,
}

impl Manifest {
    pub fn new(store: Arc<dyn CoreStore>, execution_id: Uuid, batch_id: Uuid) -> Self {
        Self {
            store,
            execution_id,
            batch_id,
        }
    }

    /// Mark a stage complete for a partition
    pub async fn mark(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: &str,
        stage_rank: i32,
        row_count: i64,
        metrics: Value,
        capture_id: Option<&CaptureId>,
    ) -> Result<ManifestEntry> {
        let entry = self
            .store
            .mark_manifest(ManifestMark {
                domain: domain.to_string(),
                partition_key: partition.to_string(),
                stage: stage.to_string(),
                stage_rank,
                row_count,
                metrics,
                capture_id: capture_id.map(|c| c.as_str().to_string()),
                execution_id: self.execution_id,
                batch_id: Some(self.batch_id),
                replace: false,
            })
            .await?;
        Ok(entry)
    }

    /// Mark with explicit rank regression permitted (replace capture)
    pub async fn mark_replace(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: &str,
        stage_rank: i32,
        row_count: i64,
        metrics: Value,
        capture_id: Option<&CaptureId>,
    ) -> Result<ManifestEntry> {
        let entry = self
            .store
            .mark_manifest(ManifestMark {
                domain: domain.to_string(),
                partition_key: partition.to_string(),
                stage: stage.to_string(),
                stage_rank,
                row_count,
                metrics,
                capture_id: capture_id.map(|c| c.as_str().to_string()),
                execution_id: self.execution_id,
                batch_id: Some(self.batch_id),
                replace: true,
            })
            .await?;
        Ok(entry)
    }

    /// Idempotency probe: is this stage already complete for the same
    /// capture? A retry of the same logical input derives the same capture
    /// id and may skip; a restatement derives a new one and co-exists.
    pub async fn is_complete_for_capture(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: &str,
        capture_id: &CaptureId,
    ) -> Result<bool> {
        let entry = self
            .store
            .get_manifest(domain, &partition.to_string(), stage)
            .await?;
        Ok(entry
            .and_then(|e| e.capture_id)
            .map(|stored| stored == capture_id.as_str())
            .unwrap_or(false))
    }

    pub async fn get(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: &str,
    ) -> Result<Option<ManifestEntry>> {
        Ok(self
            .store
            .get_manifest(domain, &partition.to_string(), stage)
            .await?)
    }

    /// All stages recorded for a partition, in rank order
    pub async fn stages(
        &self,
        domain: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<ManifestEntry>> {
        Ok(self
            .store
            .list_manifest(domain, Some(&partition.to_string()))
            .await?)
    }
}
