//! Reject sink: record-level failures never abort a pipeline

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use spine_core::{PartitionKey, Result};
use spine_storage::models::NewReject;
use spine_storage::{BookkeepingStore, CoreStore};

/// Append-only sink for invalid source records. Every reject carries the
/// execution id that observed it.
#[derive(Clone)]
pub struct RejectSink {
    store: Arc<dyn CoreStore>,
    execution_id: Uuid,
}

impl RejectSink {
    pub fn new(store: Arc<dyn CoreStore>, execution_id: Uuid) -> Self {
        Self {
            store,
            execution_id,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: &str,
        reason_code: &str,
        reason_detail: Option<&str>,
        raw: Value,
        record_key: Option<&str>,
    ) -> Result<()> {
        self.store
            .insert_reject(NewReject {
                domain: domain.to_string(),
                partition_key: partition.to_string(),
                stage: stage.to_string(),
                reason_code: reason_code.to_string(),
                reason_detail: reason_detail.map(String::from),
                record_key: record_key.map(String::from),
                raw,
                execution_id: self.execution_id,
            })
            .await?;
        Ok(())
    }

    /// Rejects recorded by this execution so far
    pub async fn count(&self) -> Result<u64> {
        Ok(self.store.count_rejects(self.execution_id).await?)
    }
}
