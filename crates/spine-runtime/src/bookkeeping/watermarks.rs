//! Watermark facade: incremental source cursors

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use spine_core::{Result, Severity};
use spine_storage::models::{NewAnomaly, Watermark};
use spine_storage::{BookkeepingStore, CoreStore};

/// Monotonic high-watermark per (domain, source, partition).
///
/// Restatement replays may force a downgrade; forced downgrades leave a
/// WARN anomaly so the replay is auditable.
#[derive(Clone)]
pub struct Watermarks {
    store: Arc<dyn CoreStore>,
    execution_id: Uuid,
}

impl Watermarks {
    pub fn new(store: Arc<dyn CoreStore>, execution_id: Uuid) -> Self {
        Self {
            store,
            execution_id,
        }
    }

    pub async fn advance(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        new_high: &str,
        force: bool,
    ) -> Result<Watermark> {
        let downgraded = if force {
            match self.store.get_watermark(domain, source, partition_key).await? {
                Some(existing) => existing.high_watermark.as_str() > new_high,
                None => false,
            }
        } else {
            false
        };

        let watermark = self
            .store
            .advance_watermark(domain, source, partition_key, new_high, force)
            .await?;

        if downgraded {
            self.store
                .insert_anomaly(
                    NewAnomaly::new(
                        domain,
                        Severity::Warn,
                        "WATERMARK_FORCED",
                        format!("watermark for {source}/{partition_key} forced down to '{new_high}'"),
                    )
                    .with_partition(partition_key.to_string())
                    .with_execution(self.execution_id)
                    .with_details(json!({ "source": source, "new_high": new_high })),
                )
                .await?;
        }

        Ok(watermark)
    }

    pub async fn get(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>> {
        Ok(self
            .store
            .get_watermark(domain, source, partition_key)
            .await?)
    }
}
