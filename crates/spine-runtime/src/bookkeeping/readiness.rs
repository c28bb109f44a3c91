//! Readiness certification

use std::sync::Arc;

use serde_json::json;

use spine_core::{PartitionKey, Result, SpineError};
use spine_storage::models::DataReadiness;
use spine_storage::{BookkeepingStore, CoreStore};

/// Certifies that a partition has completed its required stages and carries
/// no unresolved critical anomalies — the precondition for downstream
/// consumers.
#[derive(Clone)]
pub struct Readiness {
    store: Arc<dyn CoreStore>,
}

impl Readiness {
    pub fn new(store: Arc<dyn CoreStore>) -> Self {
        Self { store }
    }

    /// Certify a partition for a downstream consumer.
    ///
    /// Fails with a VALIDATION error (and writes nothing) when a required
    /// stage is missing or a critical anomaly is open.
    pub async fn certify(
        &self,
        domain: &str,
        partition: &PartitionKey,
        ready_for: &str,
        required_stages: &[&str],
    ) -> Result<DataReadiness> {
        let partition_key = partition.to_string();

        let mut missing = Vec::new();
        for stage in required_stages {
            if self
                .store
                .get_manifest(domain, &partition_key, stage)
                .await?
                .is_none()
            {
                missing.push(*stage);
            }
        }
        if !missing.is_empty() {
            return Err(SpineError::Validation(format!(
                "cannot certify {domain}/{partition_key} for {ready_for}: stages missing {missing:?}"
            )));
        }

        if self
            .store
            .has_critical_anomalies(domain, &partition_key)
            .await?
        {
            return Err(SpineError::Validation(format!(
                "cannot certify {domain}/{partition_key} for {ready_for}: unresolved critical anomalies"
            )));
        }

        let readiness = self
            .store
            .upsert_readiness(
                domain,
                &partition_key,
                ready_for,
                true,
                Some(json!({ "stages": required_stages })),
            )
            .await?;
        Ok(readiness)
    }

    pub async fn get(
        &self,
        domain: &str,
        partition: &PartitionKey,
        ready_for: &str,
    ) -> Result<Option<DataReadiness>> {
        Ok(self
            .store
            .get_readiness(domain, &partition.to_string(), ready_for)
            .await?)
    }
}
