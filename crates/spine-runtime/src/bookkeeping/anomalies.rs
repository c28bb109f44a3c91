//! Anomaly recorder

use std::sync::Arc;

use uuid::Uuid;

use spine_core::{Result, Severity};
use spine_storage::models::{Anomaly, NewAnomaly};
use spine_storage::{BookkeepingStore, CoreStore};

/// Records detected quality events. Severity CRITICAL blocks readiness
/// certification until resolved.
#[derive(Clone)]
pub struct AnomalyRecorder {
    store: Arc<dyn CoreStore>,
    execution_id: Uuid,
}

impl AnomalyRecorder {
    pub fn new(store: Arc<dyn CoreStore>, execution_id: Uuid) -> Self {
        Self {
            store,
            execution_id,
        }
    }

    /// Record an anomaly, stamping this execution's id
    pub async fn record(&self, anomaly: NewAnomaly) -> Result<Anomaly> {
        let mut anomaly = anomaly;
        anomaly.execution_id.get_or_insert(self.execution_id);
        Ok(self.store.insert_anomaly(anomaly).await?)
    }

    pub async fn warn(
        &self,
        domain: &str,
        category: &str,
        message: impl Into<String>,
    ) -> Result<Anomaly> {
        self.record(NewAnomaly::new(domain, Severity::Warn, category, message))
            .await
    }

    pub async fn error(
        &self,
        domain: &str,
        category: &str,
        message: impl Into<String>,
    ) -> Result<Anomaly> {
        self.record(NewAnomaly::new(domain, Severity::Error, category, message))
            .await
    }

    pub async fn critical(
        &self,
        domain: &str,
        category: &str,
        message: impl Into<String>,
    ) -> Result<Anomaly> {
        self.record(NewAnomaly::new(domain, Severity::Critical, category, message))
            .await
    }
}
