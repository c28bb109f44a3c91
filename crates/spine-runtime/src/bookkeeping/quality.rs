//! Quality checks and the history-window gate

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

use spine_core::{PartitionKey, QualityOutcome, Result, Severity};
use spine_storage::models::{NewAnomaly, NewQualityResult};
use spine_storage::{BookkeepingStore, CoreStore};

/// How the actual value is compared against the expectation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityComparison {
    AtLeast,
    AtMost,
    /// Equal within the warn tolerance
    Equal,
}

/// One quality check over a partition
#[derive(Debug, Clone)]
pub struct QualityCheck {
    pub name: String,
    pub comparison: QualityComparison,
    pub actual: f64,
    pub expected: f64,
    /// Relative deviation tolerated as WARN before failing (e.g. 0.05)
    pub warn_tolerance: f64,
}

impl QualityCheck {
    pub fn at_least(name: impl Into<String>, actual: f64, expected: f64) -> Self {
        Self {
            name: name.into(),
            comparison: QualityComparison::AtLeast,
            actual,
            expected,
            warn_tolerance: 0.0,
        }
    }

    pub fn at_most(name: impl Into<String>, actual: f64, expected: f64) -> Self {
        Self {
            name: name.into(),
            comparison: QualityComparison::AtMost,
            actual,
            expected,
            warn_tolerance: 0.0,
        }
    }

    pub fn equal(name: impl Into<String>, actual: f64, expected: f64) -> Self {
        Self {
            name: name.into(),
            comparison: QualityComparison::Equal,
            actual,
            expected,
            warn_tolerance: 0.0,
        }
    }

    pub fn with_warn_tolerance(mut self, tolerance: f64) -> Self {
        self.warn_tolerance = tolerance.max(0.0);
        self
    }

    fn evaluate(&self) -> QualityOutcome {
        let pass = match self.comparison {
            QualityComparison::AtLeast => self.actual >= self.expected,
            QualityComparison::AtMost => self.actual <= self.expected,
            QualityComparison::Equal => (self.actual - self.expected).abs() < f64::EPSILON,
        };
        if pass {
            return QualityOutcome::Pass;
        }

        if self.warn_tolerance > 0.0 && self.expected != 0.0 {
            let deviation = (self.actual - self.expected).abs() / self.expected.abs();
            if deviation <= self.warn_tolerance {
                return QualityOutcome::Warn;
            }
        }
        QualityOutcome::Fail
    }
}

/// Aggregate outcome of a check batch
#[derive(Debug, Clone)]
pub struct QualityReport {
    pub results: Vec<(String, QualityOutcome)>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        !self
            .results
            .iter()
            .any(|(_, outcome)| *outcome == QualityOutcome::Fail)
    }

    pub fn failures(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, o)| *o == QualityOutcome::Fail)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// The subset of a requested history window that actually exists
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    pub satisfied: Vec<NaiveDate>,
    pub missing: Vec<NaiveDate>,
}

impl HistoryWindow {
    /// True when every requested week is present
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Runs quality checks and history-window gates for one execution
#[derive(Clone)]
pub struct QualityRunner {
    store: Arc<dyn CoreStore>,
    execution_id: Uuid,
}

impl QualityRunner {
    pub fn new(store: Arc<dyn CoreStore>, execution_id: Uuid) -> Self {
        Self {
            store,
            execution_id,
        }
    }

    /// Evaluate and persist a batch of checks
    pub async fn run(
        &self,
        domain: &str,
        partition: &PartitionKey,
        checks: Vec<QualityCheck>,
    ) -> Result<QualityReport> {
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let outcome = check.evaluate();
            self.store
                .insert_quality(NewQualityResult {
                    domain: domain.to_string(),
                    partition_key: partition.to_string(),
                    check_name: check.name.clone(),
                    outcome,
                    actual: Some(check.actual),
                    expected: Some(check.expected),
                    details: None,
                    execution_id: self.execution_id,
                })
                .await?;
            results.push((check.name, outcome));
        }
        Ok(QualityReport { results })
    }

    /// History-window quality gate.
    ///
    /// Checks that the `n_weeks` weekly partitions ending at `week_ending`
    /// (inclusive, stepping back 7 days) have the given manifest stage
    /// complete. When the window is short, records an
    /// `Anomaly(ERROR, HISTORY_WINDOW_INSUFFICIENT)` and still returns the
    /// valid subset — callers tolerate partial windows at symbol granularity
    /// or return early without writing.
    pub async fn require_history_window(
        &self,
        domain: &str,
        tier: &str,
        week_ending: NaiveDate,
        stage: &str,
        n_weeks: u32,
    ) -> Result<HistoryWindow> {
        let mut satisfied = Vec::new();
        let mut missing = Vec::new();

        for i in 0..n_weeks {
            let week = week_ending - chrono::Duration::weeks(i as i64);
            let partition = PartitionKey::new()
                .with("tier", tier)
                .with("week_ending", week.format("%Y-%m-%d").to_string());
            let entry = self
                .store
                .get_manifest(domain, &partition.to_string(), stage)
                .await?;
            if entry.is_some() {
                satisfied.push(week);
            } else {
                missing.push(week);
            }
        }

        if !missing.is_empty() {
            let partition = PartitionKey::new()
                .with("tier", tier)
                .with("week_ending", week_ending.format("%Y-%m-%d").to_string());
            self.store
                .insert_anomaly(
                    NewAnomaly::new(
                        domain,
                        Severity::Error,
                        "HISTORY_WINDOW_INSUFFICIENT",
                        format!(
                            "history window {stage} has {}/{} weeks ending {week_ending}",
                            satisfied.len(),
                            n_weeks
                        ),
                    )
                    .with_partition(partition.to_string())
                    .with_stage(stage)
                    .with_execution(self.execution_id)
                    .with_details(json!({
                        "missing": missing
                            .iter()
                            .map(|d| d.format("%Y-%m-%d").to_string())
                            .collect::<Vec<_>>(),
                    })),
                )
                .await?;
        }

        Ok(HistoryWindow { satisfied, missing })
    }
}
