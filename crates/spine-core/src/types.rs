// Shared enums and value types for the orchestration core

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SpineError;

/// Routing label on a submission; selects executor parallelism.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    #[default]
    Normal,
    /// Low priority; bounded parallelism in pooled mode
    Backfill,
    /// Leased ahead of the other lanes
    Realtime,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Normal => "normal",
            Lane::Backfill => "backfill",
            Lane::Realtime => "realtime",
        }
    }

    /// Lease priority: lower leases first
    pub fn priority(self) -> i16 {
        match self {
            Lane::Realtime => 0,
            Lane::Normal => 1,
            Lane::Backfill => 2,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Lane::Normal),
            "backfill" => Ok(Lane::Backfill),
            "realtime" => Ok(Lane::Realtime),
            other => Err(SpineError::Parse(format!("unknown lane: {other}"))),
        }
    }
}

/// Where a submission came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Cli,
    Http,
    Schedule,
    Retry,
    Backfill,
    Workflow,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Cli => "cli",
            TriggerSource::Http => "http",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Retry => "retry",
            TriggerSource::Backfill => "backfill",
            TriggerSource::Workflow => "workflow",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerSource::Manual),
            "cli" => Ok(TriggerSource::Cli),
            "http" => Ok(TriggerSource::Http),
            "schedule" => Ok(TriggerSource::Schedule),
            "retry" => Ok(TriggerSource::Retry),
            "backfill" => Ok(TriggerSource::Backfill),
            "workflow" => Ok(TriggerSource::Workflow),
            other => Err(SpineError::Parse(format!("unknown trigger source: {other}"))),
        }
    }
}

/// Execution lifecycle state.
///
/// ```text
///   pending ──► queued ──► running ──► completed
///     │           │           │    └──► failed
///     │           │           └────► cancelled
///     └───────────┴─────► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are never left; retries create new executions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// States counted against the live logical-key uniqueness invariant
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    /// Legal next states from this one
    pub fn valid_next(self) -> &'static [ExecutionStatus] {
        use ExecutionStatus::*;
        match self {
            Pending => &[Queued, Running, Cancelled],
            Queued => &[Running, Cancelled],
            Running => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        self.valid_next().contains(&next)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(SpineError::Parse(format!("unknown execution status: {other}"))),
        }
    }
}

/// Anomaly severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warn,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WARN" => Ok(Severity::Warn),
            "ERROR" => Ok(Severity::Error),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(SpineError::Parse(format!("unknown severity: {other}"))),
        }
    }
}

/// Outcome of one quality check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityOutcome {
    Pass,
    Warn,
    Fail,
}

impl QualityOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityOutcome::Pass => "PASS",
            QualityOutcome::Warn => "WARN",
            QualityOutcome::Fail => "FAIL",
        }
    }
}

impl std::fmt::Display for QualityOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityOutcome {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(QualityOutcome::Pass),
            "WARN" => Ok(QualityOutcome::Warn),
            "FAIL" => Ok(QualityOutcome::Fail),
            other => Err(SpineError::Parse(format!("unknown quality outcome: {other}"))),
        }
    }
}

/// Status of a materialized schedule firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleRunStatus {
    Pending,
    Submitted,
    Skipped,
    Failed,
}

impl ScheduleRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleRunStatus::Pending => "PENDING",
            ScheduleRunStatus::Submitted => "SUBMITTED",
            ScheduleRunStatus::Skipped => "SKIPPED",
            ScheduleRunStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ScheduleRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleRunStatus {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ScheduleRunStatus::Pending),
            "SUBMITTED" => Ok(ScheduleRunStatus::Submitted),
            "SKIPPED" => Ok(ScheduleRunStatus::Skipped),
            "FAILED" => Ok(ScheduleRunStatus::Failed),
            other => Err(SpineError::Parse(format!("unknown schedule run status: {other}"))),
        }
    }
}

/// Workflow run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Completed => "completed",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowRunStatus::Running)
    }
}

impl std::fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowRunStatus {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkflowRunStatus::Running),
            "completed" => Ok(WorkflowRunStatus::Completed),
            "failed" => Ok(WorkflowRunStatus::Failed),
            "cancelled" => Ok(WorkflowRunStatus::Cancelled),
            other => Err(SpineError::Parse(format!("unknown workflow run status: {other}"))),
        }
    }
}

/// Per-attempt step state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(SpineError::Parse(format!("unknown step status: {other}"))),
        }
    }
}

/// Backlog work item state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkItemStatus::Pending),
            "in_progress" => Ok(WorkItemStatus::InProgress),
            "completed" => Ok(WorkItemStatus::Completed),
            "failed" => Ok(WorkItemStatus::Failed),
            other => Err(SpineError::Parse(format!("unknown work item status: {other}"))),
        }
    }
}

/// Backfill plan lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BackfillStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackfillStatus::Pending => "pending",
            BackfillStatus::Running => "running",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
            BackfillStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillStatus {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackfillStatus::Pending),
            "running" => Ok(BackfillStatus::Running),
            "completed" => Ok(BackfillStatus::Completed),
            "failed" => Ok(BackfillStatus::Failed),
            "cancelled" => Ok(BackfillStatus::Cancelled),
            other => Err(SpineError::Parse(format!("unknown backfill status: {other}"))),
        }
    }
}

/// Canonicalized business partition key, e.g. `{tier, week_ending}`.
///
/// Rendered as `k=v&k=v` with sorted keys so the same partition always
/// produces the same string for manifest and lock keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(BTreeMap<String, String>);

impl PartitionKey {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str("&")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for PartitionKey {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = BTreeMap::new();
        if s.is_empty() {
            return Ok(PartitionKey(map));
        }
        for pair in s.split('&') {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| SpineError::Parse(format!("bad partition segment: {pair}")))?;
            map.insert(k.to_string(), v.to_string());
        }
        Ok(PartitionKey(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_state_machine_legal_edges() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn test_execution_state_machine_illegal_edges() {
        use ExecutionStatus::*;
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<ExecutionStatus>().unwrap(), s);
        }
    }

    #[test]
    fn test_lane_priority_order() {
        assert!(Lane::Realtime.priority() < Lane::Normal.priority());
        assert!(Lane::Normal.priority() < Lane::Backfill.priority());
    }

    #[test]
    fn test_partition_key_canonical_rendering() {
        let a = PartitionKey::new()
            .with("week_ending", "2025-12-19")
            .with("tier", "NMS_TIER_1");
        let b = PartitionKey::new()
            .with("tier", "NMS_TIER_1")
            .with("week_ending", "2025-12-19");
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "tier=NMS_TIER_1&week_ending=2025-12-19");
    }

    #[test]
    fn test_partition_key_roundtrip() {
        let key = PartitionKey::new()
            .with("tier", "OTC_TIER")
            .with("week_ending", "2025-12-19");
        let parsed: PartitionKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }
}
