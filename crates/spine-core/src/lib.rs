// Shared types for the Spine orchestration core.
//
// This crate has no database or runtime dependencies. It holds the vocabulary
// the rest of the workspace speaks: the error taxonomy, pipeline parameter
// schemas, capture identity (three-clock model), lanes/statuses, and tier
// capability flags.

pub mod capabilities;
pub mod capture;
pub mod config;
pub mod error;
pub mod params;
pub mod types;

pub use capabilities::{Capabilities, Tier};
pub use capture::{CaptureId, CaptureStamp};
pub use config::{CoreConfig, LogFormat};
pub use error::{ErrorKind, Result, SpineError};
pub use params::{
    logical_key, validate_params, ParamDef, ParamNormalizer, ParamType, TierDateNormalizer,
};
pub use types::{
    BackfillStatus, ExecutionStatus, Lane, PartitionKey, QualityOutcome, ScheduleRunStatus,
    Severity, StepStatus, TriggerSource, WorkItemStatus, WorkflowRunStatus,
};
