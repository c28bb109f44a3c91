// Error taxonomy for the orchestration core
//
// Every failure in the system is tagged with an ErrorKind; the kind decides
// whether the retry machinery may re-attempt the work and which code the
// user-visible envelope carries. Errors are values, not control flow.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, SpineError>;

/// Classification of a failure, independent of where it surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Connection reset, request timeout — retryable
    TransientNetwork,
    /// Deadlock, connection pool exhaustion — retryable
    TransientDatabase,
    /// Upstream publisher misbehaving (5xx, malformed payload) — retried with backoff
    Source,
    /// File/format could not be parsed
    Parse,
    /// Business-rule violation
    Validation,
    /// Invalid parameters or missing required configuration
    Config,
    /// Credential or permission failure
    Auth,
    /// State-machine violation (e.g. cancel on a terminal execution)
    Orchestration,
    /// Unexpected bug
    Internal,
}

impl ErrorKind {
    /// Whether the retry machinery may re-attempt work that failed with this kind
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork | ErrorKind::TransientDatabase | ErrorKind::Source
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "TRANSIENT_NETWORK",
            ErrorKind::TransientDatabase => "TRANSIENT_DATABASE",
            ErrorKind::Source => "SOURCE",
            ErrorKind::Parse => "PARSE",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Auth => "AUTH",
            ErrorKind::Orchestration => "ORCHESTRATION",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the orchestration core
#[derive(Debug, Error)]
pub enum SpineError {
    /// Network-level failure talking to an upstream or the database host
    #[error("network error: {0}")]
    Network(String),

    /// Database failure (deadlock, lost connection, constraint we don't own)
    #[error("database error: {0}")]
    Database(String),

    /// Upstream source returned garbage or a retryable server error
    #[error("source error: {0}")]
    Source(String),

    /// Input could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Business-rule violation
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid parameters or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential or permission failure
    #[error("auth error: {0}")]
    Auth(String),

    /// No pipeline registered under this name
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    /// Submitted parameters failed schema validation
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Another live execution holds the same logical key
    #[error("duplicate logical key: {0}")]
    DuplicateLogicalKey(String),

    /// A concurrency lock is held by another owner
    #[error("lock contended: {0}")]
    LockContended(String),

    /// Entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Cancel requested on an execution that already reached a terminal state
    #[error("execution {0} is not cancellable")]
    NotCancellable(Uuid),

    /// State-machine violation
    #[error("orchestration error: {0}")]
    Orchestration(String),

    /// Cooperative cancellation observed at a suspension point
    #[error("cancelled")]
    Cancelled,

    /// Hard execution timeout elapsed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Unexpected bug
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SpineError {
    /// Taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpineError::Network(_) => ErrorKind::TransientNetwork,
            SpineError::Database(_) => ErrorKind::TransientDatabase,
            SpineError::Source(_) => ErrorKind::Source,
            SpineError::Parse(_) => ErrorKind::Parse,
            SpineError::Validation(_) => ErrorKind::Validation,
            SpineError::Config(_) | SpineError::InvalidParams(_) => ErrorKind::Config,
            SpineError::Auth(_) => ErrorKind::Auth,
            SpineError::PipelineNotFound(_)
            | SpineError::NotFound(_)
            | SpineError::NotCancellable(_)
            | SpineError::DuplicateLogicalKey(_)
            | SpineError::LockContended(_)
            | SpineError::Orchestration(_)
            | SpineError::Cancelled => ErrorKind::Orchestration,
            // Timeouts behave like transient failures for retry purposes
            SpineError::Timeout(_) => ErrorKind::TransientNetwork,
            SpineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable code for user-visible error envelopes
    pub fn code(&self) -> &'static str {
        match self {
            SpineError::PipelineNotFound(_) => "PIPELINE_NOT_FOUND",
            SpineError::InvalidParams(_) => "INVALID_PARAMS",
            SpineError::DuplicateLogicalKey(_) => "DUPLICATE_LOGICAL_KEY",
            SpineError::LockContended(_) => "LOCK_CONTENDED",
            SpineError::NotFound(_) => "NOT_FOUND",
            SpineError::NotCancellable(_) => "NOT_CANCELLABLE",
            SpineError::Cancelled => "CANCELLED",
            SpineError::Timeout(_) => "TIMEOUT",
            _ => self.kind().as_str(),
        }
    }

    /// Whether the retry machinery may re-attempt the failed work
    pub fn retryable(&self) -> bool {
        // Cancellation is terminal even though its kind is ORCHESTRATION
        if matches!(self, SpineError::Cancelled) {
            return false;
        }
        self.kind().retryable()
    }

    pub fn network(msg: impl Into<String>) -> Self {
        SpineError::Network(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        SpineError::Database(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        SpineError::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SpineError::Config(msg.into())
    }

    pub fn orchestration(msg: impl Into<String>) -> Self {
        SpineError::Orchestration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds_are_retryable() {
        assert!(ErrorKind::TransientNetwork.retryable());
        assert!(ErrorKind::TransientDatabase.retryable());
        assert!(ErrorKind::Source.retryable());
    }

    #[test]
    fn test_permanent_kinds_are_not_retryable() {
        assert!(!ErrorKind::Parse.retryable());
        assert!(!ErrorKind::Validation.retryable());
        assert!(!ErrorKind::Config.retryable());
        assert!(!ErrorKind::Auth.retryable());
        assert!(!ErrorKind::Orchestration.retryable());
        assert!(!ErrorKind::Internal.retryable());
    }

    #[test]
    fn test_dispatcher_error_codes() {
        assert_eq!(
            SpineError::PipelineNotFound("x".into()).code(),
            "PIPELINE_NOT_FOUND"
        );
        assert_eq!(
            SpineError::InvalidParams("bad".into()).code(),
            "INVALID_PARAMS"
        );
        assert_eq!(
            SpineError::DuplicateLogicalKey("k".into()).code(),
            "DUPLICATE_LOGICAL_KEY"
        );
    }

    #[test]
    fn test_cancelled_is_never_retryable() {
        assert!(!SpineError::Cancelled.retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(SpineError::Timeout(Duration::from_secs(3600)).retryable());
    }

    #[test]
    fn test_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::TransientNetwork).unwrap();
        assert_eq!(json, "\"TRANSIENT_NETWORK\"");
    }
}
