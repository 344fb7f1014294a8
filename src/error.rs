//! Orchestrator error types
//!
//! The error taxonomy a gateway can observe from the orchestrator. Errors are
//! stored with a job's outcome and handed verbatim to every waiter attached to
//! the job's fingerprint, possibly in another process, so they are cloneable
//! and serializable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the queue, the cache and the pre-aggregation layer
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum OrchestratorError {
    /// Query execution failed in the driver
    #[error("Driver error: {message}")]
    Driver { message: String, transient: bool },

    /// The worker owning the job stopped heartbeating and the retry budget is spent
    #[error("Query stalled: {fingerprint} (no heartbeat after {attempts} attempts)")]
    Stalled { fingerprint: String, attempts: u32 },

    /// The job was superseded by a newer request or removed by an operator
    #[error("Query cancelled: {fingerprint}")]
    Cancelled { fingerprint: String },

    /// Polling signal: the job is still running, ask again
    #[error("Continue wait")]
    ContinueWait,

    /// A partition required by a rollup join is missing or incompatible
    #[error("Rollup join mismatch: {0}")]
    RollupJoinMismatch(String),

    /// Build range resolution failed
    #[error("Build range error: {0}")]
    BuildRange(String),

    /// A single execution ran past the execution timeout
    #[error("Query execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    /// The request itself is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A partition has no version entry and this process may not build it
    #[error("Pre-aggregation partition not built: {0}")]
    PartitionNotBuilt(String),

    /// The cache/queue store failed
    #[error("Store error: {0}")]
    Store(String),
}

impl OrchestratorError {
    /// A non-retryable driver failure
    pub fn driver(message: impl Into<String>) -> Self {
        OrchestratorError::Driver {
            message: message.into(),
            transient: false,
        }
    }

    /// A driver failure worth retrying (connection reset, lock contention)
    pub fn transient(message: impl Into<String>) -> Self {
        OrchestratorError::Driver {
            message: message.into(),
            transient: true,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Driver {
                transient: true,
                ..
            }
        )
    }

    pub fn is_continue_wait(&self) -> bool {
        matches!(self, OrchestratorError::ContinueWait)
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Driver { .. } => "DRIVER_ERROR",
            OrchestratorError::Stalled { .. } => "STALLED_QUERY",
            OrchestratorError::Cancelled { .. } => "CANCELLED",
            OrchestratorError::ContinueWait => "CONTINUE_WAIT",
            OrchestratorError::RollupJoinMismatch(_) => "ROLLUP_JOIN_MISMATCH",
            OrchestratorError::BuildRange(_) => "BUILD_RANGE_ERROR",
            OrchestratorError::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            OrchestratorError::InvalidRequest(_) => "INVALID_REQUEST",
            OrchestratorError::PartitionNotBuilt(_) => "PARTITION_NOT_BUILT",
            OrchestratorError::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        OrchestratorError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::InvalidRequest(err.to_string())
    }
}

/// Result type alias for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::Stalled {
            fingerprint: "abc".to_string(),
            attempts: 2,
        };
        assert_eq!(
            err.to_string(),
            "Query stalled: abc (no heartbeat after 2 attempts)"
        );
        assert_eq!(OrchestratorError::ContinueWait.to_string(), "Continue wait");
    }

    #[test]
    fn test_transient_classification() {
        assert!(OrchestratorError::transient("database is locked").is_transient());
        assert!(!OrchestratorError::driver("syntax error").is_transient());
        assert!(!OrchestratorError::BuildRange("no rows".into()).is_transient());
    }

    #[test]
    fn test_error_survives_serialization() {
        let errors = vec![
            OrchestratorError::driver("boom"),
            OrchestratorError::Cancelled {
                fingerprint: "fp".into(),
            },
            OrchestratorError::RollupJoinMismatch("orders_20200101 missing".into()),
            OrchestratorError::ContinueWait,
        ];

        for err in errors {
            let json = serde_json::to_value(&err).unwrap();
            let back: OrchestratorError = serde_json::from_value(json).unwrap();
            assert_eq!(back, err);
        }
    }

    #[test]
    fn test_store_error_conversion() {
        let err: OrchestratorError = StoreError::Lock("poisoned".into()).into();
        assert!(matches!(err, OrchestratorError::Store(_)));
        assert_eq!(err.code(), "STORE_ERROR");
    }
}
