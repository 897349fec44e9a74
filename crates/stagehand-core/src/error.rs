// Error types for state execution

use stagehand_abstraction::{CorrelationId, DelegateError, EvaluationError, StoreError};
use thiserror::Error;

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Correlation registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The id already has a waiter (or was reserved twice)
    #[error("Correlation id {0} is already registered")]
    DuplicateCorrelationId(CorrelationId),

    /// A batch must name at least one id
    #[error("Cannot wait on an empty correlation set")]
    EmptyCorrelationSet,
}

/// State execution errors
#[derive(Debug, Error)]
pub enum StateError {
    /// Missing or invalid state configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Expression rendering failed
    #[error("Expression error: {0}")]
    Evaluation(#[from] EvaluationError),

    /// Delegate subsystem error
    #[error("{0}")]
    Delegate(#[from] DelegateError),

    /// Activity store error
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Correlation registry error
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// A synchronous delegate task did not reply in time
    #[error("Task {task_type} timed out after {timeout_ms} ms")]
    TaskTimeout {
        /// Type of the task that timed out
        task_type: String,
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// A reply did not have the expected shape
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Unknown state instance
    #[error("State instance not found: {0}")]
    InstanceNotFound(String),

    /// The executor loop is not running
    #[error("State machine executor is stopped")]
    ExecutorStopped,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error raised by a plugin strategy
    #[error("{0}")]
    Plugin(#[from] anyhow::Error),
}
