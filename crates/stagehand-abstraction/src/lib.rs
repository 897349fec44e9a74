//! Boundary layer for stagehand.
//!
//! This crate defines the types and traits shared between workflow states and
//! the subsystems they collaborate with: the delegate execution service, the
//! notification channel, the activity (audit) store and the expression
//! renderer. Concrete implementations live in `stagehand-delegate`.

pub mod activity;
pub mod element;
pub mod status;
pub mod task;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use activity::{Activity, ActivityStore};
pub use element::{ContextElement, ContextElementType};
pub use status::ExecutionStatus;
pub use task::{
    CorrelationId, DelegateService, DelegateTask, NotificationSink, ResponseData, TaskId,
    TaskType,
};

/// Represents an error raised by the delegate execution subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegateError {
    /// No delegate is able to pick up the task.
    #[error("No eligible delegate for task type {0}")]
    NoEligibleDelegate(String),

    /// The task was rejected before execution (e.g., malformed parameters).
    #[error("Delegate task rejected: {0}")]
    Rejected(String),

    /// The task did not complete within its timeout.
    #[error("Delegate task {task_id} timed out after {timeout_ms} ms")]
    TaskTimeout {
        /// The task that timed out.
        task_id: String,
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The task was aborted before it produced a result.
    #[error("Delegate task {0} was aborted")]
    Aborted(String),

    /// The delegate service is shut down or unreachable.
    #[error("Delegate service unavailable: {0}")]
    Unavailable(String),

    /// Other unexpected errors.
    #[error("Delegate error: {0}")]
    Other(String),
}

/// Represents an error raised by the activity store.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("Activity not found: {0}")]
    NotFound(String),

    /// The record failed validation before being saved.
    #[error("Invalid activity: {0}")]
    Invalid(String),

    /// The backing store failed.
    #[error("Activity store error: {0}")]
    Backend(String),
}

/// Represents an error raised while rendering or evaluating an expression.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationError {
    /// A referenced variable is not present in the context.
    #[error("Unresolved expression: {0}")]
    Unresolved(String),

    /// The expression is malformed.
    #[error("Invalid expression syntax: {0}")]
    Syntax(String),
}

/// Renders templates and evaluates expressions against workflow variables.
///
/// Implementations are pure: the same template and variables always produce
/// the same result. Callers treat failures as recoverable.
pub trait ExpressionEvaluator: Send + Sync {
    /// Renders every expression embedded in `template`.
    ///
    /// # Arguments
    /// * `template` - Text containing zero or more `${...}` expressions
    /// * `variables` - JSON object the expressions are resolved against
    ///
    /// # Errors
    /// Returns an `EvaluationError` if any expression cannot be resolved.
    fn render(&self, template: &str, variables: &Value) -> Result<String, EvaluationError>;

    /// Evaluates a single expression to a structured value.
    ///
    /// # Arguments
    /// * `expression` - The expression, with or without the `${}` wrapper
    /// * `variables` - JSON object the expression is resolved against
    ///
    /// # Errors
    /// Returns an `EvaluationError` if the expression cannot be resolved.
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, EvaluationError>;
}
