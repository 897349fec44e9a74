//! Delegate tasks, correlation ids and the replies that flow back.

use crate::{ContextElement, DelegateError, ExecutionStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Token joining an asynchronous dispatch to its eventual notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mints a fresh, unguessable correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned by the delegate service for a submitted task.
///
/// Used for tracing and cancellation only, never for result retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new random task id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of remote work a delegate performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Run a deployment command on a host.
    Command,
    /// Run a shell script.
    ShellScript,
    /// Perform an HTTP call.
    Http,
    /// Trigger a Jenkins job.
    Jenkins,
    /// Trigger a Bamboo plan.
    Bamboo,
    /// Resize a service to a desired instance count.
    ServiceResize,
    /// Query the release history of a service.
    ReleaseHistory,
    /// Collect log records for verification.
    LogCollection,
    /// Collect metrics for verification.
    MetricCollection,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "COMMAND",
            Self::ShellScript => "SHELL_SCRIPT",
            Self::Http => "HTTP",
            Self::Jenkins => "JENKINS",
            Self::Bamboo => "BAMBOO",
            Self::ServiceResize => "SERVICE_RESIZE",
            Self::ReleaseHistory => "RELEASE_HISTORY",
            Self::LogCollection => "LOG_COLLECTION",
            Self::MetricCollection => "METRIC_COLLECTION",
        };
        f.write_str(name)
    }
}

/// A unit of work submitted to the delegate subsystem.
///
/// The parameter list is opaque to the engine; it is passed through to the
/// handler registered for the task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateTask {
    /// Kind of work.
    pub task_type: TaskType,
    /// Owning account.
    pub account_id: String,
    /// Owning application.
    pub app_id: String,
    /// Target environment.
    pub env_id: Option<String>,
    /// Target infrastructure mapping.
    pub infra_mapping_id: Option<String>,
    /// Opaque, ordered parameters.
    pub parameters: Vec<Value>,
    /// Correlation id the reply is delivered to.
    pub wait_id: Option<CorrelationId>,
    /// Execution timeout (the dispatcher applies a default when `None`).
    #[serde(with = "duration_ms", default)]
    pub timeout: Option<Duration>,
    /// `true` for fire-and-forget tasks that reply through the notification sink.
    pub is_async: bool,
}

impl DelegateTask {
    /// Creates an async task with no parameters.
    ///
    /// # Arguments
    /// * `task_type` - Kind of work
    /// * `account_id` - Owning account
    /// * `app_id` - Owning application
    #[must_use]
    pub fn new(task_type: TaskType, account_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            task_type,
            account_id: account_id.into(),
            app_id: app_id.into(),
            env_id: None,
            infra_mapping_id: None,
            parameters: Vec::new(),
            wait_id: None,
            timeout: None,
            is_async: true,
        }
    }

    /// Sets the environment id.
    #[must_use]
    pub fn with_env_id(mut self, env_id: impl Into<String>) -> Self {
        self.env_id = Some(env_id.into());
        self
    }

    /// Sets the infrastructure mapping id.
    #[must_use]
    pub fn with_infra_mapping_id(mut self, infra_mapping_id: impl Into<String>) -> Self {
        self.infra_mapping_id = Some(infra_mapping_id.into());
        self
    }

    /// Appends a parameter.
    #[must_use]
    pub fn with_parameter(mut self, parameter: Value) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Sets the correlation id the reply is delivered to.
    #[must_use]
    pub fn with_wait_id(mut self, wait_id: CorrelationId) -> Self {
        self.wait_id = Some(wait_id);
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the task as synchronous.
    #[must_use]
    pub fn synchronous(mut self) -> Self {
        self.is_async = false;
        self
    }
}

/// A reply delivered for a correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    /// Result of a delegate task.
    Task {
        /// Status reported by the delegate.
        status: ExecutionStatus,
        /// Task-specific output.
        payload: Value,
        /// Diagnostic for non-success results.
        error_message: Option<String>,
    },
    /// The task could not produce a result.
    Error {
        /// Diagnostic message.
        message: String,
        /// `true` when the error was caused by an elapsed timeout.
        timed_out: bool,
    },
    /// Terminal notification from a child state instance.
    Element {
        /// Terminal status of the child.
        status: ExecutionStatus,
        /// Diagnostic for non-success results.
        error_message: Option<String>,
        /// Notify elements produced by the child.
        elements: Vec<ContextElement>,
    },
}

impl ResponseData {
    /// Creates a successful task result.
    #[must_use]
    pub fn success(payload: Value) -> Self {
        Self::Task { status: ExecutionStatus::Success, payload, error_message: None }
    }

    /// Creates a failed task result.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Task {
            status: ExecutionStatus::Failed,
            payload: Value::Null,
            error_message: Some(message.into()),
        }
    }

    /// Creates an error reply.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into(), timed_out: false }
    }

    /// Creates a timeout-failure reply.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Error { message: message.into(), timed_out: true }
    }

    /// Returns the status this reply reduces to.
    ///
    /// `Error` replies reduce to ERROR.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Task { status, .. } | Self::Element { status, .. } => *status,
            Self::Error { .. } => ExecutionStatus::Error,
        }
    }

    /// Returns the diagnostic message, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Task { error_message, .. } | Self::Element { error_message, .. } => {
                error_message.as_deref()
            }
            Self::Error { message, .. } => Some(message),
        }
    }

    /// Returns the task payload, or `Value::Null` for other replies.
    #[must_use]
    pub fn payload(&self) -> &Value {
        match self {
            Self::Task { payload, .. } => payload,
            _ => &Value::Null,
        }
    }

    /// Returns `true` for timeout-failure replies.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Error { timed_out: true, .. })
    }
}

/// Remote execution boundary.
#[async_trait]
pub trait DelegateService: Send + Sync {
    /// Submits an async task and returns immediately.
    ///
    /// The reply is later delivered to the task's `wait_id`. Every accepted
    /// task produces exactly one terminal reply (real or timeout-failure).
    ///
    /// # Errors
    /// Returns a `DelegateError` if the task cannot be accepted.
    async fn submit(&self, task: DelegateTask) -> Result<TaskId, DelegateError>;

    /// Runs a task and waits for its result.
    ///
    /// # Errors
    /// Returns a `DelegateError` if the task fails to execute or times out.
    async fn run(&self, task: DelegateTask) -> Result<ResponseData, DelegateError>;

    /// Best-effort cancellation of a submitted task.
    ///
    /// # Returns
    /// `true` if the task was still running and has been cancelled.
    async fn abort(&self, task_id: &TaskId) -> bool;
}

/// Channel through which replies are posted by correlation id.
pub trait NotificationSink: Send + Sync {
    /// Delivers `data` to the waiter registered for `correlation_id`.
    ///
    /// # Returns
    /// `false` if nobody was waiting (the reply is dropped).
    fn notify(&self, correlation_id: &CorrelationId, data: ResponseData) -> bool;
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
