//! Result types returned by states.

use crate::error::Result;
use crate::state::State;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_abstraction::{ContextElement, CorrelationId, ExecutionStatus, TaskId};
use std::fmt;
use std::sync::Arc;

/// Snapshot of state-specific progress, kept between suspension points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateExecutionData {
    /// Status at the time of the snapshot.
    pub status: ExecutionStatus,
    /// Diagnostic message, if any.
    pub error_msg: Option<String>,
    /// State-specific payload.
    pub payload: Value,
}

impl Default for StateExecutionData {
    fn default() -> Self {
        Self { status: ExecutionStatus::Running, error_msg: None, payload: Value::Null }
    }
}

impl StateExecutionData {
    /// Creates a snapshot with the given status and no payload.
    #[must_use]
    pub fn new(status: ExecutionStatus) -> Self {
        Self { status, ..Self::default() }
    }

    /// Stores a typed payload.
    ///
    /// # Errors
    /// Returns `StateError::Json` if the payload cannot be serialized.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Sets the diagnostic message.
    #[must_use]
    pub fn with_error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Reads the payload back as `T`.
    ///
    /// # Errors
    /// Returns `StateError::Json` if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A child state instance the executor must start on behalf of a parent.
///
/// When the child terminates, its status is delivered to `notify_id`.
#[derive(Clone)]
pub struct ChildInstance {
    /// Correlation id the child's terminal notification is sent to.
    pub notify_id: CorrelationId,
    /// State the child runs.
    pub state: Arc<dyn State>,
    /// Elements bound into the child's context in addition to the parent's.
    pub elements: Vec<ContextElement>,
}

impl fmt::Debug for ChildInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildInstance")
            .field("notify_id", &self.notify_id)
            .field("state", &self.state.name())
            .field("elements", &self.elements)
            .finish()
    }
}

/// Output of `execute` and `handle_async_response`.
///
/// An async response names the correlation ids to wait on and is never
/// terminal. A sync response carries a terminal status and ends the state.
#[derive(Debug, Clone)]
pub struct ExecutionResponse {
    /// `true` when the state suspends on `correlation_ids`.
    pub is_async: bool,
    /// Ids the state waits on.
    pub correlation_ids: Vec<CorrelationId>,
    /// Current (async) or terminal (sync) status.
    pub execution_status: ExecutionStatus,
    /// Diagnostic shown to operators for non-success statuses.
    pub error_message: Option<String>,
    /// Snapshot persisted until the next call.
    pub state_execution_data: Option<StateExecutionData>,
    /// Elements published to downstream states.
    pub context_elements: Vec<ContextElement>,
    /// Elements delivered to a waiting parent.
    pub notify_elements: Vec<ContextElement>,
    /// Handle of the delegate task in flight, used on abort.
    pub delegate_task_id: Option<TaskId>,
    /// Child instances to start.
    pub spawned: Vec<ChildInstance>,
}

impl ExecutionResponse {
    fn base(is_async: bool, status: ExecutionStatus) -> Self {
        Self {
            is_async,
            correlation_ids: Vec::new(),
            execution_status: status,
            error_message: None,
            state_execution_data: None,
            context_elements: Vec::new(),
            notify_elements: Vec::new(),
            delegate_task_id: None,
            spawned: Vec::new(),
        }
    }

    /// Terminal response with the given status.
    #[must_use]
    pub fn terminal(status: ExecutionStatus, error_message: Option<String>) -> Self {
        Self { error_message, ..Self::base(false, status) }
    }

    /// Terminal SUCCESS.
    #[must_use]
    pub fn success() -> Self {
        Self::base(false, ExecutionStatus::Success)
    }

    /// Terminal FAILED.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::terminal(ExecutionStatus::Failed, Some(message.into()))
    }

    /// Terminal ERROR.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::terminal(ExecutionStatus::Error, Some(message.into()))
    }

    /// Terminal ABORTED.
    #[must_use]
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::terminal(ExecutionStatus::Aborted, Some(message.into()))
    }

    /// Async RUNNING response waiting on `correlation_ids`.
    #[must_use]
    pub fn suspend(correlation_ids: Vec<CorrelationId>) -> Self {
        Self { correlation_ids, ..Self::base(true, ExecutionStatus::Running) }
    }

    /// Sets the execution data snapshot.
    #[must_use]
    pub fn with_state_execution_data(mut self, data: StateExecutionData) -> Self {
        self.state_execution_data = Some(data);
        self
    }

    /// Publishes a context element.
    #[must_use]
    pub fn with_context_element(mut self, element: ContextElement) -> Self {
        self.context_elements.push(element);
        self
    }

    /// Adds notify elements for a waiting parent.
    #[must_use]
    pub fn with_notify_elements(mut self, elements: impl IntoIterator<Item = ContextElement>) -> Self {
        self.notify_elements.extend(elements);
        self
    }

    /// Records the delegate task in flight.
    #[must_use]
    pub fn with_delegate_task_id(mut self, task_id: TaskId) -> Self {
        self.delegate_task_id = Some(task_id);
        self
    }

    /// Adds a child instance to start.
    #[must_use]
    pub fn with_child(mut self, child: ChildInstance) -> Self {
        self.spawned.push(child);
        self
    }

    /// Checks the sync/async invariants.
    ///
    /// # Errors
    /// Returns a description of the first violated invariant.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.is_async {
            if self.correlation_ids.is_empty() {
                return Err("Async response without correlation ids".to_string());
            }
            if self.execution_status.is_final() {
                return Err(format!(
                    "Async response with terminal status {}",
                    self.execution_status
                ));
            }
        } else {
            if !self.execution_status.is_final() {
                return Err(format!(
                    "Synchronous response with non-terminal status {}",
                    self.execution_status
                ));
            }
            if !self.spawned.is_empty() {
                return Err("Synchronous response cannot spawn children".to_string());
            }
        }
        Ok(())
    }

    /// Turns an invalid response into ERROR and fills in a missing error
    /// message on non-success terminal responses.
    ///
    /// The ERROR response keeps the correlation ids and delegate task of the
    /// invalid one so the caller can release them.
    #[must_use]
    pub fn normalize(self) -> Self {
        if let Err(msg) = self.validate() {
            return Self {
                correlation_ids: self.correlation_ids,
                delegate_task_id: self.delegate_task_id,
                ..Self::error(msg).with_notify_elements(self.notify_elements)
            };
        }
        if !self.is_async && !self.execution_status.is_success() && self.error_message.is_none() {
            let status = self.execution_status;
            return Self {
                error_message: Some(format!("State finished with status {status}")),
                ..self
            };
        }
        self
    }
}
