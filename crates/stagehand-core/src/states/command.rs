//! Command state.
//!
//! Runs a named deployment command on the delegate. The activity id doubles
//! as the correlation id of the task, so the reply can be matched back to
//! the activity it finalizes.

use super::{UNEXPECTED_RESPONSE_COUNT, single_reply};
use crate::activity::ActivityRecorder;
use crate::context::ExecutionContext;
use crate::dispatcher::DelegateTaskDispatcher;
use crate::error::{Result, StateError};
use crate::registry::ResponseMap;
use crate::response::{ExecutionResponse, StateExecutionData};
use crate::state::{State, StateType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stagehand_abstraction::{
    ContextElementType, CorrelationId, DelegateTask, ExecutionStatus, ResponseData, TaskType,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Snapshot kept while the command runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStateExecutionData {
    /// Activity recording the run.
    pub activity_id: String,
    /// Command that was dispatched.
    pub command_name: String,
    /// Target host, when a host element was bound.
    pub host_name: Option<String>,
    /// Rendered command arguments.
    pub arguments: Vec<String>,
    /// Delegate result, once received.
    pub result: Option<Value>,
}

/// Runs a command on the delegate.
pub struct CommandState {
    name: String,
    command_name: String,
    arguments: Vec<String>,
    timeout: Option<Duration>,
    recorder: ActivityRecorder,
    dispatcher: Arc<DelegateTaskDispatcher>,
}

impl std::fmt::Debug for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandState")
            .field("name", &self.name)
            .field("command_name", &self.command_name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CommandState {
    /// Creates a command state.
    ///
    /// # Arguments
    /// * `name` - State name
    /// * `command_name` - Command the delegate runs
    /// * `recorder` - Activity recorder
    /// * `dispatcher` - Delegate task dispatcher
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        command_name: impl Into<String>,
        recorder: ActivityRecorder,
        dispatcher: Arc<DelegateTaskDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            command_name: command_name.into(),
            arguments: Vec::new(),
            timeout: None,
            recorder,
            dispatcher,
        }
    }

    /// Adds a command argument; `${...}` expressions are rendered at execution.
    #[must_use]
    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Sets the task timeout, which also bounds the state.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn fail_activity(&self, ctx: &ExecutionContext, activity_id: &str) {
        if let Err(e) = self
            .recorder
            .update_status(&ctx.ids().app_id, activity_id, ExecutionStatus::Failed)
            .await
        {
            warn!(activity_id = %activity_id, error = %e, "Failed to mark activity FAILED");
        }
    }
}

#[async_trait]
impl State for CommandState {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::Command
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResponse> {
        if self.command_name.trim().is_empty() {
            return Err(StateError::InvalidConfiguration("command name is required".to_string()));
        }

        let host_name = ctx.context_element(ContextElementType::Host).map(|h| h.value_as_string());
        let arguments: Vec<String> =
            self.arguments.iter().map(|a| ctx.render_or_literal(a)).collect();

        let activity = self.recorder.create(ctx, StateType::Command, &self.command_name).await?;
        let activity_id = activity
            .id
            .ok_or_else(|| StateError::UnexpectedResponse("activity saved without id".to_string()))?;

        let ids = ctx.ids();
        let mut task = DelegateTask::new(TaskType::Command, &ids.account_id, &ids.app_id)
            .with_wait_id(CorrelationId::from(activity_id.clone()))
            .with_parameter(json!({
                "command_name": self.command_name,
                "activity_id": activity_id,
                "host": host_name,
                "arguments": arguments,
            }));
        if let Some(env_id) = &ids.env_id {
            task = task.with_env_id(env_id);
        }
        if let Some(infra_mapping_id) = &ids.infra_mapping_id {
            task = task.with_infra_mapping_id(infra_mapping_id);
        }
        if let Some(timeout) = self.timeout {
            task = task.with_timeout(timeout);
        }

        let queued = match self.dispatcher.queue_task(task).await {
            Ok(queued) => queued,
            Err(e) => {
                self.fail_activity(ctx, &activity_id).await;
                return Err(e);
            }
        };

        info!(
            state_name = %self.name,
            command_name = %self.command_name,
            activity_id = %activity_id,
            "Command dispatched"
        );

        let data = CommandStateExecutionData {
            activity_id,
            command_name: self.command_name.clone(),
            host_name,
            arguments,
            result: None,
        };
        Ok(ExecutionResponse::suspend(vec![queued.correlation_id])
            .with_delegate_task_id(queued.task_id)
            .with_state_execution_data(StateExecutionData::new(ExecutionStatus::Running).with_payload(&data)?))
    }

    async fn handle_async_response(
        &self,
        ctx: &ExecutionContext,
        responses: ResponseMap,
    ) -> Result<ExecutionResponse> {
        let Some((activity_id, reply)) = single_reply(responses) else {
            return Ok(ExecutionResponse::failed(UNEXPECTED_RESPONSE_COUNT));
        };

        if let ResponseData::Error { message, .. } = &reply {
            self.fail_activity(ctx, activity_id.as_str()).await;
            return Ok(ExecutionResponse::failed(message.clone()));
        }

        let status = if reply.status().is_success() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        self.recorder.update_status(&ctx.ids().app_id, activity_id.as_str(), status).await?;

        let mut data: CommandStateExecutionData = match ctx.state_execution_data() {
            Some(snapshot) => snapshot.payload_as()?,
            None => CommandStateExecutionData {
                activity_id: activity_id.to_string(),
                command_name: self.command_name.clone(),
                host_name: None,
                arguments: Vec::new(),
                result: None,
            },
        };
        data.result = Some(reply.payload().clone());

        let error_message = reply.error_message().map(str::to_string);
        let mut snapshot = StateExecutionData::new(status).with_payload(&data)?;
        if let Some(msg) = &error_message {
            snapshot = snapshot.with_error_msg(msg.clone());
        }
        Ok(ExecutionResponse::terminal(status, error_message).with_state_execution_data(snapshot))
    }

    async fn handle_abort_event(&self, ctx: &ExecutionContext) -> Result<()> {
        let Some(snapshot) = ctx.state_execution_data() else {
            return Ok(());
        };
        let data: CommandStateExecutionData = snapshot.payload_as()?;
        self.recorder
            .update_status(&ctx.ids().app_id, &data.activity_id, ExecutionStatus::Aborted)
            .await?;
        Ok(())
    }
}
