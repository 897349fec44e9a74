//! Service resize state.
//!
//! Looks up the current instance count with a synchronous release-history
//! task, computes the desired count and queues the resize. The lookup
//! suspends the calling invocation only, never the executor loop.

use super::{UNEXPECTED_RESPONSE_COUNT, single_reply};
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
    ContextElement, ContextElementType, DelegateTask, ExecutionStatus, ResponseData, TaskType,
};
use std::sync::Arc;
use tracing::info;

/// Desired size of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ResizeTarget {
    /// Absolute instance count.
    Count(u32),
    /// Percentage of the current instance count, rounded up.
    Percentage(u32),
}

impl ResizeTarget {
    /// Computes the desired count from the current one.
    ///
    /// # Errors
    /// Returns `StateError::InvalidConfiguration` for a percentage above 100.
    pub fn desired(self, current: u32) -> Result<u32> {
        match self {
            Self::Count(count) => Ok(count),
            Self::Percentage(p) if p > 100 => Err(StateError::InvalidConfiguration(format!(
                "resize percentage {p} exceeds 100"
            ))),
            Self::Percentage(p) => Ok(current.saturating_mul(p).div_ceil(100)),
        }
    }
}

/// Snapshot of the resize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResizeExecutionData {
    /// Rendered service name.
    pub service_name: String,
    /// Count before the resize.
    pub previous_count: u32,
    /// Count requested.
    pub desired_count: u32,
}

/// Resizes a service on the delegate.
pub struct ServiceResizeState {
    name: String,
    service_name: String,
    target: ResizeTarget,
    dispatcher: Arc<DelegateTaskDispatcher>,
}

impl std::fmt::Debug for ServiceResizeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceResizeState")
            .field("name", &self.name)
            .field("service_name", &self.service_name)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl ServiceResizeState {
    /// Creates a resize state.
    ///
    /// # Arguments
    /// * `name` - State name
    /// * `service_name` - Service to resize (may contain expressions)
    /// * `target` - Desired size
    /// * `dispatcher` - Delegate task dispatcher
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        service_name: impl Into<String>,
        target: ResizeTarget,
        dispatcher: Arc<DelegateTaskDispatcher>,
    ) -> Self {
        Self { name: name.into(), service_name: service_name.into(), target, dispatcher }
    }

    fn instance_count(payload: &Value) -> Result<u32> {
        payload
            .get("instance_count")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| StateError::UnexpectedResponse("release history without instance count".to_string()))
    }

    fn published(data: &ServiceResizeExecutionData) -> ContextElement {
        ContextElement::new(
            ContextElementType::Service,
            data.service_name.clone(),
            json!({ "instance_count": data.desired_count, "previous_count": data.previous_count }),
        )
    }
}

#[async_trait]
impl State for ServiceResizeState {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::ServiceResize
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResponse> {
        let service_name = ctx.render_or_literal(&self.service_name);
        let ids = ctx.ids();

        let history = self
            .dispatcher
            .execute_task(
                DelegateTask::new(TaskType::ReleaseHistory, &ids.account_id, &ids.app_id)
                    .with_parameter(json!({ "service": service_name })),
            )
            .await?;
        if let ResponseData::Error { message, .. } = &history {
            return Ok(ExecutionResponse::failed(format!("Release history lookup failed: {message}")));
        }
        let previous_count = Self::instance_count(history.payload())?;
        let desired_count = self.target.desired(previous_count)?;

        let data = ServiceResizeExecutionData { service_name, previous_count, desired_count };
        if desired_count == previous_count {
            info!(state_name = %self.name, count = desired_count, "Service already at desired size");
            return Ok(ExecutionResponse::success()
                .with_context_element(Self::published(&data))
                .with_state_execution_data(StateExecutionData::new(ExecutionStatus::Success).with_payload(&data)?));
        }

        let queued = self
            .dispatcher
            .queue_task(
                DelegateTask::new(TaskType::ServiceResize, &ids.account_id, &ids.app_id).with_parameter(json!({
                    "service": data.service_name,
                    "previous_count": previous_count,
                    "desired_count": desired_count,
                })),
            )
            .await?;
        info!(
            state_name = %self.name,
            service = %data.service_name,
            previous_count,
            desired_count,
            "Service resize queued"
        );

        Ok(ExecutionResponse::suspend(vec![queued.correlation_id])
            .with_delegate_task_id(queued.task_id)
            .with_state_execution_data(StateExecutionData::new(ExecutionStatus::Running).with_payload(&data)?))
    }

    async fn handle_async_response(
        &self,
        ctx: &ExecutionContext,
        responses: ResponseMap,
    ) -> Result<ExecutionResponse> {
        let Some((_, reply)) = single_reply(responses) else {
            return Ok(ExecutionResponse::failed(UNEXPECTED_RESPONSE_COUNT));
        };
        let data: ServiceResizeExecutionData = ctx
            .state_execution_data()
            .ok_or_else(|| StateError::UnexpectedResponse("missing resize execution data".to_string()))?
            .payload_as()?;

        if !reply.status().is_success() {
            let message = reply.error_message().unwrap_or("Service resize failed").to_string();
            return Ok(ExecutionResponse::failed(message)
                .with_state_execution_data(StateExecutionData::new(ExecutionStatus::Failed).with_payload(&data)?));
        }
        Ok(ExecutionResponse::success()
            .with_context_element(Self::published(&data))
            .with_state_execution_data(StateExecutionData::new(ExecutionStatus::Success).with_payload(&data)?))
    }
}
