//! The state execution protocol.
//!
//! Every workflow step implements [`State`]. The executor calls `execute`
//! once, `handle_async_response` once per completed batch of correlation ids,
//! and `handle_abort_event` if the workflow is cancelled while the state is
//! outstanding.

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::registry::ResponseMap;
use crate::response::ExecutionResponse;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Kind of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    /// Runs a deployment command.
    Command,
    /// Triggers a Jenkins job.
    Jenkins,
    /// Performs an HTTP call.
    Http,
    /// Resizes a service.
    ServiceResize,
    /// Verifies a deployment from collected logs.
    LogAnalysis,
    /// Fans out over a collection of elements.
    Repeat,
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "COMMAND",
            Self::Jenkins => "JENKINS",
            Self::Http => "HTTP",
            Self::ServiceResize => "SERVICE_RESIZE",
            Self::LogAnalysis => "LOG_ANALYSIS",
            Self::Repeat => "REPEAT",
        };
        f.write_str(name)
    }
}

/// One executable step of a workflow.
#[async_trait]
pub trait State: Send + Sync {
    /// Returns the state name.
    fn name(&self) -> &str;

    /// Returns the state type.
    fn state_type(&self) -> StateType;

    /// Expiry of the whole state; the executor default applies when `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Performs the synchronous portion of the work.
    ///
    /// Must not wait on remote completion: remote work is queued and the
    /// returned response names the correlation ids to wait on.
    ///
    /// # Errors
    /// Any error is converted into a FAILED response carrying its message.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResponse>;

    /// Interprets the replies of one completed batch.
    ///
    /// # Errors
    /// Any error is converted into a FAILED response carrying its message.
    async fn handle_async_response(
        &self,
        ctx: &ExecutionContext,
        responses: ResponseMap,
    ) -> Result<ExecutionResponse>;

    /// Releases local resources after the workflow was cancelled.
    ///
    /// May race a concurrent resume and must be idempotent.
    ///
    /// # Errors
    /// Errors are logged by the caller and otherwise ignored.
    async fn handle_abort_event(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

/// Runs a state call and converts its outcome into a valid response.
///
/// Errors become FAILED with the error message; invalid responses become ERROR.
pub async fn guard<F>(state_name: &str, call: F) -> ExecutionResponse
where
    F: Future<Output = Result<ExecutionResponse>>,
{
    match call.await {
        Ok(response) => response.normalize(),
        Err(e) => {
            warn!(state_name = %state_name, error = %e, "State call failed");
            ExecutionResponse::failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use stagehand_abstraction::ExecutionStatus;

    #[tokio::test]
    async fn test_guard_converts_errors_to_failed() {
        let response = guard("Deploy", async {
            Err(StateError::InvalidConfiguration("command name is required".to_string()))
        })
        .await;
        assert!(!response.is_async);
        assert_eq!(response.execution_status, ExecutionStatus::Failed);
        assert_eq!(
            response.error_message.as_deref(),
            Some("Invalid configuration: command name is required")
        );
    }

    #[tokio::test]
    async fn test_guard_passes_valid_responses() {
        let response = guard("Deploy", async { Ok(ExecutionResponse::success()) }).await;
        assert_eq!(response.execution_status, ExecutionStatus::Success);
    }

    #[test]
    fn test_state_type_display() {
        assert_eq!(StateType::ServiceResize.to_string(), "SERVICE_RESIZE");
        assert_eq!(StateType::Repeat.to_string(), "REPEAT");
    }
}
