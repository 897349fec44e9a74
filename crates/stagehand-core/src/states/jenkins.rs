//! Jenkins state.
//!
//! Triggers a job with rendered parameters and maps the build result.
//! Rendering is best effort: an unresolved expression is sent verbatim.

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
use stagehand_abstraction::{CorrelationId, DelegateTask, ExecutionStatus, ResponseData, TaskType};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of a Jenkins build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    /// Build passed.
    Success,
    /// Build passed with test failures.
    Unstable,
    /// Build failed.
    Failure,
    /// Build was cancelled on the Jenkins side.
    Aborted,
    /// Build never ran.
    NotBuilt,
}

impl BuildResult {
    /// Maps the build result to a terminal status.
    ///
    /// UNSTABLE counts as SUCCESS only when `unstable_success` is set.
    #[must_use]
    pub const fn to_status(self, unstable_success: bool) -> ExecutionStatus {
        match self {
            Self::Success => ExecutionStatus::Success,
            Self::Unstable if unstable_success => ExecutionStatus::Success,
            Self::Aborted => ExecutionStatus::Aborted,
            Self::Unstable | Self::Failure | Self::NotBuilt => ExecutionStatus::Failed,
        }
    }
}

impl FromStr for BuildResult {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SUCCESS" => Ok(Self::Success),
            "UNSTABLE" => Ok(Self::Unstable),
            "FAILURE" => Ok(Self::Failure),
            "ABORTED" => Ok(Self::Aborted),
            "NOT_BUILT" => Ok(Self::NotBuilt),
            other => Err(format!("unknown build result: {other}")),
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Unstable => "UNSTABLE",
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
            Self::NotBuilt => "NOT_BUILT",
        };
        f.write_str(s)
    }
}

/// Snapshot kept while the build runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JenkinsStateExecutionData {
    /// Activity recording the build.
    pub activity_id: String,
    /// Rendered job name.
    pub job_name: String,
    /// Rendered job parameters.
    pub parameters: BTreeMap<String, String>,
    /// Build result, once received.
    pub build_result: Option<BuildResult>,
    /// Build URL reported by the delegate.
    pub build_url: Option<String>,
}

/// Triggers a Jenkins job through the delegate.
pub struct JenkinsState {
    name: String,
    job_name: String,
    parameters: BTreeMap<String, String>,
    unstable_success: bool,
    timeout: Option<Duration>,
    recorder: ActivityRecorder,
    dispatcher: Arc<DelegateTaskDispatcher>,
}

impl fmt::Debug for JenkinsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JenkinsState")
            .field("name", &self.name)
            .field("job_name", &self.job_name)
            .field("parameters", &self.parameters)
            .field("unstable_success", &self.unstable_success)
            .finish_non_exhaustive()
    }
}

impl JenkinsState {
    /// Creates a Jenkins state for `job_name` (may contain expressions).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        job_name: impl Into<String>,
        recorder: ActivityRecorder,
        dispatcher: Arc<DelegateTaskDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            job_name: job_name.into(),
            parameters: BTreeMap::new(),
            unstable_success: false,
            timeout: None,
            recorder,
            dispatcher,
        }
    }

    /// Adds a job parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Treats UNSTABLE builds as SUCCESS.
    #[must_use]
    pub const fn with_unstable_success(mut self, unstable_success: bool) -> Self {
        self.unstable_success = unstable_success;
        self
    }

    /// Sets the build timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn finalize_activity(&self, ctx: &ExecutionContext, activity_id: &str, status: ExecutionStatus) {
        if let Err(e) = self.recorder.update_status(&ctx.ids().app_id, activity_id, status).await {
            warn!(activity_id = %activity_id, error = %e, "Failed to finalize Jenkins activity");
        }
    }
}

#[async_trait]
impl State for JenkinsState {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::Jenkins
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResponse> {
        let job_name = ctx.render_or_literal(&self.job_name);
        if job_name.trim().is_empty() {
            return Err(StateError::InvalidConfiguration("job name is required".to_string()));
        }
        let parameters: BTreeMap<String, String> = self
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), ctx.render_or_literal(v)))
            .collect();

        let activity = self.recorder.create(ctx, StateType::Jenkins, "Jenkins").await?;
        let activity_id = activity
            .id
            .ok_or_else(|| StateError::UnexpectedResponse("activity saved without id".to_string()))?;

        let ids = ctx.ids();
        let mut task = DelegateTask::new(TaskType::Jenkins, &ids.account_id, &ids.app_id)
            .with_wait_id(CorrelationId::from(activity_id.clone()))
            .with_parameter(json!({ "job_name": job_name, "parameters": parameters }));
        if let Some(env_id) = &ids.env_id {
            task = task.with_env_id(env_id);
        }
        if let Some(timeout) = self.timeout {
            task = task.with_timeout(timeout);
        }

        let queued = match self.dispatcher.queue_task(task).await {
            Ok(queued) => queued,
            Err(e) => {
                self.finalize_activity(ctx, &activity_id, ExecutionStatus::Failed).await;
                return Err(e);
            }
        };
        info!(state_name = %self.name, job_name = %job_name, "Jenkins job triggered");

        let data = JenkinsStateExecutionData {
            activity_id,
            job_name,
            parameters,
            build_result: None,
            build_url: None,
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
            self.finalize_activity(ctx, activity_id.as_str(), ExecutionStatus::Failed).await;
            return Ok(ExecutionResponse::failed(message.clone()));
        }

        let payload = reply.payload();
        let build_result: BuildResult = payload
            .get("build_result")
            .and_then(Value::as_str)
            .ok_or_else(|| StateError::UnexpectedResponse("Jenkins reply without build result".to_string()))?
            .parse()
            .map_err(StateError::UnexpectedResponse)?;
        let status = build_result.to_status(self.unstable_success);
        self.finalize_activity(ctx, activity_id.as_str(), status).await;

        let mut data: JenkinsStateExecutionData = ctx
            .state_execution_data()
            .ok_or_else(|| StateError::UnexpectedResponse("missing Jenkins execution data".to_string()))?
            .payload_as()?;
        data.build_result = Some(build_result);
        data.build_url = payload.get("build_url").and_then(Value::as_str).map(str::to_string);

        let error_message = if status.is_success() {
            None
        } else {
            Some(reply.error_message().map_or_else(
                || format!("Jenkins build {} finished with {build_result}", data.job_name),
                str::to_string,
            ))
        };
        Ok(ExecutionResponse::terminal(status, error_message)
            .with_state_execution_data(StateExecutionData::new(status).with_payload(&data)?))
    }

    async fn handle_abort_event(&self, ctx: &ExecutionContext) -> Result<()> {
        if let Some(snapshot) = ctx.state_execution_data() {
            let data: JenkinsStateExecutionData = snapshot.payload_as()?;
            self.finalize_activity(ctx, &data.activity_id, ExecutionStatus::Aborted).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::testing::{Fixture, resumed};
    use pretty_assertions::assert_eq;
    use stagehand_delegate::handler_fn;

    async fn fixture() -> Fixture {
        let fixture = Fixture::new();
        fixture
            .service
            .register_handler(
                TaskType::Jenkins,
                handler_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ResponseData::success(json!({})))
                }),
            )
            .await;
        fixture
    }

    fn reply(id: &CorrelationId, result: &str) -> ResponseMap {
        ResponseMap::from([(
            id.clone(),
            ResponseData::success(json!({"build_result": result, "build_url": "https://ci/job/7"})),
        )])
    }

    #[test]
    fn test_build_result_mapping() {
        assert_eq!(BuildResult::Success.to_status(false), ExecutionStatus::Success);
        assert_eq!(BuildResult::Unstable.to_status(false), ExecutionStatus::Failed);
        assert_eq!(BuildResult::Unstable.to_status(true), ExecutionStatus::Success);
        assert_eq!(BuildResult::Failure.to_status(true), ExecutionStatus::Failed);
        assert_eq!(BuildResult::Aborted.to_status(false), ExecutionStatus::Aborted);
        assert_eq!("unstable".parse::<BuildResult>(), Ok(BuildResult::Unstable));
        assert!("GREEN".parse::<BuildResult>().is_err());
    }

    #[tokio::test]
    async fn test_unresolved_parameters_are_sent_verbatim() {
        let fixture = fixture().await;
        let state = JenkinsState::new("Build", "build-${service}", fixture.recorder.clone(), fixture.dispatcher.clone())
            .with_parameter("branch", "${branch}")
            .with_parameter("target", "${missing.value}");
        let ctx = fixture.ctx("Build").with_variables(json!({"service": "api", "branch": "main"}));

        let response = state.execute(&ctx).await.unwrap();
        let data: JenkinsStateExecutionData =
            response.state_execution_data.unwrap().payload_as().unwrap();
        assert_eq!(data.job_name, "build-api");
        assert_eq!(data.parameters["branch"], "main");
        assert_eq!(data.parameters["target"], "${missing.value}");
    }

    #[tokio::test]
    async fn test_build_results_drive_status_and_activity() {
        let fixture = fixture().await;
        let state = JenkinsState::new("Build", "build", fixture.recorder.clone(), fixture.dispatcher.clone());
        let ctx = fixture.ctx("Build");

        for (result, expected) in [
            ("SUCCESS", ExecutionStatus::Success),
            ("UNSTABLE", ExecutionStatus::Failed),
            ("FAILURE", ExecutionStatus::Failed),
            ("ABORTED", ExecutionStatus::Aborted),
        ] {
            let suspended = state.execute(&ctx).await.unwrap();
            let id = suspended.correlation_ids[0].clone();
            let response = state
                .handle_async_response(&resumed(&ctx, &suspended), reply(&id, result))
                .await
                .unwrap();
            assert_eq!(response.execution_status, expected, "build result {result}");

            let activity = fixture.recorder.get("app-1", id.as_str()).await.unwrap().unwrap();
            assert_eq!(activity.status, expected);
        }
    }

    #[tokio::test]
    async fn test_reply_without_build_result_is_rejected() {
        let fixture = fixture().await;
        let state = JenkinsState::new("Build", "build", fixture.recorder.clone(), fixture.dispatcher.clone());
        let ctx = fixture.ctx("Build");
        let suspended = state.execute(&ctx).await.unwrap();
        let id = suspended.correlation_ids[0].clone();

        let err = state
            .handle_async_response(
                &resumed(&ctx, &suspended),
                ResponseMap::from([(id, ResponseData::success(json!({})))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::UnexpectedResponse(_)));
    }
}
