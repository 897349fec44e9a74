//! HTTP state.
//!
//! Sends one request through the delegate and asserts the status code of the
//! reply. The response is published as an `Http` context element for the
//! states that follow.

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
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Status code expected when none is configured.
pub const DEFAULT_EXPECTED_STATUS: u16 = 200;

/// Snapshot of the request and, once received, the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpStateExecutionData {
    /// Request method.
    pub method: String,
    /// Rendered url.
    pub url: String,
    /// Rendered headers.
    pub headers: BTreeMap<String, String>,
    /// Rendered body.
    pub body: Option<String>,
    /// Response status code.
    pub status_code: Option<u16>,
    /// Response body.
    pub response_body: Option<String>,
}

/// Performs an HTTP call on the delegate.
#[derive(Clone)]
pub struct HttpState {
    name: String,
    method: String,
    url: String,
    headers: BTreeMap<String, String>,
    body: Option<String>,
    expected_status: u16,
    timeout: Option<Duration>,
    dispatcher: Arc<DelegateTaskDispatcher>,
}

impl std::fmt::Debug for HttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpState")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("expected_status", &self.expected_status)
            .finish_non_exhaustive()
    }
}

impl HttpState {
    /// Creates a GET request state expecting 200.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, dispatcher: Arc<DelegateTaskDispatcher>) -> Self {
        Self {
            name: name.into(),
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            expected_status: DEFAULT_EXPECTED_STATUS,
            timeout: None,
            dispatcher,
        }
    }

    /// Sets the request method.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_uppercase();
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the status code the response must carry.
    #[must_use]
    pub const fn with_expected_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl State for HttpState {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::Http
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResponse> {
        let url = ctx.render_or_literal(&self.url);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StateError::InvalidConfiguration(format!("invalid url: {url}")));
        }
        let headers: BTreeMap<String, String> =
            self.headers.iter().map(|(k, v)| (k.clone(), ctx.render_or_literal(v))).collect();
        let body = self.body.as_deref().map(|b| ctx.render_or_literal(b));

        let ids = ctx.ids();
        let mut task = DelegateTask::new(TaskType::Http, &ids.account_id, &ids.app_id).with_parameter(json!({
            "method": self.method,
            "url": url,
            "headers": headers,
            "body": body,
        }));
        if let Some(timeout) = self.timeout {
            task = task.with_timeout(timeout);
        }
        let queued = self.dispatcher.queue_task(task).await?;
        info!(state_name = %self.name, method = %self.method, url = %url, "HTTP request dispatched");

        let data = HttpStateExecutionData {
            method: self.method.clone(),
            url,
            headers,
            body,
            status_code: None,
            response_body: None,
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
        let Some((_, reply)) = single_reply(responses) else {
            return Ok(ExecutionResponse::failed(UNEXPECTED_RESPONSE_COUNT));
        };
        if let ResponseData::Error { message, .. } = &reply {
            return Ok(ExecutionResponse::failed(message.clone()));
        }
        if !reply.status().is_success() {
            let message = reply.error_message().unwrap_or("HTTP call failed").to_string();
            return Ok(ExecutionResponse::failed(message));
        }

        let payload = reply.payload();
        let status_code = payload
            .get("status_code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .ok_or_else(|| StateError::UnexpectedResponse("HTTP reply without status code".to_string()))?;
        let response_body = payload.get("body").and_then(Value::as_str).map(str::to_string);

        let mut data: HttpStateExecutionData = ctx
            .state_execution_data()
            .ok_or_else(|| StateError::UnexpectedResponse("missing HTTP execution data".to_string()))?
            .payload_as()?;
        data.status_code = Some(status_code);
        data.response_body.clone_from(&response_body);
        debug!(state_name = %self.name, status_code, "HTTP response received");

        let (status, message) = if status_code == self.expected_status {
            (ExecutionStatus::Success, None)
        } else {
            let message = format!(
                "Expected status code {} but received {status_code}",
                self.expected_status
            );
            (ExecutionStatus::Failed, Some(message))
        };

        let element = ContextElement::new(
            ContextElementType::Http,
            self.name.clone(),
            json!({
                "method": data.method,
                "url": data.url,
                "status_code": status_code,
                "body": response_body,
            }),
        );
        Ok(ExecutionResponse::terminal(status, message)
            .with_context_element(element)
            .with_state_execution_data(StateExecutionData::new(status).with_payload(&data)?))
    }
}
