//! Repeat (fan-out / fan-in) state.
//!
//! Evaluates a collection of elements once and runs a child state per element,
//! either all at once (PARALLEL) or one after the other (SERIAL). Children are
//! started by the executor from the `spawned` list of the response; their
//! terminal statuses come back as notifications on the child's notify id.
//!
//! PARALLEL waits for every child and ends with the first non-SUCCESS status
//! in element order, or SUCCESS. SERIAL stops at the first non-SUCCESS child
//! and never starts the remaining elements.

use crate::context::ExecutionContext;
use crate::error::{Result, StateError};
use crate::registry::ResponseMap;
use crate::response::{ChildInstance, ExecutionResponse, StateExecutionData};
use crate::state::{State, StateType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_abstraction::{
    ContextElement, ContextElementType, CorrelationId, ExecutionStatus, ResponseData,
};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How children of a repeat state are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStrategy {
    /// One child at a time, in element order.
    Serial,
    /// All children at once.
    Parallel,
}

impl FromStr for ExecutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SERIAL" => Ok(Self::Serial),
            "PARALLEL" => Ok(Self::Parallel),
            other => Err(format!("unknown execution strategy: {other}")),
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => f.write_str("SERIAL"),
            Self::Parallel => f.write_str("PARALLEL"),
        }
    }
}

/// Progress of a repeat state, kept across suspensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatStateExecutionData {
    /// Elements to iterate, in order.
    pub repeat_elements: Vec<ContextElement>,
    /// Resolved strategy.
    pub strategy: ExecutionStrategy,
    /// SERIAL: index of the element in flight.
    pub index: usize,
    /// Notify id of each dispatched child, by element index.
    pub dispatched: Vec<CorrelationId>,
    /// Terminal status of each element, once reported.
    pub element_statuses: Vec<Option<ExecutionStatus>>,
    /// Notify elements reported by children so far.
    pub collected: Vec<ContextElement>,
}

impl RepeatStateExecutionData {
    fn new(repeat_elements: Vec<ContextElement>, strategy: ExecutionStrategy) -> Self {
        let n = repeat_elements.len();
        Self {
            repeat_elements,
            strategy,
            index: 0,
            dispatched: Vec::with_capacity(n),
            element_statuses: vec![None; n],
            collected: Vec::new(),
        }
    }
}

/// State running a child template once per element of a collection.
pub struct RepeatState {
    name: String,
    repeat_element_expression: String,
    repeat_element_type: ContextElementType,
    repeat_element_name: String,
    execution_strategy: Option<ExecutionStrategy>,
    execution_strategy_expression: Option<String>,
    template: Arc<dyn State>,
}

impl fmt::Debug for RepeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatState")
            .field("name", &self.name)
            .field("repeat_element_expression", &self.repeat_element_expression)
            .field("execution_strategy", &self.execution_strategy)
            .field("template", &self.template.name())
            .finish_non_exhaustive()
    }
}

impl RepeatState {
    /// Creates a repeat state.
    ///
    /// # Arguments
    /// * `name` - State name
    /// * `repeat_element_expression` - Expression yielding the element collection
    /// * `template` - State run once per element
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        repeat_element_expression: impl Into<String>,
        template: Arc<dyn State>,
    ) -> Self {
        Self {
            name: name.into(),
            repeat_element_expression: repeat_element_expression.into(),
            repeat_element_type: ContextElementType::Other,
            repeat_element_name: "repeat_element".to_string(),
            execution_strategy: None,
            execution_strategy_expression: None,
            template,
        }
    }

    /// Sets the type of the element bound into each child.
    #[must_use]
    pub fn with_element_type(mut self, element_type: ContextElementType) -> Self {
        self.repeat_element_type = element_type;
        self
    }

    /// Sets the name each child sees its element under.
    #[must_use]
    pub fn with_element_name(mut self, name: impl Into<String>) -> Self {
        self.repeat_element_name = name.into();
        self
    }

    /// Sets a fixed strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.execution_strategy = Some(strategy);
        self
    }

    /// Sets an expression resolving to the strategy at execution time.
    #[must_use]
    pub fn with_strategy_expression(mut self, expression: impl Into<String>) -> Self {
        self.execution_strategy_expression = Some(expression.into());
        self
    }

    fn to_element(&self, value: Value) -> ContextElement {
        let uuid = value.get("uuid").and_then(Value::as_str).map(str::to_string);
        let element =
            ContextElement::new(self.repeat_element_type, self.repeat_element_name.clone(), value);
        match uuid {
            Some(uuid) => element.with_uuid(uuid),
            None => element,
        }
    }

    fn resolve_elements(&self, ctx: &ExecutionContext) -> Vec<ContextElement> {
        match ctx.evaluate(&self.repeat_element_expression) {
            Ok(Value::Array(items)) => items.into_iter().map(|v| self.to_element(v)).collect(),
            Ok(Value::Null) => Vec::new(),
            Ok(single) => vec![self.to_element(single)],
            Err(e) => {
                warn!(
                    state_name = %self.name,
                    expression = %self.repeat_element_expression,
                    error = %e,
                    "Repeat element collection unresolved, nothing to run"
                );
                Vec::new()
            }
        }
    }

    fn resolve_strategy(&self, ctx: &ExecutionContext) -> ExecutionStrategy {
        if let Some(strategy) = self.execution_strategy {
            return strategy;
        }
        let Some(expression) = &self.execution_strategy_expression else {
            debug!(state_name = %self.name, "No execution strategy configured, using SERIAL");
            return ExecutionStrategy::Serial;
        };

        let resolved = ctx.evaluate(expression).map_err(|e| e.to_string()).and_then(|value| {
            value
                .as_str()
                .ok_or_else(|| format!("strategy expression yielded {value}"))
                .and_then(ExecutionStrategy::from_str)
        });
        match resolved {
            Ok(strategy) => strategy,
            Err(reason) => {
                warn!(
                    state_name = %self.name,
                    expression = %expression,
                    reason = %reason,
                    "Execution strategy unresolved, falling back to SERIAL"
                );
                ExecutionStrategy::Serial
            }
        }
    }

    fn child(&self, element: &ContextElement) -> ChildInstance {
        ChildInstance {
            notify_id: CorrelationId::generate(),
            state: Arc::clone(&self.template),
            elements: vec![element.clone()],
        }
    }

    fn snapshot(data: &RepeatStateExecutionData, status: ExecutionStatus) -> Result<StateExecutionData> {
        StateExecutionData::new(status).with_payload(data)
    }
}

#[async_trait]
impl State for RepeatState {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::Repeat
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResponse> {
        let elements = self.resolve_elements(ctx);
        if elements.is_empty() {
            info!(state_name = %self.name, "Empty repeat element collection");
            let data = RepeatStateExecutionData::new(elements, ExecutionStrategy::Serial);
            return Ok(ExecutionResponse::success()
                .with_state_execution_data(Self::snapshot(&data, ExecutionStatus::Success)?));
        }

        let strategy = self.resolve_strategy(ctx);
        let mut data = RepeatStateExecutionData::new(elements, strategy);
        let children: Vec<ChildInstance> = match strategy {
            ExecutionStrategy::Parallel => data.repeat_elements.iter().map(|e| self.child(e)).collect(),
            ExecutionStrategy::Serial => vec![self.child(&data.repeat_elements[0])],
        };
        data.dispatched = children.iter().map(|c| c.notify_id.clone()).collect();

        info!(
            state_name = %self.name,
            strategy = %strategy,
            elements = data.repeat_elements.len(),
            dispatched = children.len(),
            "Repeat state dispatching children"
        );

        let mut response = ExecutionResponse::suspend(data.dispatched.clone())
            .with_state_execution_data(Self::snapshot(&data, ExecutionStatus::Running)?);
        response.spawned = children;
        Ok(response)
    }

    async fn handle_async_response(
        &self,
        ctx: &ExecutionContext,
        responses: ResponseMap,
    ) -> Result<ExecutionResponse> {
        let mut data: RepeatStateExecutionData = ctx
            .state_execution_data()
            .ok_or_else(|| StateError::UnexpectedResponse("missing repeat execution data".to_string()))?
            .payload_as()?;

        let mut messages: HashMap<usize, String> = HashMap::new();
        for (id, reply) in responses {
            let Some(pos) = data.dispatched.iter().position(|d| *d == id) else {
                warn!(state_name = %self.name, correlation_id = %id, "Reply for unknown repeat child");
                continue;
            };
            data.element_statuses[pos] = Some(reply.status());
            if let Some(msg) = reply.error_message() {
                messages.insert(pos, msg.to_string());
            }
            if let ResponseData::Element { elements, .. } = reply {
                data.collected.extend(elements);
            }
        }

        let finish = |data: &RepeatStateExecutionData,
                      pos: usize,
                      status: ExecutionStatus|
         -> Result<ExecutionResponse> {
            let message = if status.is_success() {
                None
            } else {
                let detail = messages.get(&pos).map_or_else(String::new, |m| format!(": {m}"));
                Some(format!("Repeat element {pos} finished with {status}{detail}"))
            };
            Ok(ExecutionResponse::terminal(status, message)
                .with_notify_elements(data.collected.clone())
                .with_state_execution_data(Self::snapshot(data, status)?))
        };

        match data.strategy {
            ExecutionStrategy::Parallel => {
                let failed = data
                    .element_statuses
                    .iter()
                    .enumerate()
                    .find_map(|(pos, s)| match s {
                        Some(status) if status.is_success() => None,
                        Some(status) => Some((pos, *status)),
                        None => Some((pos, ExecutionStatus::Error)),
                    });
                match failed {
                    Some((pos, status)) => finish(&data, pos, status),
                    None => finish(&data, 0, ExecutionStatus::Success),
                }
            }
            ExecutionStrategy::Serial => {
                let current = data.index;
                let status = data.element_statuses.get(current).copied().flatten().ok_or_else(|| {
                    StateError::UnexpectedResponse(format!("no reply for repeat element {current}"))
                })?;

                if !status.is_success() || current + 1 >= data.repeat_elements.len() {
                    debug!(state_name = %self.name, index = current, status = %status, "Serial repeat finished");
                    return finish(&data, current, status);
                }

                data.index = current + 1;
                let child = self.child(&data.repeat_elements[data.index]);
                data.dispatched.push(child.notify_id.clone());
                debug!(state_name = %self.name, index = data.index, "Dispatching next serial child");

                Ok(ExecutionResponse::suspend(vec![child.notify_id.clone()])
                    .with_child(child)
                    .with_state_execution_data(Self::snapshot(&data, ExecutionStatus::Running)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionIds;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stagehand_delegate::TemplateEvaluator;

    struct Noop;

    #[async_trait]
    impl State for Noop {
        fn name(&self) -> &str {
            "child"
        }

        fn state_type(&self) -> StateType {
            StateType::Command
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionResponse> {
            Ok(ExecutionResponse::success())
        }

        async fn handle_async_response(
            &self,
            _ctx: &ExecutionContext,
            _responses: ResponseMap,
        ) -> Result<ExecutionResponse> {
            Ok(ExecutionResponse::success())
        }
    }

    fn ctx(vars: Value) -> ExecutionContext {
        ExecutionContext::new(
            ExecutionIds::new("acct", "app", "wf-1"),
            "Repeat",
            Arc::new(TemplateEvaluator::new()),
        )
        .with_variables(vars)
    }

    fn hosts(n: usize) -> Value {
        json!({ "hosts": (0..n).map(|i| format!("host-{i}")).collect::<Vec<_>>() })
    }

    fn reply(status: ExecutionStatus) -> ResponseData {
        ResponseData::Element {
            status,
            error_message: (!status.is_success()).then(|| "exit code 1".to_string()),
            elements: vec![],
        }
    }

    /// Drives a serial repeat state, replying to each child with `outcome(index)`.
    async fn drive_serial(
        state: &RepeatState,
        ctx: ExecutionContext,
        outcome: impl Fn(usize) -> ExecutionStatus,
    ) -> (ExecutionResponse, Vec<Value>) {
        let mut dispatched = Vec::new();
        let mut response = state.execute(&ctx).await.unwrap();
        while response.is_async {
            assert_eq!(response.spawned.len(), 1);
            let child = &response.spawned[0];
            dispatched.push(child.elements[0].value.clone());
            let index = dispatched.len() - 1;

            let resumed = ctx.clone().with_state_execution_data(response.state_execution_data.clone());
            let responses = ResponseMap::from([(child.notify_id.clone(), reply(outcome(index)))]);
            response = state.handle_async_response(&resumed, responses).await.unwrap();
        }
        (response, dispatched)
    }

    #[tokio::test]
    async fn test_empty_collection_completes_synchronously() {
        let state = RepeatState::new("Repeat", "${hosts}", Arc::new(Noop));
        let response = state.execute(&ctx(json!({"hosts": []}))).await.unwrap();
        assert!(!response.is_async);
        assert_eq!(response.execution_status, ExecutionStatus::Success);
        assert!(response.spawned.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_collection_completes_synchronously() {
        let state = RepeatState::new("Repeat", "${missing.hosts}", Arc::new(Noop));
        let response = state.execute(&ctx(json!({}))).await.unwrap();
        assert!(!response.is_async);
        assert_eq!(response.execution_status, ExecutionStatus::Success);
        assert!(response.spawned.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_dispatches_all_and_reports_failure() {
        let state = RepeatState::new("Repeat", "${hosts}", Arc::new(Noop))
            .with_strategy(ExecutionStrategy::Parallel)
            .with_element_type(ContextElementType::Host)
            .with_element_name("host");
        let ctx = ctx(hosts(5));

        let response = state.execute(&ctx).await.unwrap();
        assert!(response.is_async);
        assert_eq!(response.spawned.len(), 5);
        assert_eq!(response.correlation_ids.len(), 5);
        assert_eq!(response.spawned[3].elements[0].name, "host");
        assert_eq!(response.spawned[3].elements[0].element_type, ContextElementType::Host);

        let responses: ResponseMap = response
            .spawned
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let status = if i == 2 { ExecutionStatus::Failed } else { ExecutionStatus::Success };
                (c.notify_id.clone(), reply(status))
            })
            .collect();
        let resumed = ctx.clone().with_state_execution_data(response.state_execution_data.clone());
        let done = state.handle_async_response(&resumed, responses).await.unwrap();

        assert!(!done.is_async);
        assert_eq!(done.execution_status, ExecutionStatus::Failed);
        assert_eq!(
            done.error_message.as_deref(),
            Some("Repeat element 2 finished with FAILED: exit code 1")
        );
    }

    #[tokio::test]
    async fn test_parallel_all_success() {
        let state = RepeatState::new("Repeat", "${hosts}", Arc::new(Noop))
            .with_strategy(ExecutionStrategy::Parallel);
        let ctx = ctx(hosts(3));
        let response = state.execute(&ctx).await.unwrap();

        let responses: ResponseMap = response
            .correlation_ids
            .iter()
            .map(|id| {
                let element = ContextElement::new(ContextElementType::Instance, "instance", json!(id.as_str()));
                (id.clone(), ResponseData::Element { status: ExecutionStatus::Success, error_message: None, elements: vec![element] })
            })
            .collect();
        let resumed = ctx.clone().with_state_execution_data(response.state_execution_data.clone());
        let done = state.handle_async_response(&resumed, responses).await.unwrap();

        assert_eq!(done.execution_status, ExecutionStatus::Success);
        assert_eq!(done.error_message, None);
        assert_eq!(done.notify_elements.len(), 3);
    }

    #[tokio::test]
    async fn test_serial_short_circuits_on_failure() {
        let state = RepeatState::new("Repeat", "${hosts}", Arc::new(Noop))
            .with_strategy(ExecutionStrategy::Serial);
        let (done, dispatched) = drive_serial(&state, ctx(hosts(6)), |i| {
            if i == 2 { ExecutionStatus::Error } else { ExecutionStatus::Success }
        })
        .await;

        assert_eq!(dispatched.len(), 3);
        assert_eq!(done.execution_status, ExecutionStatus::Error);
    }

    #[tokio::test]
    async fn test_serial_all_success_in_order() {
        let state = RepeatState::new("Repeat", "${hosts}", Arc::new(Noop))
            .with_strategy(ExecutionStrategy::Serial);
        let (done, dispatched) =
            drive_serial(&state, ctx(hosts(4)), |_| ExecutionStatus::Success).await;

        assert_eq!(dispatched, vec![json!("host-0"), json!("host-1"), json!("host-2"), json!("host-3")]);
        assert_eq!(done.execution_status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_unresolved_strategy_falls_back_to_serial() {
        let state = RepeatState::new("Repeat", "${hosts}", Arc::new(Noop))
            .with_strategy_expression("${workflow.strategy}");
        let response = state.execute(&ctx(hosts(3))).await.unwrap();

        assert!(response.is_async);
        assert_eq!(response.spawned.len(), 1);
        let data: RepeatStateExecutionData =
            response.state_execution_data.unwrap().payload_as().unwrap();
        assert_eq!(data.strategy, ExecutionStrategy::Serial);
    }

    #[tokio::test]
    async fn test_strategy_expression_resolves() {
        let state = RepeatState::new("Repeat", "${hosts}", Arc::new(Noop))
            .with_strategy_expression("${strategy}");
        let mut vars = hosts(3);
        vars["strategy"] = json!("parallel");
        let response = state.execute(&ctx(vars)).await.unwrap();
        assert_eq!(response.spawned.len(), 3);
    }

    #[tokio::test]
    async fn test_resume_without_snapshot_fails() {
        let state = RepeatState::new("Repeat", "${hosts}", Arc::new(Noop));
        let err = state.handle_async_response(&ctx(hosts(1)), ResponseMap::new()).await.unwrap_err();
        assert!(matches!(err, StateError::UnexpectedResponse(_)));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("parallel".parse::<ExecutionStrategy>(), Ok(ExecutionStrategy::Parallel));
        assert_eq!(" SERIAL ".parse::<ExecutionStrategy>(), Ok(ExecutionStrategy::Serial));
        assert!("random".parse::<ExecutionStrategy>().is_err());
    }
}
