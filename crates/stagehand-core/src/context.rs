//! Read-only execution context handed to every state call.

use crate::error::Result;
use crate::response::StateExecutionData;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stagehand_abstraction::{ContextElement, ContextElementType, ExpressionEvaluator};
use std::fmt;
use std::sync::Arc;
use tracing::{Span, warn};

/// Scoping ids of one state execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionIds {
    /// Owning account.
    pub account_id: String,
    /// Owning application.
    pub app_id: String,
    /// Target environment.
    pub env_id: Option<String>,
    /// Workflow execution the state belongs to.
    pub workflow_execution_id: String,
    /// Id of this state instance.
    pub state_execution_instance_id: String,
    /// Target infrastructure mapping.
    pub infra_mapping_id: Option<String>,
}

impl ExecutionIds {
    /// Creates ids for a workflow execution.
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        app_id: impl Into<String>,
        workflow_execution_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            app_id: app_id.into(),
            workflow_execution_id: workflow_execution_id.into(),
            ..Self::default()
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
}

/// Immutable view of the workflow a state runs in.
///
/// Built by the executor for every `execute` / `handle_async_response` /
/// `handle_abort_event` call. Context elements are bound into expressions by
/// name, workflow variables at the top level and the ids under `execution`.
#[derive(Clone)]
pub struct ExecutionContext {
    ids: ExecutionIds,
    state_name: String,
    elements: Vec<ContextElement>,
    variables: Value,
    state_execution_data: Option<StateExecutionData>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    span: Span,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("ids", &self.ids)
            .field("state_name", &self.state_name)
            .field("elements", &self.elements.len())
            .field("state_execution_data", &self.state_execution_data)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Creates a context with no elements, variables or prior data.
    ///
    /// # Arguments
    /// * `ids` - Scoping ids
    /// * `state_name` - Name of the state being executed
    /// * `evaluator` - Expression renderer
    #[must_use]
    pub fn new(
        ids: ExecutionIds,
        state_name: impl Into<String>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            ids,
            state_name: state_name.into(),
            elements: Vec::new(),
            variables: Value::Object(Map::new()),
            state_execution_data: None,
            evaluator,
            span: Span::none(),
        }
    }

    /// Sets the published context elements.
    #[must_use]
    pub fn with_elements(mut self, elements: Vec<ContextElement>) -> Self {
        self.elements = elements;
        self
    }

    /// Appends one context element.
    #[must_use]
    pub fn with_element(mut self, element: ContextElement) -> Self {
        self.elements.push(element);
        self
    }

    /// Sets the workflow variables (a JSON object).
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Sets the execution data snapshot from the previous suspension.
    #[must_use]
    pub fn with_state_execution_data(mut self, data: Option<StateExecutionData>) -> Self {
        self.state_execution_data = data;
        self
    }

    /// Sets the span diagnostics of this call are recorded under.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Scoping ids.
    #[must_use]
    pub fn ids(&self) -> &ExecutionIds {
        &self.ids
    }

    /// Name of the state being executed.
    #[must_use]
    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    /// Id of this state instance.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.ids.state_execution_instance_id
    }

    /// Execution data snapshot from the previous suspension, if any.
    #[must_use]
    pub fn state_execution_data(&self) -> Option<&StateExecutionData> {
        self.state_execution_data.as_ref()
    }

    /// Span of this call.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// All published elements, oldest first.
    #[must_use]
    pub fn elements(&self) -> &[ContextElement] {
        &self.elements
    }

    /// Most recently published element of the given type.
    #[must_use]
    pub fn context_element(&self, element_type: ContextElementType) -> Option<&ContextElement> {
        self.elements.iter().rev().find(|e| e.element_type == element_type)
    }

    /// Most recently published element of the given type and name.
    #[must_use]
    pub fn context_element_named(
        &self,
        element_type: ContextElementType,
        name: &str,
    ) -> Option<&ContextElement> {
        self.elements.iter().rev().find(|e| e.element_type == element_type && e.name == name)
    }

    /// All elements of the given type, oldest first.
    #[must_use]
    pub fn context_elements(&self, element_type: ContextElementType) -> Vec<&ContextElement> {
        self.elements.iter().filter(|e| e.element_type == element_type).collect()
    }

    /// Builds the JSON object expressions are resolved against.
    #[must_use]
    pub fn expression_variables(&self) -> Value {
        let mut vars = match &self.variables {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("variables".to_string(), other.clone());
                map
            }
        };
        for element in &self.elements {
            vars.insert(element.name.clone(), element.value.clone());
        }
        vars.insert(
            "execution".to_string(),
            serde_json::to_value(&self.ids).unwrap_or(Value::Null),
        );
        Value::Object(vars)
    }

    /// Renders every `${...}` expression in `template`.
    ///
    /// # Errors
    /// Returns `StateError::Evaluation` if an expression cannot be resolved.
    pub fn render_expression(&self, template: &str) -> Result<String> {
        Ok(self.evaluator.render(template, &self.expression_variables())?)
    }

    /// Renders `template`, falling back to the unrendered text on failure.
    pub fn render_or_literal(&self, template: &str) -> String {
        match self.render_expression(template) {
            Ok(rendered) => rendered,
            Err(e) => {
                self.span.in_scope(|| {
                    warn!(
                        state_name = %self.state_name,
                        template = %template,
                        error = %e,
                        "Expression rendering failed, using literal value"
                    );
                });
                template.to_string()
            }
        }
    }

    /// Evaluates a single expression to a structured value.
    ///
    /// # Errors
    /// Returns `StateError::Evaluation` if the expression cannot be resolved.
    pub fn evaluate(&self, expression: &str) -> Result<Value> {
        Ok(self.evaluator.evaluate(expression, &self.expression_variables())?)
    }
}
