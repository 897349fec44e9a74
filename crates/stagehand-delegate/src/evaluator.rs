//! `${...}` template rendering over JSON variables.
//!
//! Expressions are dotted paths (`workflow.variables.branch`). Numeric segments
//! index into arrays (`hosts.0.name`). Inline JSON arrays and objects are
//! accepted by [`TemplateEvaluator::evaluate`] as literals.

use serde_json::Value;
use stagehand_abstraction::{EvaluationError, ExpressionEvaluator};

/// Evaluator resolving `${path}` expressions against a JSON object.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateEvaluator;

impl TemplateEvaluator {
    /// Creates a new evaluator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn lookup<'a>(path: &str, variables: &'a Value) -> Result<&'a Value, EvaluationError> {
        if path.is_empty() {
            return Err(EvaluationError::Syntax("empty expression".to_string()));
        }
        if !path.chars().all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            return Err(EvaluationError::Syntax(path.to_string()));
        }

        let mut current = variables;
        for segment in path.split('.') {
            if segment.is_empty() {
                return Err(EvaluationError::Syntax(path.to_string()));
            }
            current = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| EvaluationError::Unresolved(format!("${{{path}}}")))?;
        }
        Ok(current)
    }
}

/// Strips an optional `${...}` wrapper.
fn unwrap_expression(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .map_or(trimmed, str::trim)
}

impl ExpressionEvaluator for TemplateEvaluator {
    fn render(&self, template: &str, variables: &Value) -> Result<String, EvaluationError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| EvaluationError::Syntax(format!("unterminated expression in '{template}'")))?;

            match Self::lookup(after[..end].trim(), variables)? {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, EvaluationError> {
        let inner = unwrap_expression(expression);
        if inner.starts_with('[') || inner.starts_with('{') {
            return serde_json::from_str(inner).map_err(|e| EvaluationError::Syntax(e.to_string()));
        }
        Self::lookup(inner, variables).cloned()
    }
}
