//! Context elements.
//!
//! A context element is a typed artifact published by one state and read by
//! later states through the shared execution context (selected hosts, an
//! infrastructure mapping, an artifact reference, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a published context element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextElementType {
    /// Workflow-wide standard parameters (app, env, ...).
    Standard,
    /// A single service instance.
    Instance,
    /// A host selected for deployment.
    Host,
    /// A service being deployed.
    Service,
    /// An infrastructure mapping reference.
    InfrastructureMapping,
    /// An artifact reference.
    Artifact,
    /// A user-supplied parameter.
    Param,
    /// Output of an HTTP call.
    Http,
    /// A partition of a repeat collection.
    Partition,
    /// A custom element published by a plugin.
    Other,
}

/// A typed key/value artifact stored in the workflow's running context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextElement {
    /// Kind of the element.
    pub element_type: ContextElementType,
    /// Name used for lookups and for binding into expressions.
    pub name: String,
    /// Optional stable identifier.
    pub uuid: Option<String>,
    /// Element value.
    pub value: Value,
}

impl ContextElement {
    /// Creates a new context element.
    ///
    /// # Arguments
    /// * `element_type` - Kind of the element
    /// * `name` - Element name
    /// * `value` - Element value
    #[must_use]
    pub fn new(element_type: ContextElementType, name: impl Into<String>, value: Value) -> Self {
        Self { element_type, name: name.into(), uuid: None, value }
    }

    /// Sets the element uuid.
    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Returns the value as a string, rendering non-string JSON compactly.
    #[must_use]
    pub fn value_as_string(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_as_string() {
        let host = ContextElement::new(ContextElementType::Host, "host", json!("web-1"));
        assert_eq!(host.value_as_string(), "web-1");

        let count = ContextElement::new(ContextElementType::Param, "count", json!(3));
        assert_eq!(count.value_as_string(), "3");
    }

    #[test]
    fn test_with_uuid() {
        let el = ContextElement::new(ContextElementType::Instance, "i-1", json!({})).with_uuid("abc");
        assert_eq!(el.uuid.as_deref(), Some("abc"));
    }
}
