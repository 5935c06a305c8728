//! The capability host driven by the orchestration loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ToolError;

pub mod fixtures;
pub mod functions;

pub use fixtures::{FixtureToolHost, ToolFixture, ToolResultSpec, ToolSpec};
pub use functions::{FunctionDefinition, FunctionParameter, FunctionRegistry, FunctionToolHost, KernelFunction};

/// One named operation offered by a [`ToolHost`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub parameter_schema: Value,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameter_schema: empty_object_schema(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter_schema(mut self, schema: Value) -> Self {
        self.parameter_schema = schema;
        self
    }

    /// Top-level property names declared by the parameter schema.
    pub fn property_names(&self) -> Vec<&str> {
        self.parameter_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

pub(crate) fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

#[async_trait]
pub trait ToolHost: Send + Sync {
    async fn list_capabilities(&self) -> Result<Vec<Capability>, ToolError>;

    async fn invoke(&self, name: &str, arguments: &Value) -> Result<Value, ToolError>;
}
