use std::{fs, path::Path};

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{EvalError, ToolError},
    tools::{Capability, ToolHost},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub fixtures: Vec<ToolFixture>,
    #[serde(default)]
    pub default: Option<ToolResultSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFixture {
    pub when: Value,
    pub then: ToolResultSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResultSpec {
    Ok { value: Value },
    Err { message: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FixtureDocument {
    Wrapped { tools: Vec<ToolSpec> },
    List(Vec<ToolSpec>),
}

/// Tool host answering from canned responses.
///
/// The first fixture whose `when` object is a subset of the call arguments
/// wins, else the tool's `default`. Arguments are validated against the
/// declared parameter schema before matching.
#[derive(Debug, Clone, Default)]
pub struct FixtureToolHost {
    tools: Vec<ToolSpec>,
}

impl FixtureToolHost {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self { tools }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let document: FixtureDocument = if ext == "json" {
            serde_json::from_slice(&bytes)?
        } else {
            serde_yaml::from_slice(&bytes)?
        };
        let tools = match document {
            FixtureDocument::Wrapped { tools } => tools,
            FixtureDocument::List(tools) => tools,
        };
        Ok(Self::new(tools))
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }
}

#[async_trait]
impl ToolHost for FixtureToolHost {
    async fn list_capabilities(&self) -> Result<Vec<Capability>, ToolError> {
        Ok(self
            .tools
            .iter()
            .map(|tool| Capability {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameter_schema: tool
                    .parameters
                    .clone()
                    .unwrap_or_else(super::empty_object_schema),
            })
            .collect())
    }

    async fn invoke(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        let tool = self
            .tool(name)
            .ok_or_else(|| ToolError::UnknownCapability(name.to_string()))?;

        if let Some(schema) = &tool.parameters {
            validate_arguments(name, schema, arguments)?;
        }

        let result = tool
            .fixtures
            .iter()
            .find(|fixture| value_is_subset(&fixture.when, arguments))
            .map(|fixture| &fixture.then)
            .or(tool.default.as_ref())
            .ok_or_else(|| ToolError::InvalidArguments {
                capability: name.to_string(),
                message: "no matching fixture and no default specified".to_string(),
            })?;

        match result {
            ToolResultSpec::Ok { value } => Ok(value.clone()),
            ToolResultSpec::Err { message } => Err(ToolError::Execution {
                capability: name.to_string(),
                message: message.clone(),
            }),
        }
    }
}

fn validate_arguments(name: &str, schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| ToolError::InvalidArguments {
            capability: name.to_string(),
            message: format!("tool schema does not compile: {e}"),
        })?;

    if let Err(errors) = compiled.validate(arguments) {
        let message = errors.take(5).map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(ToolError::InvalidArguments {
            capability: name.to_string(),
            message,
        });
    }
    Ok(())
}

pub(crate) fn value_is_subset(expected: &Value, actual: &Value) -> bool {
    let (Value::Object(expected), Value::Object(actual)) = (expected, actual) else {
        return expected == actual;
    };
    expected
        .iter()
        .all(|(k, v)| actual.get(k).is_some_and(|av| value_is_subset(v, av)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const FIXTURES: &str = r#"
tools:
  - name: list_columns
    description: List the columns of a dataset
    parameters:
      type: object
      properties:
        dataset: { type: string }
      required: [dataset]
    fixtures:
      - when: { dataset: frontend }
        then: { kind: ok, value: { columns: [ { name: duration_ms } ] } }
    default: { kind: err, message: "dataset not found" }
  - name: run_query
    default: { kind: ok, value: { results: [] } }
"#;

    fn host() -> FixtureToolHost {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tools.yaml");
        std::fs::write(&path, FIXTURES).expect("write");
        FixtureToolHost::from_path(&path).expect("fixtures")
    }

    #[tokio::test]
    async fn matches_fixture_by_argument_subset() {
        let host = host();
        let value = host
            .invoke("list_columns", &json!({"dataset": "frontend", "extra": true}))
            .await
            .expect("fixture");
        assert_eq!(value["columns"][0]["name"], "duration_ms");
    }

    #[tokio::test]
    async fn falls_back_to_default_result() {
        let host = host();
        match host.invoke("list_columns", &json!({"dataset": "backend"})).await {
            Err(ToolError::Execution { message, .. }) => assert_eq!(message, "dataset not found"),
            other => panic!("expected execution error, got {other:?}"),
        }
        assert_eq!(
            host.invoke("run_query", &json!({})).await.expect("default"),
            json!({"results": []})
        );
    }

    #[tokio::test]
    async fn rejects_arguments_violating_schema() {
        let host = host();
        assert!(matches!(
            host.invoke("list_columns", &json!({})).await,
            Err(ToolError::InvalidArguments { .. })
        ));
    }

    #[tokio::test]
    async fn lists_capabilities_with_default_schema() {
        let caps = host().list_capabilities().await.expect("caps");
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].property_names(), vec!["dataset"]);
        assert_eq!(caps[1].parameter_schema["type"], "object");
    }
}
