use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EvalError;

/// Immutable description of one evaluation goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalPrompt {
    pub id: String,
    #[serde(alias = "prompt")]
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// A fixed script; prompts carrying one always run scripted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<ScriptedStep>>,
    /// Capability allow-list; `None` allows everything the host offers.
    #[serde(default, alias = "tools", skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    pub rubric: Rubric,
}

impl EvalPrompt {
    pub fn new(id: impl Into<String>, goal: impl Into<String>, rubric: Rubric) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            context: None,
            steps: None,
            capabilities: None,
            max_steps: None,
            rubric,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<ScriptedStep>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn is_scripted(&self) -> bool {
        self.steps.is_some()
    }

    pub fn allows(&self, capability: &str) -> bool {
        self.capabilities
            .as_ref()
            .map_or(true, |allowed| allowed.iter().any(|name| name == capability))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedStep {
    #[serde(alias = "capability")]
    pub tool: String,
    #[serde(default = "empty_parameters", alias = "arguments")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ScriptedStep {
    pub fn new(tool: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool: tool.into(),
            parameters,
            reasoning: None,
        }
    }
}

fn empty_parameters() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub criteria: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectations: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_threshold: Option<f64>,
}

impl Rubric {
    pub const DEFAULT_PASS_THRESHOLD: f64 = 0.7;

    pub fn new(criteria: impl Into<String>) -> Self {
        Self {
            criteria: criteria.into(),
            expectations: None,
            pass_threshold: None,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.pass_threshold
            .unwrap_or(Self::DEFAULT_PASS_THRESHOLD)
            .clamp(0.0, 1.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PromptDocument {
    Many(Vec<EvalPrompt>),
    One(Box<EvalPrompt>),
}

/// Load prompts from a JSON/YAML file or a directory of them, sorted by id.
pub fn load_prompts(path: impl AsRef<Path>) -> Result<Vec<EvalPrompt>, EvalError> {
    let path = path.as_ref();
    let mut prompts = Vec::new();

    if path.is_dir() {
        let mut files = Vec::new();
        for entry in fs::read_dir(path)? {
            let p = entry?.path();
            let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml" | "json") {
                files.push(p);
            }
        }
        files.sort();
        for file in files {
            prompts.extend(load_file(&file)?);
        }
    } else {
        prompts.extend(load_file(path)?);
    }

    prompts.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(prompts)
}

fn load_file(path: &Path) -> Result<Vec<EvalPrompt>, EvalError> {
    let bytes = fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let document: PromptDocument = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        serde_yaml::from_slice(&bytes)?
    };
    Ok(match document {
        PromptDocument::Many(prompts) => prompts,
        PromptDocument::One(prompt) => vec![*prompt],
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn loads_directory_of_mixed_formats() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("b.yaml"),
            r#"
- id: latency-p99
  goal: Find the slowest endpoint
  capabilities: [list_columns, run_query]
  max_steps: 6
  rubric:
    criteria: Identifies the endpoint with the highest p99 latency
    pass_threshold: 0.8
- id: error-rate
  prompt: What is the error rate?
  steps:
    - tool: run_query
      parameters: { calculations: [ { op: COUNT } ] }
  rubric: { criteria: Reports an error rate }
"#,
        )
        .expect("write yaml");
        std::fs::write(
            dir.path().join("a.json"),
            json!({"id": "columns", "goal": "List columns", "rubric": {"criteria": "Lists columns"}}).to_string(),
        )
        .expect("write json");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write txt");

        let prompts = load_prompts(dir.path()).expect("prompts");
        let ids: Vec<&str> = prompts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["columns", "error-rate", "latency-p99"]);

        let scripted = &prompts[1];
        assert!(scripted.is_scripted());
        assert_eq!(scripted.goal, "What is the error rate?");
        assert_eq!(scripted.rubric.threshold(), Rubric::DEFAULT_PASS_THRESHOLD);

        let latency = &prompts[2];
        assert!(latency.allows("run_query"));
        assert!(!latency.allows("get_trace"));
        assert_eq!(latency.rubric.threshold(), 0.8);
        assert!(prompts[0].allows("anything"));
    }

    #[test]
    fn scripted_step_defaults_to_empty_parameters() {
        let step: ScriptedStep = serde_json::from_value(json!({"tool": "list_datasets"})).expect("step");
        assert_eq!(step.parameters, json!({}));
    }
}
