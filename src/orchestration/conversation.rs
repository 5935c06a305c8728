use std::{fmt::Write, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::EvalError,
    orchestration::{status_update, Action, Decision, DecisionStrategy, GatewaySession, Reasoning, ToolCallRecord},
    parser::{parse_action, ParseFailure},
    prompt::EvalPrompt,
    providers::LLMProvider,
    tools::Capability,
    types::TokenUsage,
};

/// The free-form decision shape: one capability call or `done`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationTurn {
    #[serde(default, alias = "capability")]
    pub tool: Option<String>,
    #[serde(default, alias = "arguments", alias = "params")]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub reasoning: Option<String>,
    /// Only a literal `true` finishes the run.
    #[serde(default)]
    pub done: Option<Value>,
    #[serde(default, alias = "answer")]
    pub summary: Option<Value>,
}

impl ConversationTurn {
    pub fn is_done(&self) -> bool {
        matches!(self.done, Some(Value::Bool(true)))
    }

    fn into_decision(self) -> Result<Decision, ParseFailure> {
        let reasoning = Reasoning {
            justification: self.reasoning.clone(),
            ..Reasoning::default()
        };
        if self.is_done() {
            return Ok(Decision::Complete {
                summary: self.summary,
                reasoning,
            });
        }
        let tool = self.tool.filter(|t| !t.trim().is_empty()).ok_or_else(|| ParseFailure {
            message: "response names no `tool` and is not marked `\"done\": true`".to_string(),
            line: None,
            column: None,
            excerpt: None,
        })?;
        Ok(Decision::Invoke(Action {
            tool,
            parameters: self.parameters.unwrap_or_else(|| Value::Object(Default::default())),
            reasoning,
        }))
    }
}

pub struct ConversationStrategy {
    session: GatewaySession,
}

impl ConversationStrategy {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            session: GatewaySession::new(provider, model),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session.set_timeout(timeout);
        self
    }
}

fn build_system_prompt(capabilities: &[Capability]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "You answer questions by calling the capabilities listed below, one call per reply.");
    let _ = writeln!(prompt, "\nCapabilities:");
    if capabilities.is_empty() {
        let _ = writeln!(prompt, "(none available)");
    }
    for capability in capabilities {
        let description = capability.description.as_deref().unwrap_or("No description provided.");
        let _ = writeln!(prompt, "- {}: {}", capability.name, description);
        let _ = writeln!(prompt, "  parameters: {}", capability.parameter_schema);
    }
    let _ = writeln!(
        prompt,
        r#"
Respond with a single JSON object and nothing else:
- {{"tool":"<capability>","parameters":{{...}},"reasoning":"<why this call>"}}
- {{"done":true,"summary":"<final answer>","reasoning":"<why you are finished>"}}

Parameters may reference earlier results as step:<N>.<path>, for example step:0.columns[0].name.
An optional fallback follows ||, as in step:0.columns[0].name||duration_ms."#
    );
    prompt
}

fn build_task(prompt: &EvalPrompt) -> String {
    let mut task = format!("Goal: {}", prompt.goal);
    if let Some(context) = &prompt.context {
        let _ = write!(task, "\n\nContext: {context}");
    }
    task
}

#[async_trait]
impl DecisionStrategy for ConversationStrategy {
    fn name(&self) -> &'static str {
        "conversation"
    }

    async fn begin(&mut self, prompt: &EvalPrompt, capabilities: &[Capability]) -> Result<(), EvalError> {
        self.session.reset(build_system_prompt(capabilities), build_task(prompt));
        Ok(())
    }

    async fn decide(&mut self, _step: usize) -> Result<Decision, EvalError> {
        let raw = self.session.ask().await?;
        let decision = parse_action::<ConversationTurn>(&raw).and_then(ConversationTurn::into_decision);
        Ok(match decision {
            Ok(decision) => decision,
            Err(failure) => Decision::Invalid { failure, raw },
        })
    }

    fn observe(&mut self, record: &ToolCallRecord) {
        self.session.push_user(status_update(record));
    }

    fn guide(&mut self, failure: &ParseFailure) {
        self.session.push_user(format!(
            "{}\nReply with exactly one JSON object in the format described above.",
            failure.diagnostic()
        ));
    }

    fn usage(&self) -> TokenUsage {
        self.session.usage()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn decide(text: &str) -> Result<Decision, ParseFailure> {
        parse_action::<ConversationTurn>(text).and_then(ConversationTurn::into_decision)
    }

    #[test]
    fn tool_call_becomes_invoke() {
        match decide(r#"{"tool":"run_query","parameters":{"dataset":"api"},"reasoning":"need counts"}"#) {
            Ok(Decision::Invoke(action)) => {
                assert_eq!(action.tool, "run_query");
                assert_eq!(action.parameters, json!({"dataset": "api"}));
                assert_eq!(action.reasoning.justification.as_deref(), Some("need counts"));
            }
            other => panic!("expected invoke, got {other:?}"),
        }
    }

    #[test]
    fn only_literal_true_finishes() {
        assert!(matches!(decide(r#"{"done":true,"summary":"42"}"#), Ok(Decision::Complete { .. })));
        assert!(decide(r#"{"done":"true"}"#).is_err());
        assert!(decide(r#"{"done":false}"#).is_err());
        assert!(matches!(
            decide(r#"{"done":false,"tool":"list_columns"}"#),
            Ok(Decision::Invoke(_))
        ));
    }

    #[test]
    fn system_prompt_lists_capabilities() {
        let prompt = build_system_prompt(&[Capability::new("list_columns").with_description("Columns of a dataset")]);
        assert!(prompt.contains("- list_columns: Columns of a dataset"));
        assert!(prompt.contains(r#"{"done":true"#));
    }
}
