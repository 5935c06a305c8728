use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use handlebars::Handlebars;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::EvalError,
    orchestration::{status_update, Action, Decision, DecisionStrategy, GatewaySession, Reasoning, ToolCallRecord},
    parser::{parse_action, ParseFailure},
    prompt::EvalPrompt,
    providers::LLMProvider,
    tools::{functions::json_schema_for, Capability},
    types::TokenUsage,
};

const AGENT_TEMPLATE: &str = r#"You are an autonomous investigation agent working toward a goal with the capabilities below.
Think before every call, keep a short plan, and stop as soon as the goal is met.

Goal: {{goal}}
{{#if context}}
Context: {{context}}
{{/if}}

Capabilities:
{{#each capabilities}}
- {{this.name}}: {{#if this.description}}{{this.description}}{{else}}No description provided.{{/if}}
  parameters: {{this.schema}}
{{else}}
(none available)
{{/each}}

Every reply must be one JSON object matching this schema:
{{decision_schema}}

To call a capability set "action" and leave "complete" false.
When the goal is met set "complete": true and put your findings in "summary" (text or an object).
Action parameters may reference earlier results as step:<N>.<path> (for example step:0.columns[0].name),
optionally followed by a fallback: step:0.columns[0].name||duration_ms.
"#;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AgentAction {
    /// Capability to call.
    #[serde(alias = "capability")]
    pub tool: String,
    #[serde(default, alias = "arguments")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Plan {
    Text(String),
    Steps(Vec<String>),
}

impl Plan {
    fn into_text(self) -> String {
        match self {
            Plan::Text(text) => text,
            Plan::Steps(steps) => steps
                .iter()
                .enumerate()
                .map(|(i, step)| format!("{}. {step}", i + 1))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// The structured decision the agent strategy requires.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AgentDecision {
    /// What you observed and are thinking about.
    #[serde(default)]
    pub thought: Option<String>,
    /// Remaining plan, as text or a list of steps.
    #[serde(default)]
    pub plan: Option<Plan>,
    /// The next capability call; required unless `complete` is true.
    #[serde(default)]
    pub action: Option<AgentAction>,
    /// Why this action (or completion) is the right move.
    #[serde(default)]
    pub reasoning: Option<String>,
    /// `true` once the goal is met.
    #[serde(default)]
    pub complete: Option<Value>,
    /// Final findings: free text or a structured object.
    #[serde(default)]
    pub summary: Option<Value>,
}

impl AgentDecision {
    pub fn is_complete(&self) -> bool {
        matches!(self.complete, Some(Value::Bool(true)))
    }

    fn into_decision(self) -> Result<Decision, ParseFailure> {
        let complete = self.is_complete();
        let reasoning = Reasoning {
            thought: self.thought,
            plan: self.plan.map(Plan::into_text),
            justification: self.reasoning,
        };
        if complete {
            return Ok(Decision::Complete {
                summary: self.summary,
                reasoning,
            });
        }
        let action = self.action.ok_or_else(|| ParseFailure {
            message: "decision has no `action` and `complete` is not true".to_string(),
            line: None,
            column: None,
            excerpt: None,
        })?;
        Ok(Decision::Invoke(Action {
            tool: action.tool,
            parameters: action.parameters.unwrap_or_else(|| json!({})),
            reasoning,
        }))
    }
}

#[derive(Serialize)]
struct TemplateCapability<'a> {
    name: &'a str,
    description: Option<&'a str>,
    schema: String,
}

pub struct AgentStrategy {
    session: GatewaySession,
}

impl AgentStrategy {
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

pub(crate) fn render_system_prompt(prompt: &EvalPrompt, capabilities: &[Capability]) -> Result<String, EvalError> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);

    let capabilities: Vec<TemplateCapability<'_>> = capabilities
        .iter()
        .map(|capability| TemplateCapability {
            name: &capability.name,
            description: capability.description.as_deref(),
            schema: capability.parameter_schema.to_string(),
        })
        .collect();
    let decision_schema = serde_json::to_string_pretty(&json_schema_for::<AgentDecision>())?;

    let data = json!({
        "goal": prompt.goal,
        "context": prompt.context,
        "capabilities": capabilities,
        "decision_schema": decision_schema,
    });
    Ok(hb.render_template(AGENT_TEMPLATE, &data)?)
}

#[async_trait]
impl DecisionStrategy for AgentStrategy {
    fn name(&self) -> &'static str {
        "agent"
    }

    async fn begin(&mut self, prompt: &EvalPrompt, capabilities: &[Capability]) -> Result<(), EvalError> {
        let system = render_system_prompt(prompt, capabilities)?;
        self.session
            .reset(system, "Begin. Reply with your first decision object.".to_string());
        Ok(())
    }

    async fn decide(&mut self, _step: usize) -> Result<Decision, EvalError> {
        let raw = self.session.ask().await?;
        let decision = parse_action::<AgentDecision>(&raw).and_then(AgentDecision::into_decision);
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
            "{}\nReply with one JSON decision object (thought, plan, action, reasoning, complete, summary).",
            failure.diagnostic()
        ));
    }

    fn usage(&self) -> TokenUsage {
        self.session.usage()
    }
}
