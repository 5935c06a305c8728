//! The bounded step loop shared by every decision strategy.
//!
//! One iteration: take a step from the budget, ask the strategy for a
//! decision, then either feed a parse failure back as guidance, finish on
//! completion, or resolve + normalize + invoke and commit a record. A
//! record is always committed before the next decision is requested.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{EvalError, ToolError},
    normalizer::ParameterNormalizer,
    parser::ParseFailure,
    prompt::EvalPrompt,
    providers::LLMProvider,
    resolver::{StepResolver, StepResults},
    tools::{Capability, ToolHost},
    types::{ChatMessage, CompletionRequest, TokenUsage},
};

pub mod agent;
pub mod conversation;
pub mod scripted;
pub mod transcript;

pub use agent::{AgentDecision, AgentStrategy};
pub use conversation::{ConversationStrategy, ConversationTurn};
pub use scripted::ScriptedStrategy;
pub use transcript::{
    LoopState, ParseDiagnostic, Reasoning, RecordKind, RunOutcome, ToolCallRecord, Transcript,
};

pub const DEFAULT_MAX_STEPS: usize = 10;

const STATUS_PREVIEW_CHARS: usize = 4_000;

/// A capability call the strategy wants executed.
#[derive(Debug, Clone)]
pub struct Action {
    pub tool: String,
    pub parameters: Value,
    pub reasoning: Reasoning,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Invoke(Action),
    Complete {
        summary: Option<Value>,
        reasoning: Reasoning,
    },
    /// The model's reply did not decode; `raw` is the reply text.
    Invalid { failure: ParseFailure, raw: String },
}

impl Decision {
    /// The loop state this decision moves the loop into.
    pub fn next_state(&self) -> LoopState {
        match self {
            Decision::Invoke(_) => LoopState::ExecutingTool,
            Decision::Complete { .. } => LoopState::Done,
            Decision::Invalid { .. } => LoopState::Acting,
        }
    }
}

/// The decision step of the loop. Everything else is shared.
#[async_trait]
pub trait DecisionStrategy: Send {
    fn name(&self) -> &'static str;

    /// Called once before the first decision.
    async fn begin(
        &mut self,
        _prompt: &EvalPrompt,
        _capabilities: &[Capability],
    ) -> Result<(), EvalError> {
        Ok(())
    }

    async fn decide(&mut self, step: usize) -> Result<Decision, EvalError>;

    /// Sees every committed tool-call record.
    fn observe(&mut self, _record: &ToolCallRecord) {}

    /// Receives the diagnostic after an undecodable reply.
    fn guide(&mut self, _failure: &ParseFailure) {}

    /// Tokens spent by this strategy's gateway calls so far.
    fn usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}

/// Conversation state for model-driven strategies. Usage from each call is
/// folded here rather than read from the provider.
pub(crate) struct GatewaySession {
    provider: Arc<dyn LLMProvider>,
    model: String,
    messages: Vec<ChatMessage>,
    usage: TokenUsage,
    timeout: Option<Duration>,
}

impl GatewaySession {
    pub(crate) fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            messages: Vec::new(),
            usage: TokenUsage::default(),
            timeout: None,
        }
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub(crate) fn reset(&mut self, system: String, user: String) {
        self.messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
    }

    pub(crate) fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text));
    }

    pub(crate) fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// One gateway round-trip; the reply is appended to the context.
    pub(crate) async fn ask(&mut self) -> Result<String, EvalError> {
        let request = CompletionRequest::new(self.model.clone(), self.messages.clone());
        let call = self.provider.complete(request);
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| EvalError::Timeout(limit))??,
            None => call.await?,
        };
        self.usage += response.usage;
        let text = response.message.text().unwrap_or_default().to_string();
        self.messages.push(ChatMessage::assistant(text.clone()));
        Ok(text)
    }
}

/// Status line appended to a model's context after each step.
pub(crate) fn status_update(record: &ToolCallRecord) -> String {
    let tool = record.tool.as_deref().unwrap_or("?");
    match (&record.error, &record.response) {
        (Some(error), _) => format!(
            "Step {index} ({tool}) failed: {error}\nAdjust the parameters or choose a different capability.",
            index = record.index
        ),
        (None, response) => {
            let body = response
                .as_ref()
                .map(|value| preview(value, STATUS_PREVIEW_CHARS))
                .unwrap_or_else(|| "null".to_string());
            format!(
                "Step {index} ({tool}) succeeded. Parameters: {params}\nResponse: {body}\nLater parameters may reference this result as step:{index}.<path>.",
                index = record.index,
                params = record.parameters,
            )
        }
    }
}

/// Compact JSON text cut to at most `limit` characters.
pub(crate) fn preview(value: &Value, limit: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= limit {
        return text;
    }
    let mut cut: String = text.chars().take(limit).collect();
    cut.push_str("…[truncated]");
    cut
}

/// Drives strategies against a tool host.
#[derive(Clone)]
pub struct Orchestrator {
    tool_host: Arc<dyn ToolHost>,
    resolver: StepResolver,
    normalizer: Arc<ParameterNormalizer>,
    tool_timeout: Option<Duration>,
    default_max_steps: usize,
}

impl Orchestrator {
    pub fn new(tool_host: Arc<dyn ToolHost>) -> Self {
        Self {
            tool_host,
            resolver: StepResolver::new(),
            normalizer: Arc::new(ParameterNormalizer::default()),
            tool_timeout: None,
            default_max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_resolver(mut self, resolver: StepResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<ParameterNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_default_max_steps(mut self, max_steps: usize) -> Self {
        self.default_max_steps = max_steps;
        self
    }

    /// Scripted prompts without an explicit budget get one step per script
    /// entry plus one for completion.
    pub fn budget_for(&self, prompt: &EvalPrompt) -> usize {
        match (prompt.max_steps, &prompt.steps) {
            (Some(max_steps), _) => max_steps,
            (None, Some(steps)) => steps.len() + 1,
            (None, None) => self.default_max_steps,
        }
    }

    pub async fn run(
        &self,
        prompt: &EvalPrompt,
        strategy: &mut dyn DecisionStrategy,
    ) -> Result<Transcript, EvalError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let max_steps = self.budget_for(prompt);

        let capabilities = self.tool_host.list_capabilities().await?;
        let allowed: Vec<Capability> = capabilities
            .into_iter()
            .filter(|capability| prompt.allows(&capability.name))
            .collect();
        if let Some(names) = &prompt.capabilities {
            for name in names.iter().filter(|n| !allowed.iter().any(|c| &c.name == *n)) {
                warn!(prompt = %prompt.id, capability = %name, "allow-listed capability not offered by host");
            }
        }

        strategy.begin(prompt, &allowed).await?;

        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut parse_failures = Vec::new();
        let mut results = StepResults::new();
        let mut state = LoopState::Acting;
        let mut step = 0usize;

        while !state.is_terminal() {
            step += 1;
            if step > max_steps {
                info!(prompt = %prompt.id, max_steps, "step budget exhausted");
                records.push(ToolCallRecord::terminal(
                    records.len(),
                    step,
                    RecordKind::StepLimitReached,
                    Reasoning::default(),
                    None,
                ));
                state = LoopState::StepLimitReached;
                continue;
            }

            debug!(prompt = %prompt.id, strategy = strategy.name(), step, "requesting decision");
            let decision = strategy.decide(step).await?;
            state = decision.next_state();
            debug!(prompt = %prompt.id, step, state = ?state, "decision received");
            match decision {
                Decision::Invalid { failure, raw } => {
                    warn!(prompt = %prompt.id, step, error = %failure.message, "unparseable decision");
                    strategy.guide(&failure);
                    parse_failures.push(ParseDiagnostic { step, raw, failure });
                }
                Decision::Complete { summary, reasoning } => {
                    records.push(ToolCallRecord::terminal(
                        records.len(),
                        step,
                        RecordKind::Complete,
                        reasoning,
                        summary,
                    ));
                }
                Decision::Invoke(action) => {
                    let record = self
                        .execute(prompt, records.len(), step, action, &allowed, &results)
                        .await;
                    if let Some(response) = &record.response {
                        results.insert(record.index, response.clone());
                    }
                    strategy.observe(&record);
                    records.push(record);
                    state = LoopState::Acting;
                }
            }
        }

        let outcome = match state {
            LoopState::StepLimitReached => RunOutcome::StepLimitReached,
            _ => RunOutcome::Done,
        };
        info!(
            prompt = %prompt.id,
            strategy = strategy.name(),
            outcome = ?outcome,
            records = records.len(),
            parse_failures = parse_failures.len(),
            "orchestration finished"
        );

        Ok(Transcript {
            strategy: strategy.name(),
            outcome,
            records,
            parse_failures,
            steps_used: step.min(max_steps),
            max_steps,
            usage: strategy.usage(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
        })
    }

    async fn execute(
        &self,
        prompt: &EvalPrompt,
        index: usize,
        step: usize,
        action: Action,
        allowed: &[Capability],
        results: &StepResults,
    ) -> ToolCallRecord {
        let started_at = Utc::now();
        let clock = Instant::now();
        let Action {
            tool,
            parameters,
            reasoning,
        } = action;

        let resolution = self.resolver.resolve(&parameters, results);
        let capability = allowed
            .iter()
            .find(|capability| capability.name == tool)
            .cloned()
            .unwrap_or_else(|| Capability::new(tool.clone()));
        let resolved = self.normalizer.normalize(&capability, &resolution.value);

        let outcome = if !prompt.allows(&tool) {
            Err(ToolError::NotAllowed(tool.clone()))
        } else if let Err(error) = self.resolver.check(&resolution) {
            Err(error)
        } else {
            self.invoke(&tool, &resolved).await
        };

        let (response, error) = match outcome {
            Ok(response) => (Some(response), None),
            Err(error) => {
                warn!(prompt = %prompt.id, step, tool = %tool, error = %error, "capability call failed");
                (None, Some(error.to_string()))
            }
        };
        debug!(prompt = %prompt.id, step, index, tool = %tool, ok = error.is_none(), "step committed");

        ToolCallRecord {
            index,
            step,
            kind: RecordKind::ToolCall,
            tool: Some(tool),
            parameters: resolved,
            response,
            error,
            reasoning,
            summary: None,
            started_at,
            finished_at: Utc::now(),
            latency_ms: clock.elapsed().as_millis() as u64,
        }
    }

    async fn invoke(&self, tool: &str, arguments: &Value) -> Result<Value, ToolError> {
        let call = self.tool_host.invoke(tool, arguments);
        match self.tool_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ToolError::Timeout(limit))?,
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn invoke_moves_the_loop_into_tool_execution() {
        let invoke = Decision::Invoke(Action {
            tool: "list_columns".to_string(),
            parameters: json!({}),
            reasoning: Reasoning::default(),
        });
        assert_eq!(invoke.next_state(), LoopState::ExecutingTool);
        assert!(!invoke.next_state().is_terminal());
    }

    #[test]
    fn completion_is_terminal_and_bad_replies_keep_acting() {
        let complete = Decision::Complete {
            summary: None,
            reasoning: Reasoning::default(),
        };
        assert_eq!(complete.next_state(), LoopState::Done);
        assert!(complete.next_state().is_terminal());

        let invalid = Decision::Invalid {
            failure: ParseFailure {
                message: "expected value".to_string(),
                line: Some(1),
                column: Some(1),
                excerpt: None,
            },
            raw: "hello".to_string(),
        };
        assert_eq!(invalid.next_state(), LoopState::Acting);
    }
}
