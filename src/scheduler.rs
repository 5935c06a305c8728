//! Windowed fan-out of prompts across provider/model targets.

use std::{any::Any, fmt, panic::AssertUnwindSafe, str::FromStr, sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::{stream::FuturesUnordered, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::EvalError,
    judge::{Judge, Verdict},
    normalizer::ParameterNormalizer,
    orchestration::{
        AgentStrategy, ConversationStrategy, DecisionStrategy, Orchestrator, ScriptedStrategy, Transcript,
        DEFAULT_MAX_STEPS,
    },
    prompt::EvalPrompt,
    providers::LLMProvider,
    report::{EvalMetrics, EvalResult},
    resolver::StepResolver,
    tools::ToolHost,
    types::TokenUsage,
};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// One provider/model pair every prompt runs against.
#[derive(Clone)]
pub struct ModelTarget {
    pub provider: Arc<dyn LLMProvider>,
    pub model: String,
    label: Option<String>,
}

impl ModelTarget {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            label: None,
        }
    }

    /// Overrides the provider name used in results and file names.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn provider_name(&self) -> &str {
        self.label.as_deref().unwrap_or_else(|| self.provider.name())
    }
}

impl fmt::Debug for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelTarget")
            .field("provider", &self.provider_name())
            .field("model", &self.model)
            .finish()
    }
}

/// Decision strategy for prompts without a fixed script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Agent,
    Conversation,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "agent" => Ok(StrategyKind::Agent),
            "conversation" => Ok(StrategyKind::Conversation),
            other => Err(format!("unknown mode '{other}' (expected agent or conversation)")),
        }
    }
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Agent => "agent",
            StrategyKind::Conversation => "conversation",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Evaluations per window; 0 behaves as 1.
    pub concurrency: usize,
    pub mode: StrategyKind,
    pub default_max_steps: usize,
    pub strict_references: bool,
    pub gateway_timeout: Option<Duration>,
    pub tool_timeout: Option<Duration>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            mode: StrategyKind::default(),
            default_max_steps: DEFAULT_MAX_STEPS,
            strict_references: false,
            gateway_timeout: None,
            tool_timeout: None,
        }
    }
}

pub struct EvaluationScheduler {
    targets: Vec<ModelTarget>,
    judge: Judge,
    tool_host: Arc<dyn ToolHost>,
    normalizer: Arc<ParameterNormalizer>,
    settings: SchedulerSettings,
}

impl EvaluationScheduler {
    pub fn new(targets: Vec<ModelTarget>, judge: Judge, tool_host: Arc<dyn ToolHost>) -> Self {
        Self {
            targets,
            judge,
            tool_host,
            normalizer: Arc::new(ParameterNormalizer::default()),
            settings: SchedulerSettings::default(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: ParameterNormalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.settings.concurrency = concurrency;
        self
    }

    pub fn with_mode(mut self, mode: StrategyKind) -> Self {
        self.settings.mode = mode;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn targets(&self) -> &[ModelTarget] {
        &self.targets
    }

    pub fn judge(&self) -> &Judge {
        &self.judge
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(Arc::clone(&self.tool_host))
            .with_resolver(StepResolver::new().strict(self.settings.strict_references))
            .with_normalizer(Arc::clone(&self.normalizer))
            .with_tool_timeout(self.settings.tool_timeout)
            .with_default_max_steps(self.settings.default_max_steps)
    }

    /// Runs every prompt against every target. Only a missing target list
    /// is an error; individual evaluation failures become failed results.
    pub async fn run(&self, prompts: &[EvalPrompt]) -> Result<Vec<EvalResult>, EvalError> {
        if self.targets.is_empty() {
            return Err(EvalError::Config("no provider/model targets configured".to_string()));
        }

        let orchestrator = self.orchestrator();
        let work: Vec<(&ModelTarget, &EvalPrompt)> = self
            .targets
            .iter()
            .flat_map(|target| prompts.iter().map(move |prompt| (target, prompt)))
            .collect();
        let window = self.settings.concurrency.max(1);
        let windows = work.len().div_ceil(window);
        info!(
            evaluations = work.len(),
            targets = self.targets.len(),
            prompts = prompts.len(),
            window,
            "starting evaluation run"
        );

        let mut results = Vec::with_capacity(work.len());
        for (n, chunk) in work.chunks(window).enumerate() {
            info!(window = n + 1, of = windows, size = chunk.len(), "running window");
            let mut pending = FuturesUnordered::new();
            for (slot, (target, prompt)) in chunk.iter().enumerate() {
                let orchestrator = &orchestrator;
                pending.push(async move {
                    let evaluation = AssertUnwindSafe(self.evaluate(orchestrator, target, prompt)).catch_unwind();
                    let result = match evaluation.await {
                        Ok(result) => result,
                        Err(payload) => {
                            let error = EvalError::Panicked(panic_message(&*payload));
                            warn!(prompt = %prompt.id, provider = target.provider_name(), model = %target.model, %error, "evaluation panicked");
                            failed_result(target, prompt, self.strategy_label(prompt).to_string(), &error)
                        }
                    };
                    (slot, result)
                });
            }
            let mut batch: Vec<Option<EvalResult>> = vec![None; chunk.len()];
            while let Some((slot, result)) = pending.next().await {
                batch[slot] = Some(result);
            }
            results.extend(batch.into_iter().flatten());
        }

        let passed = results.iter().filter(|result| result.passed()).count();
        info!(total = results.len(), passed, "evaluation run finished");
        Ok(results)
    }

    /// One evaluation; never fails.
    pub async fn evaluate(&self, orchestrator: &Orchestrator, target: &ModelTarget, prompt: &EvalPrompt) -> EvalResult {
        let mut strategy = self.strategy_for(target, prompt);
        let strategy_name = strategy.name().to_string();
        let started_at = Utc::now();

        let transcript = match orchestrator.run(prompt, strategy.as_mut()).await {
            Ok(transcript) => transcript,
            Err(error) => {
                warn!(prompt = %prompt.id, provider = target.provider_name(), model = %target.model, %error, "evaluation failed");
                let mut result = failed_result(target, prompt, strategy_name, &error);
                result.metrics.started_at = started_at;
                result.metrics.duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                result.metrics.agent_usage = strategy.usage();
                return result;
            }
        };

        let (validation, judge_usage, error) = match self.judge.evaluate(prompt, &transcript).await {
            Ok(outcome) => (outcome.verdict, outcome.usage, None),
            Err(error) => {
                warn!(prompt = %prompt.id, provider = target.provider_name(), model = %target.model, %error, "judge call failed");
                (
                    Verdict::failed(format!("judge failed: {error}")),
                    TokenUsage::default(),
                    Some(error.to_string()),
                )
            }
        };
        info!(
            prompt = %prompt.id,
            provider = target.provider_name(),
            model = %target.model,
            score = validation.score,
            passed = validation.passed,
            "evaluation scored"
        );

        from_transcript(target, prompt, transcript, validation, judge_usage, error)
    }

    fn strategy_label(&self, prompt: &EvalPrompt) -> &'static str {
        if prompt.is_scripted() {
            "scripted"
        } else {
            self.settings.mode.as_str()
        }
    }

    fn strategy_for(&self, target: &ModelTarget, prompt: &EvalPrompt) -> Box<dyn DecisionStrategy> {
        if prompt.is_scripted() {
            return Box::new(ScriptedStrategy::from_prompt(prompt));
        }
        let provider = Arc::clone(&target.provider);
        match self.settings.mode {
            StrategyKind::Agent => {
                Box::new(AgentStrategy::new(provider, target.model.clone()).with_timeout(self.settings.gateway_timeout))
            }
            StrategyKind::Conversation => Box::new(
                ConversationStrategy::new(provider, target.model.clone()).with_timeout(self.settings.gateway_timeout),
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn result_id(target: &ModelTarget, prompt: &EvalPrompt) -> String {
    format!("{}-{}-{}", prompt.id, target.provider_name(), target.model)
}

fn from_transcript(
    target: &ModelTarget,
    prompt: &EvalPrompt,
    transcript: Transcript,
    validation: Verdict,
    judge_usage: TokenUsage,
    error: Option<String>,
) -> EvalResult {
    let summary = transcript.summary().cloned();
    let metrics = EvalMetrics {
        started_at: transcript.started_at,
        finished_at: Utc::now(),
        duration_ms: (Utc::now() - transcript.started_at).num_milliseconds().max(0) as u64,
        steps_used: transcript.steps_used,
        max_steps: transcript.max_steps,
        tool_call_count: transcript.tool_calls().count(),
        tool_error_count: transcript.tool_error_count(),
        parse_failure_count: transcript.parse_failures.len(),
        agent_usage: transcript.usage,
        judge_usage,
    };
    EvalResult {
        id: result_id(target, prompt),
        prompt: prompt.clone(),
        provider: target.provider_name().to_string(),
        model: target.model.clone(),
        strategy: transcript.strategy.to_string(),
        outcome: Some(transcript.outcome),
        tool_calls: transcript.records,
        parse_failures: transcript.parse_failures,
        summary,
        validation,
        error,
        metrics,
    }
}

fn failed_result(target: &ModelTarget, prompt: &EvalPrompt, strategy: String, error: &EvalError) -> EvalResult {
    let now = Utc::now();
    EvalResult {
        id: result_id(target, prompt),
        prompt: prompt.clone(),
        provider: target.provider_name().to_string(),
        model: target.model.clone(),
        strategy,
        outcome: None,
        tool_calls: Vec::new(),
        parse_failures: Vec::new(),
        summary: None,
        validation: Verdict::failed(error.to_string()),
        error: Some(error.to_string()),
        metrics: EvalMetrics {
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            steps_used: 0,
            max_steps: prompt.max_steps.unwrap_or(0),
            tool_call_count: 0,
            tool_error_count: 0,
            parse_failure_count: 0,
            agent_usage: TokenUsage::default(),
            judge_usage: TokenUsage::default(),
        },
    }
}
