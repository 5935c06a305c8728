//! Rubric scoring of finished transcripts by a model.
//!
//! The judge's reply is read by field-anchored extraction of a fixed tag
//! set, so any prose around the tags is ignored:
//!
//! ```text
//! <goal_score>0.9</goal_score>
//! <tool_score>0.7</tool_score>
//! <reasoning_score>0.8</reasoning_score>
//! <overall_score>0.8</overall_score>
//! <passed>true</passed>
//! <justification>...</justification>
//! ```

use std::{
    fmt::{self, Write},
    sync::Arc,
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::EvalError,
    orchestration::{preview, RecordKind, Transcript},
    prompt::{EvalPrompt, Rubric},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, TokenUsage},
};

const DEFAULT_RESPONSE_PREVIEW: usize = 2_000;

static RE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?P<tag>goal_score|tool_score|reasoning_score|overall_score|passed|justification)>\s*(?P<value>.*?)\s*</(?:goal_score|tool_score|reasoning_score|overall_score|passed|justification)>")
        .unwrap()
});

static RE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<number>-?\d+(?:\.\d+)?)\s*(?:(?P<percent>%)|/\s*(?P<scale>\d+(?:\.\d+)?))?").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JudgeScores {
    pub goal: f64,
    pub tool_usage: f64,
    pub reasoning: f64,
}

impl JudgeScores {
    pub fn mean(&self) -> f64 {
        (self.goal + self.tool_usage + self.reasoning) / 3.0
    }
}

/// The judge's verdict on one transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub score: f64,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<JudgeScores>,
}

impl Verdict {
    /// Zero-score failure carrying `reasoning` verbatim.
    pub fn failed(reasoning: impl Into<String>) -> Self {
        Self {
            passed: false,
            score: 0.0,
            reasoning: reasoning.into(),
            dimensions: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    pub verdict: Verdict,
    pub usage: TokenUsage,
    pub raw: String,
}

#[derive(Clone)]
pub struct Judge {
    provider: Arc<dyn LLMProvider>,
    model: String,
    response_preview: usize,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout: Option<Duration>,
}

impl fmt::Debug for Judge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Judge")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("response_preview", &self.response_preview)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Judge {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            response_preview: DEFAULT_RESPONSE_PREVIEW,
            temperature: None,
            max_tokens: None,
            timeout: None,
        }
    }

    pub fn with_response_preview(mut self, chars: usize) -> Self {
        self.response_preview = chars;
        self
    }

    /// Sampling temperature for the grading call; the gateway default when unset.
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn evaluate(&self, prompt: &EvalPrompt, transcript: &Transcript) -> Result<JudgeOutcome, EvalError> {
        let text = self.build_prompt(prompt, transcript);
        let mut request = CompletionRequest::new(self.model.clone(), vec![ChatMessage::user(text)]);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let call = self.provider.run(request);
        let completion = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| EvalError::Timeout(limit))??,
            None => call.await?,
        };
        let verdict = parse_verdict(&completion.text, &prompt.rubric);
        debug!(prompt = %prompt.id, score = verdict.score, passed = verdict.passed, "judge verdict");
        Ok(JudgeOutcome {
            verdict,
            usage: completion.usage,
            raw: completion.text,
        })
    }

    pub fn build_prompt(&self, prompt: &EvalPrompt, transcript: &Transcript) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "You are grading an autonomous agent that used tools to pursue a goal.");
        let _ = writeln!(out, "\nGoal: {}", prompt.goal);
        if let Some(context) = &prompt.context {
            let _ = writeln!(out, "Context: {context}");
        }

        let _ = writeln!(out, "\nRubric:\n{}", prompt.rubric.criteria);
        if let Some(expectations) = &prompt.rubric.expectations {
            let rendered = serde_json::to_string_pretty(expectations).unwrap_or_else(|_| expectations.to_string());
            let _ = writeln!(out, "Expectations:\n{rendered}");
        }

        let _ = writeln!(
            out,
            "\nTranscript ({} strategy, outcome {:?}, {} of {} steps used):",
            transcript.strategy, transcript.outcome, transcript.steps_used, transcript.max_steps
        );
        for record in &transcript.records {
            match record.kind {
                RecordKind::ToolCall => {
                    let _ = writeln!(out, "\nStep {}: {}", record.index, record.tool.as_deref().unwrap_or("?"));
                    if let Some(thought) = &record.reasoning.thought {
                        let _ = writeln!(out, "  Thought: {thought}");
                    }
                    if let Some(plan) = &record.reasoning.plan {
                        let _ = writeln!(out, "  Plan: {plan}");
                    }
                    if let Some(justification) = &record.reasoning.justification {
                        let _ = writeln!(out, "  Reasoning: {justification}");
                    }
                    let _ = writeln!(out, "  Parameters: {}", record.parameters);
                    match (&record.error, &record.response) {
                        (Some(error), _) => {
                            let _ = writeln!(out, "  Error: {error}");
                        }
                        (None, Some(response)) => {
                            let _ = writeln!(out, "  Response: {}", preview(response, self.response_preview));
                        }
                        (None, None) => {}
                    }
                }
                RecordKind::Complete => {
                    let _ = writeln!(out, "\nCompleted at step {}.", record.step);
                    if let Some(thought) = &record.reasoning.thought {
                        let _ = writeln!(out, "  Thought: {thought}");
                    }
                    if let Some(justification) = &record.reasoning.justification {
                        let _ = writeln!(out, "  Reasoning: {justification}");
                    }
                    if let Some(summary) = &record.summary {
                        let text = match summary {
                            serde_json::Value::String(text) => text.clone(),
                            other => other.to_string(),
                        };
                        let _ = writeln!(out, "  Summary: {text}");
                    }
                }
                RecordKind::StepLimitReached => {
                    let _ = writeln!(out, "\nStopped: step budget of {} exhausted before completion.", transcript.max_steps);
                }
            }
        }
        if !transcript.parse_failures.is_empty() {
            let _ = writeln!(
                out,
                "\n{} repl{} could not be parsed and were retried.",
                transcript.parse_failures.len(),
                if transcript.parse_failures.len() == 1 { "y" } else { "ies" }
            );
        }

        let _ = writeln!(
            out,
            r#"
Score each dimension from 0.0 to 1.0 and answer with these tags:
<goal_score>how well the goal was achieved</goal_score>
<tool_score>how appropriate and efficient the tool usage was</tool_score>
<reasoning_score>how sound the reasoning was</reasoning_score>
<overall_score>overall score</overall_score>
<passed>true or false; pass when the overall score is at least {threshold:.2}</passed>
<justification>a short explanation</justification>"#,
            threshold = prompt.rubric.threshold()
        );
        out
    }
}

/// Read a verdict out of judge text. Never fails: text without any tags is
/// a zero-score failure with the raw text as reasoning.
pub fn parse_verdict(text: &str, rubric: &Rubric) -> Verdict {
    let mut goal = None;
    let mut tool = None;
    let mut reasoning_score = None;
    let mut overall = None;
    let mut passed = None;
    let mut justification = None;
    let mut found = false;

    for caps in RE_TAG.captures_iter(text) {
        found = true;
        let value = caps.name("value").map(|m| m.as_str()).unwrap_or_default();
        let tag = caps.name("tag").map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
        match tag.as_str() {
            "goal_score" => goal = goal.or(parse_score(value)),
            "tool_score" => tool = tool.or(parse_score(value)),
            "reasoning_score" => reasoning_score = reasoning_score.or(parse_score(value)),
            "overall_score" => overall = overall.or(parse_score(value)),
            "passed" => passed = passed.or(parse_flag(value)),
            "justification" => justification = justification.or(Some(value.to_string())),
            _ => {}
        }
    }

    if !found {
        return Verdict::failed(text);
    }

    let dimensions = JudgeScores {
        goal: goal.unwrap_or(0.0),
        tool_usage: tool.unwrap_or(0.0),
        reasoning: reasoning_score.unwrap_or(0.0),
    };
    let score = overall.unwrap_or_else(|| dimensions.mean());
    Verdict {
        passed: passed.unwrap_or(score >= rubric.threshold()),
        score,
        reasoning: justification.unwrap_or_else(|| text.trim().to_string()),
        dimensions: Some(dimensions),
    }
}

/// Read a score onto the 0..=1 scale.
///
/// `a/b` is a fraction and `N%` a percentage. A bare number above 1 is read
/// as out of 10 when it is at most 10; anything larger has no known scale
/// and is dropped, so the tag counts as missing.
fn parse_score(value: &str) -> Option<f64> {
    let caps = RE_NUMBER.captures(value)?;
    let number: f64 = caps.name("number")?.as_str().parse().ok()?;

    let score = if caps.name("percent").is_some() {
        number / 100.0
    } else if let Some(scale) = caps.name("scale") {
        let scale: f64 = scale.as_str().parse().ok()?;
        if scale <= 0.0 {
            return None;
        }
        number / scale
    } else if number > 10.0 {
        return None;
    } else if number > 1.0 {
        number / 10.0
    } else {
        number
    };

    (score <= 1.0).then(|| score.max(0.0))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "pass" | "passed" => Some(true),
        "false" | "no" | "fail" | "failed" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::{
        orchestration::RunOutcome,
        types::CompletionResponse,
    };

    /// Replies with a fixed verdict and keeps the last request.
    #[derive(Default)]
    struct RecordingGateway {
        last: Mutex<Option<CompletionRequest>>,
    }

    #[async_trait]
    impl LLMProvider for RecordingGateway {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, EvalError> {
            *self.last.lock().unwrap() = Some(request);
            Ok(CompletionResponse {
                message: ChatMessage::assistant("<overall_score>0.9</overall_score>"),
                usage: Some(TokenUsage::new(10, 2)),
            })
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn empty_transcript() -> Transcript {
        Transcript {
            strategy: "agent",
            outcome: RunOutcome::Done,
            records: Vec::new(),
            parse_failures: Vec::new(),
            steps_used: 0,
            max_steps: 3,
            usage: TokenUsage::default(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 0,
        }
    }

    fn rubric() -> Rubric {
        Rubric::new("Finds the slowest endpoint")
    }

    #[test]
    fn extracts_tags_around_prose() {
        let text = "Let me think.\n<goal_score>0.9</goal_score> and <TOOL_SCORE> 0.6 </TOOL_SCORE>\n<reasoning_score>0.75</reasoning_score>\n<overall_score>0.8</overall_score><passed>true</passed>\n<justification>Found /checkout.</justification> Thanks!";
        let verdict = parse_verdict(text, &rubric());
        assert!(verdict.passed);
        assert_eq!(verdict.score, 0.8);
        assert_eq!(verdict.reasoning, "Found /checkout.");
        let dims = verdict.dimensions.expect("dimensions");
        assert_eq!(dims.tool_usage, 0.6);
    }

    #[test]
    fn overall_defaults_to_mean_of_sub_scores() {
        let text = "<goal_score>0.9</goal_score><tool_score>0.6</tool_score><reasoning_score>0.3</reasoning_score>";
        let verdict = parse_verdict(text, &rubric());
        assert!((verdict.score - 0.6).abs() < 1e-9);
        assert!(!verdict.passed);
    }

    #[test]
    fn pass_flag_falls_back_to_threshold() {
        let mut strict = rubric();
        strict.pass_threshold = Some(0.5);
        let verdict = parse_verdict("<overall_score>0.55</overall_score>", &strict);
        assert!(verdict.passed);
    }

    #[test]
    fn untagged_reply_is_zero_score_failure() {
        let text = "The agent did a reasonable job overall.";
        let verdict = parse_verdict(text, &rubric());
        assert_eq!(verdict, Verdict::failed(text));
        assert_eq!(verdict.score, 0.0);
        assert!(!verdict.passed);
        assert_eq!(verdict.reasoning, text);
    }

    #[test]
    fn percentage_is_read_as_hundredths() {
        let verdict = parse_verdict("<overall_score>45%</overall_score>", &rubric());
        assert!((verdict.score - 0.45).abs() < 1e-9);
        assert!(!verdict.passed);
    }

    #[test]
    fn fraction_uses_its_own_denominator() {
        let verdict = parse_verdict("<overall_score>8/10</overall_score>", &rubric());
        assert!((verdict.score - 0.8).abs() < 1e-9);
        assert!(verdict.passed);

        let verdict = parse_verdict("<overall_score>3 / 10</overall_score>", &rubric());
        assert!((verdict.score - 0.3).abs() < 1e-9);
        assert!(!verdict.passed);
    }

    #[test]
    fn bare_number_above_one_is_out_of_ten() {
        let verdict = parse_verdict("<overall_score>3</overall_score>", &rubric());
        assert!((verdict.score - 0.3).abs() < 1e-9);
        assert!(!verdict.passed);
    }

    #[test]
    fn unscaled_large_score_falls_back_to_sub_scores() {
        let text = "<goal_score>0.4</goal_score><tool_score>0.4</tool_score><reasoning_score>0.4</reasoning_score><overall_score>85</overall_score>";
        let verdict = parse_verdict(text, &rubric());
        assert!((verdict.score - 0.4).abs() < 1e-9);
        assert!(!verdict.passed);
    }

    #[tokio::test]
    async fn sampling_settings_reach_the_grading_request() {
        let gateway = Arc::new(RecordingGateway::default());
        let judge = Judge::new(gateway.clone(), "judge-model")
            .with_temperature(Some(0.0))
            .with_max_tokens(Some(256));
        let prompt = EvalPrompt::new("p", "Find the slowest endpoint", rubric());

        let outcome = judge.evaluate(&prompt, &empty_transcript()).await.expect("verdict");

        assert!(outcome.verdict.passed);
        assert_eq!(outcome.usage.total_tokens, 12);
        let request = gateway.last.lock().unwrap().clone().expect("request");
        assert_eq!(request.model, "judge-model");
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, Some(256));
    }

    #[tokio::test]
    async fn unset_sampling_settings_stay_off_the_request() {
        let gateway = Arc::new(RecordingGateway::default());
        let judge = Judge::new(gateway.clone(), "judge-model");
        let prompt = EvalPrompt::new("p", "Find the slowest endpoint", rubric());

        judge.evaluate(&prompt, &empty_transcript()).await.expect("verdict");

        let request = gateway.last.lock().unwrap().clone().expect("request");
        assert_eq!(request.temperature, None);
        assert_eq!(request.max_tokens, None);
    }
}
