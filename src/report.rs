use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    error::EvalError,
    judge::Verdict,
    orchestration::{ParseDiagnostic, RunOutcome, ToolCallRecord},
    prompt::EvalPrompt,
    types::TokenUsage,
};

const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, Serialize)]
pub struct EvalMetrics {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps_used: usize,
    pub max_steps: usize,
    pub tool_call_count: usize,
    pub tool_error_count: usize,
    pub parse_failure_count: usize,
    pub agent_usage: TokenUsage,
    pub judge_usage: TokenUsage,
}

impl EvalMetrics {
    pub fn total_usage(&self) -> TokenUsage {
        let mut usage = self.agent_usage;
        usage += self.judge_usage;
        usage
    }
}

/// One (prompt, provider, model) evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct EvalResult {
    pub id: String,
    pub prompt: EvalPrompt,
    pub provider: String,
    pub model: String,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parse_failures: Vec<ParseDiagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    pub validation: Verdict,
    /// Set when the evaluation itself broke (gateway, judge, deadline).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: EvalMetrics,
}

impl EvalResult {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.validation.passed
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", sanitize(&self.id))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetSummary {
    pub provider: String,
    pub model: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub pass_rate: f64,
    pub average_score: f64,
    pub average_latency_ms: f64,
    pub average_steps: f64,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct JudgeInfo {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub pass_rate: f64,
    pub average_score: f64,
    pub average_latency_ms: f64,
    pub average_steps: f64,
    pub agent_usage: TokenUsage,
    pub judge_usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeInfo>,
    pub targets: Vec<TargetSummary>,
}

#[derive(Default)]
struct Tally {
    total: usize,
    passed: usize,
    errors: usize,
    score: f64,
    latency_ms: f64,
    steps: f64,
    agent_usage: TokenUsage,
    judge_usage: TokenUsage,
}

impl Tally {
    fn add(&mut self, result: &EvalResult) {
        self.total += 1;
        if result.passed() {
            self.passed += 1;
        }
        if result.error.is_some() {
            self.errors += 1;
        }
        self.score += result.validation.score;
        self.latency_ms += result.metrics.duration_ms as f64;
        self.steps += result.metrics.steps_used as f64;
        self.agent_usage += result.metrics.agent_usage;
        self.judge_usage += result.metrics.judge_usage;
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            sum / self.total as f64
        }
    }
}

impl EvalSummary {
    pub fn from_results(results: &[EvalResult]) -> Self {
        let mut overall = Tally::default();
        let mut per_target: BTreeMap<(String, String), Tally> = BTreeMap::new();
        for result in results {
            overall.add(result);
            per_target
                .entry((result.provider.clone(), result.model.clone()))
                .or_default()
                .add(result);
        }

        let targets = per_target
            .into_iter()
            .map(|((provider, model), tally)| {
                let mut usage = tally.agent_usage;
                usage += tally.judge_usage;
                TargetSummary {
                    provider,
                    model,
                    total: tally.total,
                    passed: tally.passed,
                    failed: tally.total - tally.passed,
                    errors: tally.errors,
                    pass_rate: tally.mean(tally.passed as f64),
                    average_score: tally.mean(tally.score),
                    average_latency_ms: tally.mean(tally.latency_ms),
                    average_steps: tally.mean(tally.steps),
                    usage,
                }
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            total: overall.total,
            passed: overall.passed,
            failed: overall.total - overall.passed,
            errors: overall.errors,
            pass_rate: overall.mean(overall.passed as f64),
            average_score: overall.mean(overall.score),
            average_latency_ms: overall.mean(overall.latency_ms),
            average_steps: overall.mean(overall.steps),
            agent_usage: overall.agent_usage,
            judge_usage: overall.judge_usage,
            judge: None,
            targets,
        }
    }

    pub fn with_judge(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.judge = Some(JudgeInfo {
            provider: provider.into(),
            model: model.into(),
        });
        self
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

/// Writes one JSON file per evaluation plus `summary.json`.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    dir: PathBuf,
}

impl ResultWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Ids that sanitize to the same file name get `-2`, `-3`, ... suffixes
    /// in result order, so no result overwrites another or the summary.
    pub fn write_all(&self, results: &[EvalResult], summary: &EvalSummary) -> Result<PathBuf, EvalError> {
        fs::create_dir_all(&self.dir)?;
        let mut taken = HashSet::from([SUMMARY_FILE.to_string()]);
        for result in results {
            let preferred = result.file_name();
            let name = claim_file_name(&preferred, &mut taken);
            if name != preferred {
                warn!(id = %result.id, file = %name, "result file name already taken");
            }
            self.write_json(&name, result)?;
        }
        let path = self.write_json(SUMMARY_FILE, summary)?;
        info!(dir = %self.dir.display(), results = results.len(), "results written");
        Ok(path)
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, EvalError> {
        let path = self.dir.join(name);
        fs::write(&path, serde_json::to_vec_pretty(value)?)?;
        Ok(path)
    }
}

fn claim_file_name(preferred: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(preferred.to_string()) {
        return preferred.to_string();
    }
    let stem = preferred.strip_suffix(".json").unwrap_or(preferred);
    (2..)
        .map(|n| format!("{stem}-{n}.json"))
        .find(|candidate| taken.insert(candidate.clone()))
        .unwrap_or_else(|| preferred.to_string())
}

/// File-name-safe form: anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "result".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Rubric;

    fn result(provider: &str, model: &str, score: f64, passed: bool, error: Option<&str>) -> EvalResult {
        let now = Utc::now();
        EvalResult {
            id: format!("p-{provider}-{model}"),
            prompt: EvalPrompt::new("p", "goal", Rubric::new("criteria")),
            provider: provider.to_string(),
            model: model.to_string(),
            strategy: "agent".to_string(),
            outcome: Some(RunOutcome::Done),
            tool_calls: Vec::new(),
            parse_failures: Vec::new(),
            summary: None,
            validation: Verdict {
                passed,
                score,
                reasoning: String::new(),
                dimensions: None,
            },
            error: error.map(str::to_string),
            metrics: EvalMetrics {
                started_at: now,
                finished_at: now,
                duration_ms: 100,
                steps_used: 2,
                max_steps: 10,
                tool_call_count: 1,
                tool_error_count: 0,
                parse_failure_count: 0,
                agent_usage: TokenUsage::new(10, 5),
                judge_usage: TokenUsage::new(3, 1),
            },
        }
    }

    #[test]
    fn summary_aggregates_overall_and_per_target() {
        let results = vec![
            result("openai", "gpt-4o", 0.9, true, None),
            result("openai", "gpt-4o", 0.5, false, None),
            result("openrouter", "llama", 0.0, false, Some("gateway down")),
        ];
        let summary = EvalSummary::from_results(&results).with_judge("openai", "gpt-4o");

        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.errors, 1);
        assert!((summary.pass_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((summary.average_score - 1.4 / 3.0).abs() < 1e-9);
        assert_eq!(summary.agent_usage.total_tokens, 45);
        assert_eq!(summary.targets.len(), 2);

        let openai = &summary.targets[0];
        assert_eq!((openai.provider.as_str(), openai.total, openai.passed), ("openai", 2, 1));
        assert_eq!(openai.usage.total_tokens, 38);
        assert!(!summary.all_passed());
    }

    #[test]
    fn empty_summary_has_zero_rates() {
        let summary = EvalSummary::from_results(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.pass_rate, 0.0);
        assert!(summary.all_passed());
    }

    #[test]
    fn writer_emits_sanitized_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ResultWriter::new(dir.path().join("run"));
        let results = vec![result("openrouter", "meta/llama:free", 0.8, true, None)];
        let summary = EvalSummary::from_results(&results);

        writer.write_all(&results, &summary).expect("write");

        let file = dir.path().join("run").join("p-openrouter-meta_llama_free.json");
        let written: Value = serde_json::from_slice(&std::fs::read(file).expect("read")).expect("json");
        assert_eq!(written["validation"]["score"], 0.8);
        assert!(dir.path().join("run").join("summary.json").exists());
    }

    #[test]
    fn colliding_ids_get_distinct_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = ResultWriter::new(dir.path());
        let mut slash = result("openrouter", "meta/llama", 0.8, true, None);
        slash.id = "meta/llama".to_string();
        let mut colon = result("openrouter", "meta:llama", 0.4, false, None);
        colon.id = "meta:llama".to_string();
        let mut summary_like = result("openai", "summary", 0.1, false, None);
        summary_like.id = "summary".to_string();
        let results = vec![slash, colon, summary_like];
        let summary = EvalSummary::from_results(&results);

        writer.write_all(&results, &summary).expect("write");

        let read = |name: &str| -> Value {
            serde_json::from_slice(&std::fs::read(dir.path().join(name)).expect(name)).expect("json")
        };
        assert_eq!(read("meta_llama.json")["id"], "meta/llama");
        assert_eq!(read("meta_llama-2.json")["id"], "meta:llama");
        assert_eq!(read("summary-2.json")["id"], "summary");
        assert_eq!(read("summary.json")["total"], 3);
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize("a b/c"), "a_b_c");
        assert_eq!(sanitize(".."), "result");
    }
}
