use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{parser::ParseFailure, types::TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    ToolCall,
    /// Terminal record written when the strategy signals completion.
    Complete,
    /// Terminal marker written when the step budget runs out.
    StepLimitReached,
}

/// Free-text reasoning attached to a decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reasoning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

impl Reasoning {
    pub fn justified(text: impl Into<String>) -> Self {
        Self {
            justification: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.thought.is_none() && self.plan.is_none() && self.justification.is_none()
    }
}

/// Evidence for one step. `index` always equals the record's position in
/// [`Transcript::records`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub index: usize,
    /// Loop iteration that produced the record (parse failures consume
    /// iterations without producing records).
    pub step: usize,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub reasoning: Reasoning,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub latency_ms: u64,
}

impl ToolCallRecord {
    pub(crate) fn terminal(
        index: usize,
        step: usize,
        kind: RecordKind,
        reasoning: Reasoning,
        summary: Option<Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            index,
            step,
            kind,
            tool: None,
            parameters: Value::Null,
            response: None,
            error: None,
            reasoning,
            summary,
            started_at: now,
            finished_at: now,
            latency_ms: 0,
        }
    }

    pub fn is_tool_call(&self) -> bool {
        self.kind == RecordKind::ToolCall
    }

    pub fn succeeded(&self) -> bool {
        self.is_tool_call() && self.error.is_none()
    }
}

/// A decode failure kept on the transcript instead of a record.
#[derive(Debug, Clone, Serialize)]
pub struct ParseDiagnostic {
    pub step: usize,
    pub raw: String,
    pub failure: ParseFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Acting,
    ExecutingTool,
    Done,
    StepLimitReached,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Done | LoopState::StepLimitReached)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    StepLimitReached,
}

/// Everything one orchestration run produced.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub strategy: &'static str,
    pub outcome: RunOutcome,
    pub records: Vec<ToolCallRecord>,
    pub parse_failures: Vec<ParseDiagnostic>,
    pub steps_used: usize,
    pub max_steps: usize,
    pub usage: TokenUsage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Transcript {
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.records.iter().filter(|record| record.is_tool_call())
    }

    pub fn tool_error_count(&self) -> usize {
        self.tool_calls().filter(|record| record.error.is_some()).count()
    }

    /// Summary carried by the terminal `Complete` record, if any.
    pub fn summary(&self) -> Option<&Value> {
        self.records
            .iter()
            .rev()
            .find(|record| record.kind == RecordKind::Complete)
            .and_then(|record| record.summary.as_ref())
    }
}
