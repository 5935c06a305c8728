pub mod config;
pub mod error;
pub mod judge;
pub mod normalizer;
pub mod orchestration;
pub mod parser;
pub mod prompt;
pub mod providers;
pub mod report;
pub mod resolver;
pub mod scheduler;
pub mod tools;
pub mod types;

pub use config::{HarnessConfig, JudgeConfig, ProviderKind, TargetConfig};
pub use error::{EvalError, ToolError};
pub use judge::{parse_verdict, Judge, JudgeOutcome, JudgeScores, Verdict};
pub use normalizer::{CapabilityRules, NormalizationRules, ParameterNormalizer};
pub use orchestration::{
    Action, AgentStrategy, ConversationStrategy, Decision, DecisionStrategy, Orchestrator, RecordKind,
    RunOutcome, ScriptedStrategy, ToolCallRecord, Transcript,
};
pub use parser::{parse_action, ParseFailure};
pub use prompt::{load_prompts, EvalPrompt, Rubric, ScriptedStep};
pub use providers::LLMProvider;
pub use report::{EvalMetrics, EvalResult, EvalSummary, ResultWriter, TargetSummary};
pub use resolver::{DefaultPolicy, HeuristicDefaults, StepResolver, StepResults};
pub use scheduler::{EvaluationScheduler, ModelTarget, SchedulerSettings, StrategyKind};
pub use tools::{Capability, FixtureToolHost, FunctionRegistry, FunctionToolHost, ToolHost};
pub use types::{ChatMessage, Completion, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use schemars::JsonSchema;
