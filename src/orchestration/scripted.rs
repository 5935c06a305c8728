use std::collections::VecDeque;

use async_trait::async_trait;

use crate::{
    error::EvalError,
    orchestration::{Action, Decision, DecisionStrategy, Reasoning},
    prompt::{EvalPrompt, ScriptedStep},
    tools::Capability,
};

/// Replays a fixed list of steps. No model, no parsing, no guidance: every
/// step runs regardless of how the previous one went, and an exhausted
/// script completes the run.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStrategy {
    pending: VecDeque<ScriptedStep>,
}

impl ScriptedStrategy {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            pending: steps.into(),
        }
    }

    pub fn from_prompt(prompt: &EvalPrompt) -> Self {
        Self::new(prompt.steps.clone().unwrap_or_default())
    }
}

#[async_trait]
impl DecisionStrategy for ScriptedStrategy {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn begin(&mut self, prompt: &EvalPrompt, _capabilities: &[Capability]) -> Result<(), EvalError> {
        if self.pending.is_empty() {
            if let Some(steps) = &prompt.steps {
                self.pending = steps.iter().cloned().collect();
            }
        }
        Ok(())
    }

    async fn decide(&mut self, _step: usize) -> Result<Decision, EvalError> {
        Ok(match self.pending.pop_front() {
            Some(step) => Decision::Invoke(Action {
                tool: step.tool,
                parameters: step.parameters,
                reasoning: step.reasoning.map(Reasoning::justified).unwrap_or_default(),
            }),
            None => Decision::Complete {
                summary: None,
                reasoning: Reasoning::default(),
            },
        })
    }
}
