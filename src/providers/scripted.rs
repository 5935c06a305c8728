use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
    EvalError,
};

/// One canned gateway reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// When set, the call fails with this provider error instead of replying.
    #[serde(default)]
    pub error: Option<String>,
}

impl ScriptedTurn {
    pub fn reply(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            latency_ms: None,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            response: String::new(),
            latency_ms: None,
            error: Some(message.into()),
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Replays a fixed list of replies in order. Used for dry runs and tests.
pub struct ScriptedProvider {
    turns: Vec<ScriptedTurn>,
    cursor: Mutex<usize>,
    cycle: bool,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::from_scripted_turns(Vec::new())
    }

    pub fn from_scripted_turns(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns,
            cursor: Mutex::new(0),
            cycle: false,
        }
    }

    pub fn from_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_scripted_turns(replies.into_iter().map(ScriptedTurn::reply).collect())
    }

    /// Start over from the first reply once the script is exhausted.
    pub fn cycling(mut self) -> Self {
        self.cycle = true;
        self
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.turns.is_empty() {
            return None;
        }
        if *cursor >= self.turns.len() {
            if !self.cycle {
                return None;
            }
            *cursor = 0;
        }
        let turn = self.turns[*cursor].clone();
        *cursor += 1;
        Some(turn)
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, EvalError> {
        let turn = self
            .next_turn()
            .ok_or_else(|| EvalError::Provider("no more scripted responses".to_string()))?;

        if let Some(latency_ms) = turn.latency_ms {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }

        if let Some(message) = turn.error {
            return Err(EvalError::Provider(message));
        }

        let prompt_chars: usize = request
            .messages
            .iter()
            .map(|m| m.text().map(str::len).unwrap_or(0))
            .sum();
        // Rough 4-chars-per-token estimate keeps the accounting path exercised.
        let usage = TokenUsage::new((prompt_chars / 4) as u32, (turn.response.len() / 4) as u32);

        Ok(CompletionResponse {
            message: ChatMessage::assistant(turn.response),
            usage: Some(usage),
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hi() -> CompletionRequest {
        CompletionRequest::new("m", vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn replays_in_order_then_fails() {
        let provider = ScriptedProvider::from_replies(["one", "two"]);
        assert_eq!(provider.run(hi()).await.expect("first").text, "one");
        assert_eq!(provider.run(hi()).await.expect("second").text, "two");
        assert!(provider.run(hi()).await.is_err());
    }

    #[tokio::test]
    async fn cycling_provider_never_runs_dry() {
        let provider = ScriptedProvider::from_replies(["again"]).cycling();
        for _ in 0..3 {
            assert_eq!(provider.run(hi()).await.expect("reply").text, "again");
        }
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_provider_error() {
        let provider = ScriptedProvider::from_scripted_turns(vec![ScriptedTurn::failure("boom")]);
        match provider.run(hi()).await {
            Err(EvalError::Provider(message)) => assert_eq!(message, "boom"),
            other => panic!("expected provider error, got {other:?}"),
        }
    }
}
