use async_trait::async_trait;

use crate::types::{Completion, CompletionRequest, CompletionResponse};
use crate::EvalError;

pub mod openai;
pub mod openrouter;
pub mod scripted;

/// The model gateway: turns a conversation into one full completion.
///
/// Implementations report token usage on every response instead of keeping
/// counters, so a single instance can be shared by concurrent evaluations.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, EvalError>;

    /// Text-only view of [`LLMProvider::complete`].
    async fn run(&self, request: CompletionRequest) -> Result<Completion, EvalError> {
        let response = self.complete(request).await?;
        Ok(Completion {
            text: response.message.text().unwrap_or_default().to_string(),
            usage: response.usage.unwrap_or_default(),
        })
    }

    fn name(&self) -> &'static str;
}
