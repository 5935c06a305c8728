use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::EvalError,
    providers::{
        openai::{OpenAI, OpenAIConfig},
        LLMProvider,
    },
    types::{CompletionRequest, CompletionResponse},
};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub referer: Option<String>,
    pub title: Option<String>,
}

impl OpenRouterConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(120),
            referer: None,
            title: Some("pruefwerk".to_string()),
        }
    }

    /// `OPENROUTER_API_KEY` plus the optional `OPENROUTER_REFERER`.
    pub fn from_env() -> Result<Self, EvalError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| EvalError::MissingApiKey("OPENROUTER_API_KEY"))?;
        let mut config = Self::new(api_key);
        if let Ok(referer) = std::env::var("OPENROUTER_REFERER") {
            config.referer = Some(referer);
        }
        Ok(config)
    }
}

/// OpenRouter speaks the OpenAI chat protocol plus attribution headers.
#[derive(Debug, Clone)]
pub struct OpenRouter {
    inner: OpenAI,
}

impl OpenRouter {
    pub fn from_config(config: OpenRouterConfig) -> Result<Self, EvalError> {
        let mut inner = OpenAIConfig::new(config.api_key)
            .with_base_url(config.base_url)
            .with_timeout(config.request_timeout);
        if let Some(referer) = config.referer {
            inner = inner.with_header("HTTP-Referer", referer);
        }
        if let Some(title) = config.title {
            inner = inner.with_header("X-Title", title);
        }
        Ok(Self {
            inner: OpenAI::from_config(inner)?,
        })
    }
}

#[async_trait]
impl LLMProvider for OpenRouter {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, EvalError> {
        self.inner.chat_completion(request).await
    }

    fn name(&self) -> &'static str {
        "openrouter"
    }
}
