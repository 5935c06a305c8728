use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::EvalError,
    judge::Judge,
    normalizer::ParameterNormalizer,
    orchestration::DEFAULT_MAX_STEPS,
    providers::{
        openai::{OpenAI, OpenAIConfig},
        openrouter::{OpenRouter, OpenRouterConfig},
        scripted::{ScriptedProvider, ScriptedTurn},
        LLMProvider,
    },
    scheduler::{ModelTarget, SchedulerSettings, StrategyKind, DEFAULT_CONCURRENCY},
};

pub const ENV_CONCURRENCY: &str = "PRUEFWERK_CONCURRENCY";
pub const ENV_OUTPUT_DIR: &str = "PRUEFWERK_OUTPUT_DIR";
pub const ENV_MODE: &str = "PRUEFWERK_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Openrouter,
    Scripted,
}

/// A provider/model pair. Credentials always come from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Provider name shown in results; defaults to the provider's own name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Canned replies for `scripted`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<ScriptedTurn>,
    #[serde(default)]
    pub cycle: bool,
}

impl TargetConfig {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
            label: None,
            request_timeout_ms: None,
            replies: Vec::new(),
            cycle: false,
        }
    }

    /// Credentials and defaults come from the environment; the target's
    /// own `base_url` and `request_timeout_ms` win over them.
    pub fn build_provider(&self) -> Result<Arc<dyn LLMProvider>, EvalError> {
        Ok(match self.provider {
            ProviderKind::Openai => Arc::new(OpenAI::from_config(self.openai_config(OpenAIConfig::from_env()?))?),
            ProviderKind::Openrouter => {
                Arc::new(OpenRouter::from_config(self.openrouter_config(OpenRouterConfig::from_env()?))?)
            }
            ProviderKind::Scripted => {
                let provider = ScriptedProvider::from_scripted_turns(self.replies.clone());
                Arc::new(if self.cycle { provider.cycling() } else { provider })
            }
        })
    }

    fn openai_config(&self, mut config: OpenAIConfig) -> OpenAIConfig {
        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url.clone());
        }
        if let Some(ms) = self.request_timeout_ms {
            config = config.with_timeout(Duration::from_millis(ms));
        }
        config
    }

    fn openrouter_config(&self, mut config: OpenRouterConfig) -> OpenRouterConfig {
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        config
    }

    pub fn build_target(&self) -> Result<ModelTarget, EvalError> {
        let target = ModelTarget::new(self.build_provider()?, self.model.clone());
        Ok(match &self.label {
            Some(label) => target.with_label(label.clone()),
            None => target,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(flatten)]
    pub target: TargetConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_preview_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Harness settings loaded from YAML or JSON, then overridden from the
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub concurrency: usize,
    pub mode: StrategyKind,
    pub max_steps: usize,
    pub strict_references: bool,
    pub gateway_timeout_ms: Option<u64>,
    pub tool_timeout_ms: Option<u64>,
    pub output_dir: PathBuf,
    /// Normalization rules file; the built-in analytics rules otherwise.
    pub normalization: Option<PathBuf>,
    pub targets: Vec<TargetConfig>,
    /// Defaults to the first target.
    pub judge: Option<JudgeConfig>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            mode: StrategyKind::default(),
            max_steps: DEFAULT_MAX_STEPS,
            strict_references: false,
            gateway_timeout_ms: None,
            tool_timeout_ms: None,
            output_dir: PathBuf::from("results"),
            normalization: None,
            targets: Vec::new(),
            judge: None,
        }
    }
}

impl HarnessConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let config = if ext == "json" {
            serde_json::from_slice(&bytes)?
        } else {
            serde_yaml::from_slice(&bytes)?
        };
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), EvalError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), EvalError> {
        if let Some(value) = lookup(ENV_CONCURRENCY) {
            self.concurrency = value
                .trim()
                .parse()
                .map_err(|_| EvalError::Config(format!("{ENV_CONCURRENCY} must be a number, got '{value}'")))?;
        }
        if let Some(value) = lookup(ENV_OUTPUT_DIR) {
            self.output_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_MODE) {
            self.mode = value.parse().map_err(EvalError::Config)?;
        }
        Ok(())
    }

    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            concurrency: self.concurrency,
            mode: self.mode,
            default_max_steps: self.max_steps,
            strict_references: self.strict_references,
            gateway_timeout: self.gateway_timeout_ms.map(Duration::from_millis),
            tool_timeout: self.tool_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn build_targets(&self) -> Result<Vec<ModelTarget>, EvalError> {
        self.targets.iter().map(TargetConfig::build_target).collect()
    }

    pub fn build_judge(&self, targets: &[ModelTarget]) -> Result<Judge, EvalError> {
        let judge = match &self.judge {
            Some(config) => {
                let judge = Judge::new(config.target.build_provider()?, config.target.model.clone())
                    .with_temperature(config.temperature)
                    .with_max_tokens(config.max_tokens);
                match config.response_preview_chars {
                    Some(chars) => judge.with_response_preview(chars),
                    None => judge,
                }
            }
            None => {
                let first = targets
                    .first()
                    .ok_or_else(|| EvalError::Config("no judge configured and no targets to borrow one from".to_string()))?;
                Judge::new(Arc::clone(&first.provider), first.model.clone())
            }
        };
        Ok(judge.with_timeout(self.gateway_timeout_ms.map(Duration::from_millis)))
    }

    pub fn normalizer(&self) -> Result<ParameterNormalizer, EvalError> {
        match &self.normalization {
            Some(path) => ParameterNormalizer::from_path(path),
            None => Ok(ParameterNormalizer::analytics()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn loads_yaml_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("harness.yaml");
        fs::write(
            &path,
            r#"
concurrency: 2
mode: conversation
targets:
  - provider: scripted
    model: dry-run
    cycle: true
    replies:
      - response: '{"done": true, "summary": "nothing to do"}'
"#,
        )
        .expect("write");

        let config = HarnessConfig::load(&path).expect("config");
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.mode, StrategyKind::Conversation);
        assert_eq!(config.max_steps, DEFAULT_MAX_STEPS);
        assert_eq!(config.output_dir, PathBuf::from("results"));

        let targets = config.build_targets().expect("targets");
        assert_eq!(targets[0].provider_name(), "scripted");
        let judge = config.build_judge(&targets).expect("judge");
        assert_eq!(judge.model(), "dry-run");
    }

    #[test]
    fn overrides_replace_file_values() {
        let vars: HashMap<&str, &str> =
            HashMap::from([(ENV_CONCURRENCY, "8"), (ENV_OUTPUT_DIR, "out/run-1"), (ENV_MODE, "Agent")]);
        let mut config = HarnessConfig {
            mode: StrategyKind::Conversation,
            ..HarnessConfig::default()
        };
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.output_dir, PathBuf::from("out/run-1"));
        assert_eq!(config.mode, StrategyKind::Agent);
    }

    #[test]
    fn bad_override_is_a_config_error() {
        let mut config = HarnessConfig::default();
        let error = config
            .apply_overrides(|key| (key == ENV_CONCURRENCY).then(|| "many".to_string()))
            .expect_err("invalid");
        assert!(matches!(error, EvalError::Config(_)));
    }

    #[test]
    fn judge_needs_a_source() {
        let error = HarnessConfig::default().build_judge(&[]).expect_err("no judge");
        assert!(matches!(error, EvalError::Config(_)));
    }

    #[test]
    fn target_settings_override_the_environment() {
        let mut target = TargetConfig::new(ProviderKind::Openai, "gpt-4o-mini");
        target.base_url = Some("http://localhost:8080/v1".to_string());
        target.request_timeout_ms = Some(5_000);

        let from_env = OpenAIConfig::new("key")
            .with_base_url("https://gateway.internal/v1")
            .with_organization("org-1");
        let config = target.openai_config(from_env);
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.request_timeout, Duration::from_millis(5_000));
        assert_eq!(config.organization.as_deref(), Some("org-1"));

        let untouched = TargetConfig::new(ProviderKind::Openrouter, "mistral").openrouter_config(
            OpenRouterConfig {
                referer: Some("https://example.org".to_string()),
                ..OpenRouterConfig::new("key")
            },
        );
        assert_eq!(untouched.base_url, OpenRouterConfig::new("key").base_url);
        assert_eq!(untouched.referer.as_deref(), Some("https://example.org"));
    }

    #[test]
    fn judge_sampling_settings_load_from_yaml() {
        let config: HarnessConfig = serde_yaml::from_str(
            r#"
judge:
  provider: scripted
  model: grader
  temperature: 0.0
  max_tokens: 512
"#,
        )
        .expect("config");
        let judge = config.judge.expect("judge");
        assert_eq!(judge.target.model, "grader");
        assert_eq!(judge.temperature, Some(0.0));
        assert_eq!(judge.max_tokens, Some(512));
    }
}
