use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("model gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tool host error: {0}")]
    Tool(#[from] ToolError),

    #[error("evaluation panicked: {0}")]
    Panicked(String),
}

/// Failure of a single capability invocation. Never aborts an evaluation;
/// the loop stores it on the step's record.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("capability '{0}' is not in the allow-list for this prompt")]
    NotAllowed(String),

    #[error("invalid arguments for {capability}: {message}")]
    InvalidArguments { capability: String, message: String },

    #[error("capability execution failed ({capability}): {message}")]
    Execution { capability: String, message: String },

    #[error("unresolved step reference(s): {0}")]
    UnresolvedReference(String),

    #[error("capability call timed out after {0:?}")]
    Timeout(Duration),
}
