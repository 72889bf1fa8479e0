use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("template render error: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("agent invocation timed out after {0:.1}s")]
    AgentTimeout(f64),

    #[error("grader error: {0}")]
    Grader(String),

    #[error("metric error: {0}")]
    Metric(String),

    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("suite path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("failed to load {path}: {message}")]
    SuiteLoad { path: PathBuf, message: String },

    #[error("no test suites found under {0}")]
    NoSuites(PathBuf),
}
