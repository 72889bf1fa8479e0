use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::EvalError;

const CONFIG_FILE_NAMES: &[&str] = &["pruefwerk.yaml", "pruefwerk.yml"];

/// Configuration for a named test suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Execution knobs for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum concurrent test cases. 0 = unbounded.
    #[serde(default)]
    pub workers: usize,
    /// Default per-test timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Surfaced but unconsumed: retry semantics are unspecified upstream
    /// and the engine does not invent them.
    #[serde(default)]
    pub retries: u32,
}

fn default_timeout_secs() -> f64 {
    30.0
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            timeout_secs: default_timeout_secs(),
            retries: 0,
        }
    }
}

/// Defaults applied to registry-built graders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraderDefaults {
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for GraderDefaults {
    fn default() -> Self {
        Self {
            llm_model: default_llm_model(),
            llm_provider: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Pass/fail thresholds for the run as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default)]
    pub min_pass_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<usize>,
}

/// Top-level run configuration, loaded from `pruefwerk.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruefwerkConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_test_dir")]
    pub test_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suites: Vec<SuiteConfig>,

    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub graders: GraderDefaults,
    #[serde(default)]
    pub thresholds: ThresholdConfig,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_version() -> u32 {
    1
}

fn default_test_dir() -> String {
    "tests/evals".to_string()
}

fn default_output_dir() -> String {
    ".pruefwerk".to_string()
}

impl Default for PruefwerkConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            test_dir: default_test_dir(),
            suites: Vec::new(),
            execution: ExecutionConfig::default(),
            graders: GraderDefaults::default(),
            thresholds: ThresholdConfig::default(),
            output_dir: default_output_dir(),
        }
    }
}

impl PruefwerkConfig {
    /// Load configuration: an explicit path must exist; otherwise the
    /// well-known file names are searched and defaults are used when none
    /// is found.
    pub fn load(path: Option<&Path>) -> Result<Self, EvalError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(EvalError::ConfigNotFound(path.to_path_buf()));
            }
            return Self::from_file(path);
        }

        for name in CONFIG_FILE_NAMES {
            let candidate = PathBuf::from(name);
            if candidate.exists() {
                return Self::from_file(&candidate);
            }
        }

        Ok(Self::default())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let content = fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EvalError> {
        fs::write(path.as_ref(), serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// Default configuration written by `pruefwerk init`.
pub fn default_config_yaml() -> &'static str {
    r#"# pruefwerk configuration
version: 1

# Test directory (suites are discovered from subdirectories)
test_dir: tests/evals

# Or name suites explicitly:
# suites:
#   - name: core
#     path: tests/evals/core
#   - name: safety
#     path: tests/evals/safety

execution:
  workers: 0        # 0 = unbounded concurrent test cases
  timeout_secs: 30
  retries: 0

graders:
  llm_model: gpt-4o-mini
  # API key from OPENAI_API_KEY / ANTHROPIC_API_KEY environment variables

thresholds:
  min_pass_rate: 0.0
  # max_failures: 5

# Output directory for traces and reports
output_dir: .pruefwerk
"#
}

/// Example test case written by `pruefwerk init`.
pub fn example_case_yaml() -> &'static str {
    r#"# Example test case
name: example_test
description: An example test case to get you started

turns:
  - user: "Hello, can you help me with a simple task?"
    expected:
      # Tools that must be called:
      # tools_called:
      #   - search
      #   - calculate

      output_contains:
        - "help"

      max_steps: 10
      task_completed: true

# Custom graders:
# turns:
#   - user: "..."
#     graders:
#       - type: llm
#         prompt: "Did the agent respond helpfully? Answer PASS or FAIL."
#         model: gpt-4o-mini
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_config_parses_back() {
        let config: PruefwerkConfig = serde_yaml::from_str(default_config_yaml()).expect("parse");
        assert_eq!(config.version, 1);
        assert_eq!(config.test_dir, "tests/evals");
        assert_eq!(config.execution.workers, 0);
        assert_eq!(config.graders.llm_model, "gpt-4o-mini");
        assert_eq!(config.thresholds.min_pass_rate, 0.0);
    }

    #[test]
    fn generated_example_case_parses_back() {
        let case = crate::EvalCase::from_yaml_str(example_case_yaml()).expect("parse");
        assert_eq!(case.name, "example_test");
        let expected = case.expected().expect("expected");
        assert_eq!(expected.max_steps, Some(10));
        assert_eq!(expected.task_completed, Some(true));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let error = PruefwerkConfig::load(Some(Path::new("/does/not/exist.yaml"))).unwrap_err();
        assert!(matches!(error, EvalError::ConfigNotFound(_)));
    }
}
