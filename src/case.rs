use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EvalError;

/// Declarative expectations attached to one conversation turn.
///
/// Every field is optional; graders treat an unset field as "nothing to
/// check" and pass vacuously.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedBehavior {
    // Tool expectations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_called: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_not_called: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_order: Option<Vec<String>>,

    // Output expectations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_contains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_not_contains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_equals: Option<String>,
    /// Regex pattern searched against the output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_matches: Option<String>,

    // Execution expectations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_llm_calls: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_completed: Option<bool>,
}

/// Configuration for a registry-resolved grader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, Value>,

    // Model-as-judge options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl GraderConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// One exchange in a conversation: a user message plus what the agent's
/// response to it must look like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<ExpectedBehavior>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub graders: Vec<GraderConfig>,
}

impl Turn {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            expected: None,
            graders: Vec::new(),
        }
    }

    pub fn with_expected(mut self, expected: ExpectedBehavior) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn with_grader(mut self, grader: GraderConfig) -> Self {
        self.graders.push(grader);
        self
    }
}

// Raw YAML document shape. Accepts the legacy single-turn layout
// (`input`/`expected`/`graders` at the top level) and converts it to turns
// here, at the parsing boundary, so the rest of the crate only ever sees
// turns.
#[derive(Debug, Deserialize)]
struct RawCase {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    turns: Vec<Turn>,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    expected: Option<ExpectedBehavior>,
    #[serde(default)]
    graders: Vec<GraderConfig>,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

/// A test case: an ordered sequence of turns to send to the agent, with
/// the expected behavior to validate per turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub turns: Vec<Turn>,

    /// Per-test timeout in seconds; overrides the execution config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Surfaced for the configuration layer; the engine does not retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl EvalCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            turns: Vec::new(),
            timeout: None,
            retries: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Conversion point for legacy single-turn input: one user message and
    /// an optional expectation become a one-turn case.
    pub fn single_turn(
        name: impl Into<String>,
        input: impl Into<String>,
        expected: Option<ExpectedBehavior>,
    ) -> Self {
        let mut turn = Turn::new(input);
        turn.expected = expected;
        Self::new(name).with_turn(turn)
    }

    /// Grading view of one turn: graders see a single-turn case whose
    /// first turn carries the expectation under evaluation.
    pub fn for_turn(name: impl Into<String>, turn: Turn) -> Self {
        Self::new(name).with_turn(turn)
    }

    pub fn with_turn(mut self, turn: Turn) -> Self {
        self.turns.push(turn);
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn is_multi_turn(&self) -> bool {
        self.turns.len() > 1
    }

    /// The expectation graders resolve against: the first turn's.
    pub fn expected(&self) -> Option<&ExpectedBehavior> {
        self.turns.first().and_then(|turn| turn.expected.as_ref())
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, EvalError> {
        let raw: RawCase = serde_yaml::from_str(content)?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content).map_err(|err| EvalError::SuiteLoad {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn to_yaml(&self) -> Result<String, EvalError> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn from_raw(raw: RawCase) -> Self {
        let mut turns = raw.turns;
        if turns.is_empty() {
            if let Some(input) = raw.input {
                turns.push(Turn {
                    user: input,
                    expected: raw.expected,
                    graders: raw.graders,
                });
            }
        }

        Self {
            name: raw.name,
            description: raw.description,
            turns,
            timeout: raw.timeout,
            retries: raw.retries,
            tags: raw.tags,
            metadata: raw.metadata,
        }
    }
}

/// An ordered collection of test cases evaluated together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalSuite {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub test_cases: Vec<EvalCase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl EvalSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_case(mut self, case: EvalCase) -> Self {
        self.test_cases.push(case);
        self
    }

    /// Load all test cases from a directory. Files are read in sorted
    /// order; underscore-prefixed files are skipped.
    pub fn from_directory(path: impl AsRef<Path>, name: Option<&str>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(EvalError::NotADirectory(path.to_path_buf()));
        }

        let mut files: Vec<_> = fs::read_dir(path)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|file| {
                matches!(
                    file.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .filter(|file| {
                file.file_name()
                    .and_then(|name| name.to_str())
                    .map_or(false, |name| !name.starts_with('_'))
            })
            .collect();
        files.sort();

        let mut test_cases = Vec::new();
        for file in files {
            test_cases.push(EvalCase::from_yaml_file(&file)?);
        }

        let suite_name = name
            .map(str::to_string)
            .or_else(|| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            name: suite_name,
            description: None,
            test_cases,
            tags: Vec::new(),
        })
    }

    /// A new suite keeping only test cases matching any of the tags.
    pub fn filter_by_tags(&self, tags: &[String]) -> Self {
        let test_cases = self
            .test_cases
            .iter()
            .filter(|case| tags.iter().any(|tag| case.tags.contains(tag)))
            .cloned()
            .collect();

        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            test_cases,
            tags: self.tags.clone(),
        }
    }
}
