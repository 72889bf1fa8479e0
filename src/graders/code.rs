use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::case::EvalCase;
use crate::graders::{to_value, Grader};
use crate::results::GradeResult;
use crate::trace::{Trace, TraceStatus};
use crate::EvalError;

/// Check that the output contains every expected value.
pub struct ContainsGrader {
    values: Option<Vec<String>>,
    case_sensitive: bool,
}

impl ContainsGrader {
    pub fn new() -> Self {
        Self {
            values: None,
            case_sensitive: false,
        }
    }

    /// Explicit values take precedence over the test case expectation.
    pub fn with_values(mut self, values: Vec<String>) -> Self {
        self.values = Some(values);
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }
}

impl Default for ContainsGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for ContainsGrader {
    fn name(&self) -> &str {
        "contains"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let fallback;
        let values: &[String] = match &self.values {
            Some(values) => values,
            None => {
                fallback = case
                    .expected()
                    .and_then(|expected| expected.output_contains.clone())
                    .unwrap_or_default();
                &fallback
            }
        };

        if values.is_empty() {
            return Ok(GradeResult::pass(self.name(), "No values to check"));
        }

        let output = trace.output.as_deref().unwrap_or("");
        let content = if self.case_sensitive {
            output.to_string()
        } else {
            output.to_lowercase()
        };

        let missing: Vec<&String> = values
            .iter()
            .filter(|value| {
                let needle = if self.case_sensitive {
                    (*value).clone()
                } else {
                    value.to_lowercase()
                };
                !content.contains(&needle)
            })
            .collect();

        if !missing.is_empty() {
            return Ok(GradeResult::fail(
                self.name(),
                format!("Missing values in output: {missing:?}"),
            )
            .with_expected(to_value(&values))
            .with_actual(to_value(&trace.output)));
        }

        Ok(GradeResult::pass(
            self.name(),
            format!("All {} values found in output", values.len()),
        ))
    }
}

/// Check that the output does NOT contain any forbidden value.
pub struct NotContainsGrader {
    values: Option<Vec<String>>,
    case_sensitive: bool,
}

impl NotContainsGrader {
    pub fn new() -> Self {
        Self {
            values: None,
            case_sensitive: false,
        }
    }

    pub fn with_values(mut self, values: Vec<String>) -> Self {
        self.values = Some(values);
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }
}

impl Default for NotContainsGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for NotContainsGrader {
    fn name(&self) -> &str {
        "not_contains"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let fallback;
        let values: &[String] = match &self.values {
            Some(values) => values,
            None => {
                fallback = case
                    .expected()
                    .and_then(|expected| expected.output_not_contains.clone())
                    .unwrap_or_default();
                &fallback
            }
        };

        if values.is_empty() {
            return Ok(GradeResult::pass(self.name(), "No values to check"));
        }

        let output = trace.output.as_deref().unwrap_or("");
        let content = if self.case_sensitive {
            output.to_string()
        } else {
            output.to_lowercase()
        };

        let found: Vec<&String> = values
            .iter()
            .filter(|value| {
                let needle = if self.case_sensitive {
                    (*value).clone()
                } else {
                    value.to_lowercase()
                };
                content.contains(&needle)
            })
            .collect();

        if !found.is_empty() {
            return Ok(GradeResult::fail(
                self.name(),
                format!("Forbidden values found in output: {found:?}"),
            )
            .with_expected(json!(format!("None of: {values:?}")))
            .with_actual(to_value(&trace.output)));
        }

        Ok(GradeResult::pass(self.name(), "No forbidden values found"))
    }
}

/// Check exact string equality against the expected output.
pub struct EqualsGrader {
    expected: Option<String>,
    normalize_whitespace: bool,
}

impl EqualsGrader {
    pub fn new() -> Self {
        Self {
            expected: None,
            normalize_whitespace: true,
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn normalize_whitespace(mut self, normalize: bool) -> Self {
        self.normalize_whitespace = normalize;
        self
    }
}

impl Default for EqualsGrader {
    fn default() -> Self {
        Self::new()
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Grader for EqualsGrader {
    fn name(&self) -> &str {
        "equals"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let expected = self.expected.clone().or_else(|| {
            case.expected()
                .and_then(|expected| expected.output_equals.clone())
        });

        let Some(expected) = expected else {
            return Ok(GradeResult::pass(self.name(), "No expected value to check"));
        };

        let actual = trace.output.clone().unwrap_or_default();

        let (expected, actual) = if self.normalize_whitespace {
            (collapse_whitespace(&expected), collapse_whitespace(&actual))
        } else {
            (expected, actual)
        };

        if actual == expected {
            return Ok(GradeResult::pass(self.name(), "Output matches expected"));
        }

        Ok(GradeResult::fail(self.name(), "Output does not match expected")
            .with_expected(json!(expected))
            .with_actual(json!(actual)))
    }
}

/// Check that the output matches a regex pattern.
pub struct RegexGrader {
    pattern: Option<String>,
}

impl RegexGrader {
    pub fn new() -> Self {
        Self { pattern: None }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

impl Default for RegexGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for RegexGrader {
    fn name(&self) -> &str {
        "regex"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let pattern = self.pattern.clone().or_else(|| {
            case.expected()
                .and_then(|expected| expected.output_matches.clone())
        });

        let Some(pattern) = pattern else {
            return Ok(GradeResult::pass(self.name(), "No pattern to check"));
        };

        let content = trace.output.as_deref().unwrap_or("");

        // An invalid pattern is broken tooling, not agent misbehavior.
        let regex = match Regex::new(&pattern) {
            Ok(regex) => regex,
            Err(err) => {
                return Ok(GradeResult::error(
                    self.name(),
                    format!("Invalid regex: {err}"),
                ))
            }
        };

        if regex.is_match(content) {
            return Ok(GradeResult::pass(
                self.name(),
                format!("Output matches pattern: {pattern}"),
            ));
        }

        Ok(GradeResult::fail(
            self.name(),
            format!("Output does not match pattern: {pattern}"),
        )
        .with_expected(json!(pattern))
        .with_actual(json!(content)))
    }
}

/// Check that every required tool was called. Order is irrelevant.
pub struct ToolCalledGrader {
    required: Option<Vec<String>>,
}

impl ToolCalledGrader {
    pub fn new() -> Self {
        Self { required: None }
    }

    pub fn with_required(mut self, required: Vec<String>) -> Self {
        self.required = Some(required);
        self
    }
}

impl Default for ToolCalledGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for ToolCalledGrader {
    fn name(&self) -> &str {
        "tool_called"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let fallback;
        let required: &[String] = match &self.required {
            Some(required) => required,
            None => {
                fallback = case
                    .expected()
                    .and_then(|expected| expected.tools_called.clone())
                    .unwrap_or_default();
                &fallback
            }
        };

        if required.is_empty() {
            return Ok(GradeResult::pass(self.name(), "No required tools to check"));
        }

        let called: HashSet<&str> = trace.tools_called().into_iter().collect();
        let mut missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|tool| !called.contains(tool))
            .collect();
        missing.sort_unstable();

        if !missing.is_empty() {
            let mut actual: Vec<&str> = called.into_iter().collect();
            actual.sort_unstable();
            return Ok(GradeResult::fail(
                self.name(),
                format!("Required tools not called: {missing:?}"),
            )
            .with_expected(to_value(&required))
            .with_actual(to_value(&actual)));
        }

        Ok(GradeResult::pass(
            self.name(),
            format!("All {} required tools were called", required.len()),
        ))
    }
}

/// Check that no forbidden tool was called.
pub struct ToolNotCalledGrader {
    forbidden: Option<Vec<String>>,
}

impl ToolNotCalledGrader {
    pub fn new() -> Self {
        Self { forbidden: None }
    }

    pub fn with_forbidden(mut self, forbidden: Vec<String>) -> Self {
        self.forbidden = Some(forbidden);
        self
    }
}

impl Default for ToolNotCalledGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for ToolNotCalledGrader {
    fn name(&self) -> &str {
        "tool_not_called"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let fallback;
        let forbidden: &[String] = match &self.forbidden {
            Some(forbidden) => forbidden,
            None => {
                fallback = case
                    .expected()
                    .and_then(|expected| expected.tools_not_called.clone())
                    .unwrap_or_default();
                &fallback
            }
        };

        if forbidden.is_empty() {
            return Ok(GradeResult::pass(self.name(), "No forbidden tools to check"));
        }

        let called: HashSet<&str> = trace.tools_called().into_iter().collect();
        let mut violated: Vec<&str> = forbidden
            .iter()
            .map(String::as_str)
            .filter(|tool| called.contains(tool))
            .collect();
        violated.sort_unstable();

        if !violated.is_empty() {
            let mut actual: Vec<&str> = called.into_iter().collect();
            actual.sort_unstable();
            return Ok(GradeResult::fail(
                self.name(),
                format!("Forbidden tools were called: {violated:?}"),
            )
            .with_expected(json!(format!("None of: {forbidden:?}")))
            .with_actual(to_value(&actual)));
        }

        Ok(GradeResult::pass(self.name(), "No forbidden tools were called"))
    }
}

/// Check that the expected tool sequence is a subsequence of the actual
/// call sequence. Extra intervening calls are tolerated.
pub struct ToolOrderGrader {
    expected_order: Option<Vec<String>>,
}

impl ToolOrderGrader {
    pub fn new() -> Self {
        Self {
            expected_order: None,
        }
    }

    pub fn with_expected_order(mut self, expected_order: Vec<String>) -> Self {
        self.expected_order = Some(expected_order);
        self
    }
}

impl Default for ToolOrderGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for ToolOrderGrader {
    fn name(&self) -> &str {
        "tool_order"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let fallback;
        let expected: &[String] = match &self.expected_order {
            Some(expected) => expected,
            None => {
                fallback = case
                    .expected()
                    .and_then(|expected| expected.tool_call_order.clone())
                    .unwrap_or_default();
                &fallback
            }
        };

        if expected.is_empty() {
            return Ok(GradeResult::pass(self.name(), "No expected order to check"));
        }

        let actual = trace.tools_called();

        // Single forward pointer: advance only on an exact match.
        let mut next = 0;
        for tool in &actual {
            if next < expected.len() && *tool == expected[next] {
                next += 1;
            }
        }

        if next == expected.len() {
            return Ok(GradeResult::pass(self.name(), "Tools called in correct order"));
        }

        Ok(GradeResult::fail(self.name(), "Tools not called in expected order")
            .with_expected(to_value(&expected))
            .with_actual(to_value(&actual)))
    }
}

/// Check that the trace completed within a step budget.
pub struct MaxStepsGrader {
    max_steps: Option<usize>,
}

impl MaxStepsGrader {
    pub fn new() -> Self {
        Self { max_steps: None }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

impl Default for MaxStepsGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for MaxStepsGrader {
    fn name(&self) -> &str {
        "max_steps"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let max_steps = self
            .max_steps
            .or_else(|| case.expected().and_then(|expected| expected.max_steps));

        let Some(max_steps) = max_steps else {
            return Ok(GradeResult::pass(self.name(), "No max steps defined"));
        };

        let actual = trace.step_count();

        if actual <= max_steps {
            return Ok(GradeResult::pass(
                self.name(),
                format!("Completed in {actual} steps (max: {max_steps})"),
            ));
        }

        Ok(GradeResult::fail(
            self.name(),
            format!("Too many steps: {actual} > {max_steps}"),
        )
        .with_expected(json!(max_steps))
        .with_actual(json!(actual)))
    }
}

/// Like `max_steps`, but counting only tool-call steps.
pub struct MaxToolCallsGrader {
    max_tool_calls: Option<usize>,
}

impl MaxToolCallsGrader {
    pub fn new() -> Self {
        Self {
            max_tool_calls: None,
        }
    }

    pub fn with_max_tool_calls(mut self, max_tool_calls: usize) -> Self {
        self.max_tool_calls = Some(max_tool_calls);
        self
    }
}

impl Default for MaxToolCallsGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for MaxToolCallsGrader {
    fn name(&self) -> &str {
        "max_tool_calls"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let max_tool_calls = self
            .max_tool_calls
            .or_else(|| case.expected().and_then(|expected| expected.max_tool_calls));

        let Some(max_tool_calls) = max_tool_calls else {
            return Ok(GradeResult::pass(self.name(), "No max tool calls defined"));
        };

        let actual = trace.tool_calls().len();

        if actual <= max_tool_calls {
            return Ok(GradeResult::pass(
                self.name(),
                format!("Made {actual} tool calls (max: {max_tool_calls})"),
            ));
        }

        Ok(GradeResult::fail(
            self.name(),
            format!("Too many tool calls: {actual} > {max_tool_calls}"),
        )
        .with_expected(json!(max_tool_calls))
        .with_actual(json!(actual)))
    }
}

/// Like `max_steps`, but counting only model-call steps.
pub struct MaxLlmCallsGrader {
    max_llm_calls: Option<usize>,
}

impl MaxLlmCallsGrader {
    pub fn new() -> Self {
        Self { max_llm_calls: None }
    }

    pub fn with_max_llm_calls(mut self, max_llm_calls: usize) -> Self {
        self.max_llm_calls = Some(max_llm_calls);
        self
    }
}

impl Default for MaxLlmCallsGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for MaxLlmCallsGrader {
    fn name(&self) -> &str {
        "max_llm_calls"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let max_llm_calls = self
            .max_llm_calls
            .or_else(|| case.expected().and_then(|expected| expected.max_llm_calls));

        let Some(max_llm_calls) = max_llm_calls else {
            return Ok(GradeResult::pass(self.name(), "No max LLM calls defined"));
        };

        let actual = trace.llm_calls().len();

        if actual <= max_llm_calls {
            return Ok(GradeResult::pass(
                self.name(),
                format!("Made {actual} LLM calls (max: {max_llm_calls})"),
            ));
        }

        Ok(GradeResult::fail(
            self.name(),
            format!("Too many LLM calls: {actual} > {max_llm_calls}"),
        )
        .with_expected(json!(max_llm_calls))
        .with_actual(json!(actual)))
    }
}

/// Check whether the task completed: successful status AND non-empty
/// output. A `false` expectation passes when the conjunction is false.
pub struct TaskCompletedGrader {
    require_success: bool,
}

impl TaskCompletedGrader {
    pub fn new() -> Self {
        Self {
            require_success: true,
        }
    }

    pub fn require_success(mut self, require_success: bool) -> Self {
        self.require_success = require_success;
        self
    }
}

impl Default for TaskCompletedGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grader for TaskCompletedGrader {
    fn name(&self) -> &str {
        "task_completed"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let expected = case
            .expected()
            .and_then(|expected| expected.task_completed)
            .unwrap_or(self.require_success);

        let is_success = trace.status == TraceStatus::Success;
        let has_output = trace.output.as_deref().map_or(false, |out| !out.is_empty());
        let completed = is_success && has_output;

        let result = match (expected, completed) {
            (true, true) => GradeResult::pass(self.name(), "Task completed successfully"),
            (true, false) => GradeResult::fail(
                self.name(),
                format!(
                    "Task not completed. Status: {:?}, Output: {}",
                    trace.status, has_output
                ),
            )
            .with_expected(json!("completed"))
            .with_actual(json!(format!("status={:?}", trace.status))),
            (false, false) => {
                GradeResult::pass(self.name(), "Task correctly did not complete (as expected)")
            }
            (false, true) => GradeResult::fail(
                self.name(),
                "Task completed but was expected to fail",
            )
            .with_expected(json!("not completed"))
            .with_actual(json!("completed")),
        };

        Ok(result)
    }
}
