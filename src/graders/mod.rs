use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::case::{EvalCase, ExpectedBehavior, GraderConfig};
use crate::config::GraderDefaults;
use crate::results::{GradeResult, GradeStatus};
use crate::trace::Trace;
use crate::EvalError;

pub mod code;
pub mod llm;

pub use code::{
    ContainsGrader, EqualsGrader, MaxLlmCallsGrader, MaxStepsGrader, MaxToolCallsGrader,
    NotContainsGrader, RegexGrader, TaskCompletedGrader, ToolCalledGrader, ToolNotCalledGrader,
    ToolOrderGrader,
};
pub use llm::{LlmGrader, LlmRubricGrader};

/// A pluggable check against an execution trace.
///
/// `grade` is the synchronous core; the default `grade_async` hands it off
/// the cooperative scheduler so CPU-bound graders cannot stall a
/// concurrent grading pass. Graders that do network I/O override
/// `grade_async` with a non-blocking implementation instead.
///
/// Failures must not escape this boundary: the orchestrator converts an
/// `Err` into an error-status grade, so returning `Err` is equivalent to
/// reporting broken tooling, never a failed check.
#[async_trait]
pub trait Grader: Send + Sync {
    fn name(&self) -> &str;

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError>;

    async fn grade_async(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.grade(trace, case))
            }
            _ => self.grade(trace, case),
        }
    }
}

/// Combines sub-graders under an "all must pass" or "any may pass" policy.
pub struct CompositeGrader {
    graders: Vec<Box<dyn Grader>>,
    require_all: bool,
}

impl CompositeGrader {
    pub fn all(graders: Vec<Box<dyn Grader>>) -> Self {
        Self {
            graders,
            require_all: true,
        }
    }

    pub fn any(graders: Vec<Box<dyn Grader>>) -> Self {
        Self {
            graders,
            require_all: false,
        }
    }

    fn combine(&self, results: Vec<GradeResult>) -> GradeResult {
        let total = results.len();
        let passed = results.iter().filter(|result| result.passed()).count();

        let (status, message) = if self.require_all {
            let status = if passed == total {
                GradeStatus::Pass
            } else {
                GradeStatus::Fail
            };
            (status, format!("{passed}/{total} graders passed"))
        } else {
            let status = if passed > 0 {
                GradeStatus::Pass
            } else {
                GradeStatus::Fail
            };
            (status, format!("{passed}/{total} graders passed (require any)"))
        };

        let details: Vec<Value> = results
            .iter()
            .map(|result| serde_json::to_value(result).unwrap_or(Value::Null))
            .collect();

        let mut combined = match status {
            GradeStatus::Pass => GradeResult::pass(self.name(), message),
            _ => GradeResult::fail(self.name(), message),
        };
        combined = combined.with_detail("results", Value::Array(details));
        if total > 0 {
            combined = combined.with_score(passed as f64 / total as f64);
        }
        combined
    }
}

#[async_trait]
impl Grader for CompositeGrader {
    fn name(&self) -> &str {
        "composite"
    }

    fn grade(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let mut results = Vec::with_capacity(self.graders.len());
        for grader in &self.graders {
            let result = grader
                .grade(trace, case)
                .unwrap_or_else(|err| GradeResult::error(grader.name(), err.to_string()));
            results.push(result);
        }
        Ok(self.combine(results))
    }

    async fn grade_async(&self, trace: &Trace, case: &EvalCase) -> Result<GradeResult, EvalError> {
        let futures = self.graders.iter().map(|grader| async move {
            grader
                .grade_async(trace, case)
                .await
                .unwrap_or_else(|err| GradeResult::error(grader.name(), err.to_string()))
        });
        let results = join_all(futures).await;
        Ok(self.combine(results))
    }
}

fn param_strings(config: &GraderConfig, key: &str) -> Option<Vec<String>> {
    config.params.get(key).and_then(|value| {
        value.as_array().map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
    })
}

fn param_bool(config: &GraderConfig, key: &str) -> Option<bool> {
    config.params.get(key).and_then(Value::as_bool)
}

fn param_usize(config: &GraderConfig, key: &str) -> Option<usize> {
    config
        .params
        .get(key)
        .and_then(Value::as_u64)
        .map(|value| value as usize)
}

fn param_str(config: &GraderConfig, key: &str) -> Option<String> {
    config
        .params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Build one grader from its declared type name. Unknown types are
/// dropped with a warning rather than failing the turn.
pub fn grader_from_config(
    config: &GraderConfig,
    defaults: &GraderDefaults,
) -> Option<Box<dyn Grader>> {
    let grader: Box<dyn Grader> = match config.kind.to_lowercase().as_str() {
        "llm" => {
            let mut grader = LlmGrader::new(
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| defaults.llm_model.clone()),
            );
            if let Some(prompt) = &config.prompt {
                grader = grader.with_prompt(prompt.clone());
            }
            if let Some(threshold) = config.threshold {
                grader = grader.with_threshold(threshold);
            }
            Box::new(grader)
        }
        "contains" => {
            let mut grader = ContainsGrader::new();
            if let Some(values) = param_strings(config, "values") {
                grader = grader.with_values(values);
            }
            if let Some(case_sensitive) = param_bool(config, "case_sensitive") {
                grader = grader.case_sensitive(case_sensitive);
            }
            Box::new(grader)
        }
        "not_contains" => {
            let mut grader = NotContainsGrader::new();
            if let Some(values) = param_strings(config, "values") {
                grader = grader.with_values(values);
            }
            if let Some(case_sensitive) = param_bool(config, "case_sensitive") {
                grader = grader.case_sensitive(case_sensitive);
            }
            Box::new(grader)
        }
        "equals" => {
            let mut grader = EqualsGrader::new();
            if let Some(expected) = param_str(config, "expected") {
                grader = grader.with_expected(expected);
            }
            if let Some(normalize) = param_bool(config, "normalize_whitespace") {
                grader = grader.normalize_whitespace(normalize);
            }
            Box::new(grader)
        }
        "regex" => {
            let mut grader = RegexGrader::new();
            if let Some(pattern) = param_str(config, "pattern") {
                grader = grader.with_pattern(pattern);
            }
            Box::new(grader)
        }
        "tool_called" => {
            let mut grader = ToolCalledGrader::new();
            if let Some(required) = param_strings(config, "required") {
                grader = grader.with_required(required);
            }
            Box::new(grader)
        }
        "tool_not_called" => {
            let mut grader = ToolNotCalledGrader::new();
            if let Some(forbidden) = param_strings(config, "forbidden") {
                grader = grader.with_forbidden(forbidden);
            }
            Box::new(grader)
        }
        "tool_order" => {
            let mut grader = ToolOrderGrader::new();
            if let Some(order) = param_strings(config, "expected_order") {
                grader = grader.with_expected_order(order);
            }
            Box::new(grader)
        }
        "max_steps" => {
            let mut grader = MaxStepsGrader::new();
            if let Some(max) = param_usize(config, "max_steps") {
                grader = grader.with_max_steps(max);
            }
            Box::new(grader)
        }
        "max_tool_calls" => {
            let mut grader = MaxToolCallsGrader::new();
            if let Some(max) = param_usize(config, "max_tool_calls") {
                grader = grader.with_max_tool_calls(max);
            }
            Box::new(grader)
        }
        "max_llm_calls" => {
            let mut grader = MaxLlmCallsGrader::new();
            if let Some(max) = param_usize(config, "max_llm_calls") {
                grader = grader.with_max_llm_calls(max);
            }
            Box::new(grader)
        }
        "task_completed" => Box::new(TaskCompletedGrader::new()),
        other => {
            tracing::warn!(grader_type = other, "unknown grader type, skipping");
            return None;
        }
    };

    Some(grader)
}

/// Resolve the grader list for one turn: built-ins for every populated
/// expectation field, then the explicitly configured graders.
pub fn graders_for_turn(
    expected: Option<&ExpectedBehavior>,
    configs: &[GraderConfig],
    defaults: &GraderDefaults,
) -> Vec<Box<dyn Grader>> {
    let mut graders: Vec<Box<dyn Grader>> = Vec::new();

    if let Some(expected) = expected {
        if expected.output_contains.is_some() {
            graders.push(Box::new(ContainsGrader::new()));
        }
        if expected.output_not_contains.is_some() {
            graders.push(Box::new(NotContainsGrader::new()));
        }
        if expected.output_equals.is_some() {
            graders.push(Box::new(EqualsGrader::new()));
        }
        if expected.output_matches.is_some() {
            graders.push(Box::new(RegexGrader::new()));
        }
        if expected.tools_called.is_some() {
            graders.push(Box::new(ToolCalledGrader::new()));
        }
        if expected.tools_not_called.is_some() {
            graders.push(Box::new(ToolNotCalledGrader::new()));
        }
        if expected.tool_call_order.is_some() {
            graders.push(Box::new(ToolOrderGrader::new()));
        }
        if expected.max_steps.is_some() {
            graders.push(Box::new(MaxStepsGrader::new()));
        }
        if expected.max_tool_calls.is_some() {
            graders.push(Box::new(MaxToolCallsGrader::new()));
        }
        if expected.max_llm_calls.is_some() {
            graders.push(Box::new(MaxLlmCallsGrader::new()));
        }
        if expected.task_completed.is_some() {
            graders.push(Box::new(TaskCompletedGrader::new()));
        }
    }

    for config in configs {
        if let Some(grader) = grader_from_config(config, defaults) {
            graders.push(grader);
        }
    }

    graders
}

/// Serialize helper for expected/actual debug payloads.
pub(crate) fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(json!(null))
}
