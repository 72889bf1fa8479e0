use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeStatus {
    Pass,
    Fail,
    Error,
    Skip,
}

/// Verdict from a single grader invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeResult {
    pub grader: String,
    pub status: GradeStatus,
    /// Optional score in `0.0..=1.0` for score-based graders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,

    // Debugging payloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
}

impl GradeResult {
    fn new(grader: impl Into<String>, status: GradeStatus, message: Option<String>) -> Self {
        Self {
            grader: grader.into(),
            status,
            score: None,
            message,
            details: HashMap::new(),
            expected: None,
            actual: None,
        }
    }

    pub fn pass(grader: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(grader, GradeStatus::Pass, Some(message.into()))
    }

    pub fn fail(grader: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(grader, GradeStatus::Fail, Some(message.into()))
    }

    pub fn error(grader: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(grader, GradeStatus::Error, Some(message.into()))
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_expected(mut self, expected: Value) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn with_actual(mut self, actual: Value) -> Self {
        self.actual = Some(actual);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn passed(&self) -> bool {
        self.status == GradeStatus::Pass
    }
}

/// Measurement from a single metric. Never carries pass/fail semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricResult {
    pub metric: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl MetricResult {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            unit: None,
            details: HashMap::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Outcome of one conversation turn: the grades and metrics produced
/// against that turn's trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub turn_index: usize,
    pub user_input: String,
    pub status: GradeStatus,
    #[serde(default)]
    pub grades: Vec<GradeResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub skipped: bool,
}

impl TurnResult {
    pub fn new(turn_index: usize, user_input: impl Into<String>) -> Self {
        Self {
            turn_index,
            user_input: user_input.into(),
            status: GradeStatus::Pass,
            grades: Vec::new(),
            metrics: Vec::new(),
            trace_id: None,
            duration_ms: None,
            skipped: false,
        }
    }

    pub fn skipped(turn_index: usize, user_input: impl Into<String>) -> Self {
        let mut result = Self::new(turn_index, user_input);
        result.status = GradeStatus::Skip;
        result.skipped = true;
        result
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Record a grade and fold its status into the turn status.
    /// Error outranks fail outranks pass; skips are neutral.
    pub fn add_grade(&mut self, grade: GradeResult) {
        match grade.status {
            GradeStatus::Error => self.status = GradeStatus::Error,
            GradeStatus::Fail if self.status != GradeStatus::Error => {
                self.status = GradeStatus::Fail;
            }
            _ => {}
        }
        self.grades.push(grade);
    }

    pub fn add_metric(&mut self, metric: MetricResult) {
        self.metrics.push(metric);
    }

    pub fn total(&self) -> usize {
        self.grades.len()
    }

    pub fn passed_count(&self) -> usize {
        self.grades.iter().filter(|grade| grade.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.grades
            .iter()
            .filter(|grade| grade.status == GradeStatus::Fail)
            .count()
    }

    pub fn errored_count(&self) -> usize {
        self.grades
            .iter()
            .filter(|grade| grade.status == GradeStatus::Error)
            .count()
    }

    pub fn pass_rate(&self) -> f64 {
        if self.grades.is_empty() {
            return 0.0;
        }
        self.passed_count() as f64 / self.grades.len() as f64
    }

    pub fn passed(&self) -> bool {
        self.status == GradeStatus::Pass
    }
}

/// Complete result of evaluating a single test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub test_case: String,
    pub status: GradeStatus,
    #[serde(default)]
    pub turns: Vec<TurnResult>,

    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationResult {
    pub fn new(test_case: impl Into<String>) -> Self {
        Self {
            test_case: test_case.into(),
            status: GradeStatus::Pass,
            turns: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            trace_id: None,
            error: None,
        }
    }

    /// Record a turn result and fold its status into the overall status.
    pub fn add_turn(&mut self, turn: TurnResult) {
        match turn.status {
            GradeStatus::Error => self.status = GradeStatus::Error,
            GradeStatus::Fail if self.status != GradeStatus::Error => {
                self.status = GradeStatus::Fail;
            }
            _ => {}
        }
        self.turns.push(turn);
    }

    pub fn finish(&mut self) {
        let completed = Utc::now();
        let delta = completed - self.started_at;
        self.duration_ms = Some(delta.num_microseconds().unwrap_or_default() as f64 / 1_000.0);
        self.completed_at = Some(completed);
    }

    pub fn total(&self) -> usize {
        self.turns.len()
    }

    pub fn passed_count(&self) -> usize {
        self.turns.iter().filter(|turn| turn.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.turns
            .iter()
            .filter(|turn| turn.status == GradeStatus::Fail)
            .count()
    }

    pub fn errored_count(&self) -> usize {
        self.turns
            .iter()
            .filter(|turn| turn.status == GradeStatus::Error)
            .count()
    }

    pub fn pass_rate(&self) -> f64 {
        if self.turns.is_empty() {
            return 0.0;
        }
        self.passed_count() as f64 / self.turns.len() as f64
    }

    pub fn passed(&self) -> bool {
        self.status == GradeStatus::Pass
    }

    /// All grades across all turns, in turn order.
    pub fn grades(&self) -> impl Iterator<Item = &GradeResult> {
        self.turns.iter().flat_map(|turn| turn.grades.iter())
    }

    pub fn failed_grades(&self) -> Vec<&GradeResult> {
        self.grades()
            .filter(|grade| grade.status == GradeStatus::Fail)
            .collect()
    }

    /// All metrics across all executed turns.
    pub fn metrics(&self) -> impl Iterator<Item = &MetricResult> {
        self.turns.iter().flat_map(|turn| turn.metrics.iter())
    }
}

/// Result of evaluating a test suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub suite: String,
    #[serde(default)]
    pub results: Vec<EvaluationResult>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SuiteResult {
    pub fn new(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn add_result(&mut self, result: EvaluationResult) {
        self.results.push(result);
    }

    pub fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|result| result.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.status == GradeStatus::Fail)
            .count()
    }

    pub fn errored(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.status == GradeStatus::Error)
            .count()
    }

    pub fn pass_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.passed() as f64 / self.total() as f64
    }

    pub fn duration_ms(&self) -> f64 {
        self.results
            .iter()
            .filter_map(|result| result.duration_ms)
            .sum()
    }
}

/// Result of a complete run across multiple suites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub suites: Vec<SuiteResult>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunResult {
    pub fn new() -> Self {
        Self {
            suites: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn add_suite(&mut self, suite: SuiteResult) {
        self.suites.push(suite);
    }

    pub fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn total(&self) -> usize {
        self.suites.iter().map(SuiteResult::total).sum()
    }

    pub fn passed(&self) -> usize {
        self.suites.iter().map(SuiteResult::passed).sum()
    }

    pub fn failed(&self) -> usize {
        self.suites.iter().map(SuiteResult::failed).sum()
    }

    pub fn errored(&self) -> usize {
        self.suites.iter().map(SuiteResult::errored).sum()
    }

    pub fn pass_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.passed() as f64 / total as f64
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == self.total()
    }

    /// Exit condition for a run: realized pass rate against the
    /// configured minimum.
    pub fn meets_threshold(&self, min_pass_rate: f64) -> bool {
        self.pass_rate() >= min_pass_rate
    }
}

impl Default for RunResult {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_status_aggregation_prefers_worst() {
        let mut turn = TurnResult::new(0, "hello");
        turn.add_grade(GradeResult::pass("a", "ok"));
        assert_eq!(turn.status, GradeStatus::Pass);

        turn.add_grade(GradeResult::fail("b", "missing"));
        assert_eq!(turn.status, GradeStatus::Fail);

        turn.add_grade(GradeResult::error("c", "boom"));
        assert_eq!(turn.status, GradeStatus::Error);

        // A later failure never downgrades an error.
        turn.add_grade(GradeResult::fail("d", "missing"));
        assert_eq!(turn.status, GradeStatus::Error);

        assert_eq!(turn.total(), 4);
        assert_eq!(turn.passed_count(), 1);
        assert_eq!(turn.failed_count(), 2);
        assert_eq!(turn.errored_count(), 1);
        assert_eq!(turn.pass_rate(), 0.25);
    }

    #[test]
    fn skipped_turns_do_not_change_evaluation_status() {
        let mut result = EvaluationResult::new("case");
        let mut first = TurnResult::new(0, "one");
        first.add_grade(GradeResult::pass("g", "ok"));
        result.add_turn(first);
        result.add_turn(TurnResult::skipped(1, "two"));

        assert_eq!(result.status, GradeStatus::Pass);
        assert_eq!(result.total(), 2);
        assert_eq!(result.passed_count(), 1);
    }

    #[test]
    fn pass_rate_is_zero_when_empty() {
        assert_eq!(TurnResult::new(0, "x").pass_rate(), 0.0);
        assert_eq!(EvaluationResult::new("x").pass_rate(), 0.0);
        assert_eq!(SuiteResult::new("x").pass_rate(), 0.0);
        assert_eq!(RunResult::new().pass_rate(), 0.0);
    }

    #[test]
    fn run_threshold_uses_realized_pass_rate() {
        let mut run = RunResult::new();
        let mut suite = SuiteResult::new("s");

        let mut pass = EvaluationResult::new("p");
        pass.finish();
        suite.add_result(pass);

        let mut fail = EvaluationResult::new("f");
        let mut turn = TurnResult::new(0, "x");
        turn.add_grade(GradeResult::fail("g", "no"));
        fail.add_turn(turn);
        fail.finish();
        suite.add_result(fail);

        suite.finish();
        run.add_suite(suite);
        run.finish();

        assert_eq!(run.total(), 2);
        assert_eq!(run.passed(), 1);
        assert_eq!(run.pass_rate(), 0.5);
        assert!(run.meets_threshold(0.5));
        assert!(!run.meets_threshold(0.75));
        assert!(!run.all_passed());
    }
}
