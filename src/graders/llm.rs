use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::case::EvalCase;
use crate::graders::Grader;
use crate::providers::{
    anthropic::Anthropic, openai::OpenAI, ChatProvider, ChatRequest,
};
use crate::results::{GradeResult, GradeStatus};
use crate::trace::{Message, StepKind, Trace};
use crate::EvalError;

const DEFAULT_PROMPT: &str = r#"You are evaluating an AI agent's response.

User Input: {{input}}
Agent Output: {{output}}

Task: {{task}}

Evaluate whether the agent's response meets the requirements.
Respond with exactly one of: PASS or FAIL
Then provide a brief explanation.

Format:
VERDICT: PASS or FAIL
REASON: Your explanation
"#;

const RUBRIC_PROMPT: &str = r#"You are evaluating an AI agent's response using a scoring rubric.

User Input: {{input}}
Agent Output: {{output}}

Scoring Rubric:
{{rubric}}

For each criterion, provide a score from 1-5 where:
1 = Poor, 2 = Below Average, 3 = Average, 4 = Good, 5 = Excellent

Format your response as:
CRITERION: criterion_name
SCORE: X
REASON: explanation

After scoring all criteria, provide:
TOTAL_SCORE: X/Y
VERDICT: PASS or FAIL
"#;

static VERDICT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"VERDICT:\s*(PASS|FAIL)").expect("verdict regex"));
static REASON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)REASON:\s*(.+)").expect("reason regex"));
static SCORE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SCORE:\s*(\d+(?:\.\d+)?)").expect("score regex"));
static TOTAL_SCORE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"TOTAL_SCORE:\s*(\d+(?:\.\d+)?)\s*/\s*(\d+(?:\.\d+)?)").expect("total score regex")
});

fn parse_verdict(response: &str) -> (GradeStatus, String, Option<f64>) {
    let upper = response.to_uppercase();

    let status = if let Some(captures) = VERDICT_RE.captures(&upper) {
        if &captures[1] == "PASS" {
            GradeStatus::Pass
        } else {
            GradeStatus::Fail
        }
    } else if upper.contains("PASS") && !upper.contains("FAIL") {
        GradeStatus::Pass
    } else {
        // Ambiguous judge output defaults to fail.
        GradeStatus::Fail
    };

    let reason = REASON_RE
        .captures(response)
        .map(|captures| captures[1].trim().to_string())
        .unwrap_or_else(|| response.chars().take(200).collect());

    let score = SCORE_RE.captures(response).and_then(|captures| {
        let mut value: f64 = captures[1].parse().ok()?;
        if value > 1.0 {
            value = if value <= 10.0 { value / 10.0 } else { value / 100.0 };
        }
        Some(value)
    });

    (status, reason, score)
}

fn trace_summary(trace: &Trace) -> String {
    let mut lines = vec!["Execution Trace:".to_string()];
    for (index, step) in trace.steps.iter().enumerate() {
        let position = index + 1;
        match step.kind {
            StepKind::ToolCall => {
                lines.push(format!(
                    "  {position}. Tool: {}({})",
                    step.tool_name.as_deref().unwrap_or("unknown"),
                    step.tool_args
                        .as_ref()
                        .map(|args| serde_json::to_string(args).unwrap_or_default())
                        .unwrap_or_default()
                ));
                if let Some(result) = &step.tool_result {
                    let preview: String = result.to_string().chars().take(200).collect();
                    lines.push(format!("      Result: {preview}"));
                }
            }
            StepKind::LlmCall => {
                let preview: String =
                    step.output.as_deref().unwrap_or("").chars().take(100).collect();
                lines.push(format!("  {position}. LLM: {preview}..."));
            }
            StepKind::Reasoning => {
                let preview: String = step
                    .reasoning_text
                    .as_deref()
                    .unwrap_or("")
                    .chars()
                    .take(100)
                    .collect();
                lines.push(format!("  {position}. Reasoning: {preview}..."));
            }
            StepKind::HumanInput => {
                lines.push(format!(
                    "  {position}. Human: {}",
                    step.input.as_deref().unwrap_or("")
                ));
            }
        }
    }
    lines.join("\n")
}

/// Model-as-judge grader: sends the trace to an LLM with a grading prompt
/// and parses the verdict.
pub struct LlmGrader {
    prompt_template: String,
    model: String,
    threshold: Option<f64>,
    temperature: f32,
    task: String,
    provider: Option<Arc<dyn ChatProvider>>,
}

impl LlmGrader {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            prompt_template: DEFAULT_PROMPT.to_string(),
            model: model.into(),
            threshold: None,
            temperature: 0.0,
            task: "Determine if the agent completed the task correctly.".to_string(),
            provider: None,
        }
    }

    /// Custom grading prompt. Placeholders: `{{input}}`, `{{output}}`,
    /// `{{trace}}`, `{{task}}`.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt_template = prompt.into();
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    fn resolve_provider(&self) -> Result<Arc<dyn ChatProvider>, EvalError> {
        if let Some(provider) = &self.provider {
            return Ok(Arc::clone(provider));
        }
        if self.model.starts_with("claude") {
            Ok(Arc::new(Anthropic::from_env()?))
        } else {
            Ok(Arc::new(OpenAI::from_env()?))
        }
    }

    fn render_prompt(&self, trace: &Trace) -> Result<String, EvalError> {
        let handlebars = Handlebars::new();
        Ok(handlebars.render_template(
            &self.prompt_template,
            &json!({
                "input": trace.input,
                "output": trace.output.as_deref().unwrap_or("(no output)"),
                "trace": trace_summary(trace),
                "task": self.task,
            }),
        )?)
    }

    fn build_result(&self, response: &str) -> GradeResult {
        let (mut status, reason, score) = parse_verdict(response);

        if let (Some(threshold), Some(score)) = (self.threshold, score) {
            status = if score >= threshold {
                GradeStatus::Pass
            } else {
                GradeStatus::Fail
            };
        }

        let mut result = match status {
            GradeStatus::Pass => GradeResult::pass(self.name(), reason),
            _ => GradeResult::fail(self.name(), reason),
        };
        if let Some(score) = score {
            result = result.with_score(score);
        }
        result
            .with_detail("model", json!(self.model))
            .with_detail("raw_response", json!(response))
    }

    async fn run_judge(&self, trace: &Trace) -> Result<GradeResult, EvalError> {
        let provider = self.resolve_provider()?;
        let prompt = self.render_prompt(trace)?;
        let request = ChatRequest::new(self.model.clone(), vec![Message::user(prompt)])
            .with_temperature(self.temperature);
        let response = provider.complete(request).await?;
        Ok(self.build_result(&response.content))
    }
}

#[async_trait]
impl Grader for LlmGrader {
    fn name(&self) -> &str {
        "llm"
    }

    fn grade(&self, _trace: &Trace, _case: &EvalCase) -> Result<GradeResult, EvalError> {
        // Network grader: there is no blocking client to fall back to.
        Err(EvalError::Grader(
            "model judge runs asynchronously; use grade_async".to_string(),
        ))
    }

    async fn grade_async(&self, trace: &Trace, _case: &EvalCase) -> Result<GradeResult, EvalError> {
        match self.run_judge(trace).await {
            Ok(result) => Ok(result),
            Err(err) => Ok(GradeResult::error(
                self.name(),
                format!("LLM grader error: {err}"),
            )),
        }
    }
}

/// Judge grader scoring against a criterion rubric; passes when the total
/// score ratio reaches the threshold.
pub struct LlmRubricGrader {
    inner: LlmGrader,
    rubric: Vec<(String, String)>,
    pass_threshold: f64,
}

impl LlmRubricGrader {
    pub fn new(model: impl Into<String>, rubric: Vec<(String, String)>) -> Self {
        Self {
            inner: LlmGrader::new(model).with_prompt(RUBRIC_PROMPT),
            rubric,
            pass_threshold: 0.7,
        }
    }

    pub fn with_pass_threshold(mut self, pass_threshold: f64) -> Self {
        self.pass_threshold = pass_threshold;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.inner = self.inner.with_provider(provider);
        self
    }

    fn render_prompt(&self, trace: &Trace) -> Result<String, EvalError> {
        let rubric_text = self
            .rubric
            .iter()
            .map(|(name, description)| format!("- {name}: {description}"))
            .collect::<Vec<_>>()
            .join("\n");

        let handlebars = Handlebars::new();
        Ok(handlebars.render_template(
            RUBRIC_PROMPT,
            &json!({
                "input": trace.input,
                "output": trace.output.as_deref().unwrap_or("(no output)"),
                "rubric": rubric_text,
            }),
        )?)
    }

    fn build_result(&self, response: &str) -> GradeResult {
        let total_score = TOTAL_SCORE_RE.captures(response).and_then(|captures| {
            let achieved: f64 = captures[1].parse().ok()?;
            let possible: f64 = captures[2].parse().ok()?;
            if possible > 0.0 {
                Some(achieved / possible)
            } else {
                None
            }
        });

        let (verdict, reason, _) = parse_verdict(response);
        let status = match total_score {
            Some(score) => {
                if score >= self.pass_threshold {
                    GradeStatus::Pass
                } else {
                    GradeStatus::Fail
                }
            }
            None => verdict,
        };

        let mut result = match status {
            GradeStatus::Pass => GradeResult::pass(self.name(), reason),
            _ => GradeResult::fail(self.name(), reason),
        };
        if let Some(score) = total_score {
            result = result.with_score(score);
        }
        result
            .with_detail("model", json!(self.inner.model))
            .with_detail("raw_response", json!(response))
    }
}

#[async_trait]
impl Grader for LlmRubricGrader {
    fn name(&self) -> &str {
        "llm_rubric"
    }

    fn grade(&self, _trace: &Trace, _case: &EvalCase) -> Result<GradeResult, EvalError> {
        Err(EvalError::Grader(
            "model judge runs asynchronously; use grade_async".to_string(),
        ))
    }

    async fn grade_async(&self, trace: &Trace, _case: &EvalCase) -> Result<GradeResult, EvalError> {
        let outcome = async {
            let provider = self.inner.resolve_provider()?;
            let prompt = self.render_prompt(trace)?;
            let request =
                ChatRequest::new(self.inner.model.clone(), vec![Message::user(prompt)])
                    .with_temperature(self.inner.temperature);
            let response = provider.complete(request).await?;
            Ok::<GradeResult, EvalError>(self.build_result(&response.content))
        }
        .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(err) => Ok(GradeResult::error(
                self.name(),
                format!("LLM grader error: {err}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::Turn;
    use crate::providers::scripted::ScriptedProvider;

    #[test]
    fn parses_explicit_verdicts() {
        let (status, reason, _) = parse_verdict("VERDICT: PASS\nREASON: all good");
        assert_eq!(status, GradeStatus::Pass);
        assert_eq!(reason, "all good");

        let (status, _, _) = parse_verdict("VERDICT: FAIL\nREASON: wrong city");
        assert_eq!(status, GradeStatus::Fail);
    }

    #[test]
    fn ambiguous_verdict_defaults_to_fail() {
        let (status, _, _) = parse_verdict("I am not sure about this one.");
        assert_eq!(status, GradeStatus::Fail);
    }

    #[test]
    fn score_is_normalized() {
        let (_, _, score) = parse_verdict("VERDICT: PASS\nSCORE: 8\nREASON: good");
        assert_eq!(score, Some(0.8));

        let (_, _, score) = parse_verdict("VERDICT: PASS\nSCORE: 0.75\nREASON: good");
        assert_eq!(score, Some(0.75));

        let (_, _, score) = parse_verdict("VERDICT: PASS\nSCORE: 85\nREASON: good");
        assert_eq!(score, Some(0.85));
    }

    #[tokio::test]
    async fn judge_passes_via_scripted_provider() {
        let provider = Arc::new(ScriptedProvider::new([
            "VERDICT: PASS\nREASON: The agent answered correctly.",
        ]));
        let grader = LlmGrader::new("gpt-4o-mini").with_provider(provider);

        let trace = Trace::new("what is 2+2?").with_output("4");
        let case = EvalCase::for_turn("judge", Turn::new("what is 2+2?"));

        let result = grader.grade_async(&trace, &case).await.expect("grade");
        assert_eq!(result.status, GradeStatus::Pass);
        assert!(result
            .message
            .as_deref()
            .unwrap()
            .contains("answered correctly"));
    }

    #[tokio::test]
    async fn judge_threshold_overrides_verdict() {
        let provider = Arc::new(ScriptedProvider::new([
            "VERDICT: PASS\nSCORE: 0.4\nREASON: weak answer",
        ]));
        let grader = LlmGrader::new("gpt-4o-mini")
            .with_provider(provider)
            .with_threshold(0.6);

        let trace = Trace::new("question").with_output("answer");
        let case = EvalCase::for_turn("judge", Turn::new("question"));

        let result = grader.grade_async(&trace, &case).await.expect("grade");
        assert_eq!(result.status, GradeStatus::Fail);
        assert_eq!(result.score, Some(0.4));
    }

    #[tokio::test]
    async fn provider_failure_becomes_error_grade() {
        let provider = Arc::new(ScriptedProvider::new(Vec::<String>::new()));
        let grader = LlmGrader::new("gpt-4o-mini").with_provider(provider);

        let trace = Trace::new("question").with_output("answer");
        let case = EvalCase::for_turn("judge", Turn::new("question"));

        let result = grader.grade_async(&trace, &case).await.expect("grade");
        assert_eq!(result.status, GradeStatus::Error);
    }

    #[tokio::test]
    async fn rubric_grader_scores_against_threshold() {
        let provider = Arc::new(ScriptedProvider::new([
            "CRITERION: accuracy\nSCORE: 4\nREASON: mostly right\nTOTAL_SCORE: 8/10\nVERDICT: PASS",
        ]));
        let grader = LlmRubricGrader::new(
            "gpt-4o-mini",
            vec![("accuracy".to_string(), "Is the answer correct?".to_string())],
        )
        .with_provider(provider)
        .with_pass_threshold(0.7);

        let trace = Trace::new("question").with_output("answer");
        let case = EvalCase::for_turn("judge", Turn::new("question"));

        let result = grader.grade_async(&trace, &case).await.expect("grade");
        assert_eq!(result.status, GradeStatus::Pass);
        assert_eq!(result.score, Some(0.8));
    }
}
