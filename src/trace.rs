use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::EvalError;

fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    LlmCall,
    ToolCall,
    Reasoning,
    HumanInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
    Pending,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Success,
    Failure,
    Timeout,
    Error,
}

impl Default for TraceStatus {
    fn default() -> Self {
        Self::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Token usage reported for a single model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32, total_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    /// Cost estimation is a deliberate no-op: without a pricing table for
    /// the model there is nothing honest to report.
    pub fn cost_estimate(&self) -> Option<f64> {
        None
    }
}

/// One recorded unit of agent activity.
///
/// The kind decides which payload fields carry meaning; constructors leave
/// every other field unset rather than defaulting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(default = "short_id")]
    pub id: String,
    pub kind: StepKind,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: StepStatus,

    // Model calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,

    // Tool calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,

    // Reasoning and human input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Step {
    fn empty(kind: StepKind) -> Self {
        Self {
            id: short_id(),
            kind,
            timestamp: Utc::now(),
            status: StepStatus::Success,
            model: None,
            input: None,
            output: None,
            tokens: None,
            tool_name: None,
            tool_args: None,
            tool_result: None,
            reasoning_text: None,
            parent_id: None,
            error: None,
            duration_ms: None,
            metadata: HashMap::new(),
        }
    }

    pub fn llm_call(
        model: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        tokens: Option<TokenUsage>,
    ) -> Self {
        let mut step = Self::empty(StepKind::LlmCall);
        step.model = Some(model.into());
        step.input = Some(input.into());
        step.output = Some(output.into());
        step.tokens = tokens;
        step
    }

    pub fn tool_call(
        tool_name: impl Into<String>,
        tool_args: Map<String, Value>,
        tool_result: Option<Value>,
    ) -> Self {
        let mut step = Self::empty(StepKind::ToolCall);
        step.tool_name = Some(tool_name.into());
        step.tool_args = Some(tool_args);
        step.tool_result = tool_result;
        step
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        let mut step = Self::empty(StepKind::Reasoning);
        step.reasoning_text = Some(text.into());
        step
    }

    pub fn human_input(text: impl Into<String>) -> Self {
        let mut step = Self::empty(StepKind::HumanInput);
        step.input = Some(text.into());
        step
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.status = StepStatus::Failure;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Complete execution record of one agent invocation.
///
/// Steps are appended in execution order and never reordered or mutated in
/// place; `complete` seals the record exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default = "short_id")]
    pub id: String,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub status: TraceStatus,
    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

impl Trace {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            id: short_id(),
            input: input.into(),
            output: None,
            status: TraceStatus::Success,
            steps: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            metadata: HashMap::new(),
            framework: None,
            agent_name: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_status(mut self, status: TraceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }

    pub fn with_agent_name(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Seal the record: set the final output, status, completion timestamp
    /// and total duration.
    pub fn complete(&mut self, output: impl Into<String>, status: TraceStatus) {
        self.output = Some(output.into());
        self.status = status;
        let completed = Utc::now();
        let delta = completed - self.started_at;
        self.duration_ms = Some(delta.num_microseconds().unwrap_or_default() as f64 / 1_000.0);
        self.completed_at = Some(completed);
    }

    pub fn tool_calls(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|step| step.kind == StepKind::ToolCall)
            .collect()
    }

    pub fn llm_calls(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|step| step.kind == StepKind::LlmCall)
            .collect()
    }

    /// Names of the tools that were called, duplicates and order preserved.
    pub fn tools_called(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|step| step.kind == StepKind::ToolCall)
            .filter_map(|step| step.tool_name.as_deref())
            .collect()
    }

    pub fn total_tokens(&self) -> u32 {
        self.llm_calls()
            .iter()
            .filter_map(|step| step.tokens.as_ref())
            .map(|tokens| tokens.total_tokens)
            .sum()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn to_json(&self) -> Result<String, EvalError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, EvalError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn llm_call_sets_only_model_fields() {
        let step = Step::llm_call("gpt-4o-mini", "question", "answer", Some(TokenUsage::new(10, 5, 15)));
        assert_eq!(step.kind, StepKind::LlmCall);
        assert_eq!(step.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(step.tokens.unwrap().total_tokens, 15);
        assert!(step.tool_name.is_none());
        assert!(step.reasoning_text.is_none());
        assert_eq!(step.id.len(), 8);
    }

    #[test]
    fn tool_call_sets_only_tool_fields() {
        let step = Step::tool_call("search", args(&[("query", json!("flights"))]), Some(json!(["ba123"])));
        assert_eq!(step.kind, StepKind::ToolCall);
        assert_eq!(step.tool_name.as_deref(), Some("search"));
        assert!(step.model.is_none());
        assert!(step.output.is_none());
    }

    #[test]
    fn derived_views_preserve_order_and_duplicates() {
        let mut trace = Trace::new("book a flight");
        trace.add_step(Step::tool_call("search", Map::new(), None));
        trace.add_step(Step::llm_call("m", "a", "b", None));
        trace.add_step(Step::tool_call("book", Map::new(), None));
        trace.add_step(Step::tool_call("search", Map::new(), None));

        assert_eq!(trace.tools_called(), vec!["search", "book", "search"]);
        assert_eq!(trace.tool_calls().len(), 3);
        assert_eq!(trace.llm_calls().len(), 1);
        assert_eq!(trace.step_count(), 4);
    }

    #[test]
    fn total_tokens_sums_model_calls_only() {
        let mut trace = Trace::new("input");
        trace.add_step(Step::llm_call("m", "a", "b", Some(TokenUsage::new(100, 50, 150))));
        trace.add_step(Step::llm_call("m", "c", "d", None));
        trace.add_step(Step::llm_call("m", "e", "f", Some(TokenUsage::new(10, 10, 20))));
        trace.add_step(Step::tool_call("t", Map::new(), None));

        assert_eq!(trace.total_tokens(), 170);
    }

    #[test]
    fn complete_seals_the_record() {
        let mut trace = Trace::new("input");
        assert!(trace.output.is_none());
        trace.complete("done", TraceStatus::Success);

        assert_eq!(trace.output.as_deref(), Some("done"));
        assert_eq!(trace.status, TraceStatus::Success);
        assert!(trace.completed_at.is_some());
        assert!(trace.duration_ms.unwrap() >= 0.0);
    }

    #[test]
    fn cost_estimate_is_unknown() {
        let usage = TokenUsage::new(1, 2, 3);
        assert_eq!(usage.cost_estimate(), None);
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let mut trace = Trace::new("round trip");
        trace.add_step(Step::tool_call("search", args(&[("q", json!("x"))]), Some(json!(42))));
        trace.add_step(Step::reasoning("thinking about it"));
        trace.complete("all done", TraceStatus::Success);

        let encoded = trace.to_json().expect("serialize");
        let decoded = Trace::from_json(&encoded).expect("deserialize");

        assert_eq!(decoded.id, trace.id);
        assert_eq!(decoded.input, trace.input);
        assert_eq!(decoded.output, trace.output);
        assert_eq!(decoded.step_count(), trace.step_count());
        assert_eq!(decoded.steps[0].tool_name, trace.steps[0].tool_name);
        assert_eq!(decoded.steps[1].reasoning_text, trace.steps[1].reasoning_text);
    }
}
