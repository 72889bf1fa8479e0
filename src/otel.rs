use std::collections::HashMap;
use std::sync::Mutex;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::trace::{Step, StepStatus, Trace, TraceStatus};

/// Attribute carrying the OpenInference span kind.
pub const SPAN_KIND_ATTRIBUTE: &str = "openinference.span.kind";

const SPAN_KIND_LLM: &str = "LLM";
const SPAN_KIND_TOOL: &str = "TOOL";
const SPAN_KIND_CHAIN: &str = "CHAIN";
const SPAN_KIND_EMBEDDING: &str = "EMBEDDING";
const SPAN_KIND_RETRIEVER: &str = "RETRIEVER";
const SPAN_KIND_RERANKER: &str = "RERANKER";
const SPAN_KIND_GUARDRAIL: &str = "GUARDRAIL";
const SPAN_KIND_AGENT: &str = "AGENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
}

impl Default for SpanStatus {
    fn default() -> Self {
        Self::Ok
    }
}

/// A completed span delivered by a distributed-tracing backend bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanData {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub start_time_unix_nano: u64,
    #[serde(default)]
    pub end_time_unix_nano: u64,
}

impl SpanData {
    pub fn new(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            name: name.into(),
            attributes: HashMap::new(),
            status: SpanStatus::Ok,
            status_message: None,
            start_time_unix_nano: 0,
            end_time_unix_nano: 0,
        }
    }

    pub fn with_kind(self, kind: impl Into<String>) -> Self {
        self.with_attribute(SPAN_KIND_ATTRIBUTE, Value::String(kind.into()))
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.status = SpanStatus::Error;
        self.status_message = Some(message.into());
        self
    }

    pub fn with_times(mut self, start_unix_nano: u64, end_unix_nano: u64) -> Self {
        self.start_time_unix_nano = start_unix_nano;
        self.end_time_unix_nano = end_unix_nano;
        self
    }
}

fn attr_str<'a>(attrs: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    attrs.get(key).and_then(Value::as_str)
}

fn attr_u32(attrs: &HashMap<String, Value>, key: &str) -> u32 {
    match attrs.get(key) {
        Some(Value::Number(number)) => number.as_u64().unwrap_or(0) as u32,
        Some(Value::String(raw)) => raw.parse().unwrap_or(0),
        _ => 0,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Default)]
struct CollectorState {
    traces: HashMap<String, Trace>,
    // First-seen order, for latest_trace/all_traces.
    order: Vec<String>,
}

/// Converts distributed-tracing spans into execution records, grouped by
/// trace id.
///
/// This is an explicit object owned by whoever sets up tracing, never a
/// process-wide singleton. The internal registry is the one piece of
/// shared mutable state; one lock serializes span delivery against
/// `reset` so attribution stays unambiguous.
#[derive(Default)]
pub struct SpanCollector {
    inner: Mutex<CollectorState>,
}

impl SpanCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one completed span. Spans without a recognized kind
    /// attribute are ignored.
    pub fn record_span(&self, span: &SpanData) {
        let Some(kind) = attr_str(&span.attributes, SPAN_KIND_ATTRIBUTE)
            .map(str::to_uppercase)
        else {
            return;
        };

        let mut state = self.inner.lock().unwrap();

        if !state.traces.contains_key(&span.trace_id) {
            let trace = Trace::new("")
                .with_id(span.trace_id.clone())
                .with_framework("openinference");
            state.traces.insert(span.trace_id.clone(), trace);
            state.order.push(span.trace_id.clone());
        }
        let trace = state
            .traces
            .get_mut(&span.trace_id)
            .expect("trace just inserted");

        // A parentless chain/agent span is the record's summary.
        if matches!(kind.as_str(), SPAN_KIND_CHAIN | SPAN_KIND_AGENT)
            && span.parent_span_id.is_none()
        {
            update_trace_from_root(trace, span);
            return;
        }

        if let Some(step) = span_to_step(span, &kind) {
            trace.add_step(step);
        }
    }

    /// Look up a record by its distributed-trace id.
    pub fn trace(&self, trace_id: &str) -> Option<Trace> {
        self.inner.lock().unwrap().traces.get(trace_id).cloned()
    }

    /// The most recently started record.
    pub fn latest_trace(&self) -> Option<Trace> {
        let state = self.inner.lock().unwrap();
        state
            .order
            .last()
            .and_then(|trace_id| state.traces.get(trace_id))
            .cloned()
    }

    /// All records in first-seen order.
    pub fn all_traces(&self) -> Vec<Trace> {
        let state = self.inner.lock().unwrap();
        state
            .order
            .iter()
            .filter_map(|trace_id| state.traces.get(trace_id))
            .cloned()
            .collect()
    }

    /// Clear all state so independent evaluations do not leak spans into
    /// each other.
    pub fn reset(&self) {
        let mut state = self.inner.lock().unwrap();
        state.traces.clear();
        state.order.clear();
    }
}

fn update_trace_from_root(trace: &mut Trace, span: &SpanData) {
    if let Some(input) = attr_str(&span.attributes, "input.value") {
        trace.input = input.to_string();
    }
    trace.output = span
        .attributes
        .get("output.value")
        .map(value_to_string);
    trace.status = match span.status {
        SpanStatus::Error => TraceStatus::Error,
        SpanStatus::Ok => TraceStatus::Success,
    };
    trace.started_at = DateTime::from_timestamp_nanos(span.start_time_unix_nano as i64);
    trace.completed_at = Some(DateTime::from_timestamp_nanos(span.end_time_unix_nano as i64));
    trace.duration_ms = Some(duration_ms(span));

    if let Some(system) = attr_str(&span.attributes, "llm.system") {
        trace.framework = Some(system.to_string());
    }

    trace
        .metadata
        .insert("otel_trace_id".to_string(), Value::String(span.trace_id.clone()));
    trace.metadata.insert(
        "otel_root_span_id".to_string(),
        Value::String(span.span_id.clone()),
    );
}

fn span_to_step(span: &SpanData, kind: &str) -> Option<Step> {
    match kind {
        SPAN_KIND_LLM => Some(convert_llm_span(span)),
        SPAN_KIND_TOOL => Some(convert_tool_span(span)),
        SPAN_KIND_EMBEDDING | SPAN_KIND_RETRIEVER | SPAN_KIND_RERANKER => {
            Some(convert_retrieval_span(span, kind))
        }
        SPAN_KIND_GUARDRAIL => Some(convert_guardrail_span(span)),
        // Nested chains/agents become reasoning steps.
        SPAN_KIND_CHAIN | SPAN_KIND_AGENT => Some(convert_chain_span(span)),
        _ => None,
    }
}

fn convert_llm_span(span: &SpanData) -> Step {
    let attrs = &span.attributes;
    let model = attr_str(attrs, "llm.model_name")
        .or_else(|| attr_str(attrs, "gen_ai.request.model"))
        .unwrap_or("");

    let mut step = Step::llm_call(
        model,
        extract_messages(attrs, "input"),
        extract_messages(attrs, "output"),
        Some(crate::trace::TokenUsage::new(
            attr_u32(attrs, "llm.token_count.prompt"),
            attr_u32(attrs, "llm.token_count.completion"),
            attr_u32(attrs, "llm.token_count.total"),
        )),
    );
    apply_span_outcome(&mut step, span);

    if let Some(provider) = attr_str(attrs, "llm.provider").or_else(|| attr_str(attrs, "llm.system"))
    {
        step = step.with_metadata("llm_provider", Value::String(provider.to_string()));
    }
    step.with_metadata("otel_span_id", Value::String(span.span_id.clone()))
}

fn convert_tool_span(span: &SpanData) -> Step {
    let attrs = &span.attributes;
    let tool_name = attr_str(attrs, "tool.name")
        .or_else(|| attr_str(attrs, "tool_call.function.name"))
        .unwrap_or("unknown_tool");

    let raw_args = attrs
        .get("tool.parameters")
        .or_else(|| attrs.get("tool_call.function.arguments"))
        .or_else(|| attrs.get("input.value"));
    let tool_args = parse_tool_args(raw_args);

    let mut step = Step::tool_call(tool_name, tool_args, attrs.get("output.value").cloned());
    apply_span_outcome(&mut step, span);

    if let Some(tool_id) = attr_str(attrs, "tool.id").or_else(|| attr_str(attrs, "tool_call.id")) {
        step = step.with_metadata("tool_id", Value::String(tool_id.to_string()));
    }
    step.with_metadata("otel_span_id", Value::String(span.span_id.clone()))
}

fn convert_retrieval_span(span: &SpanData, kind: &str) -> Step {
    let attrs = &span.attributes;
    let mut args = Map::new();
    args.insert(
        "input".to_string(),
        attrs.get("input.value").cloned().unwrap_or(Value::Null),
    );

    // Tagged with the originating kind so they are distinguishable from
    // genuine agent tool calls.
    let mut step = Step::tool_call(
        kind.to_lowercase(),
        args,
        attrs.get("output.value").cloned(),
    );
    apply_span_outcome(&mut step, span);
    step.with_metadata("span_kind", Value::String(kind.to_string()))
        .with_metadata("otel_span_id", Value::String(span.span_id.clone()))
}

fn convert_guardrail_span(span: &SpanData) -> Step {
    let attrs = &span.attributes;
    let outcome = attrs
        .get("output.value")
        .map(value_to_string)
        .unwrap_or_else(|| "passed".to_string());

    let mut step = Step::reasoning(format!("Guardrail check: {outcome}"));
    apply_span_outcome(&mut step, span);

    if let Some(input) = attrs.get("input.value") {
        step = step.with_metadata("guardrail_input", input.clone());
    }
    step.with_metadata("otel_span_id", Value::String(span.span_id.clone()))
}

fn convert_chain_span(span: &SpanData) -> Step {
    let attrs = &span.attributes;
    let output = attrs
        .get("output.value")
        .map(value_to_string)
        .unwrap_or_default();

    let mut step = Step::reasoning(format!("Chain: {} - {output}", span.name));
    apply_span_outcome(&mut step, span);

    if let Some(input) = attrs.get("input.value") {
        step = step.with_metadata("chain_input", input.clone());
    }
    step.with_metadata("otel_span_id", Value::String(span.span_id.clone()))
}

fn apply_span_outcome(step: &mut Step, span: &SpanData) {
    step.duration_ms = Some(duration_ms(span));
    if span.status == SpanStatus::Error {
        step.status = StepStatus::Failure;
        step.error = span.status_message.clone();
    }
}

fn duration_ms(span: &SpanData) -> f64 {
    span.end_time_unix_nano.saturating_sub(span.start_time_unix_nano) as f64 / 1_000_000.0
}

/// Reconstruct message content from OpenInference indexed attributes
/// (`llm.input_messages.0.message.content`, paired with a `.role` key),
/// scanning ascending indices until one is missing. Falls back to the
/// plain `input.value` / `output.value` attribute.
fn extract_messages(attrs: &HashMap<String, Value>, direction: &str) -> String {
    let mut messages = Vec::new();
    let mut index = 0;
    loop {
        let content_key = format!("llm.{direction}_messages.{index}.message.content");
        let Some(content) = attrs.get(&content_key) else {
            break;
        };
        let role_key = format!("llm.{direction}_messages.{index}.message.role");
        match attr_str(attrs, &role_key) {
            Some(role) if !role.is_empty() => {
                messages.push(format!("[{role}]: {}", value_to_string(content)));
            }
            _ => messages.push(value_to_string(content)),
        }
        index += 1;
    }

    if !messages.is_empty() {
        return messages.join("\n");
    }

    attrs
        .get(&format!("{direction}.value"))
        .map(value_to_string)
        .unwrap_or_default()
}

/// Tool arguments arrive either as structured data, as a serialized-object
/// string, or as an opaque scalar; the last two degrade to a single-key
/// mapping.
fn parse_tool_args(raw: Option<&Value>) -> Map<String, Value> {
    match raw {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert("input".to_string(), Value::String(text.clone()));
                map
            }
        },
        Some(other) => {
            let mut map = Map::new();
            map.insert("input".to_string(), other.clone());
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::StepKind;
    use serde_json::json;

    fn root_span(trace_id: &str) -> SpanData {
        SpanData::new(trace_id, "root", "agent_run")
            .with_kind("AGENT")
            .with_attribute("input.value", json!("Book a flight"))
            .with_attribute("output.value", json!("Flight booked"))
            .with_times(1_000_000_000, 3_000_000_000)
    }

    #[test]
    fn spans_without_kind_are_ignored() {
        let collector = SpanCollector::new();
        collector.record_span(&SpanData::new("t1", "s1", "internal"));
        assert!(collector.all_traces().is_empty());
    }

    #[test]
    fn root_span_becomes_trace_summary() {
        let collector = SpanCollector::new();
        collector.record_span(&root_span("t1"));

        let trace = collector.trace("t1").expect("trace");
        assert_eq!(trace.input, "Book a flight");
        assert_eq!(trace.output.as_deref(), Some("Flight booked"));
        assert_eq!(trace.status, TraceStatus::Success);
        assert_eq!(trace.duration_ms, Some(2_000.0));
        assert_eq!(trace.step_count(), 0);
        assert_eq!(trace.framework.as_deref(), Some("openinference"));
    }

    #[test]
    fn root_error_status_maps_to_error_trace() {
        let collector = SpanCollector::new();
        let span = root_span("t1").with_error("upstream exploded");
        collector.record_span(&span);

        let trace = collector.trace("t1").expect("trace");
        assert_eq!(trace.status, TraceStatus::Error);
    }

    #[test]
    fn llm_span_reconstructs_indexed_messages() {
        let collector = SpanCollector::new();
        let span = SpanData::new("t1", "s1", "llm")
            .with_kind("LLM")
            .with_attribute("llm.model_name", json!("gpt-4o-mini"))
            .with_attribute("llm.input_messages.0.message.content", json!("You are helpful."))
            .with_attribute("llm.input_messages.0.message.role", json!("system"))
            .with_attribute("llm.input_messages.1.message.content", json!("Book a flight"))
            .with_attribute("llm.input_messages.1.message.role", json!("user"))
            .with_attribute("llm.output_messages.0.message.content", json!("Booking now"))
            .with_attribute("llm.output_messages.0.message.role", json!("assistant"))
            .with_attribute("llm.token_count.prompt", json!(120))
            .with_attribute("llm.token_count.completion", json!(30))
            .with_attribute("llm.token_count.total", json!(150))
            .with_times(0, 500_000_000);
        collector.record_span(&span);

        let trace = collector.trace("t1").expect("trace");
        let step = &trace.steps[0];
        assert_eq!(step.kind, StepKind::LlmCall);
        assert_eq!(step.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(
            step.input.as_deref(),
            Some("[system]: You are helpful.\n[user]: Book a flight")
        );
        assert_eq!(step.output.as_deref(), Some("[assistant]: Booking now"));
        assert_eq!(step.tokens.unwrap().total_tokens, 150);
        assert_eq!(step.duration_ms, Some(500.0));
    }

    #[test]
    fn llm_span_falls_back_to_plain_values() {
        let collector = SpanCollector::new();
        let span = SpanData::new("t1", "s1", "llm")
            .with_kind("LLM")
            .with_attribute("input.value", json!("raw prompt"))
            .with_attribute("output.value", json!("raw reply"));
        collector.record_span(&span);

        let step = &collector.trace("t1").unwrap().steps[0];
        assert_eq!(step.input.as_deref(), Some("raw prompt"));
        assert_eq!(step.output.as_deref(), Some("raw reply"));
    }

    #[test]
    fn tool_span_parses_serialized_arguments() {
        let collector = SpanCollector::new();
        let span = SpanData::new("t1", "s1", "tool")
            .with_kind("TOOL")
            .with_attribute("tool.name", json!("search_flights"))
            .with_attribute("tool.parameters", json!(r#"{"from": "NYC", "to": "LA"}"#))
            .with_attribute("output.value", json!("3 flights found"));
        collector.record_span(&span);

        let step = &collector.trace("t1").unwrap().steps[0];
        assert_eq!(step.kind, StepKind::ToolCall);
        assert_eq!(step.tool_name.as_deref(), Some("search_flights"));
        let args = step.tool_args.as_ref().unwrap();
        assert_eq!(args["from"], json!("NYC"));
        assert_eq!(args["to"], json!("LA"));
    }

    #[test]
    fn opaque_tool_arguments_are_wrapped() {
        let collector = SpanCollector::new();
        let span = SpanData::new("t1", "s1", "tool")
            .with_kind("TOOL")
            .with_attribute("tool.name", json!("echo"))
            .with_attribute("input.value", json!("not json at all"));
        collector.record_span(&span);

        let step = &collector.trace("t1").unwrap().steps[0];
        let args = step.tool_args.as_ref().unwrap();
        assert_eq!(args["input"], json!("not json at all"));
    }

    #[test]
    fn retrieval_spans_become_tagged_tool_calls() {
        let collector = SpanCollector::new();
        let span = SpanData::new("t1", "s1", "retrieve")
            .with_kind("RETRIEVER")
            .with_attribute("input.value", json!("similar docs"));
        collector.record_span(&span);

        let step = &collector.trace("t1").unwrap().steps[0];
        assert_eq!(step.kind, StepKind::ToolCall);
        assert_eq!(step.tool_name.as_deref(), Some("retriever"));
        assert_eq!(step.metadata["span_kind"], json!("RETRIEVER"));
    }

    #[test]
    fn guardrail_and_nested_chain_become_reasoning() {
        let collector = SpanCollector::new();
        collector.record_span(
            &SpanData::new("t1", "s1", "guard")
                .with_kind("GUARDRAIL")
                .with_attribute("output.value", json!("blocked")),
        );
        collector.record_span(
            &SpanData::new("t1", "s2", "subchain")
                .with_kind("CHAIN")
                .with_parent("root")
                .with_attribute("output.value", json!("partial result")),
        );

        let trace = collector.trace("t1").unwrap();
        assert_eq!(trace.steps.len(), 2);
        assert_eq!(trace.steps[0].kind, StepKind::Reasoning);
        assert_eq!(
            trace.steps[0].reasoning_text.as_deref(),
            Some("Guardrail check: blocked")
        );
        assert_eq!(
            trace.steps[1].reasoning_text.as_deref(),
            Some("Chain: subchain - partial result")
        );
    }

    #[test]
    fn span_error_becomes_step_failure() {
        let collector = SpanCollector::new();
        let span = SpanData::new("t1", "s1", "tool")
            .with_kind("TOOL")
            .with_attribute("tool.name", json!("search"))
            .with_error("connection refused");
        collector.record_span(&span);

        let step = &collector.trace("t1").unwrap().steps[0];
        assert_eq!(step.status, StepStatus::Failure);
        assert_eq!(step.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn traces_are_grouped_by_trace_id() {
        let collector = SpanCollector::new();
        collector.record_span(&root_span("t1"));
        collector.record_span(
            &SpanData::new("t2", "s1", "tool")
                .with_kind("TOOL")
                .with_attribute("tool.name", json!("search")),
        );
        collector.record_span(
            &SpanData::new("t1", "s2", "tool")
                .with_kind("TOOL")
                .with_attribute("tool.name", json!("book")),
        );

        let all = collector.all_traces();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "t1");
        assert_eq!(all[1].id, "t2");
        assert_eq!(collector.trace("t1").unwrap().tools_called(), vec!["book"]);
        assert_eq!(collector.latest_trace().unwrap().id, "t2");
    }

    #[test]
    fn reset_isolates_consecutive_runs() {
        let collector = SpanCollector::new();
        collector.record_span(&root_span("t1"));
        collector.record_span(
            &SpanData::new("t1", "s1", "tool")
                .with_kind("TOOL")
                .with_attribute("tool.name", json!("search")),
        );

        collector.reset();
        assert!(collector.all_traces().is_empty());
        assert!(collector.latest_trace().is_none());

        collector.record_span(&root_span("t2"));
        let all = collector.all_traces();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "t2");
        assert!(all[0].steps.is_empty());
    }
}
