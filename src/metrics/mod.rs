use async_trait::async_trait;
use serde_json::json;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::case::EvalCase;
use crate::results::MetricResult;
use crate::trace::{StepStatus, Trace};
use crate::EvalError;

/// A pluggable measurement against an execution trace.
///
/// The structural dual of a grader, except that metrics never fail an
/// evaluation: the orchestrator drops a metric that returns `Err` instead
/// of surfacing it.
#[async_trait]
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    fn measure(&self, trace: &Trace, case: Option<&EvalCase>) -> Result<MetricResult, EvalError>;

    async fn measure_async(
        &self,
        trace: &Trace,
        case: Option<&EvalCase>,
    ) -> Result<MetricResult, EvalError> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.measure(trace, case))
            }
            _ => self.measure(trace, case),
        }
    }
}

/// The default metric set applied to every evaluation.
pub fn default_metrics() -> Vec<Box<dyn Metric>> {
    vec![
        Box::new(StepCountMetric),
        Box::new(TokenUsageMetric),
        Box::new(ToolCallCountMetric),
        Box::new(DurationMetric),
    ]
}

/// Total number of steps in the trace.
pub struct StepCountMetric;

#[async_trait]
impl Metric for StepCountMetric {
    fn name(&self) -> &str {
        "step_count"
    }

    fn measure(&self, trace: &Trace, _case: Option<&EvalCase>) -> Result<MetricResult, EvalError> {
        Ok(MetricResult::new(self.name(), trace.step_count() as f64).with_unit("steps"))
    }
}

/// Total token usage across all model calls.
pub struct TokenUsageMetric;

#[async_trait]
impl Metric for TokenUsageMetric {
    fn name(&self) -> &str {
        "token_usage"
    }

    fn measure(&self, trace: &Trace, _case: Option<&EvalCase>) -> Result<MetricResult, EvalError> {
        Ok(MetricResult::new(self.name(), trace.total_tokens() as f64)
            .with_unit("tokens")
            .with_detail("llm_calls", json!(trace.llm_calls().len())))
    }
}

/// Number of tool calls, with the tool names as detail.
pub struct ToolCallCountMetric;

#[async_trait]
impl Metric for ToolCallCountMetric {
    fn name(&self) -> &str {
        "tool_call_count"
    }

    fn measure(&self, trace: &Trace, _case: Option<&EvalCase>) -> Result<MetricResult, EvalError> {
        Ok(MetricResult::new(self.name(), trace.tool_calls().len() as f64)
            .with_unit("calls")
            .with_detail("tools", json!(trace.tools_called())))
    }
}

/// Wall-clock duration of the trace.
pub struct DurationMetric;

#[async_trait]
impl Metric for DurationMetric {
    fn name(&self) -> &str {
        "duration"
    }

    fn measure(&self, trace: &Trace, _case: Option<&EvalCase>) -> Result<MetricResult, EvalError> {
        Ok(MetricResult::new(self.name(), trace.duration_ms.unwrap_or(0.0)).with_unit("ms"))
    }
}

/// Unique tool names divided by total tool calls; 0 when none were made.
pub struct ToolDiversityMetric;

#[async_trait]
impl Metric for ToolDiversityMetric {
    fn name(&self) -> &str {
        "tool_diversity"
    }

    fn measure(&self, trace: &Trace, _case: Option<&EvalCase>) -> Result<MetricResult, EvalError> {
        let tools = trace.tools_called();
        if tools.is_empty() {
            return Ok(MetricResult::new(self.name(), 0.0).with_unit("ratio"));
        }

        let unique: std::collections::HashSet<&str> = tools.iter().copied().collect();
        let diversity = unique.len() as f64 / tools.len() as f64;

        Ok(MetricResult::new(self.name(), diversity)
            .with_unit("ratio")
            .with_detail("unique_tools", json!(unique.len()))
            .with_detail("total_calls", json!(tools.len())))
    }
}

/// Graceful degradation score against the configured step ceiling:
/// 1.0 at or under budget, ceiling/actual when exceeded.
pub struct StepEfficiencyMetric;

#[async_trait]
impl Metric for StepEfficiencyMetric {
    fn name(&self) -> &str {
        "step_efficiency"
    }

    fn measure(&self, trace: &Trace, case: Option<&EvalCase>) -> Result<MetricResult, EvalError> {
        let actual = trace.step_count();
        let max_steps = case
            .and_then(EvalCase::expected)
            .and_then(|expected| expected.max_steps);

        let Some(max_steps) = max_steps else {
            return Ok(MetricResult::new(self.name(), 1.0)
                .with_unit("ratio")
                .with_detail("actual_steps", json!(actual))
                .with_detail("max_steps", json!(null)));
        };

        let efficiency = if actual <= max_steps {
            1.0
        } else {
            max_steps as f64 / actual as f64
        };

        Ok(MetricResult::new(self.name(), efficiency)
            .with_unit("ratio")
            .with_detail("actual_steps", json!(actual))
            .with_detail("max_steps", json!(max_steps)))
    }
}

/// Number of model calls.
pub struct LlmCallCountMetric;

#[async_trait]
impl Metric for LlmCallCountMetric {
    fn name(&self) -> &str {
        "llm_call_count"
    }

    fn measure(&self, trace: &Trace, _case: Option<&EvalCase>) -> Result<MetricResult, EvalError> {
        Ok(MetricResult::new(self.name(), trace.llm_calls().len() as f64).with_unit("calls"))
    }
}

/// Fraction of steps with failure status; 0 when the trace has no steps.
pub struct ErrorRateMetric;

#[async_trait]
impl Metric for ErrorRateMetric {
    fn name(&self) -> &str {
        "error_rate"
    }

    fn measure(&self, trace: &Trace, _case: Option<&EvalCase>) -> Result<MetricResult, EvalError> {
        if trace.steps.is_empty() {
            return Ok(MetricResult::new(self.name(), 0.0).with_unit("ratio"));
        }

        let errors = trace
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Failure)
            .count();
        let rate = errors as f64 / trace.steps.len() as f64;

        Ok(MetricResult::new(self.name(), rate)
            .with_unit("ratio")
            .with_detail("error_count", json!(errors))
            .with_detail("total_steps", json!(trace.steps.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{ExpectedBehavior, Turn};
    use crate::trace::{Step, TokenUsage};
    use serde_json::Map;

    fn trace_with_tools(tools: &[&str]) -> Trace {
        let mut trace = Trace::new("input");
        for tool in tools {
            trace.add_step(Step::tool_call(*tool, Map::new(), None));
        }
        trace
    }

    #[test]
    fn token_usage_sums_model_calls() {
        let mut trace = Trace::new("input");
        trace.add_step(Step::llm_call("m", "a", "b", Some(TokenUsage::new(100, 50, 150))));
        trace.add_step(Step::llm_call("m", "c", "d", Some(TokenUsage::new(20, 10, 30))));

        let result = TokenUsageMetric.measure(&trace, None).expect("measure");
        assert_eq!(result.value, 180.0);
        assert_eq!(result.details["llm_calls"], json!(2));
    }

    #[test]
    fn tool_diversity_counts_unique_names() {
        let trace = trace_with_tools(&["search", "search", "book", "search"]);
        let result = ToolDiversityMetric.measure(&trace, None).expect("measure");
        assert_eq!(result.value, 0.5);

        let empty = Trace::new("input");
        let result = ToolDiversityMetric.measure(&empty, None).expect("measure");
        assert_eq!(result.value, 0.0);
    }

    #[test]
    fn step_efficiency_degrades_gracefully() {
        let case = EvalCase::for_turn(
            "test",
            Turn::new("input").with_expected(ExpectedBehavior {
                max_steps: Some(4),
                ..ExpectedBehavior::default()
            }),
        );

        let within = trace_with_tools(&["a", "b"]);
        let result = StepEfficiencyMetric
            .measure(&within, Some(&case))
            .expect("measure");
        assert_eq!(result.value, 1.0);

        let over = trace_with_tools(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let result = StepEfficiencyMetric
            .measure(&over, Some(&case))
            .expect("measure");
        assert_eq!(result.value, 0.5);
    }

    #[test]
    fn step_efficiency_without_ceiling_is_one() {
        let trace = trace_with_tools(&["a", "b", "c"]);
        let result = StepEfficiencyMetric.measure(&trace, None).expect("measure");
        assert_eq!(result.value, 1.0);
    }

    #[test]
    fn error_rate_counts_failed_steps() {
        let mut trace = Trace::new("input");
        trace.add_step(Step::tool_call("ok", Map::new(), None));
        trace.add_step(Step::tool_call("bad", Map::new(), None).with_error("exploded"));

        let result = ErrorRateMetric.measure(&trace, None).expect("measure");
        assert_eq!(result.value, 0.5);

        let empty = Trace::new("input");
        let result = ErrorRateMetric.measure(&empty, None).expect("measure");
        assert_eq!(result.value, 0.0);
    }

    #[test]
    fn default_set_has_four_metrics() {
        let metrics = default_metrics();
        let names: Vec<_> = metrics.iter().map(|metric| metric.name().to_string()).collect();
        assert_eq!(
            names,
            vec!["step_count", "token_usage", "tool_call_count", "duration"]
        );
    }
}
