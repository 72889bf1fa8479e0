pub mod case;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod graders;
pub mod metrics;
pub mod otel;
pub mod providers;
pub mod results;
pub mod runner;
pub mod trace;

pub use case::{EvalCase, EvalSuite, ExpectedBehavior, GraderConfig, Turn};
pub use config::{
    ExecutionConfig, GraderDefaults, PruefwerkConfig, SuiteConfig, ThresholdConfig,
};
pub use error::EvalError;
pub use evaluator::{
    AgentUnderTest, AsyncAgent, Evaluator, ResultObserver, SuiteOptions, SyncAgent,
};
pub use graders::{
    CompositeGrader, ContainsGrader, EqualsGrader, Grader, LlmGrader, LlmRubricGrader,
    MaxLlmCallsGrader, MaxStepsGrader, MaxToolCallsGrader, NotContainsGrader, RegexGrader,
    TaskCompletedGrader, ToolCalledGrader, ToolNotCalledGrader, ToolOrderGrader,
};
pub use metrics::{
    default_metrics, DurationMetric, ErrorRateMetric, LlmCallCountMetric, Metric,
    StepCountMetric, StepEfficiencyMetric, TokenUsageMetric, ToolCallCountMetric,
    ToolDiversityMetric,
};
pub use otel::{SpanCollector, SpanData, SpanStatus};
pub use providers::ChatProvider;
pub use results::{
    EvaluationResult, GradeResult, GradeStatus, MetricResult, RunResult, SuiteResult, TurnResult,
};
pub use runner::EvaluationRunner;
pub use trace::{
    Message, MessageRole, Step, StepKind, StepStatus, TokenUsage, Trace, TraceStatus,
};
