use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::case::{EvalCase, EvalSuite, Turn};
use crate::config::GraderDefaults;
use crate::graders::{graders_for_turn, Grader};
use crate::metrics::{default_metrics, Metric};
use crate::results::{
    EvaluationResult, GradeResult, GradeStatus, MetricResult, SuiteResult, TurnResult,
};
use crate::trace::{Message, Trace};
use crate::EvalError;

/// The function under test: takes the user message for one turn plus the
/// conversation so far, and returns the execution record it produced.
#[async_trait]
pub trait AgentUnderTest: Send + Sync {
    async fn invoke(&self, input: &str, history: &[Message]) -> Result<Trace, EvalError>;
}

/// Adapter for a synchronous agent function. The call runs on the
/// blocking pool so it cannot stall the cooperative scheduler; a panic in
/// the function surfaces as an agent error, not a crash.
pub struct SyncAgent<F> {
    func: std::sync::Arc<F>,
}

impl<F> SyncAgent<F>
where
    F: Fn(String, Vec<Message>) -> Result<Trace, EvalError> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: std::sync::Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> AgentUnderTest for SyncAgent<F>
where
    F: Fn(String, Vec<Message>) -> Result<Trace, EvalError> + Send + Sync + 'static,
{
    async fn invoke(&self, input: &str, history: &[Message]) -> Result<Trace, EvalError> {
        let func = std::sync::Arc::clone(&self.func);
        let input = input.to_string();
        let history = history.to_vec();
        tokio::task::spawn_blocking(move || func(input, history))
            .await
            .map_err(|err| EvalError::Agent(format!("agent task failed: {err}")))?
    }
}

/// Adapter for an asynchronous agent function.
pub struct AsyncAgent<F> {
    func: F,
}

impl<F> AsyncAgent<F>
where
    F: Fn(String, Vec<Message>) -> BoxFuture<'static, Result<Trace, EvalError>> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> AgentUnderTest for AsyncAgent<F>
where
    F: Fn(String, Vec<Message>) -> BoxFuture<'static, Result<Trace, EvalError>> + Send + Sync,
{
    async fn invoke(&self, input: &str, history: &[Message]) -> Result<Trace, EvalError> {
        (self.func)(input.to_string(), history.to_vec()).await
    }
}

/// Options for a suite run.
#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    /// Maximum concurrent test cases. 0 = unbounded.
    pub max_concurrent: usize,
    /// Default per-test timeout; a case's own timeout takes precedence.
    pub timeout: Option<Duration>,
}

impl SuiteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Observer invoked once per completed test case, as soon as the result
/// is available.
pub type ResultObserver<'a> = &'a (dyn Fn(&EvaluationResult) + Send + Sync);

/// The evaluation engine: grades traces against test cases, drives
/// multi-turn conversations, and runs suites with bounded concurrency.
pub struct Evaluator {
    graders: Option<Vec<Box<dyn Grader>>>,
    metrics: Vec<Box<dyn Metric>>,
    defaults: GraderDefaults,
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            graders: None,
            metrics: default_metrics(),
            defaults: GraderDefaults::default(),
        }
    }

    /// Replace the per-turn grader resolution with a fixed grader list.
    /// Applies to the single-trace `evaluate` path; multi-turn runs always
    /// resolve graders per turn.
    pub fn with_graders(mut self, graders: Vec<Box<dyn Grader>>) -> Self {
        self.graders = Some(graders);
        self
    }

    pub fn with_metrics(mut self, metrics: Vec<Box<dyn Metric>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_defaults(mut self, defaults: GraderDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Evaluate a single already-recorded trace against a test case.
    /// Grades against the first turn's expectations.
    pub async fn evaluate(&self, trace: &Trace, case: &EvalCase) -> EvaluationResult {
        let timer = Instant::now();
        let mut result = EvaluationResult::new(&case.name);
        result.trace_id = Some(trace.id.clone());

        let Some(turn) = case.turns.first() else {
            result.status = GradeStatus::Error;
            result.error = Some("test case has no turns defined".to_string());
            result.finish();
            return result;
        };

        let built;
        let graders: &[Box<dyn Grader>] = match &self.graders {
            Some(explicit) => explicit,
            None => {
                built = graders_for_turn(turn.expected.as_ref(), &turn.graders, &self.defaults);
                &built
            }
        };

        let mut turn_result = TurnResult::new(0, &turn.user).with_trace_id(trace.id.clone());
        for grade in run_graders(graders, trace, case).await {
            turn_result.add_grade(grade);
        }
        for metric in self.run_metrics(trace, Some(case)).await {
            turn_result.add_metric(metric);
        }
        turn_result.duration_ms = Some(timer.elapsed().as_secs_f64() * 1_000.0);

        result.add_turn(turn_result);
        result.finish();
        result
    }

    /// Drive a test case to completion: invoke the agent per turn, grade
    /// each response, fail fast on the first turn that is not a pass.
    pub async fn evaluate_case(
        &self,
        case: &EvalCase,
        agent: &dyn AgentUnderTest,
        options: &SuiteOptions,
    ) -> EvaluationResult {
        let mut result = EvaluationResult::new(&case.name);

        if case.turns.is_empty() {
            result.status = GradeStatus::Error;
            result.error = Some("test case has no turns defined".to_string());
            result.finish();
            return result;
        }

        let timeout = case
            .timeout
            .map(Duration::from_secs_f64)
            .or(options.timeout);

        let mut history: Vec<Message> = Vec::new();

        for (turn_index, turn) in case.turns.iter().enumerate() {
            let turn_timer = Instant::now();

            let invocation = agent.invoke(&turn.user, &history);
            let trace = match timeout {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EvalError::AgentTimeout(limit.as_secs_f64())),
                },
                None => invocation.await,
            };

            match trace {
                Ok(trace) => {
                    let mut turn_result = self.grade_turn(&trace, turn, turn_index, case).await;
                    turn_result.duration_ms = Some(turn_timer.elapsed().as_secs_f64() * 1_000.0);

                    // History grows regardless of the verdict so later
                    // turns see full context.
                    history.push(Message::user(&turn.user));
                    history.push(Message::assistant(trace.output.clone().unwrap_or_default()));

                    let halted = !turn_result.passed();
                    result.add_turn(turn_result);

                    if halted {
                        self.skip_remaining(&mut result, case, turn_index + 1);
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(case = %case.name, turn = turn_index, error = %err, "agent invocation failed");
                    let mut turn_result = TurnResult::new(turn_index, &turn.user);
                    turn_result
                        .add_grade(GradeResult::error("execution", format!("agent error: {err}")));
                    turn_result.duration_ms = Some(turn_timer.elapsed().as_secs_f64() * 1_000.0);
                    result.add_turn(turn_result);

                    self.skip_remaining(&mut result, case, turn_index + 1);
                    break;
                }
            }
        }

        result.finish();
        result
    }

    /// Evaluate every test case in a suite with bounded concurrency.
    ///
    /// One case erroring never aborts its siblings, the observer fires
    /// once per case in completion order, and the returned results are
    /// reindexed to declaration order.
    pub async fn evaluate_suite(
        &self,
        suite: &EvalSuite,
        agent: &dyn AgentUnderTest,
        options: &SuiteOptions,
        on_result: Option<ResultObserver<'_>>,
    ) -> SuiteResult {
        let mut suite_result = SuiteResult::new(&suite.name);

        let semaphore = if options.max_concurrent > 0 {
            Some(Semaphore::new(options.max_concurrent))
        } else {
            None
        };

        let mut pending = FuturesUnordered::new();
        for (index, case) in suite.test_cases.iter().enumerate() {
            let semaphore = semaphore.as_ref();
            pending.push(async move {
                let _permit = match semaphore {
                    Some(gate) => Some(gate.acquire().await.expect("admission gate closed")),
                    None => None,
                };
                let result = self.evaluate_case(case, agent, options).await;
                if let Some(observer) = on_result {
                    observer(&result);
                }
                (index, result)
            });
        }

        let mut slots: Vec<Option<EvaluationResult>> = Vec::new();
        slots.resize_with(suite.test_cases.len(), || None);
        while let Some((index, result)) = pending.next().await {
            slots[index] = Some(result);
        }

        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(result) => suite_result.add_result(result),
                None => {
                    let mut missing = EvaluationResult::new(&suite.test_cases[index].name);
                    missing.status = GradeStatus::Error;
                    missing.error = Some("test execution failed unexpectedly".to_string());
                    missing.finish();
                    suite_result.add_result(missing);
                }
            }
        }

        suite_result.finish();
        suite_result
    }

    async fn grade_turn(
        &self,
        trace: &Trace,
        turn: &Turn,
        turn_index: usize,
        case: &EvalCase,
    ) -> TurnResult {
        let mut turn_result =
            TurnResult::new(turn_index, &turn.user).with_trace_id(trace.id.clone());

        let graders = graders_for_turn(turn.expected.as_ref(), &turn.graders, &self.defaults);
        let view = EvalCase::for_turn(format!("{}#turn_{turn_index}", case.name), turn.clone());

        // A turn with no assertions is a response-collection step, not a
        // failure; graders run concurrently otherwise.
        if !graders.is_empty() {
            for grade in run_graders(&graders, trace, &view).await {
                turn_result.add_grade(grade);
            }
        }

        for metric in self.run_metrics(trace, Some(&view)).await {
            turn_result.add_metric(metric);
        }

        turn_result
    }

    async fn run_metrics(&self, trace: &Trace, case: Option<&EvalCase>) -> Vec<MetricResult> {
        let futures = self.metrics.iter().map(|metric| async move {
            match metric.measure_async(trace, case).await {
                Ok(result) => Some(result),
                Err(err) => {
                    // Metrics are best-effort; a broken one never fails
                    // the evaluation.
                    tracing::debug!(metric = metric.name(), error = %err, "metric dropped");
                    None
                }
            }
        });
        join_all(futures).await.into_iter().flatten().collect()
    }

    fn skip_remaining(&self, result: &mut EvaluationResult, case: &EvalCase, from: usize) {
        for skip_index in from..case.turns.len() {
            result.add_turn(TurnResult::skipped(skip_index, &case.turns[skip_index].user));
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_graders(
    graders: &[Box<dyn Grader>],
    trace: &Trace,
    case: &EvalCase,
) -> Vec<GradeResult> {
    let futures = graders.iter().map(|grader| async move {
        grader
            .grade_async(trace, case)
            .await
            .unwrap_or_else(|err| GradeResult::error(grader.name(), format!("grader error: {err}")))
    });
    join_all(futures).await
}
