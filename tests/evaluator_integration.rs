use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pruefwerk::{
    AgentUnderTest, EvalCase, EvalError, EvalSuite, Evaluator, ExpectedBehavior, GradeStatus,
    Message, SuiteOptions, SyncAgent, Trace, TraceStatus, Turn,
};

/// Echoes the user message back as output and counts invocations.
struct EchoAgent {
    invocations: AtomicUsize,
    history_lengths: Mutex<Vec<usize>>,
}

impl EchoAgent {
    fn new() -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            history_lengths: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentUnderTest for EchoAgent {
    async fn invoke(&self, input: &str, history: &[Message]) -> Result<Trace, EvalError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.history_lengths.lock().unwrap().push(history.len());
        let mut trace = Trace::new(input);
        trace.complete(input.to_string(), TraceStatus::Success);
        Ok(trace)
    }
}

fn expect_contains(value: &str) -> ExpectedBehavior {
    ExpectedBehavior {
        output_contains: Some(vec![value.to_string()]),
        ..ExpectedBehavior::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fail_fast_skips_remaining_turns_without_invoking_the_agent() {
    let case = EvalCase::new("three_turns")
        .with_turn(Turn::new("alpha").with_expected(expect_contains("alpha")))
        .with_turn(Turn::new("beta").with_expected(expect_contains("something else entirely")))
        .with_turn(Turn::new("gamma").with_expected(expect_contains("gamma")));

    let agent = EchoAgent::new();
    let result = Evaluator::new()
        .evaluate_case(&case, &agent, &SuiteOptions::default())
        .await;

    let statuses: Vec<GradeStatus> = result.turns.iter().map(|turn| turn.status).collect();
    assert_eq!(
        statuses,
        vec![GradeStatus::Pass, GradeStatus::Fail, GradeStatus::Skip]
    );
    assert!(result.turns[2].skipped);
    // The third turn never reached the agent.
    assert_eq!(agent.invocations.load(Ordering::SeqCst), 2);
    assert_eq!(result.status, GradeStatus::Fail);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn history_accumulates_across_turns() {
    let case = EvalCase::new("two_turns")
        .with_turn(Turn::new("first"))
        .with_turn(Turn::new("second"));

    let agent = EchoAgent::new();
    let result = Evaluator::new()
        .evaluate_case(&case, &agent, &SuiteOptions::default())
        .await;

    assert!(result.passed());
    let lengths = agent.history_lengths.lock().unwrap().clone();
    // Empty on turn one, then user + assistant from turn one.
    assert_eq!(lengths, vec![0, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agent_error_marks_turn_errored_and_skips_the_rest() {
    struct FailingAgent;

    #[async_trait]
    impl AgentUnderTest for FailingAgent {
        async fn invoke(&self, _input: &str, _history: &[Message]) -> Result<Trace, EvalError> {
            Err(EvalError::Agent("model backend unreachable".to_string()))
        }
    }

    let case = EvalCase::new("errors")
        .with_turn(Turn::new("first"))
        .with_turn(Turn::new("second"));

    let result = Evaluator::new()
        .evaluate_case(&case, &FailingAgent, &SuiteOptions::default())
        .await;

    assert_eq!(result.status, GradeStatus::Error);
    assert_eq!(result.turns[0].status, GradeStatus::Error);
    assert_eq!(result.turns[0].grades[0].grader, "execution");
    assert_eq!(result.turns[1].status, GradeStatus::Skip);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_agent_times_out_as_an_error() {
    struct SlowAgent;

    #[async_trait]
    impl AgentUnderTest for SlowAgent {
        async fn invoke(&self, input: &str, _history: &[Message]) -> Result<Trace, EvalError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Trace::new(input))
        }
    }

    let case = EvalCase::new("slow").with_turn(Turn::new("hurry up")).with_timeout(0.05);

    let result = Evaluator::new()
        .evaluate_case(&case, &SlowAgent, &SuiteOptions::default())
        .await;

    assert_eq!(result.status, GradeStatus::Error);
    let message = result.turns[0].grades[0].message.as_deref().unwrap();
    assert!(message.contains("timed out"), "unexpected message: {message}");
}

/// Completes in reverse declaration order; the result list must not.
struct StaggeredAgent;

#[async_trait]
impl AgentUnderTest for StaggeredAgent {
    async fn invoke(&self, input: &str, _history: &[Message]) -> Result<Trace, EvalError> {
        let index: u64 = input.trim_start_matches("case_").parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis((8 - index) * 15)).await;
        let mut trace = Trace::new(input);
        trace.complete(input.to_string(), TraceStatus::Success);
        Ok(trace)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suite_results_preserve_declaration_order() {
    let mut suite = EvalSuite::new("ordering");
    for index in 0..8 {
        suite = suite.with_case(EvalCase::for_turn(
            format!("case_{index}"),
            Turn::new(format!("case_{index}")),
        ));
    }

    let completion_order = Mutex::new(Vec::new());
    let observer = |result: &pruefwerk::EvaluationResult| {
        completion_order.lock().unwrap().push(result.test_case.clone());
    };

    let result = Evaluator::new()
        .evaluate_suite(&suite, &StaggeredAgent, &SuiteOptions::default(), Some(&observer))
        .await;

    let names: Vec<&str> = result.results.iter().map(|r| r.test_case.as_str()).collect();
    assert_eq!(
        names,
        (0..8).map(|i| format!("case_{i}")).collect::<Vec<_>>(),
        "results must be reindexed to declaration order"
    );

    // The observer fired once per case, in completion order, which under
    // unbounded concurrency is the reverse of declaration order.
    let observed = completion_order.lock().unwrap().clone();
    assert_eq!(observed.len(), 8);
    assert_eq!(observed[0], "case_7");
}

struct CountingAgent {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingAgent {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AgentUnderTest for CountingAgent {
    async fn invoke(&self, input: &str, _history: &[Message]) -> Result<Trace, EvalError> {
        let active = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        let mut trace = Trace::new(input);
        trace.complete("done", TraceStatus::Success);
        Ok(trace)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bounded_concurrency_never_exceeds_the_gate() {
    let mut suite = EvalSuite::new("bounded");
    for index in 0..6 {
        suite = suite.with_case(EvalCase::for_turn(
            format!("case_{index}"),
            Turn::new("go"),
        ));
    }

    let agent = CountingAgent::new();
    let options = SuiteOptions::new().with_max_concurrent(2);
    let result = Evaluator::new()
        .evaluate_suite(&suite, &agent, &options, None)
        .await;

    assert_eq!(result.total(), 6);
    assert_eq!(result.passed(), 6);
    assert!(
        agent.peak.load(Ordering::SeqCst) <= 2,
        "observed {} simultaneous invocations",
        agent.peak.load(Ordering::SeqCst)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_failing_case_does_not_abort_its_siblings() {
    struct SelectiveAgent;

    #[async_trait]
    impl AgentUnderTest for SelectiveAgent {
        async fn invoke(&self, input: &str, _history: &[Message]) -> Result<Trace, EvalError> {
            if input == "boom" {
                return Err(EvalError::Agent("kaboom".to_string()));
            }
            let mut trace = Trace::new(input);
            trace.complete("fine", TraceStatus::Success);
            Ok(trace)
        }
    }

    let suite = EvalSuite::new("isolation")
        .with_case(EvalCase::for_turn("ok_one", Turn::new("hello")))
        .with_case(EvalCase::for_turn("fails", Turn::new("boom")))
        .with_case(EvalCase::for_turn("ok_two", Turn::new("hello again")));

    let result = Evaluator::new()
        .evaluate_suite(&suite, &SelectiveAgent, &SuiteOptions::default(), None)
        .await;

    assert_eq!(result.total(), 3);
    assert_eq!(result.results[0].status, GradeStatus::Pass);
    assert_eq!(result.results[1].status, GradeStatus::Error);
    assert_eq!(result.results[2].status, GradeStatus::Pass);
    assert_eq!(result.passed(), 2);
    assert_eq!(result.errored(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_agent_functions_are_adapted_off_the_scheduler() {
    let agent = SyncAgent::new(|input: String, history: Vec<Message>| {
        // A deliberately blocking body.
        std::thread::sleep(Duration::from_millis(10));
        let mut trace = Trace::new(input.clone());
        trace.complete(
            format!("{input} (saw {} prior messages)", history.len()),
            TraceStatus::Success,
        );
        Ok(trace)
    });

    let case = EvalCase::for_turn(
        "sync",
        Turn::new("ping").with_expected(ExpectedBehavior {
            output_contains: Some(vec!["ping".to_string()]),
            task_completed: Some(true),
            ..ExpectedBehavior::default()
        }),
    );

    let result = Evaluator::new()
        .evaluate_case(&case, &agent, &SuiteOptions::default())
        .await;

    assert!(result.passed(), "grades: {:?}", result.turns[0].grades);
}
