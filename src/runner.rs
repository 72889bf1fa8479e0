use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::case::EvalSuite;
use crate::config::PruefwerkConfig;
use crate::evaluator::{AgentUnderTest, Evaluator, ResultObserver, SuiteOptions};
use crate::results::{EvaluationResult, GradeStatus, RunResult};
use crate::trace::Trace;
use crate::EvalError;

/// High-level driver: discovers suites from configuration, evaluates each
/// one, and aggregates a run result.
pub struct EvaluationRunner {
    config: PruefwerkConfig,
    evaluator: Evaluator,
}

impl EvaluationRunner {
    pub fn new(config: PruefwerkConfig) -> Self {
        let evaluator = Evaluator::new().with_defaults(config.graders.clone());
        Self { config, evaluator }
    }

    pub fn config(&self) -> &PruefwerkConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Discover test suites: explicitly configured paths first, otherwise
    /// subdirectories of the test directory (or the directory itself when
    /// it has no subdirectories).
    pub fn discover_suites(&self) -> Result<Vec<EvalSuite>, EvalError> {
        let mut suites = Vec::new();

        if !self.config.suites.is_empty() {
            for suite_config in &self.config.suites {
                let path = PathBuf::from(&suite_config.path);
                if path.is_dir() {
                    suites.push(EvalSuite::from_directory(&path, Some(&suite_config.name))?);
                }
            }
        } else {
            let test_dir = Path::new(&self.config.test_dir);
            if test_dir.is_dir() {
                let mut subdirs: Vec<PathBuf> = std::fs::read_dir(test_dir)?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| path.is_dir())
                    .collect();
                subdirs.sort();

                if subdirs.is_empty() {
                    suites.push(EvalSuite::from_directory(test_dir, Some("default"))?);
                } else {
                    for subdir in subdirs {
                        suites.push(EvalSuite::from_directory(&subdir, None)?);
                    }
                }
            }
        }

        if suites.is_empty() {
            return Err(EvalError::NoSuites(PathBuf::from(&self.config.test_dir)));
        }

        Ok(suites)
    }

    fn suite_options(&self, max_concurrent: Option<usize>) -> SuiteOptions {
        let workers = max_concurrent.unwrap_or(self.config.execution.workers);
        let mut options = SuiteOptions::new().with_max_concurrent(workers);
        if self.config.execution.timeout_secs > 0.0 {
            options = options.with_timeout(Duration::from_secs_f64(self.config.execution.timeout_secs));
        }
        options
    }

    /// Run the agent against every suite. Configuration problems (no
    /// suites at all) abort before any test case starts.
    pub async fn run(
        &self,
        suites: Option<Vec<EvalSuite>>,
        agent: &dyn AgentUnderTest,
        tags: Option<&[String]>,
        on_result: Option<ResultObserver<'_>>,
        max_concurrent: Option<usize>,
    ) -> Result<RunResult, EvalError> {
        let mut suites = match suites {
            Some(suites) => suites,
            None => self.discover_suites()?,
        };

        if let Some(tags) = tags {
            if !tags.is_empty() {
                suites = suites
                    .iter()
                    .map(|suite| suite.filter_by_tags(tags))
                    .collect();
            }
        }

        let options = self.suite_options(max_concurrent);
        let mut run_result = RunResult::new();

        for suite in &suites {
            if suite.test_cases.is_empty() {
                continue;
            }
            tracing::info!(suite = %suite.name, cases = suite.test_cases.len(), "evaluating suite");
            let suite_result = self
                .evaluator
                .evaluate_suite(suite, agent, &options, on_result)
                .await;
            run_result.add_suite(suite_result);
        }

        run_result.finish();
        Ok(run_result)
    }

    /// Replay mode: grade already-recorded traces, keyed by test case
    /// name, without invoking any agent. Cases with no recorded trace are
    /// reported as errors.
    pub async fn grade_traces(
        &self,
        suites: &[EvalSuite],
        traces: &HashMap<String, Trace>,
        on_result: Option<ResultObserver<'_>>,
    ) -> RunResult {
        let mut run_result = RunResult::new();

        for suite in suites {
            if suite.test_cases.is_empty() {
                continue;
            }

            let mut suite_result = crate::results::SuiteResult::new(&suite.name);
            for case in &suite.test_cases {
                let result = match traces.get(&case.name) {
                    Some(trace) => self.evaluator.evaluate(trace, case).await,
                    None => {
                        let mut missing = EvaluationResult::new(&case.name);
                        missing.status = GradeStatus::Error;
                        missing.error = Some("no recorded trace for test case".to_string());
                        missing.finish();
                        missing
                    }
                };
                if let Some(observer) = on_result {
                    observer(&result);
                }
                suite_result.add_result(result);
            }
            suite_result.finish();
            run_result.add_suite(suite_result);
        }

        run_result.finish();
        run_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{EvalCase, ExpectedBehavior, Turn};

    fn config_without_suites() -> PruefwerkConfig {
        PruefwerkConfig {
            test_dir: "/definitely/not/a/real/dir".to_string(),
            ..PruefwerkConfig::default()
        }
    }

    #[test]
    fn missing_suites_abort_before_execution() {
        let runner = EvaluationRunner::new(config_without_suites());
        let error = runner.discover_suites().unwrap_err();
        assert!(matches!(error, EvalError::NoSuites(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replay_grades_recorded_traces() {
        let runner = EvaluationRunner::new(PruefwerkConfig::default());

        let suite = EvalSuite::new("replay")
            .with_case(EvalCase::for_turn(
                "greets",
                Turn::new("say hello").with_expected(ExpectedBehavior {
                    output_contains: Some(vec!["hello".to_string()]),
                    ..ExpectedBehavior::default()
                }),
            ))
            .with_case(EvalCase::new("missing").with_turn(Turn::new("no trace recorded")));

        let mut traces = HashMap::new();
        traces.insert(
            "greets".to_string(),
            Trace::new("say hello").with_output("Hello there!"),
        );

        let run = runner.grade_traces(&[suite], &traces, None).await;
        assert_eq!(run.total(), 2);
        assert_eq!(run.passed(), 1);
        assert_eq!(run.errored(), 1);
        assert_eq!(run.suites[0].results[0].test_case, "greets");
        assert_eq!(run.suites[0].results[1].test_case, "missing");
    }
}
