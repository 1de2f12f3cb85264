//! Running the project's test suite.

use super::{last_line, StageContext, VerifyReport};
use crate::context::{ProvisionedEnvironment, StageLog};
use crate::errors::PipelineError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{info, warn};

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<outcome>PASSED|FAILED|ERROR|XFAIL|XPASS)\s+(?P<id>\S+)")
        .expect("summary regex is valid")
});

static VERBOSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<id>\S+::\S+)\s+(?P<outcome>PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)\b")
        .expect("verbose regex is valid")
});

/// Outcome of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    /// Passed (including unexpected passes).
    Passed,
    /// Failed an assertion.
    Failed,
    /// Errored during setup or teardown.
    Error,
    /// Skipped or expected failure.
    Skipped,
}

impl TestOutcome {
    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "PASSED" | "XPASS" => Some(Self::Passed),
            "FAILED" => Some(Self::Failed),
            "ERROR" => Some(Self::Error),
            "SKIPPED" | "XFAIL" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Returns true for failures and errors.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }

    fn severity(self) -> u8 {
        match self {
            Self::Skipped => 0,
            Self::Passed => 1,
            Self::Failed => 2,
            Self::Error => 3,
        }
    }
}

/// Per-test results of one suite run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    /// Outcome per test id.
    pub outcomes: BTreeMap<String, TestOutcome>,
    /// Exit code of the test command.
    pub exit_code: Option<i32>,
}

impl TestReport {
    /// Builds a report from test runner output.
    #[must_use]
    pub fn parse(output: &str, exit_code: Option<i32>) -> Self {
        let mut outcomes: BTreeMap<String, TestOutcome> = BTreeMap::new();
        for line in output.lines().map(str::trim) {
            let parsed = SUMMARY_RE
                .captures(line)
                .or_else(|| VERBOSE_RE.captures(line))
                .and_then(|caps| {
                    TestOutcome::from_marker(&caps["outcome"]).map(|o| (caps["id"].to_string(), o))
                });
            let Some((id, outcome)) = parsed else {
                continue;
            };
            outcomes
                .entry(id)
                .and_modify(|existing| {
                    if outcome.severity() > existing.severity() {
                        *existing = outcome;
                    }
                })
                .or_insert(outcome);
        }
        Self { outcomes, exit_code }
    }

    /// Number of passing tests.
    #[must_use]
    pub fn passed(&self) -> usize {
        self.outcomes.values().filter(|o| **o == TestOutcome::Passed).count()
    }

    /// Ids of failing or erroring tests.
    #[must_use]
    pub fn failing(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_failure())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns true if the suite exited cleanly with no failing test.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.exit_code == Some(0) && self.failing().is_empty()
    }
}

/// Runs the test suite inside the environment.
///
/// Requires the static verification report, so tests only ever run against
/// a verified tree. Tests are never retried.
///
/// # Errors
///
/// Returns [`PipelineError::TestFailure`] if any test fails or the suite
/// exits unsuccessfully.
pub async fn run_tests(
    ctx: &StageContext<'_>,
    env: &ProvisionedEnvironment,
    verified: &VerifyReport,
    log: &mut StageLog,
) -> Result<TestReport, PipelineError> {
    if !verified.is_clean() {
        return Err(PipelineError::Internal(
            "tests requested for a tree that failed static checks".into(),
        ));
    }

    let spec = env.command("test", &ctx.config.test.command)?;
    let output = ctx.run_command(log, &spec).await?;
    let report = TestReport::parse(&output.combined(), output.exit_code);
    log.set_details(serde_json::to_value(&report).unwrap_or_default());

    if report.all_passed() {
        info!(passed = report.passed(), "Test suite passed");
        return Ok(report);
    }

    let mut failing = report.failing();
    if failing.is_empty() {
        failing.push(format!(
            "test suite (exit code {:?}: {})",
            output.exit_code,
            last_line(&output)
        ));
    }
    warn!(failing = failing.len(), "Test suite failed");
    Err(PipelineError::TestFailure { failing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{provision, verify};
    use crate::errors::ErrorKind;
    use crate::testing::{assert_error_kind, ScriptedResponse, ScriptedRunner, StageHarness, TestProject};
    use pretty_assertions::assert_eq;

    const PYTEST_FAIL: &str = "\
tests/test_core.py::test_wraps_call PASSED                          [ 50%]
tests/test_core.py::test_guardrail FAILED                           [100%]
=========================== short test summary info ============================
PASSED tests/test_core.py::test_wraps_call
FAILED tests/test_core.py::test_guardrail - AssertionError: assert 1 == 2
========================= 1 failed, 1 passed in 0.12s ==========================";

    async fn run(runner: ScriptedRunner) -> (StageHarness, Result<TestReport, PipelineError>) {
        let dir = tempfile::tempdir().unwrap();
        let project = TestProject::default().write(dir.path()).unwrap();
        let h = StageHarness::new(project, runner);
        let ctx = h.ctx();
        let env = provision(&ctx, "3.11", &mut StageLog::new(1024)).await.unwrap();
        let verified = verify(&ctx, &env, &mut StageLog::new(1024)).await.unwrap();
        let result = run_tests(&ctx, &env, &verified, &mut StageLog::new(4096)).await;
        drop(dir);
        (h, result)
    }

    #[test]
    fn test_parse_report() {
        let report = TestReport::parse(PYTEST_FAIL, Some(1));

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failing(), vec!["tests/test_core.py::test_guardrail"]);
        assert!(!report.all_passed());
    }

    #[test]
    fn test_error_outranks_pass() {
        let report = TestReport::parse(
            "tests/t.py::test_a PASSED\nERROR tests/t.py::test_a - teardown failed",
            Some(1),
        );
        assert_eq!(report.outcomes["tests/t.py::test_a"], TestOutcome::Error);
    }

    #[tokio::test]
    async fn test_passing_suite() {
        let runner = ScriptedRunner::new().always(
            "test",
            ScriptedResponse::ok("PASSED tests/test_core.py::test_a\nPASSED tests/test_core.py::test_b"),
        );
        let (_h, result) = run(runner).await;

        let report = result.unwrap();
        assert_eq!(report.passed(), 2);
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn test_single_failing_test() {
        let runner = ScriptedRunner::new().always("test", ScriptedResponse::fail_with_stdout(1, PYTEST_FAIL));
        let (h, result) = run(runner).await;

        let Err(PipelineError::TestFailure { failing }) = result else {
            panic!("expected a test failure");
        };
        assert_eq!(failing, vec!["tests/test_core.py::test_guardrail"]);
        assert_eq!(h.runner.call_count("test"), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_parsed_failure() {
        let runner = ScriptedRunner::new().always("test", ScriptedResponse::fail(4, "ERROR: file or directory not found: tests"));
        let (_h, result) = run(runner).await;

        let Err(PipelineError::TestFailure { failing }) = result else {
            panic!("expected a test failure");
        };
        assert_eq!(failing.len(), 1);
        assert!(failing[0].starts_with("test suite"));
    }

    #[tokio::test]
    async fn test_missing_test_runner_is_command_failure() {
        let runner = ScriptedRunner::new().always("test", ScriptedResponse::unstartable("No such file or directory"));
        let (h, result) = run(runner).await;

        assert_error_kind(&result, ErrorKind::CommandFailed);
        assert_eq!(h.runner.call_count("test"), 1);
    }
}
