//! Test assertions for pipeline runs.

use crate::context::PipelineRun;
use crate::core::{PipelineState, StageName};
use crate::errors::{ErrorKind, PipelineError};

/// Asserts that the run succeeded and published.
pub fn assert_run_succeeded(run: &PipelineRun) {
    assert!(
        run.succeeded(),
        "Expected success, got state {} with error {:?}",
        run.state(),
        run.error()
    );
    assert_eq!(run.state(), PipelineState::Succeeded);
    assert!(run.receipt().is_some(), "Expected an upload receipt");
}

/// Asserts that the run failed in `stage` with an error of `kind`.
pub fn assert_run_failed_at(run: &PipelineRun, stage: StageName, kind: ErrorKind) {
    assert_eq!(
        run.state(),
        PipelineState::Failed,
        "Expected the run to fail, got state {}",
        run.state()
    );
    assert_eq!(run.failed_stage(), Some(stage), "Wrong failing stage");
    let Some(error) = run.error() else {
        panic!("Expected the failed run to carry an error");
    };
    assert_eq!(error.kind, kind, "Wrong error kind: {}", error.message);
    assert_eq!(error.stage, Some(stage));
    assert!(run.receipt().is_none(), "A failed run must not publish");
}

/// Asserts the exact sequence of attempted stages.
pub fn assert_stages_attempted(run: &PipelineRun, expected: &[StageName]) {
    assert_eq!(
        run.attempted_stages(),
        expected,
        "Unexpected stage sequence"
    );
}

/// Asserts that a stage result is an error of `kind`.
pub fn assert_error_kind<T: std::fmt::Debug>(result: &Result<T, PipelineError>, kind: ErrorKind) {
    match result {
        Ok(value) => panic!("Expected {kind} error, got Ok({value:?})"),
        Err(err) => assert_eq!(err.kind(), kind, "Wrong error kind: {err}"),
    }
}
