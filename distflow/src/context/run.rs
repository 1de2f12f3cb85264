//! The record of one pipeline run.

use crate::core::{PipelineState, StageName, StageStatus, StateMachine};
use crate::errors::{ErrorReport, PipelineError};
use crate::exec::{tail, CommandOutput, CommandSpec};
use crate::store::UploadReceipt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Overall result of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stage succeeded and the artifacts were published.
    Succeeded,
    /// A stage failed.
    Failed,
}

impl RunOutcome {
    /// Process exit code for the outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What happened in one attempted stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage.
    pub name: StageName,
    /// Final status.
    pub status: StageStatus,
    /// Command lines executed, in order.
    pub commands: Vec<String>,
    /// Exit code of the last command, if any ran.
    pub exit_code: Option<i32>,
    /// Captured output, truncated to the configured tail.
    pub output: String,
    /// Attempts made; more than one only for retried installs.
    pub attempts: u32,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: f64,
    /// Stage-specific report (test outcomes, violations, resolved packages).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    /// Failure summary, if the stage failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// Mutable log a stage writes into while it runs.
#[derive(Debug, Clone, Default)]
pub struct StageLog {
    max_output: usize,
    commands: Vec<String>,
    output: String,
    exit_code: Option<i32>,
    attempts: u32,
    attempt_open: bool,
    details: serde_json::Value,
}

impl StageLog {
    /// Creates a log keeping at most `max_output` bytes of output.
    #[must_use]
    pub fn new(max_output: usize) -> Self {
        Self {
            max_output,
            attempts: 1,
            ..Self::default()
        }
    }

    /// Starts another attempt, returning its number (1-based).
    pub fn begin_attempt(&mut self) -> u32 {
        if self.attempt_open {
            self.attempts += 1;
            self.note(&format!("attempt {}", self.attempts));
        }
        self.attempt_open = true;
        self.attempts
    }

    /// Records a command and its output.
    pub fn record(&mut self, spec: &CommandSpec, output: &CommandOutput) {
        self.start_command(spec);
        self.finish_command(output);
    }

    /// Records a command line before it runs, so an interrupted command
    /// still shows up in the log.
    pub fn start_command(&mut self, spec: &CommandSpec) {
        let line = spec.display();
        self.append(&format!("$ {line}\n"));
        self.commands.push(line);
    }

    /// Records the output of the most recently started command.
    pub fn finish_command(&mut self, output: &CommandOutput) {
        self.append(&output.combined());
        if !self.output.ends_with('\n') && !self.output.is_empty() {
            self.output.push('\n');
        }
        self.exit_code = output.exit_code;
    }

    /// Appends a free-form line.
    pub fn note(&mut self, line: &str) {
        self.append(&format!("# {line}\n"));
    }

    /// Sets the stage-specific report.
    pub fn set_details(&mut self, details: serde_json::Value) {
        self.details = details;
    }

    /// Command lines recorded so far.
    #[must_use]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Output captured so far.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn append(&mut self, text: &str) {
        self.output.push_str(text);
        if self.output.len() > self.max_output {
            self.output = tail(&self.output, self.max_output).to_string();
        }
    }
}

/// The record of one pipeline run for one runtime version.
///
/// Only the pipeline engine mutates a run; callers receive it once it has
/// reached a terminal state and can only read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    run_id: Uuid,
    runtime_version: String,
    state: StateMachine,
    stages: Vec<StageRecord>,
    outcome: Option<RunOutcome>,
    error: Option<ErrorReport>,
    receipt: Option<UploadReceipt>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_ms: f64,
}

impl PipelineRun {
    pub(crate) fn new(run_id: Uuid, runtime_version: &str) -> Self {
        Self {
            run_id,
            runtime_version: runtime_version.to_string(),
            state: StateMachine::new(),
            stages: Vec::new(),
            outcome: None,
            error: None,
            receipt: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0.0,
        }
    }

    pub(crate) fn begin_stage(&mut self, name: StageName) -> Result<(), PipelineError> {
        self.state.expect_stage(name)?;
        if self.stages.iter().any(|s| s.name == name) {
            return Err(PipelineError::Internal(format!("stage '{name}' already attempted")));
        }
        self.stages.push(StageRecord {
            name,
            status: StageStatus::Running,
            commands: Vec::new(),
            exit_code: None,
            output: String::new(),
            attempts: 0,
            started_at: Utc::now(),
            duration_ms: 0.0,
            details: serde_json::Value::Null,
            error: None,
        });
        Ok(())
    }

    pub(crate) fn complete_stage(
        &mut self,
        name: StageName,
        log: StageLog,
        duration_ms: f64,
    ) -> Result<(), PipelineError> {
        self.close_record(name, StageStatus::Ok, log, duration_ms, None)?;
        self.state.advance()?;
        Ok(())
    }

    pub(crate) fn fail_stage(
        &mut self,
        name: StageName,
        log: StageLog,
        duration_ms: f64,
        error: &PipelineError,
    ) -> Result<(), PipelineError> {
        let report = error.to_report(Some(name));
        self.close_record(name, StageStatus::Fail, log, duration_ms, Some(report.clone()))?;
        self.state.fail()?;
        self.error = Some(report);
        Ok(())
    }

    /// Fails the run outside of any stage (bookkeeping errors).
    pub(crate) fn abort(&mut self, error: &PipelineError) {
        if !self.state.current().is_terminal() {
            // fail() only errors on terminal states, checked above
            let _ = self.state.fail();
        }
        if let Some(record) = self.stages.iter_mut().find(|s| s.status == StageStatus::Running) {
            record.status = StageStatus::Fail;
            record.error = Some(error.to_report(Some(record.name)));
        }
        self.error = Some(error.to_report(None));
    }

    pub(crate) fn set_receipt(&mut self, receipt: UploadReceipt) {
        self.receipt = Some(receipt);
    }

    pub(crate) fn finish(&mut self, duration_ms: f64) {
        self.outcome = Some(if self.state.current() == PipelineState::Succeeded {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        });
        self.ended_at = Some(Utc::now());
        self.duration_ms = duration_ms;
    }

    fn close_record(
        &mut self,
        name: StageName,
        status: StageStatus,
        log: StageLog,
        duration_ms: f64,
        error: Option<ErrorReport>,
    ) -> Result<(), PipelineError> {
        let record = self
            .stages
            .iter_mut()
            .rev()
            .find(|s| s.name == name && s.status == StageStatus::Running)
            .ok_or_else(|| PipelineError::Internal(format!("stage '{name}' is not running")))?;
        record.status = status;
        record.commands = log.commands;
        record.exit_code = log.exit_code;
        record.output = log.output;
        record.attempts = log.attempts;
        record.details = log.details;
        record.duration_ms = duration_ms;
        record.error = error;
        Ok(())
    }

    /// Unique run identifier.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The runtime version as requested.
    #[must_use]
    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    /// The current (final, once returned) pipeline state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    /// Every state the run passed through.
    #[must_use]
    pub fn history(&self) -> &[PipelineState] {
        self.state.history()
    }

    /// Records of the attempted stages, in order.
    #[must_use]
    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    /// The record of a stage, if it was attempted.
    #[must_use]
    pub fn stage(&self, name: StageName) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Names of the attempted stages, in order.
    #[must_use]
    pub fn attempted_stages(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name).collect()
    }

    /// The stage that failed, if any.
    #[must_use]
    pub fn failed_stage(&self) -> Option<StageName> {
        self.stages
            .iter()
            .find(|s| s.status.is_failure())
            .map(|s| s.name)
    }

    /// Overall outcome; `None` while the run is in progress.
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    /// Returns true if the run succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome == Some(RunOutcome::Succeeded)
    }

    /// Process exit code for this run alone.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.outcome.map_or(1, |o| o.exit_code())
    }

    /// Why the run failed.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorReport> {
        self.error.as_ref()
    }

    /// Upload receipt, present only on success.
    #[must_use]
    pub fn receipt(&self) -> Option<&UploadReceipt> {
        self.receipt.as_ref()
    }

    /// Start time.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// End time, once finished.
    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Total duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    /// Serializes the run as a JSON report.
    pub fn to_json(&self) -> Result<serde_json::Value, PipelineError> {
        serde_json::to_value(self).map_err(|e| PipelineError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;

    fn log_with(cmd: &str, out: CommandOutput) -> StageLog {
        let mut log = StageLog::new(1024);
        log.record(&CommandSpec::new("x", cmd, "."), &out);
        log
    }

    #[test]
    fn test_successful_stages_advance_state() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "3.11");
        for stage in StageName::ALL {
            run.begin_stage(stage).unwrap();
            run.complete_stage(stage, log_with("true", CommandOutput::ok("")), 1.0).unwrap();
        }
        run.finish(10.0);

        assert_eq!(run.state(), PipelineState::Succeeded);
        assert!(run.succeeded());
        assert_eq!(run.exit_code(), 0);
        assert_eq!(run.attempted_stages(), StageName::ALL.to_vec());
        assert_eq!(run.failed_stage(), None);
        assert!(run.ended_at().is_some());
    }

    #[test]
    fn test_failed_stage_records_error() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "3.11");
        run.begin_stage(StageName::Provision).unwrap();
        run.complete_stage(StageName::Provision, StageLog::new(64), 1.0).unwrap();
        run.begin_stage(StageName::Install).unwrap();
        let err = PipelineError::network("connection refused");
        run.fail_stage(StageName::Install, log_with("poetry", CommandOutput::failed(1, "boom")), 2.0, &err)
            .unwrap();
        run.finish(3.0);

        assert_eq!(run.state(), PipelineState::Failed);
        assert_eq!(run.outcome(), Some(RunOutcome::Failed));
        assert_eq!(run.exit_code(), 1);
        assert_eq!(run.failed_stage(), Some(StageName::Install));
        let record = run.stage(StageName::Install).unwrap();
        assert_eq!(record.exit_code, Some(1));
        assert_eq!(record.error.as_ref().unwrap().kind, ErrorKind::NetworkUnavailable);
        assert_eq!(run.error().unwrap().stage, Some(StageName::Install));
    }

    #[test]
    fn test_out_of_order_stage_is_rejected() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "3.11");
        assert!(run.begin_stage(StageName::Build).is_err());
        assert!(run.stages().is_empty());
    }

    #[test]
    fn test_no_stage_after_failure() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "2.7");
        run.begin_stage(StageName::Provision).unwrap();
        let err = PipelineError::UnsupportedVersion {
            requested: "2.7".into(),
            supported: vec!["3.11".into()],
        };
        run.fail_stage(StageName::Provision, StageLog::new(64), 0.1, &err).unwrap();

        assert!(run.begin_stage(StageName::Install).is_err());
    }

    #[test]
    fn test_abort_marks_running_stage() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "3.11");
        run.begin_stage(StageName::Provision).unwrap();
        run.abort(&PipelineError::Internal("lost".into()));
        run.finish(1.0);

        assert_eq!(run.state(), PipelineState::Failed);
        assert_eq!(run.failed_stage(), Some(StageName::Provision));
        assert_eq!(run.error().unwrap().kind, ErrorKind::Internal);
    }

    #[test]
    fn test_stage_log_truncates_to_tail() {
        let mut log = StageLog::new(16);
        log.record(
            &CommandSpec::new("t", "pytest", "."),
            &CommandOutput::ok("x".repeat(100) + "END"),
        );
        assert!(log.output().len() <= 16);
        assert!(log.output().contains("END"));
        assert_eq!(log.commands(), &["pytest".to_string()]);
    }

    #[test]
    fn test_started_command_is_logged_before_output() {
        let mut log = StageLog::new(1024);
        log.start_command(&CommandSpec::new("t", "pytest", "."));

        assert_eq!(log.commands(), &["pytest".to_string()]);
        assert_eq!(log.output(), "$ pytest\n");

        log.finish_command(&CommandOutput::ok("3 passed"));
        assert!(log.output().ends_with("3 passed\n"));
    }

    #[test]
    fn test_stage_log_attempts() {
        let mut log = StageLog::new(1024);
        assert_eq!(log.begin_attempt(), 1);
        log.record(&CommandSpec::new("i", "poetry", "."), &CommandOutput::failed(1, "net"));
        assert_eq!(log.begin_attempt(), 2);
        assert_eq!(log.attempts(), 2);
        assert!(log.output().contains("# attempt 2"));
    }

    #[test]
    fn test_report_serialization() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "3.11");
        run.begin_stage(StageName::Provision).unwrap();
        run.complete_stage(StageName::Provision, StageLog::new(64), 1.0).unwrap();
        let json = run.to_json().unwrap();

        assert_eq!(json["runtime_version"], "3.11");
        assert_eq!(json["stages"][0]["name"], "provision");
        assert_eq!(json["stages"][0]["status"], "ok");
        assert!(json["stages"][0].get("error").is_none());
    }
}
