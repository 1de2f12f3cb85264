//! Scripted command runner for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::PipelineError;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};

/// What a scripted command does when run.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    output: CommandOutput,
    files: Vec<(PathBuf, Vec<u8>)>,
    delay: Option<Duration>,
    start_error: Option<String>,
}

impl ScriptedResponse {
    /// Exits 0 with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            output: CommandOutput::ok(stdout),
            ..Self::default()
        }
    }

    /// Exits with `exit_code` and the given stderr.
    #[must_use]
    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            output: CommandOutput::failed(exit_code, stderr),
            ..Self::default()
        }
    }

    /// Exits with `exit_code` and the given stdout.
    #[must_use]
    pub fn fail_with_stdout(exit_code: i32, stdout: impl Into<String>) -> Self {
        Self {
            output: CommandOutput {
                exit_code: Some(exit_code),
                stdout: stdout.into(),
                stderr: String::new(),
            },
            ..Self::default()
        }
    }

    /// Cannot be started at all (e.g. the program is missing).
    #[must_use]
    pub fn unstartable(message: impl Into<String>) -> Self {
        Self {
            start_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Writes a file relative to the command's working directory before exiting.
    #[must_use]
    pub fn writes_file(mut self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }

    /// Sleeps before exiting.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A [`CommandRunner`] that answers from a script instead of spawning processes.
///
/// Responses are looked up by command label: first queued one-shot responses
/// for the exact label, then a standing response for the exact label, then
/// one for the label's prefix before `:` (so `check` covers `check:lint`).
/// Anything unscripted succeeds with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    queued: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    standing: Mutex<HashMap<String, ScriptedResponse>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    /// Creates a runner where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-shot response for a label.
    #[must_use]
    pub fn script(self, label: impl Into<String>, response: ScriptedResponse) -> Self {
        self.queued
            .lock()
            .entry(label.into())
            .or_default()
            .push_back(response);
        self
    }

    /// Sets the response used whenever nothing is queued for a label.
    #[must_use]
    pub fn always(self, label: impl Into<String>, response: ScriptedResponse) -> Self {
        self.standing.lock().insert(label.into(), response);
        self
    }

    /// Every command run so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Labels of every command run so far.
    #[must_use]
    pub fn call_labels(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.label.clone()).collect()
    }

    /// How many times a label (or label prefix before `:`) ran.
    #[must_use]
    pub fn call_count(&self, label: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.label == label || c.label.split(':').next() == Some(label))
            .count()
    }

    fn response_for(&self, label: &str) -> ScriptedResponse {
        if let Some(response) = self.queued.lock().get_mut(label).and_then(VecDeque::pop_front) {
            return response;
        }
        let standing = self.standing.lock();
        standing
            .get(label)
            .or_else(|| label.split(':').next().and_then(|prefix| standing.get(prefix)))
            .cloned()
            .unwrap_or_else(|| ScriptedResponse::ok(""))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, PipelineError> {
        self.calls.lock().push(spec.clone());
        let response = self.response_for(&spec.label);

        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = response.start_error {
            return Err(PipelineError::not_started(spec.display(), message));
        }
        for (path, content) in &response.files {
            let path = spec.cwd.join(path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
        }
        Ok(response.output)
    }
}
