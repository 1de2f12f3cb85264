//! The six pipeline stages.
//!
//! Each stage is a plain async function taking a [`StageContext`], the
//! outputs of the stages before it, and a [`StageLog`] to write into. A
//! stage returns a typed result on success and a [`PipelineError`] on
//! failure. Later stages require the earlier stage's result as an argument,
//! so they cannot be called out of order.

pub mod build;
pub mod install;
pub mod provision;
pub mod publish;
pub mod test_suite;
pub mod verify;

pub use build::build;
pub use install::{install, InstallReport};
pub use provision::provision;
pub use publish::publish;
pub use test_suite::{run_tests, TestOutcome, TestReport};
pub use verify::{verify, CheckOutcome, VerifyReport};

use crate::config::PipelineConfig;
use crate::context::StageLog;
use crate::errors::PipelineError;
use crate::events::EventSink;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::project::Project;
use crate::registry::PackageIndex;
use crate::store::ArtifactStore;
use std::fmt;
use uuid::Uuid;

/// Collaborators shared by every stage of one run.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    /// Pipeline configuration.
    pub config: &'a PipelineConfig,
    /// The project being built.
    pub project: &'a Project,
    /// Executes stage commands.
    pub runner: &'a dyn CommandRunner,
    /// Receives lifecycle events.
    pub sink: &'a dyn EventSink,
    /// Package index for pre-resolution, if enabled.
    pub index: Option<&'a dyn PackageIndex>,
    /// Destination for published artifacts.
    pub store: &'a dyn ArtifactStore,
    /// The run being executed.
    pub run_id: Uuid,
}

impl fmt::Debug for StageContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("project", &self.project.name)
            .field("runner", &self.runner)
            .field("store", &self.store.describe())
            .field("index", &self.index.is_some())
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl StageContext<'_> {
    /// Runs a command and records it in the stage log.
    pub(crate) async fn run_command(
        &self,
        log: &mut StageLog,
        spec: &CommandSpec,
    ) -> Result<CommandOutput, PipelineError> {
        log.start_command(spec);
        let output = self.runner.run(spec).await?;
        tracing::debug!(
            label = %spec.label,
            exit_code = ?output.exit_code,
            "Command finished"
        );
        log.finish_command(&output);
        Ok(output)
    }
}

/// Last non-empty line of a command's output, for error messages.
pub(crate) fn last_line(output: &CommandOutput) -> String {
    output
        .combined()
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_string()
}
