//! Stage names and stage status enums.

use super::PipelineState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The six ordered stages of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Creates the isolated runtime environment.
    Provision,
    /// Resolves and installs dependencies.
    Install,
    /// Runs type, lint and format checks.
    Verify,
    /// Runs the test suite.
    Test,
    /// Builds distributable archives.
    Build,
    /// Uploads archives to the artifact store.
    Publish,
}

impl StageName {
    /// All stages in execution order.
    pub const ALL: [Self; 6] = [
        Self::Provision,
        Self::Install,
        Self::Verify,
        Self::Test,
        Self::Build,
        Self::Publish,
    ];

    /// The pipeline state that is active while this stage runs.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        match self {
            Self::Provision => PipelineState::Provisioning,
            Self::Install => PipelineState::InstallingDeps,
            Self::Verify => PipelineState::Verifying,
            Self::Test => PipelineState::Testing,
            Self::Build => PipelineState::Building,
            Self::Publish => PipelineState::Publishing,
        }
    }

    /// Human readable component name.
    #[must_use]
    pub fn title(&self) -> &'static str {
        match self {
            Self::Provision => "Environment Provisioner",
            Self::Install => "Dependency Installer",
            Self::Verify => "Static Verifier",
            Self::Test => "Test Runner",
            Self::Build => "Package Builder",
            Self::Publish => "Artifact Publisher",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Install => write!(f, "install"),
            Self::Verify => write!(f, "verify"),
            Self::Test => write!(f, "test"),
            Self::Build => write!(f, "build"),
            Self::Publish => write!(f, "publish"),
        }
    }
}

/// The execution status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not attempted yet.
    #[default]
    Pending,
    /// Currently running.
    Running,
    /// Completed successfully.
    Ok,
    /// Failed.
    Fail,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Ok => write!(f, "ok"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Fail)
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail)
    }
}
