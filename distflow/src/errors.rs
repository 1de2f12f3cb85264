//! Error types for the distflow pipeline.
//!
//! Every stage failure is expressed as a [`PipelineError`]. Each variant maps to
//! an [`ErrorKind`] and can be flattened into a serializable [`ErrorReport`]
//! that is attached to the failed stage record and to the run itself.

use crate::core::StageName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The requested runtime version is malformed or not in the supported set.
    #[error("unsupported runtime version '{requested}' (supported: {})", .supported.join(", "))]
    UnsupportedVersion {
        /// The version that was requested.
        requested: String,
        /// The configured supported versions.
        supported: Vec<String>,
    },

    /// The package registry could not be reached.
    #[error("package registry unavailable: {message}")]
    NetworkUnavailable {
        /// Diagnostic message.
        message: String,
    },

    /// Declared constraints cannot be satisfied together.
    #[error("dependency resolution conflict: {}", summarize(.conflicts))]
    ResolutionConflict {
        /// One entry per package that could not be resolved.
        conflicts: Vec<ConflictDetail>,
    },

    /// A static check reported violations.
    #[error("static checks reported {} violation(s)", .violations.len())]
    StaticCheckViolation {
        /// Every violation found across all checks.
        violations: Vec<Violation>,
    },

    /// One or more tests failed.
    #[error("{} test(s) failed: {}", .failing.len(), .failing.join(", "))]
    TestFailure {
        /// Identifiers of the failing tests.
        failing: Vec<String>,
    },

    /// The project version is not well-formed.
    #[error("invalid package version '{version}': {reason}")]
    InvalidVersion {
        /// The offending version string.
        version: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The build step produced no artifact files.
    #[error("build produced no artifacts")]
    NoArtifactsProduced,

    /// Uploading to the artifact store failed.
    #[error("publishing '{label}' failed: {message}")]
    PublishFailure {
        /// The upload label.
        label: String,
        /// Diagnostic message.
        message: String,
    },

    /// Creating the isolated environment failed.
    #[error("provisioning failed: {message}")]
    ProvisioningFailed {
        /// Diagnostic message.
        message: String,
    },

    /// A stage command exited unsuccessfully for an unclassified reason.
    #[error("command `{command}` exited with {}", describe_exit(.exit_code))]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// A stage command could not be started, e.g. its program is missing
    /// from the environment.
    #[error("command `{command}` could not be started: {reason}")]
    CommandNotStarted {
        /// The command line that was attempted.
        command: String,
        /// Why the process could not be spawned.
        reason: String,
    },

    /// A stage exceeded its configured time limit.
    #[error("stage '{stage}' timed out after {seconds}s")]
    Timeout {
        /// The stage that timed out.
        stage: StageName,
        /// The limit that was exceeded.
        seconds: u64,
    },

    /// Invalid pipeline configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Invalid project manifest.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn summarize(conflicts: &[ConflictDetail]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "no exit code (terminated by signal)".to_string(), |c| format!("code {c}"))
}

impl PipelineError {
    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            Self::NetworkUnavailable { .. } => ErrorKind::NetworkUnavailable,
            Self::ResolutionConflict { .. } => ErrorKind::ResolutionConflict,
            Self::StaticCheckViolation { .. } => ErrorKind::StaticCheckViolation,
            Self::TestFailure { .. } => ErrorKind::TestFailure,
            Self::InvalidVersion { .. } => ErrorKind::InvalidVersion,
            Self::NoArtifactsProduced => ErrorKind::NoArtifactsProduced,
            Self::PublishFailure { .. } => ErrorKind::PublishFailure,
            Self::ProvisioningFailed { .. } => ErrorKind::ProvisioningFailed,
            Self::CommandFailed { .. } | Self::CommandNotStarted { .. } => ErrorKind::CommandFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Config,
            Self::Manifest(_) => ErrorKind::Manifest,
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if a stage may retry after this error.
    ///
    /// Only registry outages qualify; publish failures never retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkUnavailable { .. })
    }

    /// Creates a network unavailable error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkUnavailable {
            message: message.into(),
        }
    }

    /// Creates a publish failure.
    #[must_use]
    pub fn publish(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PublishFailure {
            label: label.into(),
            message: message.into(),
        }
    }

    /// Creates a provisioning failure.
    #[must_use]
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::ProvisioningFailed {
            message: message.into(),
        }
    }

    /// Creates an error for a command that could not be spawned.
    #[must_use]
    pub fn not_started(command: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::CommandNotStarted {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Structured payload carried by the error, if any.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::UnsupportedVersion { requested, supported } => {
                serde_json::json!({ "requested": requested, "supported": supported })
            }
            Self::ResolutionConflict { conflicts } => serde_json::json!({ "conflicts": conflicts }),
            Self::StaticCheckViolation { violations } => {
                serde_json::json!({ "violations": violations })
            }
            Self::TestFailure { failing } => serde_json::json!({ "failing": failing }),
            Self::InvalidVersion { version, reason } => {
                serde_json::json!({ "version": version, "reason": reason })
            }
            Self::PublishFailure { label, .. } => serde_json::json!({ "label": label }),
            Self::CommandFailed { command, exit_code } => {
                serde_json::json!({ "command": command, "exit_code": exit_code })
            }
            Self::CommandNotStarted { command, reason } => {
                serde_json::json!({ "command": command, "reason": reason })
            }
            Self::Timeout { stage, seconds } => {
                serde_json::json!({ "stage": stage, "seconds": seconds })
            }
            _ => serde_json::Value::Null,
        }
    }

    /// Flattens the error into a report for the given stage.
    #[must_use]
    pub fn to_report(&self, stage: Option<StageName>) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            stage,
            message: self.to_string(),
            payload: self.payload(),
        }
    }
}

/// Classification of pipeline errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Runtime version outside the supported set.
    UnsupportedVersion,
    /// Registry unreachable.
    NetworkUnavailable,
    /// Unsatisfiable dependency constraints.
    ResolutionConflict,
    /// Type or lint violations.
    StaticCheckViolation,
    /// Failing tests.
    TestFailure,
    /// Malformed project version.
    InvalidVersion,
    /// Empty artifact set at publish time.
    NoArtifactsProduced,
    /// Artifact store failure.
    PublishFailure,
    /// Environment could not be created.
    ProvisioningFailed,
    /// Unclassified command failure.
    CommandFailed,
    /// Stage time limit exceeded.
    Timeout,
    /// Bad configuration.
    Config,
    /// Bad project manifest.
    Manifest,
    /// Filesystem error.
    Io,
    /// Internal invariant violated.
    Internal,
}

impl ErrorKind {
    /// Returns the canonical name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::NetworkUnavailable => "NetworkUnavailable",
            Self::ResolutionConflict => "ResolutionConflict",
            Self::StaticCheckViolation => "StaticCheckViolation",
            Self::TestFailure => "TestFailure",
            Self::InvalidVersion => "InvalidVersion",
            Self::NoArtifactsProduced => "NoArtifactsProduced",
            Self::PublishFailure => "PublishFailure",
            Self::ProvisioningFailed => "ProvisioningFailed",
            Self::CommandFailed => "CommandFailed",
            Self::Timeout => "Timeout",
            Self::Config => "Config",
            Self::Manifest => "Manifest",
            Self::Io => "Io",
            Self::Internal => "Internal",
        }
    }

    /// Gets a remediation hint for the kind.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UnsupportedVersion => Some(
                "Request one of the supported runtime versions or extend \
                 `supported_versions` in distflow.toml.",
            ),
            Self::NetworkUnavailable => Some(
                "The registry was unreachable after the bounded retry. \
                 Check connectivity and re-run the pipeline.",
            ),
            Self::ResolutionConflict => Some(
                "Relax the conflicting constraints in pyproject.toml so a single \
                 version satisfies both the runtime and development sets.",
            ),
            Self::StaticCheckViolation => {
                Some("Fix the reported type, lint and formatting violations.")
            }
            Self::TestFailure => Some("Fix the failing tests. Tests are never retried."),
            Self::InvalidVersion => {
                Some("Use a PEP 440 version such as 1.2.0, 1.2.0rc1 or 1.2.0.post1.")
            }
            Self::NoArtifactsProduced => Some(
                "Check that the build command writes archives into the dist \
                 directory and that they match `build.artifact_pattern`.",
            ),
            Self::PublishFailure => Some(
                "Uploads are not retried automatically. Inspect the store and \
                 re-run the pipeline manually.",
            ),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable summary of a stage failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// The error kind.
    pub kind: ErrorKind,
    /// The stage that failed, if the failure happened inside one.
    pub stage: Option<StageName>,
    /// Human readable message.
    pub message: String,
    /// Kind-specific diagnostic payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// A single static check violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// The check that reported it (e.g. "typecheck").
    pub check: String,
    /// File path relative to the project root.
    pub file: String,
    /// Line number, when the tool reported one.
    pub line: Option<u32>,
    /// Rule or error message.
    pub message: String,
}

impl Violation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        check: impl Into<String>,
        file: impl Into<String>,
        line: Option<u32>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            check: check.into(),
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {} [{}]", self.file, line, self.message, self.check),
            None => write!(f, "{}: {} [{}]", self.file, self.message, self.check),
        }
    }
}

/// Why a single package could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetail {
    /// Normalized package name.
    pub package: String,
    /// Every constraint declared for the package.
    pub constraints: Vec<String>,
    /// Explanation.
    pub reason: String,
}

impl ConflictDetail {
    /// Creates a new conflict detail.
    #[must_use]
    pub fn new(
        package: impl Into<String>,
        constraints: Vec<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            constraints,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConflictDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.package, self.constraints.join(" and "), self.reason)
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The configuration is not valid TOML for the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered.
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors raised while reading the project manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest could not be read.
    #[error("failed to read manifest {}: {source}", path.display())]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The manifest is not valid TOML.
    #[error("failed to parse manifest {}: {source}", path.display())]
    Parse {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        source: toml::de::Error,
    },

    /// A required field is absent.
    #[error("manifest is missing `{0}`")]
    Missing(String),

    /// A dependency entry could not be understood.
    #[error("invalid requirement '{requirement}': {reason}")]
    InvalidRequirement {
        /// The raw requirement.
        requirement: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors raised while parsing versions and constraints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// The input was empty.
    #[error("empty version string")]
    Empty,

    /// The input does not follow the version grammar.
    #[error("malformed version '{0}'")]
    Malformed(String),

    /// The constraint could not be parsed.
    #[error("malformed constraint '{0}'")]
    Constraint(String),
}
