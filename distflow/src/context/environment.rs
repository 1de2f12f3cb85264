//! The isolated environment created by the provisioner.

use crate::config::ToolConfig;
use crate::core::RuntimeVersion;
use crate::errors::PipelineError;
use crate::exec::{CommandSpec, TemplateVars};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// An isolated runtime environment at a specific runtime version.
///
/// Created only by the provisioner and passed by reference to every later
/// stage, so installing, checking, testing and building all happen inside
/// the same environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedEnvironment {
    run_id: Uuid,
    runtime_version: RuntimeVersion,
    env_dir: PathBuf,
    project_dir: PathBuf,
    tool: ToolConfig,
}

impl ProvisionedEnvironment {
    pub(crate) fn new(
        run_id: Uuid,
        runtime_version: RuntimeVersion,
        env_dir: PathBuf,
        project_dir: PathBuf,
        tool: ToolConfig,
    ) -> Self {
        Self {
            run_id,
            runtime_version,
            env_dir,
            project_dir,
            tool,
        }
    }

    /// The run that owns the environment.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Runtime version of the environment.
    #[must_use]
    pub fn runtime_version(&self) -> &RuntimeVersion {
        &self.runtime_version
    }

    /// Environment directory.
    #[must_use]
    pub fn env_dir(&self) -> &Path {
        &self.env_dir
    }

    /// Directory holding the environment's executables.
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.env_dir.join("Scripts")
        } else {
            self.env_dir.join("bin")
        }
    }

    /// Project root, the working directory of every stage command.
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// The pinned dependency manager.
    #[must_use]
    pub fn tool(&self) -> &ToolConfig {
        &self.tool
    }

    /// Placeholder values for configured commands.
    #[must_use]
    pub fn vars(&self) -> TemplateVars {
        TemplateVars::new()
            .with("runtime_version", self.runtime_version.as_str())
            .with("env_dir", self.env_dir.display().to_string())
            .with("project_dir", self.project_dir.display().to_string())
            .with("tool", self.tool.name.clone())
            .with("tool_version", self.tool.version.clone())
    }

    /// Variables that activate the environment for a child process.
    #[must_use]
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("VIRTUAL_ENV".to_string(), self.env_dir.display().to_string());

        let mut paths = vec![self.bin_dir()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        if let Ok(joined) = std::env::join_paths(paths) {
            vars.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        }
        if self.tool.name == "poetry" {
            // install into the active environment instead of a poetry-managed one
            vars.insert("POETRY_VIRTUALENVS_CREATE".to_string(), "false".to_string());
        }
        vars
    }

    /// Renders a configured command to run inside the environment.
    pub fn command(&self, label: impl Into<String>, template: &[String]) -> Result<CommandSpec, PipelineError> {
        Ok(self
            .vars()
            .command(label, template, &self.project_dir)?
            .with_env(self.env_vars()))
    }

    /// Removes the environment directory.
    pub async fn discard(&self) -> Result<(), PipelineError> {
        match tokio::fs::remove_dir_all(&self.env_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
