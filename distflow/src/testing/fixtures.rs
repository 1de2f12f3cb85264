//! Test fixtures for pipeline testing.

use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::events::CollectingEventSink;
use crate::pipeline::{JitterStrategy, RetryConfig};
use crate::project::{Project, MANIFEST_FILE_NAME};
use crate::stages::StageContext;
use crate::store::InMemoryArtifactStore;

use super::ScriptedRunner;

/// A configuration suited to tests: fast retries with no jitter.
#[must_use]
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.install = RetryConfig::new()
        .with_base_delay_ms(5)
        .with_max_delay_ms(20)
        .with_jitter(JitterStrategy::None);
    config
}

/// Builds a Poetry project on disk.
#[derive(Debug, Clone)]
pub struct TestProject {
    name: String,
    version: String,
    python: Option<String>,
    dependencies: Vec<(String, String)>,
    dev_dependencies: Vec<(String, String)>,
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new("traceguard-demo", "0.3.1")
            .with_python(">=3.9,<4.0")
            .with_dependency("openai", "^1.3")
            .with_dev_dependency("pytest", "^7.4")
    }
}

impl TestProject {
    /// A project with no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            python: None,
            dependencies: Vec::new(),
            dev_dependencies: Vec::new(),
        }
    }

    /// Declares the supported interpreter range.
    #[must_use]
    pub fn with_python(mut self, constraint: impl Into<String>) -> Self {
        self.python = Some(constraint.into());
        self
    }

    /// Adds a runtime dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.dependencies.push((name.into(), constraint.into()));
        self
    }

    /// Adds a development dependency.
    #[must_use]
    pub fn with_dev_dependency(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.dev_dependencies.push((name.into(), constraint.into()));
        self
    }

    /// The manifest text.
    #[must_use]
    pub fn manifest(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "[tool.poetry]\nname = {:?}\nversion = {:?}", self.name, self.version);
        text.push_str("\n[tool.poetry.dependencies]\n");
        if let Some(python) = &self.python {
            let _ = writeln!(text, "python = {python:?}");
        }
        for (name, constraint) in &self.dependencies {
            let _ = writeln!(text, "{name} = {constraint:?}");
        }
        if !self.dev_dependencies.is_empty() {
            text.push_str("\n[tool.poetry.group.dev.dependencies]\n");
            for (name, constraint) in &self.dev_dependencies {
                let _ = writeln!(text, "{name} = {constraint:?}");
            }
        }
        text
    }

    /// Writes the manifest, a package and a test module under `root`, then
    /// loads the project.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written or the manifest does
    /// not load.
    pub fn write(&self, root: &Path) -> Result<Project, PipelineError> {
        let package = self.name.replace('-', "_");
        std::fs::create_dir_all(root.join("src").join(&package))?;
        std::fs::create_dir_all(root.join("tests"))?;
        std::fs::write(root.join(MANIFEST_FILE_NAME), self.manifest())?;
        std::fs::write(
            root.join("src").join(&package).join("__init__.py"),
            format!("__version__ = {:?}\n", self.version),
        )?;
        std::fs::write(
            root.join("tests").join("test_basic.py"),
            format!("import {package}\n\n\ndef test_version():\n    assert {package}.__version__\n"),
        )?;
        Ok(Project::load(root)?)
    }

    /// File name of the wheel a build of this project produces.
    #[must_use]
    pub fn wheel_name(&self) -> String {
        format!("{}-{}-py3-none-any.whl", self.name.replace('-', "_"), self.version)
    }
}

/// Owns every collaborator a stage needs, for calling stages directly.
#[derive(Debug)]
pub struct StageHarness {
    /// Configuration.
    pub config: PipelineConfig,
    /// Project under test.
    pub project: Project,
    /// Scripted runner.
    pub runner: ScriptedRunner,
    /// Collected events.
    pub sink: CollectingEventSink,
    /// In-memory store.
    pub store: InMemoryArtifactStore,
    /// Run id handed to stages.
    pub run_id: Uuid,
}

impl StageHarness {
    /// Creates a harness with default test configuration.
    #[must_use]
    pub fn new(project: Project, runner: ScriptedRunner) -> Self {
        Self {
            config: test_config(),
            project,
            runner,
            sink: CollectingEventSink::new(),
            store: InMemoryArtifactStore::new(),
            run_id: Uuid::new_v4(),
        }
    }

    /// A stage context borrowing the harness, with no package index.
    #[must_use]
    pub fn ctx(&self) -> StageContext<'_> {
        StageContext {
            config: &self.config,
            project: &self.project,
            runner: &self.runner,
            sink: &self.sink,
            index: None,
            store: &self.store,
            run_id: self.run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_project_loads() {
        let dir = tempfile::tempdir().unwrap();
        let project = TestProject::default().write(dir.path()).unwrap();

        assert_eq!(project.name, "traceguard-demo");
        assert_eq!(project.version, "0.3.1");
        assert_eq!(project.dependencies.runtime.len(), 1);
        assert_eq!(project.dependencies.dev.len(), 1);
        assert!(dir.path().join("src/traceguard_demo/__init__.py").exists());
    }

    #[test]
    fn test_wheel_name() {
        assert_eq!(
            TestProject::default().wheel_name(),
            "traceguard_demo-0.3.1-py3-none-any.whl"
        );
    }

    #[test]
    fn test_config_is_valid() {
        test_config().validate().unwrap();
    }
}
