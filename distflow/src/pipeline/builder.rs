//! Pipeline builder with validation.

use super::Pipeline;
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::events::{EventSink, LoggingEventSink};
use crate::exec::{CommandRunner, ProcessRunner};
use crate::project::Project;
use crate::registry::PackageIndex;
use crate::store::{ArtifactStore, FilesystemArtifactStore};
use std::sync::Arc;

/// Builder for creating validated pipelines.
///
/// Every collaborator has a production default: processes are spawned with
/// [`ProcessRunner`], artifacts go to a [`FilesystemArtifactStore`] under the
/// configured store directory and events are logged through `tracing`.
#[derive(Debug)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    project: Project,
    runner: Option<Arc<dyn CommandRunner>>,
    store: Option<Arc<dyn ArtifactStore>>,
    index: IndexChoice,
    sink: Option<Arc<dyn EventSink>>,
}

#[derive(Debug)]
enum IndexChoice {
    FromConfig,
    Disabled,
    Custom(Arc<dyn PackageIndex>),
}

impl PipelineBuilder {
    /// Creates a builder for a project.
    #[must_use]
    pub fn new(config: PipelineConfig, project: Project) -> Self {
        Self {
            config,
            project,
            runner: None,
            store: None,
            index: IndexChoice::FromConfig,
            sink: None,
        }
    }

    /// Sets the command runner.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Sets the artifact store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses a package index for dependency pre-resolution.
    #[must_use]
    pub fn with_index(mut self, index: Arc<dyn PackageIndex>) -> Self {
        self.index = IndexChoice::Custom(index);
        self
    }

    /// Skips index pre-resolution even when a registry URL is configured.
    #[must_use]
    pub fn without_index(mut self) -> Self {
        self.index = IndexChoice::Disabled;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validates the configuration and builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the configured
    /// registry client cannot be created.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;
        self.config.validate_paths(&self.project.root)?;

        let index = match self.index {
            IndexChoice::Custom(index) => Some(index),
            IndexChoice::Disabled => None,
            IndexChoice::FromConfig => index_from_config(&self.config)?,
        };
        let store = self.store.unwrap_or_else(|| {
            let root = PipelineConfig::resolve_path(&self.project.root, &self.config.publish.store_dir);
            Arc::new(FilesystemArtifactStore::new(root))
        });

        Ok(Pipeline {
            runner: self.runner.unwrap_or_else(|| Arc::new(ProcessRunner::new())),
            sink: self.sink.unwrap_or_else(|| Arc::new(LoggingEventSink::default())),
            store,
            index,
            config: self.config,
            project: self.project,
            build_lock: tokio::sync::Mutex::new(()),
        })
    }
}

#[cfg(feature = "registry")]
fn index_from_config(config: &PipelineConfig) -> Result<Option<Arc<dyn PackageIndex>>, PipelineError> {
    use crate::registry::HttpPackageIndex;
    use std::time::Duration;

    let Some(url) = &config.registry.url else {
        return Ok(None);
    };
    let client = HttpPackageIndex::new(url.clone(), Duration::from_secs(config.registry.timeout_seconds))?;
    Ok(Some(Arc::new(client)))
}

#[cfg(not(feature = "registry"))]
fn index_from_config(config: &PipelineConfig) -> Result<Option<Arc<dyn PackageIndex>>, PipelineError> {
    if config.registry.url.is_some() {
        tracing::warn!("registry.url is set but the registry feature is disabled; skipping pre-resolution");
    }
    Ok(None)
}
