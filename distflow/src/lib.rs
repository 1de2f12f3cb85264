//! # Distflow
//!
//! A fail-fast build-and-release pipeline for Python distributions.
//!
//! A run takes one project and one requested runtime version through six
//! stages, strictly in order:
//!
//! - **Provision**: create an isolated environment for the runtime version
//! - **Install**: resolve and install dependencies (one retry on network outages)
//! - **Verify**: run every static check and collect violations
//! - **Test**: run the test suite
//! - **Build**: produce versioned, reproducible distribution archives
//! - **Publish**: upload the archives under a per-version label
//!
//! The first failure ends the run. Every run is recorded as a
//! [`PipelineRun`](context::PipelineRun) that says which stage failed and why.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use distflow::prelude::*;
//!
//! let project = Project::load(Path::new("."))?;
//! let config = PipelineConfig::discover(&project.root, None)?;
//! let pipeline = PipelineBuilder::new(config, project).build()?;
//!
//! let run = pipeline.run("3.11").await;
//! assert!(run.succeeded());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod exec;
pub mod observability;
pub mod pipeline;
pub mod project;
pub mod registry;
pub mod stages;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::context::{PipelineRun, ProvisionedEnvironment, RunOutcome, StageRecord};
    pub use crate::core::{
        Artifact, BuiltArtifacts, Constraint, PipelineState, RuntimeVersion, StageName,
        StageStatus, Version,
    };
    pub use crate::errors::{ErrorKind, ErrorReport, PipelineError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::exec::{CommandRunner, ProcessRunner};
    pub use crate::pipeline::{Pipeline, PipelineBuilder, RetryConfig};
    pub use crate::project::{DependencySpec, Project, Requirement};
    pub use crate::registry::{PackageIndex, StaticPackageIndex};
    pub use crate::store::{
        ArtifactStore, FilesystemArtifactStore, InMemoryArtifactStore, UploadReceipt,
    };
}
