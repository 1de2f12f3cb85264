//! Core domain model types for distflow.
//!
//! This module contains the fundamental types used throughout the pipeline:
//! - Stage names, stage status and the run state machine
//! - Versions, runtime versions and constraints
//! - Built artifacts and lifecycle events

mod artifact;
mod event;
mod state;
mod status;
mod version;

pub use artifact::{Artifact, BuiltArtifacts};
pub use event::PipelineEvent;
pub use state::{PipelineState, StateMachine};
pub use status::{StageName, StageStatus};
pub use version::{Constraint, PreRelease, RuntimeVersion, Version};
