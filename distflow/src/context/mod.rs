//! Per-run context.
//!
//! This module provides:
//! - The provisioned environment handed from the provisioner to every later stage
//! - The run record (`PipelineRun`) with one `StageRecord` per attempted stage
//! - The `StageLog` a stage writes its commands and output into

mod environment;
mod run;

pub use environment::ProvisionedEnvironment;
pub use run::{PipelineRun, RunOutcome, StageLog, StageRecord};
