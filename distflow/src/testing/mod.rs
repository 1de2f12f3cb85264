//! Testing utilities for distflow pipelines.
//!
//! This module provides:
//! - A scripted command runner standing in for real tools
//! - Project fixtures and a stage harness
//! - Assertions over finished runs

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_error_kind, assert_run_failed_at, assert_run_succeeded, assert_stages_attempted,
};
pub use fixtures::{test_config, StageHarness, TestProject};
pub use mocks::{ScriptedResponse, ScriptedRunner};
