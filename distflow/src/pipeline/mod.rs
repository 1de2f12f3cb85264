//! Pipeline building and execution.
//!
//! This module provides:
//! - The pipeline builder with validation
//! - The sequential engine driving the run state machine
//! - Retry policy used by the dependency installer

mod builder;
mod engine;
mod retry;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use engine::Pipeline;
pub use retry::{
    should_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision, RetryState,
};
