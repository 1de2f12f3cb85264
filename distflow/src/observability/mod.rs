//! Observability utilities.

mod telemetry;

pub use telemetry::{init_tracing, parse_level, SpanTimer};
