//! Event sink system for observability.
//!
//! A pipeline reports its lifecycle to an [`EventSink`] passed in at build
//! time. Each event is an event type plus a JSON payload built from a
//! [`PipelineEvent`](crate::core::PipelineEvent).

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::PipelineEvent;

/// Emits a typed pipeline event to a sink.
pub async fn emit_event(sink: &dyn EventSink, event: &PipelineEvent) {
    sink.emit(&event.event_type, Some(event.payload())).await;
}
