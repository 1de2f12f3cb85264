//! Pipeline lifecycle events.

use super::StageName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event emitted while a run progresses.
///
/// Events are handed to an [`EventSink`](crate::events::EventSink) as an
/// event type plus a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The event type (e.g., "stage.started").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// The event payload.
    pub data: serde_json::Value,
}

impl PipelineEvent {
    /// Creates a new event for a run.
    #[must_use]
    pub fn new(event_type: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data: serde_json::json!({ "run_id": run_id }),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: &str, value: serde_json::Value) -> Self {
        if let Some(map) = self.data.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// The payload handed to sinks, including the timestamp.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        let mut data = self.data.clone();
        if let Some(map) = data.as_object_mut() {
            map.insert("timestamp".to_string(), serde_json::json!(self.timestamp));
        }
        data
    }

    /// Creates a "pipeline.started" event.
    #[must_use]
    pub fn pipeline_started(run_id: Uuid, runtime_version: &str) -> Self {
        Self::new("pipeline.started", run_id)
            .add_data("runtime_version", serde_json::json!(runtime_version))
    }

    /// Creates a "pipeline.succeeded" or "pipeline.failed" event.
    #[must_use]
    pub fn pipeline_finished(run_id: Uuid, succeeded: bool, duration_ms: f64) -> Self {
        let event_type = if succeeded {
            "pipeline.succeeded"
        } else {
            "pipeline.failed"
        };
        Self::new(event_type, run_id).add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn stage_started(run_id: Uuid, stage: StageName) -> Self {
        Self::new("stage.started", run_id).add_data("stage", serde_json::json!(stage))
    }

    /// Creates a "stage.completed" event.
    #[must_use]
    pub fn stage_completed(run_id: Uuid, stage: StageName, duration_ms: f64) -> Self {
        Self::new("stage.completed", run_id)
            .add_data("stage", serde_json::json!(stage))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn stage_failed(run_id: Uuid, stage: StageName, error: serde_json::Value) -> Self {
        Self::new("stage.failed", run_id)
            .add_data("stage", serde_json::json!(stage))
            .add_data("error", error)
    }

    /// Creates a "stage.retrying" event.
    #[must_use]
    pub fn stage_retrying(run_id: Uuid, stage: StageName, attempt: u32, delay_ms: u64) -> Self {
        Self::new("stage.retrying", run_id)
            .add_data("stage", serde_json::json!(stage))
            .add_data("attempt", serde_json::json!(attempt))
            .add_data("delay_ms", serde_json::json!(delay_ms))
    }
}
