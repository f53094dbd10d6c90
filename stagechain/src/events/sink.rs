//! Where invocation events go.
//!
//! Every payload an [`InvocationContext`](crate::context::InvocationContext)
//! emits is a JSON object carrying `pipeline` and `run_id`, plus `scope`
//! when raised inside a composite. Stage events add `stage`; branch events
//! add `group` and `branch`.

use super::names;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Receives lifecycle events from one pipeline.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers an event, waiting on the sink if it needs to.
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Delivers an event from inside a running stage.
    ///
    /// Must not block and must not panic.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event. The default sink of a [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Forwards events to `tracing` with the run identity as fields.
///
/// Failure events go out at `warn`, pipeline events at `info`, and stage
/// events at `debug` unless [`with_stage_events`](Self::with_stage_events)
/// raises them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink {
    stage_events_at_info: bool,
}

impl LoggingEventSink {
    /// Creates a sink that logs stage events at `debug`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs stage events at `info` as well.
    #[must_use]
    pub fn with_stage_events(mut self, at_info: bool) -> Self {
        self.stage_events_at_info = at_info;
        self
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        let field = |key: &str| {
            data.and_then(|d| d.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let pipeline = field("pipeline");
        let run_id = field("run_id");
        let stage = field("stage");

        if event_type == names::BRANCH_FAILED {
            warn!(
                %pipeline,
                %run_id,
                group = %field("group"),
                branch = %field("branch"),
                error = %field("error"),
                "{event_type}"
            );
        } else if event_type.ends_with(".failed") {
            warn!(%pipeline, %run_id, %stage, event_data = ?data, "{event_type}");
        } else if event_type.starts_with("pipeline.") || self.stage_events_at_info {
            info!(%pipeline, %run_id, %stage, "{event_type}");
        } else {
            debug!(%pipeline, %run_id, %stage, "{event_type}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the collected event types, in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns the `stage` field of every `event_type` event, in order.
    #[must_use]
    pub fn stage_ids(&self, event_type: &str) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .filter_map(|(_, data)| data.as_ref()?.get("stage")?.as_str().map(String::from))
            .collect()
    }

    /// Forgets everything collected so far.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    fn push(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.push(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.push(event_type, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_logging_sink_accepts_every_event_family() {
        let sink = LoggingEventSink::new().with_stage_events(true);
        sink.emit(names::PIPELINE_STARTED, Some(json!({"pipeline": "p", "run_id": "r"})))
            .await;
        sink.try_emit(names::STAGE_COMPLETED, Some(json!({"stage": "format"})));
        sink.try_emit(
            names::BRANCH_FAILED,
            Some(json!({"group": "g", "branch": "b", "error": "down"})),
        );
        sink.try_emit(names::STAGE_FAILED, None);
    }

    #[tokio::test]
    async fn test_collecting_sink_filters_by_type_and_stage() {
        let sink = CollectingEventSink::new();

        sink.emit(names::PIPELINE_STARTED, None).await;
        sink.try_emit(names::STAGE_STARTED, Some(json!({"stage": "format"})));
        sink.try_emit(names::STAGE_COMPLETED, Some(json!({"stage": "format"})));
        sink.try_emit(names::STAGE_COMPLETED, Some(json!({"stage": "parse"})));

        assert_eq!(sink.event_types()[1], "stage.started");
        assert_eq!(sink.events_of_type("stage.").len(), 3);
        assert_eq!(sink.stage_ids(names::STAGE_COMPLETED), ["format", "parse"]);

        sink.clear();
        assert!(sink.events().is_empty());
    }
}
