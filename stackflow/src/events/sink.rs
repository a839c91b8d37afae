//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::Level;

/// Receives lifecycle events from the orchestrator and change set planner.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "stack.succeeded")
    /// * `data` - Optional event data
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event without awaiting. Must never fail.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to `tracing`.
///
/// Failure events (`*.failed`, `*.rolled_back`, `run.cancelled`) are logged
/// at warn level regardless of the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        let stack = data
            .and_then(|d| d.get("stack"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let run_id = data
            .and_then(|d| d.get("run_id"))
            .and_then(Value::as_str)
            .unwrap_or("");

        if is_failure(event_type) {
            tracing::warn!(event_type, stack, run_id, event_data = ?data, "Event: {}", event_type);
        } else if self.level == Level::DEBUG {
            tracing::debug!(event_type, stack, run_id, event_data = ?data, "Event: {}", event_type);
        } else {
            tracing::info!(event_type, stack, run_id, event_data = ?data, "Event: {}", event_type);
        }
    }
}

fn is_failure(event_type: &str) -> bool {
    event_type.ends_with(".failed") || event_type.ends_with(".rolled_back") || event_type == "run.cancelled"
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

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the collected event types, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns the stacks named by events of exactly `event_type`, in order.
    #[must_use]
    pub fn stacks_for(&self, event_type: &str) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .filter_map(|(_, data)| data.as_ref()?.get("stack")?.as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpEventSink.emit("run.started", None).await;
        let sink = LoggingEventSink::debug();
        sink.emit("stack.succeeded", Some(json!({"stack": "Iam"}))).await;
        sink.try_emit("stack.failed", Some(json!({"stack": "Iam", "error": "boom"})));
    }

    #[test]
    fn test_failure_classification() {
        assert!(is_failure("stack.failed"));
        assert!(is_failure("stack.rolled_back"));
        assert!(is_failure("run.cancelled"));
        assert!(!is_failure("stack.succeeded"));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("stack.resolving", Some(json!({"stack": "S3"}))).await;
        sink.try_emit("stack.succeeded", Some(json!({"stack": "S3"})));
        sink.try_emit("run.completed", None);

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stack.").len(), 2);
        assert_eq!(sink.stacks_for("stack.succeeded"), vec!["S3"]);
        assert_eq!(
            sink.event_types(),
            vec!["stack.resolving", "stack.succeeded", "run.completed"]
        );

        sink.clear();
        assert!(sink.is_empty());
    }
}
