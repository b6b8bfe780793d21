//! Best-effort event emission
//!
//! Lifecycle events (circuit trips, orphan healing, migrations) go to
//! an [`EventSink`]. Emission is fire-and-forget: implementations
//! swallow their own failures so an unreachable bus can never abort
//! the operation that tried to emit.

use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

/// Best-effort sink for lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

/// Default sink: events land in the log stream.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &str, payload: Value) {
        info!(event = event, payload = %payload, "Event emitted");
    }
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

/// Sink that buffers events for inspection in tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<(String, Value)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &str, payload: Value) {
        self.events.lock().push((event.to_string(), payload));
    }
}
