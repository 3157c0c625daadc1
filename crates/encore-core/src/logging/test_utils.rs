//! In-memory tracing capture for tests.
//!
//! [`capture_logs`] installs a thread-local subscriber. Tokio tests on the
//! current-thread runtime see every event emitted by tasks they spawn.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// One recorded event.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    /// Event level.
    pub level: Level,
    /// Event target, usually the emitting module path.
    pub target: String,
    /// Rendered `message` field.
    pub message: String,
    /// Remaining fields in emission order.
    pub fields: Vec<(String, String)>,
}

impl CapturedEvent {
    /// Value of a recorded field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find_map(|(k, v)| (k == name).then_some(v.as_str()))
    }
}

/// Shared handle to everything captured so far.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<CapturedEvent>>>);

impl CapturedLogs {
    /// Snapshot of captured events.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.0.lock().clone()
    }

    /// Events whose message contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|e| e.message.contains(needle))
            .count()
    }

    /// Events at `level` whose message contains `needle`.
    pub fn count_at(&self, level: Level, needle: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|e| e.level == level && e.message.contains(needle))
            .count()
    }
}

#[derive(Default)]
struct Recorder {
    message: String,
    fields: Vec<(String, String)>,
}

impl Recorder {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_owned(), value));
        }
    }
}

impl Visit for Recorder {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_owned());
    }
}

struct CaptureLayer(CapturedLogs);

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut rec = Recorder::default();
        event.record(&mut rec);
        let meta = event.metadata();
        self.0.0.lock().push(CapturedEvent {
            level: *meta.level(),
            target: meta.target().to_owned(),
            message: rec.message,
            fields: rec.fields,
        });
    }
}

/// Capture every event on this thread until the guard drops.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let guard = tracing_subscriber::registry()
        .with(CaptureLayer(logs.clone()))
        .with(LevelFilter::TRACE)
        .set_default();
    (logs, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_fields_by_name() {
        let (logs, _guard) = capture_logs();
        tracing::info!(batch = 3u64, task_id = "task-1", "batch done");
        let events = logs.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "batch done");
        assert_eq!(events[0].field("batch"), Some("3"));
        assert_eq!(events[0].field("task_id"), Some("task-1"));
    }

    #[test]
    fn counts_by_level() {
        let (logs, _guard) = capture_logs();
        tracing::info!("dimension mismatch");
        tracing::warn!("dimension mismatch");
        tracing::warn!("dimension mismatch");
        assert_eq!(logs.count_matching("dimension mismatch"), 3);
        assert_eq!(logs.count_at(Level::WARN, "dimension mismatch"), 2);
    }

    #[test]
    fn keeps_target() {
        let (logs, _guard) = capture_logs();
        tracing::info!(target: "encore_runtime::turn_queue", "queue event");
        assert_eq!(logs.events()[0].target, "encore_runtime::turn_queue");
    }
}
