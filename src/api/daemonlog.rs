//! In-memory fanout of the daemon's own tracing events, for `GET /v1/logs`.
//! A `tracing_subscriber::Layer` captures every event's formatted message
//! alongside whether it came from the access-log target, and republishes it
//! on a broadcast channel; slow or absent subscribers just miss old lines
//! rather than back-pressuring the rest of the daemon.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};

const ACCESS_LOG_TARGET: &str = "wharfd::access_log";

#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: String,
    pub target: String,
    pub message: String,
    pub is_access_log: bool,
}

#[derive(Clone)]
pub struct DaemonLogBroadcaster {
    tx: broadcast::Sender<LogLine>,
}

impl DaemonLogBroadcaster {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }

    fn publish(&self, line: LogLine) {
        let _ = self.tx.send(line);
    }
}

pub struct DaemonLogLayer {
    broadcaster: Arc<DaemonLogBroadcaster>,
}

impl DaemonLogLayer {
    pub fn new(broadcaster: Arc<DaemonLogBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for DaemonLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        self.broadcaster.publish(LogLine {
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.message,
            is_access_log: metadata.target() == ACCESS_LOG_TARGET,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_receives_published_line() {
        let broadcaster = DaemonLogBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        broadcaster.publish(LogLine {
            level: "INFO".to_string(),
            target: "wharfd::access_log".to_string(),
            message: "hello".to_string(),
            is_access_log: true,
        });
        let received = rx.try_recv().unwrap();
        assert_eq!(received.message, "hello");
        assert!(received.is_access_log);
    }
}
