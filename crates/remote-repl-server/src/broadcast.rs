//! Fan-out of process-wide events to every connected client.

use std::io::Write;

use remote_repl_engine::OutputSink;
use remote_repl_wire::{Message, Value};
use tokio::sync::broadcast;

/// Event published to every live connection.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Output written to the process's stdout.
    Out(String),
    /// Output written to the process's stderr.
    Err(String),
    /// A watchpoint was created by running code.
    WatchHit {
        watch_id: String,
        file: String,
        line: i64,
    },
}

impl ServerEvent {
    /// The unsolicited message sent to clients for this event.
    #[must_use]
    pub fn to_message(&self) -> Message {
        match self {
            Self::Out(text) => Message::new().with("out", text.as_str()),
            Self::Err(text) => Message::new().with("err", text.as_str()),
            Self::WatchHit {
                watch_id,
                file,
                line,
            } => Message::of("hit_watch")
                .with("id", watch_id.as_str())
                .with("file", file.as_str())
                .with("line", *line)
                .with("status", Value::strings(["done"])),
        }
    }
}

/// Broadcast channel shared by all connections.
///
/// Senders never block; a connection that falls behind skips events rather
/// than stalling the publisher.
#[derive(Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<ServerEvent>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped if there are none.
    pub fn publish(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }
}

/// Output destination handed to the execution engine.
///
/// Every write goes to the real device and is republished as an `out`/`err`
/// notification to every connected client. The stdout/stderr locks serialize
/// concurrent writers.
pub struct BroadcastSink {
    broadcaster: Broadcaster,
}

impl BroadcastSink {
    #[must_use]
    pub const fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }
}

impl OutputSink for BroadcastSink {
    fn write_out(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
        self.broadcaster.publish(ServerEvent::Out(text.to_owned()));
    }

    fn write_err(&self, text: &str) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(text.as_bytes());
        let _ = err.flush();
        self.broadcaster.publish(ServerEvent::Err(text.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_hit_message_shape() {
        let msg = ServerEvent::WatchHit {
            watch_id: "w1".into(),
            file: "/tmp/f".into(),
            line: 22,
        }
        .to_message();

        assert_eq!(msg.op(), Some("hit_watch"));
        assert_eq!(msg.get_str("id"), Some("w1"));
        assert_eq!(msg.get_int("line"), Some(22));
        assert_eq!(msg.status(), Some(vec!["done"]));
        // broadcasts are not addressed to any session
        assert!(!msg.contains_key("session"));
    }

    #[test]
    fn output_messages_are_single_key() {
        let msg = ServerEvent::Out("hi\n".into()).to_message();
        assert_eq!(msg.get_str("out"), Some("hi\n"));
        assert_eq!(msg.fields().len(), 1);
    }

    #[tokio::test]
    async fn sink_publishes_to_subscribers() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        let sink = BroadcastSink::new(broadcaster.clone());
        sink.write_out("ping");

        match rx.recv().await.unwrap() {
            ServerEvent::Out(text) => assert_eq!(text, "ping"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
