//! A [`ReplySink`](archon_core::ports::ReplySink) backed by a
//! `tokio::sync::broadcast` channel, fanning every published event out to
//! every `SubscribeEvents` gRPC stream currently attached
//! (`archon_core::link::ControllerLink::subscribe_status`'s "latest value
//! per subscriber" coalescing does not apply here: `spec.md` §6 events are
//! discrete notifications, not a state snapshot, so a slow subscriber drops
//! the oldest rather than collapsing into the newest).

use archon_core::ports::ReplySink;
use archon_proto::convert::event_from_publish;
use archon_proto::Event;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel backing [`EventBus`]. A subscriber
/// lagging more than this many events behind drops the oldest rather than
/// blocking publishers, since a gRPC event stream is advisory telemetry,
/// not an exactly-once log.
const CHANNEL_CAPACITY: usize = 1024;

/// Fans published events out to every attached `SubscribeEvents` stream.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates an empty bus with no subscribers yet.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribes to every future event. Events published before this call
    /// are not replayed, matching `tokio::sync::broadcast`'s semantics.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplySink for EventBus {
    async fn publish(&self, key: &str, payload: Value) {
        let controller = payload
            .get("controller")
            .and_then(Value::as_str)
            .unwrap_or("*")
            .to_string();
        let event = event_from_publish(key, &controller, &payload, Utc::now());
        // No subscribers is the common case outside an active `SubscribeEvents`
        // call; `send` returning an error just means nobody is listening.
        let _ = self.tx.send(event);
    }
}
