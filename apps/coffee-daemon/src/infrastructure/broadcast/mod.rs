//! Subscriber Broadcast Registry
//!
//! Thread-safe membership and fan-out for local dashboard subscribers. Each
//! subscriber is an unbounded channel feeding one SSE response; a failed send
//! means the connection is gone and the subscriber is evicted after the
//! fan-out loop, so one dead client never blocks delivery to the others.
//!
//! When nobody is subscribed, `broadcast_event` returns before doing any
//! serialization work, which keeps an idle daemon cheap.

use axum::response::sse::Event;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::application::ports::EventSink;
use crate::domain::event::CONNECTED;
use crate::infrastructure::metrics::set_subscriber_count;

/// Opaque identity of one subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Event>,
}

/// The set of live subscribers and the fan-out primitive.
#[derive(Default)]
pub struct BroadcastRegistry {
    clients: Mutex<Vec<Subscriber>>,
}

impl BroadcastRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its id and event receiver.
    ///
    /// The synthetic `connected` event is delivered to the new subscriber
    /// immediately; it will only ever see events emitted after this call.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriberId::new();

        let _ = tx.send(
            Event::default()
                .event(CONNECTED)
                .data(r#"{"message":"Connected"}"#),
        );
        self.add_client(id, tx);
        (id, rx)
    }

    /// Add a subscriber. Adding an already-registered id is a no-op.
    pub fn add_client(&self, id: SubscriberId, tx: mpsc::UnboundedSender<Event>) {
        let mut clients = self.clients.lock();
        if clients.iter().any(|c| c.id == id) {
            return;
        }
        clients.push(Subscriber { id, tx });
        let count = clients.len();
        drop(clients);

        set_subscriber_count(count);
        tracing::info!(%id, count, "subscriber added");
    }

    /// Remove a subscriber. Removing an absent id is a no-op.
    pub fn remove_client(&self, id: SubscriberId) {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|c| c.id != id);
        let count = clients.len();
        drop(clients);

        if count != before {
            set_subscriber_count(count);
            tracing::info!(%id, count, "subscriber removed");
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

impl EventSink for BroadcastRegistry {
    fn broadcast_event(&self, event_type: &str, payload: &Value) {
        let mut clients = self.clients.lock();
        if clients.is_empty() {
            return;
        }

        // Serialize once, then stamp per-subscriber frames from the string.
        let data = match serde_json::to_string(payload) {
            Ok(data) => data,
            Err(error) => {
                tracing::error!(event_type, error = %error, "failed to serialize event payload");
                return;
            }
        };

        let mut dead: Vec<SubscriberId> = Vec::new();
        for client in clients.iter() {
            let event = Event::default().event(event_type).data(&data);
            if client.tx.send(event).is_err() {
                dead.push(client.id);
            }
        }

        if !dead.is_empty() {
            clients.retain(|c| !dead.contains(&c.id));
            let count = clients.len();
            drop(clients);
            set_subscriber_count(count);
            for id in dead {
                tracing::debug!(%id, "dropping disconnected subscriber");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn next_event_type(rx: &mut mpsc::UnboundedReceiver<Event>) -> String {
        let event = rx.recv().await.expect("event expected");
        // Event has no public accessors; inspect its wire form.
        format!("{event:?}")
    }

    #[test]
    fn add_is_idempotent() {
        let registry = BroadcastRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = SubscriberId::new();

        registry.add_client(id, tx.clone());
        registry.add_client(id, tx);
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = BroadcastRegistry::new();
        let (id, _rx) = registry.subscribe();

        registry.remove_client(id);
        registry.remove_client(id);
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn broadcast_without_subscribers_is_a_noop() {
        let registry = BroadcastRegistry::new();
        registry.broadcast_event("STATUS", &json!({"x": 1}));
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_connected_then_events() {
        let registry = BroadcastRegistry::new();
        let (_id, mut rx) = registry.subscribe();

        let connected = next_event_type(&mut rx).await;
        assert!(connected.contains("connected"));

        registry.broadcast_event("STATUS", &json!({"x": 1}));
        let status = next_event_type(&mut rx).await;
        assert!(status.contains("STATUS"));
    }

    #[tokio::test]
    async fn failed_subscriber_is_evicted_and_others_still_receive() {
        let registry = BroadcastRegistry::new();
        let (_dead_id, dead_rx) = registry.subscribe();
        let (_live_id, mut live_rx) = registry.subscribe();
        assert_eq!(registry.client_count(), 2);

        // Simulate a disconnected dashboard tab.
        drop(dead_rx);

        registry.broadcast_event("EVENT", &json!({"items": []}));

        // The live subscriber got connected + the broadcast.
        let _connected = next_event_type(&mut live_rx).await;
        let event = next_event_type(&mut live_rx).await;
        assert!(event.contains("EVENT"));

        assert_eq!(registry.client_count(), 1);
    }

    #[tokio::test]
    async fn late_subscriber_sees_no_backfill() {
        let registry = BroadcastRegistry::new();
        registry.broadcast_event("STATUS", &json!({"early": true}));

        let (_id, mut rx) = registry.subscribe();
        let connected = next_event_type(&mut rx).await;
        assert!(connected.contains("connected"));
        // Nothing else queued: the pre-subscription event was never delivered.
        assert!(rx.try_recv().is_err());
    }
}
