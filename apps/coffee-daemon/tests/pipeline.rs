//! End-to-end tests of the ingestion pipeline: stream decoding, persistence
//! through the queue, and fan-out to subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coffee_daemon::{
    BackoffConfig, BroadcastRegistry, EventSink, EventStore, EventStreamClient, HeartbeatState,
    HistoryPersister, HistoryRecord, HistoryStore, PersisterSettings, StreamConfig, TokenProvider,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct StaticTokens(&'static str);

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.0.to_string())
    }

    async fn force_refresh(&self) -> anyhow::Result<String> {
        Ok(self.0.to_string())
    }
}

async fn wait_for_count(store: &HistoryStore, expected: u64) {
    for _ in 0..200 {
        if store.event_count().unwrap() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("store never reached {expected} events");
}

/// Events enqueued with no subscribers still land in history, in order, and
/// the broadcast side stays a no-op.
#[tokio::test]
async fn events_persist_in_order_with_no_subscribers() {
    let store = Arc::new(HistoryStore::open_in_memory().unwrap());
    let registry = Arc::new(BroadcastRegistry::new());
    let cancel = CancellationToken::new();
    let (queue, worker) = HistoryPersister::new(
        Arc::clone(&store) as Arc<dyn EventStore>,
        PersisterSettings::default(),
        cancel.clone(),
    );
    tokio::spawn(worker.run());

    // Nobody is listening: broadcast returns immediately.
    registry.broadcast_event("a", &json!({"i": 0}));
    assert_eq!(registry.client_count(), 0);

    for i in 0..2 {
        queue
            .enqueue(HistoryRecord::new("a".to_string(), json!({"i": i})))
            .await;
    }

    wait_for_count(&store, 2).await;
    let events = store.get_history(Some("a"), None, None).unwrap();
    let order: Vec<i64> = events
        .iter()
        .map(|e| e.data["i"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![0, 1]);

    cancel.cancel();
}

/// The reader consumes a real SSE body: keep-alives update the heartbeat,
/// events are classified into history and forwarded to subscribers.
#[tokio::test]
async fn stream_reader_ingests_persists_and_broadcasts() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: KEEP-ALIVE\ndata:\n\n",
        "event: STATUS\ndata: {\"items\":[{\"key\":\"k\",\"value\":1}]}\n\n",
        "event: NOTIFY\ndata: {\"items\":[{\"key\":\"BSH.Common.Root.ActiveProgram\",",
        "\"value\":\"ConsumerProducts.CoffeeMaker.Program.Beverage.Espresso\"}]}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/events"))
        .and(header("authorization", "Bearer token-123"))
        .and(header("accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(body, "text/event-stream"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // After the body is exhausted the reader reconnects; keep it parked in
    // the transient-failure pause so events are ingested exactly once.
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = Arc::new(HistoryStore::open_in_memory().unwrap());
    let registry = Arc::new(BroadcastRegistry::new());
    let heartbeat = Arc::new(HeartbeatState::new());
    let cancel = CancellationToken::new();
    let (queue, worker) = HistoryPersister::new(
        Arc::clone(&store) as Arc<dyn EventStore>,
        PersisterSettings::default(),
        cancel.clone(),
    );
    tokio::spawn(worker.run());

    let (_subscriber, mut rx) = registry.subscribe();

    let reader = Arc::new(EventStreamClient::new(
        StreamConfig {
            events_url: format!("{}/events", server.uri()),
            connect_timeout: Duration::from_secs(1),
            backoff: BackoffConfig {
                // Keep the reconnect loop polite while the test tears down.
                retry_pause: Duration::from_secs(30),
                ..BackoffConfig::default()
            },
        },
        Arc::new(StaticTokens("token-123")),
        Arc::clone(&registry) as Arc<dyn EventSink>,
        queue,
        Arc::clone(&heartbeat),
        cancel.clone(),
    ));
    let handle = tokio::spawn(Arc::clone(&reader).run());

    // STATUS yields status + status_changed, NOTIFY yields notify +
    // program_started: four records per pass of the body.
    wait_for_count(&store, 4).await;

    assert_eq!(store.get_history(Some("status"), None, None).unwrap().len(), 1);
    assert_eq!(
        store
            .get_history(Some("status_changed"), None, None)
            .unwrap()
            .len(),
        1
    );
    let programs = store
        .get_history(Some("program_started"), None, None)
        .unwrap();
    assert_eq!(programs.len(), 1);
    assert_eq!(
        programs[0].data["program"],
        "ConsumerProducts.CoffeeMaker.Program.Beverage.Espresso"
    );

    assert!(heartbeat.observed_any());

    // Subscriber saw connected, then the two real events in order.
    let connected = format!("{:?}", rx.recv().await.unwrap());
    assert!(connected.contains("connected"));
    let status = format!("{:?}", rx.recv().await.unwrap());
    assert!(status.contains("STATUS"));
    let notify = format!("{:?}", rx.recv().await.unwrap());
    assert!(notify.contains("NOTIFY"));

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
}
