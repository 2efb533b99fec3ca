//! Application Services
//!
//! The supervisor owning the background half of the daemon: the stream
//! reader, the heartbeat monitor and the history persister.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::history::HistoryPersister;
use crate::infrastructure::homeconnect::{EventStreamClient, HeartbeatMonitor};

/// Owns and launches the background tasks of the event pipeline.
///
/// Constructed once at startup with every dependency injected; the HTTP
/// layer only ever sees `start`/`stop`.
pub struct StreamSupervisor {
    reader: Arc<EventStreamClient>,
    monitor: Mutex<Option<HeartbeatMonitor>>,
    persister: Mutex<Option<HistoryPersister>>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl StreamSupervisor {
    /// Create a supervisor over the assembled pipeline parts.
    #[must_use]
    pub fn new(
        reader: Arc<EventStreamClient>,
        monitor: HeartbeatMonitor,
        persister: HistoryPersister,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            monitor: Mutex::new(Some(monitor)),
            persister: Mutex::new(Some(persister)),
            cancel,
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the background tasks. Calling while running is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("event pipeline already running");
            return;
        }

        if let Some(persister) = self.persister.lock().take() {
            tokio::spawn(persister.run());
        }
        if let Some(monitor) = self.monitor.lock().take() {
            tokio::spawn(monitor.run());
        }
        tokio::spawn(Arc::clone(&self.reader).run());

        tracing::info!("event pipeline started");
    }

    /// Signal cooperative shutdown. Calling while stopped is a no-op.
    ///
    /// The tasks observe the cancellation between events and during sleeps;
    /// in-flight network reads are raced against it rather than aborted.
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping event pipeline");
        self.cancel.cancel();
    }

    /// Whether `start` has been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::ports::{EventSink, TokenProvider};
    use crate::infrastructure::config::PersisterSettings;
    use crate::infrastructure::history::HistoryStore;
    use crate::infrastructure::homeconnect::{
        BackoffConfig, HeartbeatState, StreamConfig,
    };

    struct NullSink;

    impl EventSink for NullSink {
        fn broadcast_event(&self, _event_type: &str, _payload: &serde_json::Value) {}
    }

    struct NullTokens;

    #[async_trait::async_trait]
    impl TokenProvider for NullTokens {
        async fn access_token(&self) -> anyhow::Result<String> {
            anyhow::bail!("no token in tests")
        }

        async fn force_refresh(&self) -> anyhow::Result<String> {
            anyhow::bail!("no token in tests")
        }
    }

    fn build_supervisor() -> StreamSupervisor {
        let cancel = CancellationToken::new();
        let store = std::sync::Arc::new(HistoryStore::open_in_memory().unwrap());
        let heartbeat = Arc::new(HeartbeatState::new());
        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
        let (queue, persister) = crate::infrastructure::history::HistoryPersister::new(
            store as _,
            PersisterSettings::default(),
            cancel.clone(),
        );
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&heartbeat),
            Arc::clone(&sink),
            Duration::from_secs(180),
            Duration::from_secs(30),
            cancel.clone(),
        );
        let reader = Arc::new(EventStreamClient::new(
            StreamConfig {
                events_url: "http://127.0.0.1:1/events".to_string(),
                connect_timeout: Duration::from_millis(100),
                backoff: BackoffConfig::default(),
            },
            Arc::new(NullTokens),
            sink,
            queue,
            heartbeat,
            cancel.clone(),
        ));
        StreamSupervisor::new(reader, monitor, persister, cancel)
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let supervisor = build_supervisor();
        assert!(!supervisor.is_running());

        supervisor.start();
        assert!(supervisor.is_running());
        assert!(supervisor.monitor.lock().is_none());

        // Second start must not panic on the consumed parts.
        supervisor.start();
        assert!(supervisor.is_running());

        supervisor.stop();
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let supervisor = build_supervisor();
        supervisor.stop();
        assert!(!supervisor.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn stop_cancels_the_pipeline() {
        let supervisor = build_supervisor();
        supervisor.start();
        supervisor.stop();
        assert!(supervisor.cancel.is_cancelled());
    }
}
