//! History Persistence Worker
//!
//! Decouples "event observed" from "event durably stored": the stream reader
//! enqueues records onto a bounded channel and a single worker task writes
//! them to the store, so storage latency never blocks stream consumption.
//!
//! The queue is bounded with a block-with-timeout overflow policy: an
//! enqueue that cannot complete within the configured timeout drops the
//! record with a warning and a counter bump. Queue depth is surfaced as a
//! gauge. Store failures are logged and the worker continues; a failed write
//! is not retried and that record is lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::EventStore;
use crate::domain::event::HistoryRecord;
use crate::infrastructure::config::PersisterSettings;
use crate::infrastructure::metrics::{
    record_event_dropped, record_event_persisted, set_persist_queue_depth,
};

/// Producer half of the persistence hand-off.
///
/// Cheap to clone; the stream reader holds one.
#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::Sender<HistoryRecord>,
    depth: Arc<AtomicUsize>,
    settings: PersisterSettings,
}

impl PersistQueue {
    /// Enqueue one record for asynchronous persistence.
    ///
    /// Never returns an error: overflow and closed-channel failures are
    /// logged and counted, and the record is dropped.
    pub async fn enqueue(&self, record: HistoryRecord) {
        let event_type = record.event_type.clone();
        match self
            .tx
            .send_timeout(record, self.settings.enqueue_timeout)
            .await
        {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
                set_persist_queue_depth(depth);
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                record_event_dropped();
                tracing::warn!(
                    event_type,
                    depth = self.depth.load(Ordering::SeqCst),
                    "persistence queue full, dropping event"
                );
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                record_event_dropped();
                tracing::warn!(event_type, "persistence worker gone, dropping event");
            }
        }
    }

    /// Current queue depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// The single worker task draining the queue into the store.
pub struct HistoryPersister {
    rx: mpsc::Receiver<HistoryRecord>,
    store: Arc<dyn EventStore>,
    depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl HistoryPersister {
    /// Create the queue/worker pair.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        settings: PersisterSettings,
        cancel: CancellationToken,
    ) -> (PersistQueue, Self) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let depth = Arc::new(AtomicUsize::new(0));
        (
            PersistQueue {
                tx,
                depth: Arc::clone(&depth),
                settings,
            },
            Self {
                rx,
                store,
                depth,
                cancel,
            },
        )
    }

    /// Run the worker until cancelled, then drain what is already queued.
    pub async fn run(mut self) {
        tracing::debug!("history persister started");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    // Persist what was accepted before shutdown.
                    while let Ok(record) = self.rx.try_recv() {
                        self.persist(record).await;
                    }
                    break;
                }
                record = self.rx.recv() => {
                    match record {
                        Some(record) => self.persist(record).await,
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("history persister stopped");
    }

    /// Write one record; store errors are logged, never propagated.
    async fn persist(&self, record: HistoryRecord) {
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        set_persist_queue_depth(depth);

        let store = Arc::clone(&self.store);
        let event_type = record.event_type.clone();
        let result =
            tokio::task::spawn_blocking(move || store.append(&record.event_type, &record.payload))
                .await;

        match result {
            Ok(Ok(())) => record_event_persisted(),
            Ok(Err(error)) => {
                tracing::error!(event_type, error = %error, "failed to persist event");
            }
            Err(error) => {
                tracing::error!(event_type, error = %error, "persistence task panicked");
            }
        }
    }
}
