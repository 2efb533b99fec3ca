//! Stream Heartbeat Supervision
//!
//! The upstream sends `KEEP-ALIVE` frames roughly every 55 seconds. A
//! connection can stall silently at the socket level, so liveness is tracked
//! by timestamp: every keep-alive or real event refreshes the heartbeat, and
//! a monitor task periodically checks the gap, publishes the stream status to
//! local subscribers, and forces a reconnect once the gap exceeds the
//! configured timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::application::ports::EventSink;
use crate::domain::event::STREAM_STATUS;

/// Liveness state shared between the stream reader and the monitor.
///
/// Guarded by its own lock, independent of the subscriber list, so heartbeat
/// updates never contend with fan-out.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    // Monotonic instant for staleness math, wall clock for reporting.
    last_seen: Mutex<Option<(Instant, DateTime<Utc>)>>,
    force_reconnect: AtomicBool,
}

impl HeartbeatState {
    /// Create fresh state with no heartbeat observed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a liveness signal (keep-alive or real event).
    pub fn record(&self) {
        *self.last_seen.lock() = Some((Instant::now(), Utc::now()));
    }

    /// Reset to "no heartbeat observed", so the next connection starts clean.
    pub fn clear(&self) {
        *self.last_seen.lock() = None;
    }

    /// Wall-clock time of the last liveness signal, if any.
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_seen.lock().map(|(_, at)| at)
    }

    /// Whether any liveness signal has been observed since the last reset.
    #[must_use]
    pub fn observed_any(&self) -> bool {
        self.last_seen.lock().is_some()
    }

    /// Whether the stream counts as live for the given timeout.
    ///
    /// A connection that has not yet produced its first heartbeat is treated
    /// as live; staleness requires an observed signal that has gone quiet.
    #[must_use]
    pub fn is_live(&self, timeout: Duration) -> bool {
        self.last_seen
            .lock()
            .is_none_or(|(instant, _)| instant.elapsed() < timeout)
    }

    /// Ask the stream reader to drop and re-establish the connection.
    pub fn request_reconnect(&self) {
        self.force_reconnect.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reconnect request, if one is set.
    pub fn take_reconnect_request(&self) -> bool {
        self.force_reconnect.swap(false, Ordering::SeqCst)
    }
}

/// Periodic liveness check publishing `STREAM_STATUS` to subscribers.
pub struct HeartbeatMonitor {
    state: Arc<HeartbeatState>,
    sink: Arc<dyn EventSink>,
    timeout: Duration,
    check_interval: Duration,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a new monitor.
    #[must_use]
    pub fn new(
        state: Arc<HeartbeatState>,
        sink: Arc<dyn EventSink>,
        timeout: Duration,
        check_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            sink,
            timeout,
            check_interval,
            cancel,
        }
    }

    /// Run the monitoring loop until cancelled.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; consume it so
        // every published status reflects a full check period.
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("heartbeat monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
    }

    /// One check: publish status, force a reconnect on staleness.
    fn tick(&self) {
        let connected = self.state.is_live(self.timeout);
        let last_heartbeat = self
            .state
            .last_heartbeat()
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true));

        self.sink.broadcast_event(
            STREAM_STATUS,
            &serde_json::json!({
                "stream_connected": connected,
                "last_heartbeat": last_heartbeat,
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            }),
        );

        if !connected && self.state.observed_any() {
            tracing::warn!(
                timeout_secs = self.timeout.as_secs(),
                "no liveness signal within the heartbeat timeout, forcing reconnect"
            );
            self.state.request_reconnect();
            self.state.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl EventSink for RecordingSink {
        fn broadcast_event(&self, event_type: &str, payload: &Value) {
            self.events
                .lock()
                .push((event_type.to_string(), payload.clone()));
        }
    }

    fn backdate(state: &HeartbeatState, by: Duration) {
        *state.last_seen.lock() = Some((
            Instant::now().checked_sub(by).unwrap(),
            Utc::now() - chrono::Duration::from_std(by).unwrap(),
        ));
    }

    #[test]
    fn fresh_state_counts_as_live() {
        let state = HeartbeatState::new();
        assert!(state.is_live(Duration::from_secs(1)));
        assert!(!state.observed_any());
    }

    #[test]
    fn recorded_heartbeat_within_timeout_is_live() {
        let state = HeartbeatState::new();
        state.record();
        assert!(state.is_live(Duration::from_secs(60)));
        assert!(state.observed_any());
    }

    #[test]
    fn stale_heartbeat_is_not_live() {
        let state = HeartbeatState::new();
        backdate(&state, Duration::from_millis(200));
        assert!(!state.is_live(Duration::from_millis(100)));
    }

    #[test]
    fn reconnect_request_is_consumed_once() {
        let state = HeartbeatState::new();
        assert!(!state.take_reconnect_request());
        state.request_reconnect();
        assert!(state.take_reconnect_request());
        assert!(!state.take_reconnect_request());
    }

    #[test]
    fn tick_publishes_status_and_forces_reconnect_when_stale() {
        let state = Arc::new(HeartbeatState::new());
        backdate(&state, Duration::from_millis(500));
        let sink = Arc::new(RecordingSink::default());
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&state),
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Duration::from_millis(100),
            Duration::from_secs(30),
            CancellationToken::new(),
        );

        monitor.tick();

        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, STREAM_STATUS);
        assert_eq!(events[0].1["stream_connected"], Value::Bool(false));
        assert!(events[0].1["last_heartbeat"].is_string());
        assert!(state.take_reconnect_request());
        // State is reset so the next connection starts clean.
        assert!(!state.observed_any());
    }

    #[test]
    fn tick_without_any_heartbeat_never_forces_reconnect() {
        let state = Arc::new(HeartbeatState::new());
        let sink = Arc::new(RecordingSink::default());
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&state),
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Duration::from_secs(180),
            Duration::from_secs(30),
            CancellationToken::new(),
        );

        monitor.tick();

        let events = sink.events.lock();
        assert_eq!(events[0].1["stream_connected"], Value::Bool(true));
        assert_eq!(events[0].1["last_heartbeat"], Value::Null);
        assert!(!state.take_reconnect_request());
    }

    #[tokio::test]
    async fn monitor_cancellation() {
        let monitor = HeartbeatMonitor::new(
            Arc::new(HeartbeatState::new()),
            Arc::new(RecordingSink::default()),
            Duration::from_secs(180),
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        let cancel = monitor.cancel.clone();

        let handle = tokio::spawn(monitor.run());
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "monitor should shut down on cancellation");
    }
}
