//! Prometheus Metrics Module
//!
//! Exposes daemon metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Events**: received, persisted and dropped event counts
//! - **Stream**: connection attempts succeeded
//! - **Persistence**: queue depth
//! - **Subscribers**: live SSE subscriber count
//! - **Vendor API**: call and token refresh counts
//!
//! Metrics are exposed at `GET /metrics` on the local HTTP port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Safe to call repeatedly; only the first call installs the recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");
            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    describe_counter!(
        "coffee_daemon_events_received_total",
        "Events decoded from the appliance stream"
    );
    describe_counter!(
        "coffee_daemon_events_persisted_total",
        "Events durably written to the history store"
    );
    describe_counter!(
        "coffee_daemon_events_dropped_total",
        "Events dropped by the persistence queue"
    );
    describe_counter!(
        "coffee_daemon_stream_connects_total",
        "Successful connections to the appliance event stream"
    );
    describe_counter!(
        "coffee_daemon_api_calls_total",
        "REST calls issued against the appliance API"
    );
    describe_counter!(
        "coffee_daemon_token_refreshes_total",
        "OAuth token refreshes performed"
    );
    describe_gauge!(
        "coffee_daemon_persist_queue_depth",
        "Records waiting in the persistence queue"
    );
    describe_gauge!(
        "coffee_daemon_sse_subscribers",
        "Live local SSE subscribers"
    );
}

/// Count one event decoded from the stream.
pub fn record_event_received() {
    counter!("coffee_daemon_events_received_total").increment(1);
}

/// Count one event durably stored.
pub fn record_event_persisted() {
    counter!("coffee_daemon_events_persisted_total").increment(1);
}

/// Count one event dropped by the persistence queue.
pub fn record_event_dropped() {
    counter!("coffee_daemon_events_dropped_total").increment(1);
}

/// Count one successful stream connection.
pub fn record_stream_connect() {
    counter!("coffee_daemon_stream_connects_total").increment(1);
}

/// Count one vendor REST call.
pub fn record_api_call() {
    counter!("coffee_daemon_api_calls_total").increment(1);
}

/// Count one token refresh.
pub fn record_token_refresh() {
    counter!("coffee_daemon_token_refreshes_total").increment(1);
}

/// Publish the persistence queue depth.
pub fn set_persist_queue_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("coffee_daemon_persist_queue_depth").set(depth as f64);
}

/// Publish the live subscriber count.
pub fn set_subscriber_count(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("coffee_daemon_sse_subscribers").set(count as f64);
}
