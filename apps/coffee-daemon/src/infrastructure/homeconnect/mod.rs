//! Vendor API Adapters
//!
//! Everything that talks to the appliance cloud: the long-lived event stream
//! subscription, the heartbeat supervision of that stream, the reconnect
//! backoff policy, and the REST verb wrappers used by the local endpoints.

/// Incremental SSE frame codec.
pub mod sse;

/// Reconnect pause and rate-limit backoff policy.
pub mod backoff;

/// Stream liveness state and the heartbeat monitor.
pub mod heartbeat;

/// The event stream reader.
pub mod stream;

/// REST verb wrappers for appliance control.
pub mod rest;

pub use backoff::{BackoffConfig, ConnectBackoff};
pub use heartbeat::{HeartbeatMonitor, HeartbeatState};
pub use rest::{ApiError, ApplianceClient, WakeOutcome};
pub use sse::{SseCodec, SseFrame};
pub use stream::{EventStreamClient, StreamConfig};
