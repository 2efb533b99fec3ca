//! Port Interfaces
//!
//! The contracts between the event pipeline and its adapters, following the
//! Hexagonal Architecture pattern. The stream reader, heartbeat monitor and
//! history persister depend only on these traits, so the pipeline can be
//! exercised in tests without the HTTP layer or the vendor API.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`EventSink`]: fan-out of live events to local subscribers
//! - [`TokenProvider`]: bearer tokens for authenticated vendor calls
//! - [`EventStore`]: durable append of history records

use async_trait::async_trait;
use serde_json::Value;

/// Destination for live events.
///
/// Implementations must be cheap when nobody is listening and must never
/// block the caller on a slow subscriber.
pub trait EventSink: Send + Sync {
    /// Deliver one event to all current subscribers.
    fn broadcast_event(&self, event_type: &str, payload: &Value);
}

/// Source of valid bearer tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a currently valid access token, refreshing if necessary.
    async fn access_token(&self) -> anyhow::Result<String>;

    /// Refresh unconditionally and return the new access token.
    ///
    /// Used after a `401` response, where the current token is known bad
    /// regardless of its recorded expiry.
    async fn force_refresh(&self) -> anyhow::Result<String>;
}

/// Durable, append-only destination for history records.
pub trait EventStore: Send + Sync {
    /// Append one record, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; callers on the hot path log and
    /// drop rather than propagate.
    fn append(&self, event_type: &str, payload: &Value) -> anyhow::Result<()>;
}
