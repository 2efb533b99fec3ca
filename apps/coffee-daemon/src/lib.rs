#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Coffee Daemon - Local Appliance Control and Event Mirror
//!
//! A local daemon that maintains a single subscription to the vendor's
//! appliance event stream (SSE), mirrors every event into a queryable SQLite
//! history, and multiplexes live events to local dashboard clients.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure event logic
//!   - `event`: event vocabulary, derived history records, brew classification
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: interfaces for fan-out, tokens and durable storage
//!   - `services`: supervisor of the background pipeline
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `homeconnect`: SSE stream reader, heartbeat, backoff, REST verbs
//!   - `history`: SQLite store and the persistence worker
//!   - `broadcast`: subscriber registry and fan-out
//!   - `http`: local HTTP API and SSE endpoint
//!   - `auth`: token bundle persistence and refresh lifecycle
//!   - `config`: environment configuration
//!
//! # Data Flow
//!
//! ```text
//!                       ┌─────────────┐    ┌───────────────┐
//! Appliance Cloud ─SSE─►│   Stream    │───►│ Persist Queue │──► SQLite
//!                       │   Reader    │    └───────────────┘
//!                       └──────┬──────┘
//!                              │         ┌──────────────┐──► Dashboard 1
//!                              └────────►│  Broadcast   │──► Dashboard 2
//!  Heartbeat Monitor ──STREAM_STATUS───► │  Registry    │──► Dashboard N
//!                                        └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Pure event types and classification logic.
pub mod domain;

/// Application layer - Ports and orchestration services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::event::HistoryRecord;

// Ports
pub use application::ports::{EventSink, EventStore, TokenProvider};

// Pipeline supervisor
pub use application::services::StreamSupervisor;

// Configuration
pub use infrastructure::config::{
    ConfigError, Credentials, DaemonConfig, PersisterSettings, ServerSettings, StreamSettings,
};

// Token lifecycle
pub use infrastructure::auth::{AuthError, TokenBundle, TokenManager};

// Stream adapters
pub use infrastructure::homeconnect::{
    ApiError, ApplianceClient, BackoffConfig, ConnectBackoff, EventStreamClient, HeartbeatMonitor,
    HeartbeatState, SseCodec, SseFrame, StreamConfig, WakeOutcome,
};

// History
pub use infrastructure::history::{
    ApiStatistics, HistoryError, HistoryPersister, HistoryStore, PersistQueue, StoredEvent,
};

// Broadcast registry
pub use infrastructure::broadcast::{BroadcastRegistry, SubscriberId};

// HTTP surface
pub use infrastructure::http::{AppState, HttpServer, router};

// Metrics and telemetry
pub use infrastructure::metrics::{get_metrics_handle, init_metrics};
pub use infrastructure::telemetry;
