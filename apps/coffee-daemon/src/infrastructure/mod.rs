//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the port interfaces defined in the
//! application layer, plus the local HTTP surface.

/// Configuration loading from the environment.
pub mod config;

/// Token bundle persistence and lifecycle management.
pub mod auth;

/// Vendor API adapters: event stream, heartbeat, REST verbs.
pub mod homeconnect;

/// Durable event history and the persistence worker.
pub mod history;

/// Fan-out registry for local SSE subscribers.
pub mod broadcast;

/// Local HTTP API and SSE endpoint.
pub mod http;

/// Prometheus metric registration.
pub mod metrics;

/// Tracing initialization.
pub mod telemetry;
