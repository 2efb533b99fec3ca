//! Application Layer - Ports and orchestration services.
//!
//! Defines the interfaces between the core pipeline and its adapters, and
//! the supervisor that owns the background tasks.

/// Port interfaces implemented by the infrastructure layer.
pub mod ports;

/// Orchestration services for the background pipeline.
pub mod services;
