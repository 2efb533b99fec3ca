//! Configuration Module
//!
//! Configuration loading and dependency injection for the daemon.

mod settings;

pub use settings::{
    ConfigError, Credentials, DaemonConfig, PersisterSettings, ServerSettings, StreamSettings,
};
