//! Daemon Configuration Settings
//!
//! Configuration types for the daemon, loaded from environment variables.
//! Variable names follow the vendor integration conventions
//! (`HOME_CONNECT_*`) with daemon-local knobs under `COFFEE_*`.

use std::path::PathBuf;
use std::time::Duration;

/// Default events stream URL.
const DEFAULT_EVENTS_URL: &str = "https://api.home-connect.com/api/homeappliances/events";

/// Default REST API base URL.
const DEFAULT_API_BASE_URL: &str = "https://api.home-connect.com/api";

/// Default OAuth token endpoint.
const DEFAULT_TOKEN_URL: &str = "https://api.home-connect.com/security/oauth/token";

/// Default OAuth scope requested at authorization time.
const DEFAULT_SCOPE: &str = "IdentifyAppliance Control CoffeeMaker Settings Monitor";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// One or more required environment variables are unset.
    #[error("missing environment variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    /// An environment variable holds an unparseable value.
    #[error("invalid value for {variable}: {value}")]
    InvalidValue {
        /// Variable name.
        variable: &'static str,
        /// Offending value.
        value: String,
    },
}

/// OAuth client credentials.
#[derive(Clone)]
pub struct Credentials {
    client_id: String,
    client_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
        }
    }

    /// Get the OAuth client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the OAuth client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Event stream connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Events stream URL.
    pub events_url: String,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Pause between retries after transient connection failures.
    pub retry_pause: Duration,
    /// Initial backoff after a rate-limit response.
    pub rate_limit_backoff_initial: Duration,
    /// Maximum backoff after consecutive rate-limit responses.
    pub rate_limit_backoff_max: Duration,
    /// Maximum gap between liveness signals before the stream is stale.
    pub heartbeat_timeout: Duration,
    /// Period of the heartbeat monitor tick.
    pub heartbeat_check_interval: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            events_url: DEFAULT_EVENTS_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            retry_pause: Duration::from_secs(10),
            rate_limit_backoff_initial: Duration::from_secs(60),
            rate_limit_backoff_max: Duration::from_secs(300),
            // Upstream KEEP-ALIVEs arrive roughly every 55s; 180s tolerates
            // about three missed ones.
            heartbeat_timeout: Duration::from_secs(180),
            heartbeat_check_interval: Duration::from_secs(30),
        }
    }
}

/// History persister settings.
#[derive(Debug, Clone, Copy)]
pub struct PersisterSettings {
    /// Capacity of the bounded persistence queue.
    pub queue_capacity: usize,
    /// Maximum time an enqueue may wait on a full queue before dropping.
    pub enqueue_timeout: Duration,
}

impl Default for PersisterSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_millis(100),
        }
    }
}

/// Local server settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Local HTTP port.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8080 }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// OAuth client credentials.
    pub credentials: Credentials,
    /// Home appliance id.
    pub haid: String,
    /// OAuth scope.
    pub scope: String,
    /// Path of the persisted token bundle.
    pub token_path: PathBuf,
    /// Path of the event history database (or the legacy JSON file).
    pub history_path: PathBuf,
    /// OAuth token endpoint.
    pub token_url: String,
    /// REST API base URL.
    pub api_base_url: String,
    /// Local server settings.
    pub server: ServerSettings,
    /// Event stream settings.
    pub stream: StreamSettings,
    /// Persister settings.
    pub persister: PersisterSettings,
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingVariables`] naming every unset required
    /// variable, or [`ConfigError::InvalidValue`] for unparseable numbers.
    pub fn from_env() -> Result<Self, ConfigError> {
        const REQUIRED: [&str; 3] = [
            "HOME_CONNECT_CLIENT_ID",
            "HOME_CONNECT_CLIENT_SECRET",
            "HOME_CONNECT_HAID",
        ];

        let missing: Vec<String> = REQUIRED
            .iter()
            .filter(|var| env_non_empty(var).is_none())
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingVariables(missing));
        }

        let credentials = Credentials::new(
            std::env::var("HOME_CONNECT_CLIENT_ID").unwrap_or_default(),
            std::env::var("HOME_CONNECT_CLIENT_SECRET").unwrap_or_default(),
        );
        let haid = std::env::var("HOME_CONNECT_HAID").unwrap_or_default();
        let scope =
            env_non_empty("HOME_CONNECT_SCOPE").unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        let token_path = PathBuf::from(
            env_non_empty("HOME_CONNECT_TOKEN_PATH").unwrap_or_else(|| "tokens.json".to_string()),
        );
        let history_path = PathBuf::from(
            env_non_empty("COFFEE_HISTORY_PATH").unwrap_or_else(|| "history.db".to_string()),
        );

        let mut stream = StreamSettings {
            events_url: env_non_empty("COFFEE_EVENTS_URL")
                .unwrap_or_else(|| DEFAULT_EVENTS_URL.to_string()),
            ..StreamSettings::default()
        };
        // Lets tests shrink the timeout without touching the defaults.
        if let Some(secs) = env_non_empty("HEARTBEAT_TEST_TIMEOUT") {
            let parsed = secs
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    variable: "HEARTBEAT_TEST_TIMEOUT",
                    value: secs,
                })?;
            stream.heartbeat_timeout = Duration::from_secs(parsed);
        }

        let mut persister = PersisterSettings::default();
        if let Some(capacity) = env_non_empty("COFFEE_PERSIST_QUEUE_CAPACITY") {
            persister.queue_capacity =
                capacity
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidValue {
                        variable: "COFFEE_PERSIST_QUEUE_CAPACITY",
                        value: capacity,
                    })?;
        }

        let mut server = ServerSettings::default();
        if let Some(port) = env_non_empty("COFFEE_HTTP_PORT") {
            server.http_port = port.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                variable: "COFFEE_HTTP_PORT",
                value: port,
            })?;
        }

        Ok(Self {
            credentials,
            haid,
            scope,
            token_path,
            history_path,
            token_url: env_non_empty("COFFEE_TOKEN_URL")
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            api_base_url: env_non_empty("COFFEE_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            server,
            stream,
            persister,
        })
    }
}

fn env_non_empty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new("id".to_string(), "secret".to_string());
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn stream_defaults() {
        let settings = StreamSettings::default();
        assert_eq!(settings.retry_pause, Duration::from_secs(10));
        assert_eq!(settings.rate_limit_backoff_initial, Duration::from_secs(60));
        assert_eq!(settings.rate_limit_backoff_max, Duration::from_secs(300));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(180));
        assert_eq!(settings.heartbeat_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn persister_defaults() {
        let settings = PersisterSettings::default();
        assert_eq!(settings.queue_capacity, 1024);
        assert_eq!(settings.enqueue_timeout, Duration::from_millis(100));
    }
}
