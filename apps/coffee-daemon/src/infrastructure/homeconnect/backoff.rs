//! Reconnect Backoff Policy
//!
//! Two-tier retry policy for the event stream connection: transient
//! failures (refused, timeout, server error) wait a fixed pause, while
//! rate-limit responses escalate through capped exponential backoff that
//! resets after the next successful connection.

use std::time::Duration;

/// Configuration for reconnect behavior.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Fixed pause after a transient connection failure.
    pub retry_pause: Duration,
    /// Initial delay after a rate-limit response.
    pub rate_limit_initial: Duration,
    /// Maximum delay between rate-limited attempts.
    pub rate_limit_max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            retry_pause: Duration::from_secs(10),
            rate_limit_initial: Duration::from_secs(60),
            rate_limit_max: Duration::from_secs(300),
        }
    }
}

/// Reconnect policy tracking consecutive rate-limit responses.
#[derive(Debug)]
pub struct ConnectBackoff {
    config: BackoffConfig,
    current_rate_limit_delay: Duration,
    consecutive_rate_limits: u32,
}

impl ConnectBackoff {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            current_rate_limit_delay: config.rate_limit_initial,
            consecutive_rate_limits: 0,
            config,
        }
    }

    /// Delay to wait after a transient connection failure.
    #[must_use]
    pub const fn retry_pause(&self) -> Duration {
        self.config.retry_pause
    }

    /// Register a rate-limit response and return the delay to wait.
    ///
    /// Doubles on each consecutive occurrence, capped at the configured
    /// maximum.
    pub fn on_rate_limited(&mut self) -> Duration {
        self.consecutive_rate_limits += 1;
        let delay = self.current_rate_limit_delay;
        self.current_rate_limit_delay = self
            .current_rate_limit_delay
            .saturating_mul(2)
            .min(self.config.rate_limit_max);
        delay
    }

    /// Reset the rate-limit escalation after a successful connection.
    pub const fn on_connected(&mut self) {
        self.current_rate_limit_delay = self.config.rate_limit_initial;
        self.consecutive_rate_limits = 0;
    }

    /// Number of consecutive rate-limit responses seen.
    #[must_use]
    pub const fn consecutive_rate_limits(&self) -> u32 {
        self.consecutive_rate_limits
    }
}

impl Default for ConnectBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_backoff_doubles_from_sixty_seconds() {
        let mut backoff = ConnectBackoff::default();

        assert_eq!(backoff.on_rate_limited(), Duration::from_secs(60));
        assert_eq!(backoff.on_rate_limited(), Duration::from_secs(120));
        assert_eq!(backoff.on_rate_limited(), Duration::from_secs(240));
        assert_eq!(backoff.consecutive_rate_limits(), 3);
    }

    #[test]
    fn rate_limit_backoff_caps_at_five_minutes() {
        let mut backoff = ConnectBackoff::default();

        for _ in 0..10 {
            let _ = backoff.on_rate_limited();
        }
        assert_eq!(backoff.on_rate_limited(), Duration::from_secs(300));
    }

    #[test]
    fn successful_connection_resets_escalation() {
        let mut backoff = ConnectBackoff::default();

        let _ = backoff.on_rate_limited();
        let _ = backoff.on_rate_limited();
        backoff.on_connected();

        assert_eq!(backoff.consecutive_rate_limits(), 0);
        assert_eq!(backoff.on_rate_limited(), Duration::from_secs(60));
    }

    #[test]
    fn transient_pause_is_fixed() {
        let mut backoff = ConnectBackoff::default();
        assert_eq!(backoff.retry_pause(), Duration::from_secs(10));
        let _ = backoff.on_rate_limited();
        // Transient failures do not escalate.
        assert_eq!(backoff.retry_pause(), Duration::from_secs(10));
    }
}
