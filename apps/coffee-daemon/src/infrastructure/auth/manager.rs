//! Token Lifecycle Manager
//!
//! Guarantees a valid bearer token across every caller in the process: the
//! stream reader and the REST client share one manager, and a single async
//! gate serializes refreshes so an expired token triggers at most one network
//! call no matter how many tasks observe the expiry concurrently.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{AuthError, TokenBundle, request_refresh};
use crate::application::ports::TokenProvider;
use crate::infrastructure::config::Credentials;
use crate::infrastructure::history::HistoryStore;
use crate::infrastructure::metrics::record_token_refresh;

/// Serializes token refreshes and hands out valid access tokens.
pub struct TokenManager {
    http: reqwest::Client,
    token_url: String,
    credentials: Credentials,
    token_path: PathBuf,
    tokens: RwLock<TokenBundle>,
    // Process-wide refresh gate; held only while refreshing or re-checking.
    refresh_gate: Mutex<()>,
    stats: Option<Arc<HistoryStore>>,
}

impl TokenManager {
    /// Load the manager from the persisted token bundle.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingBundle`] when no bundle exists at
    /// `token_path`, or a parse/read error for a corrupt one.
    pub fn load(
        token_url: String,
        credentials: Credentials,
        token_path: PathBuf,
    ) -> Result<Self, AuthError> {
        let bundle = TokenBundle::load(&token_path)?
            .ok_or_else(|| AuthError::MissingBundle(token_path.display().to_string()))?;

        Ok(Self {
            http: reqwest::Client::new(),
            token_url,
            credentials,
            token_path,
            tokens: RwLock::new(bundle),
            refresh_gate: Mutex::new(()),
            stats: None,
        })
    }

    /// Record successful refreshes into the API usage statistics.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<HistoryStore>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Return a valid access token, refreshing only when the current one has
    /// expired.
    ///
    /// Refresh is reactive: a token that has not reached its expiry is
    /// returned without any network traffic. On expiry, the caller that wins
    /// the gate refreshes; waiters re-check afterwards and adopt the result
    /// (from memory, or from the persisted file when another process
    /// refreshed it).
    ///
    /// # Errors
    ///
    /// Returns an error when the refresh fails and no valid bundle can be
    /// recovered from disk.
    pub async fn ensure_valid(&self) -> Result<String, AuthError> {
        {
            let tokens = self.tokens.read().await;
            if !tokens.is_expired() {
                return Ok(tokens.access_token.clone());
            }
            // Without a refresh token there is nothing to do but hand out the
            // stored token and let the API reject it.
            if tokens.refresh_token.is_empty() {
                tracing::debug!("token expired but no refresh token is available");
                return Ok(tokens.access_token.clone());
            }
        }

        let _gate = self.refresh_gate.lock().await;

        // Re-check after acquiring the gate: another task may have refreshed
        // while this one waited.
        {
            let tokens = self.tokens.read().await;
            if !tokens.is_expired() {
                tracing::debug!("token already refreshed by a concurrent task");
                return Ok(tokens.access_token.clone());
            }
        }

        // Another process may have refreshed the persisted bundle.
        if let Some(token) = self.adopt_persisted().await {
            tracing::debug!("adopted token bundle refreshed by a concurrent process");
            return Ok(token);
        }

        match self.refresh_holding_gate().await {
            Ok(token) => Ok(token),
            Err(error) => {
                tracing::warn!(error = %error, "token refresh failed, reloading persisted bundle");
                self.adopt_persisted()
                    .await
                    .ok_or(AuthError::Unrecoverable)
            }
        }
    }

    /// Refresh unconditionally, regardless of the recorded expiry.
    ///
    /// Used after a `401` response proved the current token bad.
    ///
    /// # Errors
    ///
    /// Returns an error when the token endpoint rejects the refresh.
    pub async fn refresh_now(&self) -> Result<String, AuthError> {
        let _gate = self.refresh_gate.lock().await;
        self.refresh_holding_gate().await
    }

    /// Adopt a valid bundle from disk, if present.
    async fn adopt_persisted(&self) -> Option<String> {
        let bundle = TokenBundle::load(&self.token_path).ok().flatten()?;
        if bundle.is_expired() {
            return None;
        }
        let token = bundle.access_token.clone();
        *self.tokens.write().await = bundle;
        Some(token)
    }

    /// Refresh and persist. Caller must hold the refresh gate.
    async fn refresh_holding_gate(&self) -> Result<String, AuthError> {
        let refresh_token = self.tokens.read().await.refresh_token.clone();

        tracing::info!("refreshing access token");
        let bundle =
            request_refresh(&self.http, &self.token_url, &self.credentials, &refresh_token).await?;

        if let Err(error) = bundle.save(&self.token_path) {
            tracing::warn!(error = %error, "failed to persist refreshed token bundle");
        }

        tracing::info!(expires_at = %bundle.expires_at, "token refreshed");
        record_token_refresh();
        if let Some(stats) = self.stats.clone() {
            tokio::task::spawn_blocking(move || stats.increment_token_refresh());
        }

        let token = bundle.access_token.clone();
        *self.tokens.write().await = bundle;
        Ok(token)
    }
}

#[async_trait]
impl TokenProvider for TokenManager {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.ensure_valid().await?)
    }

    async fn force_refresh(&self) -> anyhow::Result<String> {
        Ok(self.refresh_now().await?)
    }
}
