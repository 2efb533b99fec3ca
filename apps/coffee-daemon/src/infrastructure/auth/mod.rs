//! Vendor OAuth Token Handling
//!
//! The token bundle persisted on disk is the durability boundary for the
//! refresh-token grant: it survives process restarts and lets concurrent
//! refreshers (including other processes) observe each other's work. Only
//! the refresh grant is implemented here; the interactive authorization-code
//! flow is out of scope and must have produced the bundle beforehand.

mod manager;

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::infrastructure::config::Credentials;

pub use manager::TokenManager;

/// Token lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No persisted token bundle exists at the configured path.
    #[error("no token bundle at {0}; run the authorization flow first")]
    MissingBundle(String),

    /// Reading or writing the persisted bundle failed.
    #[error("token file error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted bundle or a token response could not be parsed.
    #[error("token parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The token endpoint could not be reached.
    #[error("token endpoint error: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint rejected the refresh request.
    #[error("token refresh rejected with status {0}")]
    RefreshRejected(reqwest::StatusCode),

    /// Refresh failed and no valid persisted bundle could be recovered.
    #[error("token refresh failed and no valid persisted bundle is available")]
    Unrecoverable,
}

/// The persisted OAuth token state.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    /// Bearer token for API calls.
    pub access_token: String,
    /// Refresh token; empty when the grant did not return one.
    #[serde(default)]
    pub refresh_token: String,
    /// Absolute expiry of the access token.
    pub expires_at: DateTime<Utc>,
    /// Granted scope.
    #[serde(default)]
    pub scope: String,
    /// Token type, normally `Bearer`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Wire format of a token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    scope: String,
    #[serde(default = "default_token_type")]
    token_type: String,
}

impl TokenBundle {
    /// Build a bundle from a token endpoint response, anchoring the relative
    /// `expires_in` to the current time.
    fn from_response(response: TokenResponse) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: Utc::now() + Duration::seconds(response.expires_in),
            scope: response.scope,
            token_type: response.token_type,
        }
    }

    /// Load the persisted bundle, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>, AuthError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Persist the bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Whether the access token has reached its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl std::fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Exchange a refresh token for a fresh bundle at the token endpoint.
///
/// Client credentials go into HTTP basic auth, the grant into the form body,
/// matching the vendor's OAuth implementation.
async fn request_refresh(
    http: &reqwest::Client,
    token_url: &str,
    credentials: &Credentials,
    refresh_token: &str,
) -> Result<TokenBundle, AuthError> {
    let response = http
        .post(token_url)
        .basic_auth(credentials.client_id(), Some(credentials.client_secret()))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::RefreshRejected(status));
    }

    let payload: TokenResponse = response.json().await?;
    Ok(TokenBundle::from_response(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(expires_at: DateTime<Utc>) -> TokenBundle {
        TokenBundle {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at,
            scope: "Monitor".to_string(),
            token_type: "Bearer".to_string(),
        }
    }

    #[test]
    fn expiry_check() {
        assert!(bundle(Utc::now() - Duration::seconds(1)).is_expired());
        assert!(!bundle(Utc::now() + Duration::seconds(3600)).is_expired());
    }

    #[test]
    fn from_response_anchors_expiry() {
        let response = TokenResponse {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_in: 3600,
            scope: String::new(),
            token_type: "Bearer".to_string(),
        };
        let bundle = TokenBundle::from_response(response);

        let remaining = bundle.expires_at - Utc::now();
        assert!(remaining > Duration::seconds(3590));
        assert!(remaining <= Duration::seconds(3600));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let original = bundle(Utc::now() + Duration::seconds(600));

        original.save(&path).unwrap();
        let loaded = TokenBundle::load(&path).unwrap().unwrap();

        assert_eq!(loaded.access_token, original.access_token);
        assert_eq!(loaded.refresh_token, original.refresh_token);
        assert_eq!(loaded.expires_at, original.expires_at);
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TokenBundle::load(&dir.path().join("absent.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn debug_redacts_tokens() {
        let rendered = format!("{:?}", bundle(Utc::now()));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("access"));
    }

    #[test]
    fn legacy_offset_timestamps_parse() {
        // Bundles written by the previous integration used `+00:00` offsets.
        let raw = r#"{
            "access_token": "a",
            "refresh_token": "r",
            "expires_at": "2026-01-01T00:00:00+00:00",
            "scope": "",
            "token_type": "Bearer"
        }"#;
        let parsed: TokenBundle = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.expires_at.timezone(), Utc);
    }
}
