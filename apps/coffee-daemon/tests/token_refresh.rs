//! Token refresh behavior against a mock token endpoint: exactly one network
//! refresh under contention, and durable persistence of the result.

use std::sync::Arc;

use chrono::{Duration, Utc};
use coffee_daemon::{Credentials, TokenBundle, TokenManager};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_expired_bundle(path: &std::path::Path) {
    TokenBundle {
        access_token: "stale".to_string(),
        refresh_token: "refresh-1".to_string(),
        expires_at: Utc::now() - Duration::minutes(5),
        scope: String::new(),
        token_type: "Bearer".to_string(),
    }
    .save(path)
    .unwrap();
}

/// K concurrent callers observing an expired token trigger exactly one
/// refresh call; every caller ends up holding the post-refresh token.
#[tokio::test]
async fn concurrent_callers_share_a_single_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "fresh",
            "refresh_token": "refresh-2",
            "expires_in": 3600,
            "token_type": "Bearer",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("tokens.json");
    write_expired_bundle(&token_path);

    let manager = Arc::new(
        TokenManager::load(
            format!("{}/token", server.uri()),
            Credentials::new("client".to_string(), "secret".to_string()),
            token_path.clone(),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure_valid().await.unwrap() })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), "fresh");
    }

    // The refreshed bundle was persisted for other processes.
    let persisted = TokenBundle::load(&token_path).unwrap().unwrap();
    assert_eq!(persisted.access_token, "fresh");
    assert_eq!(persisted.refresh_token, "refresh-2");
    assert!(!persisted.is_expired());
}

/// After one refresh, subsequent calls are served from memory without
/// touching the endpoint again.
#[tokio::test]
async fn refreshed_token_is_reused_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "fresh",
            "refresh_token": "refresh-2",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("tokens.json");
    write_expired_bundle(&token_path);

    let manager = TokenManager::load(
        format!("{}/token", server.uri()),
        Credentials::new("client".to_string(), "secret".to_string()),
        token_path,
    )
    .unwrap();

    assert_eq!(manager.ensure_valid().await.unwrap(), "fresh");
    assert_eq!(manager.ensure_valid().await.unwrap(), "fresh");
    assert_eq!(manager.ensure_valid().await.unwrap(), "fresh");
}

/// A rejected refresh surfaces a retrievable error when no persisted
/// fallback exists.
#[tokio::test]
async fn rejected_refresh_is_a_hard_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("tokens.json");
    write_expired_bundle(&token_path);

    let manager = TokenManager::load(
        format!("{}/token", server.uri()),
        Credentials::new("client".to_string(), "secret".to_string()),
        token_path,
    )
    .unwrap();

    assert!(manager.ensure_valid().await.is_err());
}
