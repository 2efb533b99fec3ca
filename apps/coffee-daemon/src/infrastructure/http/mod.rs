//! Local HTTP API
//!
//! The daemon's local surface: health and metrics, the SSE subscription
//! endpoint, history queries, and the appliance control endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - daemon status JSON
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /events` - SSE stream of live appliance events
//! - `GET /api/history?type=&limit=&before_timestamp=` - stored events
//! - `GET /api/history/daily-usage?days=` - brew counts per day
//! - `GET /api/history/program-counts` - lifetime brew counts per program
//! - `GET /api/stats` - vendor API usage counters for today
//! - `GET /api/status` - proxied appliance status
//! - `POST /api/wake` - wake the appliance from standby
//! - `POST /api/brew` - select and start an espresso

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::SecondsFormat;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::domain::event::PING;
use crate::infrastructure::broadcast::{BroadcastRegistry, SubscriberId};
use crate::infrastructure::history::{HistoryError, HistoryStore, PersistQueue};
use crate::infrastructure::homeconnect::{ApiError, ApplianceClient, HeartbeatState, WakeOutcome};
use crate::infrastructure::metrics::get_metrics_handle;

/// Hard cap on history page size.
const MAX_HISTORY_LIMIT: usize = 1000;
/// Hard cap on the daily-usage window.
const MAX_USAGE_DAYS: u32 = 365;
/// Default espresso fill quantity in millilitres.
const DEFAULT_FILL_ML: u32 = 50;

// =============================================================================
// State
// =============================================================================

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Daemon version.
    pub version: &'static str,
    /// Startup instant for uptime reporting.
    pub started_at: Instant,
    /// Event history store.
    pub store: Arc<HistoryStore>,
    /// Subscriber registry.
    pub registry: Arc<BroadcastRegistry>,
    /// Appliance REST client.
    pub appliance: Arc<ApplianceClient>,
    /// Stream liveness state.
    pub heartbeat: Arc<HeartbeatState>,
    /// Persistence queue handle (for depth reporting).
    pub queue: PersistQueue,
    /// Heartbeat timeout used for the connectivity verdict.
    pub heartbeat_timeout: Duration,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Handler error rendered as `{"error": ...}` JSON.
struct AppError(StatusCode, String);

impl AppError {
    fn internal(message: impl Into<String>) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({"error": self.1}))).into_response()
    }
}

impl From<ApiError> for AppError {
    fn from(error: ApiError) -> Self {
        let status = match &error {
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Api { .. } | ApiError::Unauthorized | ApiError::Network(_) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, error.to_string())
    }
}

impl From<HistoryError> for AppError {
    fn from(error: HistoryError) -> Self {
        Self::internal(error.to_string())
    }
}

// =============================================================================
// Server
// =============================================================================

/// The local HTTP server.
pub struct HttpServer {
    port: u16,
    state: AppState,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: AppState, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or serving fails.
    pub async fn run(self) -> std::io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "local HTTP server listening");

        let cancel = self.cancel;
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        tracing::info!("local HTTP server stopped");
        Ok(())
    }
}

/// Build the router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/events", get(events))
        .route("/api/history", get(history))
        .route("/api/history/daily-usage", get(daily_usage))
        .route("/api/history/program-counts", get(program_counts))
        .route("/api/stats", get(api_stats))
        .route("/api/status", get(appliance_status))
        .route("/api/wake", post(wake))
        .route("/api/brew", post(brew))
        .with_state(state)
}

// =============================================================================
// Health and Metrics
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    stream_connected: bool,
    last_heartbeat: Option<String>,
    subscribers: usize,
    persist_queue_depth: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version,
        uptime_secs: state.started_at.elapsed().as_secs(),
        stream_connected: state.heartbeat.is_live(state.heartbeat_timeout),
        last_heartbeat: state
            .heartbeat
            .last_heartbeat()
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        subscribers: state.registry.client_count(),
        persist_queue_depth: state.queue.depth(),
    })
}

async fn metrics() -> Response {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "metrics recorder not installed",
            )
                .into_response()
        },
        |handle| handle.render().into_response(),
    )
}

// =============================================================================
// SSE Subscription
// =============================================================================

/// Receiver stream that unregisters its subscriber on disconnect.
struct SubscriberStream {
    inner: UnboundedReceiverStream<Event>,
    registry: Arc<BroadcastRegistry>,
    id: SubscriberId,
}

impl Stream for SubscriberStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|item| item.map(Ok))
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        self.registry.remove_client(self.id);
    }
}

async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, rx) = state.registry.subscribe();
    let stream = SubscriberStream {
        inner: UnboundedReceiverStream::new(rx),
        registry: Arc::clone(&state.registry),
        id,
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new().interval(Duration::from_secs(15)).event(
            Event::default()
                .event(PING)
                .data(r#"{"timestamp":"keep-alive"}"#),
        ),
    )
}

// =============================================================================
// History Queries
// =============================================================================

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(rename = "type")]
    event_type: Option<String>,
    limit: Option<usize>,
    before_timestamp: Option<String>,
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let limit = query.limit.map(|limit| limit.min(MAX_HISTORY_LIMIT));
    let store = Arc::clone(&state.store);

    let events = tokio::task::spawn_blocking(move || {
        store.get_history(
            query.event_type.as_deref(),
            limit,
            query.before_timestamp.as_deref(),
        )
    })
    .await
    .map_err(|_| AppError::internal("history query task failed"))??;

    Ok(Json(json!({"history": events})))
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    days: Option<u32>,
}

async fn daily_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Value>, AppError> {
    let days = query.days.unwrap_or(7).min(MAX_USAGE_DAYS);
    let store = Arc::clone(&state.store);

    let usage = tokio::task::spawn_blocking(move || store.get_daily_usage(days))
        .await
        .map_err(|_| AppError::internal("usage query task failed"))??;

    Ok(Json(json!({"daily_usage": usage})))
}

async fn program_counts(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let store = Arc::clone(&state.store);

    let counts = tokio::task::spawn_blocking(move || store.get_program_counts())
        .await
        .map_err(|_| AppError::internal("program counts task failed"))??;

    Ok(Json(json!({"program_counts": counts})))
}

async fn api_stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let store = Arc::clone(&state.store);

    let stats = tokio::task::spawn_blocking(move || store.get_api_statistics(None))
        .await
        .map_err(|_| AppError::internal("stats query task failed"))??;

    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

// =============================================================================
// Appliance Control
// =============================================================================

async fn appliance_status(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    Ok(Json(state.appliance.get_status().await?))
}

async fn wake(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let outcome = state.appliance.wake().await?;
    let message = match &outcome {
        WakeOutcome::Activated => "appliance switched on".to_string(),
        WakeOutcome::AlreadyOn => "appliance is already on".to_string(),
        WakeOutcome::Unknown(value) => format!("unexpected power state: {value}"),
    };
    let mut body = serde_json::to_value(&outcome).unwrap_or_default();
    if let Some(object) = body.as_object_mut() {
        object.insert("message".to_string(), json!(message));
    }
    Ok(Json(body))
}

#[derive(Debug, Default, Deserialize)]
struct BrewRequest {
    fill_ml: Option<u32>,
}

async fn brew(
    State(state): State<AppState>,
    body: Option<Json<BrewRequest>>,
) -> Result<Json<Value>, AppError> {
    let fill_ml = body
        .and_then(|Json(request)| request.fill_ml)
        .unwrap_or(DEFAULT_FILL_ML);

    state.appliance.brew(fill_ml).await?;
    Ok(Json(json!({
        "status": "started",
        "message": format!("espresso ({fill_ml} ml) is being prepared"),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_limit_is_clamped() {
        let query = HistoryQuery {
            event_type: None,
            limit: Some(10_000),
            before_timestamp: None,
        };
        assert_eq!(
            query.limit.map(|l| l.min(MAX_HISTORY_LIMIT)),
            Some(MAX_HISTORY_LIMIT)
        );
    }

    #[test]
    fn wake_outcome_serializes_with_status_tag() {
        let body = serde_json::to_value(WakeOutcome::Activated).unwrap();
        assert_eq!(body["status"], "activated");

        let body = serde_json::to_value(WakeOutcome::Unknown("Off".to_string())).unwrap();
        assert_eq!(body["status"], "unknown");
        assert_eq!(body["detail"], "Off");
    }
}
