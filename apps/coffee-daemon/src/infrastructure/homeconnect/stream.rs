//! Event Stream Reader
//!
//! Owns the single long-lived subscription to the appliance event stream.
//! Each decoded event is classified into history records for the persister
//! queue and forwarded unmodified to the broadcast sink.
//!
//! # Connection lifecycle
//!
//! ```text
//! connect ──ok──► consume frames ──(closed | error | forced reconnect)──┐
//!    ▲                                                                  │
//!    ├── transient failure: fixed pause ◄──────────────────────────────┘
//!    └── 429: exponential backoff (reset after the next successful connect)
//! ```
//!
//! Cancellation is cooperative: the token is raced against every network
//! read and every sleep, so `stop()` latency is bounded by one select
//! wakeup. A silently stalled connection is handled by the heartbeat
//! monitor, which requests a forced reconnect consulted between frames.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header;
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffConfig, ConnectBackoff};
use super::heartbeat::HeartbeatState;
use super::sse::{SseCodec, SseFrame};
use crate::application::ports::{EventSink, TokenProvider};
use crate::domain::event::{KEEP_ALIVE, derive_history_records};
use crate::infrastructure::config::StreamSettings;
use crate::infrastructure::history::PersistQueue;
use crate::infrastructure::metrics::{record_event_received, record_stream_connect};

/// Stream reader errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The events endpoint rejected the connection with `429`.
    #[error("events endpoint rate limited the connection")]
    RateLimited,

    /// The events endpoint answered with a non-success status.
    #[error("events endpoint answered {0}")]
    Http(StatusCode),

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(#[from] reqwest::Error),

    /// No valid access token could be obtained.
    #[error("token unavailable: {0}")]
    Token(anyhow::Error),
}

/// Connection settings for the stream reader.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Events stream URL.
    pub events_url: String,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Retry and backoff policy.
    pub backoff: BackoffConfig,
}

impl From<&StreamSettings> for StreamConfig {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            events_url: settings.events_url.clone(),
            connect_timeout: settings.connect_timeout,
            backoff: BackoffConfig {
                retry_pause: settings.retry_pause,
                rate_limit_initial: settings.rate_limit_backoff_initial,
                rate_limit_max: settings.rate_limit_backoff_max,
            },
        }
    }
}

/// Why a per-connection consume loop ended.
enum StreamEnd {
    /// Shutdown was requested; do not reconnect.
    Cancelled,
    /// The connection ended or was torn down; reconnect.
    Reconnect,
}

/// The event stream reader.
pub struct EventStreamClient {
    config: StreamConfig,
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    sink: Arc<dyn EventSink>,
    queue: PersistQueue,
    heartbeat: Arc<HeartbeatState>,
    cancel: CancellationToken,
}

impl EventStreamClient {
    /// Create a new stream reader.
    #[must_use]
    pub fn new(
        config: StreamConfig,
        tokens: Arc<dyn TokenProvider>,
        sink: Arc<dyn EventSink>,
        queue: PersistQueue,
        heartbeat: Arc<HeartbeatState>,
        cancel: CancellationToken,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            // No total timeout: the stream is expected to live indefinitely.
            .build()
            .unwrap_or_default();

        Self {
            config,
            http,
            tokens,
            sink,
            queue,
            heartbeat,
            cancel,
        }
    }

    /// Run the connect/consume/reconnect loop until cancelled.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = ConnectBackoff::new(self.config.backoff);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect().await {
                Ok(response) => {
                    tracing::info!(url = %self.config.events_url, "event stream connected");
                    backoff.on_connected();
                    record_stream_connect();
                    // A fresh connection counts as liveness until the first
                    // keep-alive arrives.
                    self.heartbeat.record();

                    let end = self.consume(response).await;
                    self.heartbeat.clear();
                    match end {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Reconnect => {
                            tracing::info!("event stream ended, reconnecting");
                        }
                    }
                }
                Err(StreamError::RateLimited) => {
                    let delay = backoff.on_rate_limited();
                    tracing::warn!(
                        delay_secs = delay.as_secs(),
                        consecutive = backoff.consecutive_rate_limits(),
                        "events endpoint rate limited, backing off"
                    );
                    if !self.sleep(delay).await {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "event stream connection failed");
                    if !self.sleep(backoff.retry_pause()).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("event stream reader stopped");
    }

    /// Establish one subscription.
    async fn connect(&self) -> Result<reqwest::Response, StreamError> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(StreamError::Token)?;

        let response = self
            .http
            .get(&self.config.events_url)
            .bearer_auth(token)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Err(StreamError::RateLimited)
        } else {
            Err(StreamError::Http(status))
        }
    }

    /// Consume one connection until it ends or a stop/reconnect is requested.
    async fn consume(&self, response: reqwest::Response) -> StreamEnd {
        let mut codec = SseCodec::new();
        let mut body = response.bytes_stream();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return StreamEnd::Cancelled,
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in codec.feed(&bytes) {
                            if self.cancel.is_cancelled() {
                                return StreamEnd::Cancelled;
                            }
                            if self.heartbeat.take_reconnect_request() {
                                tracing::info!("reconnect forced by heartbeat monitor");
                                return StreamEnd::Reconnect;
                            }
                            self.handle_frame(frame).await;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "event stream read error");
                        return StreamEnd::Reconnect;
                    }
                    None => {
                        tracing::info!("event stream closed by server");
                        return StreamEnd::Reconnect;
                    }
                }
            }
        }
    }

    /// Decode and dispatch one frame.
    async fn handle_frame(&self, frame: SseFrame) {
        let event_type = frame.event_type().to_string();

        if event_type == KEEP_ALIVE {
            self.heartbeat.record();
            tracing::trace!("keep-alive received");
            return;
        }
        if frame.data.is_empty() {
            tracing::debug!(event_type, "skipping event without payload");
            return;
        }

        let payload: serde_json::Value = match serde_json::from_str(&frame.data) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::debug!(event_type, error = %error, "skipping malformed event payload");
                return;
            }
        };

        // Any real event also proves the stream alive.
        self.heartbeat.record();
        record_event_received();

        for record in derive_history_records(&event_type, &payload) {
            self.queue.enqueue(record).await;
        }
        self.sink.broadcast_event(&event_type, &payload);
    }

    /// Sleep, racing the cancellation token. Returns `false` when cancelled.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}
