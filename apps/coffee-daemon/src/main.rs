//! Coffee Daemon Binary
//!
//! Starts the appliance event mirror and the local control API.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin coffee-daemon
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `HOME_CONNECT_CLIENT_ID`: OAuth client id
//! - `HOME_CONNECT_CLIENT_SECRET`: OAuth client secret
//! - `HOME_CONNECT_HAID`: home appliance id
//!
//! ## Optional
//! - `HOME_CONNECT_TOKEN_PATH`: token bundle path (default: tokens.json)
//! - `HOME_CONNECT_SCOPE`: OAuth scope
//! - `COFFEE_HISTORY_PATH`: history database path (default: history.db)
//! - `COFFEE_HTTP_PORT`: local HTTP port (default: 8080)
//! - `COFFEE_EVENTS_URL` / `COFFEE_API_BASE_URL` / `COFFEE_TOKEN_URL`: vendor endpoints
//! - `HEARTBEAT_TEST_TIMEOUT`: heartbeat timeout in seconds (test acceleration)
//! - `RUST_LOG`: log filter (default: info)

use std::sync::Arc;
use std::time::Instant;

use coffee_daemon::{
    AppState, ApplianceClient, BroadcastRegistry, DaemonConfig, EventStreamClient,
    HeartbeatMonitor, HeartbeatState, HistoryPersister, HistoryStore, HttpServer, StreamConfig,
    StreamSupervisor, TokenManager, init_metrics, telemetry,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();
    telemetry::init();

    tracing::info!("starting coffee daemon");

    let _metrics_handle = init_metrics();

    let config = DaemonConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Durable history store (runs the legacy migration if needed).
    let store = Arc::new(HistoryStore::open(&config.history_path)?);

    // Token lifecycle manager shared by the stream reader and REST client.
    let tokens = Arc::new(
        TokenManager::load(
            config.token_url.clone(),
            config.credentials.clone(),
            config.token_path.clone(),
        )?
        .with_stats(Arc::clone(&store)),
    );

    // Subscriber registry for the local SSE fan-out.
    let registry = Arc::new(BroadcastRegistry::new());

    // Heartbeat state shared by the reader and the monitor.
    let heartbeat = Arc::new(HeartbeatState::new());

    // Persistence queue and worker.
    let (queue, persister) = HistoryPersister::new(
        Arc::clone(&store) as _,
        config.persister,
        shutdown_token.clone(),
    );

    let monitor = HeartbeatMonitor::new(
        Arc::clone(&heartbeat),
        Arc::clone(&registry) as _,
        config.stream.heartbeat_timeout,
        config.stream.heartbeat_check_interval,
        shutdown_token.clone(),
    );

    let reader = Arc::new(EventStreamClient::new(
        StreamConfig::from(&config.stream),
        Arc::clone(&tokens) as _,
        Arc::clone(&registry) as _,
        queue.clone(),
        Arc::clone(&heartbeat),
        shutdown_token.clone(),
    ));

    let supervisor = StreamSupervisor::new(reader, monitor, persister, shutdown_token.clone());

    let appliance = Arc::new(
        ApplianceClient::new(
            config.api_base_url.clone(),
            config.haid.clone(),
            Arc::clone(&tokens) as _,
        )
        .with_stats(Arc::clone(&store)),
    );

    let state = AppState {
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
        store,
        registry,
        appliance,
        heartbeat,
        queue,
        heartbeat_timeout: config.stream.heartbeat_timeout,
    };

    supervisor.start();

    let http_server = HttpServer::new(config.server.http_port, state, shutdown_token.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(error) = http_server.run().await {
            tracing::error!(error = %error, "local HTTP server error");
        }
    });

    tracing::info!("coffee daemon ready");

    await_shutdown(&shutdown_token).await;
    supervisor.stop();
    let _ = server_handle.await;

    tracing::info!("coffee daemon stopped");
    Ok(())
}

/// Load a `.env` file from the current directory or any ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration. Credentials stay redacted.
fn log_config(config: &DaemonConfig) {
    tracing::info!(
        haid = %config.haid,
        http_port = config.server.http_port,
        history_path = %config.history_path.display(),
        token_path = %config.token_path.display(),
        "configuration loaded"
    );
    tracing::debug!(
        events_url = %config.stream.events_url,
        api_base_url = %config.api_base_url,
        heartbeat_timeout_secs = config.stream.heartbeat_timeout.as_secs(),
        "vendor endpoints"
    );
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: &CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
