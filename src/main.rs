//! Chunk Upload Server
//!
//! Receives files as numbered chunks over HTTP and stores the reassembled
//! file once its checksum has been verified.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunk_upload_server::config::Config;
use chunk_upload_server::state::AppState;

/// Seconds between idle session sweeps
const EXPIRY_SWEEP_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.mode.default_log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Chunk Upload Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(mode = ?config.server.mode, "Run mode");
    tracing::info!("Chunk folder: {}", config.storage.chunk_dir.display());
    tracing::info!("Final folder: {}", config.storage.final_dir.display());
    tracing::info!(
        max_total_chunks = config.storage.max_total_chunks,
        idle_timeout_secs = config.storage.session_idle_timeout_secs,
        "Upload limits"
    );

    tokio::fs::create_dir_all(&config.storage.chunk_dir)
        .await
        .context("Failed to create chunk folder")?;
    tokio::fs::create_dir_all(&config.storage.final_dir)
        .await
        .context("Failed to create final folder")?;

    let app_state = AppState::new(config.clone());

    // Nothing is in flight yet, so staging leftovers are orphans
    app_state
        .engine()
        .sweep_staging()
        .await
        .context("Failed to sweep staging files")?;

    // Drop uploads abandoned part way
    app_state
        .engine()
        .clone()
        .start_expiry_task(Duration::from_secs(EXPIRY_SWEEP_SECS));

    let app = chunk_upload_server::app(app_state.clone());

    // Start server with graceful shutdown
    let ip: IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST {:?}", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    tracing::info!("Chunk Upload Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let stats = app_state.engine().stats();
    tracing::info!(
        chunks_stored = stats.chunks_stored,
        uploads_verified = stats.uploads_verified,
        uploads_failed = stats.uploads_failed,
        "Server shutdown complete"
    );

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
