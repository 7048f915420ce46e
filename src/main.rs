//! Syncstore -- Firefox Sync 1.5 storage server.
//!
//! Configuration comes from the environment (see `config`); a bad
//! configuration is fatal and exits non-zero. SIGTERM/SIGINT stop the
//! listener, drain in-flight requests, then stop every pooled handler
//! so databases close cleanly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use syncstore::config::Config;
use syncstore::pool::Pool;
use syncstore::AppState;

/// Command-line arguments for the syncstore server.
#[derive(Parser, Debug)]
#[command(name = "syncstore", version, about = "Firefox Sync 1.5 storage server")]
struct Cli {
    /// Override the bind address (host:port) from the environment.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("Config Error")?;

    // Initialize tracing / logging.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.tracing_level()));
    if config.log.mozlog {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(
        hostname = %config.hostname,
        data_dir = %config.data_dir,
        max_open_files = config.max_open_files,
        "starting syncstore"
    );

    let pool = Arc::new(Pool::new(&config.data_dir, config.max_open_files));

    // Background reaper for handlers idle past the TTL.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = pool.spawn_reaper(Duration::from_secs(config.ttl), shutdown_rx);

    let state = Arc::new(AppState::new(&config, pool.clone()));
    let app = syncstore::server::app(state);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.host, config.port));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("could not bind {bind_addr}"))?;
    info!("syncstore listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Listener is closed and in-flight requests are drained: stop the
    // reaper, then every handler, so databases close before exit.
    let _ = shutdown_tx.send(true);
    let _ = reaper.await;
    pool.stop_all().await;

    info!("syncstore shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger
/// graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
