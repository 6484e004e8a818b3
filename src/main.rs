//! tripwire server entry point.
//!
//! Starts the Axum HTTP server with REST and WebSocket endpoints and drains
//! live sockets on shutdown.

use anyhow::{Context, anyhow};
use tokio::sync::watch;

use tripwire::app_state::AppState;
use tripwire::config::AppConfig;
use tripwire::{build_app, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().map_err(|e| anyhow!("invalid configuration: {e}"))?;
    init_tracing(config.log_format);
    tracing::info!(addr = %config.listen_addr, backend = ?config.persistence_backend, "starting tripwire");
    if config.uses_dev_secrets() {
        tracing::warn!("using built-in development secrets; set INVITATION_TOKEN_SECRET and IDENTITY_JWT_SECRET");
    }

    let addr = config.listen_addr;
    let state = AppState::build(config)
        .await
        .context("failed to initialize application state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = state.spawn_background(&shutdown_rx);

    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "server listening");

    let drain = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, draining connections");
            drain.supervisor.shutdown(&drain.bus).await;
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    for task in futures_util::future::join_all(tasks).await {
        if let Err(e) = task {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
