//! Process entrypoint: loads configuration, starts the rule synchronizer,
//! the admin surface, and the data-plane accept loop, and coordinates a
//! bounded-drain graceful shutdown across all three on SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;
use proxy_core::config::Config;
use proxy_core::controlplane::HttpControlPlaneClient;
use proxy_core::observability::init_tracing;
use proxy_core::rules::Synchronizer;
use proxy_core::state::AppState;
use proxy_core::{accept, admin};
use tokio::signal;

/// Egress policy proxy data-plane node.
#[derive(Parser)]
#[command(name = "proxy-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Load configuration from this path instead of the XDG search path.
    #[arg(long)]
    config: Option<String>,

    /// Override the node name used for config file discovery.
    #[arg(long)]
    node_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match (&cli.config, &cli.node_name) {
        (Some(path), _) => Config::load_from(path)?,
        (None, Some(name)) => Config::load_for_node(name)?,
        (None, None) => Config::load()?,
    };

    init_tracing(&config)?;

    let state = AppState::new(config.clone());

    let client = Arc::new(HttpControlPlaneClient::new(config.control_plane.url.clone()));
    let synchronizer = Arc::new(
        Synchronizer::new(client, state.generations().clone(), state.counters().clone(), &config)
            .with_rate_limiter(state.rate_limiter().clone())
            .with_tls_store(state.tls_material_store().clone()),
    );
    let sync_handle = synchronizer.clone().start();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let accept_handle = tokio::spawn(accept::run(state.clone(), shutdown_rx.clone()));
    let admin_handle = tokio::spawn(admin::run(state.clone(), shutdown_rx));

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining for up to {:?}", config.service.drain_window());

    synchronizer.stop();
    let _ = shutdown_tx.send(true);

    let drain = tokio::time::timeout(
        config.service.drain_window(),
        futures::future::join(accept_handle, admin_handle),
    );

    match drain.await {
        Ok((accept_result, admin_result)) => {
            if let Err(e) = accept_result.unwrap_or_else(|e| Err(proxy_core::error::Error::Internal(e.to_string()))) {
                tracing::warn!(error = %e, "accept loop exited with error");
            }
            if let Err(e) = admin_result.unwrap_or_else(|e| Err(proxy_core::error::Error::Internal(e.to_string()))) {
                tracing::warn!(error = %e, "admin surface exited with error");
            }
        }
        Err(_) => {
            tracing::warn!("drain window elapsed before accept/admin tasks finished, exiting anyway");
        }
    }

    let _ = sync_handle.await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Waits for SIGINT (Ctrl+C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
