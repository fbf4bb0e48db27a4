use std::sync::Arc;

use mcwarden::config::AppConfig;
use mcwarden::ipc;
use mcwarden::status::StatusAggregator;
use mcwarden::supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("mcwarden starting");

    let config_path = AppConfig::default_path();
    let mut config = AppConfig::load_or_create(&config_path)?;
    config.apply_env()?;
    config.validate()?;
    tracing::info!("Loaded configuration from {}", config_path.display());

    let supervisor = Arc::new(Supervisor::new(&config));
    let shutdown = CancellationToken::new();

    // Status poller: logs every change of the displayed status
    let aggregator = StatusAggregator::new(supervisor.server.clone(), supervisor.tunnel.clone())
        .with_interval(config.daemon.poll_interval());
    let (_status_rx, poller) = aggregator.spawn(shutdown.clone());

    let ipc_server = ipc::IPCServer::new(supervisor.clone(), &config.daemon.listen);
    let ipc_shutdown = shutdown.clone();
    let ipc_task = tokio::spawn(async move { ipc_server.start(ipc_shutdown).await });

    // Graceful shutdown: Ctrl+C
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received, stopping processes...");
        signal_shutdown.cancel();
    });

    match ipc_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("IPC server error: {}", e);
            shutdown.cancel();
        }
        Err(e) => {
            tracing::error!("IPC server task failed: {}", e);
            shutdown.cancel();
        }
    }

    supervisor.shutdown().await;
    if let Err(e) = poller.await {
        tracing::warn!("Status poller ended abnormally: {}", e);
    }

    tracing::info!("mcwarden shutting down");
    Ok(())
}
