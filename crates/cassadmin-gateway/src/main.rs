use anyhow::{Context, Result};
use cassadmin_gateway::cli::{Cli, Command};
use cassadmin_gateway::{logging, stdio, Gateway, GatewayApi, GatewayConfig, LogFormat};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Serve { config } => serve(config.clone()).await,
        Command::Stdio { config } => serve_stdio(config.clone()).await,
        _ => {
            logging::init("warn", LogFormat::Text);
            cli.run().await
        }
    }
}

/// Load, validate and install logging. Any failure here stops startup.
fn start(config_path: &Path) -> Result<Gateway> {
    let config = GatewayConfig::load(config_path)
        .with_context(|| format!("failed to load configuration {}", config_path.display()))?;
    logging::init(&config.log_level, config.log_format);
    tracing::info!(config = %config_path.display(), "cassadmin starting");
    Ok(Gateway::build(config)?)
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let gateway = Arc::new(start(&config_path)?);
    let shutdown = CancellationToken::new();

    let monitor_handle = gateway.health.clone().spawn(shutdown.clone());
    spawn_reload_on_hangup(gateway.clone(), config_path, shutdown.clone());
    spawn_shutdown_on_signal(shutdown.clone());

    let api = GatewayApi::new(gateway.dispatcher.clone(), gateway.health.clone())
        .with_trusted_proxies(gateway.config.trusted_proxies.clone())
        .with_drain_timeout(Duration::from_secs(gateway.config.shutdown_drain_secs));
    let result = api.serve(gateway.config.bind_addr, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = monitor_handle.await {
        tracing::error!(error = %e, "health monitor task failed");
    }
    tracing::info!("cassadmin stopped");
    result
}

async fn serve_stdio(config_path: PathBuf) -> Result<()> {
    let gateway = Arc::new(start(&config_path)?);
    let shutdown = CancellationToken::new();

    let monitor_handle = gateway.health.clone().spawn(shutdown.clone());
    spawn_reload_on_hangup(gateway.clone(), config_path, shutdown.clone());
    spawn_shutdown_on_signal(shutdown.clone());

    let result = stdio::serve(
        gateway.dispatcher.clone(),
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    if let Err(e) = monitor_handle.await {
        tracing::error!(error = %e, "health monitor task failed");
    }
    result
}

fn spawn_shutdown_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    tracing::error!(error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
                _ = shutdown.cancelled() => return,
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.cancelled() => return,
            }
        }
        tracing::info!("shutdown requested");
        shutdown.cancel();
    });
}

#[cfg(unix)]
fn spawn_reload_on_hangup(gateway: Arc<Gateway>, config_path: PathBuf, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGHUP handler, credential reload disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match gateway.reload_credentials(&config_path) {
                        Ok(count) => tracing::info!(keys = count, "credentials reloaded on SIGHUP"),
                        Err(e) => tracing::error!(error = %e, "credential reload failed, keeping current set"),
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_gateway: Arc<Gateway>, _config_path: PathBuf, _shutdown: CancellationToken) {}
