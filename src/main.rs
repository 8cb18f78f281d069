//! overlan point client CLI.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use overlan::point::LoggingListener;
use overlan::{Point, PointConfig, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "overlan-point")]
#[command(about = "overlan virtual-LAN point client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins, then the --verbose flag.
    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .ok();

    info!("loading configuration from {}", cli.config);
    let config = PointConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;

    let point = Point::new(config);
    point.set_listener(Arc::new(LoggingListener));
    point
        .start()
        .await
        .context("failed to start point")?;

    wait_for_shutdown().await?;

    info!(
        uuid = point.uuid(),
        uptime_secs = point.uptime().as_secs(),
        "shutting down"
    );
    point.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C");
    Ok(())
}
