/*!
 * Blueport Bluetooth Daemon
 * BlueZ adapter and device control over a small HTTP API
 * Onyx Digital Intelligence Development LLC
 */

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod bluetooth;
mod bus;
mod cache;
mod config;
mod discovery;
mod error;
mod scanner;

use api::ApiState;
use bluetooth::BluetoothManager;
use bus::BluezClient;
use config::DaemonConfig;
use scanner::ScanLoop;

#[derive(Parser)]
#[command(name = "blueportd")]
#[command(about = "Blueport Bluetooth HTTP Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/blueport/blueportd.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Check whether a running daemon answers on its API
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "blueport_daemon={},tower_http={}",
            log_level, log_level
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration
    let config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Status => check_status(&config).await,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("Blueport daemon starting...");

    let (bus, bus_driver) = BluezClient::connect(config.bluetooth.call_timeout())
        .context("failed to connect to the D-Bus system bus")?;
    let manager = Arc::new(BluetoothManager::new(
        Arc::new(bus),
        config.bluetooth.settle(),
    ));

    if let Err(e) = manager.discovery().adapter().await {
        warn!("No adapter yet ({}); will retry on demand", e);
    }

    let scanner = if config.scan.auto_scan {
        Some(ScanLoop::new(Arc::clone(&manager), &config.scan).spawn())
    } else {
        info!("Background scanning disabled");
        None
    };

    let state = ApiState::new(Arc::clone(&manager), config.scan.clone());
    let app = api::create_router(state, &config.server);

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!(
        "Blueport API listening on http://{}",
        config.server.listen_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    if let Some(scanner) = scanner {
        scanner.abort();
    }
    manager.discovery().abort_discovery().await;
    bus_driver.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn check_status(config: &DaemonConfig) -> Result<()> {
    let mut addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen_addr))?;
    if addr.ip().is_unspecified() {
        addr.set_ip(Ipv4Addr::LOCALHOST.into());
    }

    let url = format!("http://{}/api/v1/status", addr);
    let response = match reqwest::get(&url).await {
        Ok(response) => response,
        Err(e) => bail!("blueportd is not reachable at {}: {}", addr, e),
    };

    let body: serde_json::Value = response.error_for_status()?.json().await?;
    println!(
        "blueportd is running on {} (status: {})",
        addr,
        body["status"].as_str().unwrap_or("unknown")
    );
    Ok(())
}
