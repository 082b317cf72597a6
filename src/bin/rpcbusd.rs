//! rpcbus daemon - WebSocket broker or hub relay

use anyhow::{Context, Result};
use clap::Parser;
use rpcbus::server::{run_websocket_server, WsState};
use rpcbus::{Client, Hub, ScopeConfig, Server, WebsocketClient, WebsocketConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rpcbusd")]
#[command(about = "rpcbus broker daemon")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "RPCBUS_BIND")]
    bind: String,

    /// Upstream broker URL; when set the daemon runs as a hub relay
    #[arg(long, env = "RPCBUS_UPLINK")]
    uplink: Option<String>,

    /// Aggregation window in milliseconds
    #[arg(long, default_value_t = 1, env = "RPCBUS_AGGREGATE_MS")]
    aggregate_ms: u64,

    /// Label announced to peers
    #[arg(long, env = "RPCBUS_LABEL")]
    label: Option<String>,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    run(args).await
}

async fn run(args: Args) -> Result<()> {
    let bind_addr: SocketAddr = args.bind.parse().context("Invalid bind address")?;

    let mut config = ScopeConfig::new().aggregate(Duration::from_millis(args.aggregate_ms));
    if let Some(label) = args.label {
        config = config.label(label);
    }

    let mut uplink = None;
    let state = match args.uplink {
        Some(url) => {
            info!(uplink = %url, "Starting as hub relay");
            let client = Client::new(config);
            uplink = Some(WebsocketClient::connect(client.clone(), WebsocketConfig::new(url)));
            WsState::new(Hub::new(client))
        }
        None => {
            info!("Starting as broker");
            WsState::new(Server::new(config))
        }
    };

    info!(addr = %bind_addr, "rpcbus daemon starting");

    // Run server with graceful shutdown on signals
    tokio::select! {
        result = run_websocket_server(bind_addr, state) => {
            result?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server");
        }
    }

    if let Some(uplink) = uplink {
        uplink.shutdown().await;
    }

    info!("rpcbus daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
