//! API gateway
//!
//! A plugin-chain gateway built with Tokio, Axum and Hyper.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────────┐
//!                    │                       API GATEWAY                         │
//!                    │                                                           │
//!  Client Request    │  ┌──────┐   ┌──────┐   ┌────────────┐   ┌───────┐        │
//!  ──────────────────┼─▶│ http │──▶│ auth │──▶│ rate_limit │──▶│ route │        │
//!                    │  └──────┘   └──────┘   └────────────┘   └───┬───┘        │
//!                    │                                             ▼            │
//!                    │  ┌────────────┐   ┌──────────┐   ┌──────────────┐        │
//!  Client Response   │  │ correlator │◀──│   pool   │◀──│ load_balance │        │
//!  ◀─────────────────┼──│  (release) │   │keep-alive│   │  + forward   │        │
//!                    │  └────────────┘   └────┬─────┘   └──────────────┘        │
//!                    │                        │                                  │
//!                    └────────────────────────┼──────────────────────────────────┘
//!                                             ▼
//!                                          Backend
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use api_gateway::config::{load_config, GatewayConfig};
use api_gateway::lifecycle::Gateway;
use api_gateway::observability::{init_logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "api-gateway", version, about = "Plugin-chain API gateway")]
struct Args {
    /// Path to the TOML configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    init_logging(&config.observability.log_level)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "api-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        services = config.services.len(),
        routes = config.routes.len(),
        pool_mode = ?config.pool.mode,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let mut gateway = Gateway::build(config).await?;
    if let Some(path) = args.config {
        gateway = gateway.watch_config(path);
    }
    gateway.run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
