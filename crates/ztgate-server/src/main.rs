//! ztgate: zero-trust data-plane proxy.
//!
//! Accepts HTTP, raw TCP and raw UDP flows, authenticates the credential
//! each one carries, authorizes its destination against per-identity rules
//! pulled from the management service, and relays it over the overlay peer
//! path or the external path.

mod auth;
mod config;
mod frontend;
mod mirror;
mod policy;
mod router;
mod server;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::GateServer;
use std::path::PathBuf;
use tracing::{error, info};

/// ztgate: zero-trust data-plane proxy
#[derive(Parser, Debug)]
#[command(name = "ztgate", version, about = "Zero-trust data-plane proxy")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.ztgate/config.toml")]
    config: String,

    /// HTTP front end port
    #[arg(long)]
    http_port: Option<u16>,

    /// Raw TCP front end port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Raw UDP front end port
    #[arg(long)]
    udp_port: Option<u16>,

    /// Rule distribution endpoint
    #[arg(long)]
    rules_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ztgate");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        http_port: cli.http_port,
        tcp_port: cli.tcp_port,
        udp_port: cli.udp_port,
        rules_url: cli.rules_url,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Refuses to serve until a policy snapshot is in place.
    let running = match GateServer::new(server_config).start().await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    info!(active_flows = running.active_flows(), "received shutdown signal");
    running.shutdown().await;
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
