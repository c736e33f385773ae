//! gateway: private-side half of the tunnel pair.
//!
//! Dials the bridge, consumes tunneled requests, performs the outbound HTTP
//! call or opens the downstream WebSocket, and returns the results — gated
//! by the configured whitelist.

mod config;
mod downstream;
mod http;
mod link;
mod target;

use clap::Parser;
use config::GatewayConfig;
use link::GatewayState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// gateway — private-side tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "gateway", version, about = "Private-side tunnel gateway")]
struct Cli {
    /// Path to the JSON config file
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let cfg = match GatewayConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bridge = %cfg.bridge_netloc,
        whitelist_entries = cfg.whitelist.len(),
        "starting gateway"
    );

    let state = match GatewayState::new(cfg.whitelist.clone()) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!(error = %e, "failed to initialize");
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = link::run(state, cfg) => {}
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("gateway stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
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
