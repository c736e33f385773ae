//! bridge: public-facing half of the tunnel pair.
//!
//! Terminates client HTTP and WebSocket traffic, keeps at most one gateway
//! link alive, and correlates tunneled requests with their replies.

mod config;
mod errors;
mod forwarder;
mod routes;

use clap::Parser;
use config::BridgeConfig;
use forwarder::Forwarder;
use routes::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// bridge — public-facing tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "bridge", version, about = "Public-facing tunnel bridge")]
struct Cli {
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

    let cfg = match BridgeConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.port,
        compress_level = cfg.compress_level,
        "starting bridge"
    );

    let state = Arc::new(AppState {
        forwarder: Arc::new(Forwarder::new(cfg.token.clone(), cfg.compress_level)),
    });
    let app = routes::router(state, &cfg)
        .into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "bind failed");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("bridge stopped");
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
