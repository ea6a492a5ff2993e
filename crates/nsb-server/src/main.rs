//! nix-ssh-bridge
//!
//! Exposes a local daemon socket to SSH clients that invoke
//! `nix-daemon --stdio` on the remote side.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nsb_core::{BridgeConfig, DEFAULT_LISTEN_ADDRESS};
use nsb_server::{generate_host_key, BridgeServer};

#[derive(Parser)]
#[command(name = "nix-ssh-bridge")]
#[command(about = "Passwordless SSH endpoint relaying nix-daemon --stdio to a Unix socket")]
#[command(version)]
struct Args {
    /// Address to listen on (host:port)
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDRESS)]
    listen: String,

    /// Path to the daemon socket
    #[arg(short = 'p', long)]
    socket: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::new(args.listen, args.socket);
    if config.socket_path.as_os_str().is_empty() {
        tracing::warn!("Socket path is empty - every exec request will fail to connect");
    }

    let host_key = generate_host_key().context("Failed to generate host key")?;
    match host_key.clone_public_key() {
        Ok(public_key) => tracing::info!("Host key fingerprint: {}", public_key.fingerprint()),
        Err(e) => tracing::warn!("Could not derive host key fingerprint: {}", e),
    }

    let server = BridgeServer::bind(&config, host_key)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen_address))?;

    tracing::info!(
        "Relaying exec sessions to {}",
        config.socket_path.display()
    );

    // Stop accepting on Ctrl+C / SIGTERM
    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    server.run(cancel).await?;

    tracing::info!("nix-ssh-bridge shutdown complete");
    Ok(())
}

/// Cancel the token on the first shutdown signal
async fn wait_for_shutdown(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }

    cancel.cancel();
}
