//! Toolrelay Server
//!
//! WebSocket bridge that runs interactive scanning tools on behalf of chat
//! callers. Streams tool output back line by line and relays yes/no
//! confirmations to the tool's stdin.

mod config;
mod process;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::BotConfig;
use server::{ServerConfig, WebSocketServer};
use session::SessionRegistry;

/// Toolrelay Server
///
/// Runs interactive tools for chat callers
#[derive(Parser, Debug)]
#[command(name = "toolrelay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the tool catalog (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();

    info!("Toolrelay v{}", env!("CARGO_PKG_VERSION"));

    let bot_config = BotConfig::load(args.config.as_deref())?;
    info!(
        "Loaded {} tools ({})",
        bot_config.tools.len(),
        bot_config
            .tools
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let config = ServerConfig::new(args.bind, args.port);
    let registry = SessionRegistry::new(bot_config);

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config, registry));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
