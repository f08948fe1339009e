//! wakelink-relay binary entry point.
//!
//! Usage:
//! ```bash
//! wakelink-relay --config relay.toml
//! wakelink-relay --bind 127.0.0.1:9009
//! wakelink-relay --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use wakelink_relay::auth::StaticTokenAuthenticator;
use wakelink_relay::cleanup::spawn_cleanup_task;
use wakelink_relay::config::Config;
use wakelink_relay::http::{build_router, health};
use wakelink_relay::server::WakeRelay;

/// Blind relay for WakeLink devices and clients.
#[derive(Parser, Debug)]
#[command(name = "wakelink-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "relay.toml")]
    config: PathBuf,

    /// Override `server.bind_address`
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        tracing::warn!("Config file {:?} not found, using defaults", cli.config);
        Config::default()
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }

    let authenticator = Arc::new(StaticTokenAuthenticator::from_config(&config.auth));
    if authenticator.is_empty() {
        tracing::warn!("No [[auth.tokens]] configured; every connection will be refused");
    }

    health::init_start_time();
    let bind_address = config.server.bind_address.clone();
    let cleanup_config = config.cleanup.clone();
    let relay = Arc::new(WakeRelay::new(config));
    let cleanup = spawn_cleanup_task(Arc::clone(&relay), cleanup_config);

    let app = build_router(Arc::clone(&relay), authenticator);
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    tracing::info!(
        "wakelink-relay v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    cleanup.abort();
    tracing::info!("Shut down ({} packets still queued)", relay.stats().queue_depth);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
