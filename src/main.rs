mod config;
mod error;
mod executor;
mod server;
mod session;
mod ssh;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ProxyConfig;
use crate::executor::LocalExecutor;
use crate::server::{bind_listener, ProxyServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssh_comm_proxy=info,russh=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ProxyConfig::from_env().context("Invalid proxy configuration")?;
    let protocol = config
        .protocol_config()
        .context("Failed to prepare SSH key material")?;
    let listener = bind_listener(config.bind_address, config.port, config.port_attempts)
        .await
        .context("Failed to bind SSH proxy listener")?;

    let executor = Arc::new(LocalExecutor::new(config.shell.clone()));
    let server = ProxyServer::new(listener, protocol, executor);
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        shutdown.shutdown();
    });

    let in_flight = server.serve().await;
    in_flight.drain(config.shutdown_grace).await;
    Ok(())
}
