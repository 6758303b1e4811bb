//! # eldsync-server
//!
//! Local HTTP service around the eldsync sync engine.
//!
//! This binary provides:
//! - REST API for ELD scanning, connection and the synchronized timeline
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, against the built-in ELD simulator
//! cargo run --package eldsync-server
//!
//! # Production, against a real ELD over BlueZ
//! cargo run --package eldsync-server --features bluetooth -- /etc/eldsync/config.toml
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use eldsync_core::{Config, SharedLink, SyncOrchestrator};
use eldsync_server::api::create_router;
use eldsync_server::logging;
use eldsync_server::state::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;

    logging::init(config.server.production)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting eldsync-server");

    let link = open_link(&config).await?;
    let preferred = config.device.address.clone();
    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen_addr))?;

    let orchestrator = SyncOrchestrator::start(link, config);

    if let Some(address) = preferred {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator.start_connection(&address).await {
                Ok(state) => info!(%address, %state, "connected to configured ELD"),
                Err(err) => warn!(%address, error = %err, "could not connect to configured ELD"),
            }
        });
    }

    let app = create_router(AppState::new(orchestrator.clone()));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for shutdown signal");
            }
        })
        .await?;

    info!("Shutting down");
    if let Err(err) = orchestrator.disconnect().await {
        warn!(error = %err, "disconnect on shutdown failed");
    }
    orchestrator.shutdown().await;
    Ok(())
}

#[cfg(feature = "bluetooth")]
async fn open_link(config: &Config) -> anyhow::Result<SharedLink> {
    let link = eldsync_core::BluezLink::new(&config.device)
        .await
        .context("failed to open Bluetooth adapter")?;
    Ok(Arc::new(link))
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn open_link(_config: &Config) -> anyhow::Result<SharedLink> {
    info!("Bluetooth support not compiled in, using the ELD simulator");
    Ok(Arc::new(eldsync_core::SimulatedLink::new(
        eldsync_core::SimulatorSettings::default(),
    )))
}
