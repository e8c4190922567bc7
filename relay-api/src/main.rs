//! Delta Stream Relay API Server
//!
//! Holds one connection to the Delta Exchange realtime feed and relays it
//! to browser clients over Server-Sent Events.

mod error;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use relay_delta::{DeltaWebSocket, DeltaWebSocketConfig};
use relay_services::{Relay, RelayConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_api=debug,relay_services=debug")),
        )
        .init();

    info!("Starting Delta Stream Relay");

    let delta_config = DeltaWebSocketConfig::from_env().inspect_err(|e| {
        error!("Invalid Delta configuration: {}", e);
    })?;
    if delta_config.credentials.is_some() {
        info!("Delta API credentials found in environment");
    } else {
        warn!("No Delta API credentials found - only public channels will be available");
    }

    let relay_config = RelayConfig::from_env().inspect_err(|e| {
        error!("Invalid relay configuration: {}", e);
    })?;
    info!(
        "Relay limits: {} clients, {} requests per {:?}, queue of {}",
        relay_config.max_clients,
        relay_config.rate_limit_requests,
        relay_config.rate_limit_window,
        relay_config.client_queue
    );

    // Upstream connector and the hub that fans its events out
    let (delta_ws, delta_rx) = DeltaWebSocket::new(delta_config);
    let delta_ws = Arc::new(delta_ws);
    let relay = Relay::new(relay_config, delta_ws.clone());
    relay.start(delta_rx);
    delta_ws.start()?;
    info!("Delta WebSocket started");

    let state = AppState {
        relay: relay.clone(),
    };
    let app = routes::app(state);

    // Start server
    let port = std::env::var("SERVER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3001);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(relay, delta_ws))
    .await?;

    info!("Server stopped");
    Ok(())
}

/// Wait for Ctrl+C, then close the upstream and end every SSE stream so
/// in-flight connections can drain
async fn shutdown_signal(relay: Relay, delta_ws: Arc<DeltaWebSocket>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    info!("Shutdown signal received");
    if let Err(e) = delta_ws.shutdown() {
        warn!("Failed to stop Delta WebSocket: {}", e);
    }
    relay.registry().shutdown();
}
