//! Gateway service entry point.
//!
//! Relays the Coinbase ticker feed to WebSocket clients.

use anyhow::Result;
use coinbase::CoinbaseHandler;
use common::WsConnector;
use gateway::{create_router, AppState, GatewayConfig, Relay};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env()?;
    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  COINBASE_WS_URL: {}", config.coinbase_ws_url);
    info!("  RECONNECT_BASE_DELAY_MS: {}", config.reconnect_base_delay.as_millis());
    info!("  RECONNECT_MAX_ATTEMPTS: {}", config.reconnect_max_attempts);
    info!("  RESUBSCRIBE_ON_RECONNECT: {}", config.resubscribe_on_reconnect);
    info!("  PING_INTERVAL_SECS: {}", config.ping_interval.as_secs());

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let (relay, requests, events) = Relay::new(
        CoinbaseHandler::new(config.coinbase_ws_url.clone()),
        WsConnector::new(config.ws_manager_config()),
        config.upstream_config(),
        config.relay_config(),
    );

    let (relay_shutdown_tx, relay_shutdown_rx) = mpsc::channel(1);
    let relay_handle = tokio::spawn(relay.run(events, relay_shutdown_rx));

    let state = Arc::new(AppState {
        requests,
        ping_interval: config.ping_interval,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down relay...");
    let _ = relay_shutdown_tx.send(()).await;
    if let Err(e) = relay_handle.await {
        error!("Relay task failed: {:?}", e);
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
