//! Market Data Gateway Binary
//!
//! Starts the gateway: stream connection, cache, routing, and the health
//! endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-data-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Common
//! - `GATEWAY_WS_URL`: Exchange WebSocket endpoint
//! - `GATEWAY_REST_URL`: Exchange REST base URL
//! - `GATEWAY_DATABASE_URL`: `memory` or a SQLite URL
//! - `GATEWAY_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `GATEWAY_WATCH_SYMBOLS`: Comma-separated symbols subscribed at startup
//! - `LOG_FORMAT`: `json` for JSON log lines
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log filter (default: `market_data_gateway=info`)
//!
//! See `GatewayConfig::from_env` for the full list.

use std::sync::Arc;

use anyhow::Context;
use market_data_gateway::infrastructure::exchange::ExchangeFeed;
use market_data_gateway::infrastructure::telemetry;
use market_data_gateway::{
    Container, DataType, GatewayConfig, HealthServer, HealthServerState, SubscriptionParams,
    Timeframe, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Market Data Gateway");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = GatewayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let watch_symbols = config.service.watch_symbols.clone();
    let health_port = config.service.health_port;

    let container = Container::from_config(config)
        .await
        .context("failed to build gateway")?;

    if !watch_symbols.is_empty() {
        watch(container.feed(), &watch_symbols).await;
    }

    let health_cancel = CancellationToken::new();
    let health_state = Arc::new(HealthServerState::from_container(
        env!("CARGO_PKG_VERSION").to_string(),
        &container,
    ));
    let health_server = HealthServer::new(health_port, health_state, health_cancel.clone());
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    tracing::info!("Market Data Gateway started");

    await_shutdown().await;

    health_cancel.cancel();
    container.shutdown().await;
    if let Err(e) = health_handle.await {
        tracing::warn!(error = %e, "Health server task ended abnormally");
    }

    tracing::info!("Market Data Gateway stopped");
    Ok(())
}

/// Subscribe the startup watch list to tickers and one-minute candles.
async fn watch(feed: &ExchangeFeed, symbols: &[String]) {
    for data_type in [DataType::Ticker, DataType::Candle(Timeframe::Minute1)] {
        match feed
            .subscribe(data_type, symbols, SubscriptionParams::new())
            .await
        {
            Ok(ticket) => tracing::info!(
                ticket = %ticket,
                data_type = %data_type,
                symbols = symbols.len(),
                "Watch list subscribed"
            ),
            Err(e) => tracing::warn!(
                data_type = %data_type,
                error = %e,
                "Watch list subscription rejected"
            ),
        }
    }
}

/// Load `.env` from the current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        max_tickets = config.stream.max_tickets,
        memory_size = config.cache.memory_size,
        health_port = config.service.health_port,
        watch_symbols = config.service.watch_symbols.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        ws_url = %config.stream.url,
        rest_url = %config.rest.base_url,
        store = ?config.cache.store,
        "Exchange endpoints"
    );
}

/// Wait for SIGTERM or Ctrl+C.
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
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
                tracing::error!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
