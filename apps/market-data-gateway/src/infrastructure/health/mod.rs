//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, gateway status reporting, and Prometheus
//! metrics. Used by container orchestrators, load balancers, and monitoring
//! systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (stream and service mode)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{CacheStats, HybridCache};
use crate::domain::connection::ConnectionState;
use crate::domain::subscription::SubscriptionStats;
use crate::infrastructure::config::Container;
use crate::infrastructure::exchange::ExchangeFeed;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::resilience::fallback::{FallbackManager, FallbackStats, ServiceMode};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Gateway version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Stream connection state.
    pub connection: ConnectionState,
    /// Fallback state.
    pub service: FallbackStats,
    /// Ticket pool usage.
    pub tickets: TicketStatus,
    /// Cache counters.
    pub cache: CacheStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Normal mode with the stream connected.
    Healthy,
    /// Serving, but not through the full path.
    Degraded,
    /// Not able to serve.
    Unhealthy,
}

/// Ticket pool usage.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketStatus {
    /// Tickets in use.
    pub in_use: usize,
    /// Ticket limit.
    pub max: usize,
    /// Data type entries across tickets.
    pub entries: usize,
    /// Subscribed (data type, symbol) pairs.
    pub symbols: usize,
}

impl TicketStatus {
    const fn new(stats: SubscriptionStats, max: usize) -> Self {
        Self {
            in_use: stats.tickets,
            max,
            entries: stats.entries,
            symbols: stats.symbols,
        }
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    feed: Arc<ExchangeFeed>,
    fallback: Arc<FallbackManager>,
    cache: Arc<HybridCache>,
    max_tickets: usize,
}

impl std::fmt::Debug for HealthServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthServerState")
            .field("version", &self.version)
            .field("max_tickets", &self.max_tickets)
            .finish_non_exhaustive()
    }
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        feed: Arc<ExchangeFeed>,
        fallback: Arc<FallbackManager>,
        cache: Arc<HybridCache>,
        max_tickets: usize,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            feed,
            fallback,
            cache,
            max_tickets,
        }
    }

    /// State observing a wired container.
    #[must_use]
    pub fn from_container(version: String, container: &Container) -> Self {
        Self::new(
            version,
            Arc::clone(container.feed()),
            Arc::clone(container.fallback()),
            Arc::clone(container.cache()),
            container.config().stream.max_tickets,
        )
    }

    /// Current health snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HealthResponse {
        let connection = self.feed.connection().state();
        let service = self.fallback.stats();
        HealthResponse {
            status: determine_health_status(service.mode, connection),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            connection,
            service,
            tickets: TicketStatus::new(self.feed.subscriptions().stats(), self.max_tickets),
            cache: self.cache.stats(),
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by [`HealthServer`].
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = state.snapshot();
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if is_ready(state.fallback.mode(), state.feed.connection().state()) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

/// Degraded mode serves through the direct client regardless of the stream.
const fn is_ready(mode: ServiceMode, connection: ConnectionState) -> bool {
    match mode {
        ServiceMode::Degraded => true,
        ServiceMode::Normal => matches!(connection, ConnectionState::Connected),
    }
}

const fn determine_health_status(mode: ServiceMode, connection: ConnectionState) -> HealthStatus {
    match (mode, connection) {
        (ServiceMode::Normal, ConnectionState::Connected) => HealthStatus::Healthy,
        (ServiceMode::Degraded, _) | (ServiceMode::Normal, ConnectionState::Reconnecting) => {
            HealthStatus::Degraded
        }
        (ServiceMode::Normal, _) => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test_case(ServiceMode::Normal, ConnectionState::Connected, HealthStatus::Healthy; "normal connected")]
    #[test_case(ServiceMode::Normal, ConnectionState::Reconnecting, HealthStatus::Degraded; "normal reconnecting")]
    #[test_case(ServiceMode::Normal, ConnectionState::Connecting, HealthStatus::Unhealthy; "normal connecting")]
    #[test_case(ServiceMode::Normal, ConnectionState::Failed, HealthStatus::Unhealthy; "normal failed")]
    #[test_case(ServiceMode::Degraded, ConnectionState::Failed, HealthStatus::Degraded; "degraded failed")]
    fn status_follows_mode_and_connection(
        mode: ServiceMode,
        connection: ConnectionState,
        expected: HealthStatus,
    ) {
        assert_eq!(determine_health_status(mode, connection), expected);
    }

    #[test]
    fn readiness() {
        assert!(is_ready(ServiceMode::Normal, ConnectionState::Connected));
        assert!(is_ready(ServiceMode::Degraded, ConnectionState::Disconnected));
        assert!(!is_ready(ServiceMode::Normal, ConnectionState::Connecting));
        assert!(!is_ready(ServiceMode::Normal, ConnectionState::Reconnecting));
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let response = liveness_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
