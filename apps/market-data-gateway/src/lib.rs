#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Data Gateway - Real-time Market Data Access Layer
//!
//! Sits between an exchange's streaming and batch APIs and in-process
//! consumers. Keeps one WebSocket connection alive, packs logical
//! subscriptions into the exchange's five ticket slots, and serves latest
//! values and gap-aware candle history from a tiered cache, degrading to a
//! direct REST client when the primary path keeps failing.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types and rules
//!   - `timeframe`, `market_data`, `cache_record`, `request`
//!   - `connection`: Connection state and events
//!   - `subscription`: Ticket consolidation
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport, decoder, batch, store, and data-service contracts
//!   - `services`: Message router, hybrid cache, smart router, gateway facade
//!
//! - **Resilience**: Rate limiting and primary/direct fallback
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `exchange`: WebSocket stream, REST client, direct client
//!   - `persistence`: In-memory and SQLite cache stores
//!   - `config`: Configuration and dependency injection
//!   - `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                  ┌──────────────┐   frames   ┌───────────────┐
//! Exchange WS ────►│  Connection  │──────────►│ MessageRouter │──► HybridCache
//!                  │    Worker    │◄── tickets ┤ Subscriptions │        ▲
//!                  └──────────────┘            └───────────────┘        │
//!                                                                       │
//! Consumer ──► MarketDataGateway ──► FallbackManager ──► SmartRouter ───┤
//!                                          │                            │
//!                                          └────► DirectClient ──► Exchange REST
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Resilience layer - Rate limiting and fallback.
pub mod resilience;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Error taxonomy.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::cache_record::{CacheRecord, CollectionStatus};
pub use domain::connection::{ConnectionEvent, ConnectionState};
pub use domain::market_data::{Candle, DataType, Message, Orderbook, Ticker, Trade};
pub use domain::request::{DataQuery, DataResponse, DataSource, MarketRecord, ReadMode};
pub use domain::subscription::{
    SubscriptionError, SubscriptionManager, SubscriptionParams, SubscriptionStats, TicketId,
};
pub use domain::timeframe::Timeframe;

// Application services
pub use application::services::{
    CacheStats, HybridCache, MarketDataGateway, MessageRouter, RoutingConfig, SmartRouter,
};

// Resilience
pub use resilience::{
    FallbackConfig, FallbackManager, RateLimitConfig, RateLimiter, ServiceMode,
};

// Infrastructure config
pub use infrastructure::config::{
    CacheSettings, ConfigError, Container, GatewayConfig, RateLimitSettings, RestSettings,
    RoutingSettings, ServiceSettings, StoreBackend, StreamSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Errors
pub use error::{DataGapError, GatewayError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
