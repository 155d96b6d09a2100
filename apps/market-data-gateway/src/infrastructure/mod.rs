//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports, plus process-level
//! concerns (configuration, health, metrics, telemetry).

/// Configuration and dependency injection.
pub mod config;

/// Exchange adapter: WebSocket stream, REST batch API, direct client.
pub mod exchange;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Persistent cache tier implementations.
pub mod persistence;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
