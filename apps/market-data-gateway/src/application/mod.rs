//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (stream, batch API, cache store).
pub mod ports;

/// Routing, caching and the consumer facade.
pub mod services;
