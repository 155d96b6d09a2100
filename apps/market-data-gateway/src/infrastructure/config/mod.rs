//! Configuration Module
//!
//! Configuration loading and dependency injection for the gateway.

mod container;
mod settings;

pub use container::{Container, RouterFactory};
pub use settings::{
    CacheSettings, ConfigError, GatewayConfig, RateLimitSettings, RestSettings, RoutingSettings,
    ServiceSettings, StoreBackend, StreamSettings, parse_symbol_list,
};
