//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `MessageRouter`: Decodes inbound frames and dispatches them to handlers
//! - `HybridCache`: Memory, persistent and upstream tiers with gap fill
//! - `SmartRouter`: Per-request choice between stream and batch paths
//! - `MarketDataGateway`: Consumer-facing facade over the fallback manager

pub mod gateway;
pub mod hybrid_cache;
pub mod message_router;
pub mod smart_router;

pub use gateway::MarketDataGateway;
pub use hybrid_cache::{CacheConfig, CacheStats, CacheTier, HybridCache, PersistQueue, RangeRead};
pub use message_router::{FrameSummary, MessageRouter, WindowClosed};
pub use smart_router::{RoutingConfig, SmartRouter};
