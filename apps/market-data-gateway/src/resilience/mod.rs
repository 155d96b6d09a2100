//! Resilience patterns for upstream access.
//!
//! Token-bucket rate limiting for connection attempts and batch calls, and
//! the fallback manager that degrades to a direct client when the primary
//! data path keeps failing.

pub mod fallback;
pub mod rate_limiter;

pub use fallback::{FallbackConfig, FallbackManager, FallbackStats, ServiceMode};
pub use rate_limiter::{RateLimitBudget, RateLimitConfig, RateLimitExceeded, RateLimiter};
