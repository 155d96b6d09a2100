//! Crate-level error types.
//!
//! Each module owns its error enum; [`GatewayError`] gathers them for
//! bootstrap and other call sites that cross module boundaries. Consumers of
//! the data API never see these directly: they receive
//! `DataResponse { success: false, error }`.

use crate::application::ports::{
    ConnectionError, ServiceError, StoreError, UpstreamError, UpstreamProtocolError,
};
use crate::domain::market_data::DataType;
use crate::domain::subscription::SubscriptionError;
use crate::infrastructure::config::ConfigError;
use crate::infrastructure::health::HealthServerError;
use crate::resilience::rate_limiter::RateLimitExceeded;

/// The upstream cannot supply the requested history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no {data_type} history available for {symbol}: {reason}")]
pub struct DataGapError {
    /// Market code.
    pub symbol: String,
    /// Requested data type.
    pub data_type: DataType,
    /// Why it cannot be served.
    pub reason: String,
}

impl DataGapError {
    /// Build a gap error.
    #[must_use]
    pub fn new(symbol: impl Into<String>, data_type: DataType, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            data_type,
            reason: reason.into(),
        }
    }
}

/// Any gateway error.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Stream transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Ticket pool exhausted.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    /// Token bucket empty for a non-waiting caller.
    #[error(transparent)]
    RateLimit(#[from] RateLimitExceeded),
    /// History cannot be supplied.
    #[error(transparent)]
    DataGap(#[from] DataGapError),
    /// Malformed inbound frame.
    #[error(transparent)]
    Protocol(#[from] UpstreamProtocolError),
    /// Batch API failure.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Persistent tier failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Data service failure.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Health server failure.
    #[error(transparent)]
    Health(#[from] HealthServerError),
}
