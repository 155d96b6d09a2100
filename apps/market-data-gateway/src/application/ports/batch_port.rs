//! Batch Client Port (Driven Port)
//!
//! History and snapshot reads from the exchange REST API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::market_data::{Candle, Orderbook, Ticker, Trade};
use crate::domain::timeframe::Timeframe;

/// Batch API errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Non-success HTTP status.
    #[error("upstream returned HTTP {status}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },
    /// Request could not be sent or the response not read.
    #[error("upstream transport error: {0}")]
    Transport(String),
    /// Request exceeded its bound.
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body did not match the expected shape.
    #[error("upstream response could not be decoded: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// HTTP status, when there was one.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Exchange batch/history API.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Up to `count` candles with `open_time < to`, newest first.
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        to: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<Candle>, UpstreamError>;

    /// Current ticker per symbol.
    async fn tickers(&self, symbols: &[String]) -> Result<Vec<Ticker>, UpstreamError>;

    /// Most recent `count` trades, newest first.
    async fn trades(&self, symbol: &str, count: usize) -> Result<Vec<Trade>, UpstreamError>;

    /// Current order book per symbol.
    async fn orderbooks(&self, symbols: &[String]) -> Result<Vec<Orderbook>, UpstreamError>;
}
