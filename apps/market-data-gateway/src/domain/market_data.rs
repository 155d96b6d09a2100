//! Market Data Types
//!
//! Decoded, exchange-neutral representations of streamed market data.
//!
//! Inbound frames are resolved once into [`MarketPayload`], a closed sum type.
//! Nothing downstream of the router inspects raw JSON again.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::timeframe::Timeframe;

// =============================================================================
// Data Type
// =============================================================================

/// Kind of market data a subscription or request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    /// Rolling 24h ticker.
    Ticker,
    /// Individual trade prints.
    Trade,
    /// Order book depth.
    Orderbook,
    /// OHLCV candles of a fixed timeframe.
    Candle(Timeframe),
}

impl DataType {
    /// Name used on the wire (`ticker`, `trade`, `orderbook`, `candle.1m`).
    #[must_use]
    pub fn wire_name(self) -> String {
        match self {
            Self::Ticker => "ticker".to_string(),
            Self::Trade => "trade".to_string(),
            Self::Orderbook => "orderbook".to_string(),
            Self::Candle(tf) => format!("candle.{tf}"),
        }
    }

    /// Whether records of this type describe closed time windows.
    #[must_use]
    pub const fn is_windowed(self) -> bool {
        matches!(self, Self::Candle(_))
    }

    /// Timeframe for candle types.
    #[must_use]
    pub const fn timeframe(self) -> Option<Timeframe> {
        match self {
            Self::Candle(tf) => Some(tf),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

/// Error parsing a data type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown data type: {0}")]
pub struct ParseDataTypeError(pub String);

impl FromStr for DataType {
    type Err = ParseDataTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ticker" => Ok(Self::Ticker),
            "trade" => Ok(Self::Trade),
            "orderbook" => Ok(Self::Orderbook),
            other => other
                .strip_prefix("candle.")
                .and_then(|tf| tf.parse().ok())
                .map(Self::Candle)
                .ok_or_else(|| ParseDataTypeError(s.to_string())),
        }
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.wire_name())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Stream Phase
// =============================================================================

/// Whether a record is final for its window or an in-progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamPhase {
    /// Window is complete and will not change.
    Snapshot,
    /// In-progress update for the current window.
    Realtime,
}

impl StreamPhase {
    /// Parse the exchange `stream_type` tag. Unknown tags are realtime.
    #[must_use]
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            Some(t) if t.eq_ignore_ascii_case("SNAPSHOT") => Self::Snapshot,
            _ => Self::Realtime,
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    /// Seller initiated.
    Ask,
    /// Buyer initiated.
    Bid,
}

/// Direction against the previous close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceChange {
    /// Above previous close.
    Rise,
    /// Equal to previous close.
    Even,
    /// Below previous close.
    Fall,
}

/// Rolling ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    /// Market code.
    pub symbol: String,
    /// Last trade price.
    pub trade_price: Decimal,
    /// Session open.
    pub opening_price: Decimal,
    /// Session high.
    pub high_price: Decimal,
    /// Session low.
    pub low_price: Decimal,
    /// Previous session close.
    pub prev_closing_price: Decimal,
    /// Direction against previous close.
    pub change: PriceChange,
    /// Signed change rate against previous close.
    pub signed_change_rate: Decimal,
    /// Rolling 24h base volume.
    pub acc_trade_volume_24h: Decimal,
    /// Rolling 24h quote volume.
    pub acc_trade_price_24h: Decimal,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

/// A single trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    /// Market code.
    pub symbol: String,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub volume: Decimal,
    /// Aggressor side.
    pub side: Side,
    /// Exchange sequence number, unique per market.
    pub sequential_id: u64,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
}

/// One price level pair of an order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderbookLevel {
    /// Ask price.
    pub ask_price: Decimal,
    /// Ask quantity.
    pub ask_size: Decimal,
    /// Bid price.
    pub bid_price: Decimal,
    /// Bid quantity.
    pub bid_size: Decimal,
}

/// Order book depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orderbook {
    /// Market code.
    pub symbol: String,
    /// Levels, best first.
    pub levels: Vec<OrderbookLevel>,
    /// Total resting ask quantity.
    pub total_ask_size: Decimal,
    /// Total resting bid quantity.
    pub total_bid_size: Decimal,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Orderbook {
    /// Best bid/ask spread, if the book has at least one level.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        self.levels.first().map(|l| l.ask_price - l.bid_price)
    }
}

/// OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Market code.
    pub symbol: String,
    /// Window granularity.
    pub timeframe: Timeframe,
    /// Window start (UTC).
    pub open_time: DateTime<Utc>,
    /// First trade price.
    pub open: Decimal,
    /// Highest trade price.
    pub high: Decimal,
    /// Lowest trade price.
    pub low: Decimal,
    /// Last trade price.
    pub close: Decimal,
    /// Base volume.
    pub volume: Decimal,
    /// Quote volume.
    pub quote_volume: Decimal,
}

/// Decoded market data payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MarketPayload {
    /// Ticker update.
    Ticker(Ticker),
    /// Trade print.
    Trade(Trade),
    /// Order book snapshot.
    Orderbook(Orderbook),
    /// Candle update.
    Candle(Candle),
}

impl MarketPayload {
    /// Data type of this payload.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Ticker(_) => DataType::Ticker,
            Self::Trade(_) => DataType::Trade,
            Self::Orderbook(_) => DataType::Orderbook,
            Self::Candle(c) => DataType::Candle(c.timeframe),
        }
    }

    /// Market code of this payload.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Ticker(t) => &t.symbol,
            Self::Trade(t) => &t.symbol,
            Self::Orderbook(o) => &o.symbol,
            Self::Candle(c) => &c.symbol,
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// An inbound market data message. Immutable once built by the router.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Market code.
    pub symbol: String,
    /// Final or in-progress.
    pub phase: StreamPhase,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
    /// Decoded payload.
    pub payload: MarketPayload,
}

impl Message {
    /// Build a message, taking the symbol from the payload.
    #[must_use]
    pub fn new(payload: MarketPayload, phase: StreamPhase, received_at: DateTime<Utc>) -> Self {
        Self {
            symbol: payload.symbol().to_string(),
            phase,
            received_at,
            payload,
        }
    }

    /// Data type of the payload.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        self.payload.data_type()
    }

    /// Whether this message closes a time window.
    #[must_use]
    pub const fn closes_window(&self) -> bool {
        matches!(self.phase, StreamPhase::Snapshot) && self.data_type().is_windowed()
    }
}

/// Result of decoding one element of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Market data.
    Market(Message),
    /// Liveness status reply (e.g. `{"status":"UP"}`).
    Status(String),
    /// Error reported by the exchange.
    ExchangeError {
        /// Error name.
        name: String,
        /// Human readable message.
        message: String,
    },
    /// Shape the decoder could not classify.
    Unrecognized {
        /// Why the element was rejected.
        reason: String,
    },
}
