//! Exchange Message Types
//!
//! Serde shapes of the exchange's JSON payloads. Stream frames and REST
//! responses share field names except for the market code, which the stream
//! calls `code` and REST calls `market`.
//!
//! # Stream Trade (JSON)
//! ```json
//! {
//!   "type": "trade",
//!   "code": "KRW-BTC",
//!   "trade_price": 51000000.0,
//!   "trade_volume": 0.0012,
//!   "ask_bid": "BID",
//!   "sequential_id": 17000000000000000,
//!   "trade_timestamp": 1704067200000,
//!   "timestamp": 1704067200050,
//!   "stream_type": "REALTIME"
//! }
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market_data::{
    Candle, Orderbook, OrderbookLevel, PriceChange, Side, Ticker, Trade,
};
use crate::domain::timeframe::Timeframe;

/// Millisecond epoch to UTC. Out-of-range values map to the epoch.
fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// =============================================================================
// Control Frames
// =============================================================================

/// Liveness reply, e.g. `{"status":"UP"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Reported status.
    pub status: String,
}

/// Error body inside an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error name, e.g. `INVALID_PARAM`.
    #[serde(default)]
    pub name: String,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
}

/// Error frame, e.g. `{"error":{"name":"NO_TICKET","message":"..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error details.
    pub error: ErrorBody,
}

// =============================================================================
// Market Data
// =============================================================================

/// Ticker, from the stream or `/v1/ticker`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerMessage {
    /// Market code.
    #[serde(alias = "market")]
    pub code: String,
    /// Session open.
    pub opening_price: Decimal,
    /// Session high.
    pub high_price: Decimal,
    /// Session low.
    pub low_price: Decimal,
    /// Last trade price.
    pub trade_price: Decimal,
    /// Previous close.
    pub prev_closing_price: Decimal,
    /// `RISE`, `EVEN` or `FALL`.
    pub change: String,
    /// Signed change rate.
    #[serde(default)]
    pub signed_change_rate: Decimal,
    /// Rolling 24h base volume.
    #[serde(default)]
    pub acc_trade_volume_24h: Decimal,
    /// Rolling 24h quote volume.
    #[serde(default)]
    pub acc_trade_price_24h: Decimal,
    /// Exchange timestamp (ms).
    pub timestamp: i64,
}

impl TickerMessage {
    /// Convert to the domain ticker.
    #[must_use]
    pub fn into_domain(self) -> Ticker {
        let change = match self.change.as_str() {
            "RISE" => PriceChange::Rise,
            "FALL" => PriceChange::Fall,
            _ => PriceChange::Even,
        };
        Ticker {
            symbol: self.code,
            trade_price: self.trade_price,
            opening_price: self.opening_price,
            high_price: self.high_price,
            low_price: self.low_price,
            prev_closing_price: self.prev_closing_price,
            change,
            signed_change_rate: self.signed_change_rate,
            acc_trade_volume_24h: self.acc_trade_volume_24h,
            acc_trade_price_24h: self.acc_trade_price_24h,
            timestamp: millis(self.timestamp),
        }
    }
}

/// Trade, from the stream or `/v1/trades/ticks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeMessage {
    /// Market code.
    #[serde(alias = "market")]
    pub code: String,
    /// Execution price.
    pub trade_price: Decimal,
    /// Executed quantity.
    pub trade_volume: Decimal,
    /// `ASK` or `BID`.
    pub ask_bid: String,
    /// Sequence number.
    pub sequential_id: u64,
    /// Execution time (ms). Falls back to `timestamp` when absent.
    #[serde(default)]
    pub trade_timestamp: Option<i64>,
    /// Exchange timestamp (ms).
    pub timestamp: i64,
}

impl TradeMessage {
    /// Convert to the domain trade.
    #[must_use]
    pub fn into_domain(self) -> Trade {
        let side = if self.ask_bid.eq_ignore_ascii_case("ASK") {
            Side::Ask
        } else {
            Side::Bid
        };
        Trade {
            symbol: self.code,
            price: self.trade_price,
            volume: self.trade_volume,
            side,
            sequential_id: self.sequential_id,
            timestamp: millis(self.trade_timestamp.unwrap_or(self.timestamp)),
        }
    }
}

/// One order book unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderbookUnit {
    /// Ask price.
    pub ask_price: Decimal,
    /// Bid price.
    pub bid_price: Decimal,
    /// Ask quantity.
    pub ask_size: Decimal,
    /// Bid quantity.
    pub bid_size: Decimal,
}

/// Order book, from the stream or `/v1/orderbook`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderbookMessage {
    /// Market code.
    #[serde(alias = "market")]
    pub code: String,
    /// Total resting ask quantity.
    pub total_ask_size: Decimal,
    /// Total resting bid quantity.
    pub total_bid_size: Decimal,
    /// Levels, best first.
    pub orderbook_units: Vec<OrderbookUnit>,
    /// Exchange timestamp (ms).
    pub timestamp: i64,
}

impl OrderbookMessage {
    /// Convert to the domain order book.
    #[must_use]
    pub fn into_domain(self) -> Orderbook {
        Orderbook {
            symbol: self.code,
            levels: self
                .orderbook_units
                .into_iter()
                .map(|u| OrderbookLevel {
                    ask_price: u.ask_price,
                    ask_size: u.ask_size,
                    bid_price: u.bid_price,
                    bid_size: u.bid_size,
                })
                .collect(),
            total_ask_size: self.total_ask_size,
            total_bid_size: self.total_bid_size,
            timestamp: millis(self.timestamp),
        }
    }
}

/// Candle, from the stream or `/v1/candles/*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleMessage {
    /// Market code.
    #[serde(alias = "market")]
    pub code: String,
    /// Window start, UTC, without offset (`2024-01-01T00:00:00`).
    pub candle_date_time_utc: String,
    /// First trade price.
    pub opening_price: Decimal,
    /// Highest trade price.
    pub high_price: Decimal,
    /// Lowest trade price.
    pub low_price: Decimal,
    /// Last trade price.
    pub trade_price: Decimal,
    /// Base volume.
    pub candle_acc_trade_volume: Decimal,
    /// Quote volume.
    pub candle_acc_trade_price: Decimal,
    /// Minute unit on REST minute candles.
    #[serde(default)]
    pub unit: Option<u32>,
}

impl CandleMessage {
    /// Parsed window start.
    ///
    /// # Errors
    ///
    /// Returns the chrono parse error for a malformed `candle_date_time_utc`.
    pub fn open_time(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(&self.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
            .map(|naive| naive.and_utc())
    }

    /// Timeframe implied by the `unit` field.
    #[must_use]
    pub fn unit_timeframe(&self) -> Option<Timeframe> {
        let unit = self.unit?;
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.minute_unit() == Some(unit))
    }

    /// Convert to the domain candle.
    ///
    /// # Errors
    ///
    /// Returns the chrono parse error for a malformed window start.
    pub fn into_domain(self, timeframe: Timeframe) -> Result<Candle, chrono::ParseError> {
        let open_time = self.open_time()?;
        Ok(Candle {
            symbol: self.code,
            timeframe,
            open_time,
            open: self.opening_price,
            high: self.high_price,
            low: self.low_price,
            close: self.trade_price,
            volume: self.candle_acc_trade_volume,
            quote_volume: self.candle_acc_trade_price,
        })
    }
}
