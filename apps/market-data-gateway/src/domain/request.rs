//! Request / Response Contract
//!
//! What consumers ask for and what they always get back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cache_record::CacheRecord;
use super::market_data::{DataType, MarketPayload, Orderbook, Ticker, Trade};
use super::timeframe::Timeframe;

/// How gap-filled series are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    /// Every expected slot, including `Empty` and `Failed` placeholders.
    #[default]
    Continuous,
    /// Only slots with real activity.
    ActualOnly,
}

impl ReadMode {
    /// Mode for an `include_empty` flag.
    #[must_use]
    pub const fn from_include_empty(include_empty: bool) -> Self {
        if include_empty {
            Self::Continuous
        } else {
            Self::ActualOnly
        }
    }
}

/// Inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// First instant.
    pub start: DateTime<Utc>,
    /// Last instant.
    pub end: DateTime<Utc>,
}

/// A data request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    /// Market codes.
    pub symbols: Vec<String>,
    /// Requested data type.
    pub data_type: DataType,
    /// Number of records per symbol.
    pub count: usize,
    /// Historical end point; `None` means "now".
    pub as_of: Option<DateTime<Utc>>,
    /// Explicit range, candles only.
    pub range: Option<TimeRange>,
    /// Range read mode.
    pub read_mode: ReadMode,
}

impl DataQuery {
    /// Most recent record per symbol.
    #[must_use]
    pub const fn latest(symbols: Vec<String>, data_type: DataType) -> Self {
        Self {
            symbols,
            data_type,
            count: 1,
            as_of: None,
            range: None,
            read_mode: ReadMode::Continuous,
        }
    }

    /// Last `count` records per symbol, optionally ending at `as_of`.
    #[must_use]
    pub const fn history(
        symbols: Vec<String>,
        data_type: DataType,
        count: usize,
        as_of: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            symbols,
            data_type,
            count,
            as_of,
            range: None,
            read_mode: ReadMode::ActualOnly,
        }
    }

    /// Gap-filled candle range for one symbol.
    #[must_use]
    pub fn range(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_empty: bool,
    ) -> Self {
        Self {
            symbols: vec![symbol.into()],
            data_type: DataType::Candle(timeframe),
            count: timeframe.slot_count(start, end),
            as_of: Some(end),
            range: Some(TimeRange { start, end }),
            read_mode: ReadMode::from_include_empty(include_empty),
        }
    }

    /// Whether the query has a historical bound before `now`.
    #[must_use]
    pub fn is_historical(&self, now: DateTime<Utc>) -> bool {
        self.range.is_some() || self.as_of.is_some_and(|t| t < now)
    }

    /// Whether only the batch/history path can answer this query.
    ///
    /// A stream only ever holds the latest state per symbol.
    #[must_use]
    pub fn requires_batch(&self, now: DateTime<Utc>) -> bool {
        self.count > 1 || self.is_historical(now)
    }
}

/// Where a response was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Live stream last values.
    Stream,
    /// Cache tiers without an upstream call.
    Cache,
    /// Batch/history upstream (written through the cache).
    Batch,
    /// Degraded direct client.
    Direct,
}

impl DataSource {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Cache => "cache",
            Self::Batch => "batch",
            Self::Direct => "direct",
        }
    }
}

/// One record in a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MarketRecord {
    /// Ticker.
    Ticker(Ticker),
    /// Trade.
    Trade(Trade),
    /// Order book.
    Orderbook(Orderbook),
    /// Candle slot.
    Candle(CacheRecord),
}

impl MarketRecord {
    /// Market code of the record.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Ticker(t) => &t.symbol,
            Self::Trade(t) => &t.symbol,
            Self::Orderbook(o) => &o.symbol,
            Self::Candle(c) => &c.symbol,
        }
    }

    /// Data type of the record.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Ticker(_) => DataType::Ticker,
            Self::Trade(_) => DataType::Trade,
            Self::Orderbook(_) => DataType::Orderbook,
            Self::Candle(c) => DataType::Candle(c.timeframe),
        }
    }

    /// Exchange timestamp (slot start for candles).
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Ticker(t) => t.timestamp,
            Self::Trade(t) => t.timestamp,
            Self::Orderbook(o) => o.timestamp,
            Self::Candle(c) => c.timestamp,
        }
    }
}

impl From<MarketPayload> for MarketRecord {
    fn from(payload: MarketPayload) -> Self {
        match payload {
            MarketPayload::Ticker(t) => Self::Ticker(t),
            MarketPayload::Trade(t) => Self::Trade(t),
            MarketPayload::Orderbook(o) => Self::Orderbook(o),
            MarketPayload::Candle(c) => Self::Candle(CacheRecord::collected(&c, false)),
        }
    }
}

/// Response returned to every consumer call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataResponse {
    /// Whether the request was served.
    pub success: bool,
    /// Records, oldest first per symbol.
    pub data: Vec<MarketRecord>,
    /// Path that served (or attempted) the request.
    pub source: DataSource,
    /// `data.len()`.
    pub record_count: usize,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataResponse {
    /// Successful response.
    #[must_use]
    pub fn ok(data: Vec<MarketRecord>, source: DataSource) -> Self {
        Self {
            success: true,
            record_count: data.len(),
            data,
            source,
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failure(source: DataSource, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            source,
            record_count: 0,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn symbols() -> Vec<String> {
        vec!["KRW-BTC".to_string()]
    }

    #[test]
    fn latest_query_may_use_stream() {
        let query = DataQuery::latest(symbols(), DataType::Ticker);
        assert!(!query.requires_batch(Utc::now()));
    }

    #[test]
    fn bulk_or_historical_queries_require_batch() {
        let now = Utc::now();
        let bulk = DataQuery::history(symbols(), DataType::Trade, 5, None);
        assert!(bulk.requires_batch(now));

        let past = DataQuery::history(symbols(), DataType::Ticker, 1, Some(now - TimeDelta::hours(1)));
        assert!(past.requires_batch(now));

        let future = DataQuery::history(symbols(), DataType::Ticker, 1, Some(now + TimeDelta::hours(1)));
        assert!(!future.requires_batch(now));

        let range = DataQuery::range("KRW-BTC", Timeframe::Minute1, now, now, true);
        assert!(range.requires_batch(now));
    }

    #[test]
    fn response_serializes_contract_fields() {
        let response = DataResponse::ok(Vec::new(), DataSource::Cache);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["source"], "cache");
        assert_eq!(json["recordCount"], 0);
        assert!(json.get("error").is_none());

        let failed = serde_json::to_value(DataResponse::failure(DataSource::Batch, "boom")).unwrap();
        assert_eq!(failed["success"], false);
        assert_eq!(failed["error"], "boom");
    }

    #[test]
    fn read_mode_from_flag() {
        assert_eq!(ReadMode::from_include_empty(true), ReadMode::Continuous);
        assert_eq!(ReadMode::from_include_empty(false), ReadMode::ActualOnly);
    }
}
