//! Cache Records
//!
//! Time-indexed candle slots with an explicit collection status.
//!
//! # Status transitions
//!
//! ```text
//! Pending ──► Collected | Empty | Failed
//! Failed  ──► Collected | Empty | Failed (attempts++)
//! Collected (in progress) ──► Collected (newer realtime) | Collected (final)
//! Collected (final), Empty: immutable
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market_data::Candle;
use super::timeframe::Timeframe;

/// Collection state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    /// Trades occurred and the candle is stored.
    Collected,
    /// Upstream confirmed no activity in this slot.
    Empty,
    /// Window still open, outcome unknown.
    Pending,
    /// Collection attempt failed; retried on next access.
    Failed,
}

impl CollectionStatus {
    /// Storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collected => "collected",
            Self::Empty => "empty",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    /// Whether the slot needs no further upstream fetch.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Collected | Self::Empty)
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collected" => Ok(Self::Collected),
            "empty" => Ok(Self::Empty),
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown collection status: {other}")),
        }
    }
}

/// Identifies one cached series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Market code.
    pub symbol: String,
    /// Candle granularity.
    pub timeframe: Timeframe,
}

impl SeriesKey {
    /// Build a key.
    #[must_use]
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.timeframe)
    }
}

/// Upstream attempt bookkeeping for a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptMeta {
    /// Number of upstream attempts that covered this slot.
    pub attempt_count: u32,
    /// Time of the latest attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// HTTP status (or exchange code) of the latest attempt.
    pub upstream_code: Option<u16>,
}

impl AttemptMeta {
    /// Bookkeeping after one more attempt.
    #[must_use]
    pub fn next(&self, at: DateTime<Utc>, upstream_code: Option<u16>) -> Self {
        Self {
            attempt_count: self.attempt_count.saturating_add(1),
            last_attempt_at: Some(at),
            upstream_code,
        }
    }
}

/// OHLCV values of a collected slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleFields {
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

impl From<&Candle> for CandleFields {
    fn from(candle: &Candle) -> Self {
        Self {
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            quote_volume: candle.quote_volume,
        }
    }
}

/// One time slot of a cached series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Market code.
    pub symbol: String,
    /// Candle granularity.
    pub timeframe: Timeframe,
    /// Slot start (aligned).
    pub timestamp: DateTime<Utc>,
    /// Candle values, present only when collected.
    pub fields: Option<CandleFields>,
    /// Collection state.
    pub status: CollectionStatus,
    /// Whether the window is closed and the record frozen.
    pub is_final: bool,
    /// Upstream attempt bookkeeping.
    pub attempts: AttemptMeta,
}

impl CacheRecord {
    /// Record for a collected candle.
    #[must_use]
    pub fn collected(candle: &Candle, is_final: bool) -> Self {
        Self {
            symbol: candle.symbol.clone(),
            timeframe: candle.timeframe,
            timestamp: candle.timeframe.floor(candle.open_time),
            fields: Some(CandleFields::from(candle)),
            status: CollectionStatus::Collected,
            is_final,
            attempts: AttemptMeta::default(),
        }
    }

    /// Slot with confirmed zero activity.
    #[must_use]
    pub fn empty(key: &SeriesKey, timestamp: DateTime<Utc>) -> Self {
        Self::placeholder(key, timestamp, CollectionStatus::Empty, true)
    }

    /// Slot whose window is still open.
    #[must_use]
    pub fn pending(key: &SeriesKey, timestamp: DateTime<Utc>) -> Self {
        Self::placeholder(key, timestamp, CollectionStatus::Pending, false)
    }

    /// Slot whose collection attempt failed.
    #[must_use]
    pub fn failed(key: &SeriesKey, timestamp: DateTime<Utc>, attempts: AttemptMeta) -> Self {
        let mut record = Self::placeholder(key, timestamp, CollectionStatus::Failed, false);
        record.attempts = attempts;
        record
    }

    fn placeholder(
        key: &SeriesKey,
        timestamp: DateTime<Utc>,
        status: CollectionStatus,
        is_final: bool,
    ) -> Self {
        Self {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            timestamp,
            fields: None,
            status,
            is_final,
            attempts: AttemptMeta::default(),
        }
    }

    /// Attach attempt bookkeeping.
    #[must_use]
    pub fn with_attempts(mut self, attempts: AttemptMeta) -> Self {
        self.attempts = attempts;
        self
    }

    /// Series this record belongs to.
    #[must_use]
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe)
    }

    /// Whether this record represents real trading activity.
    #[must_use]
    pub const fn is_actual(&self) -> bool {
        matches!(self.status, CollectionStatus::Collected)
    }

    /// Collected from the stream for a window that has not been frozen yet.
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self.status, CollectionStatus::Collected) && !self.is_final
    }

    /// Whether `incoming` may replace this record for the same slot.
    ///
    /// Completed records never regress; only in-progress collected records
    /// accept newer collected values.
    #[must_use]
    pub const fn accepts(&self, incoming: &Self) -> bool {
        match self.status {
            CollectionStatus::Pending | CollectionStatus::Failed => true,
            CollectionStatus::Empty => false,
            CollectionStatus::Collected => {
                !self.is_final && matches!(incoming.status, CollectionStatus::Collected)
            }
        }
    }

    /// Merge `incoming` into `existing` following [`Self::accepts`].
    ///
    /// Returns the record that should be stored, or `None` when the existing
    /// one stays.
    #[must_use]
    pub fn merge(existing: Option<&Self>, incoming: Self) -> Option<Self> {
        match existing {
            None => Some(incoming),
            Some(current) if current == &incoming => None,
            Some(current) if current.accepts(&incoming) => {
                let mut merged = incoming;
                if merged.attempts.attempt_count < current.attempts.attempt_count {
                    merged.attempts.attempt_count = current.attempts.attempt_count;
                }
                if merged.attempts.last_attempt_at.is_none() {
                    merged.attempts.last_attempt_at = current.attempts.last_attempt_at;
                }
                Some(merged)
            }
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::prelude::FromPrimitive;

    fn key() -> SeriesKey {
        SeriesKey::new("KRW-BTC", Timeframe::Minute1)
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap()
    }

    fn candle(close: f64) -> Candle {
        let price = Decimal::from_f64(close).unwrap();
        Candle {
            symbol: "KRW-BTC".to_string(),
            timeframe: Timeframe::Minute1,
            open_time: ts(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ONE,
            quote_volume: price,
        }
    }

    #[test]
    fn pending_accepts_any_outcome() {
        let pending = CacheRecord::pending(&key(), ts());
        assert!(pending.accepts(&CacheRecord::empty(&key(), ts())));
        assert!(pending.accepts(&CacheRecord::collected(&candle(1.0), true)));
        assert!(pending.accepts(&CacheRecord::failed(&key(), ts(), AttemptMeta::default())));
    }

    #[test]
    fn completed_records_never_regress() {
        let final_record = CacheRecord::collected(&candle(1.0), true);
        assert!(!final_record.accepts(&CacheRecord::collected(&candle(2.0), true)));
        assert!(!final_record.accepts(&CacheRecord::empty(&key(), ts())));

        let empty = CacheRecord::empty(&key(), ts());
        assert!(!empty.accepts(&CacheRecord::collected(&candle(2.0), false)));
        assert!(!empty.accepts(&CacheRecord::failed(&key(), ts(), AttemptMeta::default())));
    }

    #[test]
    fn in_progress_record_takes_newer_values_until_frozen() {
        let live = CacheRecord::collected(&candle(1.0), false);
        let newer = CacheRecord::collected(&candle(2.0), false);
        let merged = CacheRecord::merge(Some(&live), newer.clone()).unwrap();
        assert_eq!(merged.fields.unwrap().close, newer.fields.unwrap().close);

        assert!(!live.accepts(&CacheRecord::failed(&key(), ts(), AttemptMeta::default())));

        let frozen = CacheRecord::collected(&candle(3.0), true);
        let merged = CacheRecord::merge(Some(&live), frozen).unwrap();
        assert!(merged.is_final);
        assert!(CacheRecord::merge(Some(&merged), CacheRecord::collected(&candle(4.0), false)).is_none());
    }

    #[test]
    fn merge_keeps_attempt_history() {
        let attempts = AttemptMeta::default().next(ts(), Some(500)).next(ts(), Some(500));
        let failed = CacheRecord::failed(&key(), ts(), attempts);
        let merged = CacheRecord::merge(Some(&failed), CacheRecord::empty(&key(), ts())).unwrap();
        assert_eq!(merged.status, CollectionStatus::Empty);
        assert_eq!(merged.attempts.attempt_count, 2);
    }

    #[test]
    fn identical_record_is_a_no_op() {
        let empty = CacheRecord::empty(&key(), ts());
        assert!(CacheRecord::merge(Some(&empty), empty.clone()).is_none());
    }

    #[test]
    fn collected_record_is_aligned() {
        let mut c = candle(1.0);
        c.open_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 17).unwrap();
        assert_eq!(CacheRecord::collected(&c, true).timestamp, ts());
    }

    #[test]
    fn status_labels_round_trip() {
        for status in [
            CollectionStatus::Collected,
            CollectionStatus::Empty,
            CollectionStatus::Pending,
            CollectionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CollectionStatus>(), Ok(status));
        }
    }
}
