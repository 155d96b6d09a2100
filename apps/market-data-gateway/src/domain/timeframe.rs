//! Candle Timeframes
//!
//! Fixed-width candle granularities and the slot arithmetic used by the cache
//! to enumerate expected timestamps.
//!
//! All timestamps are UTC. Weekly windows open on Monday 00:00 UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const SECS_PER_DAY: i64 = 86_400;

/// Candle granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    /// One second.
    Second1,
    /// One minute.
    Minute1,
    /// Three minutes.
    Minute3,
    /// Five minutes.
    Minute5,
    /// Ten minutes.
    Minute10,
    /// Fifteen minutes.
    Minute15,
    /// Thirty minutes.
    Minute30,
    /// One hour.
    Minute60,
    /// Four hours.
    Minute240,
    /// One day.
    Day1,
    /// One week, Monday aligned.
    Week1,
}

impl Timeframe {
    /// Every supported timeframe, shortest first.
    pub const ALL: [Self; 11] = [
        Self::Second1,
        Self::Minute1,
        Self::Minute3,
        Self::Minute5,
        Self::Minute10,
        Self::Minute15,
        Self::Minute30,
        Self::Minute60,
        Self::Minute240,
        Self::Day1,
        Self::Week1,
    ];

    /// Short label, also used as the suffix of `candle.<tf>` data types.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Second1 => "1s",
            Self::Minute1 => "1m",
            Self::Minute3 => "3m",
            Self::Minute5 => "5m",
            Self::Minute10 => "10m",
            Self::Minute15 => "15m",
            Self::Minute30 => "30m",
            Self::Minute60 => "60m",
            Self::Minute240 => "240m",
            Self::Day1 => "1d",
            Self::Week1 => "1w",
        }
    }

    /// Window length in seconds.
    #[must_use]
    pub const fn duration_secs(self) -> i64 {
        match self {
            Self::Second1 => 1,
            Self::Minute1 => 60,
            Self::Minute3 => 180,
            Self::Minute5 => 300,
            Self::Minute10 => 600,
            Self::Minute15 => 900,
            Self::Minute30 => 1_800,
            Self::Minute60 => 3_600,
            Self::Minute240 => 14_400,
            Self::Day1 => SECS_PER_DAY,
            Self::Week1 => 7 * SECS_PER_DAY,
        }
    }

    /// Window length.
    #[must_use]
    pub fn duration(self) -> TimeDelta {
        TimeDelta::seconds(self.duration_secs())
    }

    /// Minute unit for minute-based candle endpoints.
    #[must_use]
    pub const fn minute_unit(self) -> Option<u32> {
        match self {
            Self::Minute1 => Some(1),
            Self::Minute3 => Some(3),
            Self::Minute5 => Some(5),
            Self::Minute10 => Some(10),
            Self::Minute15 => Some(15),
            Self::Minute30 => Some(30),
            Self::Minute60 => Some(60),
            Self::Minute240 => Some(240),
            Self::Second1 | Self::Day1 | Self::Week1 => None,
        }
    }

    /// Align a timestamp to the start of the window containing it.
    #[must_use]
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let aligned = match self {
            Self::Week1 => {
                let days = secs.div_euclid(SECS_PER_DAY);
                // 1970-01-01 was a Thursday.
                let since_monday = (days + 3).rem_euclid(7);
                (days - since_monday) * SECS_PER_DAY
            }
            _ => secs - secs.rem_euclid(self.duration_secs()),
        };
        DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
    }

    /// Exclusive end of the window opening at `slot`, saturating at the
    /// largest representable instant.
    #[must_use]
    pub fn window_end(self, slot: DateTime<Utc>) -> DateTime<Utc> {
        slot.checked_add_signed(self.duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the window opening at `slot` has fully elapsed at `now`.
    #[must_use]
    pub fn is_closed(self, slot: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.window_end(slot) <= now
    }

    /// Number of aligned slots between `start` and `end`, both inclusive.
    #[must_use]
    pub fn slot_count(self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        let first = self.floor(start);
        let last = self.floor(end);
        if last < first {
            return 0;
        }
        let span = (last - first).num_seconds() / self.duration_secs();
        usize::try_from(span + 1).unwrap_or(usize::MAX)
    }

    /// Every aligned slot start between `start` and `end`, both inclusive.
    #[must_use]
    pub fn slots(self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let last = self.floor(end);
        let mut cursor = self.floor(start);
        let mut slots = Vec::with_capacity(self.slot_count(start, end));
        while cursor <= last {
            slots.push(cursor);
            let Some(next) = cursor.checked_add_signed(self.duration()) else {
                break;
            };
            cursor = next;
        }
        slots
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a timeframe label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown timeframe: {0}")]
pub struct ParseTimeframeError(pub String);

impl FromStr for Timeframe {
    type Err = ParseTimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| ParseTimeframeError(s.to_string()))
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use test_case::test_case;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test_case(Timeframe::Minute1, at(2024, 3, 5, 10, 7, 42), at(2024, 3, 5, 10, 7, 0) ; "one minute")]
    #[test_case(Timeframe::Minute5, at(2024, 3, 5, 10, 7, 42), at(2024, 3, 5, 10, 5, 0) ; "five minutes")]
    #[test_case(Timeframe::Minute240, at(2024, 3, 5, 10, 7, 42), at(2024, 3, 5, 8, 0, 0) ; "four hours")]
    #[test_case(Timeframe::Day1, at(2024, 3, 5, 10, 7, 42), at(2024, 3, 5, 0, 0, 0) ; "one day")]
    #[test_case(Timeframe::Week1, at(2024, 3, 7, 10, 7, 42), at(2024, 3, 4, 0, 0, 0) ; "week starts monday")]
    #[test_case(Timeframe::Week1, at(2024, 3, 4, 0, 0, 0), at(2024, 3, 4, 0, 0, 0) ; "monday is aligned")]
    fn floor_aligns_to_window_start(tf: Timeframe, input: DateTime<Utc>, expected: DateTime<Utc>) {
        assert_eq!(tf.floor(input), expected);
    }

    #[test]
    fn slots_are_inclusive_and_aligned() {
        let slots = Timeframe::Minute1.slots(at(2024, 1, 1, 0, 0, 30), at(2024, 1, 1, 0, 9, 0));
        assert_eq!(slots.len(), 10);
        assert_eq!(slots[0], at(2024, 1, 1, 0, 0, 0));
        assert_eq!(slots[9], at(2024, 1, 1, 0, 9, 0));
        assert_eq!(
            Timeframe::Minute1.slot_count(at(2024, 1, 1, 0, 0, 30), at(2024, 1, 1, 0, 9, 0)),
            10
        );
    }

    #[test]
    fn last_representable_window_does_not_overflow() {
        let max = DateTime::<Utc>::MAX_UTC;
        let slots = Timeframe::Minute1.slots(max, max);
        assert_eq!(slots, vec![Timeframe::Minute1.floor(max)]);
        assert_eq!(Timeframe::Minute1.window_end(slots[0]), max);
    }

    #[test]
    fn reversed_range_has_no_slots() {
        let slots = Timeframe::Minute1.slots(at(2024, 1, 1, 1, 0, 0), at(2024, 1, 1, 0, 0, 0));
        assert!(slots.is_empty());
        assert_eq!(
            Timeframe::Minute1.slot_count(at(2024, 1, 1, 1, 0, 0), at(2024, 1, 1, 0, 0, 0)),
            0
        );
    }

    #[test]
    fn window_closes_at_end() {
        let slot = at(2024, 1, 1, 0, 5, 0);
        assert!(!Timeframe::Minute1.is_closed(slot, at(2024, 1, 1, 0, 5, 59)));
        assert!(Timeframe::Minute1.is_closed(slot, at(2024, 1, 1, 0, 6, 0)));
    }

    #[test]
    fn parse_round_trips_labels() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>(), Ok(tf));
        }
        assert!("2h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn serializes_as_label() {
        assert_eq!(serde_json::to_string(&Timeframe::Minute15).unwrap(), "\"15m\"");
    }
}
