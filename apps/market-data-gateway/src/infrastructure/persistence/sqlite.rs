//! SQLite cache store.
//!
//! One row per (symbol, timeframe, slot). The upsert carries the
//! non-regression rule in its `WHERE` clause, so replaying a gap-fill after a
//! restart never downgrades a completed slot.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::application::ports::{CacheStore, StoreError};
use crate::domain::cache_record::{
    AttemptMeta, CacheRecord, CandleFields, CollectionStatus, SeriesKey,
};

const CREATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS cache_records (
    symbol          TEXT    NOT NULL,
    timeframe       TEXT    NOT NULL,
    ts              INTEGER NOT NULL,
    status          TEXT    NOT NULL,
    is_final        INTEGER NOT NULL,
    open            TEXT,
    high            TEXT,
    low             TEXT,
    close           TEXT,
    volume          TEXT,
    quote_volume    TEXT,
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER,
    upstream_code   INTEGER,
    PRIMARY KEY (symbol, timeframe, ts)
)";

const UPSERT: &str = r"
INSERT INTO cache_records (
    symbol, timeframe, ts, status, is_final,
    open, high, low, close, volume, quote_volume,
    attempt_count, last_attempt_at, upstream_code
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (symbol, timeframe, ts) DO UPDATE SET
    status          = excluded.status,
    is_final        = excluded.is_final,
    open            = excluded.open,
    high            = excluded.high,
    low             = excluded.low,
    close           = excluded.close,
    volume          = excluded.volume,
    quote_volume    = excluded.quote_volume,
    attempt_count   = MAX(cache_records.attempt_count, excluded.attempt_count),
    last_attempt_at = COALESCE(excluded.last_attempt_at, cache_records.last_attempt_at),
    upstream_code   = excluded.upstream_code
WHERE cache_records.status IN ('pending', 'failed')
   OR (cache_records.status = 'collected'
       AND cache_records.is_final = 0
       AND excluded.status = 'collected')";

const LOAD_RANGE: &str = r"
SELECT symbol, timeframe, ts, status, is_final,
       open, high, low, close, volume, quote_volume,
       attempt_count, last_attempt_at, upstream_code
FROM cache_records
WHERE symbol = ? AND timeframe = ? AND ts BETWEEN ? AND ?
ORDER BY ts";

/// Cache store on a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    /// Open (creating if needed) the database at `url` and migrate it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the URL is invalid or the database
    /// cannot be opened.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(backend)?
            .create_if_missing(true);
        // Each connection to an in-memory database is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(url, "SQLite cache store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn load_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CacheRecord>, StoreError> {
        let rows = sqlx::query(LOAD_RANGE)
            .bind(&key.symbol)
            .bind(key.timeframe.as_str())
            .bind(start.timestamp())
            .bind(end.timestamp())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn upsert(&self, records: &[CacheRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut written = 0;

        for record in records {
            let fields = record.fields.as_ref();
            let text = |f: fn(&CandleFields) -> Decimal| fields.map(|c| f(c).to_string());
            let result = sqlx::query(UPSERT)
                .bind(&record.symbol)
                .bind(record.timeframe.as_str())
                .bind(record.timestamp.timestamp())
                .bind(record.status.as_str())
                .bind(record.is_final)
                .bind(text(|c| c.open))
                .bind(text(|c| c.high))
                .bind(text(|c| c.low))
                .bind(text(|c| c.close))
                .bind(text(|c| c.volume))
                .bind(text(|c| c.quote_volume))
                .bind(i64::from(record.attempts.attempt_count))
                .bind(record.attempts.last_attempt_at.map(|t| t.timestamp()))
                .bind(record.attempts.upstream_code.map(i64::from))
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            written += usize::try_from(result.rows_affected()).unwrap_or(0);
        }

        tx.commit().await.map_err(backend)?;
        Ok(written)
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn record_from_row(row: &SqliteRow) -> Result<CacheRecord, StoreError> {
    let get_text =
        |column: &str| -> Result<String, StoreError> { row.try_get(column).map_err(backend) };
    let get_decimal = |column: &str| -> Result<Option<Decimal>, StoreError> {
        let raw: Option<String> = row.try_get(column).map_err(backend)?;
        raw.map(|s| {
            Decimal::from_str(&s).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
        })
        .transpose()
    };
    let timestamp = |secs: i64| -> Result<DateTime<Utc>, StoreError> {
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| StoreError::Corrupt(format!("timestamp {secs}")))
    };

    let timeframe = get_text("timeframe")?
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
    let status: CollectionStatus = get_text("status")?.parse().map_err(StoreError::Corrupt)?;

    let fields = match (
        get_decimal("open")?,
        get_decimal("high")?,
        get_decimal("low")?,
        get_decimal("close")?,
        get_decimal("volume")?,
        get_decimal("quote_volume")?,
    ) {
        (Some(open), Some(high), Some(low), Some(close), Some(volume), Some(quote_volume)) => {
            Some(CandleFields {
                open,
                high,
                low,
                close,
                volume,
                quote_volume,
            })
        }
        _ => None,
    };

    let attempt_count: i64 = row.try_get("attempt_count").map_err(backend)?;
    let last_attempt_at: Option<i64> = row.try_get("last_attempt_at").map_err(backend)?;
    let upstream_code: Option<i64> = row.try_get("upstream_code").map_err(backend)?;

    Ok(CacheRecord {
        symbol: get_text("symbol")?,
        timeframe,
        timestamp: timestamp(row.try_get("ts").map_err(backend)?)?,
        fields,
        status,
        is_final: row.try_get("is_final").map_err(backend)?,
        attempts: AttemptMeta {
            attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
            last_attempt_at: last_attempt_at.map(timestamp).transpose()?,
            upstream_code: upstream_code.and_then(|c| u16::try_from(c).ok()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market_data::Candle;
    use crate::domain::timeframe::Timeframe;
    use chrono::TimeZone;

    fn key() -> SeriesKey {
        SeriesKey::new("SYM-A", Timeframe::Minute1)
    }

    fn at(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, m, 0).unwrap()
    }

    fn candle(m: u32, close: i64) -> Candle {
        Candle {
            symbol: "SYM-A".to_string(),
            timeframe: Timeframe::Minute1,
            open_time: at(m),
            open: Decimal::ONE,
            high: Decimal::from(close),
            low: Decimal::ONE,
            close: Decimal::from(close),
            volume: Decimal::new(15, 1),
            quote_volume: Decimal::TEN,
        }
    }

    async fn memory_store() -> SqliteCacheStore {
        SqliteCacheStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn records_round_trip() {
        let store = memory_store().await;
        let attempts = AttemptMeta::default().next(at(30), Some(429));
        let records = vec![
            CacheRecord::collected(&candle(0, 7), true),
            CacheRecord::empty(&key(), at(1)),
            CacheRecord::failed(&key(), at(2), attempts),
        ];
        assert_eq!(store.upsert(&records).await.unwrap(), 3);

        let loaded = store.load_range(&key(), at(0), at(2)).await.unwrap();
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn upsert_does_not_regress_completed_slots() {
        let store = memory_store().await;
        store
            .upsert(&[CacheRecord::collected(&candle(0, 7), true), CacheRecord::empty(&key(), at(1))])
            .await
            .unwrap();

        let attempts = AttemptMeta::default().next(at(30), Some(500));
        let written = store
            .upsert(&[
                CacheRecord::failed(&key(), at(0), attempts.clone()),
                CacheRecord::collected(&candle(1, 9), true),
            ])
            .await
            .unwrap();
        assert_eq!(written, 0);

        let loaded = store.load_range(&key(), at(0), at(1)).await.unwrap();
        assert_eq!(loaded[0].status, CollectionStatus::Collected);
        assert_eq!(loaded[1].status, CollectionStatus::Empty);
    }

    #[tokio::test]
    async fn failed_slot_is_resolved_and_keeps_attempt_count() {
        let store = memory_store().await;
        let attempts = AttemptMeta::default().next(at(30), Some(500)).next(at(31), Some(500));
        store.upsert(&[CacheRecord::failed(&key(), at(0), attempts)]).await.unwrap();
        store.upsert(&[CacheRecord::empty(&key(), at(0))]).await.unwrap();

        let loaded = store.load_range(&key(), at(0), at(0)).await.unwrap();
        assert_eq!(loaded[0].status, CollectionStatus::Empty);
        assert_eq!(loaded[0].attempts.attempt_count, 2);
        assert_eq!(loaded[0].attempts.last_attempt_at, Some(at(31)));
    }

    #[tokio::test]
    async fn in_progress_candle_takes_newer_values() {
        let store = memory_store().await;
        store.upsert(&[CacheRecord::collected(&candle(0, 7), false)]).await.unwrap();
        store.upsert(&[CacheRecord::collected(&candle(0, 8), true)]).await.unwrap();

        let loaded = store.load_range(&key(), at(0), at(0)).await.unwrap();
        assert!(loaded[0].is_final);
        assert_eq!(loaded[0].fields.as_ref().unwrap().close, Decimal::from(8));
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("cache.db").display());

        let store = SqliteCacheStore::connect(&url).await.unwrap();
        store.upsert(&[CacheRecord::empty(&key(), at(3))]).await.unwrap();
        store.close().await;

        let reopened = SqliteCacheStore::connect(&url).await.unwrap();
        let loaded = reopened.load_range(&key(), at(0), at(5)).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, CollectionStatus::Empty);
    }
}
