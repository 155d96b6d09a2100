//! Cache Continuity Integration Tests
//!
//! Gap-fill over the public cache API against an in-memory and an on-disk
//! store: one record per expected slot, idempotent re-reads, failed slots
//! retried, and ranges that survive a restart.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rust_decimal::Decimal;

use market_data_gateway::application::ports::{BatchClient, CacheStore, UpstreamError};
use market_data_gateway::application::services::{CacheConfig, CacheTier, PersistQueue};
use market_data_gateway::domain::market_data::{Orderbook, Ticker, Trade};
use market_data_gateway::infrastructure::persistence::{InMemoryCacheStore, SqliteCacheStore};
use market_data_gateway::{Candle, CollectionStatus, HybridCache, ReadMode, Timeframe};

const SYMBOL: &str = "SYM-A";

fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
}

fn minute(n: i64) -> DateTime<Utc> {
    origin() + TimeDelta::minutes(n)
}

/// Upstream with trades in minutes 0, 1, 2, 4, 5, 7 and 9.
struct SevenOfTen {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl SevenOfTen {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchClient for SevenOfTen {
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        to: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<Candle>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Http {
                status: 502,
                message: "bad gateway".to_string(),
            });
        }
        let mut candles: Vec<Candle> = [0, 1, 2, 4, 5, 7, 9]
            .into_iter()
            .map(minute)
            .filter(|t| *t < to)
            .map(|open_time| {
                let price = Decimal::from(100 + (open_time - origin()).num_minutes());
                Candle {
                    symbol: symbol.to_string(),
                    timeframe,
                    open_time,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: Decimal::ONE,
                    quote_volume: price,
                }
            })
            .collect();
        candles.sort_by(|a, b| b.open_time.cmp(&a.open_time));
        candles.truncate(count);
        Ok(candles)
    }

    async fn tickers(&self, _symbols: &[String]) -> Result<Vec<Ticker>, UpstreamError> {
        Ok(Vec::new())
    }

    async fn trades(&self, _symbol: &str, _count: usize) -> Result<Vec<Trade>, UpstreamError> {
        Ok(Vec::new())
    }

    async fn orderbooks(&self, _symbols: &[String]) -> Result<Vec<Orderbook>, UpstreamError> {
        Ok(Vec::new())
    }
}

fn cache(store: Arc<dyn CacheStore>, batch: Arc<SevenOfTen>) -> HybridCache {
    HybridCache::new(CacheConfig::default(), store, batch, PersistQueue::disabled())
}

#[tokio::test]
async fn ten_slots_with_seven_trades() {
    let batch = Arc::new(SevenOfTen::new());
    let cache = cache(Arc::new(InMemoryCacheStore::new()), batch.clone());

    let continuous = cache
        .read_range(SYMBOL, Timeframe::Minute1, minute(0), minute(9), ReadMode::Continuous)
        .await;
    assert_eq!(continuous.records.len(), 10);
    assert_eq!(continuous.tier, CacheTier::Upstream);
    let stamps: Vec<_> = continuous.records.iter().map(|r| r.timestamp).collect();
    assert_eq!(stamps, (0..10).map(minute).collect::<Vec<_>>());
    let empty: Vec<_> = continuous
        .records
        .iter()
        .filter(|r| r.status == CollectionStatus::Empty)
        .map(|r| r.timestamp)
        .collect();
    assert_eq!(empty, vec![minute(3), minute(6), minute(8)]);
    assert!(continuous.records.iter().all(|r| r.is_final));

    let actual = cache
        .read_range(SYMBOL, Timeframe::Minute1, minute(0), minute(9), ReadMode::ActualOnly)
        .await;
    assert_eq!(actual.records.len(), 7);
    assert!(actual.records.iter().all(|r| r.fields.is_some()));
    assert_eq!(batch.calls(), 1);
}

#[tokio::test]
async fn second_read_is_identical_and_served_from_memory() {
    let batch = Arc::new(SevenOfTen::new());
    let cache = cache(Arc::new(InMemoryCacheStore::new()), batch.clone());

    let first = cache
        .ensure_range(SYMBOL, Timeframe::Minute1, minute(0), minute(9))
        .await;
    let second = cache
        .ensure_range(SYMBOL, Timeframe::Minute1, minute(0), minute(9))
        .await;

    assert_eq!(first.records, second.records);
    assert_eq!(second.tier, CacheTier::Memory);
    assert_eq!(batch.calls(), 1);
    assert_eq!(cache.stats().upstream_fetches, 1);
}

#[tokio::test]
async fn failed_slots_are_retried_on_next_access() {
    let batch = Arc::new(SevenOfTen::new());
    batch.failing.store(true, Ordering::SeqCst);
    let cache = cache(Arc::new(InMemoryCacheStore::new()), batch.clone());

    let failed = cache
        .ensure_range(SYMBOL, Timeframe::Minute1, minute(0), minute(9))
        .await;
    assert!(failed.upstream_failed);
    assert_eq!(failed.records.len(), 10);
    assert!(
        failed
            .records
            .iter()
            .all(|r| r.status == CollectionStatus::Failed)
    );
    assert_eq!(failed.records[0].attempts.upstream_code, Some(502));

    batch.failing.store(false, Ordering::SeqCst);
    let recovered = cache
        .ensure_range(SYMBOL, Timeframe::Minute1, minute(0), minute(9))
        .await;
    assert!(!recovered.upstream_failed);
    assert_eq!(recovered.records.iter().filter(|r| r.is_actual()).count(), 7);
    assert!(
        recovered
            .records
            .iter()
            .all(|r| r.status != CollectionStatus::Failed)
    );
    assert_eq!(batch.calls(), 2);
}

#[tokio::test]
async fn sqlite_backed_range_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("continuity.db").display());

    let store = Arc::new(SqliteCacheStore::connect(&url).await.unwrap());
    let warm = cache(store.clone(), Arc::new(SevenOfTen::new()));
    let original = warm
        .ensure_range(SYMBOL, Timeframe::Minute1, minute(0), minute(9))
        .await;
    store.close().await;
    drop(warm);

    let reopened = Arc::new(SqliteCacheStore::connect(&url).await.unwrap());
    let offline = Arc::new(SevenOfTen::new());
    offline.failing.store(true, Ordering::SeqCst);
    let cold = cache(reopened, offline.clone());

    let restored = cold
        .ensure_range(SYMBOL, Timeframe::Minute1, minute(0), minute(9))
        .await;
    assert_eq!(restored.tier, CacheTier::Store);
    assert_eq!(offline.calls(), 0);
    assert_eq!(
        restored.records.iter().map(|r| (r.timestamp, r.status)).collect::<Vec<_>>(),
        original.records.iter().map(|r| (r.timestamp, r.status)).collect::<Vec<_>>()
    );
}
