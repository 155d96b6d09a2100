//! Hybrid Cache
//!
//! Two-tier candle cache with continuity tracking, plus last-value storage
//! for streamed tickers, trades and order books.
//!
//! # Tiers
//!
//! ```text
//! memory ring (per series, bounded) ──miss──► persistent store ──miss──► batch API
//!        ▲                                          ▲                        │
//!        └──────────────── whole page ──────────────┴────────────────────────┘
//! ```
//!
//! # Continuity
//!
//! Once a range has been ensured, every slot in it has exactly one record:
//! `Collected` when trades occurred, `Empty` when the upstream confirmed none,
//! `Pending` while the window is open, `Failed` when the fetch failed. Failed
//! slots are retried on the next access.
//!
//! # Concurrency
//!
//! Gap-fill for one series is serialized by a per-key async lock. Stream
//! ingestion updates memory synchronously and hands persistent writes to a
//! background writer through [`PersistQueue`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::application::ports::{BatchClient, CacheStore};
use crate::domain::cache_record::{AttemptMeta, CacheRecord, CollectionStatus, SeriesKey};
use crate::domain::market_data::{Candle, DataType, MarketPayload, Message, StreamPhase};
use crate::domain::request::{MarketRecord, ReadMode};
use crate::domain::timeframe::Timeframe;
use crate::infrastructure::metrics;

type Series = Arc<RwLock<BTreeMap<DateTime<Utc>, CacheRecord>>>;

// =============================================================================
// Configuration and results
// =============================================================================

/// Cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Memory ring capacity per series.
    pub memory_size: usize,
    /// Candles requested per upstream call.
    pub page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_size: 200,
            page_size: 200,
        }
    }
}

/// Tier that completed a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Memory ring.
    Memory,
    /// Persistent store.
    Store,
    /// At least one batch API call was made.
    Upstream,
}

impl CacheTier {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Store => "store",
            Self::Upstream => "upstream",
        }
    }
}

/// Records for a range, one per expected slot unless filtered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRead {
    /// Records, oldest first.
    pub records: Vec<CacheRecord>,
    /// Tier that completed the read.
    pub tier: CacheTier,
    /// Whether an upstream call failed during the read.
    pub upstream_failed: bool,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Series held in memory.
    pub series: usize,
    /// Records held in memory.
    pub memory_records: usize,
    /// Last values held.
    pub latest_values: usize,
    /// Reads completed from memory.
    pub memory_hits: u64,
    /// Reads completed from the store.
    pub store_hits: u64,
    /// Batch API calls made.
    pub upstream_fetches: u64,
    /// Batch API calls that failed.
    pub upstream_failures: u64,
}

// =============================================================================
// Persist queue
// =============================================================================

/// Sending side of the background persistence queue.
#[derive(Debug, Clone)]
pub struct PersistQueue {
    tx: Option<mpsc::UnboundedSender<Vec<CacheRecord>>>,
}

impl PersistQueue {
    /// Queue plus the receiver a writer task drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<CacheRecord>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Queue that drops everything (no persistent writer).
    #[must_use]
    pub const fn disabled() -> Self {
        Self { tx: None }
    }

    fn push(&self, records: Vec<CacheRecord>) {
        if records.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx
            && tx.send(records).is_err()
        {
            tracing::warn!("Persist writer stopped; dropping cache writes");
        }
    }
}

// =============================================================================
// Hybrid Cache
// =============================================================================

/// Memory + persistent cache with upstream gap-fill.
pub struct HybridCache {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    batch: Arc<dyn BatchClient>,
    persist: PersistQueue,
    memory: RwLock<HashMap<SeriesKey, Series>>,
    fill_locks: Mutex<HashMap<SeriesKey, Arc<tokio::sync::Mutex<()>>>>,
    latest: RwLock<HashMap<(DataType, String), MarketRecord>>,
    memory_hits: AtomicU64,
    store_hits: AtomicU64,
    upstream_fetches: AtomicU64,
    upstream_failures: AtomicU64,
}

impl std::fmt::Debug for HybridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl HybridCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        batch: Arc<dyn BatchClient>,
        persist: PersistQueue,
    ) -> Self {
        Self {
            config,
            store,
            batch,
            persist,
            memory: RwLock::new(HashMap::new()),
            fill_locks: Mutex::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            memory_hits: AtomicU64::new(0),
            store_hits: AtomicU64::new(0),
            upstream_fetches: AtomicU64::new(0),
            upstream_failures: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The last `count` slots up to now, in continuous mode.
    pub async fn get(&self, symbol: &str, timeframe: Timeframe, count: usize) -> RangeRead {
        self.get_until(symbol, timeframe, count, Utc::now()).await
    }

    /// The last `count` slots ending with the slot containing `end`.
    pub async fn get_until(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
        end: DateTime<Utc>,
    ) -> RangeRead {
        if count == 0 {
            return RangeRead::empty();
        }
        let last = timeframe.floor(end);
        let span = i64::try_from(count - 1)
            .unwrap_or(i64::MAX)
            .saturating_mul(timeframe.duration_secs());
        let first = TimeDelta::try_seconds(span)
            .and_then(|d| last.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.ensure_range(symbol, timeframe, first, last).await
    }

    /// Range read filtered by `mode`.
    pub async fn read_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mode: ReadMode,
    ) -> RangeRead {
        let mut read = self.ensure_range(symbol, timeframe, start, end).await;
        read.records = filter_mode(read.records, mode);
        read
    }

    /// Gap-fill `[start, end]` and return one record per slot.
    pub async fn ensure_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RangeRead {
        let key = SeriesKey::new(symbol, timeframe);
        self.ensure_range_at(&key, start, end, Utc::now()).await
    }

    /// [`Self::ensure_range`] against an explicit clock.
    pub async fn ensure_range_at(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RangeRead {
        let tf = key.timeframe;
        let slots = tf.slots(start, end);
        let (Some(&first), Some(&last)) = (slots.first(), slots.last()) else {
            return RangeRead::empty();
        };

        let mut working = self.memory_range(key, first, last);
        if !any_needs_fetch(tf, &slots, &working, now) {
            return self.finish(key, &slots, &working, now, CacheTier::Memory, false);
        }

        let lock = self.fill_lock(key);
        let _guard = lock.lock().await;

        // Another caller may have filled the series while we waited.
        working = self.memory_range(key, first, last);
        if !any_needs_fetch(tf, &slots, &working, now) {
            return self.finish(key, &slots, &working, now, CacheTier::Memory, false);
        }

        match self.store.load_range(key, first, last).await {
            Ok(rows) => {
                for row in rows {
                    let ts = row.timestamp;
                    if let Some(merged) = CacheRecord::merge(working.get(&ts), row) {
                        working.insert(ts, merged);
                    }
                }
                self.remember(key, working.values().cloned().collect());
            }
            Err(e) => {
                tracing::warn!(series = %key, error = %e, "Cache store read failed");
            }
        }
        if !any_needs_fetch(tf, &slots, &working, now) {
            return self.finish(key, &slots, &working, now, CacheTier::Store, false);
        }

        let (changed, failed) = self.fill_gaps(key, &slots, &mut working, now).await;
        if !changed.is_empty() {
            self.remember(key, changed.clone());
            if let Err(e) = self.store.upsert(&changed).await {
                tracing::warn!(series = %key, error = %e, "Cache store write failed");
            }
        }
        self.finish(key, &slots, &working, now, CacheTier::Upstream, failed)
    }

    /// Last value for a symbol, if one has been seen.
    #[must_use]
    pub fn latest(&self, data_type: DataType, symbol: &str) -> Option<MarketRecord> {
        if let DataType::Candle(tf) = data_type {
            let series = self
                .memory
                .read()
                .get(&SeriesKey::new(symbol, tf))
                .cloned()?;
            let newest = series.read().values().next_back().cloned();
            return newest.map(MarketRecord::Candle);
        }
        self.latest
            .read()
            .get(&(data_type, symbol.to_string()))
            .cloned()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Ingest a streamed message.
    pub fn ingest(&self, message: &Message) {
        match &message.payload {
            MarketPayload::Candle(candle) => {
                self.ingest_candle(candle, message.phase == StreamPhase::Snapshot);
            }
            other => self.record_latest(MarketRecord::from(other.clone())),
        }
    }

    /// Store a last value. Older values never replace newer ones.
    pub fn record_latest(&self, record: MarketRecord) {
        if let MarketRecord::Candle(candle) = record {
            let key = candle.key();
            let changed = self.remember(&key, vec![candle]);
            self.persist.push(changed);
            return;
        }

        let slot = (record.data_type(), record.symbol().to_string());
        let mut latest = self.latest.write();
        let stale = latest
            .get(&slot)
            .is_some_and(|current| current.timestamp() > record.timestamp());
        if !stale {
            latest.insert(slot, record);
        }
    }

    fn ingest_candle(&self, candle: &Candle, is_final: bool) {
        let record = CacheRecord::collected(candle, is_final);
        let key = record.key();
        let changed = self.remember(&key, vec![record]);
        self.persist.push(changed);
    }

    /// Cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.read();
        CacheStats {
            series: memory.len(),
            memory_records: memory.values().map(|s| s.read().len()).sum(),
            latest_values: self.latest.read().len(),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
            upstream_fetches: self.upstream_fetches.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn series(&self, key: &SeriesKey) -> Series {
        if let Some(series) = self.memory.read().get(key) {
            return Arc::clone(series);
        }
        Arc::clone(self.memory.write().entry(key.clone()).or_default())
    }

    fn fill_lock(&self, key: &SeriesKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.fill_locks.lock().entry(key.clone()).or_default())
    }

    fn memory_range(
        &self,
        key: &SeriesKey,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    ) -> BTreeMap<DateTime<Utc>, CacheRecord> {
        let Some(series) = self.memory.read().get(key).cloned() else {
            return BTreeMap::new();
        };
        let ring = series.read();
        ring.range(first..=last)
            .map(|(ts, r)| (*ts, r.clone()))
            .collect()
    }

    /// Merge records into the memory ring; returns the ones that changed.
    fn remember(&self, key: &SeriesKey, records: Vec<CacheRecord>) -> Vec<CacheRecord> {
        let series = self.series(key);
        let mut ring = series.write();
        let mut changed = Vec::new();
        for record in records {
            let ts = record.timestamp;
            if let Some(merged) = CacheRecord::merge(ring.get(&ts), record) {
                ring.insert(ts, merged.clone());
                changed.push(merged);
            }
        }
        while ring.len() > self.config.memory_size.max(1) {
            ring.pop_first();
        }
        changed
    }

    async fn fill_gaps(
        &self,
        key: &SeriesKey,
        slots: &[DateTime<Utc>],
        working: &mut BTreeMap<DateTime<Utc>, CacheRecord>,
        now: DateTime<Utc>,
    ) -> (Vec<CacheRecord>, bool) {
        let tf = key.timeframe;
        let page = self.config.page_size.max(1);
        let mut changed = Vec::new();
        let mut upper = slots.len();

        while let Some(idx) = slots[..upper]
            .iter()
            .rposition(|s| needs_fetch(tf, *s, working.get(s), now))
        {
            let newest = slots[idx];
            let to = tf.window_end(newest);
            self.upstream_fetches.fetch_add(1, Ordering::Relaxed);

            let candles = match self.batch.candles(&key.symbol, tf, to, page).await {
                Ok(candles) => {
                    metrics::record_upstream_fetch("candles", "ok");
                    candles
                }
                Err(e) => {
                    self.upstream_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::record_upstream_fetch("candles", "error");
                    tracing::warn!(
                        series = %key,
                        to = %to,
                        error = %e,
                        "Gap-fill fetch failed; marking slots failed"
                    );
                    let failed = mark_failed(key, &slots[..=idx], working, now, e.code());
                    metrics::record_gap_slots(CollectionStatus::Failed.as_str(), failed.len());
                    changed.extend(failed);
                    return (changed, true);
                }
            };

            let full = candles.len() >= page;
            let by_slot: BTreeMap<DateTime<Utc>, &Candle> = candles
                .iter()
                .filter(|c| c.symbol == key.symbol && c.timeframe == tf && c.open_time < to)
                .map(|c| (tf.floor(c.open_time), c))
                .collect();

            // A short page means nothing older exists upstream.
            let covered_from = if full {
                by_slot.keys().next().copied().unwrap_or(newest).max(slots[0])
            } else {
                slots[0]
            };

            let mut empties = 0;
            for slot in tf.slots(covered_from, newest) {
                let existing = working.get(&slot);
                let attempts = existing
                    .map(|r| r.attempts.clone())
                    .unwrap_or_default()
                    .next(now, None);
                let incoming = match (by_slot.get(&slot), existing) {
                    (Some(candle), _) => CacheRecord::collected(candle, tf.is_closed(slot, now)),
                    // No page entry, but the stream saw trades: keep them, frozen.
                    (None, Some(r)) if r.is_provisional() && tf.is_closed(slot, now) => {
                        let mut frozen = r.clone();
                        frozen.is_final = true;
                        frozen
                    }
                    (None, _) if tf.is_closed(slot, now) => {
                        empties += 1;
                        CacheRecord::empty(key, slot)
                    }
                    (None, _) => CacheRecord::pending(key, slot),
                }
                .with_attempts(attempts);

                if let Some(merged) = CacheRecord::merge(existing, incoming) {
                    working.insert(slot, merged.clone());
                    changed.push(merged);
                }
            }

            tracing::debug!(
                series = %key,
                to = %to,
                returned = candles.len(),
                empties,
                covered_from = %covered_from,
                "Gap-fill page applied"
            );
            metrics::record_gap_slots(CollectionStatus::Empty.as_str(), empties);
            metrics::record_gap_slots(CollectionStatus::Collected.as_str(), by_slot.len());

            if !full {
                break;
            }
            upper = slots.partition_point(|s| *s < covered_from);
        }

        (changed, false)
    }

    fn finish(
        &self,
        key: &SeriesKey,
        slots: &[DateTime<Utc>],
        working: &BTreeMap<DateTime<Utc>, CacheRecord>,
        now: DateTime<Utc>,
        tier: CacheTier,
        upstream_failed: bool,
    ) -> RangeRead {
        match tier {
            CacheTier::Memory => self.memory_hits.fetch_add(1, Ordering::Relaxed),
            CacheTier::Store => self.store_hits.fetch_add(1, Ordering::Relaxed),
            CacheTier::Upstream => 0,
        };
        metrics::record_cache_read(tier.as_str());

        let records = slots
            .iter()
            .map(|slot| {
                working.get(slot).cloned().unwrap_or_else(|| {
                    if key.timeframe.is_closed(*slot, now) {
                        CacheRecord::failed(key, *slot, AttemptMeta::default())
                    } else {
                        CacheRecord::pending(key, *slot)
                    }
                })
            })
            .collect();

        RangeRead {
            records,
            tier,
            upstream_failed,
        }
    }
}

impl RangeRead {
    const fn empty() -> Self {
        Self {
            records: Vec::new(),
            tier: CacheTier::Memory,
            upstream_failed: false,
        }
    }
}

/// Whether a slot must be fetched from upstream.
///
/// Open windows are fetched only when nothing is known about them. A closed
/// window still holding a provisional streamed candle is refetched so the
/// batch values freeze it.
fn needs_fetch(
    tf: Timeframe,
    slot: DateTime<Utc>,
    record: Option<&CacheRecord>,
    now: DateTime<Utc>,
) -> bool {
    match record {
        None => true,
        Some(r) => (!r.status.is_settled() || r.is_provisional()) && tf.is_closed(slot, now),
    }
}

fn any_needs_fetch(
    tf: Timeframe,
    slots: &[DateTime<Utc>],
    working: &BTreeMap<DateTime<Utc>, CacheRecord>,
    now: DateTime<Utc>,
) -> bool {
    slots
        .iter()
        .any(|s| needs_fetch(tf, *s, working.get(s), now))
}

fn mark_failed(
    key: &SeriesKey,
    slots: &[DateTime<Utc>],
    working: &mut BTreeMap<DateTime<Utc>, CacheRecord>,
    now: DateTime<Utc>,
    code: Option<u16>,
) -> Vec<CacheRecord> {
    let mut changed = Vec::new();
    for slot in slots {
        let existing = working.get(slot);
        if !needs_fetch(key.timeframe, *slot, existing, now) {
            continue;
        }
        let incoming = if key.timeframe.is_closed(*slot, now) {
            let attempts = existing
                .map(|r| r.attempts.clone())
                .unwrap_or_default()
                .next(now, code);
            CacheRecord::failed(key, *slot, attempts)
        } else {
            CacheRecord::pending(key, *slot)
        };
        if let Some(merged) = CacheRecord::merge(existing, incoming) {
            working.insert(*slot, merged.clone());
            changed.push(merged);
        }
    }
    changed
}

/// Apply a read mode to a continuous series.
#[must_use]
pub fn filter_mode(records: Vec<CacheRecord>, mode: ReadMode) -> Vec<CacheRecord> {
    match mode {
        ReadMode::Continuous => records,
        ReadMode::ActualOnly => records.into_iter().filter(CacheRecord::is_actual).collect(),
    }
}
