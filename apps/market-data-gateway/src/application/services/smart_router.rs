//! Smart Router
//!
//! Per-request choice between the live stream and the batch/history path.
//!
//! # Rules (evaluated in order)
//!
//! 1. More than one record, an as-of in the past, or an explicit range:
//!    batch path. A stream only ever holds the latest state.
//! 2. Single latest record: stream path when the connection is up and has
//!    delivered within the recency window, else batch path. Symbols with no
//!    last value yet are subscribed and served from batch this time.
//! 3. Everything returned passes through [`HybridCache`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::hybrid_cache::{CacheTier, HybridCache, RangeRead, filter_mode};
use crate::application::ports::{BatchClient, DataService, ServiceError, StreamPath};
use crate::domain::connection::ConnectionState;
use crate::domain::market_data::DataType;
use crate::domain::request::{DataQuery, DataResponse, DataSource, MarketRecord, ReadMode};
use crate::domain::timeframe::Timeframe;
use crate::error::DataGapError;
use crate::infrastructure::metrics;

/// Routing thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Maximum age of the last stream delivery for the stream path.
    pub stream_recency: Duration,
    /// Largest range, in slots, a single query may ask for.
    pub max_range_slots: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            stream_recency: Duration::from_secs(10),
            max_range_slots: 10_000,
        }
    }
}

/// Primary data service: stream + cache + batch.
pub struct SmartRouter {
    config: RoutingConfig,
    stream: Arc<dyn StreamPath>,
    cache: Arc<HybridCache>,
    batch: Arc<dyn BatchClient>,
}

impl std::fmt::Debug for SmartRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartRouter")
            .field("config", &self.config)
            .field("stream_state", &self.stream.state())
            .finish_non_exhaustive()
    }
}

impl SmartRouter {
    /// Create a router.
    #[must_use]
    pub fn new(
        config: RoutingConfig,
        stream: Arc<dyn StreamPath>,
        cache: Arc<HybridCache>,
        batch: Arc<dyn BatchClient>,
    ) -> Self {
        Self {
            config,
            stream,
            cache,
            batch,
        }
    }

    /// Whether the stream path may serve latest-value reads right now.
    #[must_use]
    pub fn stream_is_fresh(&self) -> bool {
        self.stream.state() == ConnectionState::Connected
            && self
                .stream
                .last_delivery()
                .is_some_and(|at| at.elapsed() <= self.config.stream_recency)
    }

    fn validate(&self, query: &DataQuery) -> Result<(), ServiceError> {
        if query.symbols.is_empty() {
            return Err(ServiceError::InvalidQuery("no symbols".to_string()));
        }
        if query.count == 0 {
            return Err(ServiceError::InvalidQuery("count must be positive".to_string()));
        }
        if let Some(range) = query.range {
            if range.start > range.end {
                return Err(ServiceError::InvalidQuery(format!(
                    "range start {} is after end {}",
                    range.start, range.end
                )));
            }
            if let Some(tf) = query.data_type.timeframe() {
                let slots = tf.slot_count(range.start, range.end);
                if slots > self.config.max_range_slots {
                    return Err(ServiceError::InvalidQuery(format!(
                        "range spans {slots} slots, limit is {}",
                        self.config.max_range_slots
                    )));
                }
            }
        }
        if query.data_type.is_windowed() && query.count > self.config.max_range_slots {
            return Err(ServiceError::InvalidQuery(format!(
                "count {} exceeds limit {}",
                query.count, self.config.max_range_slots
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Stream path
    // =========================================================================

    async fn serve_stream(
        &self,
        query: &DataQuery,
        now: DateTime<Utc>,
    ) -> Result<DataResponse, ServiceError> {
        let mut records = Vec::with_capacity(query.symbols.len());
        let mut missing = Vec::new();
        for symbol in &query.symbols {
            match self.fresh_latest(query.data_type, symbol, now) {
                Some(record) => records.push(record),
                None => missing.push(symbol.clone()),
            }
        }

        if missing.is_empty() {
            return Ok(DataResponse::ok(records, DataSource::Stream));
        }

        tracing::debug!(
            data_type = %query.data_type,
            missing = missing.len(),
            "No last value on stream; filling from batch"
        );
        let (filled, _) = self
            .batch_latest(query.data_type, &missing, query.read_mode, now)
            .await?;
        records.extend(filled);
        Ok(DataResponse::ok(records, DataSource::Batch))
    }

    /// Last value, ignoring candles from windows that are long gone.
    fn fresh_latest(
        &self,
        data_type: DataType,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Option<MarketRecord> {
        let record = self.cache.latest(data_type, symbol)?;
        if let MarketRecord::Candle(candle) = &record {
            let oldest_current = candle.timeframe.floor(now) - candle.timeframe.duration();
            if candle.timestamp < oldest_current {
                return None;
            }
        }
        Some(record)
    }

    // =========================================================================
    // Batch path
    // =========================================================================

    async fn serve_batch(
        &self,
        query: &DataQuery,
        now: DateTime<Utc>,
    ) -> Result<DataResponse, ServiceError> {
        if let DataType::Candle(tf) = query.data_type {
            return Ok(self.serve_candles(query, tf, now).await);
        }

        if query.range.is_some() {
            return Err(data_gap(query, "ranges are only available for candles"));
        }
        let historical = query.as_of.is_some_and(|t| t < now);

        match query.data_type {
            DataType::Ticker | DataType::Orderbook if historical || query.count > 1 => {
                Err(data_gap(query, "only the current snapshot is available"))
            }
            DataType::Trade if historical => {
                Err(data_gap(query, "trade history is only available up to now"))
            }
            DataType::Trade => {
                let mut records = Vec::new();
                for symbol in &query.symbols {
                    records.extend(self.recent_trades(symbol, query.count).await?);
                }
                Ok(DataResponse::ok(records, DataSource::Batch))
            }
            data_type => {
                let (records, source) = self
                    .batch_latest(data_type, &query.symbols, query.read_mode, now)
                    .await?;
                Ok(DataResponse::ok(records, source))
            }
        }
    }

    async fn serve_candles(
        &self,
        query: &DataQuery,
        tf: Timeframe,
        now: DateTime<Utc>,
    ) -> DataResponse {
        let mut records = Vec::new();
        let mut touched_upstream = false;

        for symbol in &query.symbols {
            let read = match query.range {
                Some(range) => {
                    self.cache
                        .read_range(symbol, tf, range.start, range.end, query.read_mode)
                        .await
                }
                None => {
                    let end = query.as_of.map_or(now, |t| t.min(now));
                    let mut read = self.cache.get_until(symbol, tf, query.count, end).await;
                    read.records = filter_mode(read.records, query.read_mode);
                    read
                }
            };
            if read.upstream_failed {
                tracing::warn!(
                    symbol = %symbol,
                    timeframe = %tf,
                    "Candle read has failed slots; they are retried on next access"
                );
            }
            touched_upstream |= read.tier == CacheTier::Upstream;
            records.extend(read.records.into_iter().map(MarketRecord::Candle));
        }

        let source = if touched_upstream {
            DataSource::Batch
        } else {
            DataSource::Cache
        };
        DataResponse::ok(records, source)
    }

    /// Current value per symbol from the batch API, recorded in the cache.
    async fn batch_latest(
        &self,
        data_type: DataType,
        symbols: &[String],
        mode: ReadMode,
        now: DateTime<Utc>,
    ) -> Result<(Vec<MarketRecord>, DataSource), ServiceError> {
        let records: Vec<MarketRecord> = match data_type {
            DataType::Ticker => self
                .batch
                .tickers(symbols)
                .await?
                .into_iter()
                .map(MarketRecord::Ticker)
                .collect(),
            DataType::Orderbook => self
                .batch
                .orderbooks(symbols)
                .await?
                .into_iter()
                .map(MarketRecord::Orderbook)
                .collect(),
            DataType::Trade => {
                let mut records = Vec::new();
                for symbol in symbols {
                    records.extend(self.recent_trades(symbol, 1).await?);
                }
                return Ok((records, DataSource::Batch));
            }
            DataType::Candle(tf) => {
                let mut records = Vec::new();
                let mut touched_upstream = false;
                for symbol in symbols {
                    let RangeRead { records: read, tier, .. } =
                        self.cache.get_until(symbol, tf, 1, now).await;
                    touched_upstream |= tier == CacheTier::Upstream;
                    records.extend(filter_mode(read, mode).into_iter().map(MarketRecord::Candle));
                }
                let source = if touched_upstream {
                    DataSource::Batch
                } else {
                    DataSource::Cache
                };
                return Ok((records, source));
            }
        };

        for record in &records {
            self.cache.record_latest(record.clone());
        }
        Ok((records, DataSource::Batch))
    }

    /// Most recent trades, oldest first. The newest becomes the last value.
    async fn recent_trades(
        &self,
        symbol: &str,
        count: usize,
    ) -> Result<Vec<MarketRecord>, ServiceError> {
        let mut trades = self.batch.trades(symbol, count).await?;
        trades.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequential_id.cmp(&b.sequential_id))
        });
        if let Some(newest) = trades.last() {
            self.cache.record_latest(MarketRecord::Trade(newest.clone()));
        }
        Ok(trades.into_iter().map(MarketRecord::Trade).collect())
    }
}

fn data_gap(query: &DataQuery, reason: &str) -> ServiceError {
    let symbol = query.symbols.first().cloned().unwrap_or_default();
    DataGapError::new(symbol, query.data_type, reason).into()
}

#[async_trait]
impl DataService for SmartRouter {
    fn name(&self) -> &'static str {
        "smart-router"
    }

    async fn request(&self, query: &DataQuery) -> Result<DataResponse, ServiceError> {
        self.validate(query)?;
        let now = Utc::now();

        if query.requires_batch(now) {
            metrics::record_route(DataSource::Batch.as_str());
            return self.serve_batch(query, now).await;
        }

        // Latest-value reads keep the stream subscribed so it can serve next time.
        if let Err(e) = self
            .stream
            .ensure_subscribed(query.data_type, &query.symbols)
            .await
        {
            tracing::warn!(
                data_type = %query.data_type,
                error = %e,
                "Could not subscribe on stream; serving from batch"
            );
        }

        if self.stream_is_fresh() {
            metrics::record_route(DataSource::Stream.as_str());
            self.serve_stream(query, now).await
        } else {
            metrics::record_route(DataSource::Batch.as_str());
            self.serve_batch(query, now).await
        }
    }

    fn is_healthy(&self) -> bool {
        self.stream.state() != ConnectionState::Failed
    }
}
