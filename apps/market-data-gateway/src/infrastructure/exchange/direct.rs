//! Direct Client
//!
//! The degraded-mode data service. Straight to the batch API: no stream, no
//! tickets, no cache, no gap fill. Candle reads return actual records only.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::rest::MAX_CANDLE_PAGE;
use crate::application::ports::{BatchClient, DataService, ServiceError};
use crate::domain::cache_record::CacheRecord;
use crate::domain::market_data::DataType;
use crate::domain::request::{DataQuery, DataResponse, DataSource, MarketRecord};
use crate::domain::timeframe::Timeframe;
use crate::error::DataGapError;

/// Pages fetched per symbol before a candle read gives up walking back.
const MAX_PAGES: usize = 50;

/// Minimal data service on the batch API.
pub struct DirectClient {
    batch: Arc<dyn BatchClient>,
}

impl std::fmt::Debug for DirectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectClient").finish_non_exhaustive()
    }
}

impl DirectClient {
    /// Create a client over `batch`.
    #[must_use]
    pub fn new(batch: Arc<dyn BatchClient>) -> Self {
        Self { batch }
    }

    /// Candles with `start <= open_time <= end`, oldest first, at most `limit`
    /// of the newest.
    async fn candles(
        &self,
        symbol: &str,
        tf: Timeframe,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheRecord>, ServiceError> {
        let now = Utc::now();
        let mut to = tf.window_end(tf.floor(end));
        let mut collected = Vec::new();

        for _ in 0..MAX_PAGES {
            let page = self.batch.candles(symbol, tf, to, MAX_CANDLE_PAGE).await?;
            let Some(oldest) = page.iter().map(|c| c.open_time).min() else {
                break;
            };
            let short = page.len() < MAX_CANDLE_PAGE;
            collected.extend(
                page.into_iter()
                    .filter(|c| c.open_time <= end && start.is_none_or(|s| c.open_time >= s))
                    .map(|c| {
                        let is_final = tf.is_closed(tf.floor(c.open_time), now);
                        CacheRecord::collected(&c, is_final)
                    }),
            );
            if short || collected.len() >= limit || start.is_some_and(|s| oldest <= s) {
                break;
            }
            to = oldest;
        }

        collected.sort_by_key(|r| r.timestamp);
        collected.dedup_by_key(|r| r.timestamp);
        let skip = collected.len().saturating_sub(limit);
        Ok(collected.split_off(skip))
    }
}

fn gap(query: &DataQuery, reason: &str) -> ServiceError {
    let symbol = query.symbols.first().cloned().unwrap_or_default();
    DataGapError::new(symbol, query.data_type, reason).into()
}

#[async_trait]
impl DataService for DirectClient {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn request(&self, query: &DataQuery) -> Result<DataResponse, ServiceError> {
        if query.symbols.is_empty() {
            return Err(ServiceError::InvalidQuery("no symbols".to_string()));
        }
        if query.count == 0 {
            return Err(ServiceError::InvalidQuery("count must be positive".to_string()));
        }

        let now = Utc::now();
        let historical = query.is_historical(now);

        let records: Vec<MarketRecord> = match query.data_type {
            DataType::Candle(tf) => {
                let mut records = Vec::new();
                for symbol in &query.symbols {
                    let read = match query.range {
                        Some(range) => {
                            self.candles(symbol, tf, Some(range.start), range.end, usize::MAX)
                                .await?
                        }
                        None => {
                            let end = query.as_of.map_or(now, |t| t.min(now));
                            self.candles(symbol, tf, None, end, query.count).await?
                        }
                    };
                    records.extend(read.into_iter().map(MarketRecord::Candle));
                }
                records
            }
            _ if query.range.is_some() => {
                return Err(gap(query, "ranges are only available for candles"));
            }
            DataType::Ticker | DataType::Orderbook if historical || query.count > 1 => {
                return Err(gap(query, "only the current snapshot is available"));
            }
            DataType::Trade if historical => {
                return Err(gap(query, "trade history is only available up to now"));
            }
            DataType::Ticker => self
                .batch
                .tickers(&query.symbols)
                .await?
                .into_iter()
                .map(MarketRecord::Ticker)
                .collect(),
            DataType::Orderbook => self
                .batch
                .orderbooks(&query.symbols)
                .await?
                .into_iter()
                .map(MarketRecord::Orderbook)
                .collect(),
            DataType::Trade => {
                let mut records = Vec::new();
                for symbol in &query.symbols {
                    let mut trades = self.batch.trades(symbol, query.count).await?;
                    trades.sort_by_key(|t| (t.timestamp, t.sequential_id));
                    records.extend(trades.into_iter().map(MarketRecord::Trade));
                }
                records
            }
        };

        Ok(DataResponse::ok(records, DataSource::Direct))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::UpstreamError;
    use crate::domain::market_data::{Candle, Orderbook, Ticker, Trade};
    use chrono::{TimeDelta, TimeZone};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    /// Candles only at even minutes, as if odd minutes had no trades.
    #[derive(Default)]
    struct SparseBatch {
        requests: Mutex<Vec<(DateTime<Utc>, usize)>>,
    }

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[async_trait]
    impl BatchClient for SparseBatch {
        async fn candles(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            to: DateTime<Utc>,
            count: usize,
        ) -> Result<Vec<Candle>, UpstreamError> {
            self.requests.lock().push((to, count));
            let mut out = Vec::new();
            let mut slot = timeframe.floor(to - TimeDelta::seconds(1));
            while out.len() < count && slot >= origin() {
                if (slot - origin()).num_minutes() % 2 == 0 {
                    out.push(Candle {
                        symbol: symbol.to_string(),
                        timeframe,
                        open_time: slot,
                        open: Decimal::ONE,
                        high: Decimal::ONE,
                        low: Decimal::ONE,
                        close: Decimal::ONE,
                        volume: Decimal::ONE,
                        quote_volume: Decimal::ONE,
                    });
                }
                slot -= timeframe.duration();
            }
            Ok(out)
        }

        async fn tickers(&self, _symbols: &[String]) -> Result<Vec<Ticker>, UpstreamError> {
            Err(UpstreamError::Http {
                status: 500,
                message: "down".to_string(),
            })
        }

        async fn trades(&self, _symbol: &str, _count: usize) -> Result<Vec<Trade>, UpstreamError> {
            Ok(Vec::new())
        }

        async fn orderbooks(&self, _symbols: &[String]) -> Result<Vec<Orderbook>, UpstreamError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn range_returns_actual_records_only() {
        let batch = Arc::new(SparseBatch::default());
        let client = DirectClient::new(batch.clone());
        let start = origin() + TimeDelta::minutes(10);
        let end = origin() + TimeDelta::minutes(19);

        let query = DataQuery::range("SYM-A", Timeframe::Minute1, start, end, true);
        let response = client.request(&query).await.unwrap();

        assert!(response.success);
        assert_eq!(response.source, DataSource::Direct);
        assert_eq!(response.record_count, 5);
        let stamps: Vec<_> = response.data.iter().map(MarketRecord::timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
        assert!(stamps.iter().all(|t| *t >= start && *t <= end));
        assert_eq!(batch.requests.lock()[0].0, end + TimeDelta::minutes(1));
    }

    #[tokio::test]
    async fn history_keeps_newest_count() {
        let client = DirectClient::new(Arc::new(SparseBatch::default()));
        let as_of = origin() + TimeDelta::minutes(30);
        let query = DataQuery::history(
            vec!["SYM-A".to_string()],
            DataType::Candle(Timeframe::Minute1),
            3,
            Some(as_of),
        );
        let response = client.request(&query).await.unwrap();
        let stamps: Vec<_> = response.data.iter().map(MarketRecord::timestamp).collect();
        assert_eq!(
            stamps,
            vec![
                origin() + TimeDelta::minutes(26),
                origin() + TimeDelta::minutes(28),
                origin() + TimeDelta::minutes(30),
            ]
        );
    }

    #[tokio::test]
    async fn upstream_errors_propagate() {
        let client = DirectClient::new(Arc::new(SparseBatch::default()));
        let query = DataQuery::latest(vec!["SYM-A".to_string()], DataType::Ticker);
        let err = client.request(&query).await.unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(UpstreamError::Http { status: 500, .. })));
    }

    #[tokio::test]
    async fn orderbook_history_is_a_gap() {
        let client = DirectClient::new(Arc::new(SparseBatch::default()));
        let query = DataQuery::history(vec!["SYM-A".to_string()], DataType::Orderbook, 10, None);
        assert!(matches!(client.request(&query).await, Err(ServiceError::DataGap(_))));
    }
}
