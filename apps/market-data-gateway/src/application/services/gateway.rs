//! Market Data Gateway
//!
//! Consumer-facing facade. Every call returns a [`DataResponse`]; failures
//! come back as `success: false` with an error message, never as `Err`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::market_data::DataType;
use crate::domain::request::{DataQuery, DataResponse};
use crate::domain::timeframe::Timeframe;
use crate::resilience::fallback::{FallbackManager, ServiceMode};

/// Entry point for strategy engines, UIs and other consumers.
#[derive(Debug, Clone)]
pub struct MarketDataGateway {
    fallback: Arc<FallbackManager>,
}

impl MarketDataGateway {
    /// Wrap a fallback manager.
    #[must_use]
    pub const fn new(fallback: Arc<FallbackManager>) -> Self {
        Self { fallback }
    }

    /// Most recent record per symbol.
    pub async fn get_latest(&self, symbols: &[String], data_type: DataType) -> DataResponse {
        self.request(&DataQuery::latest(symbols.to_vec(), data_type))
            .await
    }

    /// Last `count` records per symbol, ending at `as_of` (default now).
    /// Candle history is actual-only.
    pub async fn get_history(
        &self,
        symbols: &[String],
        data_type: DataType,
        count: usize,
        as_of: Option<DateTime<Utc>>,
    ) -> DataResponse {
        self.request(&DataQuery::history(symbols.to_vec(), data_type, count, as_of))
            .await
    }

    /// Gap-filled candle slots for `start..=end`. With `include_empty` every
    /// expected slot is returned; without it only slots with activity.
    pub async fn get_continuous_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_empty: bool,
    ) -> DataResponse {
        self.request(&DataQuery::range(symbol, timeframe, start, end, include_empty))
            .await
    }

    /// Serve an arbitrary query.
    pub async fn request(&self, query: &DataQuery) -> DataResponse {
        let response = self.fallback.request(query).await;
        tracing::debug!(
            data_type = %query.data_type,
            symbols = query.symbols.len(),
            success = response.success,
            source = response.source.as_str(),
            records = response.record_count,
            "Request served"
        );
        response
    }

    /// Current service mode.
    #[must_use]
    pub fn mode(&self) -> ServiceMode {
        self.fallback.mode()
    }

    /// Underlying fallback manager.
    #[must_use]
    pub const fn fallback(&self) -> &Arc<FallbackManager> {
        &self.fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{DataService, ServiceError};
    use crate::domain::request::{DataSource, ReadMode};
    use crate::resilience::fallback::FallbackConfig;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        queries: Mutex<Vec<DataQuery>>,
    }

    #[async_trait]
    impl DataService for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn request(&self, query: &DataQuery) -> Result<DataResponse, ServiceError> {
            self.queries.lock().push(query.clone());
            if query.symbols.is_empty() {
                return Err(ServiceError::InvalidQuery("no symbols".to_string()));
            }
            Ok(DataResponse::ok(Vec::new(), DataSource::Cache))
        }
    }

    fn gateway(primary: &Arc<Recording>) -> MarketDataGateway {
        let direct = Arc::new(Recording::default());
        MarketDataGateway::new(Arc::new(FallbackManager::new(
            FallbackConfig::default(),
            Some(primary.clone()),
            direct,
        )))
    }

    #[tokio::test]
    async fn consumer_calls_build_queries() {
        let primary = Arc::new(Recording::default());
        let gateway = gateway(&primary);
        let symbols = vec!["SYM-A".to_string()];
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 9, 0).unwrap();

        assert!(gateway.get_latest(&symbols, DataType::Ticker).await.success);
        assert!(gateway.get_history(&symbols, DataType::Trade, 50, None).await.success);
        let range = gateway
            .get_continuous_range("SYM-A", Timeframe::Minute1, start, end, false)
            .await;
        assert!(range.success);
        assert_eq!(range.source, DataSource::Cache);

        let queries = primary.queries.lock();
        assert_eq!(queries[0].count, 1);
        assert_eq!(queries[1].count, 50);
        assert_eq!(queries[2].count, 10);
        assert_eq!(queries[2].read_mode, ReadMode::ActualOnly);
        assert_eq!(gateway.mode(), ServiceMode::Normal);
    }

    #[tokio::test]
    async fn errors_become_unsuccessful_responses() {
        let primary = Arc::new(Recording::default());
        let response = gateway(&primary).get_latest(&[], DataType::Ticker).await;
        assert!(!response.success);
        assert_eq!(response.record_count, 0);
        assert!(response.error.is_some());
    }
}
