//! Exchange REST Client
//!
//! Implements [`BatchClient`] over the exchange's public quotation API. Every
//! call takes a token from the shared REST limiter first and is bounded by the
//! request timeout.
//!
//! | Read | Endpoint |
//! |---|---|
//! | candles | `/v1/candles/{seconds,minutes/{unit},days,weeks}` |
//! | tickers | `/v1/ticker?markets=` |
//! | trades | `/v1/trades/ticks?market=&count=` |
//! | orderbooks | `/v1/orderbook?markets=` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use super::messages::{CandleMessage, OrderbookMessage, TickerMessage, TradeMessage};
use crate::application::ports::{BatchClient, UpstreamError};
use crate::domain::market_data::{Candle, Orderbook, Ticker, Trade};
use crate::domain::timeframe::Timeframe;
use crate::infrastructure::metrics;
use crate::resilience::rate_limiter::RateLimiter;

/// Largest page the candle endpoints return.
pub const MAX_CANDLE_PAGE: usize = 200;

/// Attempts for a rate-limited (429) call.
const MAX_ATTEMPTS: u32 = 3;

/// Batch API client.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    limiter: Arc<RateLimiter>,
}

impl RestClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError::Transport` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            limiter,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let response = self
                .client
                .get(&url)
                .query(query)
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        UpstreamError::Timeout(self.timeout)
                    } else {
                        UpstreamError::Transport(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| UpstreamError::Decode(e.to_string()));
            }

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_ATTEMPTS {
                tracing::warn!(path, attempt, "Upstream rate limited, retrying");
                continue;
            }

            let message = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message,
            });
        }
    }

    fn observe<T>(
        kind: &'static str,
        result: Result<T, UpstreamError>,
    ) -> Result<T, UpstreamError> {
        match &result {
            Ok(_) => metrics::record_upstream_fetch(kind, "ok"),
            Err(e) => {
                tracing::warn!(kind, error = %e, "Upstream fetch failed");
                metrics::record_upstream_fetch(kind, "error");
            }
        }
        result
    }
}

/// Endpoint path for a timeframe's candles.
#[must_use]
pub fn candle_path(timeframe: Timeframe) -> String {
    match timeframe {
        Timeframe::Second1 => "/v1/candles/seconds".to_string(),
        Timeframe::Day1 => "/v1/candles/days".to_string(),
        Timeframe::Week1 => "/v1/candles/weeks".to_string(),
        minute => format!("/v1/candles/minutes/{}", minute.minute_unit().unwrap_or(1)),
    }
}

/// `to` query value: exclusive upper bound, UTC.
#[must_use]
pub fn format_to(to: DateTime<Utc>) -> String {
    to.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[async_trait]
impl BatchClient for RestClient {
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        to: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<Candle>, UpstreamError> {
        let query = [
            ("market", symbol.to_string()),
            ("to", format_to(to)),
            ("count", count.clamp(1, MAX_CANDLE_PAGE).to_string()),
        ];
        let result = self
            .get::<Vec<CandleMessage>>(&candle_path(timeframe), &query)
            .await
            .and_then(|page| {
                page.into_iter()
                    .map(|c| {
                        c.into_domain(timeframe).map_err(|e| {
                            UpstreamError::Decode(format!("candle_date_time_utc: {e}"))
                        })
                    })
                    .collect()
            });
        Self::observe("candle", result)
    }

    async fn tickers(&self, symbols: &[String]) -> Result<Vec<Ticker>, UpstreamError> {
        let result = self
            .get::<Vec<TickerMessage>>("/v1/ticker", &[("markets", symbols.join(","))])
            .await
            .map(|page| page.into_iter().map(TickerMessage::into_domain).collect());
        Self::observe("ticker", result)
    }

    async fn trades(&self, symbol: &str, count: usize) -> Result<Vec<Trade>, UpstreamError> {
        let query = [("market", symbol.to_string()), ("count", count.max(1).to_string())];
        let result = self
            .get::<Vec<TradeMessage>>("/v1/trades/ticks", &query)
            .await
            .map(|page| page.into_iter().map(TradeMessage::into_domain).collect());
        Self::observe("trade", result)
    }

    async fn orderbooks(&self, symbols: &[String]) -> Result<Vec<Orderbook>, UpstreamError> {
        let result = self
            .get::<Vec<OrderbookMessage>>("/v1/orderbook", &[("markets", symbols.join(","))])
            .await
            .map(|page| page.into_iter().map(OrderbookMessage::into_domain).collect());
        Self::observe("orderbook", result)
    }
}
