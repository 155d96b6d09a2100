//! Fallback manager for degraded operation.
//!
//! Wraps the primary (smart routing) data service and swaps to a minimal
//! direct client when the primary keeps failing, so callers are served by a
//! dumber path instead of receiving errors.
//!
//! # State Machine
//!
//! ```text
//! NORMAL → DEGRADED (N consecutive failures, M seconds of silence, or primary unhealthy)
//! DEGRADED → NORMAL (background rebuild of the primary succeeds)
//! ```
//!
//! # Configuration
//!
//! - `failure_threshold`: Consecutive primary failures before tripping (default: 3)
//! - `max_silence`: Time since last success, with failures outstanding, before tripping (default: 60s)
//! - `reinit_interval`: Period of the background rebuild attempt (default: 30s)

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{DataService, ServiceError, ServiceFactory};
use crate::domain::request::{DataQuery, DataResponse, DataSource};
use crate::infrastructure::metrics;

/// Service mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceMode {
    /// Requests go through the primary service.
    Normal,
    /// Requests go straight to the direct client.
    Degraded,
}

impl ServiceMode {
    /// Label for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Degraded => "DEGRADED",
        }
    }
}

impl std::fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fallback trip and recovery thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Consecutive primary failures before tripping.
    pub failure_threshold: u32,
    /// Time since last success, with failures outstanding, before tripping.
    pub max_silence: Duration,
    /// Period of the background rebuild attempt.
    pub reinit_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            max_silence: Duration::from_secs(60),
            reinit_interval: Duration::from_secs(30),
        }
    }
}

/// Fallback counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackStats {
    /// Current mode.
    pub mode: ServiceMode,
    /// Primary failures since the last success.
    pub consecutive_failures: u32,
    /// Normal → Degraded transitions.
    pub trips: u64,
    /// Degraded → Normal transitions.
    pub recoveries: u64,
    /// Requests answered by the primary.
    pub primary_served: u64,
    /// Requests answered by the direct client.
    pub direct_served: u64,
}

/// Primary/direct switch with failure escalation.
pub struct FallbackManager {
    config: FallbackConfig,
    primary: RwLock<Option<Arc<dyn DataService>>>,
    direct: Arc<dyn DataService>,
    mode: RwLock<ServiceMode>,
    consecutive_failures: AtomicU32,
    last_success: Mutex<Instant>,
    trips: AtomicU64,
    recoveries: AtomicU64,
    primary_served: AtomicU64,
    direct_served: AtomicU64,
}

impl std::fmt::Debug for FallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackManager")
            .field("config", &self.config)
            .field("direct", &self.direct.name())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl FallbackManager {
    /// Create a manager. Without a primary it starts degraded.
    #[must_use]
    pub fn new(
        config: FallbackConfig,
        primary: Option<Arc<dyn DataService>>,
        direct: Arc<dyn DataService>,
    ) -> Self {
        let mode = if primary.is_some() {
            ServiceMode::Normal
        } else {
            ServiceMode::Degraded
        };
        metrics::set_service_mode(mode == ServiceMode::Degraded);
        Self {
            config,
            primary: RwLock::new(primary),
            direct,
            mode: RwLock::new(mode),
            consecutive_failures: AtomicU32::new(0),
            last_success: Mutex::new(Instant::now()),
            trips: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            primary_served: AtomicU64::new(0),
            direct_served: AtomicU64::new(0),
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> ServiceMode {
        *self.mode.read()
    }

    /// Serve a query. Never returns an error: failures become
    /// `DataResponse { success: false, .. }`.
    pub async fn request(&self, query: &DataQuery) -> DataResponse {
        let Some(primary) = self.active_primary() else {
            return self.serve_direct(query).await;
        };

        match primary.request(query).await {
            Ok(response) => {
                self.record_success();
                self.primary_served.fetch_add(1, Ordering::Relaxed);
                response
            }
            Err(e) if !e.is_service_failure() => {
                tracing::debug!(
                    service = primary.name(),
                    data_type = %query.data_type,
                    error = %e,
                    "Request cannot be served"
                );
                DataResponse::failure(DataSource::Batch, e.to_string())
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    service = primary.name(),
                    data_type = %query.data_type,
                    consecutive_failures = failures,
                    error = %e,
                    "Primary service failed; retrying on direct client"
                );
                if failures >= self.config.failure_threshold {
                    self.trip("consecutive failures");
                }
                self.serve_direct(query).await
            }
        }
    }

    /// Primary to use for this request, tripping first when it should not be used.
    fn active_primary(&self) -> Option<Arc<dyn DataService>> {
        if self.mode() == ServiceMode::Degraded {
            return None;
        }
        let Some(primary) = self.primary.read().clone() else {
            self.trip("no primary service");
            return None;
        };
        if !primary.is_healthy() {
            self.trip("primary unhealthy");
            return None;
        }
        let silent_for = self.last_success.lock().elapsed();
        if self.consecutive_failures.load(Ordering::Relaxed) > 0
            && silent_for >= self.config.max_silence
        {
            self.trip("no success within silence window");
            return None;
        }
        Some(primary)
    }

    async fn serve_direct(&self, query: &DataQuery) -> DataResponse {
        self.direct_served.fetch_add(1, Ordering::Relaxed);
        match self.direct.request(query).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    service = self.direct.name(),
                    data_type = %query.data_type,
                    error = %e,
                    "Direct client failed"
                );
                DataResponse::failure(DataSource::Direct, e.to_string())
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.last_success.lock() = Instant::now();
    }

    fn trip(&self, reason: &str) {
        let mut mode = self.mode.write();
        if *mode == ServiceMode::Degraded {
            return;
        }
        *mode = ServiceMode::Degraded;
        drop(mode);

        self.trips.fetch_add(1, Ordering::Relaxed);
        metrics::set_service_mode(true);
        tracing::error!(
            reason,
            consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed),
            "Entering degraded mode"
        );
    }

    /// Rebuild the primary through `factory` and return to normal mode.
    ///
    /// # Errors
    ///
    /// Returns the factory error, or `Unavailable` when the rebuilt service
    /// reports itself unhealthy. The mode is left unchanged on error.
    pub async fn reinitialize(&self, factory: &dyn ServiceFactory) -> Result<(), ServiceError> {
        let rebuilt = factory.build().await?;
        if !rebuilt.is_healthy() {
            return Err(ServiceError::Unavailable(format!(
                "rebuilt {} is not healthy",
                rebuilt.name()
            )));
        }

        *self.primary.write() = Some(rebuilt);
        self.record_success();

        let mut mode = self.mode.write();
        let was_degraded = *mode == ServiceMode::Degraded;
        *mode = ServiceMode::Normal;
        drop(mode);

        if was_degraded {
            self.recoveries.fetch_add(1, Ordering::Relaxed);
            metrics::set_service_mode(false);
            tracing::info!("Primary service rebuilt; leaving degraded mode");
        }
        Ok(())
    }

    /// Periodically rebuild the primary while degraded.
    pub fn spawn_reinit(
        self: Arc<Self>,
        factory: Arc<dyn ServiceFactory>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reinit_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Fallback reinit task stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                if self.mode() == ServiceMode::Normal {
                    continue;
                }
                if let Err(e) = self.reinitialize(factory.as_ref()).await {
                    tracing::warn!(error = %e, "Primary rebuild failed; staying degraded");
                }
            }
        })
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            mode: self.mode(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            trips: self.trips.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            primary_served: self.primary_served.load(Ordering::Relaxed),
            direct_served: self.direct_served.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::UpstreamError;
    use crate::domain::market_data::DataType;
    use crate::error::DataGapError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Scripted {
        name: &'static str,
        source: DataSource,
        fail: AtomicBool,
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, source: DataSource) -> Arc<Self> {
            Arc::new(Self {
                name,
                source,
                fail: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DataService for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn request(&self, query: &DataQuery) -> Result<DataResponse, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.data_type == DataType::Orderbook && query.count > 1 {
                return Err(DataGapError::new("SYM-A", DataType::Orderbook, "no history").into());
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(UpstreamError::Transport("connection reset".to_string()).into());
            }
            Ok(DataResponse::ok(Vec::new(), self.source))
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    struct Rebuild(Arc<Scripted>);

    #[async_trait]
    impl ServiceFactory for Rebuild {
        async fn build(&self) -> Result<Arc<dyn DataService>, ServiceError> {
            Ok(self.0.clone())
        }
    }

    fn query() -> DataQuery {
        DataQuery::latest(vec!["SYM-A".to_string()], DataType::Ticker)
    }

    fn manager(primary: &Arc<Scripted>, direct: &Arc<Scripted>) -> FallbackManager {
        let primary: Arc<dyn DataService> = primary.clone();
        FallbackManager::new(FallbackConfig::default(), Some(primary), direct.clone())
    }

    #[tokio::test]
    async fn healthy_primary_serves() {
        let primary = Scripted::new("smart", DataSource::Stream);
        let direct = Scripted::new("direct", DataSource::Direct);
        let fallback = manager(&primary, &direct);

        let response = fallback.request(&query()).await;
        assert!(response.success);
        assert_eq!(response.source, DataSource::Stream);
        assert_eq!(direct.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_are_retried_on_direct_then_trip() {
        let primary = Scripted::new("smart", DataSource::Stream);
        let direct = Scripted::new("direct", DataSource::Direct);
        primary.fail.store(true, Ordering::SeqCst);
        let fallback = manager(&primary, &direct);

        for _ in 0..2 {
            let response = fallback.request(&query()).await;
            assert!(response.success);
            assert_eq!(response.source, DataSource::Direct);
            assert_eq!(fallback.mode(), ServiceMode::Normal);
        }
        fallback.request(&query()).await;
        assert_eq!(fallback.mode(), ServiceMode::Degraded);

        fallback.request(&query()).await;
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fallback.stats().trips, 1);
    }

    #[tokio::test]
    async fn caller_errors_do_not_count() {
        let primary = Scripted::new("smart", DataSource::Batch);
        let direct = Scripted::new("direct", DataSource::Direct);
        let fallback = manager(&primary, &direct);
        let history = DataQuery::history(vec!["SYM-A".to_string()], DataType::Orderbook, 5, None);

        for _ in 0..5 {
            let response = fallback.request(&history).await;
            assert!(!response.success);
            assert!(response.error.is_some());
        }
        assert_eq!(fallback.mode(), ServiceMode::Normal);
        assert_eq!(fallback.stats().consecutive_failures, 0);
        assert_eq!(direct.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unhealthy_primary_trips_immediately() {
        let primary = Scripted::new("smart", DataSource::Stream);
        let direct = Scripted::new("direct", DataSource::Direct);
        primary.healthy.store(false, Ordering::SeqCst);
        let fallback = manager(&primary, &direct);

        let response = fallback.request(&query()).await;
        assert_eq!(response.source, DataSource::Direct);
        assert_eq!(fallback.mode(), ServiceMode::Degraded);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_with_outstanding_failure_trips() {
        let primary = Scripted::new("smart", DataSource::Stream);
        let direct = Scripted::new("direct", DataSource::Direct);
        let fallback = manager(&primary, &direct);

        primary.fail.store(true, Ordering::SeqCst);
        fallback.request(&query()).await;
        assert_eq!(fallback.mode(), ServiceMode::Normal);

        tokio::time::advance(Duration::from_secs(61)).await;
        primary.fail.store(false, Ordering::SeqCst);
        let response = fallback.request(&query()).await;
        assert_eq!(response.source, DataSource::Direct);
        assert_eq!(fallback.mode(), ServiceMode::Degraded);
    }

    #[tokio::test]
    async fn reinitialize_restores_normal_mode() {
        let primary = Scripted::new("smart", DataSource::Stream);
        let direct = Scripted::new("direct", DataSource::Direct);
        primary.healthy.store(false, Ordering::SeqCst);
        let fallback = manager(&primary, &direct);
        fallback.request(&query()).await;
        assert_eq!(fallback.mode(), ServiceMode::Degraded);

        let rebuild = Rebuild(primary.clone());
        assert!(fallback.reinitialize(&rebuild).await.is_err());
        assert_eq!(fallback.mode(), ServiceMode::Degraded);

        primary.healthy.store(true, Ordering::SeqCst);
        fallback.reinitialize(&rebuild).await.unwrap();
        assert_eq!(fallback.mode(), ServiceMode::Normal);

        let response = fallback.request(&query()).await;
        assert_eq!(response.source, DataSource::Stream);
        assert_eq!(fallback.stats().recoveries, 1);
    }

    #[tokio::test]
    async fn starts_degraded_without_primary() {
        let direct = Scripted::new("direct", DataSource::Direct);
        let fallback = FallbackManager::new(FallbackConfig::default(), None, direct.clone());
        assert_eq!(fallback.mode(), ServiceMode::Degraded);
        assert!(fallback.request(&query()).await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn background_reinit_recovers() {
        let primary = Scripted::new("smart", DataSource::Stream);
        let direct = Scripted::new("direct", DataSource::Direct);
        let fallback = Arc::new(FallbackManager::new(
            FallbackConfig::default(),
            None,
            direct.clone(),
        ));
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&fallback).spawn_reinit(Arc::new(Rebuild(primary)), cancel.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fallback.mode(), ServiceMode::Normal);

        cancel.cancel();
        handle.await.unwrap();
    }
}
