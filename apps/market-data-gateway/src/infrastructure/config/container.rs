//! Dependency Injection Container
//!
//! Builds and wires every gateway component from a [`GatewayConfig`], spawns
//! the background tasks, and tears them down again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::settings::{GatewayConfig, StoreBackend};
use crate::application::ports::{
    BatchClient, CacheStore, DataService, ServiceError, ServiceFactory, StreamTransport,
};
use crate::application::services::{
    CacheConfig, HybridCache, MarketDataGateway, MessageRouter, PersistQueue, RoutingConfig,
    SmartRouter,
};
use crate::domain::connection::ConnectionState;
use crate::domain::subscription::SubscriptionManager;
use crate::error::GatewayError;
use crate::infrastructure::exchange::{
    ConnectionConfig, ConnectionHandle, DirectClient, ExchangeFeed, RestClient, StreamDecoder,
    WebSocketTransport, spawn_connection,
};
use crate::infrastructure::persistence::{InMemoryCacheStore, SqliteCacheStore, run_persist_writer};
use crate::resilience::fallback::FallbackManager;
use crate::resilience::rate_limiter::RateLimiter;

// =============================================================================
// Service Factory
// =============================================================================

/// Rebuilds the smart router, restarting a failed stream first.
pub struct RouterFactory {
    routing: RoutingConfig,
    feed: Arc<ExchangeFeed>,
    cache: Arc<HybridCache>,
    batch: Arc<dyn BatchClient>,
    connect_wait: Duration,
}

impl std::fmt::Debug for RouterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterFactory")
            .field("routing", &self.routing)
            .field("connect_wait", &self.connect_wait)
            .finish_non_exhaustive()
    }
}

impl RouterFactory {
    fn router(&self) -> Arc<dyn DataService> {
        Arc::new(SmartRouter::new(
            self.routing,
            self.feed.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.batch),
        ))
    }
}

#[async_trait]
impl ServiceFactory for RouterFactory {
    async fn build(&self) -> Result<Arc<dyn DataService>, ServiceError> {
        let connection = self.feed.connection();
        if connection.state() == ConnectionState::Failed {
            connection
                .restart()
                .await
                .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        }
        if !connection
            .wait_for_state(ConnectionState::Connected, self.connect_wait)
            .await
        {
            return Err(ServiceError::Unavailable(format!(
                "stream not connected (state {})",
                connection.state()
            )));
        }
        Ok(self.router())
    }
}

// =============================================================================
// Container
// =============================================================================

/// Wired gateway with its background tasks.
pub struct Container {
    config: GatewayConfig,
    cancel: CancellationToken,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<MessageRouter>,
    feed: Arc<ExchangeFeed>,
    cache: Arc<HybridCache>,
    fallback: Arc<FallbackManager>,
    gateway: MarketDataGateway,
    tasks: Vec<JoinHandle<()>>,
    persist_task: JoinHandle<usize>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("feed", &self.feed)
            .field("fallback", &self.fallback)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Build the production stack: WebSocket transport, REST client, and the
    /// configured cache store.
    ///
    /// # Errors
    ///
    /// Returns an error if the REST client or the cache store cannot be
    /// created.
    pub async fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        let rest_limiter = Arc::new(RateLimiter::new("rest", config.rate_limits.rest));
        let batch: Arc<dyn BatchClient> = Arc::new(RestClient::new(
            config.rest.base_url.clone(),
            config.rest.request_timeout,
            rest_limiter,
        )?);

        let store: Arc<dyn CacheStore> = match &config.cache.store {
            StoreBackend::Memory => Arc::new(InMemoryCacheStore::new()),
            StoreBackend::Sqlite(url) => Arc::new(SqliteCacheStore::connect(url).await?),
        };

        Ok(Self::build(
            config,
            Arc::new(WebSocketTransport::new()),
            batch,
            store,
            CancellationToken::new(),
        ))
    }

    /// Wire the stack on the given ports and spawn its background tasks.
    #[must_use]
    pub fn build(
        config: GatewayConfig,
        transport: Arc<dyn StreamTransport>,
        batch: Arc<dyn BatchClient>,
        store: Arc<dyn CacheStore>,
        cancel: CancellationToken,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new(config.stream.subscription_limits()));
        let router = Arc::new(MessageRouter::new(Arc::new(StreamDecoder::new())));

        let (persist, persist_rx) = PersistQueue::channel();
        let cache = Arc::new(HybridCache::new(
            CacheConfig {
                memory_size: config.cache.memory_size,
                page_size: config.cache.page_size,
            },
            Arc::clone(&store),
            Arc::clone(&batch),
            persist,
        ));
        let persist_task = tokio::spawn(run_persist_writer(store, persist_rx, cancel.child_token()));

        let ingest_cache = Arc::clone(&cache);
        router.add_handler_for_all(move |message| {
            ingest_cache.ingest(message);
            Ok(())
        });

        let connect_limiter = Arc::new(RateLimiter::new("connect", config.rate_limits.connect));
        let (connection, connection_task) = spawn_connection(
            ConnectionConfig::from_stream_settings(&config.stream),
            transport,
            Arc::clone(&subscriptions),
            Arc::clone(&router),
            connect_limiter,
            cancel.child_token(),
        );
        let feed = Arc::new(ExchangeFeed::new(
            connection,
            Arc::clone(&subscriptions),
            Arc::clone(&router),
        ));

        let factory = Arc::new(RouterFactory {
            routing: RoutingConfig {
                stream_recency: config.routing.stream_recency,
                ..RoutingConfig::default()
            },
            feed: Arc::clone(&feed),
            cache: Arc::clone(&cache),
            batch: Arc::clone(&batch),
            connect_wait: config.stream.connect_timeout,
        });

        let direct: Arc<dyn DataService> = Arc::new(DirectClient::new(batch));
        let fallback = Arc::new(FallbackManager::new(
            config.routing.fallback,
            Some(factory.router()),
            direct,
        ));
        let reinit_task = Arc::clone(&fallback).spawn_reinit(factory, cancel.child_token());
        let gateway = MarketDataGateway::new(Arc::clone(&fallback));

        tracing::info!(
            max_tickets = config.stream.max_tickets,
            memory_size = config.cache.memory_size,
            "Gateway container built"
        );

        Self {
            config,
            cancel,
            subscriptions,
            router,
            feed,
            cache,
            fallback,
            gateway,
            tasks: vec![connection_task, reinit_task],
            persist_task,
        }
    }

    /// Configuration the container was built from.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Consumer facade.
    #[must_use]
    pub const fn gateway(&self) -> &MarketDataGateway {
        &self.gateway
    }

    /// Stream feed (subscriptions and connection).
    #[must_use]
    pub const fn feed(&self) -> &Arc<ExchangeFeed> {
        &self.feed
    }

    /// Connection handle.
    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        self.feed.connection()
    }

    /// Ticket pool.
    #[must_use]
    pub const fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Frame router, for registering handlers.
    #[must_use]
    pub const fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<HybridCache> {
        &self.cache
    }

    /// Fallback manager.
    #[must_use]
    pub const fn fallback(&self) -> &Arc<FallbackManager> {
        &self.fallback
    }

    /// Root cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close the stream, stop background tasks, and flush queued cache
    /// writes, bounded by the configured grace period.
    pub async fn shutdown(self) {
        let grace = self.config.service.shutdown_grace;
        self.feed.connection().disconnect_gracefully().await;
        self.cancel.cancel();

        drain_background(self.tasks, self.persist_task, grace).await;
    }
}

/// Await background tasks for up to `grace`, aborting any still running.
///
/// Returns `false` when the grace period elapsed.
async fn drain_background(
    tasks: Vec<JoinHandle<()>>,
    persist_task: JoinHandle<usize>,
    grace: Duration,
) -> bool {
    let aborts: Vec<AbortHandle> = tasks
        .iter()
        .map(JoinHandle::abort_handle)
        .chain(std::iter::once(persist_task.abort_handle()))
        .collect();

    let drain = async {
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        match persist_task.await {
            Ok(flushed) => tracing::info!(records = flushed, "Cache writes flushed"),
            Err(e) => tracing::warn!(error = %e, "Persist writer ended abnormally"),
        }
    };
    if tokio::time::timeout(grace, drain).await.is_ok() {
        return true;
    }
    tracing::warn!(
        grace_secs = grace.as_secs(),
        tasks = aborts.len(),
        "Shutdown grace period elapsed; aborting background tasks"
    );
    for handle in &aborts {
        handle.abort();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn stuck_tasks_are_aborted_after_grace() {
        let (guard, dropped) = oneshot::channel::<()>();
        let stuck = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        let persist = tokio::spawn(std::future::pending::<usize>());

        assert!(!drain_background(vec![stuck], persist, Duration::from_secs(1)).await);
        // Aborting drops the task future, which drops the sender.
        assert!(dropped.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_tasks_drain_within_grace() {
        let quick = tokio::spawn(async {});
        let persist = tokio::spawn(async { 3 });
        assert!(drain_background(vec![quick], persist, Duration::from_secs(1)).await);
    }
}
