//! Connection Replay Integration Tests
//!
//! Builds the full container on a scripted transport: tickets published
//! while connected are replayed after a reconnect, streamed frames reach the
//! cache and the consumer facade, and the health routes report the stack.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use futures_util::stream;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use market_data_gateway::application::ports::{
    BatchClient, ConnectionError, FrameSink, FrameStream, StreamTransport, UpstreamError,
    WireFrame,
};
use market_data_gateway::domain::market_data::{Orderbook, Trade};
use market_data_gateway::infrastructure::health;
use market_data_gateway::infrastructure::persistence::InMemoryCacheStore;
use market_data_gateway::{
    Candle, ConnectionEvent, ConnectionState, Container, DataSource, DataType, GatewayConfig,
    HealthServerState, MarketRecord, SubscriptionParams, Ticker, Timeframe,
};

type Inbound = mpsc::UnboundedSender<Result<WireFrame, ConnectionError>>;

/// Transport recording outbound frames; the test feeds and ends sessions.
#[derive(Default)]
struct ScriptedTransport {
    sent: Arc<Mutex<Vec<WireFrame>>>,
    inbound: Mutex<Option<Inbound>>,
}

impl ScriptedTransport {
    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|f| match f {
                WireFrame::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, frame: WireFrame) {
        let inbound = self.inbound.lock();
        inbound.as_ref().unwrap().send(Ok(frame)).unwrap();
    }

    fn drop_session(&self) {
        self.inbound.lock().take();
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn connect(&self, _url: &str) -> Result<(FrameSink, FrameStream), ConnectionError> {
        let sent = Arc::clone(&self.sent);
        let sink = futures_util::sink::unfold((), move |(), frame: WireFrame| {
            let sent = Arc::clone(&sent);
            async move {
                sent.lock().push(frame);
                Ok::<_, ConnectionError>(())
            }
        });
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        let inbound = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|f| (f, rx)) });
        Ok((Box::pin(sink), Box::pin(inbound)))
    }
}

/// Batch API that is never expected to be called.
struct Unreachable;

#[async_trait]
impl BatchClient for Unreachable {
    async fn candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _to: DateTime<Utc>,
        _count: usize,
    ) -> Result<Vec<Candle>, UpstreamError> {
        Err(UpstreamError::Transport("offline".to_string()))
    }

    async fn tickers(&self, _symbols: &[String]) -> Result<Vec<Ticker>, UpstreamError> {
        Err(UpstreamError::Transport("offline".to_string()))
    }

    async fn trades(&self, _symbol: &str, _count: usize) -> Result<Vec<Trade>, UpstreamError> {
        Err(UpstreamError::Transport("offline".to_string()))
    }

    async fn orderbooks(&self, _symbols: &[String]) -> Result<Vec<Orderbook>, UpstreamError> {
        Err(UpstreamError::Transport("offline".to_string()))
    }
}

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.stream.heartbeat_interval = Duration::from_secs(3600);
    config.stream.reconnect_base = Duration::from_millis(50);
    config.stream.reconnect_max = Duration::from_millis(200);
    config
}

fn start(transport: &Arc<ScriptedTransport>) -> Container {
    Container::build(
        config(),
        transport.clone(),
        Arc::new(Unreachable),
        Arc::new(InMemoryCacheStore::new()),
        CancellationToken::new(),
    )
}

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

/// Publishes are queued to the worker; wait until `n` texts hit the wire.
async fn wait_for_texts(transport: &ScriptedTransport, n: usize) {
    for _ in 0..100 {
        if transport.texts().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn ticker_frame(symbol: &str, price: u32) -> WireFrame {
    let body = format!(
        r#"{{"type":"ticker","code":"{symbol}","opening_price":1,"high_price":{price},
            "low_price":1,"trade_price":{price},"prev_closing_price":1,"change":"RISE",
            "timestamp":{}}}"#,
        Utc::now().timestamp_millis()
    );
    WireFrame::Binary(body.into_bytes())
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_the_published_configuration() {
    let transport = Arc::new(ScriptedTransport::default());
    let container = start(&transport);
    let connection = container.connection().clone();
    assert!(
        connection
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
            .await
    );

    let feed = container.feed();
    feed.subscribe(DataType::Ticker, &symbols(&["SYM-A", "SYM-B"]), SubscriptionParams::new())
        .await
        .unwrap();
    feed.subscribe(DataType::Orderbook, &symbols(&["SYM-A"]), SubscriptionParams::new())
        .await
        .unwrap();
    feed.subscribe(
        DataType::Candle(Timeframe::Minute1),
        &symbols(&["SYM-C"]),
        SubscriptionParams::new(),
    )
    .await
    .unwrap();
    wait_for_texts(&transport, 3).await;
    assert_eq!(transport.texts().len(), 3);

    let before: BTreeSet<String> = container
        .subscriptions()
        .all_replay_messages()
        .into_iter()
        .map(|m| m.into_string())
        .collect();

    let mut events = connection.subscribe_events();
    transport.drop_session();
    loop {
        if events.recv().await.unwrap() == ConnectionEvent::Connected {
            break;
        }
    }
    wait_for_texts(&transport, 3 + before.len()).await;

    let texts = transport.texts();
    let replayed: BTreeSet<String> = texts[3..].iter().cloned().collect();
    assert_eq!(replayed, before);
    assert_eq!(container.subscriptions().ticket_count(), 1);

    container.shutdown().await;
    assert!(transport.sent.lock().contains(&WireFrame::Close(None)));
}

#[tokio::test(start_paused = true)]
async fn released_tickets_are_not_replayed() {
    let transport = Arc::new(ScriptedTransport::default());
    let container = start(&transport);
    let connection = container.connection().clone();
    assert!(
        connection
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
            .await
    );

    let feed = container.feed();
    feed.subscribe(DataType::Trade, &symbols(&["SYM-A"]), SubscriptionParams::new())
        .await
        .unwrap();
    wait_for_texts(&transport, 1).await;
    feed.release(DataType::Trade, &symbols(&["SYM-A"])).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let sent_before = transport.texts().len();

    let mut events = connection.subscribe_events();
    transport.drop_session();
    loop {
        if events.recv().await.unwrap() == ConnectionEvent::Connected {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.texts().len(), sent_before);
    assert_eq!(container.subscriptions().ticket_count(), 0);
    container.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn streamed_ticker_serves_latest_reads_and_health() {
    let transport = Arc::new(ScriptedTransport::default());
    let container = start(&transport);
    assert!(
        container
            .connection()
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(5))
            .await
    );
    container
        .feed()
        .subscribe(DataType::Ticker, &symbols(&["SYM-A"]), SubscriptionParams::new())
        .await
        .unwrap();

    transport.push(ticker_frame("SYM-A", 42));
    for _ in 0..100 {
        if container.cache().latest(DataType::Ticker, "SYM-A").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = container
        .gateway()
        .get_latest(&symbols(&["SYM-A"]), DataType::Ticker)
        .await;
    assert!(response.success);
    assert_eq!(response.source, DataSource::Stream);
    match &response.data[0] {
        MarketRecord::Ticker(t) => assert_eq!(t.trade_price, Decimal::from(42)),
        other => panic!("expected ticker, got {other:?}"),
    }

    let state = Arc::new(HealthServerState::from_container("test".to_string(), &container));
    let app = health::router(state);

    let health = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body: Value =
        serde_json::from_slice(&to_bytes(health.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connection"], "CONNECTED");
    assert_eq!(body["service"]["mode"], "NORMAL");
    assert_eq!(body["tickets"]["inUse"], 1);
    assert_eq!(body["tickets"]["max"], 5);
    assert_eq!(body["cache"]["latestValues"], 1);

    let ready = app
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    container.shutdown().await;
}
