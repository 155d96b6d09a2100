//! Message Router
//!
//! Turns raw inbound frames into [`Message`]s and fans them out to handlers
//! registered per data type.
//!
//! # Dispatch rules
//!
//! - Handlers run synchronously, in registration order
//! - A failing or panicking handler is logged and skipped; the remaining
//!   handlers and the read loop are unaffected
//! - The handler list is append-only
//! - A snapshot on a windowed data type publishes a [`WindowClosed`] event

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::application::ports::{FrameDecoder, UpstreamProtocolError};
use crate::domain::market_data::{DataType, InboundFrame, Message, StreamPhase};
use crate::domain::timeframe::Timeframe;
use crate::infrastructure::metrics;

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A registered message handler.
pub type Handler = Arc<dyn Fn(&Message) -> Result<(), HandlerError> + Send + Sync>;

const WINDOW_EVENT_CAPACITY: usize = 1_024;

/// A time window closed for one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowClosed {
    /// Market code.
    pub symbol: String,
    /// Window granularity.
    pub timeframe: Timeframe,
    /// Window start.
    pub window_start: DateTime<Utc>,
}

/// Outcome of routing one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSummary {
    /// Market messages decoded.
    pub messages: usize,
    /// Handler invocations that succeeded.
    pub delivered: usize,
    /// Handler invocations that failed or panicked.
    pub handler_failures: usize,
    /// Status replies seen.
    pub statuses: Vec<String>,
    /// Exchange error frames seen.
    pub exchange_errors: Vec<String>,
    /// Elements that could not be decoded.
    pub protocol_errors: Vec<UpstreamProtocolError>,
}

/// Decodes frames and dispatches messages.
pub struct MessageRouter {
    decoder: Arc<dyn FrameDecoder>,
    handlers: RwLock<HashMap<DataType, Vec<Handler>>>,
    wildcard: RwLock<Vec<Handler>>,
    window_events: broadcast::Sender<WindowClosed>,
    last_delivery: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("data_types", &self.handlers.read().len())
            .field("wildcard", &self.wildcard.read().len())
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    /// Create a router with no handlers.
    #[must_use]
    pub fn new(decoder: Arc<dyn FrameDecoder>) -> Self {
        let (window_events, _) = broadcast::channel(WINDOW_EVENT_CAPACITY);
        Self {
            decoder,
            handlers: RwLock::new(HashMap::new()),
            wildcard: RwLock::new(Vec::new()),
            window_events,
            last_delivery: Mutex::new(None),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a handler for one data type.
    pub fn add_handler<F>(&self, data_type: DataType, handler: F)
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(data_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler for every data type.
    pub fn add_handler_for_all<F>(&self, handler: F)
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.wildcard.write().push(Arc::new(handler));
    }

    /// Register a handler that only sees snapshot messages.
    pub fn add_snapshot_handler<F>(&self, data_type: DataType, handler: F)
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.add_handler(data_type, phase_filter(StreamPhase::Snapshot, handler));
    }

    /// Register a handler that only sees realtime messages.
    pub fn add_realtime_handler<F>(&self, data_type: DataType, handler: F)
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.add_handler(data_type, phase_filter(StreamPhase::Realtime, handler));
    }

    /// Register a handler that fires when a window of `data_type` closes.
    pub fn add_completion_handler<F>(&self, data_type: DataType, handler: F)
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.add_handler(data_type, move |msg: &Message| {
            if msg.closes_window() {
                handler(msg)
            } else {
                Ok(())
            }
        });
    }

    /// Receive [`WindowClosed`] events.
    #[must_use]
    pub fn subscribe_window_events(&self) -> broadcast::Receiver<WindowClosed> {
        self.window_events.subscribe()
    }

    /// Instant of the last decoded market message.
    #[must_use]
    pub fn last_delivery(&self) -> Option<Instant> {
        *self.last_delivery.lock()
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Decode and dispatch one raw frame.
    pub fn on_frame(&self, raw: &[u8]) -> FrameSummary {
        let mut summary = FrameSummary::default();

        for frame in self.decoder.decode(raw, Utc::now()) {
            match frame {
                InboundFrame::Market(message) => {
                    summary.messages += 1;
                    let (delivered, failed) = self.dispatch(&message);
                    summary.delivered += delivered;
                    summary.handler_failures += failed;
                }
                InboundFrame::Status(status) => {
                    tracing::debug!(status = %status, "Stream status frame");
                    summary.statuses.push(status);
                }
                InboundFrame::ExchangeError { name, message } => {
                    tracing::warn!(name = %name, message = %message, "Exchange reported error");
                    summary.exchange_errors.push(format!("{name}: {message}"));
                }
                InboundFrame::Unrecognized { reason } => {
                    let err = UpstreamProtocolError { reason };
                    tracing::warn!(error = %err, "Dropping undecodable frame element");
                    metrics::record_protocol_error();
                    summary.protocol_errors.push(err);
                }
            }
        }

        summary
    }

    /// Deliver a decoded message to its handlers.
    ///
    /// Returns (successful deliveries, failures).
    pub fn dispatch(&self, message: &Message) -> (usize, usize) {
        let data_type = message.data_type();
        *self.last_delivery.lock() = Some(Instant::now());

        if message.closes_window() {
            self.publish_window_closed(message);
        }

        let mut targets: Vec<Handler> = self
            .handlers
            .read()
            .get(&data_type)
            .cloned()
            .unwrap_or_default();
        targets.extend(self.wildcard.read().iter().cloned());

        let mut delivered = 0;
        let mut failed = 0;
        for handler in &targets {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    failed += 1;
                    tracing::warn!(
                        data_type = %data_type,
                        symbol = %message.symbol,
                        error = %err,
                        "Message handler failed"
                    );
                    metrics::record_handler_failure(&data_type.wire_name());
                }
                Err(_) => {
                    failed += 1;
                    tracing::error!(
                        data_type = %data_type,
                        symbol = %message.symbol,
                        "Message handler panicked"
                    );
                    metrics::record_handler_failure(&data_type.wire_name());
                }
            }
        }

        metrics::record_message_dispatched(&data_type.wire_name());
        (delivered, failed)
    }

    fn publish_window_closed(&self, message: &Message) {
        let crate::domain::market_data::MarketPayload::Candle(candle) = &message.payload else {
            return;
        };
        let event = WindowClosed {
            symbol: candle.symbol.clone(),
            timeframe: candle.timeframe,
            window_start: candle.timeframe.floor(candle.open_time),
        };
        tracing::debug!(
            symbol = %event.symbol,
            timeframe = %event.timeframe,
            window_start = %event.window_start,
            "Window closed"
        );
        // No receivers is fine.
        let _ = self.window_events.send(event);
    }
}

fn phase_filter<F>(
    phase: StreamPhase,
    handler: F,
) -> impl Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    move |msg: &Message| {
        if msg.phase == phase {
            handler(msg)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market_data::{Candle, MarketPayload, PriceChange, Ticker};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Decoder that yields pre-built frames regardless of input.
    struct ScriptedDecoder(Vec<InboundFrame>);

    impl FrameDecoder for ScriptedDecoder {
        fn decode(&self, _raw: &[u8], _received_at: DateTime<Utc>) -> Vec<InboundFrame> {
            self.0.clone()
        }
    }

    fn ticker(symbol: &str) -> Message {
        Message::new(
            MarketPayload::Ticker(Ticker {
                symbol: symbol.to_string(),
                trade_price: Decimal::ONE,
                opening_price: Decimal::ONE,
                high_price: Decimal::ONE,
                low_price: Decimal::ONE,
                prev_closing_price: Decimal::ONE,
                change: PriceChange::Even,
                signed_change_rate: Decimal::ZERO,
                acc_trade_volume_24h: Decimal::ONE,
                acc_trade_price_24h: Decimal::ONE,
                timestamp: Utc::now(),
            }),
            StreamPhase::Realtime,
            Utc::now(),
        )
    }

    fn candle(phase: StreamPhase) -> Message {
        Message::new(
            MarketPayload::Candle(Candle {
                symbol: "SYM-A".to_string(),
                timeframe: Timeframe::Minute1,
                open_time: Utc::now(),
                open: Decimal::ONE,
                high: Decimal::ONE,
                low: Decimal::ONE,
                close: Decimal::ONE,
                volume: Decimal::ONE,
                quote_volume: Decimal::ONE,
            }),
            phase,
            Utc::now(),
        )
    }

    fn router(frames: Vec<InboundFrame>) -> MessageRouter {
        MessageRouter::new(Arc::new(ScriptedDecoder(frames)))
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let router = router(vec![InboundFrame::Market(ticker("SYM-A"))]);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            router.add_handler(DataType::Ticker, move |_| {
                order.lock().push(i);
                Ok(())
            });
        }

        let summary = router.on_frame(b"{}");
        assert_eq!(summary.messages, 1);
        assert_eq!(summary.delivered, 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(router.last_delivery().is_some());
    }

    #[test]
    fn failing_and_panicking_handlers_are_isolated() {
        let router = router(vec![InboundFrame::Market(ticker("SYM-A"))]);
        let reached = Arc::new(AtomicUsize::new(0));

        router.add_handler(DataType::Ticker, |_| Err("boom".into()));
        router.add_handler(DataType::Ticker, |_| panic!("handler bug"));
        let counter = Arc::clone(&reached);
        router.add_handler(DataType::Ticker, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let summary = router.on_frame(b"{}");
        assert_eq!(summary.handler_failures, 2);
        assert_eq!(summary.delivered, 1);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_only_see_their_data_type() {
        let router = router(vec![InboundFrame::Market(ticker("SYM-A"))]);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        router.add_handler(DataType::Trade, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = Arc::clone(&hits);
        router.add_handler_for_all(move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });

        router.on_frame(b"{}");
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn phase_filters() {
        let router = router(vec![
            InboundFrame::Market(candle(StreamPhase::Realtime)),
            InboundFrame::Market(candle(StreamPhase::Snapshot)),
        ]);
        let snapshots = Arc::new(AtomicUsize::new(0));
        let realtime = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(AtomicUsize::new(0));
        let dt = DataType::Candle(Timeframe::Minute1);

        let c = Arc::clone(&snapshots);
        router.add_snapshot_handler(dt, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let c = Arc::clone(&realtime);
        router.add_realtime_handler(dt, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let c = Arc::clone(&completions);
        router.add_completion_handler(dt, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        router.on_frame(b"[]");
        assert_eq!(snapshots.load(Ordering::SeqCst), 1);
        assert_eq!(realtime.load(Ordering::SeqCst), 1);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_candle_publishes_window_closed() {
        let router = router(vec![InboundFrame::Market(candle(StreamPhase::Snapshot))]);
        let mut events = router.subscribe_window_events();
        router.on_frame(b"{}");
        let event = events.try_recv().unwrap();
        assert_eq!(event.symbol, "SYM-A");
        assert_eq!(event.timeframe, Timeframe::Minute1);
    }

    #[test]
    fn non_market_frames_are_reported() {
        let router = router(vec![
            InboundFrame::Status("UP".to_string()),
            InboundFrame::ExchangeError {
                name: "INVALID_PARAM".to_string(),
                message: "bad".to_string(),
            },
            InboundFrame::Unrecognized {
                reason: "no type".to_string(),
            },
        ]);
        let summary = router.on_frame(b"{}");
        assert_eq!(summary.messages, 0);
        assert_eq!(summary.statuses, vec!["UP".to_string()]);
        assert_eq!(summary.exchange_errors.len(), 1);
        assert_eq!(summary.protocol_errors[0].reason, "no type");
        assert!(router.last_delivery().is_none());
    }
}
