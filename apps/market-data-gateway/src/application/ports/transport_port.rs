//! Stream Transport Port (Driven Port)
//!
//! A bidirectional frame transport. The connection worker owns one pair of
//! halves per session.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, Stream};

/// Transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 payload.
    Text(String),
    /// Binary payload (the exchange sends JSON in binary frames too).
    Binary(Vec<u8>),
    /// Ping with payload.
    Ping(Vec<u8>),
    /// Pong with payload.
    Pong(Vec<u8>),
    /// Close with optional reason.
    Close(Option<String>),
}

/// Outbound half.
pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = ConnectionError> + Send>>;

/// Inbound half.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame, ConnectionError>> + Send>>;

/// Transport errors. Every variant triggers a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Connect attempt failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// An outbound call exceeded its bound.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What timed out.
        operation: &'static str,
        /// Bound that was exceeded.
        after: Duration,
    },
    /// Peer closed the connection or the stream ended.
    #[error("connection closed: {0}")]
    Closed(String),
    /// Write failed.
    #[error("send failed: {0}")]
    Send(String),
    /// Read failed.
    #[error("receive failed: {0}")]
    Receive(String),
    /// Too many unanswered heartbeats.
    #[error("heartbeat failed {consecutive} times in a row")]
    HeartbeatTimeout {
        /// Misses in a row.
        consecutive: u32,
    },
}

/// Opens transport sessions.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Connect and return the outbound and inbound halves.
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), ConnectionError>;
}
