//! Exchange Adapters
//!
//! Stream and batch access to the exchange:
//!
//! - **Stream**: `tokio-tungstenite` transport, JSON frame decoder, and the
//!   connection worker that owns the socket
//! - **Batch**: `reqwest` REST client for history and snapshots
//! - **Direct**: the degraded-mode data service on the REST client

pub mod codec;
pub mod connection;
pub mod direct;
pub mod feed;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod rest;
pub mod transport;

pub use codec::{CodecError, StreamDecoder};
pub use connection::{
    ConnectionCommand, ConnectionConfig, ConnectionHandle, ConnectionWorker, spawn_connection,
};
pub use direct::DirectClient;
pub use feed::ExchangeFeed;
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use rest::RestClient;
pub use transport::WebSocketTransport;
