//! Port Interfaces
//!
//! Contracts between the application services and the outside world,
//! following the Hexagonal Architecture pattern. Infrastructure adapters
//! implement them; tests substitute in-memory fakes.
//!
//! ## Driven Ports (Outbound)
//!
//! - `StreamTransport`: Raw WebSocket-style frame transport
//! - `FrameDecoder`: Exchange-specific inbound frame decoding
//! - `BatchClient`: Batch/history REST API
//! - `CacheStore`: Persistent cache tier
//! - `StreamPath`: The live stream as seen by the router
//!
//! ## Driver Ports (Inbound)
//!
//! - `DataService`: Request/response data access
//! - `ServiceFactory`: Rebuilds a `DataService`

mod batch_port;
mod cache_store_port;
mod data_service_port;
mod decoder_port;
mod stream_port;
mod transport_port;

pub use batch_port::{BatchClient, UpstreamError};
pub use cache_store_port::{CacheStore, StoreError};
pub use data_service_port::{DataService, ServiceError, ServiceFactory};
pub use decoder_port::{FrameDecoder, UpstreamProtocolError};
pub use stream_port::StreamPath;
pub use transport_port::{ConnectionError, FrameSink, FrameStream, StreamTransport, WireFrame};
