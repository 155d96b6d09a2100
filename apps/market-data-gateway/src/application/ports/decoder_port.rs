//! Frame Decoder Port
//!
//! Exchange-specific decoding of one inbound frame into domain values.

use chrono::{DateTime, Utc};

use crate::domain::market_data::InboundFrame;

/// Malformed or unexpected inbound data. Logged and dropped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("upstream protocol error: {reason}")]
pub struct UpstreamProtocolError {
    /// What was wrong with the frame.
    pub reason: String,
}

/// Decodes raw frame bytes.
///
/// A frame may carry one object or an array of objects; each element yields
/// one [`InboundFrame`]. Undecodable input yields
/// [`InboundFrame::Unrecognized`] rather than an error.
pub trait FrameDecoder: Send + Sync {
    /// Decode a raw frame received at `received_at`.
    fn decode(&self, raw: &[u8], received_at: DateTime<Utc>) -> Vec<InboundFrame>;
}
