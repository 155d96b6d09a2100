//! Stream Codec
//!
//! Decodes exchange stream frames into [`InboundFrame`] values. Frames arrive
//! as text or binary, both carrying JSON: a single object or an array of
//! objects. Each element is classified once, by its `type` tag when present,
//! otherwise by field shape.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::messages::{
    CandleMessage, ErrorMessage, OrderbookMessage, StatusMessage, TickerMessage, TradeMessage,
};
use crate::application::ports::FrameDecoder;
use crate::domain::market_data::{DataType, InboundFrame, MarketPayload, Message, StreamPhase};
use crate::domain::timeframe::Timeframe;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown `type` tag.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Shape matched no known message.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON decoder for the exchange stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamDecoder;

impl StreamDecoder {
    /// Create a new decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode every element of a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON at all. Per-element failures
    /// are reported as [`InboundFrame::Unrecognized`] instead.
    pub fn decode_frame(
        &self,
        raw: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<InboundFrame>, CodecError> {
        let value: Value = serde_json::from_slice(raw)?;
        let elements = match value {
            Value::Array(items) => items,
            Value::Object(_) => vec![value],
            other => {
                return Err(CodecError::InvalidFormat(format!(
                    "expected JSON array or object, got {}",
                    kind_of(&other)
                )));
            }
        };

        Ok(elements
            .into_iter()
            .map(|element| {
                decode_element(element, received_at).unwrap_or_else(|e| InboundFrame::Unrecognized {
                    reason: e.to_string(),
                })
            })
            .collect())
    }
}

impl FrameDecoder for StreamDecoder {
    fn decode(&self, raw: &[u8], received_at: DateTime<Utc>) -> Vec<InboundFrame> {
        self.decode_frame(raw, received_at)
            .unwrap_or_else(|e| vec![InboundFrame::Unrecognized { reason: e.to_string() }])
    }
}

fn decode_element(value: Value, received_at: DateTime<Utc>) -> Result<InboundFrame, CodecError> {
    if value.get("status").is_some() {
        let status: StatusMessage = serde_json::from_value(value)?;
        return Ok(InboundFrame::Status(status.status));
    }
    if value.get("error").is_some() {
        let error: ErrorMessage = serde_json::from_value(value)?;
        return Ok(InboundFrame::ExchangeError {
            name: error.error.name,
            message: error.error.message,
        });
    }

    let phase = StreamPhase::from_tag(value.get("stream_type").and_then(Value::as_str));
    let data_type = infer_data_type(&value)?;
    let payload = match data_type {
        DataType::Ticker => MarketPayload::Ticker(serde_json::from_value::<TickerMessage>(value)?.into_domain()),
        DataType::Trade => MarketPayload::Trade(serde_json::from_value::<TradeMessage>(value)?.into_domain()),
        DataType::Orderbook => {
            MarketPayload::Orderbook(serde_json::from_value::<OrderbookMessage>(value)?.into_domain())
        }
        DataType::Candle(tf) => {
            let candle: CandleMessage = serde_json::from_value(value)?;
            MarketPayload::Candle(
                candle
                    .into_domain(tf)
                    .map_err(|e| CodecError::InvalidFormat(format!("candle_date_time_utc: {e}")))?,
            )
        }
    };
    Ok(InboundFrame::Market(Message::new(payload, phase, received_at)))
}

/// Explicit tag first, then field shape.
fn infer_data_type(value: &Value) -> Result<DataType, CodecError> {
    if let Some(tag) = value.get("type").and_then(Value::as_str) {
        return tag
            .parse::<DataType>()
            .map_err(|_| CodecError::UnknownMessageType(tag.to_string()));
    }

    let has = |field: &str| value.get(field).is_some();
    if has("ask_bid") && has("sequential_id") {
        Ok(DataType::Trade)
    } else if has("orderbook_units") {
        Ok(DataType::Orderbook)
    } else if has("candle_date_time_utc") {
        value
            .get("unit")
            .and_then(Value::as_u64)
            .and_then(|unit| {
                Timeframe::ALL
                    .into_iter()
                    .find(|tf| tf.minute_unit().map(u64::from) == Some(unit))
            })
            .map(DataType::Candle)
            .ok_or_else(|| CodecError::InvalidFormat("candle without type or unit".to_string()))
    } else if has("acc_trade_volume_24h") || has("change") {
        Ok(DataType::Ticker)
    } else {
        Err(CodecError::InvalidFormat("no type tag and no known field shape".to_string()))
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
