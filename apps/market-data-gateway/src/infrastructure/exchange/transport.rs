//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::future::ready;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::application::ports::{ConnectionError, FrameSink, FrameStream, StreamTransport, WireFrame};

/// Opens TLS WebSocket sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), ConnectionError> {
        let (ws, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws.split();
        let sink = write
            .sink_map_err(|e| ConnectionError::Send(e.to_string()))
            .with(|frame: WireFrame| ready(Ok::<_, ConnectionError>(to_message(frame))));
        let stream = read.filter_map(|item| {
            ready(match item {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(ConnectionError::Receive(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
        WireFrame::Ping(payload) => Message::Ping(payload.into()),
        WireFrame::Pong(payload) => Message::Pong(payload.into()),
        WireFrame::Close(_) => Message::Close(None),
    }
}

/// Raw frames carry nothing the worker needs.
fn from_message(message: Message) -> Option<WireFrame> {
    match message {
        Message::Text(text) => Some(WireFrame::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => Some(WireFrame::Binary(bytes.to_vec())),
        Message::Ping(payload) => Some(WireFrame::Ping(payload.to_vec())),
        Message::Pong(payload) => Some(WireFrame::Pong(payload.to_vec())),
        Message::Close(frame) => Some(WireFrame::Close(frame.map(|f| f.reason.as_str().to_owned()))),
        Message::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_map_both_ways() {
        for frame in [
            WireFrame::Text("[{\"ticket\":\"t\"}]".to_string()),
            WireFrame::Binary(b"{}".to_vec()),
            WireFrame::Ping(vec![1]),
            WireFrame::Pong(vec![2]),
        ] {
            assert_eq!(from_message(to_message(frame.clone())), Some(frame));
        }
        assert_eq!(from_message(to_message(WireFrame::Close(None))), Some(WireFrame::Close(None)));
    }
}
