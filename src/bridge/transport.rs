//! Component A — framed JSON transport.
//!
//! Wraps a websocket byte stream with JSON encode/decode, a keepalive
//! ping loop, and close detection. Grounded on the teacher's use of
//! `tokio-tungstenite` for both the extension-bridge accept loop and its
//! own CDP client connections (`extension_bridge.rs`, `cdp_http.rs`).

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{BridgeError, Result};

/// One event yielded by [`FramedTransport::receive`].
#[derive(Debug)]
pub enum Frame {
    /// Successfully decoded JSON text frame.
    Json(Value),
    /// A text frame that was not valid JSON. The transport keeps running;
    /// callers decide whether this warrants a reply.
    ParseError(String),
    /// The peer closed the connection, or a fatal transport error occurred.
    Closed,
}

/// A bidirectional JSON message stream over a single websocket connection.
pub struct FramedTransport {
    inner: WebSocketStream<TcpStream>,
}

impl FramedTransport {
    pub fn new(inner: WebSocketStream<TcpStream>) -> Self {
        Self { inner }
    }

    /// Serialize `msg` and send it as one text frame.
    pub async fn send(&mut self, msg: &impl Serialize) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.send_raw(text).await
    }

    /// Send an already-serialized JSON string as one text frame, verbatim.
    /// Used on paths that queue pre-rendered frames (the outbound channel
    /// every client handle writes through) so they are never re-encoded.
    pub async fn send_raw(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| BridgeError::TransportClosed)
    }

    pub async fn send_ping(&mut self) -> Result<()> {
        self.inner
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|_| BridgeError::TransportClosed)
    }

    /// Receive the next application-level frame. Returns `Frame::Closed`
    /// once the stream is exhausted; never produces anything after that
    /// (the underlying sequence is finite and not restartable).
    pub async fn receive(&mut self) -> Frame {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => {
                    return match serde_json::from_str::<Value>(text.as_str()) {
                        Ok(v) => Frame::Json(v),
                        Err(_) => Frame::ParseError(text.to_string()),
                    };
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Frame::Closed,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return Frame::Closed,
                None => return Frame::Closed,
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_frame_does_not_end_the_stream_semantics() {
        // `Frame::ParseError` is a distinct variant from `Frame::Closed` so
        // callers can tell "bad frame, keep going" from "peer is gone".
        let f = Frame::ParseError("not json".to_string());
        assert!(matches!(f, Frame::ParseError(_)));
    }
}
