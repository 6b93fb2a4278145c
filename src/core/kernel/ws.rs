use crate::core::errors::StreamError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, instrument, warn};

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000, // 10 seconds
        }
    }
}

/// Message-oriented duplex transport - pure transport layer.
///
/// `receive` is expected to be cancel-safe: the connection task polls it
/// inside `tokio::select!` next to the heartbeat timer and outbound queue.
#[async_trait]
pub trait StreamTransport: Send {
    /// Open the connection to `url`, replacing any previous one
    async fn connect(&mut self, url: &str) -> Result<(), StreamError>;

    /// Send a text frame
    async fn send(&mut self, text: String) -> Result<(), StreamError>;

    /// Wait for the next text frame. `None` means the peer closed the stream.
    async fn receive(&mut self) -> Option<Result<String, StreamError>>;

    /// Send a keepalive
    async fn ping(&mut self) -> Result<(), StreamError> {
        self.send(r#"{"type":"heartbeat"}"#.to_string()).await
    }

    /// Close the connection
    async fn close(&mut self) -> Result<(), StreamError>;

    fn is_connected(&self) -> bool;
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Tungstenite-based transport
pub struct TungsteniteTransport {
    stream: Option<WsStream>,
    config: WsConfig,
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self {
            stream: None,
            config: WsConfig::default(),
        }
    }

    /// Set custom WebSocket configuration
    pub fn with_config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }

    fn stream_mut(&mut self) -> Result<&mut WsStream, StreamError> {
        self.stream
            .as_mut()
            .ok_or_else(|| StreamError::ConnectionError("WebSocket not connected".to_string()))
    }
}

#[async_trait]
impl StreamTransport for TungsteniteTransport {
    #[instrument(skip(self), fields(url = %url))]
    async fn connect(&mut self, url: &str) -> Result<(), StreamError> {
        if let Some(mut previous) = self.stream.take() {
            let _ = previous.close(None).await;
        }

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| StreamError::ConnectionError("WebSocket connection timeout".to_string()))?
            .map_err(|e| {
                StreamError::ConnectionError(format!("WebSocket connection failed: {}", e))
            })?;

        debug!("WebSocket connected");
        self.stream = Some(ws_stream);
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        let stream = self.stream_mut()?;
        if let Err(e) = stream.send(Message::Text(text)).await {
            self.stream = None;
            return Err(StreamError::ConnectionError(format!(
                "Failed to send WebSocket message: {}",
                e
            )));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Option<Result<String, StreamError>> {
        loop {
            let stream = self.stream.as_mut()?;
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(data))) => {
                    return Some(String::from_utf8(data).map_err(|e| {
                        StreamError::ParseError(format!("Invalid UTF-8 in binary message: {}", e))
                    }));
                }
                Some(Ok(Message::Ping(data))) => {
                    // Auto-respond to pings at transport level
                    if let Err(e) = stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong response: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by peer");
                    self.stream = None;
                    return None;
                }
                Some(Err(e)) => {
                    self.stream = None;
                    return Some(Err(StreamError::ConnectionError(format!(
                        "WebSocket error: {}",
                        e
                    ))));
                }
                None => {
                    self.stream = None;
                    return None;
                }
            }
        }
    }

    async fn ping(&mut self) -> Result<(), StreamError> {
        let stream = self.stream_mut()?;
        if let Err(e) = stream.send(Message::Ping(Vec::new())).await {
            self.stream = None;
            return Err(StreamError::ConnectionError(format!(
                "Failed to send ping: {}",
                e
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
