use crate::error::StreamError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Opens push-feed connections for one instrument.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self, instrument: &str) -> Result<Box<dyn FeedConnection>, StreamError>;
}

/// An open push-feed connection carrying text frames.
#[async_trait]
pub trait FeedConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError>;

    /// Next inbound text frame. `None` once the peer has closed the connection.
    async fn next_text(&mut self) -> Option<Result<String, StreamError>>;

    async fn close(&mut self) {}
}

/// WebSocket transport connecting to `{url}?stock_code={instrument}`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn endpoint(&self, instrument: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}stock_code={}", self.url, separator, instrument)
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, instrument: &str) -> Result<Box<dyn FeedConnection>, StreamError> {
        let url = self.endpoint(instrument);
        debug!(url = %url, "Connecting to WebSocket");

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        info!(url = %url, "WebSocket connected");
        Ok(Box::new(WsConnection { stream: ws_stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, StreamError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(data))) => {
                    warn!(bytes = data.len(), "Received unexpected binary message");
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(StreamError::Transport(e.to_string())));
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    info!("WebSocket closed by server");
                    return None;
                }
                Some(Err(e)) => return Some(Err(StreamError::Transport(e.to_string()))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}
