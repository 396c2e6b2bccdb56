/// WebSocket transport for the connection supervisor
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::{ClientMessage, CollaborationError, Connector, Result, ServerMessage, Transport};

/// Connects to a collaboration server by URL (`ws://host:port`)
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| CollaborationError::NetworkError(format!("{}: {e}", self.url)))?;
        debug!(url = %self.url, "websocket connected");
        Ok(Box::new(WsTransport { stream }))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = message.to_json()?;
        self.stream
            .send(Message::Text(json))
            .await
            .map_err(|e| CollaborationError::ConnectionLost(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(CollaborationError::ConnectionLost(e.to_string()))),
            };
            match frame {
                Message::Text(text) => return Some(ServerMessage::from_json(&text)),
                Message::Binary(bytes) => {
                    return Some(
                        serde_json::from_slice(&bytes).map_err(CollaborationError::from),
                    )
                }
                Message::Close(frame) => {
                    debug!(?frame, "server closed websocket");
                    return None;
                }
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| CollaborationError::NetworkError(e.to_string()))
    }
}
