//! WebSocket change feed.
//!
//! Each text or binary frame carries one JSON [`ChangeNotification`].
//! Frames that do not parse are logged and skipped so that one bad message
//! does not cost the connection.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{ChangeFeed, ChangeNotification, ChangeStream};
use crate::error::{SyncError, SyncResult};

/// Change feed served over a WebSocket.
#[derive(Debug, Clone)]
pub struct WsChangeFeed {
    url: String,
}

impl WsChangeFeed {
    pub fn new(url: impl Into<String>) -> SyncResult<Self> {
        let url = url.into();
        let parsed = url::Url::parse(&url)?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl(format!(
                "realtime url must be ws:// or wss://, got {}",
                parsed.scheme()
            )));
        }
        Ok(WsChangeFeed { url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChangeFeed for WsChangeFeed {
    async fn connect(&self) -> SyncResult<Box<dyn ChangeStream>> {
        let (socket, response) = connect_async(self.url.as_str()).await?;
        debug!(status = ?response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsChangeStream { socket }))
    }
}

struct WsChangeStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

fn parse(bytes: &[u8]) -> Option<ChangeNotification> {
    match serde_json::from_slice(bytes) {
        Ok(notification) => Some(notification),
        Err(e) => {
            warn!(error = %e, "Skipping malformed change notification");
            None
        }
    }
}

#[async_trait]
impl ChangeStream for WsChangeStream {
    async fn next(&mut self) -> Option<SyncResult<ChangeNotification>> {
        loop {
            let frame = match self.socket.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(SyncError::from(e))),
            };

            let parsed = match frame {
                WsMessage::Text(text) => parse(text.as_bytes()),
                WsMessage::Binary(data) => parse(&data),
                WsMessage::Close(frame) => {
                    info!(?frame, "Change feed sent close frame");
                    return None;
                }
                // Pongs are answered by tungstenite on the next read.
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => None,
            };

            if let Some(notification) = parsed {
                return Some(Ok(notification));
            }
        }
    }
}
