//! WebSocket client for subscribing to a ComfyUI event feed.
//!
//! [`WsConnector`] holds the connection configuration for a single
//! ComfyUI instance. Each [`connect`](StreamConnector::connect) call opens
//! a fresh subscription addressed by the caller's client id and yields
//! its text frames as a [`FrameStream`].

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Text frames of one live subscription. The stream ends when the
/// server closes the connection.
pub type FrameStream = BoxStream<'static, Result<String, ComfyUIClientError>>;

/// Opens push subscriptions to a server's event feed.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<FrameStream, ComfyUIClientError>;
}

/// Connection settings for the ComfyUI WebSocket endpoint.
pub struct WsConnector {
    ws_url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// * `ws_url`          - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `connect_timeout` - upper bound for the handshake.
    pub fn new(ws_url: String, connect_timeout: Duration) -> Self {
        Self {
            ws_url: ws_url.trim_end_matches('/').to_string(),
            connect_timeout,
        }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Subscription address for `client_id`.
    ///
    /// ComfyUI addresses per-client messages (progress, previews) by the
    /// `clientId` query parameter.
    pub fn subscription_url(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={}", self.ws_url, client_id)
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, client_id: &str) -> Result<FrameStream, ComfyUIClientError> {
        let url = self.subscription_url(client_id);

        let handshake = tokio::time::timeout(self.connect_timeout, connect_async(&url)).await;
        let (ws_stream, _response) = match handshake {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                return Err(ComfyUIClientError::Connection(format!(
                    "Failed to connect to ComfyUI at {}: {e}",
                    self.ws_url
                )))
            }
            Err(_) => {
                return Err(ComfyUIClientError::Connection(format!(
                    "Timed out after {:?} connecting to ComfyUI at {}",
                    self.connect_timeout, self.ws_url
                )))
            }
        };

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        let frames = ws_stream
            .take_while(|msg| {
                if let Ok(Message::Close(frame)) = msg {
                    tracing::info!(?frame, "ComfyUI WebSocket closed");
                }
                futures::future::ready(!matches!(msg, Ok(Message::Close(_))))
            })
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    // Binary frames carry preview images; ping/pong is
                    // answered by tungstenite.
                    Ok(_) => None,
                    Err(e) => Some(Err(ComfyUIClientError::Protocol(e.to_string()))),
                }
            });

        Ok(frames.boxed())
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A receive error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
