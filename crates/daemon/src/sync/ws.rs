// WebSocket feed transport over tokio-tungstenite.
//
// Frames are JSON `FeedMessage`s. `connect` opens the socket and sends the
// channel join; the join acknowledgement surfaces as the first status
// event. Undecodable frames are logged and skipped rather than tearing the
// subscription down.

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use notelens_common::protocol::feed::FeedMessage;

use super::listener::{ChannelStatus, FeedEvent, FeedTransport};

pub const DEFAULT_FEED_URL: &str = "wss://feed.notelens.app/v1/ws";

/// Channel name joined by the plugin; the token scopes it to one identity.
pub const PLUGIN_CHANNEL: &str = "plugin";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsFeedTransport {
    url: String,
    channel: String,
    socket: Option<Socket>,
}

impl WsFeedTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), channel: PLUGIN_CHANNEL.to_string(), socket: None }
    }

    async fn send(&mut self, message: &FeedMessage) -> Result<()> {
        let socket = self.socket.as_mut().ok_or_else(|| anyhow!("feed socket not connected"))?;
        let encoded = serde_json::to_string(message).context("failed to encode feed frame")?;
        socket.send(Message::text(encoded)).await.context("failed to send feed frame")
    }
}

/// Map a wire message to a listener event. `None` for frames the listener
/// has no interest in (heartbeats, client-only frames).
fn translate(message: FeedMessage) -> Option<FeedEvent> {
    match message {
        FeedMessage::JoinAck { .. } => Some(FeedEvent::Status(ChannelStatus::Subscribed)),
        FeedMessage::NotebookChange { kind, row } => Some(FeedEvent::Notebook { kind, row }),
        FeedMessage::NoteChange { kind, row } => Some(FeedEvent::Note { kind, row }),
        FeedMessage::NoteContent { frame } => Some(FeedEvent::Content(frame)),
        FeedMessage::Error { code, message } => {
            debug!(%code, %message, "feed channel error frame");
            Some(FeedEvent::Status(ChannelStatus::ChannelError))
        }
        FeedMessage::Heartbeat | FeedMessage::Join { .. } => None,
    }
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn connect(&mut self, token: &str) -> Result<()> {
        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect to feed at {}", self.url))?;
        self.socket = Some(socket);
        self.send(&FeedMessage::Join {
            token: token.to_string(),
            channel: self.channel.clone(),
        })
        .await
    }

    async fn next_event(&mut self) -> Result<Option<FeedEvent>> {
        let socket = self.socket.as_mut().ok_or_else(|| anyhow!("feed socket not connected"))?;
        loop {
            match socket.next().await {
                None => return Ok(None),
                Some(Err(error)) => return Err(error).context("feed socket failed"),
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<FeedMessage>(text.as_str()) {
                        Ok(message) => {
                            if let Some(event) = translate(message) {
                                return Ok(Some(event));
                            }
                        }
                        Err(error) => {
                            debug!(%error, "skipping undecodable feed frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Pings and pongs are handled by tungstenite itself;
                // binary frames are not part of the protocol.
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }
}
