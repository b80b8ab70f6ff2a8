//! Transport abstraction for the replica runtime
//!
//! A [`Transport`] moves JSON text frames between a replica and the server.
//! A [`Connector`] opens one per connection attempt, which keeps connection
//! setup out of the runtime and lets tests plug in in-process channels.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{Result, SyncError};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A bidirectional text message channel
///
/// `recv` must be cancel-safe: the runtime polls it inside `tokio::select!`.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Sends one complete frame
    async fn send(&mut self, message: String) -> Result<()>;

    /// Returns the next frame, or None once the peer closed the connection
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Closes the connection; calling it again is a no-op
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports for the runtime
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// [`Transport`] over a WebSocket connection
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        debug!("Connecting to {}", url);
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        info!("WebSocket connection to {} established", url);

        Ok(Self {
            stream,
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<()> {
        if self.closed {
            return Err(SyncError::NotConnected);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(SyncError::Transport(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    debug!("Received close frame: {:?}", frame);
                    return None;
                }
                Message::Binary(_) => warn!("Skipping unexpected binary frame"),
                // Pings are answered by tungstenite
                _ => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }
}

/// Connects over WebSocket to the given URL
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        Ok(Box::new(WebSocketTransport::connect(url).await?))
    }
}

/// In-process [`Transport`] backed by a pair of channels
///
/// Closing one end makes the other end's `recv` return None.
#[derive(Debug)]
pub struct ChannelTransport {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    incoming: mpsc::UnboundedReceiver<String>,
}

impl ChannelTransport {
    /// Two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: Some(a_tx),
                incoming: b_rx,
            },
            Self {
                outgoing: Some(b_tx),
                incoming: a_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, message: String) -> Result<()> {
        let outgoing = self.outgoing.as_ref().ok_or(SyncError::NotConnected)?;
        outgoing
            .send(message)
            .map_err(|_| SyncError::Transport("peer closed".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        if self.outgoing.is_none() {
            return None;
        }
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.outgoing = None;
        self.incoming.close();
        Ok(())
    }
}

/// Hands out [`ChannelTransport`]s, delivering the far end of each to a listener
pub struct ChannelConnector {
    accepted: mpsc::UnboundedSender<ChannelTransport>,
}

impl ChannelConnector {
    /// Returns the connector and the stream of server-side ends
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelTransport>) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        (Self { accepted }, incoming)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>> {
        let (local, remote) = ChannelTransport::pair();
        self.accepted
            .send(remote)
            .map_err(|_| SyncError::Transport("connection refused".to_string()))?;
        Ok(Box::new(local))
    }
}
