//! Connection handling for the sync server
//!
//! [`SyncServer`] is the transport-agnostic hub: it turns connection events
//! and decoded [`ClientMessage`]s into registry and room operations. The
//! WebSocket listener at the bottom of this module feeds it one task per
//! connection, so a slow dispatch on one connection never stalls another.

use crate::client_manager::{ClientId, ClientManager, ConnectionSink};
use crate::config::ServerConfig;
use crate::room_manager::RoomManager;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::protocol::{self, ClientMessage, ServerMessage};
use shared::{Args, Result, SyncError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

pub struct SyncServer {
    rooms: Arc<RoomManager>,
    clients: Arc<RwLock<ClientManager>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(config.blueprint, config.room)),
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Registers a new connection and greets it with its id
    ///
    /// At capacity the connection is sent a rejection instead.
    pub async fn connect(&self, addr: Option<SocketAddr>, sink: ConnectionSink) -> Result<ClientId> {
        let client_id = {
            let mut clients = self.clients.write().await;
            clients.add_client(addr, sink.clone())
        };

        match client_id {
            Some(client_id) => {
                let _ = sink.send(ServerMessage::Connected {
                    client_id: client_id.clone(),
                });
                Ok(client_id)
            }
            None => {
                warn!("Rejecting connection from {:?}: server full", addr);
                let _ = sink.send(ServerMessage::Rejected {
                    reason: "Server full".to_string(),
                });
                Err(SyncError::ServerFull)
            }
        }
    }

    /// Decodes and handles one text frame; malformed frames are logged and dropped
    pub async fn handle_frame(&self, client_id: &str, text: &str) {
        match protocol::decode::<ClientMessage>(text) {
            Ok(message) => self.handle_message(client_id, message).await,
            Err(e) => warn!("Ignoring malformed frame from {}: {}", client_id, e),
        }
    }

    pub async fn handle_message(&self, client_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom { room_id } => self.join_room(client_id, &room_id).await,
            ClientMessage::LeaveRoom => self.leave_current_room(client_id).await,
            ClientMessage::DispatchCommand {
                room_id,
                action,
                args,
            } => self.dispatch(client_id, &room_id, &action, args).await,
        }
    }

    /// Leaves the connection's room and forgets it
    pub async fn disconnect(&self, client_id: &str) {
        self.leave_current_room(client_id).await;
        let mut clients = self.clients.write().await;
        clients.remove_client(client_id);
    }

    async fn join_room(&self, client_id: &str, room_id: &str) {
        let (previous, sink) = {
            let clients = self.clients.read().await;
            match clients.get(client_id) {
                Some(client) => (client.room_id.clone(), client.sink.clone()),
                None => {
                    warn!("Join from unknown connection {}", client_id);
                    return;
                }
            }
        };

        if let Some(previous) = previous.filter(|previous| previous != room_id) {
            if let Err(e) = self.rooms.leave(&previous, client_id).await {
                error!("Client {} failed to leave room {}: {}", client_id, previous, e);
            }
            self.clients.write().await.set_room(client_id, None);
        }

        match self.rooms.join(room_id, client_id, sink).await {
            Ok(_) => {
                self.clients
                    .write()
                    .await
                    .set_room(client_id, Some(room_id.to_string()));
            }
            Err(e) => error!("Client {} failed to join room {}: {}", client_id, room_id, e),
        }
    }

    async fn leave_current_room(&self, client_id: &str) {
        let previous = self.clients.write().await.set_room(client_id, None);
        if let Some(room_id) = previous {
            if let Err(e) = self.rooms.leave(&room_id, client_id).await {
                error!("Client {} failed to leave room {}: {}", client_id, room_id, e);
            }
        }
    }

    async fn dispatch(&self, client_id: &str, room_id: &str, action: &str, args: Vec<serde_json::Value>) {
        let joined = self.clients.read().await.room_of(client_id);
        if joined.as_deref() != Some(room_id) {
            warn!(
                "Client {} dispatched {} to room {} without joining it",
                client_id, action, room_id
            );
            return;
        }

        let Some(room) = self.rooms.get_room(room_id).await else {
            warn!("Dispatch of {} to missing room {}", action, room_id);
            return;
        };

        match room.dispatch(action, Args::new(args), client_id).await {
            Ok(patches) if !patches.is_empty() => {
                debug!(
                    "Broadcasting {} patch(es) for {} from {}",
                    patches.len(),
                    action,
                    client_id
                );
            }
            Ok(_) => {}
            Err(e) => error!("Dispatch of {} in room {} failed: {}", action, room_id, e),
        }
    }
}

/// Accepts WebSocket connections until the listener fails
pub async fn serve(server: Arc<SyncServer>, listener: TcpListener) -> Result<()> {
    info!("Server listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(server, stream, addr).await {
                debug!("Connection from {} ended: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(server: Arc<SyncServer>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();
    let (sink, mut outbound) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let rejected = matches!(message, ServerMessage::Rejected { .. });
            match protocol::encode(&message) {
                Ok(text) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        debug!("Failed to send to {}: {}", addr, e);
                        break;
                    }
                }
                Err(e) => error!("Failed to encode message for {}: {}", addr, e),
            }
            if rejected {
                let _ = write.close().await;
                break;
            }
        }
    });

    let client_id = match server.connect(Some(addr), sink).await {
        Ok(client_id) => client_id,
        Err(e) => {
            let _ = writer.await;
            return Err(e);
        }
    };

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => server.handle_frame(&client_id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read error from {}: {}", client_id, e);
                break;
            }
        }
    }

    server.disconnect(&client_id).await;
    writer.abort();
    Ok(())
}
