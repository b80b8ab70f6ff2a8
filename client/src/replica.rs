//! Client-side state replica
//!
//! The replica runs actions optimistically against its own store and then
//! conforms to whatever the server sends. It holds no transport: callers feed
//! it server messages and forward the client messages it hands back.
//!
//! Every connection attempt gets a new generation. Messages tagged with an
//! older generation come from a connection that has since been torn down and
//! are discarded.

use log::{debug, info, warn};
use serde_json::Value;
use shared::{Args, Blueprint, ClientMessage, Patch, Result, ServerMessage, Store};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

pub struct Replica {
    store: Store,
    status: ConnectionStatus,
    client_id: Option<String>,
    room_id: Option<String>,
    local_only: BTreeSet<String>,
    generation: u64,
}

impl Replica {
    pub fn new(blueprint: &Blueprint, local_only: BTreeSet<String>) -> Self {
        Self {
            store: blueprint.instantiate(),
            status: ConnectionStatus::Disconnected,
            client_id: None,
            room_id: None,
            local_only,
            generation: 0,
        }
    }

    /// Data fields, without actions or connection bookkeeping
    pub fn state(&self) -> Value {
        self.store.snapshot()
    }

    pub fn data(&self) -> &Value {
        self.store.data()
    }

    pub fn version(&self) -> u64 {
        self.store.version()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_local_only(&self, action: &str) -> bool {
        self.local_only.contains(action)
    }

    /// Starts a new connection attempt and returns its generation
    pub fn begin_connect(&mut self, room_id: &str) -> u64 {
        self.generation += 1;
        self.status = ConnectionStatus::Connecting;
        self.client_id = None;
        self.room_id = Some(room_id.to_string());
        self.generation
    }

    /// Tears down the current connection; its late messages will be discarded
    pub fn disconnect(&mut self) {
        self.generation += 1;
        self.reset();
    }

    /// The transport of `generation` closed
    ///
    /// Returns false if that connection was already superseded.
    pub fn connection_lost(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        if self.status != ConnectionStatus::Disconnected {
            info!("Disconnected from server");
        }
        self.reset();
        true
    }

    fn reset(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.client_id = None;
        self.room_id = None;
    }

    /// Applies one server message
    ///
    /// Returns the message to send back, if any. Stale messages are dropped.
    pub fn receive(&mut self, generation: u64, message: ServerMessage) -> Option<ClientMessage> {
        if generation != self.generation {
            debug!("Discarding message from superseded connection {}", generation);
            return None;
        }

        match message {
            ServerMessage::Connected { client_id } => {
                let room_id = self.room_id.clone()?;
                info!("Connected! Client ID: {}", client_id);
                self.status = ConnectionStatus::Connected;
                self.client_id = Some(client_id);
                Some(ClientMessage::JoinRoom { room_id })
            }
            ServerMessage::InitialState { room_id, state } => {
                if self.accepts(&room_id) {
                    self.store.replace_data(state);
                    debug!("Received snapshot of room {}", room_id);
                }
                None
            }
            ServerMessage::Patch { room_id, patches } => {
                if self.accepts(&room_id) {
                    let report = self.store.apply_patches(&patches);
                    if report.skipped > 0 {
                        warn!(
                            "Skipped {} of {} patch(es) from room {}",
                            report.skipped,
                            patches.len(),
                            room_id
                        );
                    }
                }
                None
            }
            ServerMessage::Rejected { reason } => {
                warn!("Disconnected: {}", reason);
                self.reset();
                None
            }
        }
    }

    fn accepts(&self, room_id: &str) -> bool {
        if self.room_id.as_deref() == Some(room_id) {
            return true;
        }
        warn!(
            "Ignoring update for room {} while in {:?}",
            room_id, self.room_id
        );
        false
    }

    /// Runs an action optimistically
    ///
    /// Returns the local patches and, when connected to a room and the action
    /// is networked, the dispatch to forward to the server. A failing action
    /// changes nothing and is not forwarded.
    pub fn call(&mut self, action: &str, args: Args) -> Result<(Vec<Patch>, Option<ClientMessage>)> {
        let patches = self
            .store
            .dispatch_as(action, &args, None, self.client_id.as_deref())?;

        let outbound = match (&self.status, &self.room_id) {
            (ConnectionStatus::Connected, Some(room_id)) if !self.is_local_only(action) => {
                Some(ClientMessage::DispatchCommand {
                    room_id: room_id.clone(),
                    action: action.to_string(),
                    args: args.into_inner(),
                })
            }
            _ => None,
        };
        Ok((patches, outbound))
    }
}
