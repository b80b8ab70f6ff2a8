//! Connection registry for the sync server
//!
//! This module tracks every live transport connection, including:
//! - Connection ids (`c1`, `c2`, ...) assigned in arrival order
//! - The outbound message sink used to reach each connection
//! - The room each connection has joined, if any
//! - Server capacity enforcement
//!
//! Room membership itself is owned by the rooms. The registry only remembers
//! which room a connection asked for so that it can be left on disconnect.

use log::info;
use shared::ServerMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Server-assigned connection identifier
pub type ClientId = String;

/// Outbound queue feeding one connection's writer
pub type ConnectionSink = mpsc::UnboundedSender<ServerMessage>;

/// A live connection and where it currently belongs
#[derive(Debug)]
pub struct Client {
    /// Unique connection identifier assigned by the server
    pub id: ClientId,
    /// Remote address, absent for in-process connections
    pub addr: Option<SocketAddr>,
    /// Room this connection has joined
    pub room_id: Option<String>,
    /// Queue for messages addressed to this connection
    pub sink: ConnectionSink,
}

impl Client {
    pub fn new(id: ClientId, addr: Option<SocketAddr>, sink: ConnectionSink) -> Self {
        Self {
            id,
            addr,
            room_id: None,
            sink,
        }
    }
}

/// Manages all live connections
///
/// The ClientManager hands out connection ids, enforces the server's capacity
/// limit and remembers each connection's joined room.
pub struct ClientManager {
    /// Live connections indexed by id
    clients: HashMap<ClientId, Client>,
    /// Counter behind the next `c<n>` id
    next_client_id: u32,
    /// Maximum number of concurrent connections allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates an empty registry with the given capacity limit
    ///
    /// Connection ids start from `c1` and are never reused.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to register a new connection
    ///
    /// Returns Some(client_id) if successful, None if the server is at capacity.
    pub fn add_client(&mut self, addr: Option<SocketAddr>, sink: ConnectionSink) -> Option<ClientId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = format!("c{}", self.next_client_id);
        self.next_client_id += 1;

        match addr {
            Some(addr) => info!("Client {} connected from {}", client_id, addr),
            None => info!("Client {} connected", client_id),
        }
        self.clients
            .insert(client_id.clone(), Client::new(client_id.clone(), addr, sink));

        Some(client_id)
    }

    /// Removes a connection, returning it so the caller can leave its room
    pub fn remove_client(&mut self, client_id: &str) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        match client.addr {
            Some(addr) => info!("Client {} ({}) disconnected", client.id, addr),
            None => info!("Client {} disconnected", client.id),
        }
        Some(client)
    }

    pub fn get(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    /// Records the joined room and returns the one it replaces
    pub fn set_room(&mut self, client_id: &str, room_id: Option<String>) -> Option<String> {
        let client = self.clients.get_mut(client_id)?;
        std::mem::replace(&mut client.room_id, room_id)
    }

    pub fn room_of(&self, client_id: &str) -> Option<String> {
        self.clients.get(client_id)?.room_id.clone()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn create_test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn sink() -> (ConnectionSink, mpsc::UnboundedReceiver<ServerMessage>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new(4);
        assert_eq!(manager.len(), 0);
        assert!(manager.is_empty());
        assert_eq!(manager.max_clients(), 4);
    }

    #[test]
    fn test_add_client_assigns_sequential_ids() {
        let mut manager = ClientManager::new(4);
        let (tx, _rx) = sink();

        let first = manager.add_client(Some(create_test_addr(8080)), tx.clone());
        let second = manager.add_client(None, tx);

        assert_eq!(first.as_deref(), Some("c1"));
        assert_eq!(second.as_deref(), Some("c2"));
        assert_eq!(manager.get("c1").unwrap().addr, Some(create_test_addr(8080)));
        assert_eq!(manager.get("c2").unwrap().addr, None);
        assert_eq!(manager.len(), 2);
        assert!(!manager.is_empty());
    }

    #[test]
    fn test_add_client_at_capacity() {
        let mut manager = ClientManager::new(2);
        let (tx, _rx) = sink();

        assert!(manager.add_client(None, tx.clone()).is_some());
        assert!(manager.add_client(None, tx.clone()).is_some());
        assert!(manager.add_client(None, tx).is_none());
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut manager = ClientManager::new(1);
        let (tx, _rx) = sink();

        let first = manager.add_client(None, tx.clone()).unwrap();
        assert!(manager.remove_client(&first).is_some());
        let second = manager.add_client(None, tx).unwrap();

        assert_eq!(first, "c1");
        assert_eq!(second, "c2");
    }

    #[test]
    fn test_remove_client() {
        let mut manager = ClientManager::new(4);
        let (tx, _rx) = sink();
        let id = manager.add_client(None, tx).unwrap();
        manager.set_room(&id, Some("lobby".to_string()));

        let removed = manager.remove_client(&id).unwrap();
        assert_eq!(removed.room_id.as_deref(), Some("lobby"));
        assert!(manager.remove_client(&id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_room_tracking() {
        let mut manager = ClientManager::new(4);
        let (tx, _rx) = sink();
        let a = manager.add_client(None, tx.clone()).unwrap();
        let b = manager.add_client(None, tx).unwrap();

        assert_eq!(manager.set_room(&a, Some("r1".to_string())), None);
        manager.set_room(&b, Some("r1".to_string()));

        let previous = manager.set_room(&a, Some("r2".to_string()));
        assert_eq!(previous.as_deref(), Some("r1"));
        assert_eq!(manager.room_of(&a).as_deref(), Some("r2"));
        assert_eq!(manager.room_of(&b).as_deref(), Some("r1"));

        assert_eq!(manager.set_room(&b, None).as_deref(), Some("r1"));
        assert_eq!(manager.room_of(&b), None);

        assert_eq!(manager.set_room("c99", None), None);
    }
}
