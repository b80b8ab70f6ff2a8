use crate::config::ClientConfig;
use crate::replica::{ConnectionStatus, Replica};
use crate::transport::{Connector, Transport, WebSocketConnector};
use log::{debug, error, info, warn};
use serde_json::Value;
use shared::protocol::{self, ClientMessage, ServerMessage};
use shared::{Args, Blueprint, Patch, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

struct Connection {
    generation: u64,
    commands: mpsc::UnboundedSender<ClientMessage>,
}

struct Inner {
    replica: Mutex<Replica>,
    connection: Mutex<Option<Connection>>,
    changes: watch::Sender<u64>,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    auto_connected: AtomicBool,
}

impl Inner {
    fn replica(&self) -> MutexGuard<'_, Replica> {
        self.replica.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|counter| *counter += 1);
    }

    fn receive(&self, generation: u64, message: ServerMessage) -> Option<ClientMessage> {
        let (reply, changed) = {
            let mut replica = self.replica();
            if replica.generation() != generation {
                debug!("Discarding message from superseded connection {}", generation);
                return None;
            }
            let before = (replica.version(), replica.status());
            let reply = replica.receive(generation, message);
            (reply, before != (replica.version(), replica.status()))
        };

        if changed {
            self.notify();
        }
        reply
    }

    fn connection_lost(&self, generation: u64) {
        let lost = {
            let mut replica = self.replica();
            let lost = replica.connection_lost(generation);
            if lost {
                self.release_connection(generation);
            }
            lost
        };
        if lost {
            self.notify();
        }
    }

    /// Drops the command sender of `generation`, leaving any newer connection alone
    fn release_connection(&self, generation: u64) {
        let mut connection = self.connection();
        if connection.as_ref().is_some_and(|c| c.generation == generation) {
            connection.take();
        }
    }
}

/// Handle to a replica and its connection
///
/// Cloning the handle shares the same replica. Methods that open a
/// connection must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

impl SyncClient {
    /// A replica that connects over WebSocket
    pub fn new(blueprint: &Blueprint, config: ClientConfig) -> Self {
        Self::with_connector(blueprint, config, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(
        blueprint: &Blueprint,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let replica = Replica::new(blueprint, config.exclude_actions.clone());
        let (changes, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                replica: Mutex::new(replica),
                connection: Mutex::new(None),
                changes,
                connector,
                config,
                auto_connected: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connects and joins `room_id`
    ///
    /// Already being in (or joining) that room is a no-op. Being in another
    /// room disconnects from it first.
    pub fn connect(&self, room_id: &str) {
        let generation = {
            let mut replica = self.inner.replica();
            match (replica.status(), replica.room_id()) {
                (ConnectionStatus::Disconnected, _) => {}
                (_, Some(current)) if current == room_id => return,
                _ => {
                    replica.disconnect();
                    self.inner.connection().take();
                }
            }
            replica.begin_connect(room_id)
        };

        info!("Connecting to {} for room {}", self.inner.config.server_url, room_id);
        let (commands, command_rx) = mpsc::unbounded_channel();
        *self.inner.connection() = Some(Connection {
            generation,
            commands,
        });
        self.inner.notify();

        tokio::spawn(run_connection(Arc::clone(&self.inner), generation, command_rx));
    }

    /// Closes the connection; late messages from it are discarded
    pub fn disconnect(&self) {
        {
            let mut replica = self.inner.replica();
            if replica.status() == ConnectionStatus::Disconnected {
                return;
            }
            replica.disconnect();
        }
        // Dropping the command sender makes the connection task close its transport
        self.inner.connection().take();
        info!("Disconnected by request");
        self.inner.notify();
    }

    /// Runs an action locally and forwards it to the server when connected
    ///
    /// Returns the optimistic patches. Sending is fire-and-forget.
    pub fn call(&self, action: &str, args: Vec<Value>) -> Result<Vec<Patch>> {
        let (patches, outbound) = self.inner.replica().call(action, Args::new(args))?;

        if let Some(message) = outbound {
            let connection = self.inner.connection();
            match connection.as_ref() {
                Some(connection) if connection.commands.send(message).is_ok() => {}
                _ => debug!("Connection closed, {} stays local", action),
            }
        }

        if !patches.is_empty() {
            self.inner.notify();
        }
        Ok(patches)
    }

    pub fn state(&self) -> Value {
        self.inner.replica().state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.replica().status()
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.replica().client_id().map(str::to_string)
    }

    pub fn room_id(&self) -> Option<String> {
        self.inner.replica().room_id().map(str::to_string)
    }

    /// Change notifications; the value is a counter bumped on every change
    ///
    /// With auto-connect enabled the first subscription connects to the
    /// default room, once per client.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        let receiver = self.inner.changes.subscribe();
        if self.inner.config.auto_connect && !self.inner.auto_connected.swap(true, Ordering::SeqCst) {
            if self.status() == ConnectionStatus::Disconnected {
                let room = self.inner.config.default_room.clone();
                self.connect(&room);
            }
        }
        receiver
    }

    /// Waits until `condition` holds, giving up after `timeout`
    pub async fn wait_for<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&SyncClient) -> bool,
    {
        let mut changes = self.inner.changes.subscribe();
        let wait = async {
            loop {
                if condition(self) {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok() && condition(self)
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let replica = self.inner.replica();
        f.debug_struct("SyncClient")
            .field("status", &replica.status())
            .field("client_id", &replica.client_id())
            .field("room_id", &replica.room_id())
            .finish()
    }
}

async fn run_connection(
    inner: Arc<Inner>,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<ClientMessage>,
) {
    let mut transport = match inner.connector.connect(&inner.config.server_url).await {
        Ok(transport) => transport,
        Err(e) => {
            warn!("Failed to connect to {}: {}", inner.config.server_url, e);
            inner.connection_lost(generation);
            return;
        }
    };
    let half_ping = inner.config.fake_ping / 2;

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(message) => {
                        if let Err(e) = send(&mut transport, &message, half_ping).await {
                            error!("Error sending message: {}", e);
                            inner.connection_lost(generation);
                            break;
                        }
                    }
                    None => {
                        let _ = transport.close().await;
                        inner.connection_lost(generation);
                        break;
                    }
                }
            },

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => {
                        if !half_ping.is_zero() {
                            sleep(half_ping).await;
                        }
                        let message = match protocol::decode::<ServerMessage>(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("Ignoring malformed server message: {}", e);
                                continue;
                            }
                        };
                        if let Some(reply) = inner.receive(generation, message) {
                            if let Err(e) = send(&mut transport, &reply, half_ping).await {
                                error!("Error sending message: {}", e);
                                inner.connection_lost(generation);
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error receiving message: {}", e);
                        inner.connection_lost(generation);
                        break;
                    }
                    None => {
                        debug!("Server closed the connection");
                        inner.connection_lost(generation);
                        break;
                    }
                }
            },
        }
    }

    debug!("Connection {} task stopped", generation);
}

async fn send(transport: &mut Box<dyn Transport>, message: &ClientMessage, delay: Duration) -> Result<()> {
    if !delay.is_zero() {
        sleep(delay).await;
    }
    transport.send(protocol::encode(message)?).await
}
