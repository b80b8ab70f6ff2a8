//! Authoritative rooms
//!
//! A room is one authoritative [`Store`] plus the set of connections that
//! joined it. [`RoomController`] is the synchronous core that commits actions
//! and queues their patches. [`RoomHandle`] is the async face of a room task:
//! the task owns a controller and runs every join, leave, dispatch and tick
//! one at a time, so a tick never overlaps another tick or a client action.
//!
//! Everything a room emits goes through one outbound queue drained by a
//! broadcaster task. A joining connection's snapshot travels through the same
//! queue, so it is always delivered before any patch committed after it.

use crate::client_manager::{ClientId, ConnectionSink};
use crate::config::{RoomOptions, TickConfig};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use shared::{Args, Blueprint, Patch, Result, ServerMessage, Store, SyncError, SERVER_SENDER};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Longest simulation step handed to a tick handler after a stall
pub const MAX_TICK_DELTA: Duration = Duration::from_millis(250);

const TICK_LOG_INTERVAL: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickState {
    Stopped,
    Running,
}

/// Work for the broadcaster, in commit order
#[derive(Debug)]
pub enum Outbound {
    /// A committed batch for every current member
    Patches(Vec<Patch>),
    /// Send `snapshot` to a new member, then include it in later batches
    Join {
        client_id: ClientId,
        sink: ConnectionSink,
        snapshot: Value,
    },
    /// Stop delivering to a member
    Leave { client_id: ClientId },
}

/// Synchronous core of a room
pub struct RoomController {
    room_id: String,
    store: Store,
    members: BTreeSet<ClientId>,
    outbound: mpsc::UnboundedSender<Outbound>,
    tick: Option<TickConfig>,
    tick_state: TickState,
    tick_count: u64,
    last_tick: Instant,
    closed: bool,
}

impl RoomController {
    /// Builds a room around `store`
    ///
    /// When ticking is configured and enabled the first tick runs here,
    /// before any connection can join.
    pub fn new(
        room_id: &str,
        store: Store,
        options: &RoomOptions,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let tick_state = if options.tick.is_some() && options.tick_enabled {
            TickState::Running
        } else {
            TickState::Stopped
        };

        let mut room = Self {
            room_id: room_id.to_string(),
            store,
            members: BTreeSet::new(),
            outbound,
            tick: options.tick.clone(),
            tick_state,
            tick_count: 0,
            last_tick: Instant::now(),
            closed: false,
        };
        room.run_tick();
        room
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Runs an action against the authoritative store and queues its patches
    ///
    /// Unknown actions are logged and ignored. Any other failure leaves the
    /// state untouched and is returned to the caller.
    pub fn dispatch_sync(
        &mut self,
        action: &str,
        args: &Args,
        sender: Option<&str>,
    ) -> Result<Vec<Patch>> {
        if self.closed {
            return Err(SyncError::RoomClosed(self.room_id.clone()));
        }

        let patches = match self.store.dispatch_locally(action, args, sender) {
            Ok(patches) => patches,
            Err(e) if e.is_unknown_action() => {
                warn!("Room {}: ignoring {} from {:?}", self.room_id, e, sender);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        if !patches.is_empty() {
            debug!(
                "Room {}: {} produced {} patch(es)",
                self.room_id,
                action,
                patches.len()
            );
            self.publish(Outbound::Patches(patches.clone()));
        }
        Ok(patches)
    }

    /// Current data fields, without actions
    pub fn get_state(&self) -> Value {
        self.store.snapshot()
    }

    pub fn version(&self) -> u64 {
        self.store.version()
    }

    /// Adds a member; returns false if it was already present
    pub fn add_client(&mut self, client_id: &str) -> bool {
        self.members.insert(client_id.to_string())
    }

    /// Removes a member; returns false if it was not present
    pub fn remove_client(&mut self, client_id: &str) -> bool {
        self.members.remove(client_id)
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.members.contains(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.members.len()
    }

    /// Joins a connection to the room
    ///
    /// Order matters here. The member is added, then the join action runs and
    /// its patches go to the members already present, then the snapshot is
    /// queued for the newcomer. Re-joining only re-sends the snapshot.
    pub fn admit(&mut self, client_id: &str, sink: ConnectionSink, join_action: Option<&str>) -> usize {
        if self.add_client(client_id) {
            if let Some(action) = join_action {
                self.run_membership_action(action, client_id);
            }
        }

        self.publish(Outbound::Join {
            client_id: client_id.to_string(),
            sink,
            snapshot: self.get_state(),
        });
        self.client_count()
    }

    /// Removes a connection from the room and runs the leave action
    pub fn release(&mut self, client_id: &str, leave_action: Option<&str>) -> usize {
        if self.remove_client(client_id) {
            self.publish(Outbound::Leave {
                client_id: client_id.to_string(),
            });
            if let Some(action) = leave_action {
                self.run_membership_action(action, client_id);
            }
        }
        self.client_count()
    }

    fn run_membership_action(&mut self, action: &str, client_id: &str) {
        let args = Args::new(vec![json!(client_id)]);
        if let Err(e) = self.dispatch_sync(action, &args, Some(client_id)) {
            error!(
                "Room {}: {} for {} failed: {}",
                self.room_id, action, client_id, e
            );
        }
    }

    pub fn tick_state(&self) -> TickState {
        self.tick_state
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn tick_period(&self) -> Option<Duration> {
        self.tick.as_ref().map(|tick| tick.period)
    }

    /// Starts or stops the tick; has no effect without a tick handler
    pub fn set_ticking(&mut self, enabled: bool) {
        if self.tick.is_none() || self.closed {
            return;
        }
        self.tick_state = if enabled {
            // Don't hand a huge step to the first tick after a pause
            self.last_tick = Instant::now();
            TickState::Running
        } else {
            TickState::Stopped
        };
    }

    /// Runs the tick handler once with the time elapsed since the previous tick
    ///
    /// Handler errors are logged and the room keeps ticking.
    pub fn run_tick(&mut self) {
        if self.closed || self.tick_state != TickState::Running {
            return;
        }
        let Some(handler) = self.tick.as_ref().map(|tick| Arc::clone(&tick.handler)) else {
            return;
        };

        let now = Instant::now();
        let mut dt = now.duration_since(self.last_tick);
        self.last_tick = now;
        if dt > MAX_TICK_DELTA {
            warn!(
                "Room {}: tick delta {:?} too large, capping to {:?}",
                self.room_id, dt, MAX_TICK_DELTA
            );
            dt = MAX_TICK_DELTA;
        }

        self.tick_count += 1;
        if let Err(e) = handler(self, dt) {
            error!(
                "Room {}: tick {} failed: {}",
                self.room_id, self.tick_count, e
            );
        }

        if self.tick_count % TICK_LOG_INTERVAL == 0 {
            debug!(
                "Room {}: tick {}, {} member(s), version {}",
                self.room_id,
                self.tick_count,
                self.members.len(),
                self.store.version()
            );
        }
    }

    /// Stops the tick and refuses further dispatches; safe to call twice
    pub fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.tick_state = TickState::Stopped;
        info!("Room {} cleaned up", self.room_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn publish(&self, item: Outbound) {
        if self.outbound.send(item).is_err() {
            debug!("Room {}: broadcaster is gone", self.room_id);
        }
    }
}

enum RoomCommand {
    Join {
        client_id: ClientId,
        sink: ConnectionSink,
        reply: oneshot::Sender<usize>,
    },
    Leave {
        client_id: ClientId,
        close_when_empty: bool,
        reply: oneshot::Sender<usize>,
    },
    Dispatch {
        action: String,
        args: Args,
        sender: ClientId,
        reply: oneshot::Sender<Result<Vec<Patch>>>,
    },
    State {
        reply: oneshot::Sender<Value>,
    },
    ClientCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running room task
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    commands: mpsc::UnboundedSender<RoomCommand>,
    simulated_latency: Duration,
}

impl RoomHandle {
    /// Creates a room from `blueprint` and starts its task and broadcaster
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(room_id: &str, blueprint: &Blueprint, options: &RoomOptions) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let controller = RoomController::new(room_id, blueprint.instantiate(), options, outbound_tx);
        tokio::spawn(run_broadcaster(room_id.to_string(), outbound_rx));
        tokio::spawn(run_room(
            controller,
            command_rx,
            options.join_action.clone(),
            options.leave_action.clone(),
        ));

        info!("Room {} created", room_id);
        Self {
            room_id: room_id.to_string(),
            commands: command_tx,
            simulated_latency: options.simulated_latency,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// True once the room task has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// True when both handles drive the same room task
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.commands.same_channel(&other.commands)
    }

    /// Adds a member and returns the new member count
    pub async fn join(&self, client_id: &str, sink: ConnectionSink) -> Result<usize> {
        let client_id = client_id.to_string();
        self.request(move |reply| RoomCommand::Join {
            client_id,
            sink,
            reply,
        })
        .await
    }

    /// Removes a member and returns the remaining member count
    pub async fn leave(&self, client_id: &str) -> Result<usize> {
        self.send_leave(client_id, false).await
    }

    /// Like [`leave`](Self::leave), but the room stops itself once it is empty
    ///
    /// The emptiness check runs inside the room task, so a join queued behind
    /// this leave either lands first and keeps the room alive, or finds the
    /// room closed.
    pub async fn leave_or_close(&self, client_id: &str) -> Result<usize> {
        self.send_leave(client_id, true).await
    }

    async fn send_leave(&self, client_id: &str, close_when_empty: bool) -> Result<usize> {
        let client_id = client_id.to_string();
        self.request(move |reply| RoomCommand::Leave {
            client_id,
            close_when_empty,
            reply,
        })
        .await
    }

    /// Runs an action on behalf of `sender`
    ///
    /// The simulated latency delays only this call. Senders other than the
    /// server must be members of the room.
    pub async fn dispatch(&self, action: &str, args: Args, sender: &str) -> Result<Vec<Patch>> {
        if !self.simulated_latency.is_zero() {
            tokio::time::sleep(self.simulated_latency).await;
        }

        let action = action.to_string();
        let sender = sender.to_string();
        self.request(move |reply| RoomCommand::Dispatch {
            action,
            args,
            sender,
            reply,
        })
        .await?
    }

    pub async fn state(&self) -> Result<Value> {
        self.request(|reply| RoomCommand::State { reply }).await
    }

    pub async fn client_count(&self) -> Result<usize> {
        self.request(|reply| RoomCommand::ClientCount { reply })
            .await
    }

    /// Stops the room task; a closed room is left as is
    pub async fn cleanup(&self) -> Result<()> {
        match self.request(|reply| RoomCommand::Shutdown { reply }).await {
            Err(SyncError::RoomClosed(_)) => Ok(()),
            other => other,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SyncError::RoomClosed(self.room_id.clone()))?;
        response
            .await
            .map_err(|_| SyncError::RoomClosed(self.room_id.clone()))
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_room(
    mut room: RoomController,
    mut commands: mpsc::UnboundedReceiver<RoomCommand>,
    join_action: Option<String>,
    leave_action: Option<String>,
) {
    let mut ticker = room.tick_period().map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    // Skip the first tick since it fires immediately
    if let Some(ticker) = ticker.as_mut() {
        ticker.tick().await;
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    room.cleanup();
                    break;
                };
                handle_command(&mut room, command, join_action.as_deref(), leave_action.as_deref());
                if room.is_closed() {
                    break;
                }
            },

            _ = next_tick(&mut ticker) => {
                room.run_tick();
            },
        }
    }

    debug!("Room {} task stopped", room.room_id());
}

fn handle_command(
    room: &mut RoomController,
    command: RoomCommand,
    join_action: Option<&str>,
    leave_action: Option<&str>,
) {
    match command {
        RoomCommand::Join {
            client_id,
            sink,
            reply,
        } => {
            let count = room.admit(&client_id, sink, join_action);
            info!(
                "Client {} joined room {} ({} member(s))",
                client_id,
                room.room_id(),
                count
            );
            let _ = reply.send(count);
        }
        RoomCommand::Leave {
            client_id,
            close_when_empty,
            reply,
        } => {
            let count = room.release(&client_id, leave_action);
            info!(
                "Client {} left room {} ({} member(s))",
                client_id,
                room.room_id(),
                count
            );
            if close_when_empty && count == 0 {
                room.cleanup();
            }
            let _ = reply.send(count);
        }
        RoomCommand::Dispatch {
            action,
            args,
            sender,
            reply,
        } => {
            let result = if sender != SERVER_SENDER && !room.has_client(&sender) {
                Err(SyncError::NotAMember {
                    client_id: sender,
                    room_id: room.room_id().to_string(),
                })
            } else {
                room.dispatch_sync(&action, &args, Some(&sender))
            };
            let _ = reply.send(result);
        }
        RoomCommand::State { reply } => {
            let _ = reply.send(room.get_state());
        }
        RoomCommand::ClientCount { reply } => {
            let _ = reply.send(room.client_count());
        }
        RoomCommand::Shutdown { reply } => {
            room.cleanup();
            let _ = reply.send(());
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Delivers a room's outbound queue to its members
///
/// Members whose connection has gone away are dropped on the next send.
async fn run_broadcaster(room_id: String, mut queue: mpsc::UnboundedReceiver<Outbound>) {
    let mut members: HashMap<ClientId, ConnectionSink> = HashMap::new();

    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Join {
                client_id,
                sink,
                snapshot,
            } => {
                let message = ServerMessage::InitialState {
                    room_id: room_id.clone(),
                    state: snapshot,
                };
                if sink.send(message).is_err() {
                    debug!("Client {} went away before its snapshot", client_id);
                    continue;
                }
                members.insert(client_id, sink);
            }
            Outbound::Leave { client_id } => {
                members.remove(&client_id);
            }
            Outbound::Patches(patches) => {
                let message = ServerMessage::Patch {
                    room_id: room_id.clone(),
                    patches,
                };
                members.retain(|client_id, sink| {
                    let delivered = sink.send(message.clone()).is_ok();
                    if !delivered {
                        debug!("Dropping closed connection {} from room {}", client_id, room_id);
                    }
                    delivered
                });
            }
        }
    }

    debug!("Broadcaster for room {} stopped", room_id);
}
