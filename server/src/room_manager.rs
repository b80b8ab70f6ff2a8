//! Registry of live rooms
//!
//! Rooms are created lazily on first join and cleaned up as soon as their
//! last member leaves. The registry lock only guards the map itself; a room
//! decides inside its own task whether it is empty, so a slow room never
//! holds up joins to other rooms and a join can never land in a room that is
//! being torn down.

use crate::client_manager::ConnectionSink;
use crate::config::RoomOptions;
use crate::room::RoomHandle;
use log::{debug, info, warn};
use shared::{Blueprint, Result, SyncError};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A join that finds its room closing retries on a fresh room this many times
const MAX_JOIN_ATTEMPTS: usize = 3;

pub struct RoomManager {
    blueprint: Blueprint,
    options: RoomOptions,
    rooms: RwLock<HashMap<String, RoomHandle>>,
}

impl RoomManager {
    pub fn new(blueprint: Blueprint, options: RoomOptions) -> Self {
        Self {
            blueprint,
            options,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the room, creating it from the blueprint if needed
    pub async fn get_or_create_room(&self, room_id: &str) -> RoomHandle {
        let mut rooms = self.rooms.write().await;
        self.entry(&mut rooms, room_id)
    }

    pub async fn get_room(&self, room_id: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).filter(|room| !room.is_closed()).cloned()
    }

    /// Stops a room and forgets it; returns false if it did not exist
    pub async fn cleanup(&self, room_id: &str) -> bool {
        let room = {
            let mut rooms = self.rooms.write().await;
            rooms.remove(room_id)
        };

        match room {
            Some(room) => {
                if let Err(e) = room.cleanup().await {
                    warn!("Cleanup of room {} failed: {}", room_id, e);
                }
                true
            }
            None => false,
        }
    }

    /// Adds a connection to a room, creating the room on first use
    ///
    /// A room that closed because its last member left in the meantime is
    /// replaced by a fresh one.
    pub async fn join(&self, room_id: &str, client_id: &str, sink: ConnectionSink) -> Result<usize> {
        let mut attempt = 1;
        loop {
            let room = self.get_or_create_room(room_id).await;
            match room.join(client_id, sink.clone()).await {
                Err(SyncError::RoomClosed(_)) if attempt < MAX_JOIN_ATTEMPTS => {
                    debug!("Room {} closed under {}, retrying", room_id, client_id);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Removes a connection from a room and cleans the room up once empty
    pub async fn leave(&self, room_id: &str, client_id: &str) -> Result<usize> {
        let Some(room) = self.get_room(room_id).await else {
            return Ok(0);
        };

        let remaining = room.leave_or_close(client_id).await?;
        if remaining == 0 {
            let mut rooms = self.rooms.write().await;
            if rooms.get(room_id).is_some_and(|current| current.same_room(&room)) {
                rooms.remove(room_id);
            }
            info!("Room {} is empty and was removed", room_id);
        }
        Ok(remaining)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut ids: Vec<String> = rooms.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stops every room
    pub async fn shutdown(&self) {
        let rooms: Vec<RoomHandle> = {
            let mut rooms = self.rooms.write().await;
            rooms.drain().map(|(_, room)| room).collect()
        };
        for room in rooms {
            if let Err(e) = room.cleanup().await {
                warn!("Cleanup of room {} failed: {}", room.room_id(), e);
            }
        }
    }

    fn entry(&self, rooms: &mut HashMap<String, RoomHandle>, room_id: &str) -> RoomHandle {
        if let Some(room) = rooms.get(room_id) {
            if !room.is_closed() {
                return room.clone();
            }
            warn!("Replacing closed room {}", room_id);
        }

        let room = RoomHandle::spawn(room_id, &self.blueprint, &self.options);
        rooms.insert(room_id.to_string(), room.clone());
        room
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TickConfig;
    use serde_json::json;
    use shared::game;
    use shared::{ActionTable, Args};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn manager() -> RoomManager {
        RoomManager::new(game::blueprint(), RoomOptions::default())
    }

    #[tokio::test]
    async fn test_get_or_create_room_is_lazy_and_stable() {
        let rooms = manager();
        assert!(rooms.get_room("r1").await.is_none());

        let first = rooms.get_or_create_room("r1").await;
        let second = rooms.get_or_create_room("r1").await;

        assert_eq!(first.room_id(), second.room_id());
        assert_eq!(rooms.room_count().await, 1);
        assert!(rooms.get_room("r1").await.is_some());
    }

    #[tokio::test]
    async fn test_join_and_leave_counts() {
        let rooms = manager();
        let (sink, _rx) = mpsc::unbounded_channel();

        assert_eq!(rooms.join("r1", "c1", sink.clone()).await.unwrap(), 1);
        assert_eq!(rooms.join("r1", "c2", sink).await.unwrap(), 2);
        assert_eq!(rooms.leave("r1", "c1").await.unwrap(), 1);
        assert_eq!(rooms.room_count().await, 1);

        let state = rooms.get_room("r1").await.unwrap().state().await.unwrap();
        let characters = game::characters(&state);
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[0].id, "c2");
    }

    #[tokio::test]
    async fn test_last_leave_cleans_up_room() {
        let rooms = manager();
        let (sink, _rx) = mpsc::unbounded_channel();
        rooms.join("r1", "c1", sink).await.unwrap();
        let handle = rooms.get_room("r1").await.unwrap();

        assert_eq!(rooms.leave("r1", "c1").await.unwrap(), 0);

        assert!(rooms.get_room("r1").await.is_none());
        assert_eq!(rooms.room_count().await, 0);
        assert!(handle.state().await.is_err());
    }

    #[tokio::test]
    async fn test_leave_unknown_room_is_noop() {
        let rooms = manager();
        assert_eq!(rooms.leave("nowhere", "c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejoin_after_cleanup_gets_fresh_room() {
        let rooms = manager();
        let (sink, _rx) = mpsc::unbounded_channel();
        rooms.join("r1", "c1", sink.clone()).await.unwrap();
        rooms.leave("r1", "c1").await.unwrap();

        rooms.join("r1", "c2", sink).await.unwrap();

        let state = rooms.get_room("r1").await.unwrap().state().await.unwrap();
        let ids: Vec<String> = game::characters(&state).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c2".to_string()]);
    }

    /// Rooms whose `stall` action blocks the room task for a while
    fn stalling_manager() -> RoomManager {
        let actions = ActionTable::new().with("stall", 0, |_ctx, _args| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(())
        });
        let options = RoomOptions {
            join_action: None,
            leave_action: None,
            ..RoomOptions::default()
        };
        RoomManager::new(Blueprint::new(json!({}), actions), options)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_busy_room_does_not_block_other_rooms() {
        let rooms = Arc::new(stalling_manager());
        let (sink, _rx) = mpsc::unbounded_channel();
        rooms.join("busy", "c1", sink.clone()).await.unwrap();

        let busy = rooms.get_room("busy").await.unwrap();
        let stall = tokio::spawn(async move { busy.dispatch("stall", Args::empty(), "c1").await });
        let queued = {
            let rooms = Arc::clone(&rooms);
            let sink = sink.clone();
            tokio::spawn(async move { rooms.join("busy", "c2", sink).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        assert_eq!(rooms.join("idle", "c3", sink).await.unwrap(), 1);
        assert_eq!(rooms.leave("idle", "c3").await.unwrap(), 0);
        assert!(rooms.get_room("busy").await.is_some());
        assert!(started.elapsed() < Duration::from_millis(200));

        stall.await.unwrap().unwrap();
        assert_eq!(queued.await.unwrap().unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_last_leave_lands_in_live_room() {
        for _ in 0..20 {
            let rooms = Arc::new(manager());
            let (sink, _rx) = mpsc::unbounded_channel();
            rooms.join("r1", "c1", sink.clone()).await.unwrap();

            let leaver = {
                let rooms = Arc::clone(&rooms);
                tokio::spawn(async move { rooms.leave("r1", "c1").await })
            };
            rooms.join("r1", "c2", sink).await.unwrap();
            leaver.await.unwrap().unwrap();

            let room = rooms.get_room("r1").await.unwrap();
            assert_eq!(room.client_count().await.unwrap(), 1);
            let state = room.state().await.unwrap();
            let ids: Vec<String> = game::characters(&state).into_iter().map(|c| c.id).collect();
            assert_eq!(ids, vec!["c2".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let rooms = manager();
        let (sink, _rx) = mpsc::unbounded_channel();
        rooms.join("r1", "c1", sink.clone()).await.unwrap();
        rooms.join("r2", "c2", sink).await.unwrap();

        assert_eq!(rooms.room_ids().await, vec!["r1".to_string(), "r2".to_string()]);
        let r1 = rooms.get_room("r1").await.unwrap().state().await.unwrap();
        assert_eq!(game::characters(&r1).len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_stops_ticking() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let options = RoomOptions {
            tick: Some(TickConfig::new(Duration::from_millis(20), move |_room, _dt| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            ..RoomOptions::default()
        };
        let rooms = RoomManager::new(game::blueprint(), options);
        rooms.get_or_create_room("r1").await;

        assert!(rooms.cleanup("r1").await);
        assert!(!rooms.cleanup("r1").await);
        let after_cleanup = ticks.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_cleanup);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_rooms() {
        let rooms = manager();
        let a = rooms.get_or_create_room("a").await;
        let b = rooms.get_or_create_room("b").await;

        rooms.shutdown().await;

        assert_eq!(rooms.room_count().await, 0);
        assert!(a.state().await.is_err());
        assert!(b.state().await.is_err());
    }
}
