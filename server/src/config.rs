//! Server-side configuration consumed by the room machinery

use crate::room::RoomController;
use crate::utils::get_timestamp;
use serde_json::json;
use shared::game::{self, TICK, UPDATE_SERVER_TIME};
use shared::{Args, Blueprint, Result, SERVER_SENDER};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_CLIENTS: usize = 64;
pub const DEFAULT_TICK_RATE: u32 = 30;

/// Simulation callback run once per tick with the elapsed time since the previous tick
pub type TickHandler = Arc<dyn Fn(&mut RoomController, Duration) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct TickConfig {
    pub period: Duration,
    pub handler: TickHandler,
}

impl TickConfig {
    pub fn new<F>(period: Duration, handler: F) -> Self
    where
        F: Fn(&mut RoomController, Duration) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            period,
            handler: Arc::new(handler),
        }
    }

    /// Tick period for a rate in Hz; rates below 1 are clamped to 1
    pub fn period_for_rate(tick_rate: u32) -> Duration {
        Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64)
    }
}

impl fmt::Debug for TickConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickConfig")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

/// Per-room knobs shared by every room the server creates
#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub tick: Option<TickConfig>,
    pub tick_enabled: bool,
    /// Artificial delay before each client dispatch runs; for testing only
    pub simulated_latency: Duration,
    /// Action run when a connection joins, with the connection id as its only argument
    pub join_action: Option<String>,
    /// Action run when a connection leaves, with the connection id as its only argument
    pub leave_action: Option<String>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            tick: None,
            tick_enabled: true,
            simulated_latency: Duration::ZERO,
            join_action: Some(game::ADD_CHARACTER.to_string()),
            leave_action: Some(game::REMOVE_CHARACTER.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub blueprint: Blueprint,
    pub room: RoomOptions,
    pub max_clients: usize,
}

impl ServerConfig {
    pub fn new(blueprint: Blueprint) -> Self {
        Self {
            blueprint,
            room: RoomOptions::default(),
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }

    /// The demo rules ticking at the given rate
    pub fn demo(tick_rate: u32) -> Self {
        Self::new(game::blueprint()).with_tick(TickConfig::new(
            TickConfig::period_for_rate(tick_rate),
            demo_tick,
        ))
    }

    pub fn with_tick(mut self, tick: TickConfig) -> Self {
        self.room.tick = Some(tick);
        self
    }

    pub fn with_ticking(mut self, enabled: bool) -> Self {
        self.room.tick_enabled = enabled;
        self
    }

    pub fn with_simulated_latency(mut self, latency: Duration) -> Self {
        self.room.simulated_latency = latency;
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_join_action(mut self, action: Option<&str>) -> Self {
        self.room.join_action = action.map(str::to_string);
        self
    }

    pub fn with_leave_action(mut self, action: Option<&str>) -> Self {
        self.room.leave_action = action.map(str::to_string);
        self
    }
}

/// Advances the demo physics and stamps the authoritative clock
pub fn demo_tick(room: &mut RoomController, dt: Duration) -> Result<()> {
    room.dispatch_sync(
        TICK,
        &Args::new(vec![json!(dt.as_secs_f64())]),
        Some(SERVER_SENDER),
    )?;
    room.dispatch_sync(
        UPDATE_SERVER_TIME,
        &Args::new(vec![json!(get_timestamp())]),
        Some(SERVER_SENDER),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new(game::blueprint());
        assert!(config.room.tick.is_none());
        assert!(config.room.tick_enabled);
        assert_eq!(config.room.simulated_latency, Duration::ZERO);
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(config.room.join_action.as_deref(), Some("addCharacter"));
        assert_eq!(config.room.leave_action.as_deref(), Some("removeCharacter"));
    }

    #[test]
    fn test_tick_period_for_rate() {
        assert_eq!(TickConfig::period_for_rate(20), Duration::from_millis(50));
        assert_eq!(TickConfig::period_for_rate(0), Duration::from_secs(1));
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::demo(30)
            .with_ticking(false)
            .with_simulated_latency(Duration::from_millis(250))
            .with_max_clients(2)
            .with_join_action(None);

        assert!(config.room.tick.is_some());
        assert!(!config.room.tick_enabled);
        assert_eq!(config.room.simulated_latency, Duration::from_millis(250));
        assert_eq!(config.max_clients, 2);
        assert!(config.room.join_action.is_none());
    }
}
