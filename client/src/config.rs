use shared::game::TICK;
use std::collections::BTreeSet;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_ROOM: &str = "lobby";

/// Replica runtime settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Room joined by the auto-connect on first subscription
    pub default_room: String,
    pub auto_connect: bool,
    /// Actions that only ever run locally
    pub exclude_actions: BTreeSet<String>,
    /// Simulated round trip; half is added on each direction
    pub fake_ping: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            default_room: DEFAULT_ROOM.to_string(),
            auto_connect: false,
            exclude_actions: BTreeSet::from([TICK.to_string()]),
            fake_ping: Duration::ZERO,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            ..Self::default()
        }
    }

    pub fn with_default_room(mut self, room_id: &str) -> Self {
        self.default_room = room_id.to_string();
        self
    }

    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    pub fn with_exclude_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fake_ping(mut self, fake_ping: Duration) -> Self {
        self.fake_ping = fake_ping;
        self
    }
}
