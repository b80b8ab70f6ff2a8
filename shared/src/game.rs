//! Demo room rules shared by server and client
//!
//! The same [`blueprint`] is loaded on both sides: the server runs it
//! authoritatively, replicas run it optimistically. Actions that mutate a
//! specific character check the sender so one client cannot drive another
//! client's character; a rejected call is a silent no-op.

use crate::error::ActionError;
use crate::store::{ActionContext, ActionTable, Args, Blueprint};
use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const GRAVITY: f64 = 980.0;
pub const FLOOR_Y: f64 = 550.0;
pub const WORLD_WIDTH: f64 = 800.0;
pub const PLAYER_SIZE: f64 = 32.0;

pub const COLORS: [&str; 6] = ["red", "blue", "green", "purple", "pink", "indigo"];

/// Where `resetPositions` puts everyone
pub const RESET_POSITION: Vec2 = Vec2 { x: 100.0, y: 100.0 };

pub const ADD_CHARACTER: &str = "addCharacter";
pub const REMOVE_CHARACTER: &str = "removeCharacter";
pub const MOVE_CHARACTER: &str = "moveCharacter";
pub const CYCLE_MY_COLOR: &str = "cycleMyColor";
pub const RESET_POSITIONS: &str = "resetPositions";
pub const TICK: &str = "tick";
pub const UPDATE_SERVER_TIME: &str = "updateServerTime";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: String,
    pub name: String,
    pub color: String,
    pub position: Vec2,
    pub velocity: Vec2,
    pub is_on_ground: bool,
}

impl Character {
    pub fn new(id: &str, color: &str, position: Vec2) -> Self {
        let short: String = id.chars().take(4).collect();
        Self {
            id: id.to_string(),
            name: format!("Player-{}", short),
            color: color.to_string(),
            position,
            velocity: Vec2::default(),
            is_on_ground: false,
        }
    }

    /// Integrates gravity over `dt` seconds and clamps to the world
    pub fn step(&mut self, dt: f64) {
        if !self.is_on_ground {
            self.velocity.y += GRAVITY * dt;
        }

        self.position.x += self.velocity.x * dt;
        self.position.y += self.velocity.y * dt;

        self.position.x = self.position.x.clamp(0.0, WORLD_WIDTH - PLAYER_SIZE);

        if self.position.y + PLAYER_SIZE >= FLOOR_Y {
            self.position.y = FLOOR_Y - PLAYER_SIZE;
            self.velocity.y = 0.0;
            self.is_on_ground = true;
        }

        if self.position.y <= 0.0 {
            self.position.y = 0.0;
            self.velocity.y = 0.0;
        }
    }
}

/// Data fields of a fresh room
pub fn initial_state() -> Value {
    json!({
        "characters": [],
        "serverTime": 0,
        "tickCount": 0
    })
}

/// The demo's action table
pub fn actions() -> ActionTable {
    ActionTable::new()
        .with(ADD_CHARACTER, 1, add_character)
        .with(REMOVE_CHARACTER, 1, remove_character)
        .with(MOVE_CHARACTER, 2, move_character)
        .with(CYCLE_MY_COLOR, 0, cycle_my_color)
        .with(RESET_POSITIONS, 0, reset_positions)
        .with(TICK, 1, tick)
        .with(UPDATE_SERVER_TIME, 1, update_server_time)
}

pub fn blueprint() -> Blueprint {
    Blueprint::new(initial_state(), actions())
}

/// Decodes the character list out of a snapshot, skipping entries that don't parse
pub fn characters(state: &Value) -> Vec<Character> {
    state
        .get("characters")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|raw| Character::deserialize(raw).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn add_character(ctx: &mut ActionContext<'_>, args: &Args) -> Result<(), ActionError> {
    let id: String = args.get(0)?;
    if !ctx.is_sender_or_local(&id) {
        warn!(
            "Client {:?} tried to add character {}. Denied.",
            ctx.sender(),
            id
        );
        return Ok(());
    }

    let mut list: Vec<Character> = ctx.get("characters")?;
    if list.iter().any(|c| c.id == id) {
        return Ok(());
    }

    let mut rng = rand::thread_rng();
    let color = COLORS[rng.gen_range(0..COLORS.len())];
    let position = Vec2 {
        x: rng.gen_range(50.0..(WORLD_WIDTH - 50.0)).floor(),
        y: rng.gen_range(50.0..(FLOOR_Y - PLAYER_SIZE)).floor(),
    };

    list.push(Character::new(&id, color, position));
    ctx.set("characters", list)
}

fn remove_character(ctx: &mut ActionContext<'_>, args: &Args) -> Result<(), ActionError> {
    let id: String = args.get(0)?;
    if !ctx.is_sender_or_local(&id) {
        warn!(
            "Client {:?} tried to remove character {}. Denied.",
            ctx.sender(),
            id
        );
        return Ok(());
    }

    let mut list: Vec<Character> = ctx.get("characters")?;
    list.retain(|c| c.id != id);
    ctx.set("characters", list)
}

fn move_character(ctx: &mut ActionContext<'_>, args: &Args) -> Result<(), ActionError> {
    let id: String = args.get(0)?;
    let position: Vec2 = args.get(1)?;
    if !ctx.is_sender_or_local(&id) {
        warn!(
            "SECURITY: Client {:?} tried to move character {}. Denied.",
            ctx.sender(),
            id
        );
        return Ok(());
    }

    let mut list: Vec<Character> = ctx.get("characters")?;
    if let Some(character) = list.iter_mut().find(|c| c.id == id) {
        character.position = position;
    }
    ctx.set("characters", list)
}

fn cycle_my_color(ctx: &mut ActionContext<'_>, _args: &Args) -> Result<(), ActionError> {
    let Some(me) = ctx.acting_client() else {
        return Ok(());
    };

    let mut list: Vec<Character> = ctx.get("characters")?;
    for character in list.iter_mut().filter(|c| c.id == me) {
        let next = COLORS
            .iter()
            .position(|color| *color == character.color)
            .map_or(0, |index| (index + 1) % COLORS.len());
        character.color = COLORS[next].to_string();
    }
    ctx.set("characters", list)
}

fn reset_positions(ctx: &mut ActionContext<'_>, _args: &Args) -> Result<(), ActionError> {
    let mut list: Vec<Character> = ctx.get("characters")?;
    for character in &mut list {
        character.position = RESET_POSITION;
        character.velocity = Vec2::default();
        character.is_on_ground = false;
    }
    ctx.set("characters", list)
}

/// Physics step; over the network only the server may drive it
fn tick(ctx: &mut ActionContext<'_>, args: &Args) -> Result<(), ActionError> {
    if ctx.sender().is_some() && !ctx.is_authoritative() {
        warn!("Client {:?} tried to drive the simulation. Denied.", ctx.sender());
        return Ok(());
    }

    let dt: f64 = args.get(0)?;
    let mut list: Vec<Character> = ctx.get("characters")?;
    for character in &mut list {
        character.step(dt);
    }
    let count: u64 = ctx.get("tickCount")?;

    ctx.set("characters", list)?;
    ctx.set("tickCount", count + 1)
}

fn update_server_time(ctx: &mut ActionContext<'_>, args: &Args) -> Result<(), ActionError> {
    if !ctx.is_authoritative() {
        return Ok(());
    }
    let time: u64 = args.get(0)?;
    ctx.set("serverTime", time)
}
