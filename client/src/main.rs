use clap::Parser;
use client::config::{ClientConfig, DEFAULT_ROOM};
use client::{ConnectionStatus, SyncClient};
use log::{info, warn};
use rand::Rng;
use serde_json::json;
use shared::game::{self, CYCLE_MY_COLOR, MOVE_CHARACTER, TICK, WORLD_WIDTH};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server URL to connect to
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Room to join
    #[arg(short = 'r', long, default_value = DEFAULT_ROOM)]
    room: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// How often the bot moves its character, in milliseconds
    #[arg(long, default_value = "1000")]
    move_every: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let config =
        ClientConfig::new(&args.server).with_fake_ping(Duration::from_millis(args.fake_ping));
    let client = SyncClient::new(&game::blueprint(), config);
    client.connect(&args.room);

    let mut physics_interval = interval(Duration::from_millis(16));
    physics_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut move_interval = interval(Duration::from_millis(args.move_every.max(16)));
    let mut report_interval = interval(Duration::from_secs(5));
    let mut last_physics = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = physics_interval.tick() => {
                let now = tokio::time::Instant::now();
                let dt = now.duration_since(last_physics).as_secs_f64();
                last_physics = now;
                // Local prediction only; the server ticks on its own
                if let Err(e) = client.call(TICK, vec![json!(dt)]) {
                    warn!("Prediction step failed: {}", e);
                }
            },

            _ = move_interval.tick() => {
                let Some(id) = client.client_id() else {
                    continue;
                };
                let target = {
                    let mut rng = rand::thread_rng();
                    json!({"x": rng.gen_range(50.0..(WORLD_WIDTH - 50.0)).floor(), "y": 100.0})
                };
                if let Err(e) = client.call(MOVE_CHARACTER, vec![json!(id), target]) {
                    warn!("Move failed: {}", e);
                }
                if rand::thread_rng().gen_bool(0.2) {
                    if let Err(e) = client.call(CYCLE_MY_COLOR, vec![]) {
                        warn!("Color change failed: {}", e);
                    }
                }
            },

            _ = report_interval.tick() => {
                let state = client.state();
                info!(
                    "{:?} as {:?}: {} character(s), tick {}, server time {}",
                    client.status(),
                    client.client_id(),
                    game::characters(&state).len(),
                    state["tickCount"],
                    state["serverTime"]
                );
                if client.status() == ConnectionStatus::Disconnected {
                    info!("Reconnecting to room {}", args.room);
                    client.connect(&args.room);
                }
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting...");
                client.disconnect();
                break;
            },
        }
    }

    Ok(())
}
