use clap::Parser;
use log::{error, info};
use server::config::{ServerConfig, DEFAULT_MAX_CLIENTS, DEFAULT_TICK_RATE};
use server::network::{self, SyncServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,
    /// Run rooms without the simulation tick
    #[clap(long)]
    no_tick: bool,
    /// Artificial delay before each client action runs, in milliseconds
    #[clap(long, default_value = "0")]
    latency_ms: u64,
    /// Maximum number of concurrent connections
    #[clap(short, long, default_value_t = DEFAULT_MAX_CLIENTS)]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let config = ServerConfig::demo(args.tick_rate)
        .with_ticking(!args.no_tick)
        .with_simulated_latency(Duration::from_millis(args.latency_ms))
        .with_max_clients(args.max_clients);

    if args.latency_ms > 0 {
        info!("Simulating {}ms of latency per action", args.latency_ms);
    }

    let address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&address).await?;
    let server = Arc::new(SyncServer::new(config));

    tokio::select! {
        result = network::serve(Arc::clone(&server), listener) => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    server.rooms().shutdown().await;
    Ok(())
}
