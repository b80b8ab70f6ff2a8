//! # Sync Server Library
//!
//! The authoritative side of the state sync engine. Each room owns one store
//! built from a shared blueprint; clients join rooms over WebSocket, ask the
//! server to run named actions, and receive the resulting patches.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! The server runs every action against its own copy of each room's state.
//! Replicas may predict locally but always converge to what the server sends.
//!
//! ### Room Lifecycle
//! Rooms are created on first join and removed when their last member leaves.
//! A room can tick on a fixed period, driving simulation with the server as
//! the sender.
//!
//! ### Fan-out
//! Each committed batch reaches exactly the room's current members, in commit
//! order, after the snapshot a new member receives on joining.
//!
//! ## Module Organization
//!
//! - [`client_manager`]: connection ids, capacity and per-connection sinks
//! - [`room`]: the room controller, its task and its broadcaster
//! - [`room_manager`]: lazy creation and cleanup of rooms
//! - [`network`]: the connection hub and the WebSocket listener
//! - [`config`]: server and room options, including the demo tick
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::{serve, SyncServer};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Arc::new(SyncServer::new(ServerConfig::demo(30)));
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     serve(server, listener).await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod network;
pub mod room;
pub mod room_manager;
pub mod utils;

pub use config::ServerConfig;
pub use network::SyncServer;
