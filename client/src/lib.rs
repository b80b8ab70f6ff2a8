//! # Sync Client Library
//!
//! The replica side of the state sync engine. A client keeps a local copy of
//! a room's state, runs actions against it immediately, forwards them to the
//! server, and then conforms to the authoritative snapshot and patches.
//!
//! ## Architecture Overview
//!
//! ### Optimistic Execution
//! Calling an action runs it locally first, so the caller sees its effect
//! without waiting for a round trip. Actions marked local-only stop there;
//! this is how a per-frame prediction step avoids flooding the network while
//! the server runs the same step on its own clock.
//!
//! ### Authoritative Reconciliation
//! Patches from the server are applied in arrival order and always win over
//! local predictions. A full-replacement patch swaps the data wholesale and
//! keeps the local action bindings.
//!
//! ### Connection Lifecycle
//! `disconnected -> connecting -> connected -> disconnected`. Each connection
//! attempt is tagged with a generation; anything arriving from a superseded
//! connection is dropped.
//!
//! ## Module Organization
//!
//! - [`replica`]: the transport-free replica and its connection status
//! - [`network`]: [`SyncClient`], the runtime driving a replica over a transport
//! - [`transport`]: the [`transport::Transport`] trait with WebSocket and
//!   in-process channel implementations
//! - [`config`]: client settings
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{ClientConfig, SyncClient};
//! use serde_json::json;
//! use shared::game;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = SyncClient::new(&game::blueprint(), ClientConfig::new("ws://127.0.0.1:8080"));
//!     client.connect("lobby");
//!
//!     let mut changes = client.subscribe();
//!     while changes.changed().await.is_ok() {
//!         println!("{}", client.state());
//!     }
//! }
//! ```

pub mod config;
pub mod network;
pub mod replica;
pub mod transport;

pub use config::ClientConfig;
pub use network::SyncClient;
pub use replica::ConnectionStatus;
