//! # statesync
//!
//! Authoritative real-time state synchronisation between a server and many
//! client replicas. Both sides run the same named actions against the same
//! state shape; the server's results travel to every room member as
//! structural patches.
//!
//! This crate re-exports the workspace members:
//!
//! - [`shared`]: state container, patch engine, wire protocol, demo rules
//! - [`server`]: rooms, room manager, connection hub, WebSocket listener
//! - [`client`]: replica runtime and transports

pub use client;
pub use server;
pub use shared;
