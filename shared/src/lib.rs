//! # Shared Sync Library
//!
//! Everything both halves of the engine agree on: the state container and its
//! action table, the structural patch engine, the wire protocol and the error
//! taxonomy. The demo room rules live here too so that the server and the
//! replicas run exactly the same actions.
//!
//! ## Module Organization
//!
//! - [`store`]: versioned state container, [`store::ActionTable`] command registry
//!   and the [`store::ActionContext`] handed to each action
//! - [`patch`]: deep structural diff and in-order patch application
//! - [`protocol`]: client/server messages and their JSON text encoding
//! - [`error`]: [`SyncError`] and [`ActionError`]
//! - [`game`]: the demo blueprint (characters, movement, ticking)

pub mod error;
pub mod game;
pub mod patch;
pub mod protocol;
pub mod store;

pub use error::{ActionError, Result, SyncError};
pub use patch::{Patch, PatchOp, PathSegment};
pub use protocol::{ClientMessage, ServerMessage};
pub use serde_json::Value;
pub use store::{ActionContext, ActionTable, Args, Blueprint, Store, SERVER_SENDER};
