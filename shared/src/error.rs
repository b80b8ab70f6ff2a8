//! Error types shared by the server and client halves of the sync engine.

use thiserror::Error;

/// Failure raised by an action's own logic.
///
/// Returning one of these aborts the dispatch: the working copy the action was
/// mutating is dropped and the store keeps its previous state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    /// A positional argument could not be decoded into the type the action expects.
    #[error("argument {index} is invalid: {reason}")]
    InvalidArgument { index: usize, reason: String },

    /// A state field had an unexpected shape.
    #[error("state field `{field}` is malformed: {reason}")]
    MalformedState { field: String, reason: String },

    /// Free-form failure reported by the action.
    #[error("{0}")]
    Failed(String),
}

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The dispatched name is not registered in the action table.
    #[error("unknown action `{0}`")]
    UnknownAction(String),

    /// The dispatch carried the wrong number of arguments.
    #[error("action `{action}` expects {expected} argument(s), got {got}")]
    ArityMismatch {
        action: String,
        expected: usize,
        got: usize,
    },

    /// The action itself failed while running.
    #[error("action `{action}` failed: {source}")]
    Action {
        action: String,
        #[source]
        source: ActionError,
    },

    /// A patch path did not resolve against the current state.
    #[error("malformed patch at {path}: {reason}")]
    MalformedPatch { path: String, reason: String },

    /// Failed to serialize or deserialize a protocol message or value.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying transport failed or closed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The room was cleaned up and no longer accepts work.
    #[error("room `{0}` is closed")]
    RoomClosed(String),

    /// The connection is not a member of the room it addressed.
    #[error("connection `{client_id}` is not a member of room `{room_id}`")]
    NotAMember { client_id: String, room_id: String },

    /// The operation needs an active connection.
    #[error("not connected to server")]
    NotConnected,

    /// The server refused a new connection because it is at capacity.
    #[error("server full")]
    ServerFull,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Unknown actions are expected traffic, not faults.
    pub fn is_unknown_action(&self) -> bool {
        matches!(self, SyncError::UnknownAction(_))
    }
}

/// A specialized [`Result`] type for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
