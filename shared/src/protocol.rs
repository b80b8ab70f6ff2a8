//! Logical wire protocol between replicas and the authoritative server
//!
//! Every message travels as one JSON text frame shaped
//! `{"event": "<name>", "payload": {...}}`. Event names are kebab-case.

use crate::error::Result;
use crate::patch::Patch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from a replica to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Request membership of a room
    JoinRoom { room_id: String },
    /// Leave the current room without closing the connection
    LeaveRoom,
    /// Run a named action authoritatively
    DispatchCommand {
        room_id: String,
        action: String,
        args: Vec<Value>,
    },
}

/// Messages sent from the server to a replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every accepted connection, carrying the assigned id
    Connected { client_id: String },
    /// Full data snapshot, sent once per successful join
    InitialState { room_id: String, state: Value },
    /// Incremental or full-replacement diff
    Patch { room_id: String, patches: Vec<Patch> },
    /// The server refused the connection and is about to close it
    Rejected { reason: String },
}

/// Serializes a protocol message into a text frame
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parses a text frame into a protocol message
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use serde_json::json;

    #[test]
    fn test_join_room_wire_format() {
        let message = ClientMessage::JoinRoom {
            room_id: "r1".to_string(),
        };
        let encoded: Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"event": "join-room", "payload": {"room_id": "r1"}})
        );
    }

    #[test]
    fn test_dispatch_command_decoding() {
        let text = r#"{"event":"dispatch-command","payload":{"room_id":"r1","action":"moveCharacter","args":["c1",{"x":1,"y":2}]}}"#;
        let decoded: ClientMessage = decode(text).unwrap();

        match decoded {
            ClientMessage::DispatchCommand {
                room_id,
                action,
                args,
            } => {
                assert_eq!(room_id, "r1");
                assert_eq!(action, "moveCharacter");
                assert_eq!(args, vec![json!("c1"), json!({"x": 1, "y": 2})]);
            }
            _ => panic!("Wrong message type after decoding"),
        }
    }

    #[test]
    fn test_leave_room_has_no_payload() {
        let encoded = encode(&ClientMessage::LeaveRoom).unwrap();
        assert_eq!(encoded, r#"{"event":"leave-room"}"#);
        let decoded: ClientMessage = decode(&encoded).unwrap();
        assert_eq!(decoded, ClientMessage::LeaveRoom);
    }

    #[test]
    fn test_patch_message_wire_format() {
        let message = ServerMessage::Patch {
            room_id: "r1".to_string(),
            patches: vec![Patch::replace(vec![], json!({"foo": 1}))],
        };
        let encoded: Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({
                "event": "patch",
                "payload": {
                    "room_id": "r1",
                    "patches": [{"op": "replace", "path": [], "value": {"foo": 1}}]
                }
            })
        );
    }

    #[test]
    fn test_server_messages_decode() {
        let decoded: ServerMessage =
            decode(r#"{"event":"connected","payload":{"client_id":"c3"}}"#).unwrap();
        assert_eq!(
            decoded,
            ServerMessage::Connected {
                client_id: "c3".to_string()
            }
        );

        let decoded: ServerMessage = decode(
            r#"{"event":"initial-state","payload":{"room_id":"lobby","state":{"characters":[]}}}"#,
        )
        .unwrap();
        assert!(matches!(decoded, ServerMessage::InitialState { .. }));
    }

    #[test]
    fn test_patch_frame_with_bad_entry_still_decodes() {
        let text = r#"{"event":"patch","payload":{"room_id":"r1","patches":[
            {"op":"replace","path":["serverTime"],"value":99},
            {"op":"replace","path":["characters",-1],"value":1}
        ]}}"#;

        match decode::<ServerMessage>(text).unwrap() {
            ServerMessage::Patch { patches, .. } => {
                assert_eq!(patches.len(), 2);
                assert_eq!(patches[0], Patch::replace(vec!["serverTime".into()], json!(99)));
                assert!(patches[1].rejection().is_some());
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        let unknown = decode::<ClientMessage>(r#"{"event":"teleport","payload":{}}"#);
        assert!(matches!(unknown, Err(SyncError::Serialization(_))));

        let garbage = decode::<ServerMessage>("not json");
        assert!(matches!(garbage, Err(SyncError::Serialization(_))));
    }
}
