//! Signal protocol messages
//!
//! JSON text frames, tagged by a kebab-case `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tandem_core::{ErrorCode, MemberId, ProtocolError, RoomId, SignalKind};

use crate::registry::RoomError;

/// Messages a client sends to the relay
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Create a room containing only the sender
    CreateRoom { request_id: u64, room_id: RoomId },

    /// Join an existing room
    JoinRoom { request_id: u64, room_id: RoomId },

    /// Leave a room (fire-and-forget)
    LeaveRoom { room_id: RoomId },

    /// Negotiation data for the other member(s) of a room
    Signal {
        room_id: RoomId,
        kind: SignalKind,
        payload: Value,
    },

    /// Ping for keepalive
    Ping { timestamp: u64 },
}

/// Messages the relay sends to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every connection: the id the relay assigned
    Welcome { member_id: MemberId },

    /// Outcome of a create/join request
    Ack {
        request_id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<ErrorCode>,
    },

    /// Another member entered a room we are in
    PeerJoined { member_id: MemberId },

    /// Another member left a room we are in
    PeerLeft { member_id: MemberId },

    /// Relayed negotiation data, origin attached by the relay
    Signal {
        from: MemberId,
        kind: SignalKind,
        payload: Value,
    },

    /// Pong response
    Pong { timestamp: u64 },

    /// Error response for input the relay could not process
    Error { code: ErrorCode, message: String },
}

impl ClientMessage {
    /// Request id for messages that expect an ack
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientMessage::CreateRoom { request_id, .. }
            | ClientMessage::JoinRoom { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerMessage {
    /// Build the ack for a registry outcome
    pub fn ack(request_id: u64, result: Result<(), RoomError>) -> Self {
        match result {
            Ok(()) => Self::Ack {
                request_id,
                ok: true,
                reason: None,
            },
            Err(e) => Self::Ack {
                request_id,
                ok: false,
                reason: Some(e.code()),
            },
        }
    }

    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_format() {
        let msg = ClientMessage::CreateRoom {
            request_id: 7,
            room_id: "r1".into(),
        };

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "create-room", "request_id": 7, "room_id": "r1"}));
        assert_eq!(msg.request_id(), Some(7));
    }

    #[test]
    fn test_signal_payload_is_opaque() {
        let raw = r#"{"type":"signal","room_id":"r1","kind":"ice-candidate","payload":{"candidate":"c1","sdpMid":"0"}}"#;
        let parsed = ClientMessage::from_json(raw).unwrap();

        match parsed {
            ClientMessage::Signal {
                room_id,
                kind,
                payload,
            } => {
                assert_eq!(room_id.as_str(), "r1");
                assert_eq!(kind, SignalKind::IceCandidate);
                assert_eq!(payload["sdpMid"], "0");
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_ack_shapes() {
        let ok = ServerMessage::ack(1, Ok(())).to_json().unwrap();
        assert_eq!(ok, r#"{"type":"ack","request_id":1,"ok":true}"#);

        let full = ServerMessage::ack(2, Err(RoomError::RoomFull)).to_json().unwrap();
        assert!(full.contains(r#""ok":false"#));
        assert!(full.contains("ROOM_FULL"));
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_peer_events_parse() {
        let msg = ServerMessage::from_json(r#"{"type":"peer-left","member_id":"b"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::PeerLeft {
                member_id: "b".into()
            }
        );
    }
}
