//! Error types for the Tandem signaling protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire reason codes (sent over the signaling channel)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Room membership conflicts
    RoomAlreadyExists,
    RoomNotFound,
    RoomFull,

    // Malformed or unexpected input
    InvalidMessage,

    // Client-side transport faults, never sent by the relay
    ConnectionTimeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RoomAlreadyExists => "ROOM_ALREADY_EXISTS",
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("unexpected binary frame ({0} bytes)")]
    BinaryFrame(usize),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            ProtocolError::Deserialization(e.to_string())
        } else {
            ProtocolError::Serialization(e.to_string())
        }
    }
}

impl From<&ProtocolError> for ErrorCode {
    fn from(_: &ProtocolError) -> Self {
        ErrorCode::InvalidMessage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::RoomAlreadyExists).unwrap();
        assert_eq!(json, "\"ROOM_ALREADY_EXISTS\"");

        let parsed: ErrorCode = serde_json::from_str("\"ROOM_FULL\"").unwrap();
        assert_eq!(parsed, ErrorCode::RoomFull);
        assert_eq!(ErrorCode::RoomNotFound.to_string(), "ROOM_NOT_FOUND");
    }

    #[test]
    fn test_protocol_error_from_json() {
        let err = serde_json::from_str::<ErrorCode>("{not json").unwrap_err();
        let err = ProtocolError::from(err);
        assert!(matches!(err, ProtocolError::Deserialization(_)));
        assert_eq!(ErrorCode::from(&err), ErrorCode::InvalidMessage);
    }
}
