//! Core identifiers and status types shared by the relay and the client

use serde::{Deserialize, Serialize};

/// Length of a generated member id in raw bytes (hex-encoded on the wire)
pub const MEMBER_ID_BYTES: usize = 8;

/// Opaque room identifier, supplied by the caller
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one live signaling connection
///
/// Assigned by the relay when the connection is accepted and invalid once it
/// closes. A reconnecting client always receives a fresh id.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Generate a random member id, failing only if the OS RNG does
    pub fn try_generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; MEMBER_ID_BYTES];
        getrandom::fill(&mut bytes)?;
        Ok(Self(hex::encode(bytes)))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a relayed negotiation message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        };
        f.write_str(name)
    }
}

/// Externally observable call status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Nothing running
    #[default]
    Idle,
    /// Acquiring media, reaching the relay, or waiting for the peer
    Waiting,
    /// Peer present, session negotiating
    Connecting,
    /// Peer session established
    Connected,
    /// Lost or failed; see the attached error message
    Disconnected,
}

impl ConnectionStatus {
    /// Whether the orchestrator may move from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        if self == next {
            return true;
        }
        match (self, next) {
            // explicit end is always allowed
            (_, Idle) => true,
            // any failure resolves to disconnected
            (_, Disconnected) => true,
            (Idle, Waiting) => true,
            (Waiting, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Waiting) | (Connected, Waiting) => true,
            (Disconnected, Connecting) | (Disconnected, Waiting) => true,
            // the peer transport recovered a transient drop on its own
            (Disconnected, Connected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Waiting => "waiting",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a single peer transport session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerSessionState {
    /// Transition table for a session. A session never leaves `Closed`.
    pub fn can_transition_to(self, next: PeerSessionState) -> bool {
        use PeerSessionState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Connecting) | (New, Connected) => true,
            (Connecting, Connected) => true,
            (Connecting, Disconnected) | (Connecting, Failed) => true,
            (Connected, Disconnected) | (Connected, Failed) => true,
            // transports may recover a transient drop on their own
            (Disconnected, Connected) | (Disconnected, Connecting) => true,
            (Disconnected, Failed) => true,
            _ => false,
        }
    }

    /// Whether the session has lost its path to the peer
    pub fn is_unhealthy(self) -> bool {
        matches!(self, PeerSessionState::Disconnected | PeerSessionState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_generation() {
        let id1 = MemberId::try_generate().unwrap();
        let id2 = MemberId::try_generate().unwrap();

        assert_eq!(id1.as_str().len(), MEMBER_ID_BYTES * 2);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_ids_are_transparent_on_the_wire() {
        let room = RoomId::from("r1");
        assert_eq!(serde_json::to_string(&room).unwrap(), "\"r1\"");

        let member: MemberId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(member.as_str(), "abc");
    }

    #[test]
    fn test_signal_kind_names() {
        assert_eq!(
            serde_json::to_string(&SignalKind::IceCandidate).unwrap(),
            "\"ice-candidate\""
        );
        assert_eq!(SignalKind::Offer.to_string(), "offer");
    }

    #[test]
    fn test_connection_status_transitions() {
        use ConnectionStatus::*;

        assert!(Idle.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Disconnected.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Connected));
        assert!(!Waiting.can_transition_to(Connected));
    }

    #[test]
    fn test_peer_session_transitions() {
        use PeerSessionState::*;

        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(New));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Connected));
        assert!(Failed.is_unhealthy());
        assert!(!Connected.is_unhealthy());
    }
}
