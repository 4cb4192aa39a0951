//! Message routing between the members of a room
//!
//! The relay never interprets negotiation payloads. It also does not check that
//! a `signal` sender is currently a member of the room it names: with two
//! anonymous parties per room there is nothing to protect, so membership is
//! not treated as an access-control boundary here. Anything that adds
//! authentication must add that check too.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use tandem_core::{MemberId, RoomId, SignalKind};

use crate::messages::{ClientMessage, ServerMessage};
use crate::registry::RoomRegistry;

/// Routes client messages to the registry and to other members
#[derive(Clone, Default)]
pub struct SignalRelay {
    registry: Arc<RoomRegistry>,
}

impl SignalRelay {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Assign an id to a new connection and register its outbox
    pub fn connect(&self) -> std::io::Result<(MemberId, mpsc::UnboundedReceiver<ServerMessage>)> {
        let member = MemberId::try_generate()
            .map_err(|e| std::io::Error::other(format!("member id: {}", e)))?;
        let rx = self.registry.register(member.clone());
        debug!("Member {} connected", member);
        Ok((member, rx))
    }

    /// Transport for `member` closed: drop it from every room
    pub fn disconnect(&self, member: &MemberId) {
        let rooms = self.registry.leave_all(member);
        self.registry.unregister(member);
        debug!("Member {} disconnected (left {} rooms)", member, rooms.len());
    }

    /// Deliver a signal to every member of `room_id` except the sender
    ///
    /// Unknown rooms are a silent no-op. Returns the number of recipients.
    pub fn forward(
        &self,
        room_id: &RoomId,
        sender: &MemberId,
        kind: SignalKind,
        payload: Value,
    ) -> usize {
        let Some(members) = self.registry.members(room_id) else {
            trace!("Dropping {} for unknown room {}", kind, room_id);
            return 0;
        };

        let mut delivered = 0;
        for member in members.iter().filter(|m| *m != sender) {
            let msg = ServerMessage::Signal {
                from: sender.clone(),
                kind,
                payload: payload.clone(),
            };
            if self.registry.send_to(member, msg) {
                delivered += 1;
            }
        }
        trace!("Relayed {} from {} to {} member(s)", kind, sender, delivered);
        delivered
    }

    /// Handle one message from `member`, returning the direct reply if any
    pub fn handle(&self, member: &MemberId, msg: ClientMessage) -> Option<ServerMessage> {
        match msg {
            ClientMessage::CreateRoom {
                request_id,
                room_id,
            } => Some(ServerMessage::ack(
                request_id,
                self.registry.create(&room_id, member),
            )),

            ClientMessage::JoinRoom {
                request_id,
                room_id,
            } => Some(ServerMessage::ack(
                request_id,
                self.registry.join(&room_id, member),
            )),

            ClientMessage::LeaveRoom { room_id } => {
                self.registry.leave(&room_id, member);
                None
            }

            ClientMessage::Signal {
                room_id,
                kind,
                payload,
            } => {
                self.forward(&room_id, member, kind, payload);
                None
            }

            ClientMessage::Ping { timestamp } => Some(ServerMessage::Pong { timestamp }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::ErrorCode;

    fn ack_reason(reply: Option<ServerMessage>) -> Option<ErrorCode> {
        match reply {
            Some(ServerMessage::Ack { ok: true, .. }) => None,
            Some(ServerMessage::Ack { reason, .. }) => reason,
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_forward_skips_sender() {
        let relay = SignalRelay::default();
        let (a, mut rx_a) = relay.connect().unwrap();
        let (b, mut rx_b) = relay.connect().unwrap();
        let room = RoomId::from("r1");

        relay.registry().create(&room, &a).unwrap();
        relay.registry().join(&room, &b).unwrap();
        let _ = rx_a.try_recv();

        let sent = relay.forward(&room, &a, SignalKind::Offer, json!({"sdp": "v=0"}));
        assert_eq!(sent, 1);

        assert_eq!(
            rx_b.try_recv().unwrap(),
            ServerMessage::Signal {
                from: a.clone(),
                kind: SignalKind::Offer,
                payload: json!({"sdp": "v=0"}),
            }
        );
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_forward_unknown_room_is_noop() {
        let relay = SignalRelay::default();
        let (a, _rx) = relay.connect().unwrap();
        assert_eq!(
            relay.forward(&RoomId::from("ghost"), &a, SignalKind::Answer, json!(null)),
            0
        );
    }

    #[test]
    fn test_forward_does_not_require_membership() {
        let relay = SignalRelay::default();
        let (a, mut rx_a) = relay.connect().unwrap();
        let (outsider, _rx) = relay.connect().unwrap();
        let room = RoomId::from("r1");
        relay.registry().create(&room, &a).unwrap();

        assert_eq!(relay.forward(&room, &outsider, SignalKind::Offer, json!({})), 1);
        assert!(matches!(rx_a.try_recv(), Ok(ServerMessage::Signal { .. })));
    }

    #[test]
    fn test_handle_replies() {
        let relay = SignalRelay::default();
        let (a, _rx_a) = relay.connect().unwrap();
        let (b, _rx_b) = relay.connect().unwrap();
        let (c, _rx_c) = relay.connect().unwrap();

        let join_early = relay.handle(
            &b,
            ClientMessage::JoinRoom {
                request_id: 1,
                room_id: "r2".into(),
            },
        );
        assert_eq!(ack_reason(join_early), Some(ErrorCode::RoomNotFound));

        let create = relay.handle(
            &a,
            ClientMessage::CreateRoom {
                request_id: 2,
                room_id: "r2".into(),
            },
        );
        assert_eq!(ack_reason(create), None);

        let retry = relay.handle(
            &b,
            ClientMessage::JoinRoom {
                request_id: 3,
                room_id: "r2".into(),
            },
        );
        assert_eq!(ack_reason(retry), None);

        let third = relay.handle(
            &c,
            ClientMessage::JoinRoom {
                request_id: 4,
                room_id: "r2".into(),
            },
        );
        assert_eq!(ack_reason(third), Some(ErrorCode::RoomFull));

        assert_eq!(
            relay.handle(&a, ClientMessage::Ping { timestamp: 9 }),
            Some(ServerMessage::Pong { timestamp: 9 })
        );
        assert_eq!(
            relay.handle(&a, ClientMessage::LeaveRoom { room_id: "r2".into() }),
            None
        );
    }

    #[test]
    fn test_disconnect_cleans_up() {
        let relay = SignalRelay::default();
        let (a, mut rx_a) = relay.connect().unwrap();
        let (b, _rx_b) = relay.connect().unwrap();
        let room = RoomId::from("r1");
        relay.registry().create(&room, &a).unwrap();
        relay.registry().join(&room, &b).unwrap();
        let _ = rx_a.try_recv();

        relay.disconnect(&b);
        assert_eq!(
            rx_a.try_recv().unwrap(),
            ServerMessage::PeerLeft { member_id: b }
        );
        assert_eq!(relay.registry().member_count(), 1);

        relay.disconnect(&a);
        assert_eq!(relay.registry().room_count(), 0);
        assert_eq!(relay.registry().member_count(), 0);
    }
}
