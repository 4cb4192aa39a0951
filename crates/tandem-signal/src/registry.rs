//! Room membership for the signal relay
//!
//! Every operation that reads and then mutates a room does so while holding
//! that room's map entry, so a `join` racing another `join` for the last slot,
//! or a `join` racing the `leave` that empties a room, is serialized per room.
//! Notifications are collected under the entry and delivered after it is
//! released.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use tandem_core::{ErrorCode, MemberId, RoomId, ROOM_CAPACITY};

use crate::messages::ServerMessage;

/// Sending half of a member's message queue
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Room membership errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room already exists")]
    RoomAlreadyExists,
    #[error("room not found")]
    RoomNotFound,
    #[error("room is full")]
    RoomFull,
}

impl RoomError {
    pub fn code(self) -> ErrorCode {
        match self {
            RoomError::RoomAlreadyExists => ErrorCode::RoomAlreadyExists,
            RoomError::RoomNotFound => ErrorCode::RoomNotFound,
            RoomError::RoomFull => ErrorCode::RoomFull,
        }
    }
}

/// A rendezvous room with at most two members
pub struct Room {
    pub id: RoomId,

    /// Members in join order
    members: Vec<MemberId>,
}

impl Room {
    fn new(id: RoomId, creator: MemberId) -> Self {
        Self {
            id,
            members: vec![creator],
        }
    }

    fn add_member(&mut self, member: MemberId) -> Result<(), RoomError> {
        if self.members.len() >= ROOM_CAPACITY {
            return Err(RoomError::RoomFull);
        }
        self.members.push(member);
        Ok(())
    }

    fn remove_member(&mut self, member: &MemberId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != member);
        self.members.len() != before
    }

    fn others(&self, member: &MemberId) -> Vec<MemberId> {
        self.members.iter().filter(|m| *m != member).cloned().collect()
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Shared table of rooms and connected members
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Room>,
    outboxes: DashMap<MemberId, Outbox>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected member and return its inbound queue
    pub fn register(&self, member: MemberId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.insert(member, tx);
        rx
    }

    /// Forget a member's outbox. Does not touch room membership.
    pub fn unregister(&self, member: &MemberId) {
        self.outboxes.remove(member);
    }

    /// Create `room_id` with `member` as its only occupant
    pub fn create(&self, room_id: &RoomId, member: &MemberId) -> Result<(), RoomError> {
        match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(_) => Err(RoomError::RoomAlreadyExists),
            Entry::Vacant(entry) => {
                entry.insert(Room::new(room_id.clone(), member.clone()));
                info!("Room created: {} by {}", room_id, member);
                Ok(())
            }
        }
    }

    /// Add `member` to an existing room and tell the other occupant
    ///
    /// Joining a room the member is already in succeeds without notifying
    /// anyone.
    pub fn join(&self, room_id: &RoomId, member: &MemberId) -> Result<(), RoomError> {
        let others = {
            let mut room = self.rooms.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;

            if room.contains(member) {
                debug!("Member {} already in room {}", member, room_id);
                return Ok(());
            }

            room.add_member(member.clone())?;
            room.others(member)
        };

        info!("Member {} joined room {}", member, room_id);
        for other in others {
            self.send_to(
                &other,
                ServerMessage::PeerJoined {
                    member_id: member.clone(),
                },
            );
        }
        Ok(())
    }

    /// Remove `member` from `room_id`, evicting the room if it empties
    ///
    /// Idempotent; returns whether anything was removed.
    pub fn leave(&self, room_id: &RoomId, member: &MemberId) -> bool {
        let remaining = match self.rooms.entry(room_id.clone()) {
            Entry::Vacant(_) => return false,
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().remove_member(member) {
                    return false;
                }
                let remaining = entry.get().members().to_vec();
                if remaining.is_empty() {
                    entry.remove();
                    debug!("Room {} removed (empty)", room_id);
                }
                remaining
            }
        };

        info!("Member {} left room {}", member, room_id);
        for other in remaining {
            self.send_to(
                &other,
                ServerMessage::PeerLeft {
                    member_id: member.clone(),
                },
            );
        }
        true
    }

    /// Remove `member` from every room it is in
    ///
    /// Scans the whole table rather than trusting that a member is only ever
    /// in one room.
    pub fn leave_all(&self, member: &MemberId) -> Vec<RoomId> {
        let candidates: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|room| room.contains(member))
            .map(|room| room.id.clone())
            .collect();

        candidates
            .into_iter()
            .filter(|room_id| self.leave(room_id, member))
            .collect()
    }

    /// Current members of a room, `None` if the room does not exist
    pub fn members(&self, room_id: &RoomId) -> Option<Vec<MemberId>> {
        self.rooms.get(room_id).map(|room| room.members().to_vec())
    }

    pub fn contains_room(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Deliver a message to a connected member. Returns false if it is gone.
    pub fn send_to(&self, member: &MemberId, msg: ServerMessage) -> bool {
        match self.outboxes.get(member) {
            Some(outbox) => outbox.send(msg).is_ok(),
            None => false,
        }
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get connected member count (for monitoring)
    pub fn member_count(&self) -> usize {
        self.outboxes.len()
    }
}
