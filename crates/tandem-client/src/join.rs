//! Room join handshake
//!
//! The creator creates the room and falls back to joining when it already
//! exists. The joiner retries while the room does not exist yet, since the two
//! parties may reach the relay in either order. Callers see exactly one
//! outcome: the retries stay inside [`RoomJoinProtocol::run`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use tandem_core::{ErrorCode, JoinConfig, RoomId, JOIN_MAX_ATTEMPTS};
use tandem_signal::ClientMessage;

use crate::channel::{AckResult, ChannelError, ReconnectingChannel};

/// Join errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("room request rejected: {0}")]
    Rejected(ErrorCode),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("timed out joining the room")]
    Timeout,
}

impl JoinError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            JoinError::Rejected(code) => Some(*code),
            JoinError::Channel(e) => e.code(),
            JoinError::Timeout => Some(ErrorCode::ConnectionTimeout),
        }
    }
}

/// Issues create/join requests and reports the relay's verdict
#[async_trait]
pub trait RoomRequester: Send + Sync {
    async fn create_room(&self, room: &RoomId) -> Result<AckResult, ChannelError>;

    async fn join_room(&self, room: &RoomId) -> Result<AckResult, ChannelError>;
}

#[async_trait]
impl RoomRequester for ReconnectingChannel {
    async fn create_room(&self, room: &RoomId) -> Result<AckResult, ChannelError> {
        let room_id = room.clone();
        self.request(move |request_id| ClientMessage::CreateRoom {
            request_id,
            room_id,
        })
        .await
    }

    async fn join_room(&self, room: &RoomId) -> Result<AckResult, ChannelError> {
        let room_id = room.clone();
        self.request(move |request_id| ClientMessage::JoinRoom {
            request_id,
            room_id,
        })
        .await
    }
}

/// Create-or-join policy with bounded retries
#[derive(Clone, Debug)]
pub struct RoomJoinProtocol {
    max_attempts: u32,
    base_delay: Duration,
    timeout: Duration,
}

impl Default for RoomJoinProtocol {
    fn default() -> Self {
        Self::new(&JoinConfig::default(), Duration::from_secs(15))
    }
}

impl RoomJoinProtocol {
    pub fn new(config: &JoinConfig, timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts.clamp(1, JOIN_MAX_ATTEMPTS),
            base_delay: config.base_delay(),
            timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run the handshake for `room`, bounded by the join timeout
    pub async fn run<R>(&self, requester: &R, room: &RoomId, is_creator: bool) -> Result<(), JoinError>
    where
        R: RoomRequester + ?Sized,
    {
        let handshake = async {
            if is_creator {
                self.create_or_join(requester, room).await
            } else {
                self.join_with_retry(requester, room).await
            }
        };

        match tokio::time::timeout(self.timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(JoinError::Timeout),
        }
    }

    async fn create_or_join<R>(&self, requester: &R, room: &RoomId) -> Result<(), JoinError>
    where
        R: RoomRequester + ?Sized,
    {
        match requester.create_room(room).await? {
            Ok(()) => {
                info!("Created room {}", room);
                Ok(())
            }
            Err(ErrorCode::RoomAlreadyExists) => {
                debug!("Room {} already exists, joining instead", room);
                tokio::time::sleep(self.base_delay).await;
                requester
                    .join_room(room)
                    .await?
                    .map_err(JoinError::Rejected)?;
                info!("Joined existing room {}", room);
                Ok(())
            }
            Err(code) => Err(JoinError::Rejected(code)),
        }
    }

    async fn join_with_retry<R>(&self, requester: &R, room: &RoomId) -> Result<(), JoinError>
    where
        R: RoomRequester + ?Sized,
    {
        let mut attempt = 1;
        loop {
            match requester.join_room(room).await? {
                Ok(()) => {
                    info!("Joined room {} (attempt {})", room, attempt);
                    return Ok(());
                }
                Err(ErrorCode::RoomNotFound) if attempt < self.max_attempts => {
                    debug!(
                        "Room {} not created yet (attempt {}/{})",
                        room, attempt, self.max_attempts
                    );
                    tokio::time::sleep(self.base_delay * attempt).await;
                    attempt += 1;
                }
                Err(code) => return Err(JoinError::Rejected(code)),
            }
        }
    }
}
