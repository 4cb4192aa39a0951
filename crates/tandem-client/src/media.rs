//! Local media capability
//!
//! Capture devices live outside this crate. The orchestrator only needs to
//! acquire a stream, toggle its tracks and release it again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a media track
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Handle to an acquired local stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<TrackKind>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<TrackKind>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.tracks.contains(&kind)
    }
}

/// Media acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera or microphone permission denied")]
    PermissionDenied,

    #[error("no camera or microphone found")]
    DeviceNotFound,

    #[error("camera or microphone is in use by another application")]
    DeviceBusy,

    #[error("media error: {0}")]
    Other(String),
}

impl MediaError {
    /// Message suitable for showing to the person on the call
    pub fn user_message(&self) -> String {
        match self {
            MediaError::PermissionDenied => {
                "Camera and microphone access was denied. Allow access and try again.".into()
            }
            MediaError::DeviceNotFound => {
                "No camera or microphone was found. Connect a device and try again.".into()
            }
            MediaError::DeviceBusy => {
                "Your camera or microphone is being used by another application.".into()
            }
            MediaError::Other(detail) => format!("Could not access camera or microphone: {}", detail),
        }
    }
}

/// Source of local audio/video
#[async_trait]
pub trait LocalMedia: Send + Sync + 'static {
    async fn acquire(&self) -> Result<MediaStream, MediaError>;

    async fn release(&self, stream: &MediaStream);

    fn set_track_enabled(&self, stream: &MediaStream, kind: TrackKind, enabled: bool);
}
