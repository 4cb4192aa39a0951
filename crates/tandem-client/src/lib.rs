//! Tandem Client - Two-party call setup over the Tandem relay
//!
//! This crate provides:
//! - A WebSocket signaling transport and a reconnecting channel on top of it
//! - The create/join room handshake
//! - The peer session state machine (offer/answer, ICE, renegotiation)
//! - The call orchestrator that ties them to local media
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │            ConnectionOrchestrator (actor task)               │
//! │  commands in via mpsc, status out via watch                  │
//! └───────┬──────────────────────┬────────────────────┬──────────┘
//!         │                      │                    │
//!         ▼                      ▼                    ▼
//! ┌───────────────┐   ┌────────────────────┐   ┌──────────────┐
//! │  LocalMedia   │   │ ReconnectingChannel│   │ PeerSession  │
//! │ (capability)  │   │  + RoomJoinProtocol│   │ (+ transport │
//! └───────────────┘   └─────────┬──────────┘   │  capability) │
//!                               │              └──────────────┘
//!                               ▼
//!                     SignalTransport (WebSocket)
//! ```
//!
//! Media capture and the peer-to-peer media transport are capabilities
//! supplied by the embedding application through [`LocalMedia`] and
//! [`PeerTransportFactory`].

pub mod channel;
pub mod join;
pub mod media;
pub mod orchestrator;
pub mod peer_session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use channel::{
    AckResult, ChannelError, ChannelEvent, ChannelSettings, ChannelState, ReconnectingChannel,
};
pub use join::{JoinError, RoomJoinProtocol, RoomRequester};
pub use media::{LocalMedia, MediaError, MediaStream, TrackKind};
pub use orchestrator::{CallDependencies, CallError, CallParams, CallSnapshot, ConnectionOrchestrator};
pub use peer_session::{
    OutboundSignal, PeerError, PeerEventSink, PeerSession, PeerSessionEvent, PeerTransport,
    PeerTransportEvent, PeerTransportFactory,
};
pub use transport::{SignalTransport, TransportEvent, WsTransport};
