//! Tandem Signal Server
//!
//! Lightweight relay that lets two peers find each other and exchange session
//! negotiation data. Clients connect via WebSocket; the relay never sees media.
//!
//! # Protocol
//!
//! 1. Relay assigns each connection a member id (`welcome`)
//! 2. One peer creates a room, the other joins it (capacity two)
//! 3. Relay forwards offer/answer/ICE `signal` messages between them
//! 4. Peers establish a direct media session
//! 5. On disconnect the relay removes the member from every room

pub mod messages;
pub mod registry;
pub mod relay;
pub mod server;

pub use messages::{ClientMessage, ServerMessage};
pub use registry::{Room, RoomError, RoomRegistry};
pub use relay::SignalRelay;
pub use server::SignalServer;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8080;
