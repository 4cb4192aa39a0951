//! Tandem Core - Shared identifiers, wire error codes, retry policy and configuration
//!
//! This crate contains the foundational types used by both the relay and the
//! client. It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::{ClientConfig, Config, ConfigError, JoinConfig, RelayConfig, RetryConfig};
pub use error::*;
pub use retry::RetryBudget;
pub use types::*;

/// Maximum members per room
pub const ROOM_CAPACITY: usize = 2;

/// Attempts a joiner makes while the room does not exist yet
pub const JOIN_MAX_ATTEMPTS: u32 = 5;
