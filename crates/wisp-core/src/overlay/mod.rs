//! Peer overlay: connection lifecycle, liveness and gossip delivery.

pub mod connection;
pub mod liveness;
pub mod manager;

pub use connection::{ConnectionDirection, ConnectionInfo, ConnectionState, DisconnectReason};
pub use liveness::DEFAULT_LIVENESS_TIMEOUT;
pub use manager::{
    GREETING_SHOUT_PROBABILITY, OverlayConfig, OverlayEvent, OverlayManager, SHOUT_GREETING,
    WHISPER_GREETING,
};
