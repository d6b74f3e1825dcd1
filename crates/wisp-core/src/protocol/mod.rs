//! Wire protocol definitions.
//!
//! - Signaling envelopes exchanged with the presence server
//! - Peer envelopes exchanged over overlay data channels

pub mod peer;
pub mod signaling;

use thiserror::Error;

pub use peer::PeerEnvelope;
pub use signaling::{ScoutRequest, SignalingReply, SignalingRequest};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid message: {0}")]
    Malformed(String),
}
