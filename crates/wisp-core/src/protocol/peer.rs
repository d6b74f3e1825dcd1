//! Peer overlay envelopes.
//!
//! Wire format: `{"type":"peer_message","data":{...}}`, `{"type":"peer_ping"}`
//! and `{"type":"peer_pong"}`, JSON bytes over a peer data channel.

use super::ProtocolError;
use crate::message::WispMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PeerEnvelope {
    PeerMessage(WispMessage),
    PeerPing,
    PeerPong,
}

impl PeerEnvelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("PeerEnvelope serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
