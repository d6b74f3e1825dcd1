//! Gossip messages and their content fingerprints.
//!
//! A message's fingerprint is a SHA-256 over the canonical JSON of every other
//! field. It is the message's only identity: two messages with the same
//! content (timestamp included) are the same message.

use crate::identity::Position;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};

/// Hex-encoded SHA-256 content hash of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery options attached by the sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOptions {
    /// Deliver to the first recipient only, never re-flood
    #[serde(default)]
    pub whisper: bool,
}

impl MessageOptions {
    pub fn whisper() -> Self {
        Self { whisper: true }
    }

    pub fn shout() -> Self {
        Self { whisper: false }
    }
}

/// A message flooded through the peer overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WispMessage {
    /// Milliseconds since Unix epoch at creation
    pub timestamp: u64,
    pub sender_peer_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_position: Option<Position>,
    pub payload: String,
    pub fingerprint: Fingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<MessageOptions>,
}

/// The hashed part of a message: everything except the fingerprint.
///
/// Serialized through `serde_json::Value`, whose objects keep keys sorted, so
/// the hash depends on field values only.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageContent<'a> {
    timestamp: u64,
    sender_peer_address: &'a str,
    sender_position: &'a Option<Position>,
    payload: &'a str,
    options: &'a Option<MessageOptions>,
}

impl WispMessage {
    /// Build a message and compute its fingerprint.
    pub fn new(
        timestamp: u64,
        sender_peer_address: impl Into<String>,
        sender_position: Option<Position>,
        payload: impl Into<String>,
        options: Option<MessageOptions>,
    ) -> Self {
        let mut message = Self {
            timestamp,
            sender_peer_address: sender_peer_address.into(),
            sender_position,
            payload: payload.into(),
            fingerprint: Fingerprint(String::new()),
            options,
        };
        message.fingerprint = message.compute_fingerprint();
        message
    }

    /// Hash the content fields.
    pub fn compute_fingerprint(&self) -> Fingerprint {
        let content = MessageContent {
            timestamp: self.timestamp,
            sender_peer_address: &self.sender_peer_address,
            sender_position: &self.sender_position,
            payload: &self.payload,
            options: &self.options,
        };
        let canonical = serde_json::to_value(&content)
            .and_then(|value| serde_json::to_vec(&value))
            .expect("MessageContent serialization should not fail");

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Whether the carried fingerprint matches the content.
    pub fn has_valid_fingerprint(&self) -> bool {
        self.fingerprint == self.compute_fingerprint()
    }

    pub fn is_whisper(&self) -> bool {
        self.options.is_some_and(|o| o.whisper)
    }
}
