//! Flood gossip over the peer overlay.
//!
//! Every node keeps the fingerprints of all messages it has seen. A message
//! is delivered locally the first time its fingerprint shows up and then
//! forwarded to every connected peer except the one it arrived from, unless
//! it is a whisper. Termination rests entirely on the seen cache: a message
//! re-entering a node through a third party is discarded there. Back
//! suppression only trims one redundant hop.
//!
//! The seen cache is unbounded. There is no eviction, so a long-lived node
//! grows by one fingerprint per distinct message.

use crate::identity::Position;
use crate::message::{Fingerprint, MessageOptions, WispMessage};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Fingerprints of every message this node has seen.
#[derive(Debug, Default)]
pub struct SeenCache {
    seen: HashSet<Fingerprint>,
}

impl SeenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fingerprint. Returns true if it was already present.
    pub fn has_or_add(&mut self, fingerprint: &Fingerprint) -> bool {
        if self.seen.contains(fingerprint) {
            return true;
        }
        self.seen.insert(fingerprint.clone());
        false
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// What to do with a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Already seen: no delivery, no forwarding
    Duplicate,
    /// Fingerprint does not match content: dropped
    Rejected,
    /// First sighting: deliver locally, then send to `forward_to`
    Delivered { forward_to: Vec<String> },
}

/// Message construction and the flood-forwarding rule.
pub struct GossipProtocol {
    our_address: String,
    position: Option<Position>,
    seen: SeenCache,
}

impl GossipProtocol {
    pub fn new(our_address: impl Into<String>) -> Self {
        Self {
            our_address: our_address.into(),
            position: None,
            seen: SeenCache::new(),
        }
    }

    pub fn our_address(&self) -> &str {
        &self.our_address
    }

    /// Update the position stamped on outgoing messages.
    pub fn set_position(&mut self, position: Option<Position>) {
        self.position = position;
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    /// Build a message stamped with the current time.
    pub fn create_message(
        &self,
        payload: impl Into<String>,
        options: Option<MessageOptions>,
    ) -> WispMessage {
        self.create_message_at(now_ms(), payload, options)
    }

    /// Build a message with an explicit timestamp.
    pub fn create_message_at(
        &self,
        timestamp: u64,
        payload: impl Into<String>,
        options: Option<MessageOptions>,
    ) -> WispMessage {
        WispMessage::new(
            timestamp,
            self.our_address.clone(),
            self.position,
            payload,
            options,
        )
    }

    /// Build a locally originated message and mark it seen, so an echo from
    /// the mesh is never delivered back to our own observers.
    pub fn originate(
        &mut self,
        payload: impl Into<String>,
        options: Option<MessageOptions>,
    ) -> WispMessage {
        let message = self.create_message(payload, options);
        self.seen.has_or_add(&message.fingerprint);
        message
    }

    /// Apply the receipt rule to a message that arrived from `arrived_from`.
    ///
    /// `connected` is the set of currently open peer addresses.
    pub fn receive<'a>(
        &mut self,
        message: &WispMessage,
        arrived_from: &str,
        connected: impl IntoIterator<Item = &'a String>,
    ) -> ReceiveOutcome {
        if self.seen.contains(&message.fingerprint) {
            debug!("Chucked previously seen message {}", message.fingerprint);
            return ReceiveOutcome::Duplicate;
        }

        if !message.has_valid_fingerprint() {
            warn!(
                "Dropping message from {} with mismatched fingerprint {}",
                arrived_from, message.fingerprint
            );
            return ReceiveOutcome::Rejected;
        }

        self.seen.has_or_add(&message.fingerprint);

        if message.is_whisper() {
            return ReceiveOutcome::Delivered {
                forward_to: Vec::new(),
            };
        }

        let forward_to = connected
            .into_iter()
            .filter(|address| *address != &self.our_address && address.as_str() != arrived_from)
            .cloned()
            .collect();

        ReceiveOutcome::Delivered { forward_to }
    }

    pub fn has_seen(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}
