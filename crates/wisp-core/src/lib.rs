//! wisp-core: presence and peer overlay library for ephemeral wisps.
//!
//! This crate provides:
//! - The presence registry and the random neighbor sampling behind `scout`
//! - The per-connection signaling state machine run by the server
//! - Signaling and peer wire envelopes
//! - Content-fingerprinted gossip with flood de-duplication
//! - The overlay manager that keeps peer channels in line with the latest
//!   neighbor sample, and the client that feeds it
//!
//! Transport-agnostic: peer channels are reached through the [`Transport`]
//! trait.

pub mod client;
pub mod gateway;
pub mod gossip;
pub mod identity;
pub mod message;
pub mod overlay;
pub mod presence;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::WispClient;
pub use gateway::{GatewayOutput, Session, SessionState, SignalingGateway};
pub use gossip::{GossipProtocol, ReceiveOutcome, SeenCache};
pub use identity::{Coords, Identity, IdentityPatch, Neighbor, Position};
pub use message::{Fingerprint, MessageOptions, WispMessage};
pub use overlay::{OverlayConfig, OverlayEvent, OverlayManager};
pub use presence::{PresenceError, PresenceRegistry, PresenceStore};
pub use protocol::{PeerEnvelope, ProtocolError, SignalingReply, SignalingRequest};
pub use transport::{
    ChannelEvent, ChannelEvents, IncomingChannels, OverlayInput, PeerChannel, Transport,
    TransportError,
};
