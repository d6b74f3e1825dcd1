//! Peer channel transport abstraction.
//!
//! The overlay never opens sockets itself. A signaling/NAT-traversal layer
//! implements [`Transport`] and yields [`PeerChannel`]s; channel lifecycle
//! (`open`, `data`, `close`) is reported back through the [`ChannelEvents`]
//! handle the overlay hands out for each channel.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A bidirectional data channel to one peer.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Send one payload to the peer
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}

/// Opens peer channels by address.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start opening a channel to `peer_address`.
    ///
    /// Returning `Ok` does not mean the channel is open: the transport calls
    /// [`ChannelEvents::opened`] once it is usable.
    async fn open(&self, peer_address: &str, events: ChannelEvents) -> Result<Box<dyn PeerChannel>>;
}

/// Lifecycle event of a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Data(Vec<u8>),
    Closed,
    /// Negotiation failure or abrupt error; treated as a disconnect
    Failed(String),
}

/// An input waiting to be handled by the overlay's event loop.
///
/// Opaque: obtained from `OverlayManager::recv_input` and passed back to
/// `OverlayManager::handle_input`.
pub struct OverlayInput(pub(crate) InputKind);

pub(crate) enum InputKind {
    Incoming {
        connection_id: u64,
        address: String,
        channel: Box<dyn PeerChannel>,
    },
    Channel {
        connection_id: u64,
        address: String,
        event: ChannelEvent,
    },
    LivenessCheck {
        connection_id: u64,
        address: String,
    },
    /// Periodic ping of every open peer
    Probe,
}

/// Reports events for one channel back to the overlay.
///
/// Events for a channel the overlay has already dropped are ignored, so a
/// late `closed()` can never tear down a newer channel to the same address.
#[derive(Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<OverlayInput>,
    connection_id: u64,
    address: String,
}

impl ChannelEvents {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<OverlayInput>,
        connection_id: u64,
        address: String,
    ) -> Self {
        Self {
            tx,
            connection_id,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn opened(&self) {
        self.emit(ChannelEvent::Opened);
    }

    pub fn data(&self, data: Vec<u8>) {
        self.emit(ChannelEvent::Data(data));
    }

    pub fn closed(&self) {
        self.emit(ChannelEvent::Closed);
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.emit(ChannelEvent::Failed(reason.into()));
    }

    fn emit(&self, event: ChannelEvent) {
        // Overlay gone means nobody is listening; dropping is correct
        let _ = self.tx.send(OverlayInput(InputKind::Channel {
            connection_id: self.connection_id,
            address: self.address.clone(),
            event,
        }));
    }
}

/// Hands channels opened *by* remote peers to the overlay.
#[derive(Clone)]
pub struct IncomingChannels {
    tx: mpsc::UnboundedSender<OverlayInput>,
    next_id: Arc<AtomicU64>,
}

impl IncomingChannels {
    pub(crate) fn new(tx: mpsc::UnboundedSender<OverlayInput>, next_id: Arc<AtomicU64>) -> Self {
        Self { tx, next_id }
    }

    /// Register an inbound channel from `address`.
    ///
    /// Returns the handle the transport must use for that channel's events.
    pub fn accept(&self, address: impl Into<String>, channel: Box<dyn PeerChannel>) -> ChannelEvents {
        let address = address.into();
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let _ = self.tx.send(OverlayInput(InputKind::Incoming {
            connection_id,
            address: address.clone(),
            channel,
        }));

        ChannelEvents::new(self.tx.clone(), connection_id, address)
    }
}
