//! A single peer channel tracked by the overlay.

use crate::transport::PeerChannel;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of a connection: `Opening → Open → Closed`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// Channel requested, transport has not reported it usable yet
    Opening,
    Open,
    Closed,
}

/// Connection direction from our perspective.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

/// Reason a connection was dropped.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// Address left the desired peer set
    Reconciled,
    /// Remote peer closed the channel
    RemoteClosed,
    /// Negotiation failure, send failure or abrupt error
    TransportError,
    /// No traffic for two liveness windows
    LivenessTimeout,
    /// Both peers dialed each other; the other channel was kept
    DuplicateConnection,
    /// Overlay shut down
    Shutdown,
}

/// Snapshot of a connection for observers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub address: String,
    pub direction: ConnectionDirection,
    pub state: ConnectionState,
}

/// What to do with an inbound channel from an address already tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DuplicateCheck {
    /// Keep the tracked connection, close the inbound channel
    KeepExisting,
    /// Drop the tracked connection, keep the inbound channel
    ReplaceExisting,
}

/// Resolve a duplicate so that both ends keep the same channel: the one
/// dialed by the lower address. An inbound channel is always dialed by
/// `remote`; a second inbound channel never replaces the first.
pub(crate) fn check_duplicate(
    our_address: &str,
    remote_address: &str,
    existing: ConnectionDirection,
) -> DuplicateCheck {
    match existing {
        ConnectionDirection::Outgoing if remote_address < our_address => {
            DuplicateCheck::ReplaceExisting
        }
        _ => DuplicateCheck::KeepExisting,
    }
}

pub(crate) struct Connection {
    pub(crate) address: String,
    /// Distinguishes this channel from earlier ones to the same address
    pub(crate) connection_id: u64,
    pub(crate) direction: ConnectionDirection,
    pub(crate) state: ConnectionState,
    pub(crate) last_seen_at: Instant,
    channel: Box<dyn PeerChannel>,
    /// Pending liveness checks
    timers: Vec<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn new(
        address: String,
        connection_id: u64,
        direction: ConnectionDirection,
        channel: Box<dyn PeerChannel>,
    ) -> Self {
        Self {
            address,
            connection_id,
            direction,
            state: ConnectionState::Opening,
            last_seen_at: Instant::now(),
            channel,
            timers: Vec::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Record inbound traffic.
    pub(crate) fn touch(&mut self) {
        self.last_seen_at = Instant::now();
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            address: self.address.clone(),
            direction: self.direction,
            state: self.state,
        }
    }

    pub(crate) async fn send(&self, data: &[u8]) -> crate::transport::Result<()> {
        self.channel.send(data).await
    }

    pub(crate) fn track_timer(&mut self, timer: JoinHandle<()>) {
        self.timers.retain(|t| !t.is_finished());
        self.timers.push(timer);
    }

    pub(crate) fn is_opening(&self) -> bool {
        self.state == ConnectionState::Opening
    }

    /// Close the channel and cancel pending checks. Idempotent.
    pub(crate) async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.abort_timers();

        if let Err(e) = self.channel.close().await {
            debug!("Error closing channel to {}: {}", self.address, e);
        }
    }

    fn abort_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort_timers();
    }
}
