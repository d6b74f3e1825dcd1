//! In-memory transport for overlay tests.

use crate::protocol::PeerEnvelope;
use crate::transport::{
    ChannelEvents, IncomingChannels, PeerChannel, Result, Transport, TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    opens: Vec<String>,
    events: HashMap<String, ChannelEvents>,
    sent: HashMap<String, Vec<Vec<u8>>>,
    closes: Vec<String>,
    fail_open: HashSet<String>,
    fail_send: HashSet<String>,
}

/// Records every open, send and close. Tests drive channel lifecycle through
/// the stored [`ChannelEvents`].
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Events handle of the latest channel to `address`.
    pub(crate) fn events(&self, address: &str) -> ChannelEvents {
        self.state.lock().unwrap().events[address].clone()
    }

    /// Every address passed to `open`, in order.
    pub(crate) fn opens(&self) -> Vec<String> {
        self.state.lock().unwrap().opens.clone()
    }

    pub(crate) fn open_count(&self, address: &str) -> usize {
        self.opens().iter().filter(|a| *a == address).count()
    }

    pub(crate) fn close_count(&self, address: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.closes.iter().filter(|a| *a == address).count()
    }

    /// Envelopes sent to `address`, in order.
    pub(crate) fn sent(&self, address: &str) -> Vec<PeerEnvelope> {
        let state = self.state.lock().unwrap();
        state
            .sent
            .get(address)
            .map(|frames| {
                frames
                    .iter()
                    .map(|f| PeerEnvelope::from_bytes(f).unwrap())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    pub(crate) fn fail_open(&self, address: &str) {
        self.state.lock().unwrap().fail_open.insert(address.to_string());
    }

    pub(crate) fn fail_send(&self, address: &str) {
        self.state.lock().unwrap().fail_send.insert(address.to_string());
    }

    /// A channel for an inbound connection from `address`.
    pub(crate) fn channel(&self, address: &str) -> Box<dyn PeerChannel> {
        Box::new(MockChannel {
            address: address.to_string(),
            state: self.state.clone(),
        })
    }

    /// Keep the events handle of an inbound channel so tests can drive it.
    pub(crate) fn register(&self, events: ChannelEvents) {
        let mut state = self.state.lock().unwrap();
        state.events.insert(events.address().to_string(), events);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, peer_address: &str, events: ChannelEvents) -> Result<Box<dyn PeerChannel>> {
        let mut state = self.state.lock().unwrap();
        state.opens.push(peer_address.to_string());
        if state.fail_open.contains(peer_address) {
            return Err(TransportError::ConnectionFailed(peer_address.to_string()));
        }
        state.events.insert(peer_address.to_string(), events);
        drop(state);

        Ok(self.channel(peer_address))
    }
}

struct MockChannel {
    address: String,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl PeerChannel for MockChannel {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_send.contains(&self.address) {
            return Err(TransportError::SendFailed(self.address.clone()));
        }
        state
            .sent
            .entry(self.address.clone())
            .or_default()
            .push(data.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closes.push(self.address.clone());
        Ok(())
    }
}

/// Peers wired to each other in memory. Opening a channel hands the far end
/// to the remote overlay and reports it open on both sides; closing one end
/// reports `closed` on the other.
#[derive(Clone, Default)]
pub(crate) struct LinkedNetwork {
    peers: Arc<Mutex<HashMap<String, IncomingChannels>>>,
}

impl LinkedNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make `address` reachable through its overlay's inbound handle.
    pub(crate) fn join(&self, address: &str, incoming: IncomingChannels) {
        self.peers
            .lock()
            .unwrap()
            .insert(address.to_string(), incoming);
    }

    /// Transport dialing out as `address`.
    pub(crate) fn transport(&self, address: &str) -> LinkedTransport {
        LinkedTransport {
            address: address.to_string(),
            network: self.clone(),
        }
    }
}

pub(crate) struct LinkedTransport {
    address: String,
    network: LinkedNetwork,
}

#[async_trait]
impl Transport for LinkedTransport {
    async fn open(&self, peer_address: &str, events: ChannelEvents) -> Result<Box<dyn PeerChannel>> {
        let remote = self
            .network
            .peers
            .lock()
            .unwrap()
            .get(peer_address)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed(peer_address.to_string()))?;

        let far_end = LinkedChannel {
            remote: events.clone(),
        };
        let remote_events = remote.accept(self.address.clone(), Box::new(far_end));

        events.opened();
        remote_events.opened();
        Ok(Box::new(LinkedChannel {
            remote: remote_events,
        }))
    }
}

struct LinkedChannel {
    /// Events handle of the other end
    remote: ChannelEvents,
}

#[async_trait]
impl PeerChannel for LinkedChannel {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.remote.data(data.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.remote.closed();
        Ok(())
    }
}
