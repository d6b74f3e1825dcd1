//! Overlay connection manager.
//!
//! Owns every peer connection, the gossip state and the liveness timers.
//! All channel events, inbound channels and timer expiries arrive on one
//! internal queue and are applied one at a time by whoever drives the
//! manager, so the connection map and the seen cache need no locking.
//!
//! The caller is responsible for:
//! - Driving [`OverlayManager::process_next_event`] (or `recv_input` and
//!   `handle_input`) in a loop
//! - Either setting [`OverlayConfig::probe_interval`] or calling
//!   [`OverlayManager::probe_all`] periodically; a link nobody sends on is
//!   never checked, so a dead idle peer would otherwise stay connected

use super::connection::{
    Connection, ConnectionDirection, ConnectionInfo, ConnectionState, DisconnectReason,
    DuplicateCheck, check_duplicate,
};
use super::liveness::{self, DEFAULT_LIVENESS_TIMEOUT};
use crate::gossip::{GossipProtocol, ReceiveOutcome};
use crate::identity::Position;
use crate::message::{MessageOptions, WispMessage};
use crate::protocol::PeerEnvelope;
use crate::transport::{
    ChannelEvent, ChannelEvents, IncomingChannels, InputKind, OverlayInput, PeerChannel, Transport,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Chance that the greeting sent on open is a re-floodable shout.
pub const GREETING_SHOUT_PROBABILITY: f64 = 0.1;
pub const SHOUT_GREETING: &str = "OLA DORA!!!";
pub const WHISPER_GREETING: &str = "ola dora";

/// Overlay tuning.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Liveness window `T`; silent peers are evicted after `2T`
    pub liveness_timeout: Duration,
    /// Probability in `[0, 1]` of greeting with a shout instead of a whisper
    pub shout_probability: f64,
    pub shout_greeting: String,
    pub whisper_greeting: String,
    /// Ping every open peer on this interval; `None` leaves probing to the caller
    pub probe_interval: Option<Duration>,
}

impl OverlayConfig {
    /// Shout probability usable by the rng: clamped to `[0, 1]`, with NaN
    /// falling back to [`GREETING_SHOUT_PROBABILITY`].
    pub fn greeting_shout_probability(&self) -> f64 {
        if self.shout_probability.is_nan() {
            GREETING_SHOUT_PROBABILITY
        } else {
            self.shout_probability.clamp(0.0, 1.0)
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            shout_probability: GREETING_SHOUT_PROBABILITY,
            shout_greeting: SHOUT_GREETING.to_string(),
            whisper_greeting: WHISPER_GREETING.to_string(),
            probe_interval: None,
        }
    }
}

/// Event emitted to overlay observers.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayEvent {
    /// Channel reached `Open`
    PeerConnected { address: String },
    /// A previously open channel was dropped
    PeerDisconnected {
        address: String,
        reason: DisconnectReason,
    },
    /// The set of open peers changed
    ConnectionsChanged { peers: Vec<String> },
    /// First sighting of a gossip message
    Message { from: String, message: WispMessage },
}

/// Peer overlay manager.
pub struct OverlayManager {
    our_address: String,
    config: OverlayConfig,
    transport: Arc<dyn Transport>,
    /// Opening and open connections by peer address
    connections: HashMap<String, Connection>,
    /// Most recent reconciliation target, minus self
    desired_peers: BTreeSet<String>,
    gossip: GossipProtocol,
    rng: StdRng,
    next_connection_id: Arc<AtomicU64>,
    input_tx: mpsc::UnboundedSender<OverlayInput>,
    input_rx: mpsc::UnboundedReceiver<OverlayInput>,
    /// Dropped on close, which ends the observer stream
    event_tx: Option<mpsc::UnboundedSender<OverlayEvent>>,
    /// Probe ticker, started by the first `recv_input`
    prober: Option<JoinHandle<()>>,
}

impl OverlayManager {
    /// Create a manager for the peer at `our_address`.
    ///
    /// Returns the manager and the receiver for its events.
    pub fn new(
        our_address: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: OverlayConfig,
    ) -> (Self, mpsc::UnboundedReceiver<OverlayEvent>) {
        let our_address = our_address.into();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                gossip: GossipProtocol::new(our_address.clone()),
                our_address,
                config,
                transport,
                connections: HashMap::new(),
                desired_peers: BTreeSet::new(),
                rng: StdRng::from_os_rng(),
                next_connection_id: Arc::new(AtomicU64::new(1)),
                input_tx,
                input_rx,
                event_tx: Some(event_tx),
                prober: None,
            },
            event_rx,
        )
    }

    /// Replace the greeting randomness source, e.g. with a seeded rng.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn our_address(&self) -> &str {
        &self.our_address
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Handle for registering channels opened by remote peers.
    pub fn incoming(&self) -> IncomingChannels {
        IncomingChannels::new(self.input_tx.clone(), self.next_connection_id.clone())
    }

    /// Position stamped on messages we originate.
    pub fn set_position(&mut self, position: Option<Position>) {
        self.gossip.set_position(position);
    }

    pub fn gossip(&self) -> &GossipProtocol {
        &self.gossip
    }

    pub fn desired_peers(&self) -> &BTreeSet<String> {
        &self.desired_peers
    }

    /// Addresses of open connections, sorted.
    pub fn open_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .connections
            .values()
            .filter(|c| c.is_open())
            .map(|c| c.address.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Snapshot of every tracked connection, sorted by address.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.connections.values().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.address.cmp(&b.address));
        infos
    }

    pub fn connection_state(&self, address: &str) -> Option<ConnectionState> {
        self.connections.get(address).map(|c| c.state)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connections.get(address).is_some_and(|c| c.is_open())
    }

    pub fn is_closed(&self) -> bool {
        self.event_tx.is_none()
    }

    /// Converge the connection set on `desired`.
    ///
    /// Addresses both desired and already tracked (open or still opening) are
    /// left alone.
    pub async fn reconcile<I>(&mut self, desired: I)
    where
        I: IntoIterator<Item = String>,
    {
        if self.is_closed() {
            return;
        }

        let desired: BTreeSet<String> = desired
            .into_iter()
            .filter(|address| *address != self.our_address)
            .collect();

        let to_close: Vec<String> = self
            .connections
            .keys()
            .filter(|address| !desired.contains(*address))
            .cloned()
            .collect();
        let to_open: Vec<String> = desired
            .iter()
            .filter(|address| !self.connections.contains_key(*address))
            .cloned()
            .collect();

        debug!(
            "Reconciling overlay: {} to open, {} to close",
            to_open.len(),
            to_close.len()
        );
        self.desired_peers = desired;

        for address in to_close {
            self.drop_connection(&address, DisconnectReason::Reconciled)
                .await;
        }
        for address in to_open {
            self.open_connection(address).await;
        }
    }

    async fn open_connection(&mut self, address: String) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let events = ChannelEvents::new(self.input_tx.clone(), connection_id, address.clone());

        info!("Opening channel to {}", address);
        match self.transport.open(&address, events).await {
            Ok(channel) => {
                let conn = Connection::new(
                    address.clone(),
                    connection_id,
                    ConnectionDirection::Outgoing,
                    channel,
                );
                self.connections.insert(address.clone(), conn);
                self.schedule_opening_check(&address, connection_id);
            }
            Err(e) => {
                warn!("Failed to open channel to {}: {}", address, e);
            }
        }
    }

    /// Wait for the next channel event, inbound channel or timer expiry.
    ///
    /// Cancel-safe. Returns `None` once the manager is closed.
    pub async fn recv_input(&mut self) -> Option<OverlayInput> {
        if self.is_closed() {
            return None;
        }
        if self.prober.is_none() {
            let tx = self.input_tx.clone();
            self.prober = self
                .config
                .probe_interval
                .map(|interval| liveness::spawn_prober(tx, interval));
        }
        self.input_rx.recv().await
    }

    /// Apply one input from [`recv_input`](Self::recv_input).
    pub async fn handle_input(&mut self, input: OverlayInput) {
        match input.0 {
            InputKind::Incoming {
                connection_id,
                address,
                channel,
            } => {
                self.accept_incoming(connection_id, address, channel).await;
            }
            InputKind::Channel {
                connection_id,
                address,
                event,
            } => {
                if !self.is_current(&address, connection_id) {
                    debug!("Ignoring event for stale channel to {}", address);
                    return;
                }
                match event {
                    ChannelEvent::Opened => self.on_opened(&address).await,
                    ChannelEvent::Data(data) => self.on_data(&address, &data).await,
                    ChannelEvent::Closed => {
                        self.drop_connection(&address, DisconnectReason::RemoteClosed)
                            .await;
                    }
                    ChannelEvent::Failed(reason) => {
                        warn!("Channel to {} failed: {}", address, reason);
                        self.drop_connection(&address, DisconnectReason::TransportError)
                            .await;
                    }
                }
            }
            InputKind::LivenessCheck {
                connection_id,
                address,
            } => {
                self.check_liveness(connection_id, &address).await;
            }
            InputKind::Probe => self.probe_all().await,
        }
    }

    /// Receive and apply one input. Returns false once the manager is closed.
    pub async fn process_next_event(&mut self) -> bool {
        match self.recv_input().await {
            Some(input) => {
                self.handle_input(input).await;
                true
            }
            None => false,
        }
    }

    fn is_current(&self, address: &str, connection_id: u64) -> bool {
        self.connections
            .get(address)
            .is_some_and(|c| c.connection_id == connection_id)
    }

    async fn accept_incoming(
        &mut self,
        connection_id: u64,
        address: String,
        channel: Box<dyn PeerChannel>,
    ) {
        let duplicate = self.connections.get(&address).map(|existing| {
            check_duplicate(&self.our_address, &address, existing.direction)
        });
        let rejected = self.is_closed()
            || address == self.our_address
            || duplicate == Some(DuplicateCheck::KeepExisting);
        if rejected {
            debug!("Rejecting inbound channel from {}", address);
            Self::close_rejected(&address, channel).await;
            return;
        }
        if duplicate == Some(DuplicateCheck::ReplaceExisting) {
            info!("Both sides dialed {}, keeping its channel", address);
            self.drop_connection(&address, DisconnectReason::DuplicateConnection)
                .await;
        }

        info!("Inbound channel from {}", address);
        let conn = Connection::new(
            address.clone(),
            connection_id,
            ConnectionDirection::Incoming,
            channel,
        );
        self.connections.insert(address.clone(), conn);
        self.schedule_opening_check(&address, connection_id);
    }

    async fn close_rejected(address: &str, channel: Box<dyn PeerChannel>) {
        if let Err(e) = channel.close().await {
            debug!("Error closing rejected channel from {}: {}", address, e);
        }
    }

    async fn on_opened(&mut self, address: &str) {
        let Some(conn) = self.connections.get_mut(address) else {
            return;
        };
        if conn.state != ConnectionState::Opening {
            return;
        }
        conn.state = ConnectionState::Open;
        conn.touch();

        info!("Channel to {} open", address);
        self.emit(OverlayEvent::PeerConnected {
            address: address.to_string(),
        });
        self.emit_connections_changed();

        self.send_greeting(address).await;
    }

    async fn send_greeting(&mut self, address: &str) {
        let shout = self
            .rng
            .random_bool(self.config.greeting_shout_probability());
        let (text, options) = if shout {
            (self.config.shout_greeting.clone(), MessageOptions::shout())
        } else {
            (self.config.whisper_greeting.clone(), MessageOptions::whisper())
        };

        let message = self.gossip.originate(text, Some(options));
        self.send_envelope(address, &PeerEnvelope::PeerMessage(message))
            .await;
    }

    async fn on_data(&mut self, address: &str, data: &[u8]) {
        if let Some(conn) = self.connections.get_mut(address) {
            conn.touch();
        }

        match PeerEnvelope::from_bytes(data) {
            Ok(PeerEnvelope::PeerPing) => {
                debug!("Ping from {}", address);
                self.send_envelope(address, &PeerEnvelope::PeerPong).await;
            }
            Ok(PeerEnvelope::PeerPong) => {
                debug!("Pong from {}", address);
            }
            Ok(PeerEnvelope::PeerMessage(message)) => {
                self.on_peer_message(address, message).await;
            }
            Err(e) => {
                warn!("Unrecognized payload from {}: {}", address, e);
            }
        }
    }

    async fn on_peer_message(&mut self, from: &str, message: WispMessage) {
        let open = self.open_peers();
        let ReceiveOutcome::Delivered { forward_to } = self.gossip.receive(&message, from, &open)
        else {
            return;
        };

        let envelope = PeerEnvelope::PeerMessage(message.clone());
        self.emit(OverlayEvent::Message {
            from: from.to_string(),
            message,
        });

        for address in forward_to {
            debug!("Forwarding message from {} to {}", from, address);
            self.send_envelope(&address, &envelope).await;
        }
    }

    async fn check_liveness(&mut self, connection_id: u64, address: &str) {
        let Some(conn) = self.connections.get(address) else {
            return;
        };
        if conn.connection_id != connection_id {
            return;
        }

        if conn.is_opening() {
            if liveness::is_stale(conn.last_seen_at, Instant::now(), self.config.liveness_timeout) {
                warn!("Channel to {} never opened, dropping", address);
                self.drop_connection(address, DisconnectReason::TransportError)
                    .await;
            }
            return;
        }

        if liveness::is_stale(conn.last_seen_at, Instant::now(), self.config.liveness_timeout) {
            info!(
                "No traffic from {} for {:?}, closing",
                address,
                liveness::eviction_threshold(self.config.liveness_timeout)
            );
            self.drop_connection(address, DisconnectReason::LivenessTimeout)
                .await;
        }
    }

    /// Send one envelope to an open peer and schedule its liveness check.
    ///
    /// A send failure drops the connection.
    async fn send_envelope(&mut self, address: &str, envelope: &PeerEnvelope) -> bool {
        let bytes = envelope.to_bytes();
        let (connection_id, result) = match self.connections.get(address) {
            Some(conn) if conn.is_open() => (conn.connection_id, conn.send(&bytes).await),
            _ => {
                debug!("Not sending to {}: no open channel", address);
                return false;
            }
        };

        if let Err(e) = result {
            warn!("Send to {} failed: {}", address, e);
            self.drop_connection(address, DisconnectReason::TransportError)
                .await;
            return false;
        }

        self.schedule_check(address, connection_id, self.config.liveness_timeout);
        true
    }

    /// Check a new channel once it has had `2T` to open.
    fn schedule_opening_check(&mut self, address: &str, connection_id: u64) {
        let after = liveness::eviction_threshold(self.config.liveness_timeout);
        self.schedule_check(address, connection_id, after);
    }

    fn schedule_check(&mut self, address: &str, connection_id: u64, after: Duration) {
        let timer = liveness::schedule_check(
            self.input_tx.clone(),
            connection_id,
            address.to_string(),
            after,
        );
        if let Some(conn) = self.connections.get_mut(address) {
            conn.track_timer(timer);
        }
    }

    /// Flood a new message to every open peer.
    ///
    /// The message is marked seen first, so it is never delivered back to
    /// our own observers. Returns `None` once closed.
    pub async fn broadcast(
        &mut self,
        payload: impl Into<String>,
        options: Option<MessageOptions>,
    ) -> Option<WispMessage> {
        if self.is_closed() {
            return None;
        }

        let message = self.gossip.originate(payload, options);
        let envelope = PeerEnvelope::PeerMessage(message.clone());
        for address in self.open_peers() {
            self.send_envelope(&address, &envelope).await;
        }
        Some(message)
    }

    /// Send a new message to a single open peer.
    pub async fn send_to(
        &mut self,
        address: &str,
        payload: impl Into<String>,
        options: Option<MessageOptions>,
    ) -> Option<WispMessage> {
        if self.is_closed() || !self.is_connected(address) {
            return None;
        }

        let message = self.gossip.originate(payload, options);
        let sent = self
            .send_envelope(address, &PeerEnvelope::PeerMessage(message.clone()))
            .await;
        sent.then_some(message)
    }

    /// Ping every open peer. Each ping schedules a liveness check.
    pub async fn probe_all(&mut self) {
        for address in self.open_peers() {
            self.send_envelope(&address, &PeerEnvelope::PeerPing).await;
        }
    }

    async fn drop_connection(&mut self, address: &str, reason: DisconnectReason) {
        let Some(mut conn) = self.connections.remove(address) else {
            return;
        };
        let was_open = conn.is_open();
        conn.close().await;
        info!("Dropped connection to {} ({:?})", address, reason);

        if was_open {
            self.emit(OverlayEvent::PeerDisconnected {
                address: address.to_string(),
                reason,
            });
            self.emit_connections_changed();
        }
    }

    /// Close every connection, cancel all liveness checks and end the event
    /// stream. Idempotent.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        info!("Closing overlay with {} connections", self.connections.len());
        if let Some(prober) = self.prober.take() {
            prober.abort();
        }

        let addresses: Vec<String> = self.connections.keys().cloned().collect();
        for address in addresses {
            self.drop_connection(&address, DisconnectReason::Shutdown)
                .await;
        }
        self.desired_peers.clear();
        self.event_tx = None;

        while let Ok(OverlayInput(kind)) = self.input_rx.try_recv() {
            if let InputKind::Incoming {
                address, channel, ..
            } = kind
            {
                Self::close_rejected(&address, channel).await;
            }
        }
    }

    fn emit(&self, event: OverlayEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn emit_connections_changed(&self) {
        self.emit(OverlayEvent::ConnectionsChanged {
            peers: self.open_peers(),
        });
    }
}

impl Drop for OverlayManager {
    fn drop(&mut self) {
        if let Some(prober) = self.prober.take() {
            prober.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LinkedNetwork, MockTransport};

    fn quiet_config() -> OverlayConfig {
        OverlayConfig {
            shout_probability: 0.0,
            ..Default::default()
        }
    }

    fn setup_with(
        config: OverlayConfig,
    ) -> (
        OverlayManager,
        mpsc::UnboundedReceiver<OverlayEvent>,
        MockTransport,
    ) {
        let mock = MockTransport::new();
        let (manager, events) = OverlayManager::new("me", Arc::new(mock.clone()), config);
        (manager, events, mock)
    }

    fn setup() -> (
        OverlayManager,
        mpsc::UnboundedReceiver<OverlayEvent>,
        MockTransport,
    ) {
        setup_with(quiet_config())
    }

    fn addresses(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    async fn connect(manager: &mut OverlayManager, mock: &MockTransport, peers: &[&str]) {
        manager.reconcile(addresses(peers)).await;
        for peer in peers {
            mock.events(peer).opened();
            assert!(manager.process_next_event().await);
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<OverlayEvent>) -> Vec<OverlayEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn messages_sent(mock: &MockTransport, address: &str) -> Vec<WispMessage> {
        mock.sent(address)
            .into_iter()
            .filter_map(|e| match e {
                PeerEnvelope::PeerMessage(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reconcile_opens_desired_and_skips_self() {
        let (mut manager, _events, mock) = setup();

        manager.reconcile(addresses(&["p2", "me", "p3"])).await;

        let mut opened = mock.opens();
        opened.sort();
        assert_eq!(opened, addresses(&["p2", "p3"]));
        assert_eq!(manager.connection_state("p2"), Some(ConnectionState::Opening));
        assert_eq!(manager.connection_state("me"), None);
        assert!(manager.open_peers().is_empty());
        assert_eq!(manager.desired_peers().len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_convergence_leaves_common_peer_untouched() {
        let (mut manager, _events, mock) = setup();
        connect(&mut manager, &mock, &["a", "b"]).await;

        manager.reconcile(addresses(&["b", "c"])).await;
        mock.events("c").opened();
        manager.process_next_event().await;

        assert_eq!(manager.open_peers(), addresses(&["b", "c"]));
        assert_eq!(mock.close_count("a"), 1);
        assert_eq!(mock.open_count("b"), 1);
        assert_eq!(mock.close_count("b"), 0);
        assert_eq!(mock.open_count("c"), 1);
    }

    #[tokio::test]
    async fn test_reconcile_does_not_reopen_opening_channel() {
        let (mut manager, _events, mock) = setup();

        manager.reconcile(addresses(&["p2"])).await;
        manager.reconcile(addresses(&["p2"])).await;

        assert_eq!(mock.open_count("p2"), 1);
    }

    #[tokio::test]
    async fn test_failed_open_is_not_tracked() {
        let (mut manager, _events, mock) = setup();
        mock.fail_open("p2");

        manager.reconcile(addresses(&["p2", "p3"])).await;

        assert_eq!(manager.connection_state("p2"), None);
        assert_eq!(manager.connection_state("p3"), Some(ConnectionState::Opening));

        // Retried on the next reconcile
        manager.reconcile(addresses(&["p2", "p3"])).await;
        assert_eq!(mock.open_count("p2"), 2);
    }

    #[tokio::test]
    async fn test_open_emits_events_and_whispers_greeting() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;

        assert_eq!(
            drain(&mut events),
            vec![
                OverlayEvent::PeerConnected {
                    address: "p2".into()
                },
                OverlayEvent::ConnectionsChanged {
                    peers: addresses(&["p2"])
                },
            ]
        );

        let greetings = messages_sent(&mock, "p2");
        assert_eq!(greetings.len(), 1);
        assert_eq!(greetings[0].payload, WHISPER_GREETING);
        assert!(greetings[0].is_whisper());
        assert_eq!(greetings[0].sender_peer_address, "me");
    }

    #[tokio::test]
    async fn test_shout_greeting() {
        let (mut manager, _events, mock) = setup_with(OverlayConfig {
            shout_probability: 1.0,
            ..Default::default()
        });
        connect(&mut manager, &mock, &["p2"]).await;

        let greetings = messages_sent(&mock, "p2");
        assert_eq!(greetings[0].payload, SHOUT_GREETING);
        assert!(!greetings[0].is_whisper());
    }

    #[tokio::test]
    async fn test_seeded_rng_greeting_is_reproducible() {
        let pick = |seed: u64| async move {
            let mock = MockTransport::new();
            let (manager, _events) =
                OverlayManager::new("me", Arc::new(mock.clone()), OverlayConfig::default());
            let mut manager = manager.with_rng(StdRng::seed_from_u64(seed));
            connect(&mut manager, &mock, &["p2", "p3", "p4", "p5"]).await;
            ["p2", "p3", "p4", "p5"]
                .iter()
                .map(|p| messages_sent(&mock, p)[0].is_whisper())
                .collect::<Vec<_>>()
        };

        assert_eq!(pick(7).await, pick(7).await);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (mut manager, _events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;
        mock.clear_sent();

        mock.events("p2").data(PeerEnvelope::PeerPing.to_bytes());
        manager.process_next_event().await;

        assert_eq!(mock.sent("p2"), vec![PeerEnvelope::PeerPong]);
    }

    #[tokio::test]
    async fn test_unknown_payload_ignored() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;
        drain(&mut events);
        mock.clear_sent();

        mock.events("p2").data(br#"{"type":"peer_heartbeat"}"#.to_vec());
        manager.process_next_event().await;

        assert!(manager.is_connected("p2"));
        assert!(drain(&mut events).is_empty());
        assert!(mock.sent("p2").is_empty());
    }

    #[tokio::test]
    async fn test_message_delivered_once_and_forwarded_to_others() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2", "p3", "p4"]).await;
        drain(&mut events);
        mock.clear_sent();

        let message = WispMessage::new(1, "p9", None, "hello", Some(MessageOptions::shout()));
        let frame = PeerEnvelope::PeerMessage(message.clone()).to_bytes();

        mock.events("p2").data(frame.clone());
        manager.process_next_event().await;

        assert_eq!(
            drain(&mut events),
            vec![OverlayEvent::Message {
                from: "p2".into(),
                message: message.clone()
            }]
        );
        assert!(mock.sent("p2").is_empty());
        assert_eq!(messages_sent(&mock, "p3"), vec![message.clone()]);
        assert_eq!(messages_sent(&mock, "p4"), vec![message.clone()]);

        // Re-entry through a third party is dropped
        mock.clear_sent();
        mock.events("p3").data(frame);
        manager.process_next_event().await;

        assert!(drain(&mut events).is_empty());
        assert!(mock.sent("p2").is_empty());
        assert!(mock.sent("p4").is_empty());
    }

    #[tokio::test]
    async fn test_whisper_delivered_not_forwarded() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2", "p3"]).await;
        drain(&mut events);
        mock.clear_sent();

        let message = WispMessage::new(1, "p2", None, "psst", Some(MessageOptions::whisper()));
        mock.events("p2")
            .data(PeerEnvelope::PeerMessage(message).to_bytes());
        manager.process_next_event().await;

        assert_eq!(drain(&mut events).len(), 1);
        assert!(mock.sent("p3").is_empty());
    }

    #[tokio::test]
    async fn test_tampered_message_dropped() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2", "p3"]).await;
        drain(&mut events);
        mock.clear_sent();

        let mut message = WispMessage::new(1, "p2", None, "hi", None);
        message.payload = "forged".into();
        mock.events("p2")
            .data(PeerEnvelope::PeerMessage(message).to_bytes());
        manager.process_next_event().await;

        assert!(drain(&mut events).is_empty());
        assert!(mock.sent("p3").is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_and_is_not_self_delivered() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2", "p3"]).await;
        drain(&mut events);
        mock.clear_sent();

        let message = manager
            .broadcast("hi all", Some(MessageOptions::shout()))
            .await
            .unwrap();
        assert_eq!(messages_sent(&mock, "p2"), vec![message.clone()]);
        assert_eq!(messages_sent(&mock, "p3"), vec![message.clone()]);

        // Echo from the mesh
        mock.events("p2")
            .data(PeerEnvelope::PeerMessage(message).to_bytes());
        manager.process_next_event().await;
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_carries_position() {
        let (mut manager, _events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;

        let position = Position::new(14.6, 121.0, 2);
        manager.set_position(Some(position));
        let message = manager.broadcast("here", None).await.unwrap();

        assert_eq!(message.sender_position, Some(position));
    }

    #[tokio::test]
    async fn test_send_to_single_peer() {
        let (mut manager, _events, mock) = setup();
        connect(&mut manager, &mock, &["p2", "p3"]).await;
        mock.clear_sent();

        let message = manager.send_to("p3", "just you", None).await.unwrap();
        assert_eq!(messages_sent(&mock, "p3"), vec![message]);
        assert!(mock.sent("p2").is_empty());

        assert!(manager.send_to("p9", "nobody", None).await.is_none());
    }

    #[tokio::test]
    async fn test_remote_close_removes_connection_once() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;
        drain(&mut events);

        let handle = mock.events("p2");
        handle.closed();
        handle.closed();
        manager.process_next_event().await;
        manager.process_next_event().await;

        assert_eq!(manager.connection_state("p2"), None);
        assert_eq!(
            drain(&mut events),
            vec![
                OverlayEvent::PeerDisconnected {
                    address: "p2".into(),
                    reason: DisconnectReason::RemoteClosed
                },
                OverlayEvent::ConnectionsChanged { peers: vec![] },
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_disconnect() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;
        drain(&mut events);

        mock.events("p2").failed("ice negotiation failed");
        manager.process_next_event().await;

        assert_eq!(manager.connection_state("p2"), None);
        assert!(drain(&mut events).contains(&OverlayEvent::PeerDisconnected {
            address: "p2".into(),
            reason: DisconnectReason::TransportError
        }));
    }

    #[tokio::test]
    async fn test_send_failure_drops_connection() {
        let (mut manager, _events, mock) = setup();
        connect(&mut manager, &mock, &["p2", "p3"]).await;

        mock.fail_send("p2");
        manager.broadcast("hi", None).await;

        assert_eq!(manager.open_peers(), addresses(&["p3"]));
    }

    #[tokio::test]
    async fn test_stale_event_does_not_touch_newer_channel() {
        let (mut manager, _events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;
        let old = mock.events("p2");

        manager.reconcile(vec![]).await;
        connect(&mut manager, &mock, &["p2"]).await;
        assert_eq!(mock.open_count("p2"), 2);

        old.closed();
        manager.process_next_event().await;

        assert!(manager.is_connected("p2"));
    }

    #[tokio::test]
    async fn test_inbound_channel_registered_and_duplicate_closed() {
        let (mut manager, _events, mock) = setup();
        let incoming = manager.incoming();

        let events = incoming.accept("p7", mock.channel("p7"));
        mock.register(events);
        manager.process_next_event().await;
        assert_eq!(manager.connection_state("p7"), Some(ConnectionState::Opening));

        mock.events("p7").opened();
        manager.process_next_event().await;
        assert!(manager.is_connected("p7"));
        assert_eq!(
            manager.connections()[0].direction,
            ConnectionDirection::Incoming
        );

        let _duplicate = incoming.accept("p7", mock.channel("p7"));
        manager.process_next_event().await;
        assert_eq!(mock.close_count("p7"), 1);
        assert!(manager.is_connected("p7"));
    }

    #[tokio::test]
    async fn test_inbound_from_lower_address_replaces_own_dial() {
        let (mut manager, _events, mock) = setup();
        let incoming = manager.incoming();
        manager.reconcile(addresses(&["a", "z"])).await;

        // "a" < "me": its channel wins
        let events = incoming.accept("a", mock.channel("a"));
        mock.register(events);
        manager.process_next_event().await;
        assert_eq!(mock.close_count("a"), 1);
        assert_eq!(
            manager.connections()[0],
            ConnectionInfo {
                address: "a".into(),
                direction: ConnectionDirection::Incoming,
                state: ConnectionState::Opening,
            }
        );

        mock.events("a").opened();
        manager.process_next_event().await;
        assert!(manager.is_connected("a"));

        // "z" > "me": our dial wins
        let _rejected = incoming.accept("z", mock.channel("z"));
        manager.process_next_event().await;
        assert_eq!(mock.close_count("z"), 1);
        assert_eq!(
            manager.connections()[1].direction,
            ConnectionDirection::Outgoing
        );
        assert_eq!(mock.open_count("a"), 1);
    }

    /// Apply queued inputs on both managers until neither has any left.
    async fn settle(a: &mut OverlayManager, b: &mut OverlayManager) {
        loop {
            let mut progressed = false;
            for manager in [&mut *a, &mut *b] {
                while let Ok(input) = manager.input_rx.try_recv() {
                    manager.handle_input(input).await;
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_simultaneous_dial_keeps_one_channel() {
        let network = LinkedNetwork::new();
        let (mut a, mut a_events) =
            OverlayManager::new("a", Arc::new(network.transport("a")), quiet_config());
        let (mut b, mut b_events) =
            OverlayManager::new("b", Arc::new(network.transport("b")), quiet_config());
        network.join("a", a.incoming());
        network.join("b", b.incoming());

        // Each dials before seeing the other's channel
        a.reconcile(addresses(&["b"])).await;
        b.reconcile(addresses(&["a"])).await;
        settle(&mut a, &mut b).await;

        assert!(a.is_connected("b"));
        assert!(b.is_connected("a"));
        assert_eq!(a.connections()[0].direction, ConnectionDirection::Outgoing);
        assert_eq!(b.connections()[0].direction, ConnectionDirection::Incoming);
        drain(&mut a_events);
        drain(&mut b_events);

        // The surviving channel carries traffic both ways
        let to_b = a.send_to("b", "hi b", None).await.unwrap();
        let to_a = b.send_to("a", "hi a", None).await.unwrap();
        settle(&mut a, &mut b).await;

        assert_eq!(
            drain(&mut b_events),
            vec![OverlayEvent::Message {
                from: "a".into(),
                message: to_b
            }]
        );
        assert_eq!(
            drain(&mut a_events),
            vec![OverlayEvent::Message {
                from: "b".into(),
                message: to_a
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_that_never_opens_is_dropped() {
        let (mut manager, mut events, mock) = setup();
        manager.reconcile(addresses(&["p2"])).await;
        let inbound = manager.incoming().accept("p7", mock.channel("p7"));
        mock.register(inbound);
        manager.process_next_event().await;

        tokio::time::advance(DEFAULT_LIVENESS_TIMEOUT).await;
        tokio::task::yield_now().await;
        assert!(manager.input_rx.try_recv().is_err());

        tokio::time::advance(DEFAULT_LIVENESS_TIMEOUT).await;
        manager.process_next_event().await;
        manager.process_next_event().await;

        assert!(manager.connections().is_empty());
        assert_eq!(mock.close_count("p2"), 1);
        assert_eq!(mock.close_count("p7"), 1);
        // Never announced, so nothing to take back
        assert!(drain(&mut events).is_empty());

        manager.reconcile(addresses(&["p2"])).await;
        assert_eq!(mock.open_count("p2"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_opened_in_time_survives_opening_check() {
        let (mut manager, _events, mock) = setup();
        manager.reconcile(addresses(&["p2"])).await;

        tokio::time::advance(DEFAULT_LIVENESS_TIMEOUT).await;
        mock.events("p2").opened();
        manager.process_next_event().await;
        mock.events("p2").data(PeerEnvelope::PeerPong.to_bytes());
        manager.process_next_event().await;

        tokio::time::advance(DEFAULT_LIVENESS_TIMEOUT).await;
        manager.process_next_event().await;

        assert!(manager.is_connected("p2"));
    }

    #[test]
    fn test_shout_probability_sanitized() {
        let with = |p: f64| OverlayConfig {
            shout_probability: p,
            ..Default::default()
        };

        assert_eq!(
            with(f64::NAN).greeting_shout_probability(),
            GREETING_SHOUT_PROBABILITY
        );
        assert_eq!(with(3.0).greeting_shout_probability(), 1.0);
        assert_eq!(with(-1.0).greeting_shout_probability(), 0.0);
        assert_eq!(with(0.25).greeting_shout_probability(), 0.25);
    }

    #[tokio::test]
    async fn test_nan_shout_probability_still_greets() {
        let (mut manager, _events, mock) = setup_with(OverlayConfig {
            shout_probability: f64::NAN,
            ..Default::default()
        });
        connect(&mut manager, &mock, &["p2"]).await;

        assert_eq!(messages_sent(&mock, "p2").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_interval_pings_open_peers() {
        let (mut manager, _events, mock) = setup_with(OverlayConfig {
            probe_interval: Some(Duration::from_secs(2)),
            ..quiet_config()
        });
        connect(&mut manager, &mock, &["p2", "p3"]).await;
        mock.clear_sent();

        // First tick comes before any liveness check
        manager.process_next_event().await;
        assert_eq!(mock.sent("p2"), vec![PeerEnvelope::PeerPing]);
        assert_eq!(mock.sent("p3"), vec![PeerEnvelope::PeerPing]);

        manager.process_next_event().await;
        assert_eq!(mock.sent("p2").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_evicts_silent_peer() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;
        drain(&mut events);

        // Check scheduled by the greeting: silent for T only
        tokio::time::advance(DEFAULT_LIVENESS_TIMEOUT).await;
        manager.process_next_event().await;
        assert!(manager.is_connected("p2"));

        manager.probe_all().await;
        assert_eq!(mock.sent("p2").last(), Some(&PeerEnvelope::PeerPing));

        tokio::time::advance(DEFAULT_LIVENESS_TIMEOUT).await;
        manager.process_next_event().await;

        assert!(!manager.is_connected("p2"));
        assert_eq!(mock.close_count("p2"), 1);
        assert!(drain(&mut events).contains(&OverlayEvent::PeerDisconnected {
            address: "p2".into(),
            reason: DisconnectReason::LivenessTimeout
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_spares_peer_that_answers() {
        let (mut manager, _events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;

        tokio::time::advance(DEFAULT_LIVENESS_TIMEOUT).await;
        manager.process_next_event().await;
        manager.probe_all().await;

        tokio::time::advance(Duration::from_secs(3)).await;
        mock.events("p2").data(PeerEnvelope::PeerPong.to_bytes());
        manager.process_next_event().await;

        tokio::time::advance(Duration::from_secs(2)).await;
        manager.process_next_event().await;

        assert!(manager.is_connected("p2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_check_for_other_channel_is_noop() {
        let (mut manager, _events, mock) = setup();
        connect(&mut manager, &mock, &["p2"]).await;
        tokio::time::advance(DEFAULT_LIVENESS_TIMEOUT * 3).await;

        manager
            .handle_input(OverlayInput(InputKind::LivenessCheck {
                connection_id: u64::MAX,
                address: "p2".into(),
            }))
            .await;
        manager
            .handle_input(OverlayInput(InputKind::LivenessCheck {
                connection_id: 1,
                address: "p9".into(),
            }))
            .await;

        assert!(manager.is_connected("p2"));
        assert_eq!(mock.close_count("p2"), 0);
    }

    #[tokio::test]
    async fn test_close_ends_event_stream() {
        let (mut manager, mut events, mock) = setup();
        connect(&mut manager, &mock, &["p2", "p3"]).await;
        drain(&mut events);

        manager.close().await;

        assert_eq!(mock.close_count("p2"), 1);
        assert_eq!(mock.close_count("p3"), 1);
        assert!(manager.connections().is_empty());
        assert!(manager.is_closed());
        assert!(!manager.process_next_event().await);

        let mut disconnects = 0;
        while let Some(event) = events.recv().await {
            if matches!(event, OverlayEvent::PeerDisconnected { reason: DisconnectReason::Shutdown, .. }) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 2);

        assert!(manager.broadcast("late", None).await.is_none());
        manager.reconcile(addresses(&["p4"])).await;
        assert_eq!(mock.open_count("p4"), 0);
    }
}
