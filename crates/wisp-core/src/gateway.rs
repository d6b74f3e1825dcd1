//! Signaling gateway: one session state machine per signaling connection.
//!
//! The gateway binds a connection key to an identity in the presence store
//! and turns client commands into store operations. It does no I/O of its
//! own; the server routes each [`GatewayOutput`] to the requester and/or to
//! every connection.
//!
//! Session lifecycle: `Anonymous -> Identified -> Closed`. `logout` moves an
//! identified session back to a fresh anonymous identity; nothing leaves
//! `Closed`.

use crate::identity::{Identity, IdentityPatch, Position};
use crate::presence::{PresenceError, PresenceStore};
use crate::protocol::{SignalingReply, SignalingRequest};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Neighbors returned per scout unless configured otherwise.
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

/// Session state for one signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected with a server-minted identity
    Anonymous,
    /// Logged in with client-supplied fields merged in
    Identified,
    /// Disconnected; accepts no further commands
    Closed,
}

/// One signaling connection's view of the gateway.
#[derive(Debug)]
pub struct Session {
    key: String,
    state: SessionState,
}

impl Session {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}

/// What the server should send after a gateway step.
#[derive(Debug, Default, PartialEq)]
pub struct GatewayOutput {
    /// Sent to the requesting connection only
    pub reply: Option<SignalingReply>,
    /// Sent to every open connection
    pub broadcast: Option<SignalingReply>,
}

impl GatewayOutput {
    fn reply(reply: SignalingReply) -> Self {
        Self {
            reply: Some(reply),
            broadcast: None,
        }
    }

    fn broadcast(broadcast: Option<SignalingReply>) -> Self {
        Self {
            reply: None,
            broadcast,
        }
    }
}

/// Translates signaling commands into presence store operations.
pub struct SignalingGateway {
    store: Arc<dyn PresenceStore>,
    sample_size: usize,
}

impl SignalingGateway {
    pub fn new(store: Arc<dyn PresenceStore>, sample_size: usize) -> Self {
        Self { store, sample_size }
    }

    pub fn with_defaults(store: Arc<dyn PresenceStore>) -> Self {
        Self::new(store, DEFAULT_SAMPLE_SIZE)
    }

    /// Register a new connection under a fresh anonymous identity.
    ///
    /// The output carries the updated count for every connection.
    pub async fn connect(
        &self,
        key: impl Into<String>,
    ) -> Result<(Session, GatewayOutput), PresenceError> {
        let key = key.into();
        let identity = Identity::anonymous();
        debug!("Session {} starts as {}", key, identity.ephemeral_id);

        self.store.add_identity(&key, identity).await?;

        let session = Session {
            key,
            state: SessionState::Anonymous,
        };
        Ok((session, GatewayOutput::broadcast(self.count_broadcast().await)))
    }

    /// Remove a connection's identity and close the session.
    ///
    /// Idempotent: a closed session produces no output.
    pub async fn disconnect(&self, session: &mut Session) -> Result<GatewayOutput, PresenceError> {
        if session.state == SessionState::Closed {
            return Ok(GatewayOutput::default());
        }
        session.state = SessionState::Closed;
        self.store.remove_identity(&session.key).await?;
        Ok(GatewayOutput::broadcast(self.count_broadcast().await))
    }

    /// Parse and handle a raw frame.
    ///
    /// Unparseable frames and unknown types are answered with an `error`
    /// reply; the session state is left unchanged.
    pub async fn handle_frame(&self, session: &mut Session, data: &[u8]) -> GatewayOutput {
        match SignalingRequest::parse(data) {
            Ok(request) => self.handle(session, request).await,
            Err(e) => {
                warn!("Rejected frame from {}: {}", session.key, e);
                GatewayOutput::reply(SignalingReply::error(e.to_string()))
            }
        }
    }

    /// Handle one parsed command.
    pub async fn handle(&self, session: &mut Session, request: SignalingRequest) -> GatewayOutput {
        if session.state == SessionState::Closed {
            return GatewayOutput::reply(SignalingReply::error("session closed"));
        }

        let result = match request {
            SignalingRequest::Login(patch) => self.login(session, patch).await,
            SignalingRequest::Logout => self.logout(session).await,
            SignalingRequest::Scout(scout) => self.scout(session, scout.position).await,
            SignalingRequest::Wisps => self
                .store
                .count_active()
                .await
                .map(SignalingReply::Wisps),
        };

        match result {
            Ok(reply) => GatewayOutput::reply(reply),
            Err(e) => {
                error!("Presence store failed for {}: {}", session.key, e);
                GatewayOutput::reply(SignalingReply::error(e.to_string()))
            }
        }
    }

    async fn login(
        &self,
        session: &mut Session,
        patch: IdentityPatch,
    ) -> Result<SignalingReply, PresenceError> {
        let current = match self.store.get_identity(&session.key).await? {
            Some(identity) => identity,
            None => Identity::anonymous(),
        };
        let merged = current.merge(&patch);

        self.store.add_identity(&session.key, merged.clone()).await?;
        session.state = SessionState::Identified;
        debug!("Session {} logged in as {:?}", session.key, merged.peer_address);

        Ok(SignalingReply::Login(merged))
    }

    async fn logout(&self, session: &mut Session) -> Result<SignalingReply, PresenceError> {
        let anonymous = Identity::anonymous();

        self.store
            .add_identity(&session.key, anonymous.clone())
            .await?;
        session.state = SessionState::Anonymous;
        debug!("Session {} re-anonymized", session.key);

        Ok(SignalingReply::Logout(anonymous))
    }

    async fn scout(
        &self,
        session: &mut Session,
        position: Option<Position>,
    ) -> Result<SignalingReply, PresenceError> {
        self.store.set_position(&session.key, position).await?;

        let neighbors = self
            .store
            .sample_neighbors(&session.key, self.sample_size)
            .await?
            .iter()
            .map(Identity::to_neighbor)
            .collect::<Vec<_>>();
        debug!("Session {} scouted {} neighbor(s)", session.key, neighbors.len());

        Ok(SignalingReply::Scout(neighbors))
    }

    async fn count_broadcast(&self) -> Option<SignalingReply> {
        match self.store.count_active().await {
            Ok(count) => Some(SignalingReply::Wisps(count)),
            Err(e) => {
                error!("Failed to count active wisps: {}", e);
                None
            }
        }
    }
}
