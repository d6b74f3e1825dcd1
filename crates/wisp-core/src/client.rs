//! Client side of the signaling protocol.
//!
//! Builds requests for the signaling server and applies its replies. Every
//! `scout` reply becomes the overlay's new desired peer set.

use crate::identity::{Identity, IdentityPatch, Position};
use crate::overlay::OverlayManager;
use crate::protocol::{ProtocolError, ScoutRequest, SignalingReply, SignalingRequest};
use tracing::{debug, info, warn};

pub struct WispClient {
    overlay: OverlayManager,
    identity: Option<Identity>,
    active_count: Option<usize>,
    /// Last known position, kept when a scout has none
    position: Option<Position>,
}

impl WispClient {
    pub fn new(overlay: OverlayManager) -> Self {
        Self {
            overlay,
            identity: None,
            active_count: None,
            position: None,
        }
    }

    /// Our overlay address, advertised at login.
    pub fn peer_address(&self) -> &str {
        self.overlay.our_address()
    }

    pub fn overlay(&self) -> &OverlayManager {
        &self.overlay
    }

    pub fn overlay_mut(&mut self) -> &mut OverlayManager {
        &mut self.overlay
    }

    pub fn into_overlay(self) -> OverlayManager {
        self.overlay
    }

    /// Identity last confirmed by the server.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Active participant count last reported by the server.
    pub fn active_count(&self) -> Option<usize> {
        self.active_count
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn login_request(&self) -> SignalingRequest {
        SignalingRequest::Login(IdentityPatch::with_peer_address(self.peer_address()))
    }

    /// Login carrying a user id as well as our address.
    pub fn login_as(&self, user_id: impl Into<String>) -> SignalingRequest {
        SignalingRequest::Login(IdentityPatch {
            user_id: Some(user_id.into()),
            peer_address: Some(self.peer_address().to_string()),
        })
    }

    pub fn logout_request(&self) -> SignalingRequest {
        SignalingRequest::Logout
    }

    /// Ask for neighbors near `position`.
    ///
    /// A missing position is still a valid scout; the previous position keeps
    /// being stamped on outgoing gossip.
    pub fn scout_request(&mut self, position: Option<Position>) -> SignalingRequest {
        if let Some(position) = position {
            self.position = Some(position);
            self.overlay.set_position(Some(position));
        }
        SignalingRequest::Scout(ScoutRequest { position })
    }

    pub fn count_request(&self) -> SignalingRequest {
        SignalingRequest::Wisps
    }

    /// Apply a reply or broadcast from the server.
    pub async fn handle_reply(&mut self, reply: SignalingReply) {
        match reply {
            SignalingReply::Login(identity) => {
                info!("Logged in as {:?}", identity.user_id);
                self.identity = Some(identity);
            }
            SignalingReply::Logout(identity) => {
                info!("Logged out, now anonymous");
                self.identity = Some(identity);
            }
            SignalingReply::Scout(neighbors) => {
                debug!("Scout returned {} neighbors", neighbors.len());
                let desired = neighbors.into_iter().filter_map(|n| n.peer_address);
                self.overlay.reconcile(desired).await;
            }
            SignalingReply::Wisps(count) => {
                debug!("{} wisps active", count);
                self.active_count = Some(count);
            }
            SignalingReply::Error(message) => {
                warn!("Signaling error: {}", message);
            }
        }
    }

    /// Parse and apply a raw reply frame.
    pub async fn handle_frame(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let reply = SignalingReply::from_json(data)?;
        self.handle_reply(reply).await;
        Ok(())
    }
}
