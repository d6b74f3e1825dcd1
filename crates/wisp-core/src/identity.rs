//! Wisp identities and positions.
//!
//! An identity is ephemeral: the server mints a fresh one for every new
//! socket and again on every logout. Only `userId` and `peerAddress` are ever
//! shown to other wisps; the ephemeral id stays on the server.

use serde::{Deserialize, Serialize};

/// An ephemeral participant identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Server-minted id, reassigned on logout
    pub ephemeral_id: String,
    /// Optional user id supplied at login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Address other peers use to open a data channel to this wisp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
}

impl Identity {
    /// Mint a fresh anonymous identity.
    ///
    /// The anonymous user id is random too, so a logged-out socket cannot be
    /// linked back to its previous user.
    pub fn anonymous() -> Self {
        Self {
            ephemeral_id: uuid::Uuid::new_v4().to_string(),
            user_id: Some(uuid::Uuid::new_v4().to_string()),
            peer_address: None,
        }
    }

    /// Merge login fields into this identity.
    ///
    /// Fields present in the patch overwrite, absent fields are preserved.
    /// The ephemeral id is never replaced.
    pub fn merge(&self, patch: &IdentityPatch) -> Self {
        Self {
            ephemeral_id: self.ephemeral_id.clone(),
            user_id: patch.user_id.clone().or_else(|| self.user_id.clone()),
            peer_address: patch
                .peer_address
                .clone()
                .or_else(|| self.peer_address.clone()),
        }
    }

    /// The public view of this identity handed out in scout replies.
    pub fn to_neighbor(&self) -> Neighbor {
        Neighbor {
            user_id: self.user_id.clone(),
            peer_address: self.peer_address.clone(),
        }
    }
}

/// Identity fields a client may set with `login`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
}

impl IdentityPatch {
    pub fn with_peer_address(peer_address: impl Into<String>) -> Self {
        Self {
            user_id: None,
            peer_address: Some(peer_address.into()),
        }
    }
}

/// A sampled neighbor as seen by other wisps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
}

/// Geographic coordinates. Either half may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// Approximate position plus a participant-chosen scope.
///
/// `scope` is a radius/precision hint. The registry stores it but applies no
/// geometry to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub coords: Coords,
    #[serde(default)]
    pub scope: i32,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, scope: i32) -> Self {
        Self {
            coords: Coords {
                latitude: Some(latitude),
                longitude: Some(longitude),
            },
            scope,
        }
    }

    /// True when both coordinates are known.
    pub fn is_located(&self) -> bool {
        self.coords.latitude.is_some() && self.coords.longitude.is_some()
    }
}
