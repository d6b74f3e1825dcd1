//! Signaling channel envelopes.
//!
//! Wire format: `{"type":"login"|"logout"|"scout"|"wisps"|"error","data":...}`
//! sent as JSON text frames between a client and the signaling server.

use super::ProtocolError;
use crate::identity::{Identity, IdentityPatch, Neighbor, Position};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a `scout` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoutRequest {
    /// Missing when the locator could not produce coordinates
    #[serde(default)]
    pub position: Option<Position>,
}

/// A command sent by a client to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum SignalingRequest {
    Login(IdentityPatch),
    Logout,
    Scout(ScoutRequest),
    /// Active participant count query
    Wisps,
}

/// Raw envelope used to read the type before interpreting `data`.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: Option<Value>,
}

impl SignalingRequest {
    /// Parse a request frame.
    ///
    /// Unknown types are reported as [`ProtocolError::UnknownType`] so the
    /// gateway can answer with an `error` envelope naming the type.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_slice(data)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let payload = raw.data.unwrap_or(Value::Null);
        match raw.msg_type.as_str() {
            "login" => Ok(Self::Login(from_payload(payload)?)),
            "logout" => Ok(Self::Logout),
            "scout" => Ok(Self::Scout(from_payload(payload)?)),
            "wisps" => Ok(Self::Wisps),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("SignalingRequest serialization should not fail")
    }
}

/// `null` payloads read as the type's default.
fn from_payload<T: Default + for<'de> Deserialize<'de>>(payload: Value) -> Result<T, ProtocolError> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// A reply or broadcast sent by the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum SignalingReply {
    /// Merged identity after login
    Login(Identity),
    /// Fresh anonymous identity after logout
    Logout(Identity),
    /// Sampled neighbors
    Scout(Vec<Neighbor>),
    /// Active participant count
    Wisps(usize),
    /// Description of an invalid request
    Error(String),
}

impl SignalingReply {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("SignalingReply serialization should not fail")
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
