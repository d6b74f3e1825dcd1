//! Presence registry for tracking active wisps.
//!
//! `PresenceStore` is the interface the signaling gateway talks to. Any
//! key-value backend with atomic per-key updates and random set sampling can
//! implement it; `PresenceRegistry` is the in-process implementation.
//!
//! Keys are connection keys (one per signaling socket). Active-set membership
//! and record existence are the same thing here: the record map *is* the
//! active set, so the two can never disagree.

use crate::identity::{Identity, Position};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Errors a presence backend may report.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Presence backend unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, PresenceError>;

/// One record per active connection key.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub identity: Identity,
    pub position: Option<Position>,
}

/// Shared store of active identities and their last reported positions.
///
/// Every operation is atomic on its own. Sequences of operations (e.g.
/// `set_position` then `sample_neighbors`) are not transactional together.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Create or replace the identity for `key` and mark it active.
    async fn add_identity(&self, key: &str, identity: Identity) -> Result<()>;

    /// Drop the record for `key`. No-op if absent.
    async fn remove_identity(&self, key: &str) -> Result<()>;

    /// Attach a position to an existing record. No-op if `key` is not active.
    async fn set_position(&self, key: &str, position: Option<Position>) -> Result<()>;

    /// Up to `count` distinct active identities other than `exclude_key`,
    /// sampled uniformly at random.
    async fn sample_neighbors(&self, exclude_key: &str, count: usize) -> Result<Vec<Identity>>;

    /// Number of active keys.
    async fn count_active(&self) -> Result<usize>;

    /// Identity for `key`, if active.
    async fn get_identity(&self, key: &str) -> Result<Option<Identity>>;

    /// Last position reported for `key`, if any.
    async fn get_position(&self, key: &str) -> Result<Option<Position>>;
}

/// In-memory presence store.
///
/// Thread-safe for use in multi-threaded Tokio runtime. Wrap in `Arc` for
/// shared ownership.
#[derive(Default)]
pub struct PresenceRegistry {
    records: RwLock<HashMap<String, PresenceRecord>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the record for `key`.
    pub fn record(&self, key: &str) -> Option<PresenceRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl PresenceStore for PresenceRegistry {
    async fn add_identity(&self, key: &str, identity: Identity) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(key) {
            // Replace identity, keep the last reported position
            Some(record) => record.identity = identity,
            None => {
                records.insert(
                    key.to_string(),
                    PresenceRecord {
                        identity,
                        position: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn remove_identity(&self, key: &str) -> Result<()> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn set_position(&self, key: &str, position: Option<Position>) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(key) {
            record.position = position;
        }
        Ok(())
    }

    async fn sample_neighbors(&self, exclude_key: &str, count: usize) -> Result<Vec<Identity>> {
        use rand::seq::IndexedRandom;

        // Sample and resolve under one read lock so a removed key can never
        // be returned once its removal has completed.
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let candidates: Vec<&PresenceRecord> = records
            .iter()
            .filter(|(key, _)| key.as_str() != exclude_key)
            .map(|(_, record)| record)
            .collect();

        Ok(candidates
            .choose_multiple(&mut rand::rng(), count)
            .map(|record| record.identity.clone())
            .collect())
    }

    async fn count_active(&self) -> Result<usize> {
        Ok(self.records.read().unwrap_or_else(|e| e.into_inner()).len())
    }

    async fn get_identity(&self, key: &str) -> Result<Option<Identity>> {
        Ok(self.record(key).map(|r| r.identity))
    }

    async fn get_position(&self, key: &str) -> Result<Option<Position>> {
        Ok(self.record(key).and_then(|r| r.position))
    }
}
