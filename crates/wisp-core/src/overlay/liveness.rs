//! Traffic-recency liveness.
//!
//! There is no ack matching. Every outbound send schedules one check `T`
//! later; the check evicts the connection if nothing has been heard from the
//! peer for `2T`. A pong, like any other inbound payload, counts as traffic.
//!
//! A channel that never reaches open is checked once after `2T` and dropped
//! if it is still opening. Idle links only see sends when someone probes, so
//! the overlay can run a probe ticker on a fixed interval.

use crate::transport::{InputKind, OverlayInput};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Default liveness window `T`.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Silence threshold that triggers eviction.
pub fn eviction_threshold(timeout: Duration) -> Duration {
    timeout * 2
}

/// Whether a peer last heard from at `last_seen` should be evicted at `now`.
pub fn is_stale(last_seen: Instant, now: Instant, timeout: Duration) -> bool {
    now.saturating_duration_since(last_seen) >= eviction_threshold(timeout)
}

/// Schedule a fire-once check for one connection.
pub(crate) fn schedule_check(
    tx: mpsc::UnboundedSender<OverlayInput>,
    connection_id: u64,
    address: String,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let _ = tx.send(OverlayInput(InputKind::LivenessCheck {
            connection_id,
            address,
        }));
    })
}

/// Enqueue a probe every `interval`, first one `interval` from now.
pub(crate) fn spawn_prober(
    tx: mpsc::UnboundedSender<OverlayInput>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(OverlayInput(InputKind::Probe)).is_err() {
                break;
            }
        }
    })
}
