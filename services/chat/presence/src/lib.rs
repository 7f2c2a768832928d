//! Peer presence tracking for duolink chat.
//!
//! Liveness is heartbeat-driven: each participant emits a presence beat on
//! an interval, and the tracker marks a peer offline once three intervals
//! pass without one. Transitions are debounced so each edge notifies
//! exactly once, and a peer that goes offline keeps the timestamp of its
//! last real heartbeat rather than the time the sweep noticed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod emitter;
pub mod tracker;

use std::time::Duration;

pub use emitter::HeartbeatEmitter;
pub use tracker::{PeerStatus, PresenceTracker, PresenceUpdate};

/// Presence timing configuration
#[derive(Clone, Debug)]
pub struct PresenceConfig {
    /// Interval between outbound heartbeats
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals missed before a peer is considered offline
    pub offline_multiplier: u32,
    /// Interval between liveness sweeps
    pub sweep_interval: Duration,
    /// How long an offline peer is retained before pruning
    pub prune_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            offline_multiplier: 3,
            sweep_interval: Duration::from_secs(12),
            prune_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl PresenceConfig {
    /// The silence threshold after which a peer is marked offline
    pub fn offline_after(&self) -> Duration {
        self.heartbeat_interval * self.offline_multiplier
    }
}
