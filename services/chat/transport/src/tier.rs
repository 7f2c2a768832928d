//! Transport tier ranking

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport tiers in preference order.
///
/// `PeerDirect` is the best available path and `Polling` the worst.
/// `ServerPush` is receive-only; a negotiator that lands on it pairs the
/// push stream with a `Polling` send path.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Direct peer-to-peer channel
    PeerDirect,
    /// Bidirectional socket through the server
    DuplexSocket,
    /// Server-initiated push stream (receive-only)
    ServerPush,
    /// Periodic polling fallback
    Polling,
}

impl TierKind {
    /// Preference rank; lower is better
    pub fn rank(&self) -> u8 {
        match self {
            TierKind::PeerDirect => 0,
            TierKind::DuplexSocket => 1,
            TierKind::ServerPush => 2,
            TierKind::Polling => 3,
        }
    }

    /// Whether this tier can only receive
    pub fn is_receive_only(&self) -> bool {
        matches!(self, TierKind::ServerPush)
    }

    /// Whether `self` ranks strictly better than `other`
    pub fn is_better_than(&self, other: &TierKind) -> bool {
        self.rank() < other.rank()
    }

    /// All tiers in preference order
    pub fn ranked() -> [TierKind; 4] {
        [
            TierKind::PeerDirect,
            TierKind::DuplexSocket,
            TierKind::ServerPush,
            TierKind::Polling,
        ]
    }

    /// Tiers ranked strictly better than `self`, best first
    pub fn better_tiers(&self) -> Vec<TierKind> {
        TierKind::ranked()
            .into_iter()
            .filter(|t| t.rank() < self.rank())
            .collect()
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TierKind::PeerDirect => "peer_direct",
            TierKind::DuplexSocket => "duplex_socket",
            TierKind::ServerPush => "server_push",
            TierKind::Polling => "polling",
        };
        write!(f, "{}", s)
    }
}
