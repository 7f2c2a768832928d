//! Transport error types

use crate::tier::TierKind;
use thiserror::Error;

/// Errors from transport negotiation and delivery
#[derive(Error, Debug)]
pub enum TransportError {
    /// A connect attempt failed outright
    #[error("connect failed on {tier}: {reason}")]
    ConnectFailed {
        /// Tier that was attempted
        tier: TierKind,
        /// Failure detail
        reason: String,
    },

    /// A connect attempt exceeded the deadline
    #[error("connect timed out on {0}")]
    Timeout(TierKind),

    /// The active transport has closed
    #[error("transport closed")]
    Closed,

    /// Attempted to send on a receive-only tier
    #[error("tier {0} is receive-only")]
    ReceiveOnly(TierKind),

    /// No tier could be established
    #[error("no transport tier available")]
    NoTierAvailable,

    /// Not connected
    #[error("not connected")]
    NotConnected,

    /// Credentials rejected by the peer or server; sends must halt until
    /// re-authentication
    #[error("authentication expired")]
    AuthExpired,

    /// Wire-level failure
    #[error("wire error: {0}")]
    Wire(#[from] chat_wire::WireError),
}
