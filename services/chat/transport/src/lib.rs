//! Transport negotiation for duolink chat.
//!
//! A conversation link is carried over one of four ranked tiers. The
//! negotiator establishes the best tier that connects within the deadline,
//! degrades to the next tier when the active one fails, probes for
//! upgrades in the background, and buffers outbound traffic while a switch
//! is in progress so ordering is preserved.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod negotiator;
pub mod registry;
pub mod tier;

use async_trait::async_trait;
use chat_wire::Envelope;
use std::sync::Arc;
use std::time::Duration;

pub use channel::ChannelTransport;
pub use error::TransportError;
pub use negotiator::{ConnectionState, TransportEvent, TransportNegotiator};
pub use registry::ConnectionRegistry;
pub use tier::TierKind;

/// Deadline for a single connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Interval between background probes for a better tier
pub const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// How long a candidate tier must stay healthy before the link upgrades
pub const STABILITY_WINDOW: Duration = Duration::from_secs(7);

/// An established transport on some tier.
///
/// Implementations push inbound envelopes into the receiver handed out at
/// connect time; `send` is the outbound path. A receive-only transport
/// returns [`TransportError::ReceiveOnly`] from `send`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The tier this transport runs on
    fn tier(&self) -> TierKind;

    /// Send an envelope to the peer
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Whether the transport is currently usable
    fn is_healthy(&self) -> bool;

    /// Close the transport
    async fn close(&self);
}

/// Establishes transports on demand.
///
/// The negotiator drives every connect attempt through a factory, which is
/// also the seam tests use to inject in-process channel transports.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Attempt to establish a transport on `tier`. The negotiator applies
    /// the connect deadline around this call.
    async fn connect(&self, tier: TierKind) -> Result<Arc<dyn Transport>, TransportError>;
}
