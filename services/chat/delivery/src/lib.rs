//! Message delivery coordination for duolink chat.
//!
//! The coordinator is the write path of the chat core: it tracks each
//! outgoing message through the delivery state machine, retries transient
//! failures on a jittered backoff, deduplicates inbound replays, and
//! acknowledges peer messages only once they are persisted. Round trips
//! feed a rolling latency window that adapts the ack deadline to the
//! current link.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod events;
pub mod latency;
pub mod retry;

pub use coordinator::{
    CoordinatorConfig, CoordinatorHandle, DeliveryCoordinator, MessageHandle, TrackedView,
};
pub use dedup::DedupSet;
pub use error::DeliveryError;
pub use events::{ChatEvent, EventBus};
pub use latency::LatencyWindow;
pub use retry::RetryPolicy;
