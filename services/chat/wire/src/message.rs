//! The in-memory message record and its delivery state machine.

use serde::{Deserialize, Serialize};

/// Per-message delivery state.
///
/// Forward-biased: `Pending → Sent → Acked → Delivered → Read`. Any state
/// may fall to `Failed` once retries are exhausted, and `Failed` returns to
/// `Pending` on manual or automatic retry. `Acked` means the persistence
/// layer confirmed the write; it is the canonical durable signal even if the
/// transport round-trip ack was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Created locally, not yet sent on any tier
    Pending,
    /// Transport send succeeded, persistence not yet confirmed
    Sent,
    /// Persistence layer confirmed the write
    Acked,
    /// Peer reported the message delivered
    Delivered,
    /// Peer reported the message read
    Read,
    /// Retries exhausted
    Failed,
}

impl DeliveryState {
    /// Ordinal position in the forward progression; `Failed` sorts last
    pub fn rank(self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Acked => 2,
            DeliveryState::Delivered => 3,
            DeliveryState::Read => 4,
            DeliveryState::Failed => 5,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition(self, next: DeliveryState) -> bool {
        match (self, next) {
            // Retry path
            (DeliveryState::Failed, DeliveryState::Pending) => true,
            // Any non-terminal state may fail
            (s, DeliveryState::Failed) => s != DeliveryState::Read,
            // Otherwise strictly forward
            (a, b) => b.rank() > a.rank() && b != DeliveryState::Failed,
        }
    }

    /// Whether no further transitions are expected
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Read)
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sent => "sent",
            DeliveryState::Acked => "acked",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
            DeliveryState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// In-memory chat message record.
///
/// `id` is immutable and unique per conversation. `server_created_at` is
/// assigned exactly once by the persistence gateway and never revised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Client-generated id
    pub id: String,
    /// Sending participant
    pub sender_id: String,
    /// Message text
    pub text: String,
    /// Id of the message this replies to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Whether the message has been edited
    #[serde(default)]
    pub edited: bool,
    /// Client wall clock at creation (ms since epoch)
    pub client_created_at: i64,
    /// Canonical timestamp, present once persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_created_at: Option<i64>,
    /// Current delivery state
    pub state: DeliveryState,
}
