//! Event bus for consumers of the chat core.
//!
//! A single broadcast channel carries everything an embedding UI needs:
//! new messages, delivery-state changes, presence transitions, typing
//! indicators, and connection changes. Slow subscribers lag rather than
//! block the coordinator.

use chat_transport::{ConnectionState, TierKind};
use chat_wire::{ChatMessage, DeliveryState};
use tokio::sync::broadcast;

/// Default event channel capacity
const EVENT_CAPACITY: usize = 256;

/// Events published by the chat core
#[derive(Clone, Debug)]
pub enum ChatEvent {
    /// A message arrived from the peer
    MessageReceived {
        /// The message, with its canonical timestamp when persisted
        message: ChatMessage,
    },
    /// The delivery state of an outgoing message changed
    StateChanged {
        /// Message id
        message_id: String,
        /// New state
        state: DeliveryState,
    },
    /// A peer went online or offline
    Presence {
        /// Peer id
        user_id: String,
        /// New online state
        online: bool,
        /// Last heartbeat wall clock (ms since epoch)
        last_seen_at: i64,
    },
    /// The peer is typing
    Typing {
        /// Peer id
        user_id: String,
    },
    /// The transport link changed
    Connection {
        /// New connection state
        state: ConnectionState,
        /// Tier in use, when connected
        tier: Option<TierKind>,
    },
}

/// Broadcast fan-out of [`ChatEvent`]s
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events from this point forward
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when no subscriber exists.
    pub fn publish(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
