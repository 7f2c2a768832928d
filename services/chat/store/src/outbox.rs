//! Durable FIFO queue for messages not yet confirmed by the canonical log.
//!
//! Two owners use it, each with their own instance: the delivery path
//! holds unacked outgoing messages here, and the persistence gateway
//! buffers local writes here while its backend is down. The instances are
//! never shared; an in-flight send must not be mistaken for a buffered
//! local write. With a spill path configured every mutation rewrites a
//! snapshot on disk, so pending entries survive a restart.

use crate::{ConversationId, StoreError};
use chat_wire::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// One outbox entry, retained until the log confirms the message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Conversation the message belongs to
    pub conversation: ConversationId,
    /// The pending message
    pub message: ChatMessage,
    /// Delivery attempts made so far
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct OutboxState {
    entries: VecDeque<OutboxEntry>,
}

/// FIFO queue of messages not yet confirmed by the canonical log.
///
/// With a spill path configured, every mutation rewrites a JSON snapshot so
/// pending messages survive a restart. Without one the outbox is purely
/// in-memory.
pub struct Outbox {
    state: Mutex<OutboxState>,
    spill_path: Option<PathBuf>,
}

impl Outbox {
    /// Create an in-memory outbox
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            spill_path: None,
        }
    }

    /// Create an outbox that persists its contents to `path`, replaying
    /// any entries left over from a previous run
    pub fn with_spill(path: PathBuf) -> Result<Self, StoreError> {
        let mut state = OutboxState::default();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Vec<OutboxEntry>>(&raw) {
                Ok(entries) => {
                    info!("Replayed {} outbox entries from {:?}", entries.len(), path);
                    state.entries = entries.into();
                }
                Err(e) => {
                    warn!("Discarding unreadable outbox file {:?}: {}", path, e);
                }
            }
        }
        Ok(Self {
            state: Mutex::new(state),
            spill_path: Some(path),
        })
    }

    fn persist(&self, state: &OutboxState) -> Result<(), StoreError> {
        if let Some(path) = &self.spill_path {
            let entries: Vec<&OutboxEntry> = state.entries.iter().collect();
            let raw = serde_json::to_string(&entries)?;
            // Write-then-rename so an interrupted write never truncates
            // the previous snapshot
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, raw)?;
            std::fs::rename(&tmp, path)?;
        }
        Ok(())
    }

    /// Enqueue a message. Duplicate ids within the same conversation are
    /// ignored.
    pub fn push(&self, conversation: &ConversationId, message: ChatMessage) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| {
            StoreError::Unavailable("outbox lock poisoned".to_string())
        })?;

        if state
            .entries
            .iter()
            .any(|e| e.conversation == *conversation && e.message.id == message.id)
        {
            debug!("Outbox already holds {} in {}", message.id, conversation);
            return Ok(());
        }

        state.entries.push_back(OutboxEntry {
            conversation: conversation.clone(),
            message,
            attempts: 0,
        });
        self.persist(&state)
    }

    /// All pending entries in FIFO order
    pub fn all(&self) -> Vec<OutboxEntry> {
        match self.state.lock() {
            Ok(state) => state.entries.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Remove an entry once the log has confirmed it
    pub fn remove(&self, conversation: &ConversationId, message_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().map_err(|_| {
            StoreError::Unavailable("outbox lock poisoned".to_string())
        })?;

        let before = state.entries.len();
        state
            .entries
            .retain(|e| !(e.conversation == *conversation && e.message.id == message_id));
        let removed = state.entries.len() < before;
        if removed {
            self.persist(&state)?;
        }
        Ok(removed)
    }

    /// Bump the attempt counter for an entry
    pub fn record_attempt(&self, conversation: &ConversationId, message_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|_| {
            StoreError::Unavailable("outbox lock poisoned".to_string())
        })?;

        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| e.conversation == *conversation && e.message.id == message_id)
        {
            entry.attempts += 1;
        }
        self.persist(&state)
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Whether the outbox is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}
