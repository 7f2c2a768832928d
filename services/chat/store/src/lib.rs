//! Conversation log persistence for duolink chat.
//!
//! This crate provides the canonical ordering authority for a conversation:
//! an idempotent, append-only log with strictly increasing per-conversation
//! timestamps, pluggable backends (in-memory, file-based), a durable outbox
//! for messages that have not yet reached the log, and a gateway that keeps
//! the core usable while the backend is unavailable.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod gateway;
pub mod outbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Conversation identifier
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        ConversationId(s.to_string())
    }
}

/// A message as it enters the log, before a canonical timestamp exists
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRecord {
    /// Client-generated id, unique per conversation
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
}

/// A message in the canonical log
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
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
    /// Canonical timestamp, assigned exactly once, strictly increasing
    /// per conversation
    pub server_created_at: i64,
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Backend temporarily unreachable; buffered writes will retry
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Append-only, idempotent conversation log.
///
/// `append` assigns `server_created_at` exactly once; appending a duplicate
/// `id` is a no-op returning the existing timestamp. `read_since` returns
/// messages strictly ordered by `server_created_at`.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    /// Append a record, returning its canonical timestamp
    async fn append(
        &self,
        conv: &ConversationId,
        record: AppendRecord,
    ) -> Result<i64, StoreError>;

    /// All messages with `server_created_at > cursor`, strictly ordered
    async fn read_since(
        &self,
        conv: &ConversationId,
        cursor: i64,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// The highest timestamp assigned for a conversation (0 if empty)
    async fn last_timestamp(&self, conv: &ConversationId) -> Result<i64, StoreError>;

    /// Number of retained messages for a conversation
    async fn message_count(&self, conv: &ConversationId) -> Result<usize, StoreError>;
}

/// Maximum messages retained per conversation before oldest-eviction
pub const DEFAULT_LOG_CAP: usize = 1000;

/// Storage backend configuration
#[derive(Clone, Debug)]
pub enum StorageMode {
    /// In-memory log (dev/tests only)
    InMemory,
    /// File-backed log with CRC-framed records
    File {
        /// Data directory path
        data_dir: String,
        /// Fsync frequency (1 = every write, N = every N writes)
        fsync_every: u32,
    },
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::InMemory
    }
}

// Re-export backend implementations
pub use backend::file::{FileLog, FileLogConfig};
pub use backend::mem::MemoryLog;
pub use gateway::PersistenceGateway;
pub use outbox::Outbox;

/// Create a conversation log from configuration
pub fn log_from_mode(mode: StorageMode) -> Result<Box<dyn ConversationLog>, StoreError> {
    match mode {
        StorageMode::InMemory => Ok(Box::new(MemoryLog::new(DEFAULT_LOG_CAP))),
        StorageMode::File {
            data_dir,
            fsync_every,
        } => {
            let config = FileLogConfig {
                data_dir: data_dir.into(),
                fsync_every,
                max_entries: DEFAULT_LOG_CAP,
            };
            Ok(Box::new(FileLog::new(config)?))
        }
    }
}
