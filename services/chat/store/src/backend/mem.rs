//! In-memory conversation log for development and testing

use crate::{AppendRecord, ConversationId, ConversationLog, StoreError, StoredMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Per-conversation log state
#[derive(Debug, Default)]
struct LogState {
    /// Retained messages in timestamp order
    entries: VecDeque<StoredMessage>,
    /// Id -> server_created_at for idempotent re-append
    index: HashMap<String, i64>,
    /// Highest timestamp assigned so far
    last_ts: i64,
}

/// In-memory conversation log implementation
pub struct MemoryLog {
    conversations: DashMap<ConversationId, LogState>,
    /// Maximum retained messages per conversation
    max_entries: usize,
}

impl MemoryLog {
    /// Create a new in-memory log with the given per-conversation cap
    pub fn new(max_entries: usize) -> Self {
        Self {
            conversations: DashMap::new(),
            max_entries,
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(crate::DEFAULT_LOG_CAP)
    }
}

#[async_trait]
impl ConversationLog for MemoryLog {
    async fn append(
        &self,
        conv: &ConversationId,
        record: AppendRecord,
    ) -> Result<i64, StoreError> {
        let mut state = self.conversations.entry(conv.clone()).or_default();

        // Duplicate id: no-op returning the existing timestamp
        if let Some(&existing) = state.index.get(&record.id) {
            debug!(
                "Log append conv={} id={} is a duplicate (ts={})",
                conv, record.id, existing
            );
            return Ok(existing);
        }

        // Strictly increasing per conversation, anchored to wall clock
        let ts = chat_wire::now_millis().max(state.last_ts + 1);
        state.last_ts = ts;

        let stored = StoredMessage {
            id: record.id.clone(),
            sender_id: record.sender_id,
            text: record.text,
            reply_to: record.reply_to,
            edited: record.edited,
            client_created_at: record.client_created_at,
            server_created_at: ts,
        };

        state.index.insert(record.id.clone(), ts);
        state.entries.push_back(stored);

        // Oldest-eviction once over the cap
        while state.entries.len() > self.max_entries {
            if let Some(evicted) = state.entries.pop_front() {
                state.index.remove(&evicted.id);
            }
        }

        debug!("Log append conv={} id={} ts={}", conv, record.id, ts);
        Ok(ts)
    }

    async fn read_since(
        &self,
        conv: &ConversationId,
        cursor: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let results = match self.conversations.get(conv) {
            Some(state) => state
                .entries
                .iter()
                .filter(|m| m.server_created_at > cursor)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(results)
    }

    async fn last_timestamp(&self, conv: &ConversationId) -> Result<i64, StoreError> {
        Ok(self.conversations.get(conv).map(|s| s.last_ts).unwrap_or(0))
    }

    async fn message_count(&self, conv: &ConversationId) -> Result<usize, StoreError> {
        Ok(self
            .conversations
            .get(conv)
            .map(|s| s.entries.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, text: &str) -> AppendRecord {
        AppendRecord {
            id: id.to_string(),
            sender_id: "alice".to_string(),
            text: text.to_string(),
            reply_to: None,
            edited: false,
            client_created_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let log = MemoryLog::new(10);
        let conv = ConversationId::from("c1");

        let ts1 = log.append(&conv, record("m1", "hi")).await.unwrap();
        let ts2 = log.append(&conv, record("m1", "hi")).await.unwrap();

        assert_eq!(ts1, ts2);
        assert_eq!(log.message_count(&conv).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_since_strictly_increasing() {
        let log = MemoryLog::new(10);
        let conv = ConversationId::from("c1");

        for i in 0..5 {
            log.append(&conv, record(&format!("m{}", i), "x"))
                .await
                .unwrap();
        }

        let all = log.read_since(&conv, 0).await.unwrap();
        assert_eq!(all.len(), 5);
        for pair in all.windows(2) {
            assert!(pair[1].server_created_at > pair[0].server_created_at);
        }

        // Cursor excludes everything at or below it
        let cursor = all[2].server_created_at;
        let tail = log.read_since(&conv, cursor).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, "m3");
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest() {
        let log = MemoryLog::new(3);
        let conv = ConversationId::from("c1");

        for i in 0..5 {
            log.append(&conv, record(&format!("m{}", i), "x"))
                .await
                .unwrap();
        }

        let all = log.read_since(&conv, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "m2");
        assert_eq!(all[2].id, "m4");
    }

    #[tokio::test]
    async fn test_burst_appends_keep_submission_order() {
        let log = MemoryLog::new(10);
        let conv = ConversationId::from("c1");

        // Same-millisecond burst still gets strictly increasing timestamps
        let a = log.append(&conv, record("m1", "a")).await.unwrap();
        let b = log.append(&conv, record("m2", "b")).await.unwrap();
        let c = log.append(&conv, record("m3", "c")).await.unwrap();

        assert!(a < b && b < c);
        let all = log.read_since(&conv, 0).await.unwrap();
        let ids: Vec<_> = all.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }
}
