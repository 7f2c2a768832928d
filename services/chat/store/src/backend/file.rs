//! File-backed conversation log with CRC-framed records and recovery

use crate::{AppendRecord, ConversationId, ConversationLog, StoreError, StoredMessage};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Configuration for the file-backed log
#[derive(Clone, Debug)]
pub struct FileLogConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Fsync frequency (1 = every write, N = every N writes)
    pub fsync_every: u32,
    /// Maximum retained messages per conversation
    pub max_entries: usize,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./chatdata"),
            fsync_every: 1,
            max_entries: crate::DEFAULT_LOG_CAP,
        }
    }
}

/// Per-conversation state file content. `conv_id` is the original id; the
/// directory name is a sanitized, lossy rendering of it.
#[derive(Serialize, Deserialize, Debug, Default)]
struct ConvState {
    #[serde(default)]
    conv_id: String,
    last_ts: i64,
}

/// Record header: length, canonical timestamp, CRC32 over (ts || body)
#[derive(Debug)]
struct RecordHeader {
    len: u32,
    server_ts: i64,
    crc32: u32,
}

impl RecordHeader {
    const SIZE: usize = 4 + 8 + 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len);
        buf.put_i64_le(self.server_ts);
        buf.put_u32_le(self.crc32);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, StoreError> {
        if buf.remaining() < Self::SIZE {
            return Err(StoreError::Corruption(
                "incomplete record header".to_string(),
            ));
        }
        Ok(Self {
            len: buf.get_u32_le(),
            server_ts: buf.get_i64_le(),
            crc32: buf.get_u32_le(),
        })
    }

    fn compute_crc(server_ts: i64, body: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&server_ts.to_le_bytes());
        hasher.update(body);
        hasher.finalize()
    }
}

/// In-memory view of one conversation, backed by the segment file
#[derive(Debug, Default)]
struct LogState {
    entries: VecDeque<StoredMessage>,
    index: HashMap<String, i64>,
    last_ts: i64,
    /// Records written to the segment since the last compaction, including
    /// entries already evicted from memory
    file_records: usize,
}

/// File-backed conversation log implementation
pub struct FileLog {
    config: FileLogConfig,
    conversations: DashMap<ConversationId, LogState>,
    active_files: DashMap<ConversationId, File>,
    write_counter: DashMap<ConversationId, u32>,
}

impl FileLog {
    /// Open a file-backed log, recovering any existing conversations
    pub fn new(config: FileLogConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.data_dir)?;

        let log = Self {
            config,
            conversations: DashMap::new(),
            active_files: DashMap::new(),
            write_counter: DashMap::new(),
        };
        log.recover_all()?;
        Ok(log)
    }

    /// Conversation ids become directory names; anything outside the safe
    /// character set is replaced
    fn sanitize(conv: &ConversationId) -> String {
        conv.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn conv_dir(&self, conv: &ConversationId) -> PathBuf {
        self.config
            .data_dir
            .join("conversations")
            .join(Self::sanitize(conv))
    }

    fn segment_path(&self, conv: &ConversationId) -> PathBuf {
        self.conv_dir(conv).join("log.seg")
    }

    fn state_path(&self, conv: &ConversationId) -> PathBuf {
        self.conv_dir(conv).join("state.json")
    }

    fn recover_all(&self) -> Result<(), StoreError> {
        let convs_dir = self.config.data_dir.join("conversations");
        if !convs_dir.exists() {
            return Ok(());
        }

        for entry in std::fs::read_dir(&convs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // The state file carries the original id, which may contain
                // characters the directory name had to drop. Dirs from
                // before the id was recorded fall back to their name.
                let conv = std::fs::read_to_string(entry.path().join("state.json"))
                    .ok()
                    .and_then(|raw| serde_json::from_str::<ConvState>(&raw).ok())
                    .filter(|s| !s.conv_id.is_empty())
                    .map(|s| ConversationId(s.conv_id))
                    .unwrap_or_else(|| ConversationId(name.to_string()));
                match self.recover_conversation(&conv) {
                    Ok(state) => {
                        info!(
                            "Recovered conversation {}: {} messages, last_ts={}",
                            conv,
                            state.entries.len(),
                            state.last_ts
                        );
                        self.conversations.insert(conv, state);
                    }
                    Err(e) => {
                        warn!("Failed to recover conversation {}: {}", conv, e);
                    }
                }
            }
        }
        Ok(())
    }

    fn recover_conversation(&self, conv: &ConversationId) -> Result<LogState, StoreError> {
        let mut state = LogState::default();

        let state_path = self.state_path(conv);
        if state_path.exists() {
            let content = std::fs::read_to_string(&state_path)?;
            let conv_state: ConvState = serde_json::from_str(&content).map_err(|e| {
                StoreError::Corruption(format!("invalid state file for {}: {}", conv, e))
            })?;
            state.last_ts = conv_state.last_ts;
        }

        let segment_path = self.segment_path(conv);
        if !segment_path.exists() {
            return Ok(state);
        }

        let mut file = File::open(&segment_path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let mut bytes = Bytes::from(raw);

        while bytes.remaining() >= RecordHeader::SIZE {
            let header = RecordHeader::decode(&mut bytes)?;
            if bytes.remaining() < header.len as usize {
                warn!("Truncated tail record in {:?}; dropping it", segment_path);
                break;
            }
            let body = bytes.split_to(header.len as usize);

            let expected = RecordHeader::compute_crc(header.server_ts, &body);
            if header.crc32 != expected {
                warn!(
                    "CRC mismatch in {:?} at ts={}; dropping tail",
                    segment_path, header.server_ts
                );
                break;
            }

            let message: StoredMessage = serde_json::from_slice(&body).map_err(|e| {
                StoreError::Corruption(format!("undecodable record at ts {}: {}", header.server_ts, e))
            })?;

            state.file_records += 1;
            if state.index.contains_key(&message.id) {
                // A replayed duplicate from a compaction crash window
                continue;
            }
            state.last_ts = state.last_ts.max(message.server_created_at);
            state.index.insert(message.id.clone(), message.server_created_at);
            state.entries.push_back(message);
        }

        // Apply the retention cap after replay
        while state.entries.len() > self.config.max_entries {
            if let Some(evicted) = state.entries.pop_front() {
                state.index.remove(&evicted.id);
            }
        }

        Ok(state)
    }

    fn open_segment(&self, conv: &ConversationId) -> Result<(), StoreError> {
        if self.active_files.contains_key(conv) {
            return Ok(());
        }
        let dir = self.conv_dir(conv);
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.segment_path(conv))?;
        self.active_files.insert(conv.clone(), file);
        Ok(())
    }

    fn write_record(&self, conv: &ConversationId, message: &StoredMessage) -> Result<(), StoreError> {
        self.open_segment(conv)?;

        let body = serde_json::to_vec(message)?;
        let header = RecordHeader {
            len: body.len() as u32,
            server_ts: message.server_created_at,
            crc32: RecordHeader::compute_crc(message.server_created_at, &body),
        };

        let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + body.len());
        header.encode(&mut buf);
        buf.extend_from_slice(&body);

        if let Some(mut file) = self.active_files.get_mut(conv) {
            file.write_all(&buf)?;

            let mut counter = self.write_counter.entry(conv.clone()).or_insert(0);
            *counter += 1;
            if *counter >= self.config.fsync_every {
                file.sync_all()?;
                *counter = 0;
            }
        }
        Ok(())
    }

    fn save_state(&self, conv: &ConversationId, last_ts: i64) -> Result<(), StoreError> {
        let dir = self.conv_dir(conv);
        std::fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(&ConvState {
            conv_id: conv.0.clone(),
            last_ts,
        })?;
        let tmp = dir.join("state.json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, self.state_path(conv))?;
        Ok(())
    }

    /// Rewrite the segment with only the retained entries. Runs when the
    /// file has accumulated more than twice the retention cap.
    fn compact(&self, conv: &ConversationId, state: &mut LogState) -> Result<(), StoreError> {
        let tmp_path = self.conv_dir(conv).join("log.seg.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for message in &state.entries {
                let body = serde_json::to_vec(message)?;
                let header = RecordHeader {
                    len: body.len() as u32,
                    server_ts: message.server_created_at,
                    crc32: RecordHeader::compute_crc(message.server_created_at, &body),
                };
                let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + body.len());
                header.encode(&mut buf);
                buf.extend_from_slice(&body);
                tmp.write_all(&buf)?;
            }
            tmp.sync_all()?;
        }

        self.active_files.remove(conv);
        std::fs::rename(&tmp_path, self.segment_path(conv))?;
        state.file_records = state.entries.len();
        debug!(
            "Compacted segment for {}: {} records retained",
            conv,
            state.entries.len()
        );
        Ok(())
    }
}

#[async_trait]
impl ConversationLog for FileLog {
    async fn append(
        &self,
        conv: &ConversationId,
        record: AppendRecord,
    ) -> Result<i64, StoreError> {
        let mut state = self.conversations.entry(conv.clone()).or_default();

        if let Some(&existing) = state.index.get(&record.id) {
            debug!(
                "FileLog append conv={} id={} is a duplicate (ts={})",
                conv, record.id, existing
            );
            return Ok(existing);
        }

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

        self.write_record(conv, &stored)?;
        state.file_records += 1;

        state.index.insert(record.id.clone(), ts);
        state.entries.push_back(stored);

        while state.entries.len() > self.config.max_entries {
            if let Some(evicted) = state.entries.pop_front() {
                state.index.remove(&evicted.id);
            }
        }

        if state.file_records > self.config.max_entries * 2 {
            self.compact(conv, &mut state)?;
        }

        // Checkpoint on the first record, then every 50. The first write
        // matters: recovery needs the state file to learn the original
        // conversation id.
        if state.file_records % 50 == 1 {
            self.save_state(conv, ts)?;
        }

        debug!("FileLog append conv={} id={} ts={}", conv, record.id, ts);
        Ok(ts)
    }

    async fn read_since(
        &self,
        conv: &ConversationId,
        cursor: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let conv_key = ConversationId(Self::sanitize(conv));
        let state = self
            .conversations
            .get(conv)
            .or_else(|| self.conversations.get(&conv_key));
        let results = match state {
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
    use tempfile::TempDir;

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

    fn config(dir: &TempDir) -> FileLogConfig {
        FileLogConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_every: 1,
            max_entries: 100,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::new(config(&dir)).unwrap();
        let conv = ConversationId::from("c1");

        let ts1 = log.append(&conv, record("m1", "one")).await.unwrap();
        let ts2 = log.append(&conv, record("m2", "two")).await.unwrap();
        assert!(ts2 > ts1);

        let all = log.read_since(&conv, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].text, "one");
    }

    #[tokio::test]
    async fn test_recovery_after_reopen() {
        let dir = TempDir::new().unwrap();
        let conv = ConversationId::from("c1");

        let ts_first;
        {
            let log = FileLog::new(config(&dir)).unwrap();
            ts_first = log.append(&conv, record("m1", "one")).await.unwrap();
            log.append(&conv, record("m2", "two")).await.unwrap();
        }

        let log = FileLog::new(config(&dir)).unwrap();
        let all = log.read_since(&conv, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].server_created_at, ts_first);

        // Duplicate append after recovery still idempotent
        let ts_again = log.append(&conv, record("m1", "one")).await.unwrap();
        assert_eq!(ts_again, ts_first);
    }

    #[tokio::test]
    async fn test_recovery_keeps_ids_the_directory_name_cannot_hold() {
        let dir = TempDir::new().unwrap();
        let conv = ConversationId::from("room one");

        let ts_first;
        {
            let log = FileLog::new(config(&dir)).unwrap();
            ts_first = log.append(&conv, record("m1", "one")).await.unwrap();
        }

        // After reopen the same id must hit the duplicate index, not a
        // fresh log keyed by the sanitized directory name
        let log = FileLog::new(config(&dir)).unwrap();
        let ts_again = log.append(&conv, record("m1", "one")).await.unwrap();
        assert_eq!(ts_again, ts_first);

        let all = log.read_since(&conv, 0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(log.last_timestamp(&conv).await.unwrap(), ts_first);
    }

    #[tokio::test]
    async fn test_corrupt_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let conv = ConversationId::from("c1");

        {
            let log = FileLog::new(config(&dir)).unwrap();
            log.append(&conv, record("m1", "one")).await.unwrap();
        }

        // Scribble garbage on the end of the segment
        let seg = dir
            .path()
            .join("conversations")
            .join("c1")
            .join("log.seg");
        let mut file = OpenOptions::new().append(true).open(&seg).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02]).unwrap();

        let log = FileLog::new(config(&dir)).unwrap();
        let all = log.read_since(&conv, 0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "m1");
    }

    #[tokio::test]
    async fn test_timestamps_monotonic_across_reopen() {
        let dir = TempDir::new().unwrap();
        let conv = ConversationId::from("c1");

        let ts1;
        {
            let log = FileLog::new(config(&dir)).unwrap();
            ts1 = log.append(&conv, record("m1", "one")).await.unwrap();
        }

        let log = FileLog::new(config(&dir)).unwrap();
        let ts2 = log.append(&conv, record("m2", "two")).await.unwrap();
        assert!(ts2 > ts1);
    }
}
