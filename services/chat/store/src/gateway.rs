//! Persistence gateway: keeps the chat core usable while the backing log
//! is unreachable.
//!
//! Writes that cannot reach the log are buffered in a durable queue and
//! flushed by a background task with exponential backoff. Reads fall back
//! to a bounded cache of recently confirmed messages. Components that need
//! to know when a buffered write finally lands subscribe to flush
//! confirmations.

use crate::outbox::Outbox;
use crate::{AppendRecord, ConversationId, ConversationLog, StoreError, StoredMessage};
use chat_wire::{ChatMessage, DeliveryState};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of an append through the gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The log confirmed the write; canonical timestamp assigned
    Confirmed(i64),
    /// The backend is unreachable; the write is queued and will be
    /// flushed later
    Queued,
}

/// Notification that a previously queued write reached the log
#[derive(Clone, Debug)]
pub struct FlushConfirmation {
    /// Conversation the message belongs to
    pub conversation: ConversationId,
    /// Message id
    pub message_id: String,
    /// Canonical timestamp assigned by the log
    pub server_created_at: i64,
}

/// Messages retained per conversation in the degraded-read cache
const CACHE_CAP: usize = 200;

/// Initial flush retry delay
const FLUSH_BACKOFF_BASE_MS: u64 = 500;
/// Maximum flush retry delay
const FLUSH_BACKOFF_CAP_MS: u64 = 15_000;

struct GatewayInner {
    log: Arc<dyn ConversationLog>,
    queue: Arc<Outbox>,
    cache: DashMap<ConversationId, VecDeque<StoredMessage>>,
    available: AtomicBool,
    wakeup: Notify,
    flush_tx: mpsc::UnboundedSender<FlushConfirmation>,
}

impl GatewayInner {
    fn cache_insert(&self, conv: &ConversationId, message: StoredMessage) {
        let mut entries = self.cache.entry(conv.clone()).or_default();
        if entries.iter().any(|m| m.id == message.id) {
            return;
        }
        entries.push_back(message);
        while entries.len() > CACHE_CAP {
            entries.pop_front();
        }
    }

    async fn try_append(
        &self,
        conv: &ConversationId,
        record: AppendRecord,
    ) -> Result<i64, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("backend marked down".to_string()));
        }
        self.append_direct(conv, record).await
    }

    /// Append against the log regardless of the availability flag. The
    /// flush task probes through this path.
    async fn append_direct(
        &self,
        conv: &ConversationId,
        record: AppendRecord,
    ) -> Result<i64, StoreError> {
        let ts = self.log.append(conv, record.clone()).await?;
        self.cache_insert(
            conv,
            StoredMessage {
                id: record.id,
                sender_id: record.sender_id,
                text: record.text,
                reply_to: record.reply_to,
                edited: record.edited,
                client_created_at: record.client_created_at,
                server_created_at: ts,
            },
        );
        Ok(ts)
    }
}

/// Resilient front for a [`ConversationLog`].
///
/// Cloneable handle; the flush task runs for the lifetime of the gateway
/// and is aborted when the last handle drops.
pub struct PersistenceGateway {
    inner: Arc<GatewayInner>,
    flush_task: Arc<FlushTaskGuard>,
}

struct FlushTaskGuard(JoinHandle<()>);

impl Drop for FlushTaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Clone for PersistenceGateway {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            flush_task: self.flush_task.clone(),
        }
    }
}

impl PersistenceGateway {
    /// Create a gateway over `log`, buffering failed writes in `queue`.
    ///
    /// `queue` is the gateway's private write-behind buffer; it must not
    /// be shared with the delivery outbox, or in-flight sends would be
    /// flushed into the local log as if they were buffered local writes.
    ///
    /// Returns the gateway and the receiver for flush confirmations. Any
    /// entries already in the queue (for example replayed from disk) are
    /// flushed once the backend is reachable.
    pub fn new(
        log: Arc<dyn ConversationLog>,
        queue: Arc<Outbox>,
    ) -> (Self, mpsc::UnboundedReceiver<FlushConfirmation>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(GatewayInner {
            log,
            queue,
            cache: DashMap::new(),
            available: AtomicBool::new(true),
            wakeup: Notify::new(),
            flush_tx,
        });

        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            Self::flush_loop(task_inner).await;
        });

        (
            Self {
                inner,
                flush_task: Arc::new(FlushTaskGuard(handle)),
            },
            flush_rx,
        )
    }

    /// Append a record. Returns `Confirmed` with the canonical timestamp
    /// when the log accepted the write, or `Queued` when the backend is
    /// down and the write was buffered.
    pub async fn append(
        &self,
        conv: &ConversationId,
        record: AppendRecord,
    ) -> Result<AppendOutcome, StoreError> {
        match self.inner.try_append(conv, record.clone()).await {
            Ok(ts) => Ok(AppendOutcome::Confirmed(ts)),
            Err(StoreError::Unavailable(reason)) => {
                warn!(
                    "Backend unavailable ({}); queueing {} for {}",
                    reason, record.id, conv
                );
                self.inner.queue.push(conv, record_to_message(record))?;
                self.inner.wakeup.notify_one();
                Ok(AppendOutcome::Queued)
            }
            Err(StoreError::Io(e)) => {
                // An I/O failure marks the backend down; the flush task
                // probes it back up
                warn!(
                    "Backend append failed ({}); marking down and queueing {} for {}",
                    e, record.id, conv
                );
                self.inner.available.store(false, Ordering::SeqCst);
                self.inner.queue.push(conv, record_to_message(record))?;
                self.inner.wakeup.notify_one();
                Ok(AppendOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    /// Messages after `cursor`. Served from the log when reachable,
    /// otherwise from the bounded cache of recently confirmed messages.
    pub async fn read_since(
        &self,
        conv: &ConversationId,
        cursor: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        if self.inner.available.load(Ordering::SeqCst) {
            match self.inner.log.read_since(conv, cursor).await {
                Ok(messages) => return Ok(messages),
                Err(e) => {
                    warn!("Log read failed for {}: {}; serving cached view", conv, e);
                }
            }
        } else {
            debug!("Backend marked down; serving cached view for {}", conv);
        }

        let cached = match self.inner.cache.get(conv) {
            Some(entries) => entries
                .iter()
                .filter(|m| m.server_created_at > cursor)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(cached)
    }

    /// Highest canonical timestamp known for a conversation
    pub async fn last_timestamp(&self, conv: &ConversationId) -> Result<i64, StoreError> {
        if self.inner.available.load(Ordering::SeqCst) {
            if let Ok(ts) = self.inner.log.last_timestamp(conv).await {
                return Ok(ts);
            }
        }
        let cached = self
            .inner
            .cache
            .get(conv)
            .and_then(|e| e.back().map(|m| m.server_created_at))
            .unwrap_or(0);
        Ok(cached)
    }

    /// Mark the backend reachable or unreachable. Marking it reachable
    /// wakes the flush task immediately. An unreachable marking holds
    /// until the flush task's next successful probe or an explicit flip
    /// back.
    pub fn set_backend_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::SeqCst);
        if was != available {
            info!(
                "Persistence backend now {}",
                if available { "available" } else { "unavailable" }
            );
        }
        if available {
            self.inner.wakeup.notify_one();
        }
    }

    /// Number of writes waiting to be flushed
    pub fn queued_writes(&self) -> usize {
        self.inner.queue.len()
    }

    async fn flush_loop(inner: Arc<GatewayInner>) {
        let mut backoff_ms = FLUSH_BACKOFF_BASE_MS;

        loop {
            if inner.queue.is_empty() {
                inner.wakeup.notified().await;
                continue;
            }

            // A backend believed down gets one probe per backoff period
            // rather than a write per queued entry
            if !inner.available.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {
                        backoff_ms = (backoff_ms * 2).min(FLUSH_BACKOFF_CAP_MS);
                    }
                    _ = inner.wakeup.notified() => {
                        backoff_ms = FLUSH_BACKOFF_BASE_MS;
                        continue;
                    }
                }
            }

            let mut made_progress = false;
            for entry in inner.queue.all() {
                let record = message_to_record(&entry.message);
                match inner.append_direct(&entry.conversation, record).await {
                    Ok(ts) => {
                        if !inner.available.swap(true, Ordering::SeqCst) {
                            info!("Persistence backend recovered");
                        }
                        if let Err(e) = inner.queue.remove(&entry.conversation, &entry.message.id) {
                            warn!("Failed to drop flushed entry {}: {}", entry.message.id, e);
                        }
                        let _ = inner.flush_tx.send(FlushConfirmation {
                            conversation: entry.conversation.clone(),
                            message_id: entry.message.id.clone(),
                            server_created_at: ts,
                        });
                        info!(
                            "Flushed queued write {} for {} (ts={})",
                            entry.message.id, entry.conversation, ts
                        );
                        made_progress = true;
                    }
                    Err(e) => {
                        debug!("Flush of {} failed: {}", entry.message.id, e);
                        if let Err(e) = inner.queue.record_attempt(&entry.conversation, &entry.message.id) {
                            warn!("Failed to record flush attempt: {}", e);
                        }
                        break;
                    }
                }
            }

            if made_progress {
                backoff_ms = FLUSH_BACKOFF_BASE_MS;
                if inner.queue.is_empty() {
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {
                    backoff_ms = (backoff_ms * 2).min(FLUSH_BACKOFF_CAP_MS);
                }
                _ = inner.wakeup.notified() => {
                    backoff_ms = FLUSH_BACKOFF_BASE_MS;
                }
            }
        }
    }
}

fn record_to_message(record: AppendRecord) -> ChatMessage {
    ChatMessage {
        id: record.id,
        sender_id: record.sender_id,
        text: record.text,
        reply_to: record.reply_to,
        edited: record.edited,
        client_created_at: record.client_created_at,
        server_created_at: None,
        state: DeliveryState::Pending,
    }
}

fn message_to_record(message: &ChatMessage) -> AppendRecord {
    AppendRecord {
        id: message.id.clone(),
        sender_id: message.sender_id.clone(),
        text: message.text.clone(),
        reply_to: message.reply_to.clone(),
        edited: message.edited,
        client_created_at: message.client_created_at,
    }
}
