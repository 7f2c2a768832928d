//! The reconciliation engine.

use crate::SyncError;
use chat_delivery::{ChatEvent, CoordinatorHandle, EventBus};
use chat_store::{ConversationId, PersistenceGateway};
use chat_transport::ConnectionState;
use chat_wire::{ChatMessage, DeliveryState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Log entries read past the cursor
    pub fetched: usize,
    /// Peer messages merged into the local view
    pub merged: usize,
    /// Own messages repaired to acked after a lost ack
    pub repaired: usize,
    /// Cursor after the pass
    pub cursor: i64,
}

struct EngineState {
    /// Highest `server_created_at` already reconciled; never moves
    /// backwards
    cursor: i64,
    /// Peer message ids already merged, so replays across passes stay
    /// idempotent
    merged: HashSet<String>,
}

/// Catches the local view up with the canonical log.
///
/// A pass reads everything past the cursor, publishes peer messages that
/// were missed while offline, and repairs own messages whose ack was lost
/// in transit. Concurrent triggers coalesce: the second caller waits for
/// the first pass and then reads only what it left behind.
pub struct ReconciliationEngine {
    conversation: ConversationId,
    local_user: String,
    gateway: PersistenceGateway,
    delivery: CoordinatorHandle,
    events: EventBus,
    state: Mutex<EngineState>,
    reconnect_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationEngine {
    /// Create an engine starting from cursor 0 (full history on the
    /// first pass)
    pub fn new(
        conversation: ConversationId,
        local_user: impl Into<String>,
        gateway: PersistenceGateway,
        delivery: CoordinatorHandle,
        events: EventBus,
    ) -> Self {
        Self {
            conversation,
            local_user: local_user.into(),
            gateway,
            delivery,
            events,
            state: Mutex::new(EngineState {
                cursor: 0,
                merged: HashSet::new(),
            }),
            reconnect_task: std::sync::Mutex::new(None),
        }
    }

    /// Current cursor position
    pub async fn cursor(&self) -> i64 {
        self.state.lock().await.cursor
    }

    /// Run one reconciliation pass
    pub async fn run(&self) -> Result<ReconcileReport, SyncError> {
        let mut state = self.state.lock().await;

        let entries = self
            .gateway
            .read_since(&self.conversation, state.cursor)
            .await?;

        let mut report = ReconcileReport {
            fetched: entries.len(),
            cursor: state.cursor,
            ..ReconcileReport::default()
        };
        if entries.is_empty() {
            debug!(
                "Reconciliation for {} found nothing past cursor {}",
                self.conversation, state.cursor
            );
            return Ok(report);
        }

        let snapshot = self.delivery.snapshot().await?;

        for entry in &entries {
            report.cursor = report.cursor.max(entry.server_created_at);

            if entry.sender_id == self.local_user {
                // Our own message is in the log; repair it if the ack
                // never made it back
                let needs_repair = snapshot.iter().any(|v| {
                    v.id == entry.id
                        && matches!(
                            v.state,
                            DeliveryState::Pending | DeliveryState::Sent | DeliveryState::Failed
                        )
                });
                if needs_repair {
                    info!(
                        "Repairing {} in {}: log holds ts={} but ack was lost",
                        entry.id, self.conversation, entry.server_created_at
                    );
                    self.delivery.repair(&entry.id, entry.server_created_at);
                    report.repaired += 1;
                }
                continue;
            }

            if !state.merged.insert(entry.id.clone()) {
                continue;
            }

            debug!(
                "Merging missed peer message {} (ts={})",
                entry.id, entry.server_created_at
            );
            self.events.publish(ChatEvent::MessageReceived {
                message: ChatMessage {
                    id: entry.id.clone(),
                    sender_id: entry.sender_id.clone(),
                    text: entry.text.clone(),
                    reply_to: entry.reply_to.clone(),
                    edited: entry.edited,
                    client_created_at: entry.client_created_at,
                    server_created_at: Some(entry.server_created_at),
                    state: DeliveryState::Delivered,
                },
            });
            report.merged += 1;
        }

        // Forward-only
        state.cursor = state.cursor.max(report.cursor);

        // The merged set only needs to cover entries a concurrent replay
        // could still surface; everything at or below the cursor is
        // already excluded by the read
        if state.merged.len() > 4096 {
            state.merged.clear();
        }

        info!(
            "Reconciled {}: fetched={} merged={} repaired={} cursor={}",
            self.conversation, report.fetched, report.merged, report.repaired, state.cursor
        );
        Ok(report)
    }

    /// Spawn a task that runs a pass every time the link comes back up
    pub fn run_on_reconnect(self: &Arc<Self>, mut states: watch::Receiver<ConnectionState>) {
        let mut guard = match self.reconnect_task.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }

        let engine = self.clone();
        *guard = Some(tokio::spawn(async move {
            let mut was_connected = matches!(*states.borrow(), ConnectionState::Connected(_));
            while states.changed().await.is_ok() {
                let connected = matches!(*states.borrow(), ConnectionState::Connected(_));
                if connected && !was_connected {
                    if let Err(e) = engine.run().await {
                        warn!("Post-reconnect reconciliation failed: {}", e);
                    }
                }
                was_connected = connected;
            }
        }));
    }
}

impl Drop for ReconciliationEngine {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reconnect_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}
