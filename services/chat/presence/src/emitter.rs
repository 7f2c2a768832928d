//! Outbound heartbeat emitter.

use crate::PresenceConfig;
use chat_wire::{Envelope, EnvelopeKind, PresencePayload, TypingPayload};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Emits a presence heartbeat on an interval for one local participant.
///
/// Envelopes go out through the provided sender; the caller wires that to
/// the active transport. The emitter task stops when the emitter drops.
pub struct HeartbeatEmitter {
    user_id: String,
    out_tx: mpsc::UnboundedSender<Envelope>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatEmitter {
    /// Create an emitter for `user_id` writing envelopes into `out_tx`
    pub fn new(user_id: impl Into<String>, out_tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            user_id: user_id.into(),
            out_tx,
            task: None,
        }
    }

    /// Start the heartbeat loop. Idempotent.
    pub fn start(&mut self, config: &PresenceConfig) {
        if self.task.is_some() {
            return;
        }

        let user_id = self.user_id.clone();
        let out_tx = self.out_tx.clone();
        let interval = config.heartbeat_interval;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match Self::beat(&user_id) {
                    Ok(envelope) => {
                        if out_tx.send(envelope).is_err() {
                            debug!("Heartbeat channel closed; stopping emitter for {}", user_id);
                            return;
                        }
                    }
                    Err(e) => warn!("Failed to build heartbeat: {}", e),
                }
            }
        }));
    }

    /// Build one typing-indicator envelope for this participant
    pub fn typing(&self) -> Result<Envelope, chat_wire::WireError> {
        Envelope::new(
            Uuid::new_v4().to_string(),
            EnvelopeKind::Typing,
            self.user_id.clone(),
            &TypingPayload {
                user_id: self.user_id.clone(),
            },
            chat_wire::now_millis(),
        )
    }

    fn beat(user_id: &str) -> Result<Envelope, chat_wire::WireError> {
        Envelope::new(
            Uuid::new_v4().to_string(),
            EnvelopeKind::Presence,
            user_id,
            &PresencePayload {
                user_id: user_id.to_string(),
                online: true,
            },
            chat_wire::now_millis(),
        )
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_emits_heartbeats_on_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut emitter = HeartbeatEmitter::new("alice", tx);
        emitter.start(&PresenceConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..PresenceConfig::default()
        });

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, EnvelopeKind::Presence);
        assert_eq!(first.sender_id, "alice");

        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_stops_on_drop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut emitter = HeartbeatEmitter::new("alice", tx);
            emitter.start(&PresenceConfig {
                heartbeat_interval: Duration::from_millis(10),
                ..PresenceConfig::default()
            });
            let _ = rx.recv().await;
        }
        // Sender dropped with the emitter; the channel drains then closes
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(envelope) = rx.try_recv() {
            assert_eq!(envelope.kind, EnvelopeKind::Presence);
        }
        assert!(rx.try_recv().is_err());
    }
}
