//! Message delivery coordinator.
//!
//! One coordinator runs per conversation as a command-driven task. It owns
//! the delivery state machine for outgoing messages, suppresses inbound
//! replays, persists and acknowledges peer messages through the gateway,
//! and drives retries off an adaptive ack deadline.
//!
//! An ack is persistence-confirmed: a message only becomes `Acked` once a
//! canonical timestamp exists for it. Transport acceptance alone moves it
//! to `Sent`.

use crate::dedup::DedupSet;
use crate::error::DeliveryError;
use crate::events::{ChatEvent, EventBus};
use crate::latency::LatencyWindow;
use crate::retry::RetryPolicy;
use chat_store::gateway::{AppendOutcome, FlushConfirmation};
use chat_store::{AppendRecord, ConversationId, Outbox, PersistenceGateway};
use chat_transport::TransportNegotiator;
use chat_wire::{
    AckPayload, ChatMessage, DeliveryState, Envelope, EnvelopeKind, MessagePayload,
    ReceiptPayload, ReceiptStatus,
};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Coordinator configuration
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Conversation this coordinator serves
    pub conversation: ConversationId,
    /// Local participant id
    pub local_user: String,
    /// Remote participant id
    pub peer_user: String,
    /// Retry schedule for transient failures
    pub retry: RetryPolicy,
}

/// An outgoing message tracked until it reaches a terminal state
struct TrackedMessage {
    message: ChatMessage,
    attempts: u32,
    sent_at: Option<Instant>,
    state_tx: watch::Sender<DeliveryState>,
}

/// Caller-side view of one outgoing message
#[derive(Clone, Debug)]
pub struct MessageHandle {
    /// Message id
    pub id: String,
    state_rx: watch::Receiver<DeliveryState>,
}

impl MessageHandle {
    /// Current delivery state
    pub fn state(&self) -> DeliveryState {
        *self.state_rx.borrow()
    }

    /// Wait until the message reaches `target` or a later state.
    /// Returns the state that satisfied the wait, or `Failed` as soon as
    /// the message fails.
    pub async fn wait_for(&mut self, target: DeliveryState) -> DeliveryState {
        loop {
            let current = *self.state_rx.borrow_and_update();
            if current == DeliveryState::Failed || current.rank() >= target.rank() {
                return current;
            }
            if self.state_rx.changed().await.is_err() {
                return *self.state_rx.borrow();
            }
        }
    }
}

/// Snapshot of one tracked message, for reconciliation
#[derive(Clone, Debug)]
pub struct TrackedView {
    /// Message id
    pub id: String,
    /// Current delivery state
    pub state: DeliveryState,
    /// Canonical timestamp, once acked
    pub server_created_at: Option<i64>,
}

enum Command {
    Submit {
        text: String,
        reply_to: Option<String>,
        reply: oneshot::Sender<Result<MessageHandle, DeliveryError>>,
    },
    Resend {
        message_id: String,
        reply: oneshot::Sender<Result<(), DeliveryError>>,
    },
    MarkRead {
        message_id: String,
        reply: oneshot::Sender<Result<(), DeliveryError>>,
    },
    Repair {
        message_id: String,
        server_created_at: i64,
    },
    Reauthenticated,
    Snapshot {
        reply: oneshot::Sender<Vec<TrackedView>>,
    },
    Shutdown,
}

#[derive(Debug)]
enum TimerKind {
    /// The ack deadline for a given send attempt expired
    AckDeadline { message_id: String, attempt: u32 },
    /// A scheduled retry is due
    Retry { message_id: String },
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// Handle for interacting with a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
}

impl CoordinatorHandle {
    /// Submit a message for delivery. Validation failures surface
    /// immediately; everything after that is tracked on the handle.
    pub async fn send_text(
        &self,
        text: impl Into<String>,
    ) -> Result<MessageHandle, DeliveryError> {
        self.submit(text.into(), None).await
    }

    /// Submit a reply to an earlier message
    pub async fn send_reply(
        &self,
        text: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Result<MessageHandle, DeliveryError> {
        self.submit(text.into(), Some(reply_to.into())).await
    }

    async fn submit(
        &self,
        text: String,
        reply_to: Option<String>,
    ) -> Result<MessageHandle, DeliveryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit {
                text,
                reply_to,
                reply,
            })
            .map_err(|_| DeliveryError::Closed)?;
        rx.await.map_err(|_| DeliveryError::Closed)?
    }

    /// Re-run delivery for a failed message
    pub async fn resend(&self, message_id: impl Into<String>) -> Result<(), DeliveryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Resend {
                message_id: message_id.into(),
                reply,
            })
            .map_err(|_| DeliveryError::Closed)?;
        rx.await.map_err(|_| DeliveryError::Closed)?
    }

    /// Emit a read receipt for an inbound message
    pub async fn mark_read(&self, message_id: impl Into<String>) -> Result<(), DeliveryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::MarkRead {
                message_id: message_id.into(),
                reply,
            })
            .map_err(|_| DeliveryError::Closed)?;
        rx.await.map_err(|_| DeliveryError::Closed)?
    }

    /// Force a tracked message to `Acked` with a known canonical
    /// timestamp. Used by reconciliation when the log already holds a
    /// message whose ack was lost.
    pub fn repair(&self, message_id: impl Into<String>, server_created_at: i64) {
        let _ = self.cmd_tx.send(Command::Repair {
            message_id: message_id.into(),
            server_created_at,
        });
    }

    /// Clear an auth halt after credentials were refreshed; delivery of
    /// halted messages resumes
    pub fn reauthenticated(&self) {
        let _ = self.cmd_tx.send(Command::Reauthenticated);
    }

    /// Snapshot of all tracked outgoing messages
    pub async fn snapshot(&self) -> Result<Vec<TrackedView>, DeliveryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot { reply })
            .map_err(|_| DeliveryError::Closed)?;
        rx.await.map_err(|_| DeliveryError::Closed)
    }

    /// Sender for inbound envelopes; the transport pump writes here
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.inbound_tx.clone()
    }

    /// Stop the coordinator
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

/// The per-conversation delivery actor
pub struct DeliveryCoordinator {
    config: CoordinatorConfig,
    negotiator: Arc<TransportNegotiator>,
    gateway: PersistenceGateway,
    outbox: Arc<Outbox>,
    events: EventBus,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    inbound_rx: mpsc::UnboundedReceiver<Envelope>,
    flush_rx: mpsc::UnboundedReceiver<FlushConfirmation>,

    tracked: HashMap<String, TrackedMessage>,
    dedup: DedupSet,
    /// Canonical timestamps of persisted inbound messages, for re-acking
    /// replays whose original ack was lost
    inbound_acks: HashMap<String, i64>,
    /// Inbound messages persisted into the queued write path, acked once
    /// the flush confirmation arrives
    pending_inbound: HashMap<String, Envelope>,
    latency: LatencyWindow,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_seq: u64,
    /// Set when the transport reports expired credentials; no send leaves
    /// the coordinator until cleared
    auth_halted: bool,
}

impl DeliveryCoordinator {
    /// Create a coordinator and its handle. `flush_rx` is the
    /// confirmation stream from the gateway backing this conversation.
    pub fn new(
        config: CoordinatorConfig,
        negotiator: Arc<TransportNegotiator>,
        gateway: PersistenceGateway,
        outbox: Arc<Outbox>,
        events: EventBus,
        flush_rx: mpsc::UnboundedReceiver<FlushConfirmation>,
    ) -> (Self, CoordinatorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            config,
            negotiator,
            gateway,
            outbox,
            events,
            cmd_rx,
            inbound_rx,
            flush_rx,
            tracked: HashMap::new(),
            dedup: DedupSet::new(),
            inbound_acks: HashMap::new(),
            pending_inbound: HashMap::new(),
            latency: LatencyWindow::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            auth_halted: false,
        };

        (coordinator, CoordinatorHandle { cmd_tx, inbound_tx })
    }

    /// Run the coordinator until shutdown
    pub async fn run(mut self) {
        let mut transport_events = self.negotiator.subscribe_events();

        // Resume delivery of anything left in the outbox from a previous
        // run
        let resumable: Vec<ChatMessage> = self
            .outbox
            .all()
            .into_iter()
            .filter(|e| e.conversation == self.config.conversation)
            .map(|e| e.message)
            .collect();
        for message in resumable {
            info!("Resuming delivery of {} from outbox", message.id);
            self.track(message);
        }
        let resume_ids: Vec<String> = self.tracked.keys().cloned().collect();
        for id in resume_ids {
            self.attempt_send(&id).await;
        }

        info!(
            "Delivery coordinator running for {} ({} <-> {})",
            self.config.conversation, self.config.local_user, self.config.peer_user
        );

        loop {
            let next_timer = self.timers.peek().map(|Reverse(e)| e.at);

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                envelope = self.inbound_rx.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_inbound(envelope).await,
                        None => break,
                    }
                }
                flush = self.flush_rx.recv() => {
                    if let Some(confirmation) = flush {
                        self.handle_flush(confirmation).await;
                    }
                }
                event = transport_events.recv() => {
                    use chat_transport::TransportEvent;
                    match event {
                        Ok(TransportEvent::Connected { .. })
                        | Ok(TransportEvent::Degraded { .. })
                        | Ok(TransportEvent::Upgraded { .. }) => {
                            self.flush_unconfirmed().await;
                        }
                        _ => {}
                    }
                }
                _ = async {
                    if let Some(at) = next_timer {
                        tokio::time::sleep_until(at).await;
                    }
                }, if next_timer.is_some() => {
                    if let Some(Reverse(entry)) = self.timers.pop() {
                        self.handle_timer(entry.kind).await;
                    }
                }
            }
        }

        debug!(
            "Delivery coordinator for {} stopped",
            self.config.conversation
        );
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit {
                text,
                reply_to,
                reply,
            } => {
                let result = self.submit(text, reply_to).await;
                let _ = reply.send(result);
            }
            Command::Resend { message_id, reply } => {
                let _ = reply.send(self.resend(&message_id).await);
            }
            Command::MarkRead { message_id, reply } => {
                let _ = reply.send(self.send_receipt(&message_id, ReceiptStatus::Read).await);
            }
            Command::Repair {
                message_id,
                server_created_at,
            } => {
                self.repair(&message_id, server_created_at);
            }
            Command::Reauthenticated => {
                if self.auth_halted {
                    info!("Credentials refreshed; resuming halted deliveries");
                    self.auth_halted = false;
                    let halted: Vec<String> = self
                        .tracked
                        .iter()
                        .filter(|(_, t)| {
                            matches!(
                                t.message.state,
                                DeliveryState::Pending | DeliveryState::Sent
                            )
                        })
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in halted {
                        self.attempt_send(&id).await;
                    }
                }
            }
            Command::Snapshot { reply } => {
                let views = self
                    .tracked
                    .values()
                    .map(|t| TrackedView {
                        id: t.message.id.clone(),
                        state: t.message.state,
                        server_created_at: t.message.server_created_at,
                    })
                    .collect();
                let _ = reply.send(views);
            }
            Command::Shutdown => {}
        }
    }

    async fn submit(
        &mut self,
        text: String,
        reply_to: Option<String>,
    ) -> Result<MessageHandle, DeliveryError> {
        if self.auth_halted {
            return Err(DeliveryError::AuthExpired);
        }

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: self.config.local_user.clone(),
            text,
            reply_to,
            edited: false,
            client_created_at: chat_wire::now_millis(),
            server_created_at: None,
            state: DeliveryState::Pending,
        };

        // Validation happens before anything is tracked or queued
        let envelope = self.message_envelope(&message)?;
        envelope.validate()?;

        self.outbox.push(&self.config.conversation, message.clone())?;
        let handle = self.track(message);
        self.attempt_send(&handle.id).await;
        Ok(handle)
    }

    async fn resend(&mut self, message_id: &str) -> Result<(), DeliveryError> {
        let tracked = self
            .tracked
            .get_mut(message_id)
            .ok_or_else(|| DeliveryError::UnknownMessage(message_id.to_string()))?;

        if tracked.message.state != DeliveryState::Failed {
            return Err(DeliveryError::IllegalTransition {
                id: message_id.to_string(),
                from: tracked.message.state,
                to: DeliveryState::Pending,
            });
        }

        tracked.attempts = 0;
        let message = tracked.message.clone();
        self.transition(message_id, DeliveryState::Pending);
        self.outbox.push(&self.config.conversation, message)?;
        self.attempt_send(message_id).await;
        Ok(())
    }

    fn track(&mut self, message: ChatMessage) -> MessageHandle {
        let (state_tx, state_rx) = watch::channel(message.state);
        let id = message.id.clone();
        self.tracked.insert(
            id.clone(),
            TrackedMessage {
                message,
                attempts: 0,
                sent_at: None,
                state_tx,
            },
        );
        MessageHandle { id, state_rx }
    }

    async fn attempt_send(&mut self, message_id: &str) {
        if self.auth_halted {
            debug!("Send of {} held back by auth halt", message_id);
            return;
        }

        // A fully degraded link is renegotiated first. On success the
        // connected event flushes the outbox in submission order, which
        // includes this message; sending it here instead would let a
        // jittered retry overtake earlier buffered messages.
        if self.negotiator.state() == chat_transport::ConnectionState::Disconnected {
            match self.negotiator.connect().await {
                Ok(_) => return,
                Err(e) => {
                    let attempts = match self.tracked.get_mut(message_id) {
                        Some(t) => {
                            t.attempts += 1;
                            t.attempts
                        }
                        None => return,
                    };
                    debug!(
                        "Renegotiation failed before attempt {} for {}: {}",
                        attempts, message_id, e
                    );
                    self.schedule_retry_or_fail(message_id, attempts);
                    return;
                }
            }
        }

        let (envelope, attempt) = {
            let tracked = match self.tracked.get_mut(message_id) {
                Some(t) => t,
                None => return,
            };
            tracked.attempts += 1;
            tracked.sent_at = Some(Instant::now());
            let envelope = match build_message_envelope(&tracked.message, &self.config.local_user) {
                Ok(e) => e,
                Err(e) => {
                    warn!("Cannot encode {}: {}", message_id, e);
                    return;
                }
            };
            (envelope, tracked.attempts)
        };

        if let Err(e) = self
            .outbox
            .record_attempt(&self.config.conversation, message_id)
        {
            warn!("Outbox bookkeeping failed for {}: {}", message_id, e);
        }

        match self.negotiator.send(envelope).await {
            Ok(()) => {
                debug!("Attempt {} for {} accepted by transport", attempt, message_id);
                self.transition(message_id, DeliveryState::Sent);
                let deadline = Instant::now() + self.latency.ack_timeout();
                self.schedule(
                    deadline,
                    TimerKind::AckDeadline {
                        message_id: message_id.to_string(),
                        attempt,
                    },
                );
            }
            Err(chat_transport::TransportError::AuthExpired) => {
                warn!("Credentials expired; halting all sends");
                self.auth_halted = true;
            }
            Err(e) => {
                debug!("Attempt {} for {} failed: {}", attempt, message_id, e);
                self.schedule_retry_or_fail(message_id, attempt);
            }
        }
    }

    /// Resend everything still awaiting an ack, in outbox (submission)
    /// order. Runs when the link comes back so buffered messages land in
    /// the order they were written; the receiver's dedup absorbs any
    /// overlap with in-flight retry timers.
    async fn flush_unconfirmed(&mut self) {
        let pending: Vec<String> = self
            .outbox
            .all()
            .into_iter()
            .filter(|e| e.conversation == self.config.conversation)
            .map(|e| e.message.id)
            .filter(|id| {
                self.tracked
                    .get(id)
                    .map(|t| t.message.state.rank() < DeliveryState::Acked.rank())
                    .unwrap_or(false)
            })
            .collect();

        if pending.is_empty() {
            return;
        }
        debug!("Link restored; flushing {} unconfirmed messages", pending.len());
        for id in pending {
            self.attempt_send(&id).await;
        }
    }

    fn schedule_retry_or_fail(&mut self, message_id: &str, attempts: u32) {
        if self.config.retry.allows(attempts) {
            let delay = self.config.retry.delay(attempts + 1);
            debug!(
                "Retrying {} in {:?} (attempt {} of {})",
                message_id,
                delay,
                attempts + 1,
                self.config.retry.max_attempts()
            );
            self.schedule(
                Instant::now() + delay,
                TimerKind::Retry {
                    message_id: message_id.to_string(),
                },
            );
        } else {
            warn!(
                "Delivery attempts exhausted for {}; marking failed",
                message_id
            );
            self.transition(message_id, DeliveryState::Failed);
        }
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::AckDeadline {
                message_id,
                attempt,
            } => {
                let stale = match self.tracked.get(&message_id) {
                    // Only the deadline of the latest attempt counts, and
                    // only while the message is still awaiting its ack
                    Some(t) => t.attempts != attempt || t.message.state.rank() >= DeliveryState::Acked.rank(),
                    None => true,
                };
                if stale {
                    return;
                }
                debug!("Ack deadline expired for {} (attempt {})", message_id, attempt);
                self.schedule_retry_or_fail(&message_id, attempt);
            }
            TimerKind::Retry { message_id } => {
                let eligible = self
                    .tracked
                    .get(&message_id)
                    .map(|t| t.message.state.rank() < DeliveryState::Acked.rank())
                    .unwrap_or(false);
                if eligible {
                    self.attempt_send(&message_id).await;
                }
            }
        }
    }

    async fn handle_inbound(&mut self, envelope: Envelope) {
        if let Err(e) = envelope.validate() {
            warn!("Dropping invalid inbound envelope: {}", e);
            return;
        }

        match envelope.kind {
            EnvelopeKind::Message => self.handle_inbound_message(envelope).await,
            EnvelopeKind::Ack => self.handle_ack(envelope).await,
            EnvelopeKind::Receipt => self.handle_receipt(envelope),
            EnvelopeKind::Typing => {
                self.events.publish(ChatEvent::Typing {
                    user_id: envelope.sender_id,
                });
            }
            EnvelopeKind::Presence => {
                // Presence beats are routed to the tracker by the envelope
                // pump; one arriving here is harmless
                debug!("Presence envelope from {} on delivery path", envelope.sender_id);
            }
        }
    }

    async fn handle_inbound_message(&mut self, envelope: Envelope) {
        let payload: MessagePayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!("Bad message payload from {}: {}", envelope.sender_id, e);
                return;
            }
        };

        let is_new = self.dedup.insert(&envelope.id);
        if !is_new {
            // Replay: the peer is resending because our ack got lost.
            // Re-ack with the canonical timestamp if we still have it.
            if let Some(&ts) = self.inbound_acks.get(&envelope.id) {
                debug!("Re-acking replayed message {}", envelope.id);
                self.send_ack(&envelope.id, ts).await;
            }
            return;
        }

        let record = AppendRecord {
            id: envelope.id.clone(),
            sender_id: envelope.sender_id.clone(),
            text: payload.text.clone(),
            reply_to: payload.reply_to.clone(),
            edited: payload.edited,
            client_created_at: envelope.client_timestamp,
        };

        match self.gateway.append(&self.config.conversation, record).await {
            Ok(AppendOutcome::Confirmed(ts)) => {
                self.finish_inbound(envelope, payload, ts).await;
            }
            Ok(AppendOutcome::Queued) => {
                // The ack waits for the flush confirmation so it stays
                // persistence-confirmed
                debug!(
                    "Inbound {} queued behind backend outage; deferring ack",
                    envelope.id
                );
                self.pending_inbound.insert(envelope.id.clone(), envelope);
            }
            Err(e) => {
                warn!("Failed to persist inbound {}: {}", envelope.id, e);
                // Not acked; the peer will retry and dedup absorbs it
            }
        }
    }

    async fn handle_flush(&mut self, confirmation: FlushConfirmation) {
        if confirmation.conversation != self.config.conversation {
            return;
        }

        // Flush confirmations only ever cover inbound messages this
        // coordinator appended locally. Outgoing messages are acked by
        // the peer's log, never by our own.
        if let Some(envelope) = self.pending_inbound.remove(&confirmation.message_id) {
            if let Ok(payload) = envelope.payload_as::<MessagePayload>() {
                self.finish_inbound(envelope, payload, confirmation.server_created_at)
                    .await;
            }
        }
    }

    async fn finish_inbound(&mut self, envelope: Envelope, payload: MessagePayload, ts: i64) {
        self.remember_inbound_ack(envelope.id.clone(), ts);
        self.send_ack(&envelope.id, ts).await;
        self.send_receipt(&envelope.id, ReceiptStatus::Delivered)
            .await
            .ok();

        let message = ChatMessage {
            id: envelope.id,
            sender_id: envelope.sender_id,
            text: payload.text,
            reply_to: payload.reply_to,
            edited: payload.edited,
            client_created_at: envelope.client_timestamp,
            server_created_at: Some(ts),
            state: DeliveryState::Delivered,
        };
        self.events.publish(ChatEvent::MessageReceived { message });
    }

    fn remember_inbound_ack(&mut self, id: String, ts: i64) {
        // Bounded alongside the dedup window; replays older than that are
        // resolved by reconciliation instead
        if self.inbound_acks.len() >= crate::dedup::DEDUP_CAP * 2 {
            self.inbound_acks.clear();
        }
        self.inbound_acks.insert(id, ts);
    }

    async fn handle_ack(&mut self, envelope: Envelope) {
        let payload: AckPayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!("Bad ack payload: {}", e);
                return;
            }
        };
        self.apply_ack(&payload.message_id, payload.server_timestamp);
    }

    fn apply_ack(&mut self, message_id: &str, server_created_at: i64) {
        let rtt = match self.tracked.get_mut(message_id) {
            Some(tracked) => {
                if tracked.message.state.rank() >= DeliveryState::Acked.rank() {
                    // Duplicate ack
                    return;
                }
                tracked.message.server_created_at = Some(server_created_at);
                tracked.sent_at.map(|at| at.elapsed())
            }
            None => {
                debug!("Ack for untracked message {}", message_id);
                return;
            }
        };

        if let Some(rtt) = rtt {
            self.latency.record(rtt);
            debug!(
                "RTT sample {:?} for {}; ack timeout now {:?}",
                rtt,
                message_id,
                self.latency.ack_timeout()
            );
        }

        self.transition(message_id, DeliveryState::Acked);
        if let Err(e) = self.outbox.remove(&self.config.conversation, message_id) {
            warn!("Failed to clear {} from outbox: {}", message_id, e);
        }
    }

    fn handle_receipt(&mut self, envelope: Envelope) {
        let payload: ReceiptPayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!("Bad receipt payload: {}", e);
                return;
            }
        };

        let target = match payload.status {
            ReceiptStatus::Delivered => DeliveryState::Delivered,
            ReceiptStatus::Read => DeliveryState::Read,
        };

        if self.tracked.contains_key(&payload.message_id) {
            self.transition(&payload.message_id, target);
        } else {
            debug!("Receipt for untracked message {}", payload.message_id);
        }
    }

    /// Force-ack a message whose canonical timestamp turned up during
    /// reconciliation
    fn repair(&mut self, message_id: &str, server_created_at: i64) {
        let eligible = self
            .tracked
            .get(message_id)
            .map(|t| {
                matches!(
                    t.message.state,
                    DeliveryState::Pending | DeliveryState::Sent | DeliveryState::Failed
                )
            })
            .unwrap_or(false);
        if !eligible {
            return;
        }

        info!(
            "Repairing {} to acked (ts={}) from reconciliation",
            message_id, server_created_at
        );
        if let Some(tracked) = self.tracked.get_mut(message_id) {
            tracked.message.server_created_at = Some(server_created_at);
            tracked.message.state = DeliveryState::Acked;
            let _ = tracked.state_tx.send(DeliveryState::Acked);
        }
        self.events.publish(ChatEvent::StateChanged {
            message_id: message_id.to_string(),
            state: DeliveryState::Acked,
        });
        if let Err(e) = self.outbox.remove(&self.config.conversation, message_id) {
            warn!("Failed to clear {} from outbox: {}", message_id, e);
        }
    }

    /// Apply a state transition if legal; illegal ones (stale receipts,
    /// regressions) are ignored
    fn transition(&mut self, message_id: &str, to: DeliveryState) -> bool {
        let applied = match self.tracked.get_mut(message_id) {
            Some(tracked) => {
                let from = tracked.message.state;
                if from == to {
                    false
                } else if from.can_transition(to) {
                    tracked.message.state = to;
                    let _ = tracked.state_tx.send(to);
                    debug!("Message {} {} -> {}", message_id, from, to);
                    true
                } else {
                    debug!(
                        "Ignoring illegal transition {} -> {} for {}",
                        from, to, message_id
                    );
                    false
                }
            }
            None => false,
        };

        if applied {
            self.events.publish(ChatEvent::StateChanged {
                message_id: message_id.to_string(),
                state: to,
            });
        }
        applied
    }

    async fn send_ack(&mut self, message_id: &str, server_timestamp: i64) {
        let envelope = Envelope::new(
            Uuid::new_v4().to_string(),
            EnvelopeKind::Ack,
            self.config.local_user.clone(),
            &AckPayload {
                message_id: message_id.to_string(),
                server_timestamp,
            },
            chat_wire::now_millis(),
        );
        match envelope {
            Ok(envelope) => {
                if let Err(e) = self.negotiator.send(envelope).await {
                    debug!("Ack for {} not sent: {}", message_id, e);
                }
            }
            Err(e) => warn!("Cannot build ack for {}: {}", message_id, e),
        }
    }

    async fn send_receipt(
        &mut self,
        message_id: &str,
        status: ReceiptStatus,
    ) -> Result<(), DeliveryError> {
        let envelope = Envelope::new(
            Uuid::new_v4().to_string(),
            EnvelopeKind::Receipt,
            self.config.local_user.clone(),
            &ReceiptPayload {
                message_id: message_id.to_string(),
                status,
            },
            chat_wire::now_millis(),
        )?;
        self.negotiator.send(envelope).await?;
        Ok(())
    }

    fn message_envelope(&self, message: &ChatMessage) -> Result<Envelope, DeliveryError> {
        Ok(build_message_envelope(message, &self.config.local_user)?)
    }

    fn schedule(&mut self, at: Instant, kind: TimerKind) {
        self.timer_seq += 1;
        self.timers.push(Reverse(TimerEntry {
            at,
            seq: self.timer_seq,
            kind,
        }));
    }
}

fn build_message_envelope(
    message: &ChatMessage,
    sender: &str,
) -> Result<Envelope, chat_wire::WireError> {
    Envelope::new(
        message.id.clone(),
        EnvelopeKind::Message,
        sender,
        &MessagePayload {
            text: message.text.clone(),
            reply_to: message.reply_to.clone(),
            edited: message.edited,
        },
        message.client_created_at,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_store::MemoryLog;
    use chat_transport::channel::ChannelFactory;
    use chat_transport::TierKind;
    use std::time::Duration;

    struct Harness {
        handle: CoordinatorHandle,
        factory: Arc<ChannelFactory>,
        /// Traffic the coordinator sends over the duplex tier
        wire_rx: mpsc::UnboundedReceiver<Envelope>,
        gateway: PersistenceGateway,
        events: EventBus,
    }

    async fn harness(retry: RetryPolicy) -> Harness {
        let factory = Arc::new(ChannelFactory::new());
        let wire_rx = factory.allow(TierKind::DuplexSocket).await;

        let negotiator = Arc::new(TransportNegotiator::new(factory.clone()));
        negotiator.connect().await.unwrap();

        let log: Arc<dyn chat_store::ConversationLog> = Arc::new(MemoryLog::new(100));
        let outbox = Arc::new(Outbox::new());
        let (gateway, flush_rx) = PersistenceGateway::new(log, Arc::new(Outbox::new()));
        let events = EventBus::new();

        let config = CoordinatorConfig {
            conversation: ConversationId::from("c1"),
            local_user: "alice".to_string(),
            peer_user: "bob".to_string(),
            retry,
        };

        let (coordinator, handle) = DeliveryCoordinator::new(
            config,
            negotiator,
            gateway.clone(),
            outbox,
            events.clone(),
            flush_rx,
        );
        tokio::spawn(coordinator.run());

        Harness {
            handle,
            factory,
            wire_rx,
            gateway,
            events,
        }
    }

    fn ack_for(envelope: &Envelope, ts: i64) -> Envelope {
        Envelope::new(
            Uuid::new_v4().to_string(),
            EnvelopeKind::Ack,
            "bob",
            &AckPayload {
                message_id: envelope.id.clone(),
                server_timestamp: ts,
            },
            chat_wire::now_millis(),
        )
        .unwrap()
    }

    fn receipt_for(message_id: &str, status: ReceiptStatus) -> Envelope {
        Envelope::new(
            Uuid::new_v4().to_string(),
            EnvelopeKind::Receipt,
            "bob",
            &ReceiptPayload {
                message_id: message_id.to_string(),
                status,
            },
            chat_wire::now_millis(),
        )
        .unwrap()
    }

    fn peer_message(id: &str, text: &str) -> Envelope {
        Envelope::new(
            id,
            EnvelopeKind::Message,
            "bob",
            &MessagePayload {
                text: text.to_string(),
                reply_to: None,
                edited: false,
            },
            chat_wire::now_millis(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_progresses_through_states() {
        let mut h = harness(RetryPolicy::new()).await;

        let mut handle = h.handle.send_text("hello").await.unwrap();
        assert_eq!(handle.wait_for(DeliveryState::Sent).await, DeliveryState::Sent);

        let on_wire = h.wire_rx.recv().await.unwrap();
        assert_eq!(on_wire.id, handle.id);
        assert_eq!(on_wire.kind, EnvelopeKind::Message);

        h.handle.inbound_sender().send(ack_for(&on_wire, 42)).unwrap();
        assert_eq!(handle.wait_for(DeliveryState::Acked).await, DeliveryState::Acked);

        h.handle
            .inbound_sender()
            .send(receipt_for(&handle.id, ReceiptStatus::Delivered))
            .unwrap();
        assert_eq!(
            handle.wait_for(DeliveryState::Delivered).await,
            DeliveryState::Delivered
        );

        h.handle
            .inbound_sender()
            .send(receipt_for(&handle.id, ReceiptStatus::Read))
            .unwrap();
        assert_eq!(handle.wait_for(DeliveryState::Read).await, DeliveryState::Read);
    }

    #[tokio::test]
    async fn test_invalid_message_rejected_immediately() {
        let h = harness(RetryPolicy::new()).await;
        let oversized = "x".repeat(20 * 1024);
        let result = h.handle.send_text(oversized).await;
        assert!(matches!(result, Err(DeliveryError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_read_receipt_cannot_regress() {
        let mut h = harness(RetryPolicy::new()).await;

        let mut handle = h.handle.send_text("hello").await.unwrap();
        let on_wire = h.wire_rx.recv().await.unwrap();
        h.handle.inbound_sender().send(ack_for(&on_wire, 1)).unwrap();
        h.handle
            .inbound_sender()
            .send(receipt_for(&handle.id, ReceiptStatus::Read))
            .unwrap();
        assert_eq!(handle.wait_for(DeliveryState::Read).await, DeliveryState::Read);

        // Late delivered receipt is ignored
        h.handle
            .inbound_sender()
            .send(receipt_for(&handle.id, ReceiptStatus::Delivered))
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(handle.state(), DeliveryState::Read);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_retries_then_fails() {
        let retry = RetryPolicy::with_timing(
            Duration::from_millis(10),
            Duration::from_millis(50),
            3,
        );
        let mut h = harness(retry).await;

        let mut handle = h.handle.send_text("hello").await.unwrap();

        // Never ack: every attempt reaches the wire, then times out
        let mut attempts = 0;
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_secs(60), h.wire_rx.recv()).await
        {
            assert_eq!(envelope.id, handle.id);
            attempts += 1;
            if attempts == 3 {
                break;
            }
        }
        assert_eq!(attempts, 3);

        assert_eq!(
            handle.wait_for(DeliveryState::Read).await,
            DeliveryState::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_after_failure() {
        let retry = RetryPolicy::with_timing(Duration::from_millis(10), Duration::from_millis(20), 1);
        let mut h = harness(retry).await;

        // Kill the only tier so the single attempt fails
        h.factory
            .transport(TierKind::DuplexSocket)
            .await
            .unwrap()
            .set_healthy(false);
        h.factory.deny(TierKind::DuplexSocket).await;

        let mut handle = h.handle.send_text("hello").await.unwrap();
        assert_eq!(
            handle.wait_for(DeliveryState::Read).await,
            DeliveryState::Failed
        );

        // Restore the tier and resend manually
        let mut wire_rx = h.factory.allow(TierKind::DuplexSocket).await;
        h.handle.resend(&handle.id).await.unwrap();

        let on_wire = tokio::time::timeout(Duration::from_secs(60), wire_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(on_wire.id, handle.id);

        h.handle.inbound_sender().send(ack_for(&on_wire, 7)).unwrap();
        assert_eq!(handle.wait_for(DeliveryState::Acked).await, DeliveryState::Acked);
    }

    #[tokio::test]
    async fn test_inbound_message_persisted_acked_and_deduped() {
        let mut h = harness(RetryPolicy::new()).await;
        let mut events = h.events.subscribe();

        h.handle.inbound_sender().send(peer_message("p1", "hi")).unwrap();

        // The coordinator answers with a persistence-confirmed ack and a
        // delivered receipt
        let ack = h.wire_rx.recv().await.unwrap();
        assert_eq!(ack.kind, EnvelopeKind::Ack);
        let payload: AckPayload = ack.payload_as().unwrap();
        assert_eq!(payload.message_id, "p1");
        assert!(payload.server_timestamp > 0);

        let receipt = h.wire_rx.recv().await.unwrap();
        assert_eq!(receipt.kind, EnvelopeKind::Receipt);

        match events.recv().await.unwrap() {
            ChatEvent::MessageReceived { message } => {
                assert_eq!(message.id, "p1");
                assert_eq!(message.server_created_at, Some(payload.server_timestamp));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // The log holds exactly one copy after a replay
        h.handle.inbound_sender().send(peer_message("p1", "hi")).unwrap();
        let re_ack = h.wire_rx.recv().await.unwrap();
        assert_eq!(re_ack.kind, EnvelopeKind::Ack);
        let re_payload: AckPayload = re_ack.payload_as().unwrap();
        assert_eq!(re_payload.server_timestamp, payload.server_timestamp);

        let stored = h
            .gateway
            .read_since(&ConversationId::from("c1"), 0)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_flush_cycle_never_acks_undelivered_send() {
        let retry = RetryPolicy::with_timing(
            Duration::from_millis(10),
            Duration::from_millis(50),
            3,
        );
        let mut h = harness(retry).await;

        // Kill the only tier so nothing can reach the peer
        h.factory
            .transport(TierKind::DuplexSocket)
            .await
            .unwrap()
            .set_healthy(false);
        h.factory.deny(TierKind::DuplexSocket).await;

        let mut handle = h.handle.send_text("hello").await.unwrap();

        // Drive a full backend outage-and-recovery flush cycle while the
        // message is still in flight
        h.gateway.set_backend_available(false);
        h.gateway.set_backend_available(true);

        // The flush cycle must not ack a message the peer never saw
        assert_eq!(
            handle.wait_for(DeliveryState::Read).await,
            DeliveryState::Failed
        );
        assert!(h.wire_rx.try_recv().is_err());

        // And nothing leaked into the local log
        let stored = h
            .gateway
            .read_since(&ConversationId::from("c1"), 0)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_ack_deferred_until_flush() {
        let mut h = harness(RetryPolicy::new()).await;

        h.gateway.set_backend_available(false);
        h.handle.inbound_sender().send(peer_message("p1", "hi")).unwrap();

        // No ack while the write sits in the queue
        assert!(
            tokio::time::timeout(Duration::from_millis(200), h.wire_rx.recv())
                .await
                .is_err()
        );

        h.gateway.set_backend_available(true);
        let ack = tokio::time::timeout(Duration::from_secs(5), h.wire_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.kind, EnvelopeKind::Ack);
        let payload: AckPayload = ack.payload_as().unwrap();
        assert_eq!(payload.message_id, "p1");
    }

    #[tokio::test]
    async fn test_repair_moves_sent_to_acked() {
        let mut h = harness(RetryPolicy::new()).await;

        let mut handle = h.handle.send_text("hello").await.unwrap();
        let _on_wire = h.wire_rx.recv().await.unwrap();
        assert_eq!(handle.wait_for(DeliveryState::Sent).await, DeliveryState::Sent);

        h.handle.repair(&handle.id, 99);
        assert_eq!(handle.wait_for(DeliveryState::Acked).await, DeliveryState::Acked);

        let snapshot = h.handle.snapshot().await.unwrap();
        let view = snapshot.iter().find(|v| v.id == handle.id).unwrap();
        assert_eq!(view.server_created_at, Some(99));
    }
}
