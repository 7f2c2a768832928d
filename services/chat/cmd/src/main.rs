//! Chat core binary.
//!
//! Runs a two-participant loopback demo: both sides of a conversation are
//! wired in-process over channel transports, each with its own log,
//! outbox, presence tracker, and delivery coordinator. Messages sent from
//! one side flow through negotiation, delivery, persistence-confirmed
//! acks, and read receipts on the other.

use anyhow::Result;
use chat_delivery::{
    ChatEvent, CoordinatorConfig, CoordinatorHandle, DeliveryCoordinator, EventBus, RetryPolicy,
};
use chat_presence::{HeartbeatEmitter, PresenceConfig, PresenceTracker};
use chat_store::{ConversationId, ConversationLog, Outbox, PersistenceGateway, StorageMode};
use chat_sync::ReconciliationEngine;
use chat_transport::channel::ChannelFactory;
use chat_transport::{ConnectionRegistry, TierKind, TransportNegotiator};
use chat_wire::{Envelope, EnvelopeKind, PresencePayload};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod logging;

use config::ChatConfig;
use logging::ChatLogFormatter;

/// Two-participant chat core with tiered transport fallback
#[derive(Parser, Debug)]
#[command(name = "duolink-chat", version, about = "Real-time chat delivery core")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "duolink.yaml")]
    config: PathBuf,

    /// Data directory override
    #[arg(long)]
    data_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Demo messages to send from the local participant
    #[arg(long, default_value_t = 3)]
    demo_messages: u32,
}

/// One fully wired side of the conversation
struct Participant {
    user_id: String,
    handle: CoordinatorHandle,
    negotiator: Arc<TransportNegotiator>,
    tracker: Arc<PresenceTracker>,
    #[allow(dead_code)]
    emitter: HeartbeatEmitter,
    #[allow(dead_code)]
    reconciler: Arc<ReconciliationEngine>,
    events: EventBus,
}

/// Channels a participant's outbound traffic leaves on
struct Outbound {
    wire_rx: mpsc::UnboundedReceiver<Envelope>,
    poll_rx: mpsc::UnboundedReceiver<Envelope>,
}

async fn build_participant(
    config: &ChatConfig,
    user_id: &str,
    peer_id: &str,
) -> Result<(Participant, Outbound)> {
    let conv = ConversationId(config.conversation_id.clone());

    // Transport: duplex plus polling fallback, both in-process
    let factory = Arc::new(ChannelFactory::new());
    let wire_rx = factory.allow(TierKind::DuplexSocket).await;
    let poll_rx = factory.allow(TierKind::Polling).await;
    let negotiator = Arc::new(TransportNegotiator::with_connect_timeout(
        factory,
        config.connect_timeout,
    ));

    // Per-participant persistence. The delivery outbox and the gateway's
    // write buffer are separate queues with separate spill files; sharing
    // one would flush in-flight sends into the local log.
    let (log, outbox, write_buffer): (Box<dyn ConversationLog>, Arc<Outbox>, Arc<Outbox>) =
        match config.storage_mode.as_str() {
            "file" => {
                let dir = PathBuf::from(&config.data_dir).join(user_id);
                std::fs::create_dir_all(&dir)?;
                let log = chat_store::log_from_mode(StorageMode::File {
                    data_dir: dir.to_string_lossy().to_string(),
                    fsync_every: config.fsync_every,
                })?;
                let outbox = Arc::new(Outbox::with_spill(dir.join("outbox.json"))?);
                let write_buffer = Arc::new(Outbox::with_spill(dir.join("write-buffer.json"))?);
                (log, outbox, write_buffer)
            }
            _ => (
                chat_store::log_from_mode(StorageMode::InMemory)?,
                Arc::new(Outbox::new()),
                Arc::new(Outbox::new()),
            ),
        };
    let (gateway, flush_rx) = PersistenceGateway::new(Arc::from(log), write_buffer);

    let events = EventBus::new();
    let retry = RetryPolicy::with_timing(
        config.retry_base,
        config.retry_cap,
        config.retry_max_attempts,
    );

    let (coordinator, handle) = DeliveryCoordinator::new(
        CoordinatorConfig {
            conversation: conv.clone(),
            local_user: user_id.to_string(),
            peer_user: peer_id.to_string(),
            retry,
        },
        negotiator.clone(),
        gateway.clone(),
        outbox,
        events.clone(),
        flush_rx,
    );
    tokio::spawn(coordinator.run());

    // Presence
    let presence_config = PresenceConfig {
        heartbeat_interval: config.heartbeat_interval,
        offline_multiplier: config.offline_multiplier,
        sweep_interval: config.sweep_interval,
        prune_after: config.prune_after,
    };
    let tracker = Arc::new(PresenceTracker::new(presence_config.clone()));
    tracker.start();

    // Heartbeats flow over the negotiated link like any other envelope
    let (hb_tx, mut hb_rx) = mpsc::unbounded_channel();
    let mut emitter = HeartbeatEmitter::new(user_id, hb_tx);
    emitter.start(&presence_config);
    {
        let negotiator = negotiator.clone();
        tokio::spawn(async move {
            while let Some(beat) = hb_rx.recv().await {
                if let Err(e) = negotiator.send(beat).await {
                    debug!("Heartbeat not sent: {}", e);
                }
            }
        });
    }

    // Presence transitions onto the event bus
    {
        let mut updates = tracker.subscribe();
        let events = events.clone();
        tokio::spawn(async move {
            while let Ok(update) = updates.recv().await {
                events.publish(ChatEvent::Presence {
                    user_id: update.user_id,
                    online: update.online,
                    last_seen_at: update.last_seen_at,
                });
            }
        });
    }

    // Connection changes onto the event bus
    {
        let mut states = negotiator.watch_state();
        let events = events.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow();
                let tier = match state {
                    chat_transport::ConnectionState::Connected(tier) => Some(tier),
                    _ => None,
                };
                events.publish(ChatEvent::Connection { state, tier });
            }
        });
    }

    // Reconciliation after every reconnect
    let reconciler = Arc::new(ReconciliationEngine::new(
        conv,
        user_id,
        gateway,
        handle.clone(),
        events.clone(),
    ));
    reconciler.run_on_reconnect(negotiator.watch_state());

    Ok((
        Participant {
            user_id: user_id.to_string(),
            handle,
            negotiator,
            tracker,
            emitter,
            reconciler,
            events,
        },
        Outbound { wire_rx, poll_rx },
    ))
}

/// Forward one participant's outbound traffic into the other's inbound
/// path, routing presence beats to the tracker
fn pump(mut outbound: Outbound, to: &Participant) {
    let inbound = to.handle.inbound_sender();
    let tracker = to.tracker.clone();
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                e = outbound.wire_rx.recv() => e,
                e = outbound.poll_rx.recv() => e,
            };
            let envelope = match envelope {
                Some(e) => e,
                None => break,
            };
            if envelope.kind == EnvelopeKind::Presence {
                tracker.record_heartbeat(&envelope.sender_id);
            } else if inbound.send(envelope).is_err() {
                break;
            }
        }
    });
}

/// Log every event a participant observes, marking read on arrival
fn watch_events(participant: &Participant, auto_read: bool) {
    let mut events = participant.events.subscribe();
    let user = participant.user_id.clone();
    let handle = participant.handle.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChatEvent::MessageReceived { message } => {
                    info!(
                        component = "events",
                        "[{}] received {} from {}: {:?}",
                        user,
                        message.id,
                        message.sender_id,
                        message.text
                    );
                    if auto_read {
                        if let Err(e) = handle.mark_read(&message.id).await {
                            debug!("Read receipt for {} not sent: {}", message.id, e);
                        }
                    }
                }
                ChatEvent::StateChanged { message_id, state } => {
                    info!(component = "events", "[{}] {} is now {}", user, message_id, state);
                }
                ChatEvent::Presence {
                    user_id, online, ..
                } => {
                    info!(
                        component = "presence",
                        "[{}] peer {} is {}",
                        user,
                        user_id,
                        if online { "online" } else { "offline" }
                    );
                }
                ChatEvent::Typing { user_id } => {
                    debug!(component = "events", "[{}] {} is typing", user, user_id);
                }
                ChatEvent::Connection { state, tier } => {
                    info!(
                        component = "transport",
                        "[{}] connection {:?} (tier {:?})",
                        user,
                        state,
                        tier
                    );
                }
            }
        }
    });
}

/// Best-effort offline signal before teardown
async fn announce_offline(participant: &Participant) {
    let envelope = Envelope::new(
        Uuid::new_v4().to_string(),
        EnvelopeKind::Presence,
        participant.user_id.clone(),
        &PresencePayload {
            user_id: participant.user_id.clone(),
            online: false,
        },
        chat_wire::now_millis(),
    );
    match envelope {
        Ok(envelope) => {
            if let Err(e) = participant.negotiator.send(envelope).await {
                debug!("Offline signal not sent: {}", e);
            }
        }
        Err(e) => warn!("Cannot build offline signal: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt()
        .event_format(ChatLogFormatter::new())
        .with_env_filter(filter)
        .init();

    let mut config = ChatConfig::load_from_file(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    info!(
        "Starting chat core: {} <-> {} on conversation {}",
        config.user_id, config.peer_id, config.conversation_id
    );

    let (local, local_out) = build_participant(&config, &config.user_id, &config.peer_id).await?;
    let (peer, peer_out) = build_participant(&config, &config.peer_id, &config.user_id).await?;

    // Cross-wire the two sides
    pump(local_out, &peer);
    pump(peer_out, &local);

    let registry = ConnectionRegistry::new();
    registry.register(config.conversation_id.clone(), local.negotiator.clone());

    local.negotiator.connect().await?;
    peer.negotiator.connect().await?;

    watch_events(&local, false);
    watch_events(&peer, true);

    // Demo traffic from the local side
    for i in 1..=args.demo_messages {
        let mut handle = local
            .handle
            .send_text(format!("demo message {}", i))
            .await?;
        let final_state = handle.wait_for(chat_wire::DeliveryState::Read).await;
        info!("Message {} finished as {}", handle.id, final_state);
    }

    info!("Demo traffic done; running until ctrl-c");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Teardown order: offline signal while the link is still up, then
    // cancel every timer-bearing component
    announce_offline(&local).await;
    announce_offline(&peer).await;
    local.tracker.mark_offline(&peer.user_id);
    peer.tracker.mark_offline(&local.user_id);
    local.negotiator.disconnect().await;
    peer.negotiator.disconnect().await;
    local.handle.shutdown();
    peer.handle.shutdown();

    info!("Shutdown complete");
    Ok(())
}
