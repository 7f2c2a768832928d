//! End-to-end scenarios wiring both participants in-process.
//!
//! Each side gets its own log, outbox, negotiator, and coordinator; the
//! two are cross-wired over channel transports the way the binary does it.

use chat_delivery::{
    ChatEvent, CoordinatorConfig, CoordinatorHandle, DeliveryCoordinator, EventBus, RetryPolicy,
};
use chat_store::{
    AppendRecord, ConversationId, ConversationLog, MemoryLog, Outbox, PersistenceGateway,
};
use chat_transport::channel::ChannelFactory;
use chat_transport::{TierKind, TransportNegotiator};
use chat_wire::{DeliveryState, EnvelopeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Side {
    handle: CoordinatorHandle,
    negotiator: Arc<TransportNegotiator>,
    factory: Arc<ChannelFactory>,
    gateway: PersistenceGateway,
    events: EventBus,
}

async fn build_side(user: &str, peer: &str, retry: RetryPolicy) -> (Side, mpsc::UnboundedReceiver<chat_wire::Envelope>) {
    let factory = Arc::new(ChannelFactory::new());
    let wire_rx = factory.allow(TierKind::DuplexSocket).await;
    let negotiator = Arc::new(TransportNegotiator::new(factory.clone()));
    negotiator.connect().await.unwrap();

    let log: Arc<dyn ConversationLog> = Arc::new(MemoryLog::new(100));
    // The delivery outbox and the gateway's write buffer are distinct
    // queues; sharing one would flush in-flight sends into the local log
    let outbox = Arc::new(Outbox::new());
    let (gateway, flush_rx) = PersistenceGateway::new(log, Arc::new(Outbox::new()));
    let events = EventBus::new();

    let (coordinator, handle) = DeliveryCoordinator::new(
        CoordinatorConfig {
            conversation: ConversationId::from("c1"),
            local_user: user.to_string(),
            peer_user: peer.to_string(),
            retry,
        },
        negotiator.clone(),
        gateway.clone(),
        outbox,
        events.clone(),
        flush_rx,
    );
    tokio::spawn(coordinator.run());

    (
        Side {
            handle,
            negotiator,
            factory,
            gateway,
            events,
        },
        wire_rx,
    )
}

fn pump(mut from: mpsc::UnboundedReceiver<chat_wire::Envelope>, to: &Side) {
    let inbound = to.handle.inbound_sender();
    tokio::spawn(async move {
        while let Some(envelope) = from.recv().await {
            if envelope.kind == EnvelopeKind::Presence {
                continue;
            }
            if inbound.send(envelope).is_err() {
                break;
            }
        }
    });
}

async fn linked_pair(retry: RetryPolicy) -> (Side, Side) {
    let (alice, alice_out) = build_side("alice", "bob", retry.clone()).await;
    let (bob, bob_out) = build_side("bob", "alice", retry).await;
    pump(alice_out, &bob);
    pump(bob_out, &alice);
    (alice, bob)
}

async fn take_offline(side: &Side) {
    side.factory
        .transport(TierKind::DuplexSocket)
        .await
        .unwrap()
        .set_healthy(false);
}

async fn bring_online(side: &Side) {
    side.factory
        .transport(TierKind::DuplexSocket)
        .await
        .unwrap()
        .set_healthy(true);
}

async fn next_received(
    events: &mut tokio::sync::broadcast::Receiver<ChatEvent>,
    within: Duration,
) -> Option<chat_wire::ChatMessage> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(ChatEvent::MessageReceived { message })) => return Some(message),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

// A message sent while every tier is down stays pending, is flushed
// exactly once when the link recovers, and renders after earlier
// persisted messages.
#[tokio::test(start_paused = true)]
async fn scenario_offline_send_flushes_once_after_recovery() {
    let (alice, bob) = linked_pair(RetryPolicy::new()).await;
    let conv = ConversationId::from("c1");

    // A message that landed on bob's side before the outage
    bob.gateway
        .append(
            &conv,
            AppendRecord {
                id: "p0".to_string(),
                sender_id: "alice".to_string(),
                text: "earlier".to_string(),
                reply_to: None,
                edited: false,
                client_created_at: chat_wire::now_millis(),
            },
        )
        .await
        .unwrap();

    take_offline(&alice).await;
    let mut bob_events = bob.events.subscribe();

    let mut handle = alice.handle.send_text("m1").await.unwrap();

    // Nothing arrives while the link is down
    assert!(next_received(&mut bob_events, Duration::from_millis(500))
        .await
        .is_none());
    assert!(handle.state().rank() < DeliveryState::Acked.rank());

    bring_online(&alice).await;

    // The retry schedule reconnects and flushes the outbox
    let received = next_received(&mut bob_events, Duration::from_secs(120))
        .await
        .expect("m1 should arrive after recovery");
    assert_eq!(received.text, "m1");

    assert_eq!(
        handle.wait_for(DeliveryState::Acked).await,
        DeliveryState::Acked
    );

    // Exactly once: no duplicate event even though retries may overlap
    assert!(next_received(&mut bob_events, Duration::from_secs(30))
        .await
        .is_none());

    // Ordering: the recovered message renders after the earlier one
    let log = bob.gateway.read_since(&conv, 0).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].id, "p0");
    assert_eq!(log[1].text, "m1");
    assert!(log[1].server_created_at > log[0].server_created_at);
}

// A burst sent while offline arrives in submission order with strictly
// increasing canonical timestamps.
#[tokio::test(start_paused = true)]
async fn scenario_offline_burst_keeps_submission_order() {
    let (alice, bob) = linked_pair(RetryPolicy::new()).await;
    let conv = ConversationId::from("c1");

    take_offline(&alice).await;

    let mut handles = Vec::new();
    for text in ["m1", "m2", "m3"] {
        handles.push(alice.handle.send_text(text).await.unwrap());
    }

    bring_online(&alice).await;

    for handle in &mut handles {
        assert_eq!(
            handle.wait_for(DeliveryState::Acked).await,
            DeliveryState::Acked
        );
    }

    let log = bob.gateway.read_since(&conv, 0).await.unwrap();
    let texts: Vec<&str> = log.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["m1", "m2", "m3"]);
    for pair in log.windows(2) {
        assert!(pair[1].server_created_at > pair[0].server_created_at);
    }
}

// Live round trip: states advance through sent, acked, delivered, read,
// and both logs converge on one copy of the message.
#[tokio::test]
async fn live_message_reaches_read_and_persists_once() {
    let (alice, bob) = linked_pair(RetryPolicy::new()).await;
    let conv = ConversationId::from("c1");

    let mut bob_events = bob.events.subscribe();
    let mut handle = alice.handle.send_text("hello bob").await.unwrap();

    let received = next_received(&mut bob_events, Duration::from_secs(5))
        .await
        .expect("bob receives the message");
    assert_eq!(received.id, handle.id);

    assert_eq!(
        handle.wait_for(DeliveryState::Delivered).await,
        DeliveryState::Delivered
    );

    bob.handle.mark_read(&received.id).await.unwrap();
    assert_eq!(
        handle.wait_for(DeliveryState::Read).await,
        DeliveryState::Read
    );

    let log = bob.gateway.read_since(&conv, 0).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id, handle.id);
}

// Replays across the link produce one persisted copy and one event.
#[tokio::test]
async fn replayed_message_is_delivered_once() {
    let (alice, bob) = linked_pair(RetryPolicy::new()).await;
    let conv = ConversationId::from("c1");
    let mut bob_events = bob.events.subscribe();

    let envelope = chat_wire::Envelope::new(
        "dup-1",
        EnvelopeKind::Message,
        "alice",
        &chat_wire::MessagePayload {
            text: "once".to_string(),
            reply_to: None,
            edited: false,
        },
        chat_wire::now_millis(),
    )
    .unwrap();

    let inbound = bob.handle.inbound_sender();
    inbound.send(envelope.clone()).unwrap();
    inbound.send(envelope.clone()).unwrap();
    inbound.send(envelope).unwrap();

    let first = next_received(&mut bob_events, Duration::from_secs(5))
        .await
        .expect("first copy delivered");
    assert_eq!(first.id, "dup-1");

    assert!(next_received(&mut bob_events, Duration::from_millis(500))
        .await
        .is_none());

    let log = bob.gateway.read_since(&conv, 0).await.unwrap();
    assert_eq!(log.len(), 1);

    // alice keeps her link; nothing odd arrived on her side
    drop(alice);
}
