//! Transport tier negotiation.
//!
//! The negotiator walks the tier ranking, establishing the best tier that
//! connects within the deadline. The active link degrades to the next tier
//! when it fails mid-send, and a background probe looks for a better tier
//! every [`PROBE_INTERVAL`](crate::PROBE_INTERVAL); an upgrade only takes
//! effect after the candidate stays healthy through the stability window.
//! Outbound envelopes submitted while a switch is in progress are buffered
//! and flushed in order on the new link.

use crate::error::TransportError;
use crate::tier::TierKind;
use crate::{Transport, TransportFactory, CONNECT_TIMEOUT, PROBE_INTERVAL, STABILITY_WINDOW};
use chat_wire::Envelope;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection lifecycle state, published through a watch channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link established
    Disconnected,
    /// A negotiation is in progress
    Connecting,
    /// Link established on the given tier
    Connected(TierKind),
    /// Tearing down one tier and bringing up another
    Switching,
}

/// Events emitted as the link changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A link was established
    Connected {
        /// Tier the link runs on
        tier: TierKind,
    },
    /// The link moved to a worse tier after a failure
    Degraded {
        /// Tier that failed
        from: TierKind,
        /// Tier now in use
        to: TierKind,
    },
    /// The link moved to a better tier after a stable probe
    Upgraded {
        /// Tier previously in use
        from: TierKind,
        /// Tier now in use
        to: TierKind,
    },
    /// All tiers exhausted; the link is down
    Disconnected,
}

/// The active link: the receive transport, and the send path which differs
/// only when the negotiated tier is receive-only
struct ActiveLink {
    transport: Arc<dyn Transport>,
    send_path: Arc<dyn Transport>,
}

impl ActiveLink {
    fn tier(&self) -> TierKind {
        self.transport.tier()
    }
}

struct NegotiatorInner {
    factory: Arc<dyn TransportFactory>,
    active: RwLock<Option<ActiveLink>>,
    /// Held across a full negotiation so concurrent triggers coalesce
    negotiation: Mutex<()>,
    /// Envelopes submitted while no link is usable, flushed in order
    switch_buffer: Mutex<VecDeque<Envelope>>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<TransportEvent>,
    connect_timeout: Duration,
}

/// Negotiates and maintains the transport link for one conversation
pub struct TransportNegotiator {
    inner: Arc<NegotiatorInner>,
    state_rx: watch::Receiver<ConnectionState>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportNegotiator {
    /// Create a negotiator over `factory` with the default connect deadline
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_connect_timeout(factory, CONNECT_TIMEOUT)
    }

    /// Create a negotiator with a custom connect deadline (tests)
    pub fn with_connect_timeout(factory: Arc<dyn TransportFactory>, connect_timeout: Duration) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(NegotiatorInner {
                factory,
                active: RwLock::new(None),
                negotiation: Mutex::new(()),
                switch_buffer: Mutex::new(VecDeque::new()),
                state_tx,
                event_tx,
                connect_timeout,
            }),
            state_rx,
            probe_task: Mutex::new(None),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch the connection state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to link events
    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.event_tx.subscribe()
    }

    /// The tier currently in use, if connected
    pub async fn active_tier(&self) -> Option<TierKind> {
        self.inner.active.read().await.as_ref().map(|l| l.tier())
    }

    /// Establish the best available tier, walking the ranking from the
    /// top. Concurrent calls coalesce onto one negotiation.
    pub async fn connect(&self) -> Result<TierKind, TransportError> {
        let _guard = self.inner.negotiation.lock().await;

        // Another caller may have finished the negotiation while this one
        // waited for the guard
        if let Some(link) = self.inner.active.read().await.as_ref() {
            if link.transport.is_healthy() {
                return Ok(link.tier());
            }
        }

        let _ = self.inner.state_tx.send(ConnectionState::Connecting);
        let result = Self::negotiate_from(&self.inner, &TierKind::ranked()).await;

        match &result {
            Ok(tier) => {
                let _ = self.inner.state_tx.send(ConnectionState::Connected(*tier));
                let _ = self.inner.event_tx.send(TransportEvent::Connected { tier: *tier });
                Self::flush_buffer(&self.inner).await;
                self.spawn_probe().await;
            }
            Err(_) => {
                let _ = self.inner.state_tx.send(ConnectionState::Disconnected);
                let _ = self.inner.event_tx.send(TransportEvent::Disconnected);
            }
        }
        result
    }

    /// Send an envelope over the active link. A mid-send failure degrades
    /// to the next tier and the envelope is retried there; if every tier
    /// below fails the envelope is buffered and the error surfaced.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        // Buffer instead of racing a switch in progress
        if self.state() == ConnectionState::Switching {
            self.inner.switch_buffer.lock().await.push_back(envelope);
            return Ok(());
        }

        let (send_path, tier) = {
            let active = self.inner.active.read().await;
            match active.as_ref() {
                Some(link) => (link.send_path.clone(), link.tier()),
                None => return Err(TransportError::NotConnected),
            }
        };

        match send_path.send(envelope.clone()).await {
            Ok(()) => Ok(()),
            // Auth expiry is not a link problem; degrading would not help
            Err(TransportError::AuthExpired) => Err(TransportError::AuthExpired),
            Err(e) => {
                warn!("Send failed on {}: {}; degrading", tier, e);
                self.degrade_from(tier).await?;
                // One retry on the replacement link
                let active = self.inner.active.read().await;
                match active.as_ref() {
                    Some(link) => link.send_path.send(envelope).await,
                    None => Err(TransportError::NoTierAvailable),
                }
            }
        }
    }

    /// Tear down the link: abort the probe task, close the active tier,
    /// and publish the disconnect before returning
    pub async fn disconnect(&self) {
        if let Some(task) = self.probe_task.lock().await.take() {
            task.abort();
        }
        let mut active = self.inner.active.write().await;
        if let Some(link) = active.take() {
            link.transport.close().await;
            if !Arc::ptr_eq(&link.transport, &link.send_path) {
                link.send_path.close().await;
            }
        }
        let _ = self.inner.state_tx.send(ConnectionState::Disconnected);
        let _ = self.inner.event_tx.send(TransportEvent::Disconnected);
    }

    async fn degrade_from(&self, failed: TierKind) -> Result<TierKind, TransportError> {
        let _guard = self.inner.negotiation.lock().await;

        // Someone else may already have replaced the failed link
        if let Some(link) = self.inner.active.read().await.as_ref() {
            if link.tier() != failed && link.transport.is_healthy() {
                return Ok(link.tier());
            }
        }

        let _ = self.inner.state_tx.send(ConnectionState::Switching);

        let lower: Vec<TierKind> = TierKind::ranked()
            .into_iter()
            .filter(|t| t.rank() > failed.rank())
            .collect();
        let result = Self::negotiate_from(&self.inner, &lower).await;

        match &result {
            Ok(tier) => {
                info!("Degraded from {} to {}", failed, tier);
                let _ = self.inner.state_tx.send(ConnectionState::Connected(*tier));
                let _ = self.inner.event_tx.send(TransportEvent::Degraded {
                    from: failed,
                    to: *tier,
                });
                Self::flush_buffer(&self.inner).await;
            }
            Err(_) => {
                warn!("No tier below {} available; link down", failed);
                *self.inner.active.write().await = None;
                let _ = self.inner.state_tx.send(ConnectionState::Disconnected);
                let _ = self.inner.event_tx.send(TransportEvent::Disconnected);
            }
        }
        result
    }

    /// Try each tier in `candidates` order; install the first that
    /// connects within the deadline
    async fn negotiate_from(
        inner: &Arc<NegotiatorInner>,
        candidates: &[TierKind],
    ) -> Result<TierKind, TransportError> {
        for &tier in candidates {
            match Self::connect_tier(inner, tier).await {
                Ok(link) => {
                    debug!("Negotiated tier {}", tier);
                    *inner.active.write().await = Some(link);
                    return Ok(tier);
                }
                Err(e) => {
                    debug!("Tier {} unavailable: {}", tier, e);
                }
            }
        }
        Err(TransportError::NoTierAvailable)
    }

    async fn connect_tier(
        inner: &Arc<NegotiatorInner>,
        tier: TierKind,
    ) -> Result<ActiveLink, TransportError> {
        let transport = tokio::time::timeout(inner.connect_timeout, inner.factory.connect(tier))
            .await
            .map_err(|_| TransportError::Timeout(tier))??;

        // A receive-only tier needs a polling companion for the send
        // direction
        let send_path = if tier.is_receive_only() {
            tokio::time::timeout(
                inner.connect_timeout,
                inner.factory.connect(TierKind::Polling),
            )
            .await
            .map_err(|_| TransportError::Timeout(TierKind::Polling))??
        } else {
            transport.clone()
        };

        Ok(ActiveLink {
            transport,
            send_path,
        })
    }

    async fn flush_buffer(inner: &Arc<NegotiatorInner>) {
        let buffered: Vec<Envelope> = inner.switch_buffer.lock().await.drain(..).collect();
        if buffered.is_empty() {
            return;
        }
        debug!("Flushing {} buffered envelopes", buffered.len());
        let active = inner.active.read().await;
        if let Some(link) = active.as_ref() {
            for envelope in buffered {
                if let Err(e) = link.send_path.send(envelope).await {
                    warn!("Buffered envelope lost on flush: {}", e);
                }
            }
        }
    }

    async fn spawn_probe(&self) {
        let mut guard = self.probe_task.lock().await;
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *guard = Some(tokio::spawn(async move {
            Self::probe_loop(inner).await;
        }));
    }

    /// Background upgrade probe: every interval, if a strictly better tier
    /// connects, hold it through the stability window before switching
    async fn probe_loop(inner: Arc<NegotiatorInner>) {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let current = match inner.active.read().await.as_ref() {
                Some(link) if link.transport.is_healthy() => link.tier(),
                _ => continue,
            };

            for candidate in current.better_tiers() {
                let link = match Self::connect_tier(&inner, candidate).await {
                    Ok(link) => link,
                    Err(_) => continue,
                };

                tokio::time::sleep(STABILITY_WINDOW).await;
                if !link.transport.is_healthy() {
                    debug!("Probe candidate {} failed the stability window", candidate);
                    link.transport.close().await;
                    continue;
                }

                // Re-check: the active link may have changed while the
                // candidate soaked
                let _guard = inner.negotiation.lock().await;
                let still_current = inner
                    .active
                    .read()
                    .await
                    .as_ref()
                    .map(|l| l.tier() == current)
                    .unwrap_or(false);
                if !still_current {
                    link.transport.close().await;
                    break;
                }

                let _ = inner.state_tx.send(ConnectionState::Switching);
                let old = inner.active.write().await.replace(link);
                if let Some(old) = old {
                    old.transport.close().await;
                }
                let _ = inner.state_tx.send(ConnectionState::Connected(candidate));
                let _ = inner.event_tx.send(TransportEvent::Upgraded {
                    from: current,
                    to: candidate,
                });
                info!("Upgraded from {} to {}", current, candidate);
                Self::flush_buffer(&inner).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelFactory;
    use chat_wire::{EnvelopeKind, MessagePayload};

    fn envelope(id: &str) -> Envelope {
        Envelope::new(
            id,
            EnvelopeKind::Message,
            "alice",
            &MessagePayload {
                text: "hi".to_string(),
                reply_to: None,
                edited: false,
            },
            chat_wire::now_millis(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_connects_best_available_tier() {
        let factory = Arc::new(ChannelFactory::new());
        let _rx = factory.allow(TierKind::DuplexSocket).await;
        let _poll_rx = factory.allow(TierKind::Polling).await;

        let negotiator = TransportNegotiator::new(factory);
        let tier = negotiator.connect().await.unwrap();
        assert_eq!(tier, TierKind::DuplexSocket);
        assert_eq!(negotiator.state(), ConnectionState::Connected(TierKind::DuplexSocket));
    }

    #[tokio::test]
    async fn test_server_push_gets_polling_send_path() {
        let factory = Arc::new(ChannelFactory::new());
        let _push_rx = factory.allow(TierKind::ServerPush).await;
        let mut poll_rx = factory.allow(TierKind::Polling).await;

        let negotiator = TransportNegotiator::new(factory);
        let tier = negotiator.connect().await.unwrap();
        assert_eq!(tier, TierKind::ServerPush);

        // Outbound traffic flows over the polling companion
        negotiator.send(envelope("m1")).await.unwrap();
        let sent = poll_rx.recv().await.unwrap();
        assert_eq!(sent.id, "m1");
    }

    #[tokio::test]
    async fn test_no_tier_available() {
        let factory = Arc::new(ChannelFactory::new());
        let negotiator = TransportNegotiator::new(factory);
        assert!(matches!(
            negotiator.connect().await,
            Err(TransportError::NoTierAvailable)
        ));
        assert_eq!(negotiator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_degrade_on_send_failure() {
        let factory = Arc::new(ChannelFactory::new());
        let _duplex_rx = factory.allow(TierKind::DuplexSocket).await;
        let mut poll_rx = factory.allow(TierKind::Polling).await;

        let negotiator = TransportNegotiator::new(factory.clone());
        let mut events = negotiator.subscribe_events();
        assert_eq!(negotiator.connect().await.unwrap(), TierKind::DuplexSocket);
        let _ = events.recv().await;

        // Kill the duplex link; the send should retry over polling
        factory
            .transport(TierKind::DuplexSocket)
            .await
            .unwrap()
            .set_healthy(false);
        negotiator.send(envelope("m1")).await.unwrap();

        let sent = poll_rx.recv().await.unwrap();
        assert_eq!(sent.id, "m1");
        assert_eq!(negotiator.active_tier().await, Some(TierKind::Polling));
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Degraded {
                from: TierKind::DuplexSocket,
                to: TierKind::Polling,
            }
        );
    }

    #[tokio::test]
    async fn test_all_tiers_exhausted_surfaces_error() {
        let factory = Arc::new(ChannelFactory::new());
        let _poll_rx = factory.allow(TierKind::Polling).await;

        let negotiator = TransportNegotiator::new(factory.clone());
        assert_eq!(negotiator.connect().await.unwrap(), TierKind::Polling);

        factory
            .transport(TierKind::Polling)
            .await
            .unwrap()
            .set_healthy(false);
        factory.deny(TierKind::Polling).await;

        assert!(negotiator.send(envelope("m1")).await.is_err());
        assert_eq!(negotiator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_upgrades_after_stability_window() {
        let factory = Arc::new(ChannelFactory::new());
        let _poll_rx = factory.allow(TierKind::Polling).await;

        let negotiator = TransportNegotiator::new(factory.clone());
        let mut events = negotiator.subscribe_events();
        assert_eq!(negotiator.connect().await.unwrap(), TierKind::Polling);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Connected { tier: TierKind::Polling }
        );

        // A better tier comes up; the next probe should find it and soak
        // it through the stability window before switching
        let _duplex_rx = factory.allow(TierKind::DuplexSocket).await;

        tokio::time::advance(PROBE_INTERVAL + STABILITY_WINDOW + Duration::from_secs(1)).await;

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            TransportEvent::Upgraded {
                from: TierKind::Polling,
                to: TierKind::DuplexSocket,
            }
        );
        assert_eq!(negotiator.active_tier().await, Some(TierKind::DuplexSocket));
    }
}
