//! In-process channel transport.
//!
//! Backs the loopback/demo wiring and every negotiation test: a transport
//! whose outbound path is an mpsc sender, with health toggled externally
//! to simulate link failures.

use crate::error::TransportError;
use crate::tier::TierKind;
use crate::{Transport, TransportFactory};
use async_trait::async_trait;
use chat_wire::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Transport over an in-process channel
pub struct ChannelTransport {
    tier: TierKind,
    tx: mpsc::UnboundedSender<Envelope>,
    healthy: Arc<AtomicBool>,
}

impl ChannelTransport {
    /// Create a transport on `tier` together with the receiving end of
    /// its outbound channel
    pub fn pair(tier: TierKind) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            tier,
            tx,
            healthy: Arc::new(AtomicBool::new(true)),
        });
        (transport, rx)
    }

    /// Handle for flipping transport health from outside
    pub fn health_handle(&self) -> Arc<AtomicBool> {
        self.healthy.clone()
    }

    /// Mark the transport healthy or failed
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn tier(&self) -> TierKind {
        self.tier
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.tier.is_receive_only() {
            return Err(TransportError::ReceiveOnly(self.tier));
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(envelope)
            .map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        debug!("Channel transport on {} closed", self.tier);
    }
}

/// Factory over a fixed set of channel transports, one per permitted tier.
///
/// Tiers absent from the map fail to connect. Used by tests and the
/// loopback demo to script which tiers are reachable.
pub struct ChannelFactory {
    transports: tokio::sync::Mutex<HashMap<TierKind, Arc<ChannelTransport>>>,
}

impl ChannelFactory {
    /// Create an empty factory; no tier connects until one is allowed
    pub fn new() -> Self {
        Self {
            transports: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Permit `tier`, returning the receiver for traffic sent through it
    pub async fn allow(&self, tier: TierKind) -> mpsc::UnboundedReceiver<Envelope> {
        let (transport, rx) = ChannelTransport::pair(tier);
        self.transports.lock().await.insert(tier, transport);
        rx
    }

    /// Remove `tier` so future connect attempts fail
    pub async fn deny(&self, tier: TierKind) {
        self.transports.lock().await.remove(&tier);
    }

    /// The live transport for `tier`, if connected before
    pub async fn transport(&self, tier: TierKind) -> Option<Arc<ChannelTransport>> {
        self.transports.lock().await.get(&tier).cloned()
    }
}

impl Default for ChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for ChannelFactory {
    async fn connect(&self, tier: TierKind) -> Result<Arc<dyn Transport>, TransportError> {
        let transports = self.transports.lock().await;
        match transports.get(&tier) {
            Some(t) if t.is_healthy() => Ok(t.clone() as Arc<dyn Transport>),
            Some(_) => Err(TransportError::ConnectFailed {
                tier,
                reason: "transport unhealthy".to_string(),
            }),
            None => Err(TransportError::ConnectFailed {
                tier,
                reason: "tier not reachable".to_string(),
            }),
        }
    }
}
