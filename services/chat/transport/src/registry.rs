//! Connection registry.
//!
//! Owned registry of per-conversation negotiators, passed explicitly to
//! the components that need connection lookups. One instance per process;
//! nothing here is global state.

use crate::negotiator::{ConnectionState, TransportNegotiator};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of active conversation links keyed by conversation id
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<TransportNegotiator>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register the negotiator for a conversation, replacing any previous
    /// registration
    pub fn register(&self, conversation_id: impl Into<String>, negotiator: Arc<TransportNegotiator>) {
        let id = conversation_id.into();
        debug!("Registering connection for {}", id);
        self.connections.insert(id, negotiator);
    }

    /// Remove a conversation's negotiator, returning it if present
    pub fn unregister(&self, conversation_id: &str) -> Option<Arc<TransportNegotiator>> {
        debug!("Unregistering connection for {}", conversation_id);
        self.connections.remove(conversation_id).map(|(_, n)| n)
    }

    /// Look up the negotiator for a conversation
    pub fn get(&self, conversation_id: &str) -> Option<Arc<TransportNegotiator>> {
        self.connections.get(conversation_id).map(|e| e.clone())
    }

    /// Snapshot of all registered conversations and their states
    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        self.connections
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }

    /// Number of registered conversations
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelFactory;
    use crate::tier::TierKind;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let factory = Arc::new(ChannelFactory::new());
        let _rx = factory.allow(TierKind::Polling).await;

        let negotiator = Arc::new(TransportNegotiator::new(factory));
        negotiator.connect().await.unwrap();
        registry.register("c1", negotiator);

        assert_eq!(registry.len(), 1);
        let found = registry.get("c1").unwrap();
        assert_eq!(found.state(), ConnectionState::Connected(TierKind::Polling));

        let states = registry.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].0, "c1");

        assert!(registry.unregister("c1").is_some());
        assert!(registry.get("c1").is_none());
    }
}
