//! Shared state handed to every session.

use std::sync::Arc;

use groupcast_broker::Broker;

use crate::bridge::PubSubBridge;
use crate::broadcaster::GroupBroadcaster;
use crate::config::{ServerConfig, SessionConfig};
use crate::registry::ConnectionRegistry;

/// Group core plus per-session settings.
pub struct GatewayContext {
    /// Live connections and memberships.
    pub registry: Arc<ConnectionRegistry>,
    /// Sequenced publishing.
    pub broadcaster: Arc<GroupBroadcaster>,
    /// Per-session behavior.
    pub session: SessionConfig,
}

impl GatewayContext {
    /// Wire the bridge, registry and broadcaster over `broker`.
    pub fn new(broker: Arc<dyn Broker>, config: &ServerConfig) -> Self {
        let bridge = Arc::new(PubSubBridge::new(broker, config.bridge.clone()));
        let registry = Arc::new(ConnectionRegistry::new(bridge));
        let broadcaster = Arc::new(GroupBroadcaster::new(Arc::clone(&registry)));
        Self {
            registry,
            broadcaster,
            session: config.session.clone(),
        }
    }

    /// The pub/sub bridge.
    pub fn bridge(&self) -> &Arc<PubSubBridge> {
        self.registry.bridge()
    }
}
