//! Peer and connection registries.
//!
//! [`PeerRegistry`] holds the services found by an active search, in the
//! order they were first discovered. [`ConnectionRegistry`] holds the live
//! connections a communicator owns. Both are cheap to clone and safe to
//! share between tasks.

use crate::connection::Connection;
use chrono::{DateTime, Utc};
use communicate_types::{ConnectionState, PeerIdentity, ServiceDescriptor};
use std::sync::{Arc, RwLock};

/// A discovered service and when it was first seen.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub descriptor: ServiceDescriptor,
    pub discovered_at: DateTime<Utc>,
}

/// Discovered services, unique by `(name, port)`.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<Vec<DiscoveredPeer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery. Returns `false` if the peer was already known.
    pub fn add(&self, descriptor: ServiceDescriptor) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let identity = descriptor.identity();
        if peers.iter().any(|p| p.descriptor.identity() == identity) {
            return false;
        }
        peers.push(DiscoveredPeer {
            descriptor,
            discovered_at: Utc::now(),
        });
        true
    }

    /// Forget a peer by identity.
    pub fn remove(&self, descriptor: &ServiceDescriptor) -> Option<DiscoveredPeer> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let identity = descriptor.identity();
        let index = peers
            .iter()
            .position(|p| p.descriptor.identity() == identity)?;
        Some(peers.remove(index))
    }

    /// Descriptors ordered by first discovery.
    pub fn snapshot(&self) -> Vec<ServiceDescriptor> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.iter().map(|p| p.descriptor.clone()).collect()
    }

    pub fn entries(&self) -> Vec<DiscoveredPeer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.clone()
    }

    pub fn clear(&self) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.clear();
    }

    pub fn len(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connections owned by a communicator.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<Vec<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection. Returns `false` if a live connection to the same
    /// peer is already tracked.
    pub fn add(&self, connection: Connection) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if connections
            .iter()
            .any(|c| !c.state().is_terminal() && *c == connection)
        {
            return false;
        }
        connections.push(connection);
        true
    }

    /// The live connection for `identity`, if any.
    pub fn find(&self, identity: &PeerIdentity) -> Option<Connection> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections
            .iter()
            .find(|c| !c.state().is_terminal() && c.identity().as_ref() == Some(identity))
            .cloned()
    }

    /// Stop tracking a connection handle.
    pub fn remove(&self, connection: &Connection) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let before = connections.len();
        connections.retain(|c| c.id() != connection.id());
        connections.len() != before
    }

    pub fn all(&self) -> Vec<Connection> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.clone()
    }

    /// Connections currently in `Connected`.
    pub fn connected(&self) -> Vec<Connection> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Connected)
            .cloned()
            .collect()
    }

    /// Remove and return every tracked connection.
    pub fn drain(&self) -> Vec<Connection> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *connections)
    }

    pub fn len(&self) -> usize {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionContext;
    use communicate_types::CommunicatorConfig;

    fn service(name: &str, port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new(name, "communicate", "local", port)
    }

    fn context() -> ConnectionContext {
        ConnectionContext::from_config(&CommunicatorConfig::default(), 0)
    }

    #[test]
    fn test_peers_unique_and_ordered() {
        let registry = PeerRegistry::new();
        assert!(registry.add(service("B", 2)));
        assert!(registry.add(service("A", 1)));
        assert!(!registry.add(service("B", 2)));
        // Same name on another port is a distinct peer.
        assert!(registry.add(service("B", 3)));

        let names: Vec<(String, u16)> = registry
            .snapshot()
            .iter()
            .map(|d| (d.name().to_string(), d.port()))
            .collect();
        assert_eq!(
            names,
            vec![("B".into(), 2), ("A".into(), 1), ("B".into(), 3)]
        );
    }

    #[test]
    fn test_peer_remove() {
        let registry = PeerRegistry::new();
        registry.add(service("A", 1));
        registry.add(service("B", 2));
        assert!(registry.remove(&service("A", 1)).is_some());
        assert_eq!(registry.snapshot(), vec![service("B", 2)]);
        assert!(registry.remove(&service("B", 2)).is_some());
        assert!(registry.remove(&service("A", 1)).is_some());
        assert!(registry.remove(&service("A", 1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connections_dedupe_by_identity() {
        let registry = ConnectionRegistry::new();
        let first = Connection::outbound(service("Test", 12345), context());
        let twin = Connection::outbound(service("Test", 12345), context());
        let other = Connection::outbound(service("Other", 12345), context());

        assert!(registry.add(first.clone()));
        assert!(!registry.add(twin));
        assert!(registry.add(other));
        assert_eq!(registry.len(), 2);

        let found = registry.find(&PeerIdentity::new("Test", 12345)).unwrap();
        assert_eq!(found.id(), first.id());
    }

    #[test]
    fn test_closed_connections_are_replaceable() {
        let registry = ConnectionRegistry::new();
        let first = Connection::outbound(service("Test", 12345), context());
        registry.add(first.clone());
        first.close();

        assert!(registry.find(&first.identity().unwrap()).is_none());
        assert!(registry.add(Connection::outbound(service("Test", 12345), context())));
        assert!(registry.remove(&first));
        assert_eq!(registry.len(), 1);
        assert!(registry.connected().is_empty());
    }
}
