//! Connection state management

use dashmap::DashMap;
use rpcbus_client::Endpoint;
use std::sync::Arc;
use uuid::Uuid;

/// Tracks every attached downstream endpoint of a broker scope
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<DashMap<Uuid, Arc<Endpoint>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Register a new connection
    pub fn add(&self, endpoint: Arc<Endpoint>) {
        self.connections.insert(endpoint.id(), endpoint);
    }

    /// Remove a connection
    pub fn remove(&self, id: Uuid) -> Option<Arc<Endpoint>> {
        self.connections.remove(&id).map(|(_, endpoint)| endpoint)
    }

    /// Get a connection by ID
    pub fn get(&self, id: Uuid) -> Option<Arc<Endpoint>> {
        self.connections.get(&id).map(|r| r.clone())
    }

    /// Get total connection count
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Get connections by the label their peer announced
    pub fn find_by_label(&self, label: &str) -> Vec<Arc<Endpoint>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().label() == label)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of every connection
    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
