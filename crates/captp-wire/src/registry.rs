//! Connection registry: tracks the sessions a vat has open.
//!
//! The [`ConnectionRegistry`] is a thread-safe map from [`ConnectionId`] to
//! what is known about each connection. Tracked sessions are marked closed as
//! soon as their [`Session::closed`] future resolves.

use crate::link::ConnectionId;
use crate::session::Session;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Lifecycle state of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Closed, kept for inspection until removed.
    Closed,
}

/// An entry representing a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    /// Name the peer is known by locally.
    pub peer: String,
    pub state: ConnectionState,
    /// When the connection was registered.
    pub connected_at: DateTime<Utc>,
    pub closed_reason: Option<String>,
    pub session: Session,
}

/// Thread-safe registry of connections.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record `session` as an open connection to `peer`.
    pub fn register(&self, peer: &str, session: Session) -> ConnectionId {
        let id = session.id();
        let entry = ConnectionEntry {
            id,
            peer: peer.to_string(),
            state: ConnectionState::Open,
            connected_at: Utc::now(),
            closed_reason: None,
            session,
        };
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.insert(id, entry);
        info!(conn = %id, peer, "CapTP: connection registered");
        id
    }

    /// Register `session` and mark it closed once it finishes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn track(&self, peer: &str, session: Session) -> ConnectionId {
        let id = self.register(peer, session.clone());
        let registry = self.clone();
        tokio::spawn(async move {
            let report = session.closed().await;
            registry.mark_closed(id, &report.reason);
        });
        id
    }

    pub fn mark_closed(&self, id: ConnectionId, reason: &str) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = connections.get_mut(&id) {
            entry.state = ConnectionState::Closed;
            entry.closed_reason = Some(reason.to_string());
        }
    }

    /// Forget a connection entirely.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.remove(&id)
    }

    /// Snapshot of one entry.
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.get(&id).cloned()
    }

    /// The session of an open connection.
    pub fn session(&self, id: ConnectionId) -> Option<Session> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections
            .get(&id)
            .filter(|entry| entry.state == ConnectionState::Open)
            .map(|entry| entry.session.clone())
    }

    /// Open connections, oldest first.
    pub fn open_connections(&self) -> Vec<ConnectionEntry> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut open: Vec<_> = connections
            .values()
            .filter(|c| c.state == ConnectionState::Open)
            .cloned()
            .collect();
        open.sort_by_key(|c| c.id);
        open
    }

    pub fn all_connections(&self) -> Vec<ConnectionEntry> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = connections.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub fn open_count(&self) -> usize {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections
            .values()
            .filter(|c| c.state == ConnectionState::Open)
            .count()
    }

    /// Total number of entries, including closed ones.
    pub fn total_count(&self) -> usize {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.len()
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
    use crate::transport::memory_channel;
    use crate::value::Value;
    use captp_types::CapTpConfig;

    fn pair() -> (Session, Session) {
        let ((a_sink, a_source), (b_sink, b_source)) = memory_channel();
        let a = Session::start(CapTpConfig::named("a"), Value::Null, a_sink, a_source);
        let b = Session::start(CapTpConfig::named("b"), Value::Null, b_sink, b_source);
        (a, b)
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ConnectionRegistry::new();
        let (a, _b) = pair();
        let id = registry.register("bob", a);

        let entry = registry.get(id).unwrap();
        assert_eq!(entry.peer, "bob");
        assert_eq!(entry.state, ConnectionState::Open);
        assert!(registry.session(id).is_some());
        assert_eq!(registry.open_count(), 1);
    }

    #[tokio::test]
    async fn test_mark_closed_keeps_entry() {
        let registry = ConnectionRegistry::new();
        let (a, b) = pair();
        let first = registry.register("bob", a);
        let second = registry.register("alice", b);
        assert_eq!(registry.open_connections().len(), 2);

        registry.mark_closed(first, "gone");
        assert_eq!(registry.open_count(), 1);
        assert_eq!(registry.total_count(), 2);
        assert!(registry.session(first).is_none());
        assert_eq!(registry.get(first).unwrap().closed_reason.as_deref(), Some("gone"));
        assert_eq!(registry.open_connections()[0].id, second);

        assert!(registry.remove(first).is_some());
        assert_eq!(registry.all_connections().len(), 1);
    }

    #[tokio::test]
    async fn test_tracked_session_is_marked_closed() {
        let registry = ConnectionRegistry::new();
        let (a, b) = pair();
        let id = registry.track("bob", a.clone());
        a.close("finished");
        b.closed().await;
        a.closed().await;

        for _ in 0..100 {
            if registry.open_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.state, ConnectionState::Closed);
        assert_eq!(entry.closed_reason.as_deref(), Some("finished"));
    }
}
