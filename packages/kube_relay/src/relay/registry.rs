//! Connection registry
//!
//! Tracks every live dashboard connection: its outbound queue, the topics it
//! joined and the terminal session bound to it. Teardown of one connection
//! never touches another connection's entries.
//!
//! Lock order is registry first, then broker. Nothing called with the broker
//! lock held ever takes the registry lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

use super::broker::{Broker, ConnectionId, SubscribeOutcome};
use super::protocol::ServerMessage;
use super::terminal::{SessionId, TerminalSession};
use super::topic::WatchKey;
use crate::error::RelayError;

struct ConnectionEntry {
    outbound: mpsc::Sender<ServerMessage>,
    topics: HashSet<WatchKey>,
    sessions: HashSet<SessionId>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    sessions: HashMap<SessionId, Arc<TerminalSession>>,
}

/// What a connection left behind when it was unregistered
pub struct Departed {
    pub topics: Vec<WatchKey>,
    pub sessions: Vec<Arc<TerminalSession>>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id is already registered.
    pub async fn register(&self, conn: ConnectionId, outbound: mpsc::Sender<ServerMessage>) -> bool {
        let mut inner = self.inner.write().await;
        if inner.connections.contains_key(&conn) {
            return false;
        }
        inner.connections.insert(
            conn,
            ConnectionEntry {
                outbound,
                topics: HashSet::new(),
                sessions: HashSet::new(),
            },
        );
        true
    }

    pub async fn is_alive(&self, conn: &ConnectionId) -> bool {
        self.inner.read().await.connections.contains_key(conn)
    }

    pub async fn outbound(&self, conn: &ConnectionId) -> Option<mpsc::Sender<ServerMessage>> {
        let inner = self.inner.read().await;
        inner.connections.get(conn).map(|e| e.outbound.clone())
    }

    /// Join `key` on behalf of `conn`. Fails once the connection is gone, so a
    /// subscribe racing a disconnect cannot leave a stale subscriber behind.
    pub async fn subscribe(
        &self,
        conn: &ConnectionId,
        key: &WatchKey,
        broker: &Broker,
    ) -> Result<SubscribeOutcome, RelayError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .connections
            .get_mut(conn)
            .ok_or(RelayError::ConnectionClosed)?;
        let outcome = broker.subscribe(conn, key, entry.outbound.clone()).await;
        entry.topics.insert(key.clone());
        Ok(outcome)
    }

    pub async fn unsubscribe(
        &self,
        conn: &ConnectionId,
        key: &WatchKey,
        broker: &Broker,
    ) -> Result<bool, RelayError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .connections
            .get_mut(conn)
            .ok_or(RelayError::ConnectionClosed)?;
        entry.topics.remove(key);
        Ok(broker.unsubscribe(conn, key).await)
    }

    #[cfg(test)]
    pub async fn topics(&self, conn: &ConnectionId) -> Vec<WatchKey> {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(conn)
            .map(|e| e.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Bind `session` to `conn`, returning the sessions it replaces.
    pub async fn attach_session(
        &self,
        conn: &ConnectionId,
        session: Arc<TerminalSession>,
    ) -> Result<Vec<Arc<TerminalSession>>, RelayError> {
        let mut inner = self.inner.write().await;
        let RegistryInner {
            connections,
            sessions,
        } = &mut *inner;
        let entry = connections
            .get_mut(conn)
            .ok_or(RelayError::ConnectionClosed)?;
        let replaced = entry
            .sessions
            .drain()
            .filter_map(|id| sessions.remove(&id))
            .collect();
        entry.sessions.insert(session.id().to_string());
        sessions.insert(session.id().to_string(), session);
        Ok(replaced)
    }

    /// The session currently bound to `conn`, if any.
    pub async fn current_session(&self, conn: &ConnectionId) -> Option<Arc<TerminalSession>> {
        let inner = self.inner.read().await;
        let entry = inner.connections.get(conn)?;
        entry
            .sessions
            .iter()
            .find_map(|id| inner.sessions.get(id).cloned())
    }

    /// Forget a closed session. Returns false if it was already gone.
    pub async fn release_session(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.remove(id) else {
            return false;
        };
        if let Some(entry) = inner.connections.get_mut(session.conn_id()) {
            entry.sessions.remove(id);
        }
        true
    }

    /// Remove `conn` and hand back what it owned for teardown.
    pub async fn unregister(&self, conn: &ConnectionId) -> Option<Departed> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(conn)?;
        let sessions = entry
            .sessions
            .iter()
            .filter_map(|id| inner.sessions.remove(id))
            .collect();
        Some(Departed {
            topics: entry.topics.into_iter().collect(),
            sessions,
        })
    }

    pub async fn all_sessions(&self) -> Vec<Arc<TerminalSession>> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}
