//! Process-wide map of live sessions.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::session::{Connection, SessionId};

/// Thread-safe registry of sessions keyed by their UI-chosen id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Connection>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `id`, creating it with `factory` on a miss.
    ///
    /// The flag is `true` only for the caller whose connection was inserted.
    /// `factory` runs outside the lock; if another caller inserted first, the
    /// freshly built connection is dropped unopened.
    pub async fn get_or_create<F>(&self, id: SessionId, factory: F) -> (Arc<Connection>, bool)
    where
        F: FnOnce() -> Connection,
    {
        if let Some(existing) = self.sessions.read().await.get(&id) {
            return (Arc::clone(existing), false);
        }

        let candidate = Arc::new(factory());
        let mut sessions = self.sessions.write().await;
        match sessions.entry(id) {
            Entry::Occupied(entry) => {
                debug!(session_id = %id, "Lost creation race, discarding new session");
                (Arc::clone(entry.get()), false)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&candidate));
                info!(session_id = %id, mode = %candidate.mode(), workload = %candidate.target(), "Session registered");
                (candidate, true)
            }
        }
    }

    pub async fn try_get(&self, id: SessionId) -> Option<Arc<Connection>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Remove and close a session. Returns whether it existed.
    pub async fn close(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id);
        let Some(connection) = removed else {
            debug!(session_id = %id, "Close for unknown session ignored");
            return false;
        };
        connection.close().await;
        info!(session_id = %id, "Session unregistered");
        true
    }

    /// Close every session. Used at shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        let count = drained.len();
        for (_, connection) in drained {
            connection.close().await;
        }
        if count > 0 {
            info!(count, "All sessions closed");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
