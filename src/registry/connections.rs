//! Connection registry.
//!
//! Maps connection ids to live [`Connection`] handles. Entries are added
//! when the transport accepts a socket and removed when it closes; the
//! registry holds non-owning-in-spirit `Arc` references and never closes
//! connections itself (except on server shutdown, which walks a snapshot).

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::identifiers::ConnectionId;
use crate::server::connection::Connection;

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Registry of currently open connections, keyed by id.
///
/// Safe under concurrent accept/close events; every operation takes the
/// registry lock for the duration of the map mutation only.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<FxHashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a connection and returns its id.
    ///
    /// Ids come from a process-wide monotonic counter, so the returned id
    /// never collides with the id of any still-live connection.
    pub fn assign(&self, connection: Arc<Connection>) -> ConnectionId {
        let id = connection.id();
        self.connections.write().insert(id, connection);
        id
    }

    /// Removes a connection by id. Idempotent: removing an id that is
    /// already absent is a no-op.
    pub fn free(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().remove(&id)
    }

    /// Looks up a connection by id.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Returns a snapshot of all registered connections.
    ///
    /// Used by the liveness monitor so probing never holds the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Returns the number of registered connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns `true` if no connections are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
