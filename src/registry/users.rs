//! User registry.
//!
//! Maps a logical user identity to the set of connections currently
//! authenticated as that user. One user may be logged in from several
//! devices at once; sending to a user fans out to every open connection.
//!
//! # Invariant
//!
//! The user→connections map stays consistent with the per-connection user
//! binding: a connection appears under exactly the identity it is bound to,
//! and is removed when it closes.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::identifiers::ConnectionId;
use crate::protocol::Envelope;
use crate::server::connection::Connection;

// ============================================================================
// User
// ============================================================================

/// Logical identity produced by the external authenticator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable, unique identity key.
    pub id: String,

    /// Arbitrary profile payload supplied by the authenticator.
    #[serde(default)]
    pub profile: Value,
}

impl User {
    /// Creates a user with a profile payload.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, profile: Value) -> Self {
        Self {
            id: id.into(),
            profile,
        }
    }

    /// Creates a user with an empty profile.
    #[inline]
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self::new(id, Value::Null)
    }
}

// ============================================================================
// UserEntry
// ============================================================================

/// Snapshot of a user and their connections at lookup time.
pub struct UserEntry {
    user: User,
    connections: Vec<Arc<Connection>>,
}

impl UserEntry {
    /// Returns the user identity.
    #[inline]
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Returns the connections bound to this user.
    #[inline]
    #[must_use]
    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    /// Sends an envelope to every connection of this user.
    ///
    /// A failed transmission on one connection is logged and never blocks
    /// delivery to the others. Returns the number of connections the frame
    /// was queued for.
    pub fn send(&self, envelope: &Envelope) -> usize {
        let mut delivered = 0;

        for connection in &self.connections {
            match connection.send(envelope) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    connection_id = %connection.id(),
                    user_id = %self.user.id,
                    error = %e,
                    "Fan-out send failed"
                ),
            }
        }

        delivered
    }
}

// ============================================================================
// UserRegistry
// ============================================================================

/// Per-user slot holding the live connection set.
struct UserSlot {
    user: User,
    connections: FxHashMap<ConnectionId, Arc<Connection>>,
}

/// Registry of authenticated users, keyed by identity.
#[derive(Default)]
pub struct UserRegistry {
    users: RwLock<FxHashMap<String, UserSlot>>,
}

impl UserRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection to the user's set, creating the set on first
    /// registration. Idempotent if the connection is already present.
    ///
    /// Returns `false` without inserting when the connection has already
    /// closed. The open-check and the insert happen under the registry
    /// lock, so a close that lands before the check is always refused
    /// here, and one that lands after is removed by the close-side
    /// [`closed`](Self::closed) call, which must wait for the same lock.
    /// Either way a closed connection never stays registered.
    #[must_use]
    pub fn register(&self, user: User, connection: &Arc<Connection>) -> bool {
        let mut users = self.users.write();

        if !connection.is_open() {
            return false;
        }

        let slot = users.entry(user.id.clone()).or_insert_with(|| UserSlot {
            user,
            connections: FxHashMap::default(),
        });

        slot.connections
            .insert(connection.id(), Arc::clone(connection));
        true
    }

    /// Looks up a user by identity key.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<UserEntry> {
        let users = self.users.read();
        let slot = users.get(identity)?;

        Some(UserEntry {
            user: slot.user.clone(),
            connections: slot.connections.values().cloned().collect(),
        })
    }

    /// Returns all known users with their connections.
    #[must_use]
    pub fn all(&self) -> Vec<UserEntry> {
        self.users
            .read()
            .values()
            .map(|slot| UserEntry {
                user: slot.user.clone(),
                connections: slot.connections.values().cloned().collect(),
            })
            .collect()
    }

    /// Removes a closed connection from its user's set.
    ///
    /// Returns `Some(user)` exactly when this was the user's last
    /// connection; the entry is removed and the caller fires the
    /// last-connection-closed notification. Closing a subset of a user's
    /// connections returns `None`.
    pub fn closed(&self, connection: &Connection) -> Option<User> {
        let user = connection.user()?;
        let mut users = self.users.write();

        let slot = users.get_mut(&user.id)?;
        slot.connections.remove(&connection.id())?;

        if slot.connections.is_empty() {
            let slot = users.remove(&user.id)?;
            debug!(user_id = %slot.user.id, "Last connection closed, user removed");
            return Some(slot.user);
        }

        None
    }

    /// Returns the number of registered users.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// Returns `true` if no users are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
