//! Authentication handshake.
//!
//! Identity verification is the sole externally supplied policy in the
//! core: the server invokes the [`Authenticator`] once per accepted
//! connection and hands it a [`Registrar`]. The authenticator verifies
//! credentials however it likes (tokens, an external IdP, a login frame
//! arriving as a public command) and calls [`Registrar::register`] at most
//! once per connection.
//!
//! The authenticator runs concurrently with the connection's read loop, so
//! deferred, command-based login works: keep a `Registrar` clone inside a
//! public command handler and register from there.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::protocol::ServerEvent;
use crate::registry::users::{User, UserRegistry};
use crate::server::connection::Connection;

// ============================================================================
// Authenticator
// ============================================================================

/// External identity-verification collaborator.
///
/// Mandatory: a server without an authenticator fails construction with
/// [`Error::Config`].
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Called once for each newly accepted connection.
    ///
    /// Call `registrar.register(&connection, Some(user))` to bind an
    /// identity, `registrar.register(&connection, None)` to reject the
    /// client, or neither to leave the connection unauthenticated (it may
    /// then only invoke public commands).
    async fn authenticate(&self, connection: Arc<Connection>, registrar: Registrar);
}

// ============================================================================
// Registrar
// ============================================================================

/// Handle through which an authentication outcome is reported.
///
/// Cloneable so that deferred flows can carry it into command handlers.
#[derive(Clone)]
pub struct Registrar {
    users: Arc<UserRegistry>,
}

impl Registrar {
    /// Creates a registrar over the server's user registry.
    pub(crate) fn new(users: Arc<UserRegistry>) -> Self {
        Self { users }
    }

    /// Reports the authentication outcome for `connection`.
    ///
    /// On success the connection is bound to `user`, recorded in the user
    /// registry, and sent the `authenticated` acknowledgment event.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAuthenticated`] if `user` is `None`; the connection is
    ///   closed.
    /// - [`Error::BadState`] if the connection is no longer open (the
    ///   client disconnected while authentication ran, possibly mid-call;
    ///   nothing is registered) or is already bound to a user.
    pub fn register(&self, connection: &Arc<Connection>, user: Option<User>) -> Result<()> {
        let Some(user) = user else {
            info!(
                connection_id = %connection.id(),
                "Client is not logged in, closing connection"
            );
            connection.close();
            return Err(Error::not_authenticated(connection.id()));
        };

        if !connection.is_open() {
            warn!(
                connection_id = %connection.id(),
                user_id = %user.id,
                "Cannot bind client to a user: connection is not open"
            );
            return Err(Error::bad_state(connection.id(), "connection is not open"));
        }

        connection.bind(user.clone())?;

        // The client may disconnect between the check above and this
        // insert; the registry refuses a closed connection, so a late
        // registration never leaves a dead connection behind.
        if !self.users.register(user.clone(), connection) {
            warn!(
                connection_id = %connection.id(),
                user_id = %user.id,
                "Connection closed during authentication, discarding registration"
            );
            return Err(Error::bad_state(
                connection.id(),
                "connection closed during authentication",
            ));
        }

        let payload = serde_json::to_value(&user).unwrap_or(Value::Null);
        if let Err(e) = connection.send_event(&ServerEvent::authenticated(payload)) {
            warn!(
                connection_id = %connection.id(),
                error = %e,
                "Failed to send authenticated event"
            );
        }

        info!(
            connection_id = %connection.id(),
            user_id = %user.id,
            "Client authenticated"
        );

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::server::connection::OutboundFrame;

    fn registrar() -> (Registrar, Arc<UserRegistry>) {
        let users = Arc::new(UserRegistry::new());
        (Registrar::new(Arc::clone(&users)), users)
    }

    #[tokio::test]
    async fn test_register_success_binds_and_acknowledges() {
        let (registrar, users) = registrar();
        let (conn, mut rx) = Connection::detached();

        registrar
            .register(&conn, Some(User::new("u1", json!({"name": "Ada"}))))
            .expect("register");

        assert!(conn.is_authenticated());
        assert_eq!(users.get("u1").expect("entry").connections().len(), 1);

        match rx.recv().await {
            Some(OutboundFrame::Text(frame)) => {
                assert!(frame.contains(r#""event":"authenticated""#));
                assert!(frame.contains("Ada"));
            }
            other => panic!("expected authenticated event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_absent_user_closes_connection() {
        let (registrar, users) = registrar();
        let (conn, mut rx) = Connection::detached();

        let err = registrar.register(&conn, None).unwrap_err();

        assert!(matches!(err, Error::NotAuthenticated { .. }));
        assert!(!conn.is_open());
        assert!(users.is_empty());
        assert_eq!(rx.recv().await, Some(OutboundFrame::Close));
    }

    #[tokio::test]
    async fn test_register_on_closed_connection_takes_no_action() {
        let (registrar, users) = registrar();
        let (conn, _rx) = Connection::detached();
        conn.close();

        let err = registrar
            .register(&conn, Some(User::with_id("u1")))
            .unwrap_err();

        assert!(matches!(err, Error::BadState { .. }));
        assert!(!conn.is_authenticated());
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn test_register_twice_fails_second_time() {
        let (registrar, users) = registrar();
        let (conn, _rx) = Connection::detached();

        registrar
            .register(&conn, Some(User::with_id("u1")))
            .expect("first register");

        let err = registrar
            .register(&conn, Some(User::with_id("u2")))
            .unwrap_err();

        assert!(matches!(err, Error::BadState { .. }));
        assert!(users.get("u1").is_some());
        assert!(users.get("u2").is_none());
    }
}
