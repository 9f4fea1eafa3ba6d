//! Inbound frame routing.
//!
//! Each inbound text frame passes through, in order:
//!
//! 1. Envelope parsing: malformed input is logged and dropped, never fatal.
//! 2. The public/private access gate: unauthenticated clients may only
//!    invoke allowlisted commands; anything else closes the connection.
//! 3. Correlation matching: a frame carrying a pending correlation id
//!    consumes that entry and goes to its reply listener. This deliberately
//!    takes priority over command-name resolution, since a reply uses the
//!    same wire shape as a fresh command.
//! 4. Command-name sanitization and handler resolution.
//! 5. Handler invocation: a handler failure is logged and dropped.
//!
//! The read loop dispatches inline, so frames from one connection are
//! processed in arrival order.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::actions::ActionResolver;
use crate::error::Error;
use crate::protocol::Envelope;
use crate::registry::correlations::CorrelationRegistry;
use crate::server::connection::Connection;

// ============================================================================
// Router
// ============================================================================

/// Routes inbound frames to reply listeners and named command handlers.
pub struct Router {
    actions: Arc<dyn ActionResolver>,
    correlations: Arc<CorrelationRegistry>,
    public_commands: FxHashSet<String>,
}

impl Router {
    /// Creates a router.
    ///
    /// `public_commands` is the allowlist of command names usable before
    /// authentication completes.
    pub fn new(
        actions: Arc<dyn ActionResolver>,
        correlations: Arc<CorrelationRegistry>,
        public_commands: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            actions,
            correlations,
            public_commands: public_commands.into_iter().collect(),
        }
    }

    /// Dispatches one inbound text frame from `connection`.
    pub fn dispatch(&self, connection: &Arc<Connection>, text: &str) {
        let mut envelope = match Envelope::from_frame(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    connection_id = %connection.id(),
                    error = %e,
                    "Invalid message received, dropping frame"
                );
                return;
            }
        };

        if !connection.is_authenticated() && !self.public_commands.contains(&envelope.command) {
            let denied = Error::access_denied(connection.id(), &envelope.command);
            warn!(error = %denied, "Closing connection");
            connection.close();
            return;
        }

        if let Some(id) = envelope.correlation_id.clone()
            && let Some(listener) = self.correlations.consume(&id)
        {
            debug!(
                connection_id = %connection.id(),
                id = %id,
                "Frame matched pending reply listener"
            );
            listener(envelope);
            return;
        }

        let command = sanitize_command(&envelope.command);
        if command.is_empty() {
            warn!(
                connection_id = %connection.id(),
                raw = %envelope.command,
                "Command name empty after sanitization, dropping frame"
            );
            return;
        }

        let Some(handler) = self.actions.resolve(&command) else {
            warn!(
                connection_id = %connection.id(),
                error = %Error::unknown_command(&command),
                "Dropping frame"
            );
            return;
        };

        envelope.command = command;
        if let Err(e) = handler.handle(connection, envelope) {
            warn!(
                connection_id = %connection.id(),
                error = %e,
                "Handler failed"
            );
        }
    }
}

// ============================================================================
// Sanitization
// ============================================================================

/// Strips `..` sequences from a command name before handler resolution.
///
/// Applied repeatedly so removals cannot reassemble a new `..` (for
/// example `.` + `...` collapsing). Guards the handler namespace against
/// path-traversal-style names.
pub(crate) fn sanitize_command(command: &str) -> String {
    let mut name = command.to_string();
    while name.contains("..") {
        name = name.replace("..", "");
    }
    name
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use crate::actions::ActionRegistry;
    use crate::registry::users::User;
    use crate::server::connection::OutboundFrame;

    /// Router over a handler that records every envelope it sees.
    fn recording_router(
        command: &str,
        public: &[&str],
    ) -> (Router, Arc<Mutex<Vec<Envelope>>>, Arc<CorrelationRegistry>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let actions = ActionRegistry::new().with(
            command,
            move |_conn: &Arc<Connection>, envelope: Envelope| {
                seen_clone.lock().expect("lock").push(envelope);
                Ok(())
            },
        );

        let correlations = Arc::new(CorrelationRegistry::new(Duration::from_secs(5)));
        let router = Router::new(
            Arc::new(actions),
            Arc::clone(&correlations),
            public.iter().map(|s| s.to_string()),
        );

        (router, seen, correlations)
    }

    #[test]
    fn test_sanitize_strips_traversal_sequences() {
        assert_eq!(sanitize_command("../secret"), "/secret");
        assert_eq!(sanitize_command("a..b..c"), "abc");
        assert_eq!(sanitize_command("...."), "");
        assert_eq!(sanitize_command(".~.."), ".~");
        assert_eq!(sanitize_command("chat.send"), "chat.send");
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (router, seen, _correlations) = recording_router("x", &[]);
        let (conn, _rx) = Connection::detached();

        router.dispatch(&conn, "not json at all");

        assert!(conn.is_open());
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_unauthenticated_private_command_closes_connection() {
        let (router, seen, _correlations) = recording_router("secret", &[]);
        let (conn, mut rx) = Connection::detached();

        router.dispatch(&conn, r#"["secret", {}]"#);

        assert!(!conn.is_open());
        assert!(seen.lock().expect("lock").is_empty());
        assert_eq!(rx.recv().await, Some(OutboundFrame::Close));
    }

    #[tokio::test]
    async fn test_unauthenticated_public_command_is_dispatched() {
        let (router, seen, _correlations) = recording_router("login", &["login"]);
        let (conn, _rx) = Connection::detached();

        router.dispatch(&conn, r#"["login", {"token": "t"}]"#);

        assert!(conn.is_open());
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_authenticated_command_is_dispatched() {
        let (router, seen, _correlations) = recording_router("chat.send", &[]);
        let (conn, _rx) = Connection::detached();
        conn.bind(User::with_id("u1")).expect("bind");

        router.dispatch(&conn, r#"["chat.send", {"text": "hi"}]"#);

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].body, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_correlation_match_wins_over_command_name() {
        let (router, seen, correlations) = recording_router("reply.cmd", &[]);
        let (conn, _rx) = Connection::detached();
        conn.bind(User::with_id("u1")).expect("bind");

        let replies = Arc::new(Mutex::new(Vec::new()));
        let replies_clone = Arc::clone(&replies);

        let mut request = Envelope::new("reply.cmd", json!(null));
        let id = correlations
            .await_reply(
                &mut request,
                Box::new(move |envelope| {
                    replies_clone.lock().expect("lock").push(envelope);
                }),
                None,
            )
            .expect("register");

        // The frame carries both a pending id and a registered command name.
        let frame = format!(r#"["reply.cmd", {{"ok": true}}, "{id}"]"#);
        router.dispatch(&conn, &frame);

        assert_eq!(replies.lock().expect("lock").len(), 1);
        assert!(seen.lock().expect("lock").is_empty());
        assert_eq!(correlations.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_correlation_falls_through_to_handler() {
        let (router, seen, _correlations) = recording_router("chat.send", &[]);
        let (conn, _rx) = Connection::detached();
        conn.bind(User::with_id("u1")).expect("bind");

        router.dispatch(&conn, r#"["chat.send", {}, "never-registered"]"#);

        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_traversal_command_resolves_sanitized_name() {
        let (router, seen, _correlations) = recording_router("/secret", &[]);
        let (conn, _rx) = Connection::detached();
        conn.bind(User::with_id("u1")).expect("bind");

        router.dispatch(&conn, r#"["../secret", {}]"#);

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].command, "/secret");
    }

    #[tokio::test]
    async fn test_unknown_command_is_dropped() {
        let (router, seen, _correlations) = recording_router("known", &[]);
        let (conn, _rx) = Connection::detached();
        conn.bind(User::with_id("u1")).expect("bind");

        router.dispatch(&conn, r#"["unknown", {}]"#);

        assert!(conn.is_open());
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_keeps_connection_open() {
        let actions = ActionRegistry::new().with(
            "boom",
            |_conn: &Arc<Connection>, envelope: Envelope| {
                Err(Error::handler_failed(envelope.command, "exploded"))
            },
        );
        let correlations = Arc::new(CorrelationRegistry::new(Duration::from_secs(5)));
        let router = Router::new(Arc::new(actions), correlations, std::iter::empty());

        let (conn, _rx) = Connection::detached();
        conn.bind(User::with_id("u1")).expect("bind");

        router.dispatch(&conn, r#"["boom", {}]"#);

        assert!(conn.is_open());
    }
}
