//! Command handlers and handler resolution.
//!
//! Handlers are registered once at startup in an [`ActionRegistry`]: a
//! plain name→handler table populated by the embedding application. How
//! handlers are packaged is outside the core's concern; only the lookup
//! contract of [`ActionResolver`] matters to the router.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::protocol::Envelope;
use crate::server::connection::Connection;

// ============================================================================
// Handler
// ============================================================================

/// A command handler.
///
/// Handlers run synchronously with respect to their connection's message
/// stream; frames from one connection are processed in arrival order. A
/// returned error is logged by the router and the connection stays open.
///
/// Any `Fn(&Arc<Connection>, Envelope) -> Result<()>` is a handler:
///
/// ```
/// use std::sync::Arc;
/// use wsbase::{ActionRegistry, Connection, Envelope};
///
/// let actions = ActionRegistry::new().with("echo", |conn: &Arc<Connection>, envelope: Envelope| {
///     let reply = envelope.reply("echo", envelope.body.clone());
///     conn.send(&reply)
/// });
/// assert!(actions.contains("echo"));
/// ```
pub trait Handler: Send + Sync {
    /// Handles one command envelope on behalf of `connection`.
    ///
    /// # Errors
    ///
    /// Implementations report failures as crate errors;
    /// [`crate::Error::HandlerFailed`] is available for domain failures.
    fn handle(&self, connection: &Arc<Connection>, envelope: Envelope) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&Arc<Connection>, Envelope) -> Result<()> + Send + Sync,
{
    fn handle(&self, connection: &Arc<Connection>, envelope: Envelope) -> Result<()> {
        self(connection, envelope)
    }
}

// ============================================================================
// ActionResolver
// ============================================================================

/// Name→handler lookup used by the router.
pub trait ActionResolver: Send + Sync {
    /// Resolves a sanitized command name to a handler, or reports not-found.
    fn resolve(&self, command: &str) -> Option<Arc<dyn Handler>>;
}

// ============================================================================
// ActionRegistry
// ============================================================================

/// Startup-time table of named command handlers.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: FxHashMap<String, Arc<dyn Handler>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under a command name, replacing any previous
    /// handler for that name.
    pub fn register(&mut self, command: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(command.into(), Arc::new(handler));
    }

    /// Fluent variant of [`register`](Self::register) for building tables
    /// inline.
    #[must_use]
    pub fn with(mut self, command: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.register(command, handler);
        self
    }

    /// Returns `true` if a handler is registered under `command`.
    #[inline]
    #[must_use]
    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Returns the number of registered handlers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handlers are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl ActionResolver for ActionRegistry {
    fn resolve(&self, command: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(command).cloned()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_registered_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        let actions = ActionRegistry::new().with(
            "chat.send",
            move |_conn: &Arc<Connection>, _envelope: Envelope| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        let handler = actions.resolve("chat.send").expect("handler");
        let (conn, _rx) = Connection::detached();
        handler
            .handle(&conn, Envelope::new("chat.send", json!({})))
            .expect("handle");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolve_unknown_returns_none() {
        let actions = ActionRegistry::new();
        assert!(actions.resolve("nope").is_none());
        assert!(actions.is_empty());
    }

    #[test]
    fn test_register_replaces_previous_handler() {
        let mut actions = ActionRegistry::new();
        actions.register("x", |_: &Arc<Connection>, _: Envelope| Ok(()));
        actions.register("x", |_: &Arc<Connection>, _: Envelope| Ok(()));
        assert_eq!(actions.len(), 1);
    }
}
