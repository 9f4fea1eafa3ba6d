//! Session and command-dispatch layer for WebSocket services.
//!
//! This library turns a raw WebSocket listener into a small application
//! server: it accepts connections, runs a pluggable authentication
//! handshake, tracks which connections belong to which user, and routes
//! inbound frames to named command handlers or pending reply listeners.
//!
//! # Architecture
//!
//! The server owns three registries and wires the pluggable pieces around
//! them:
//!
//! - **Connections**: every accepted socket gets a [`Connection`] handle
//!   with a dedicated writer task, tracked until it closes.
//! - **Users**: an [`Authenticator`] binds connections to user identities;
//!   one user may hold several connections (multiple devices), and
//!   outbound sends fan out across all of them.
//! - **Correlations**: request/reply pairing over a fire-and-forget wire,
//!   with per-request expiry.
//!
//! Frames are JSON arrays of the form `[command, body, correlationId?]`.
//! Unauthenticated connections may only invoke allowlisted public
//! commands; a stale or dead connection is detected by a periodic
//! ping/pong liveness sweep.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use serde_json::json;
//! use wsbase::{
//!     ActionRegistry, Authenticator, Connection, Envelope, Registrar, Result,
//!     Server, User,
//! };
//!
//! struct HeaderAuth;
//!
//! #[async_trait]
//! impl Authenticator for HeaderAuth {
//!     async fn authenticate(&self, conn: Arc<Connection>, registrar: Registrar) {
//!         // Verify credentials however the application likes.
//!         let _ = registrar.register(&conn, Some(User::with_id("u1")));
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let actions = ActionRegistry::new().with(
//!         "echo",
//!         |conn: &Arc<Connection>, envelope: Envelope| {
//!             conn.send(&envelope.reply("echo", envelope.body.clone()))
//!         },
//!     );
//!
//!     let server = Server::builder()
//!         .port(9000)
//!         .authenticator(HeaderAuth)
//!         .actions(actions)
//!         .bind()
//!         .await?;
//!
//!     server.broadcast(&Envelope::new("motd", json!({"text": "hello"})));
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`actions`] | Command handler trait and name→handler registry |
//! | [`auth`] | Authentication handshake: [`Authenticator`], [`Registrar`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`heartbeat`] | Ping/pong liveness monitor (internal) |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Wire envelope and server event types |
//! | [`registry`] | Connection, user, and correlation registries |
//! | [`router`] | Inbound frame routing and command sanitization |
//! | [`server`] | Server builder, connection handle, accept loop |

// ============================================================================
// Modules
// ============================================================================

/// Command handlers and the name→handler registry.
pub mod actions;

/// Authentication handshake: the [`Authenticator`] trait and [`Registrar`].
pub mod auth;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Ping/pong liveness monitoring.
///
/// Internal module; only the default interval is exported.
pub mod heartbeat;

/// Type-safe identifiers for connections and correlated requests.
pub mod identifiers;

/// Wire protocol types: [`Envelope`] and [`ServerEvent`].
pub mod protocol;

/// Connection, user, and correlation registries.
pub mod registry;

/// Inbound frame routing.
pub mod router;

/// Server builder, per-connection handle, and accept loop.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

// Action types
pub use actions::{ActionRegistry, ActionResolver, Handler};

// Authentication types
pub use auth::{Authenticator, Registrar};

// Error types
pub use error::{Error, Result};

// Heartbeat configuration
pub use heartbeat::DEFAULT_HEARTBEAT_INTERVAL;

// Identifier types
pub use identifiers::{ConnectionId, CorrelationId};

// Protocol types
pub use protocol::{Envelope, ServerEvent};

// Registry types
pub use registry::{
    ConnectionRegistry, CorrelationRegistry, ReplyListener, User, UserEntry, UserRegistry,
};

// Router
pub use router::Router;

// Server types
pub use server::{Connection, LastConnectionClosed, Server, ServerBuilder};
