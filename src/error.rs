//! Error types for the session server.
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`].
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Protocol | [`Error::Protocol`] |
//! | Authentication | [`Error::NotAuthenticated`], [`Error::BadState`], [`Error::AccessDenied`] |
//! | Dispatch | [`Error::UnknownCommand`], [`Error::HandlerFailed`] |
//! | Correlation | [`Error::CorrelationConflict`] |
//! | Connection | [`Error::ConnectionClosed`], [`Error::LivenessTimeout`], [`Error::UserNotFound`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |
//!
//! Nothing here escalates to a process-fatal condition from per-connection
//! activity; only [`Error::Config`] at startup is treated as fatal by
//! embedding applications.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{ConnectionId, CorrelationId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when server configuration is invalid at startup.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed envelope or protocol violation.
    ///
    /// Malformed inbound frames are dropped; the connection stays open.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Authentication Errors
    // ========================================================================
    /// Authentication produced no user identity.
    ///
    /// The connection is closed; the server keeps running.
    #[error("Client {connection_id} is not authenticated")]
    NotAuthenticated {
        /// Connection that failed authentication.
        connection_id: ConnectionId,
    },

    /// Connection is in the wrong state for the requested transition.
    ///
    /// Raised when binding a user to a closed or already-bound connection.
    #[error("Cannot bind client {connection_id} to a user: {message}")]
    BadState {
        /// Connection in the bad state.
        connection_id: ConnectionId,
        /// Description of the state conflict.
        message: String,
    },

    /// Unauthenticated client invoked a non-public command.
    ///
    /// The connection is closed before handler resolution.
    #[error("Client {connection_id} sent non-public command {command:?} before authenticating")]
    AccessDenied {
        /// Offending connection.
        connection_id: ConnectionId,
        /// Command that was rejected.
        command: String,
    },

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// No handler registered for the command name.
    ///
    /// The frame is dropped; the connection stays open.
    #[error("Unknown command: {command}")]
    UnknownCommand {
        /// The unrecognized command name.
        command: String,
    },

    /// A resolved handler returned a failure.
    ///
    /// Logged by the router; the connection stays open and no reply is sent.
    #[error("Handler for {command:?} failed: {message}")]
    HandlerFailed {
        /// Command whose handler failed.
        command: String,
        /// Failure description.
        message: String,
    },

    // ========================================================================
    // Correlation Errors
    // ========================================================================
    /// A reply listener is already pending for this correlation id.
    ///
    /// The original listener is preserved; the new one is rejected.
    #[error("Correlation id {id} already has a pending listener")]
    CorrelationConflict {
        /// The conflicting correlation id.
        id: CorrelationId,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection missed two consecutive liveness probes.
    ///
    /// Treated as an ordinary disconnect by the registries.
    #[error("Client {connection_id} missed two liveness probes")]
    LivenessTimeout {
        /// Connection that was force-terminated.
        connection_id: ConnectionId,
    },

    /// No user registered under the identity key.
    #[error("User not found: {user_id}")]
    UserNotFound {
        /// The missing identity key.
        user_id: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a not-authenticated error.
    #[inline]
    pub fn not_authenticated(connection_id: ConnectionId) -> Self {
        Self::NotAuthenticated { connection_id }
    }

    /// Creates a bad-state error.
    #[inline]
    pub fn bad_state(connection_id: ConnectionId, message: impl Into<String>) -> Self {
        Self::BadState {
            connection_id,
            message: message.into(),
        }
    }

    /// Creates an access-denied error.
    #[inline]
    pub fn access_denied(connection_id: ConnectionId, command: impl Into<String>) -> Self {
        Self::AccessDenied {
            connection_id,
            command: command.into(),
        }
    }

    /// Creates an unknown-command error.
    #[inline]
    pub fn unknown_command(command: impl Into<String>) -> Self {
        Self::UnknownCommand {
            command: command.into(),
        }
    }

    /// Creates a handler-failed error.
    #[inline]
    pub fn handler_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates a correlation-conflict error.
    #[inline]
    pub fn correlation_conflict(id: CorrelationId) -> Self {
        Self::CorrelationConflict { id }
    }

    /// Creates a liveness-timeout error.
    #[inline]
    pub fn liveness_timeout(connection_id: ConnectionId) -> Self {
        Self::LivenessTimeout { connection_id }
    }

    /// Creates a user-not-found error.
    #[inline]
    pub fn user_not_found(user_id: impl Into<String>) -> Self {
        Self::UserNotFound {
            user_id: user_id.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is an authentication error.
    #[inline]
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Self::NotAuthenticated { .. } | Self::BadState { .. } | Self::AccessDenied { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::LivenessTimeout { .. } | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error leaves the connection open.
    ///
    /// Protocol, dispatch, and correlation failures are dropped without
    /// affecting the connection.
    #[inline]
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::UnknownCommand { .. }
                | Self::HandlerFailed { .. }
                | Self::CorrelationConflict { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
