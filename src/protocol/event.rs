//! Server-to-client event notifications.
//!
//! Events are one-way pushes that do not take part in command dispatch or
//! correlation. The only event emitted by the core itself is the
//! authentication acknowledgment:
//!
//! ```json
//! {"event": "authenticated", "body": {"id": "u1", "profile": {...}}}
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

// ============================================================================
// ServerEvent
// ============================================================================

/// A named event pushed from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Event name.
    pub event: String,

    /// Event payload.
    pub body: Value,
}

impl ServerEvent {
    /// Creates a new event.
    #[inline]
    #[must_use]
    pub fn new(event: impl Into<String>, body: Value) -> Self {
        Self {
            event: event.into(),
            body,
        }
    }

    /// Creates the authentication acknowledgment carrying the user payload.
    #[inline]
    #[must_use]
    pub fn authenticated(user: Value) -> Self {
        Self::new("authenticated", user)
    }

    /// Serializes this event as an outgoing text frame.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if serialization fails.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
