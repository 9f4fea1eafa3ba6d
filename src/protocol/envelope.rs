//! Command envelope wire format.
//!
//! Inbound and outbound command frames are JSON arrays:
//!
//! ```json
//! ["command.name", { "any": "body" }, "correlation-id"]
//! ```
//!
//! The body defaults to `null` and the correlation id may be absent, so
//! `["ping"]`, `["ping", {...}]` and `["ping", {...}, "id"]` are all valid
//! frames.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::CorrelationId;

// ============================================================================
// Envelope
// ============================================================================

/// Wire-level representation of a command invocation.
///
/// Carries a non-empty command name, an arbitrary structured body, and an
/// optional correlation id pairing a request with its eventual reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Command name. Non-empty for dispatch.
    pub command: String,

    /// Arbitrary structured payload (`null` when omitted on the wire).
    pub body: Value,

    /// Correlation id, when this frame belongs to a request/reply exchange.
    pub correlation_id: Option<CorrelationId>,
}

impl Envelope {
    /// Creates an envelope with no correlation id.
    #[inline]
    #[must_use]
    pub fn new(command: impl Into<String>, body: Value) -> Self {
        Self {
            command: command.into(),
            body,
            correlation_id: None,
        }
    }

    /// Creates an envelope carrying a correlation id.
    #[inline]
    #[must_use]
    pub fn with_correlation(
        command: impl Into<String>,
        body: Value,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            command: command.into(),
            body,
            correlation_id: Some(correlation_id),
        }
    }

    /// Creates a reply to this envelope, reusing its correlation id.
    ///
    /// A reply uses the same wire shape as a fresh command; only the
    /// correlation id ties it back to the request.
    #[inline]
    #[must_use]
    pub fn reply(&self, command: impl Into<String>, body: Value) -> Self {
        Self {
            command: command.into(),
            body,
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// Parses an inbound text frame.
    ///
    /// An empty-string correlation id is treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the frame is not valid JSON, not an
    /// array, has a missing/empty/non-string command, or carries a
    /// non-string correlation id.
    pub fn from_frame(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("invalid JSON frame: {e}")))?;

        let Value::Array(items) = value else {
            return Err(Error::protocol("frame is not a JSON array"));
        };

        let command = match items.first() {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::String(_)) => return Err(Error::protocol("empty command name")),
            Some(_) => return Err(Error::protocol("command is not a string")),
            None => return Err(Error::protocol("empty frame")),
        };

        let body = items.get(1).cloned().unwrap_or(Value::Null);

        let correlation_id = match items.get(2) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(CorrelationId::new(s.clone())),
            Some(_) => return Err(Error::protocol("correlation id is not a string")),
        };

        Ok(Self {
            command,
            body,
            correlation_id,
        })
    }

    /// Serializes this envelope as an outgoing text frame.
    ///
    /// The correlation id element is omitted when absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_frame(&self) -> Result<String> {
        let mut items = vec![Value::String(self.command.clone()), self.body.clone()];
        if let Some(id) = &self.correlation_id {
            items.push(Value::String(id.as_str().to_string()));
        }

        Ok(serde_json::to_string(&items)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
