//! Wire message types.
//!
//! This module defines the text frames exchanged with clients.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Shape |
//! |--------------|-----------|-------|
//! | [`Envelope`] | both | `[command, body, correlationId?]` |
//! | [`ServerEvent`] | Server → Client | `{"event": ..., "body": ...}` |
//!
//! A reply to a correlated request is an ordinary [`Envelope`] carrying the
//! request's correlation id; there is no dedicated reply shape.

// ============================================================================
// Submodules
// ============================================================================

/// Command envelope wire format.
pub mod envelope;

/// Server-to-client event notifications.
pub mod event;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::Envelope;
pub use event::ServerEvent;
