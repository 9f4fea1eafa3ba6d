//! In-memory registries shared by the connection, user, and correlation
//! lifecycles.
//!
//! All registries are rebuilt from live connections on restart; nothing is
//! persisted. Each registry maintains its own invariants under its own
//! lock; no cross-registry transactions exist.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connections` | Connection id → live connection handle |
//! | `users` | Identity key → authenticated connection set |
//! | `correlations` | Correlation id → pending reply listener |

// ============================================================================
// Submodules
// ============================================================================

/// Connection registry.
pub mod connections;

/// Correlation registry.
pub mod correlations;

/// User registry.
pub mod users;

// ============================================================================
// Re-exports
// ============================================================================

pub use connections::ConnectionRegistry;
pub use correlations::{CorrelationRegistry, ReplyListener};
pub use users::{User, UserEntry, UserRegistry};
