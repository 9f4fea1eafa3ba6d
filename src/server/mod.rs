//! WebSocket server: configuration, connection handles, and lifecycle.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`builder`] | Fluent configuration and validation |
//! | [`connection`] | Per-client handle with a dedicated writer task |
//! | [`core`] | Accept loop, read loops, registries, public API |

pub mod builder;
pub mod connection;
pub mod core;

pub use builder::{LastConnectionClosed, ServerBuilder};
pub use connection::Connection;
pub use core::Server;
