//! Liveness monitoring.
//!
//! A background task probes every open connection on a fixed interval,
//! independent of message traffic. Each sweep gives connections a
//! two-cycle grace window:
//!
//! - liveness flag still set from the previous cycle → clear it and send a
//!   ping;
//! - flag already cleared → the previous probe went unanswered; terminate
//!   the connection without a close handshake.
//!
//! Pong frames arriving in the read loop restore the flag, cancelling the
//! pending termination. One transient delay therefore never kills a
//! connection, while a dead one is dropped within two intervals.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::Error;
use crate::registry::ConnectionRegistry;

// ============================================================================
// Constants
// ============================================================================

/// Default probe interval (30s).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Monitor Task
// ============================================================================

/// Spawns the liveness monitor over the connection registry.
///
/// The returned handle is aborted on server shutdown.
pub(crate) fn spawn(registry: Arc<ConnectionRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick fires immediately; skip it so every connection
        // gets a full interval before its first probe.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep(&registry);
        }
    })
}

/// Runs one probe cycle over all registered connections.
///
/// Returns `(probed, terminated)` counts.
pub(crate) fn sweep(registry: &ConnectionRegistry) -> (usize, usize) {
    let mut probed = 0;
    let mut terminated = 0;

    for connection in registry.snapshot() {
        if !connection.is_open() {
            continue;
        }

        if connection.probe() {
            connection.ping();
            probed += 1;
        } else {
            warn!(
                error = %Error::liveness_timeout(connection.id()),
                "Terminating connection"
            );
            connection.terminate();
            terminated += 1;
        }
    }

    if probed > 0 || terminated > 0 {
        debug!(probed, terminated, "Liveness sweep completed");
    }

    (probed, terminated)
}

// ============================================================================
// Tests
// ============================================================================
