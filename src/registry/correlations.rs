//! Correlation registry.
//!
//! Tracks pending request/reply listeners keyed by correlation id, with a
//! per-entry expiry timer. A reply matched by the router consumes the entry
//! and invokes the listener; an expired entry is discarded silently, so a
//! timed-out await is the non-error default outcome.
//!
//! The registry has no knowledge of which connection "owns" an id: closing
//! a connection cancels nothing here, and an await tied to a dead peer
//! simply times out.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::CorrelationId;
use crate::protocol::Envelope;

// ============================================================================
// Types
// ============================================================================

/// Listener invoked with the reply envelope. Consumed at most once.
pub type ReplyListener = Box<dyn FnOnce(Envelope) + Send + 'static>;

/// Pending entry: the listener plus its expiry timer.
struct PendingReply {
    listener: ReplyListener,
    expiry: JoinHandle<()>,
}

/// Map of pending listeners, shared with the expiry tasks.
type PendingMap = Arc<Mutex<FxHashMap<CorrelationId, PendingReply>>>;

// ============================================================================
// CorrelationRegistry
// ============================================================================

/// Registry of pending request/reply listeners.
///
/// The reply/timeout race is settled by whichever event removes the entry
/// first; the loser becomes a no-op.
pub struct CorrelationRegistry {
    pending: PendingMap,
    default_timeout: Duration,
}

impl CorrelationRegistry {
    /// Default expiry for pending entries (30s).
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a registry with the given default timeout.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(FxHashMap::default())),
            default_timeout,
        }
    }

    /// Registers interest in a future reply to `envelope`.
    ///
    /// Assigns a generated correlation id to the envelope when it has none,
    /// stores the listener, and schedules its removal after `timeout`
    /// (defaulting to the registry's timeout). If the timer fires first the
    /// entry is discarded and the listener is never invoked.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorrelationConflict`] if a listener is already
    /// pending for the envelope's id; the original listener is preserved.
    pub fn await_reply(
        &self,
        envelope: &mut Envelope,
        listener: ReplyListener,
        timeout: Option<Duration>,
    ) -> Result<CorrelationId> {
        let id = envelope
            .correlation_id
            .clone()
            .unwrap_or_else(CorrelationId::generate);
        envelope.correlation_id = Some(id.clone());

        let timeout = timeout.unwrap_or(self.default_timeout);

        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            warn!(id = %id, "Reply listener already pending, keeping the original");
            return Err(Error::correlation_conflict(id));
        }

        let expiry = tokio::spawn(Self::expire(Arc::clone(&self.pending), id.clone(), timeout));

        pending.insert(id.clone(), PendingReply { listener, expiry });
        debug!(id = %id, timeout_ms = timeout.as_millis() as u64, "Reply listener registered");

        Ok(id)
    }

    /// Consumes the pending entry for `id`, cancelling its expiry timer.
    ///
    /// Returns `None` if the entry already expired or was consumed.
    pub fn consume(&self, id: &CorrelationId) -> Option<ReplyListener> {
        let entry = self.pending.lock().remove(id)?;
        entry.expiry.abort();
        Some(entry.listener)
    }

    /// Returns the number of pending listeners.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Discards all pending entries and cancels their timers.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (_, entry) in drained {
            entry.expiry.abort();
        }

        if count > 0 {
            debug!(count, "Discarded pending reply listeners on shutdown");
        }
    }

    /// Expiry task body: discards the entry if it is still pending.
    async fn expire(pending: PendingMap, id: CorrelationId, timeout: Duration) {
        tokio::time::sleep(timeout).await;

        if pending.lock().remove(&id).is_some() {
            debug!(id = %id, "Reply listener timed out, discarding");
        }
    }
}

impl Drop for CorrelationRegistry {
    fn drop(&mut self) {
        self.shutdown();
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

    fn counting_listener(hits: &Arc<AtomicUsize>) -> ReplyListener {
        let hits = Arc::clone(hits);
        Box::new(move |_envelope| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_await_reply_assigns_generated_id() {
        let registry = CorrelationRegistry::new(Duration::from_secs(5));
        let mut envelope = Envelope::new("time.get", json!(null));

        let id = registry
            .await_reply(&mut envelope, Box::new(|_| {}), None)
            .expect("register");

        assert_eq!(envelope.correlation_id, Some(id));
        assert_eq!(registry.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_consume_invokes_listener_exactly_once() {
        let registry = CorrelationRegistry::new(Duration::from_secs(5));
        let hits = Arc::new(AtomicUsize::new(0));

        let mut envelope = Envelope::new("time.get", json!(null));
        let id = registry
            .await_reply(&mut envelope, counting_listener(&hits), None)
            .expect("register");

        let listener = registry.consume(&id).expect("pending entry");
        listener(envelope.reply("time.get", json!({"now": 1})));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_count(), 0);
        assert!(registry.consume(&id).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected_and_original_preserved() {
        let registry = CorrelationRegistry::new(Duration::from_secs(5));
        let hits = Arc::new(AtomicUsize::new(0));

        let mut first = Envelope::with_correlation("a", json!(null), CorrelationId::new("dup"));
        registry
            .await_reply(&mut first, counting_listener(&hits), None)
            .expect("first registration");

        let mut second = Envelope::with_correlation("b", json!(null), CorrelationId::new("dup"));
        let err = registry
            .await_reply(&mut second, Box::new(|_| panic!("loser must never run")), None)
            .unwrap_err();

        assert!(matches!(err, Error::CorrelationConflict { .. }));
        assert_eq!(registry.pending_count(), 1);

        // The original listener still wins.
        let listener = registry
            .consume(&CorrelationId::new("dup"))
            .expect("original entry");
        listener(Envelope::new("a", json!(null)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_discards_entry_without_invoking_listener() {
        let registry = CorrelationRegistry::new(Duration::from_secs(5));
        let hits = Arc::new(AtomicUsize::new(0));

        let mut envelope = Envelope::new("slow.call", json!(null));
        let id = registry
            .await_reply(
                &mut envelope,
                counting_listener(&hits),
                Some(Duration::from_millis(50)),
            )
            .expect("register");

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(registry.pending_count(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(registry.consume(&id).is_none());
    }

    #[tokio::test]
    async fn test_consume_cancels_timer() {
        let registry = CorrelationRegistry::new(Duration::from_secs(5));
        let mut envelope = Envelope::new("x", json!(null));

        let id = registry
            .await_reply(
                &mut envelope,
                Box::new(|_| {}),
                Some(Duration::from_millis(50)),
            )
            .expect("register");

        registry.consume(&id).expect("entry");
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Nothing left for the timer to discard; no double removal.
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_discards_all_entries() {
        let registry = CorrelationRegistry::new(Duration::from_secs(5));

        for _ in 0..3 {
            let mut envelope = Envelope::new("x", json!(null));
            registry
                .await_reply(&mut envelope, Box::new(|_| {}), None)
                .expect("register");
        }

        registry.shutdown();
        assert_eq!(registry.pending_count(), 0);
    }
}
