//! Per-connection handle and outbound writer task.
//!
//! A [`Connection`] is the server-side handle over one client's WebSocket.
//! The WebSocket sink is owned by a spawned writer task fed through an
//! unbounded channel, so every send is non-blocking; the read half stays
//! with the server's per-connection task.
//!
//! # State
//!
//! A connection is `Unauthenticated` until the handshake binds a user,
//! `Authenticated` afterwards, and `Closed` once either side hangs up or
//! the liveness monitor terminates it. `Closed` is terminal.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{Envelope, ServerEvent};
use crate::registry::users::User;

// ============================================================================
// OutboundFrame
// ============================================================================

/// Frames queued for the writer task.
#[derive(Debug, PartialEq)]
pub(crate) enum OutboundFrame {
    /// Text payload (envelope or event).
    Text(String),
    /// Liveness probe.
    Ping,
    /// Graceful close: send a Close frame, then stop writing.
    Close,
    /// Forced termination: stop writing without a close handshake.
    Terminate,
}

// ============================================================================
// Connection
// ============================================================================

/// Server-side handle over one client WebSocket connection.
///
/// # Thread Safety
///
/// `Connection` is shared as `Arc<Connection>`; all operations are
/// non-blocking and safe to call from any task.
pub struct Connection {
    /// Unique id assigned at accept time.
    id: ConnectionId,
    /// Channel into the writer task.
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    /// Bound user identity, set once by the authentication handshake.
    user: Mutex<Option<User>>,
    /// Open/closed flag. Cleared exactly once.
    open: AtomicBool,
    /// Liveness flag for the two-cycle heartbeat window.
    alive: AtomicBool,
    /// Wakes the read loop when the server side closes the connection.
    closed: Notify,
}

impl Connection {
    /// Creates a connection over a split WebSocket sink and spawns its
    /// writer task.
    pub(crate) fn new(sink: SplitSink<WebSocketStream<TcpStream>, Message>) -> Arc<Self> {
        let (outbound, rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::write_loop(sink, rx));

        Arc::new(Self {
            id: ConnectionId::next(),
            outbound,
            user: Mutex::new(None),
            open: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            closed: Notify::new(),
        })
    }

    /// Returns this connection's id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns `true` while the connection is open.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Returns `true` once a user has been bound to this connection.
    #[inline]
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.lock().is_some()
    }

    /// Returns the bound user, if any.
    ///
    /// The binding survives closure so registries can clean up by identity.
    #[inline]
    #[must_use]
    pub fn user(&self) -> Option<User> {
        self.user.lock().clone()
    }

    /// Sends an envelope over this connection.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is closed
    /// - [`Error::Json`] if the envelope cannot be serialized
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        self.send_text(envelope.to_frame()?)
    }

    /// Sends a server event over this connection.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is closed
    /// - [`Error::Json`] if the event cannot be serialized
    pub fn send_event(&self, event: &ServerEvent) -> Result<()> {
        self.send_text(event.to_frame()?)
    }

    /// Closes the connection gracefully. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(connection_id = %self.id, "Closing connection");
            let _ = self.outbound.send(OutboundFrame::Close);
            self.closed.notify_one();
        }
    }

    /// Terminates the connection without a close handshake. Idempotent.
    ///
    /// Used by the liveness monitor for connections that stopped answering
    /// probes.
    pub(crate) fn terminate(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(connection_id = %self.id, "Terminating connection");
            let _ = self.outbound.send(OutboundFrame::Terminate);
            self.closed.notify_one();
        }
    }

    /// Binds a user identity to this connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadState`] if a user is already bound; a connection
    /// maps to at most one user at a time.
    pub(crate) fn bind(&self, user: User) -> Result<()> {
        let mut guard = self.user.lock();
        if guard.is_some() {
            return Err(Error::bad_state(self.id, "already bound to a user"));
        }
        *guard = Some(user);
        Ok(())
    }

    /// Queues a liveness probe. Best effort.
    pub(crate) fn ping(&self) {
        let _ = self.outbound.send(OutboundFrame::Ping);
    }

    /// Marks the connection alive after a probe acknowledgment.
    #[inline]
    pub(crate) fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Clears the liveness flag and returns its previous value.
    ///
    /// `false` means the previous probe went unanswered.
    #[inline]
    pub(crate) fn probe(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    /// Marks the connection closed without queueing writer frames.
    ///
    /// Used when the remote side already hung up.
    #[inline]
    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Resolves when the server side closes or terminates the connection.
    pub(crate) async fn wait_closed(&self) {
        self.closed.notified().await;
    }

    /// Queues a text frame for the writer task.
    fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }

        self.outbound
            .send(OutboundFrame::Text(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Writer task: drains the outbound channel into the WebSocket sink.
    async fn write_loop(
        mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(error = %e, "Write failed, stopping writer");
                        break;
                    }
                }

                OutboundFrame::Ping => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                        debug!(error = %e, "Ping failed, stopping writer");
                        break;
                    }
                }

                OutboundFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }

                OutboundFrame::Terminate => break,
            }
        }

        trace!("Writer task terminated");
    }
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
impl Connection {
    /// Creates a connection with no socket behind it; the returned receiver
    /// exposes what would have been written.
    pub(crate) fn detached() -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            outbound,
            user: Mutex::new(None),
            open: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            closed: Notify::new(),
        });

        (conn, rx)
    }
}

// ============================================================================
// Tests
// ============================================================================
