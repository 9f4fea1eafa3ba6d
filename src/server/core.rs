//! Server bootstrap, accept loop, and per-connection lifecycle.
//!
//! # Connection Flow
//!
//! 1. The accept loop takes the TCP connection and upgrades it to a
//!    WebSocket.
//! 2. A [`Connection`] is created and recorded in the connection registry.
//! 3. The authenticator runs in its own task while the read loop starts
//!    delivering frames to the router.
//! 4. On close (either side, or liveness termination) both registries are
//!    cleaned up; if this was the user's last connection the configured
//!    callback fires exactly once.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, Registrar};
use crate::error::Result;
use crate::heartbeat;
use crate::identifiers::CorrelationId;
use crate::protocol::Envelope;
use crate::registry::correlations::CorrelationRegistry;
use crate::registry::users::UserEntry;
use crate::registry::{ConnectionRegistry, UserRegistry};
use crate::router::Router;

use super::builder::{LastConnectionClosed, ServerBuilder, ServerConfig};
use super::connection::Connection;

// ============================================================================
// Constants
// ============================================================================

/// Accept poll interval, so the loop notices the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Server
// ============================================================================

/// WebSocket session and command-dispatch server.
///
/// Constructed through [`Server::builder`]. Owns the accept loop and the
/// liveness monitor; dropping the server does not stop them, call
/// [`Server::shutdown`].
pub struct Server {
    inner: Arc<ServerInner>,
    accept_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

/// Shared server state, held by the accept loop and connection tasks.
struct ServerInner {
    local_addr: SocketAddr,
    connections: Arc<ConnectionRegistry>,
    users: Arc<UserRegistry>,
    correlations: Arc<CorrelationRegistry>,
    router: Router,
    authenticator: Arc<dyn Authenticator>,
    on_last_connection_closed: Option<LastConnectionClosed>,
    shutdown: AtomicBool,
}

// ============================================================================
// Server - Constructor
// ============================================================================

impl Server {
    /// Returns a builder for configuring a server.
    #[inline]
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds the listener and starts the accept loop and liveness monitor.
    pub(crate) async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(config.ip, config.port)).await?;
        let local_addr = listener.local_addr()?;

        let connections = Arc::new(ConnectionRegistry::new());
        let users = Arc::new(UserRegistry::new());
        let correlations = Arc::new(CorrelationRegistry::new(config.correlation_timeout));

        let router = Router::new(
            config.actions,
            Arc::clone(&correlations),
            config.public_commands,
        );

        let inner = Arc::new(ServerInner {
            local_addr,
            connections: Arc::clone(&connections),
            users,
            correlations,
            router,
            authenticator: config.authenticator,
            on_last_connection_closed: config.on_last_connection_closed,
            shutdown: AtomicBool::new(false),
        });

        info!(port = local_addr.port(), "Server is listening");

        let accept_task = tokio::spawn(Arc::clone(&inner).accept_loop(listener));
        let heartbeat_task = heartbeat::spawn(connections, config.heartbeat_interval);

        Ok(Self {
            inner,
            accept_task,
            heartbeat_task,
        })
    }
}

// ============================================================================
// Server - Public API
// ============================================================================

impl Server {
    /// Returns the port the server is bound to.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Returns the WebSocket URL for this server.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.inner.local_addr)
    }

    /// Returns the number of currently registered connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Looks up an authenticated user by identity key.
    #[must_use]
    pub fn user(&self, identity: &str) -> Option<UserEntry> {
        self.inner.users.get(identity)
    }

    /// Returns all authenticated users with their connections.
    #[must_use]
    pub fn users(&self) -> Vec<UserEntry> {
        self.inner.users.all()
    }

    /// Returns the registrar for reporting authentication outcomes.
    ///
    /// Intended for deferred, command-based login flows: capture a clone
    /// inside a public command handler.
    #[must_use]
    pub fn registrar(&self) -> Registrar {
        self.inner.registrar()
    }

    /// Sends an envelope to every connection of one user.
    ///
    /// A failed transmission on one connection never blocks the others.
    /// Returns the number of connections the frame was queued for.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UserNotFound`] if no user is registered
    /// under `identity`.
    pub fn send_to_user(&self, identity: &str, envelope: &Envelope) -> Result<usize> {
        let entry = self
            .inner
            .users
            .get(identity)
            .ok_or_else(|| crate::Error::user_not_found(identity))?;

        Ok(entry.send(envelope))
    }

    /// Sends an envelope to every connection of every authenticated user.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        self.inner
            .users
            .all()
            .iter()
            .map(|entry| entry.send(envelope))
            .sum()
    }

    /// Registers a reply listener for `envelope` with the default timeout.
    ///
    /// Assigns a generated correlation id when the envelope has none. Send
    /// the envelope afterwards; a reply frame carrying the id invokes
    /// `listener` exactly once. If no reply arrives before the timeout the
    /// listener is silently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CorrelationConflict`] if a listener is
    /// already pending for the envelope's id.
    pub fn await_reply(
        &self,
        envelope: &mut Envelope,
        listener: impl FnOnce(Envelope) + Send + 'static,
    ) -> Result<CorrelationId> {
        self.inner
            .correlations
            .await_reply(envelope, Box::new(listener), None)
    }

    /// Registers a reply listener with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CorrelationConflict`] if a listener is
    /// already pending for the envelope's id.
    pub fn await_reply_with_timeout(
        &self,
        envelope: &mut Envelope,
        listener: impl FnOnce(Envelope) + Send + 'static,
        timeout: Duration,
    ) -> Result<CorrelationId> {
        self.inner
            .correlations
            .await_reply(envelope, Box::new(listener), Some(timeout))
    }

    /// Returns the number of pending reply listeners.
    #[inline]
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.inner.correlations.pending_count()
    }

    /// Shuts down the server: stops accepting, closes every connection,
    /// and discards pending reply listeners.
    pub fn shutdown(&self) {
        info!("Server shutting down");

        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.accept_task.abort();
        self.heartbeat_task.abort();

        for connection in self.inner.connections.snapshot() {
            connection.close();
        }

        self.inner.correlations.shutdown();
    }
}

// ============================================================================
// ServerInner - Accept Loop
// ============================================================================

impl ServerInner {
    /// Returns a registrar over this server's user registry.
    fn registrar(&self) -> Registrar {
        Registrar::new(Arc::clone(&self.users))
    }

    /// Background task that accepts new connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            // Accept with a timeout so the shutdown flag is rechecked.
            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = inner.handle_connection(stream, addr).await {
                            warn!(error = %e, ?addr, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Handles one client connection from upgrade to cleanup.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (sink, mut ws_read) = ws_stream.split();

        let connection = Connection::new(sink);
        let id = self.connections.assign(Arc::clone(&connection));
        info!(connection_id = %id, ?addr, "Incoming connection");

        debug!(connection_id = %id, "Beginning authentication");
        {
            let authenticator = Arc::clone(&self.authenticator);
            let registrar = self.registrar();
            let conn = Arc::clone(&connection);
            tokio::spawn(async move {
                authenticator.authenticate(conn, registrar).await;
            });
        }

        loop {
            tokio::select! {
                () = connection.wait_closed() => break,

                message = ws_read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.router.dispatch(&connection, text.as_str());
                    }

                    Some(Ok(Message::Pong(_))) => connection.mark_alive(),

                    Some(Ok(Message::Close(_))) => {
                        debug!(connection_id = %id, "Connection closed by client");
                        break;
                    }

                    // Binary frames are not part of the protocol; inbound
                    // pings are answered by the WebSocket layer.
                    Some(Ok(_)) => {}

                    Some(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "WebSocket error");
                        break;
                    }

                    None => break,
                },
            }
        }

        self.cleanup(&connection);
        Ok(())
    }

    /// Removes a closed connection from both registries.
    fn cleanup(&self, connection: &Arc<Connection>) {
        connection.mark_closed();

        if let Some(user) = self.users.closed(connection) {
            if let Some(callback) = &self.on_last_connection_closed {
                callback(&user);
            }
        }

        self.connections.free(connection.id());
        debug!(connection_id = %connection.id(), "Connection closed");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Mutex, OnceLock};

    use async_trait::async_trait;
    use futures_util::SinkExt;
    use serde_json::json;
    use tokio_tungstenite::connect_async;

    use crate::actions::ActionRegistry;
    use crate::error::Error;
    use crate::registry::users::User;

    /// Authenticator that immediately approves every client as `id`.
    struct ApproveAs {
        id: &'static str,
    }

    #[async_trait]
    impl Authenticator for ApproveAs {
        async fn authenticate(&self, connection: Arc<Connection>, registrar: Registrar) {
            let user = User::new(self.id, json!({"device": "test"}));
            let _ = registrar.register(&connection, Some(user));
        }
    }

    /// Authenticator that leaves every connection unauthenticated.
    struct NeverRegister;

    #[async_trait]
    impl Authenticator for NeverRegister {
        async fn authenticate(&self, _connection: Arc<Connection>, _registrar: Registrar) {}
    }

    /// Authenticator that rejects every client.
    struct RejectAll;

    #[async_trait]
    impl Authenticator for RejectAll {
        async fn authenticate(&self, connection: Arc<Connection>, registrar: Registrar) {
            let _ = registrar.register(&connection, None);
        }
    }

    /// Installs the test log subscriber; later calls are no-ops.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn connect(server: &Server) -> Client {
        let (client, _) = connect_async(server.ws_url()).await.expect("connect");
        client
    }

    /// Reads the next text frame, answering pings along the way.
    async fn next_text(client: &mut Client) -> String {
        loop {
            match client.next().await.expect("stream open").expect("frame") {
                Message::Text(text) => return text.to_string(),
                Message::Close(_) => panic!("connection closed while expecting text"),
                _ => {}
            }
        }
    }

    /// Polls `condition` until it holds or a generous deadline passes.
    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition never met");
    }

    #[tokio::test]
    async fn test_bind_requires_authenticator() {
        init_tracing();
        let err = Server::builder().port(0).bind().await.err().expect("error");
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_bind_random_port() {
        init_tracing();
        let server = Server::builder()
            .port(0)
            .authenticator(NeverRegister)
            .bind()
            .await
            .expect("bind");

        assert!(server.port() > 0);
        assert!(server.ws_url().starts_with("ws://127.0.0.1:"));
        assert_eq!(server.connection_count(), 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_authentication_handshake_and_broadcast_fan_out() {
        init_tracing();
        let server = Server::builder()
            .port(0)
            .authenticator(ApproveAs { id: "u1" })
            .bind()
            .await
            .expect("bind");

        let mut device_a = connect(&server).await;
        let ack = next_text(&mut device_a).await;
        assert!(ack.contains(r#""event":"authenticated""#));
        assert!(ack.contains("u1"));

        // A second device authenticates under the same identity.
        let mut device_b = connect(&server).await;
        next_text(&mut device_b).await;

        eventually(|| {
            server
                .user("u1")
                .is_some_and(|entry| entry.connections().len() == 2)
        })
        .await;

        let delivered = server.broadcast(&Envelope::new("news", json!({"n": 1})));
        assert_eq!(delivered, 2);

        assert_eq!(next_text(&mut device_a).await, r#"["news",{"n":1}]"#);
        assert_eq!(next_text(&mut device_b).await, r#"["news",{"n":1}]"#);

        // Closing one device leaves the user registered.
        device_b.close(None).await.expect("close");
        eventually(|| {
            server
                .user("u1")
                .is_some_and(|entry| entry.connections().len() == 1)
        })
        .await;

        server.shutdown();
    }

    #[tokio::test]
    async fn test_rejected_client_is_closed() {
        init_tracing();
        let server = Server::builder()
            .port(0)
            .authenticator(RejectAll)
            .bind()
            .await
            .expect("bind");

        let mut client = connect(&server).await;

        // Only a close should arrive.
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(text))) => panic!("unexpected frame: {text}"),
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }

        eventually(|| server.connection_count() == 0).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unauthenticated_private_command_closes_connection() {
        init_tracing();
        let server = Server::builder()
            .port(0)
            .authenticator(NeverRegister)
            .public_command("login")
            .bind()
            .await
            .expect("bind");

        let mut client = connect(&server).await;
        client
            .send(Message::Text(r#"["secret", {}]"#.into()))
            .await
            .expect("send");

        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(text))) => panic!("unexpected frame: {text}"),
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }

        eventually(|| server.connection_count() == 0).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_command_based_login_via_public_command() {
        init_tracing();
        let registrar_slot: Arc<OnceLock<Registrar>> = Arc::new(OnceLock::new());
        let slot = Arc::clone(&registrar_slot);

        let actions = ActionRegistry::new().with(
            "login",
            move |conn: &Arc<Connection>, envelope: Envelope| {
                let registrar = slot.get().expect("registrar installed");
                let id = envelope.body["user"].as_str().unwrap_or("anon").to_string();
                registrar.register(conn, Some(User::with_id(id)))
            },
        );

        let server = Server::builder()
            .port(0)
            .authenticator(NeverRegister)
            .public_command("login")
            .actions(actions)
            .bind()
            .await
            .expect("bind");

        registrar_slot
            .set(server.registrar())
            .unwrap_or_else(|_| panic!("slot already set"));

        let mut client = connect(&server).await;
        client
            .send(Message::Text(r#"["login", {"user": "u9"}]"#.into()))
            .await
            .expect("send");

        let ack = next_text(&mut client).await;
        assert!(ack.contains(r#""event":"authenticated""#));
        assert!(ack.contains("u9"));
        assert!(server.user("u9").is_some());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_request_reply_correlation_round_trip() {
        init_tracing();
        let server = Server::builder()
            .port(0)
            .authenticator(ApproveAs { id: "u1" })
            .bind()
            .await
            .expect("bind");

        let mut client = connect(&server).await;
        next_text(&mut client).await;
        eventually(|| server.user("u1").is_some()).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut request = Envelope::new("time.get", json!(null));
        let id = server
            .await_reply(&mut request, move |reply| {
                let _ = tx.send(reply);
            })
            .expect("register listener");

        server.send_to_user("u1", &request).expect("send");

        // The client echoes a reply carrying the same correlation id.
        let frame = next_text(&mut client).await;
        let received = Envelope::from_frame(&frame).expect("parse");
        assert_eq!(received.correlation_id, Some(id));

        let reply = received.reply("time.get", json!({"now": 7}));
        client
            .send(Message::Text(reply.to_frame().expect("frame").into()))
            .await
            .expect("send reply");

        let reply = rx.await.expect("listener invoked");
        assert_eq!(reply.body, json!({"now": 7}));
        assert_eq!(server.pending_replies(), 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_last_connection_closed_fires_exactly_once() {
        init_tracing();
        let closed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let closed_clone = Arc::clone(&closed);

        let server = Server::builder()
            .port(0)
            .authenticator(ApproveAs { id: "u1" })
            .on_last_connection_closed(move |user| {
                closed_clone.lock().expect("lock").push(user.id.clone());
            })
            .bind()
            .await
            .expect("bind");

        let mut device_a = connect(&server).await;
        next_text(&mut device_a).await;
        let mut device_b = connect(&server).await;
        next_text(&mut device_b).await;

        device_a.close(None).await.expect("close a");
        eventually(|| server.connection_count() == 1).await;
        assert!(closed.lock().expect("lock").is_empty());

        device_b.close(None).await.expect("close b");
        eventually(|| server.connection_count() == 0).await;
        eventually(|| !closed.lock().expect("lock").is_empty()).await;

        assert_eq!(closed.lock().expect("lock").as_slice(), ["u1".to_string()]);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_unresponsive_connection_is_terminated() {
        init_tracing();
        let server = Server::builder()
            .port(0)
            .authenticator(ApproveAs { id: "u1" })
            .heartbeat_interval(Duration::from_millis(100))
            .bind()
            .await
            .expect("bind");

        // The client connects but never polls its socket, so probes go
        // unanswered.
        let _client = connect(&server).await;
        eventually(|| server.connection_count() == 1).await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(server.connection_count(), 0);

        server.shutdown();
    }
}
