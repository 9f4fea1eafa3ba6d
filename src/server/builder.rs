//! Builder pattern for server configuration.
//!
//! Provides a fluent API for configuring and binding a [`Server`].
//!
//! # Example
//!
//! ```no_run
//! use wsbase::Server;
//! # use std::sync::Arc;
//! # use async_trait::async_trait;
//! # use wsbase::{Authenticator, Connection, Registrar, User};
//! # struct TokenAuth;
//! # #[async_trait]
//! # impl Authenticator for TokenAuth {
//! #     async fn authenticate(&self, conn: Arc<Connection>, registrar: Registrar) {
//! #         let _ = registrar.register(&conn, Some(User::with_id("u1")));
//! #     }
//! # }
//!
//! # async fn example() -> wsbase::Result<()> {
//! let server = Server::builder()
//!     .port(9000)
//!     .authenticator(TokenAuth)
//!     .public_command("login")
//!     .bind()
//!     .await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{ActionRegistry, ActionResolver};
use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
use crate::registry::correlations::CorrelationRegistry;
use crate::registry::users::User;

use super::core::Server;

// ============================================================================
// Constants
// ============================================================================

/// Default listen port.
const DEFAULT_PORT: u16 = 9000;

/// Default bind address.
const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

// ============================================================================
// Types
// ============================================================================

/// Callback invoked when a user's last connection closes.
pub type LastConnectionClosed = Arc<dyn Fn(&User) + Send + Sync>;

// ============================================================================
// ServerBuilder
// ============================================================================

/// Builder for configuring a [`Server`] instance.
///
/// Use [`Server::builder()`] to create a new builder.
pub struct ServerBuilder {
    /// IP address to bind to.
    ip: IpAddr,
    /// Port to bind to (0 for random).
    port: u16,
    /// Command names usable before authentication completes.
    public_commands: Vec<String>,
    /// Identity-verification collaborator. Mandatory.
    authenticator: Option<Arc<dyn Authenticator>>,
    /// Name→handler lookup.
    actions: Option<Arc<dyn ActionResolver>>,
    /// Last-connection-closed notification.
    on_last_connection_closed: Option<LastConnectionClosed>,
    /// Liveness probe interval.
    heartbeat_interval: Duration,
    /// Default expiry for pending reply listeners.
    correlation_timeout: Duration,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            ip: DEFAULT_BIND_IP,
            port: DEFAULT_PORT,
            public_commands: Vec::new(),
            authenticator: None,
            actions: None,
            on_last_connection_closed: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            correlation_timeout: CorrelationRegistry::DEFAULT_TIMEOUT,
        }
    }
}

// ============================================================================
// ServerBuilder Implementation
// ============================================================================

impl ServerBuilder {
    /// Creates a new builder with default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the IP address to bind to (default: localhost).
    #[inline]
    #[must_use]
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    /// Sets the port to bind to (default: 9000; 0 for a random port).
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Adds a command name to the pre-authentication allowlist.
    #[inline]
    #[must_use]
    pub fn public_command(mut self, command: impl Into<String>) -> Self {
        self.public_commands.push(command.into());
        self
    }

    /// Adds several command names to the pre-authentication allowlist.
    #[must_use]
    pub fn public_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.public_commands
            .extend(commands.into_iter().map(Into::into));
        self
    }

    /// Sets the identity-verification collaborator. Mandatory.
    #[inline]
    #[must_use]
    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Sets the command handler table.
    #[inline]
    #[must_use]
    pub fn actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Some(Arc::new(actions));
        self
    }

    /// Sets a custom handler resolver in place of an [`ActionRegistry`].
    #[inline]
    #[must_use]
    pub fn action_resolver(mut self, resolver: Arc<dyn ActionResolver>) -> Self {
        self.actions = Some(resolver);
        self
    }

    /// Sets the last-connection-closed notification callback.
    ///
    /// Invoked exactly once when a user's final connection closes.
    #[inline]
    #[must_use]
    pub fn on_last_connection_closed(
        mut self,
        callback: impl Fn(&User) + Send + Sync + 'static,
    ) -> Self {
        self.on_last_connection_closed = Some(Arc::new(callback));
        self
    }

    /// Sets the liveness probe interval (default: 30s).
    #[inline]
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the default expiry for pending reply listeners (default: 30s).
    #[inline]
    #[must_use]
    pub fn correlation_timeout(mut self, timeout: Duration) -> Self {
        self.correlation_timeout = timeout;
        self
    }

    /// Validates the configuration and binds the server.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no authenticator was supplied
    /// - [`Error::Io`] if binding the listener fails
    pub async fn bind(self) -> Result<Server> {
        let config = self.validate()?;
        Server::bind(config).await
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ServerBuilder {
    /// Validates the builder into a concrete configuration.
    fn validate(self) -> Result<ServerConfig> {
        let authenticator = self.authenticator.ok_or_else(|| {
            Error::config(
                "An authenticator is required. Use .authenticator() to set it.\n\
                 Example: Server::builder().authenticator(MyAuth)",
            )
        })?;

        let actions = self
            .actions
            .unwrap_or_else(|| Arc::new(ActionRegistry::new()));

        Ok(ServerConfig {
            ip: self.ip,
            port: self.port,
            public_commands: self.public_commands,
            authenticator,
            actions,
            on_last_connection_closed: self.on_last_connection_closed,
            heartbeat_interval: self.heartbeat_interval,
            correlation_timeout: self.correlation_timeout,
        })
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

/// Validated server configuration.
pub(crate) struct ServerConfig {
    pub(crate) ip: IpAddr,
    pub(crate) port: u16,
    pub(crate) public_commands: Vec<String>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) actions: Arc<dyn ActionResolver>,
    pub(crate) on_last_connection_closed: Option<LastConnectionClosed>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) correlation_timeout: Duration,
}

// ============================================================================
// Tests
// ============================================================================
