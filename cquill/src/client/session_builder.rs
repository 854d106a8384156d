//! SessionBuilder provides an easy way to create new sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::client::config::{Credentials, PoolingOptions, SessionConfig, SessionListener};
use crate::client::session::Session;
use crate::errors::NewSessionError;
use crate::frame::ProtocolVersion;
use crate::policies::load_balancing::LoadBalancingPolicy;

/// SessionBuilder is used to create new Session instances.
///
/// # Example
///
/// ```rust,no_run
/// # use cquill::{Session, SessionBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .known_node("db2.example.com")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// Creates new SessionBuilder with default configuration.
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Adds a known node with a hostname or an address string.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Adds a known node with an IP address and port.
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Selects the CQL binary-protocol version to speak.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Sets plain-text authentication credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Replaces the load balancing policy.
    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing = policy;
        self
    }

    /// Replaces the pooling thresholds.
    pub fn pooling_options(mut self, pooling: PoolingOptions) -> Self {
        self.config.pooling = pooling;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// How many consecutive handshake failures a host survives before it
    /// is taken out of rotation.
    pub fn reconnect_limit(mut self, limit: u32) -> Self {
        self.config.reconnect_limit = limit;
        self
    }

    /// How long a surplus connection stays recyclable before the sweep
    /// closes it.
    pub fn trashcan_ttl(mut self, ttl: Duration) -> Self {
        self.config.trashcan_ttl = ttl;
        self
    }

    /// Registers a lifecycle listener.
    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.config.listener = Some(listener);
        self
    }

    /// Builds the session and performs the warm-up connect to the first
    /// viable host.
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        let session = Session::new(self.config.clone()).await?;
        session.init().await?;
        Ok(session)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
