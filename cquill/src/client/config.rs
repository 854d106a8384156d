//! Session configuration: contact points, protocol options, pooling
//! thresholds and the pluggable policies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::cluster::KnownNode;
use crate::frame::ProtocolVersion;
use crate::network::connection::{ConnectionConfig, ConnectionFactory};
use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, RoundRobinPolicy};

/// Plain-text credentials sent when the server demands authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy)]
struct DistanceSettings {
    core_connections: usize,
    max_connections: usize,
    min_simultaneous_requests: usize,
    max_simultaneous_requests: usize,
}

const IGNORED_SETTINGS: DistanceSettings = DistanceSettings {
    core_connections: 0,
    max_connections: 0,
    min_simultaneous_requests: 0,
    max_simultaneous_requests: 0,
};

/// Pooling thresholds keyed by host distance. Pure configuration; the
/// session core reads it on every pool walk.
#[derive(Debug, Clone)]
pub struct PoolingOptions {
    local: DistanceSettings,
    remote: DistanceSettings,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        PoolingOptions {
            local: DistanceSettings {
                core_connections: 2,
                max_connections: 8,
                min_simultaneous_requests: 25,
                max_simultaneous_requests: 100,
            },
            remote: DistanceSettings {
                core_connections: 1,
                max_connections: 2,
                min_simultaneous_requests: 25,
                max_simultaneous_requests: 100,
            },
        }
    }
}

impl PoolingOptions {
    fn settings(&self, distance: HostDistance) -> &DistanceSettings {
        match distance {
            HostDistance::Local => &self.local,
            HostDistance::Remote => &self.remote,
            HostDistance::Ignored => &IGNORED_SETTINGS,
        }
    }

    fn settings_mut(&mut self, distance: HostDistance) -> Option<&mut DistanceSettings> {
        match distance {
            HostDistance::Local => Some(&mut self.local),
            HostDistance::Remote => Some(&mut self.remote),
            HostDistance::Ignored => None,
        }
    }

    /// Pool size the session keeps without parking surplus connections.
    pub fn core_connections_per_host(&self, distance: HostDistance) -> usize {
        self.settings(distance).core_connections
    }

    /// Hard cap enforced by the connection counter.
    pub fn max_connections_per_host(&self, distance: HostDistance) -> usize {
        self.settings(distance).max_connections
    }

    /// At or below this many in-flight requests a surplus connection is
    /// considered idle enough to park.
    pub fn min_simultaneous_requests_per_connection_threshold(
        &self,
        distance: HostDistance,
    ) -> usize {
        self.settings(distance).min_simultaneous_requests
    }

    /// At or above this many in-flight requests a connection is busy and
    /// skipped.
    pub fn max_simultaneous_requests_per_connection_threshold(
        &self,
        distance: HostDistance,
    ) -> usize {
        self.settings(distance).max_simultaneous_requests
    }

    pub fn set_core_connections_per_host(&mut self, distance: HostDistance, value: usize) {
        if let Some(settings) = self.settings_mut(distance) {
            settings.core_connections = value;
        }
    }

    pub fn set_max_connections_per_host(&mut self, distance: HostDistance, value: usize) {
        if let Some(settings) = self.settings_mut(distance) {
            settings.max_connections = value;
        }
    }

    pub fn set_min_simultaneous_requests_per_connection_threshold(
        &mut self,
        distance: HostDistance,
        value: usize,
    ) {
        if let Some(settings) = self.settings_mut(distance) {
            settings.min_simultaneous_requests = value;
        }
    }

    pub fn set_max_simultaneous_requests_per_connection_threshold(
        &mut self,
        distance: HostDistance,
        value: usize,
    ) {
        if let Some(settings) = self.settings_mut(distance) {
            settings.max_simultaneous_requests = value;
        }
    }
}

/// Receives session lifecycle notifications.
pub trait SessionListener: Send + Sync {
    /// Fired once, on the first successful handshake.
    fn on_ready(&self, _session_id: Uuid) {}

    /// Fired when the session becomes permanently unusable.
    fn on_defunct(&self, _session_id: Uuid) {}
}

/// Configuration for a new [`Session`](crate::Session).
#[derive(Clone)]
pub struct SessionConfig {
    /// Contact points used to build the initial cluster view.
    pub known_nodes: Vec<KnownNode>,
    pub protocol_version: ProtocolVersion,
    pub credentials: Option<Credentials>,
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub pooling: PoolingOptions,
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
    /// How long a parked connection survives in the trashcan.
    pub trashcan_ttl: Duration,
    pub trashcan_sweep_interval: Duration,
    /// Consecutive handshake failures tolerated per host before the host
    /// is taken out of rotation.
    pub reconnect_limit: u32,
    pub listener: Option<Arc<dyn SessionListener>>,

    pub(crate) connection_factory: Option<Arc<dyn ConnectionFactory>>,
}

impl SessionConfig {
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            protocol_version: ProtocolVersion::default(),
            credentials: None,
            load_balancing: Arc::new(RoundRobinPolicy::new()),
            pooling: PoolingOptions::default(),
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            trashcan_ttl: Duration::from_secs(10),
            trashcan_sweep_interval: Duration::from_secs(1),
            reconnect_limit: 3,
            listener: None,
            connection_factory: None,
        }
    }

    /// Adds a known node with a hostname or an address string.
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_owned()));
    }

    /// Adds a known node with an IP address and port.
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(KnownNode::Address(node_addr));
    }

    pub(crate) fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            version: self.protocol_version,
            credentials: self.credentials.clone(),
            connect_timeout: self.connect_timeout,
            tcp_nodelay: self.tcp_nodelay,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}
