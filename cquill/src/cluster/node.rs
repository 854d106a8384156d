//! Node represents a cluster host along with its topology facts.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::net::lookup_host;
use tracing::warn;
use uuid::Uuid;

use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy};

/// Default CQL native-protocol port, used when a hostname resolves
/// without one.
const DEFAULT_PORT: u16 = 9042;

/// A cluster host: endpoint plus topology facts and a liveness flag.
///
/// Nodes are created and updated by the topology refresher; the session
/// references them by shared ownership and only reads them.
#[derive(Debug)]
pub struct Node {
    /// Unique identifier of the node.
    pub host_id: Uuid,
    /// Address the driver connects to; doubles as the pool key.
    pub address: SocketAddr,
    /// Datacenter of the node, if known.
    pub datacenter: Option<String>,
    /// Rack of the node, if known.
    pub rack: Option<String>,

    up: AtomicBool,
}

impl Node {
    pub fn new(address: SocketAddr, datacenter: Option<String>, rack: Option<String>) -> Self {
        Node {
            host_id: Uuid::new_v4(),
            address,
            datacenter,
            rack,
            up: AtomicBool::new(true),
        }
    }

    /// Cheap liveness hint maintained by the topology refresher. This is
    /// not a network check; the plan walk uses it to skip hosts that are
    /// known to be down.
    pub fn is_considerably_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    /// Distance of this host under `policy`; selects its pooling
    /// thresholds.
    pub fn distance(&self, policy: &dyn LoadBalancingPolicy) -> HostDistance {
        policy.distance(self)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host_id == other.host_id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id.hash(state);
    }
}

/// Describes a database server known on session startup.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname, resolved on session creation.
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

#[derive(Error, Debug)]
pub(crate) enum DnsLookupError {
    #[error("Empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

// Resolve the given hostname using a DNS lookup if necessary.
// The resolution may return multiple IPs and the function returns one of
// them. It prefers to return IPv4s first, and only if there are none, IPv6s.
pub(crate) async fn resolve_hostname(hostname: &str) -> Result<SocketAddr, DnsLookupError> {
    // `lookup_host` expects a "hostname:port" pair; a bare hostname fails
    // immediately, in which case retry with the default port appended.
    let addrs: Vec<SocketAddr> = match lookup_host(hostname).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => lookup_host((hostname, DEFAULT_PORT))
            .await
            .map_err(|_| DnsLookupError::IoError(e))?
            .collect(),
    };

    addrs
        .iter()
        .find(|addr| matches!(addr, SocketAddr::V4(_)))
        .or_else(|| addrs.last())
        .copied()
        .ok_or_else(|| DnsLookupError::EmptyAddressListForHost(hostname.to_owned()))
}

/// Transforms the given [`KnownNode`]s into resolved contact points.
/// Hostnames that fail to resolve are logged and skipped.
pub(crate) async fn resolve_contact_points(known_nodes: &[KnownNode]) -> Vec<SocketAddr> {
    let mut contact_points = Vec::with_capacity(known_nodes.len());

    for node in known_nodes {
        match node {
            KnownNode::Address(address) => contact_points.push(*address),
            KnownNode::Hostname(hostname) => match resolve_hostname(hostname).await {
                Ok(address) => contact_points.push(address),
                Err(e) => warn!("Hostname resolution failed for {}: {}", hostname, &e),
            },
        }
    }

    contact_points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_compare_by_host_id() {
        let addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let a = Node::new(addr, None, None);
        let b = Node::new(addr, None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn up_flag_starts_true_and_toggles() {
        let node = Node::new("127.0.0.1:9042".parse().unwrap(), None, None);
        assert!(node.is_considerably_up());
        node.set_up(false);
        assert!(!node.is_considerably_up());
    }
}
