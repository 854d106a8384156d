//! A live view of cluster topology.
//!
//! The session holds the current [`ClusterView`] behind an `ArcSwap`; an
//! external topology refresher installs new views as the cluster changes.
//! Load balancing policies read the view to produce query plans.

pub mod node;

pub use node::{KnownNode, Node};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// An immutable snapshot of the known cluster members.
#[derive(Debug, Default)]
pub struct ClusterView {
    pub(crate) known_peers: HashMap<SocketAddr, Arc<Node>>,
    pub(crate) all_nodes: Vec<Arc<Node>>,
    pub(crate) datacenters: HashMap<String, Vec<Arc<Node>>>,
}

impl ClusterView {
    pub fn new(all_nodes: Vec<Arc<Node>>) -> Self {
        let known_peers = all_nodes
            .iter()
            .map(|node| (node.address, node.clone()))
            .collect();

        let mut datacenters: HashMap<String, Vec<Arc<Node>>> = HashMap::new();
        for node in &all_nodes {
            if let Some(dc) = &node.datacenter {
                datacenters.entry(dc.clone()).or_default().push(node.clone());
            }
        }

        ClusterView {
            known_peers,
            all_nodes,
            datacenters,
        }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.all_nodes
    }

    pub fn node_by_address(&self, address: &SocketAddr) -> Option<&Arc<Node>> {
        self.known_peers.get(address)
    }
}
