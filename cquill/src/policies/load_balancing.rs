//! Load balancing policies.
//!
//! A policy produces a *query plan* - a one-shot ordered iterator of
//! candidate hosts - for every request, and classifies each host with a
//! [`HostDistance`] that keys the pooling thresholds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::cluster::{ClusterView, Node};
use crate::statement::Query;

/// Policy-assigned classification of a host, selecting its pooling
/// thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDistance {
    Local,
    Remote,
    /// The host is not to be pooled at all.
    Ignored,
}

/// A one-shot ordered iterator of candidate hosts for a single request.
/// The session consumes it until a viable connection is found or the
/// plan is exhausted; plans are never restarted.
pub type QueryPlan<'a> = Box<dyn Iterator<Item = Arc<Node>> + Send + Sync + 'a>;

/// Policy that decides which hosts to contact for each request.
pub trait LoadBalancingPolicy: Send + Sync {
    /// Produces a fresh plan for one request. `statement` is available
    /// for policies that route on statement properties; the built-in
    /// policies ignore it.
    fn new_query_plan<'a>(
        &self,
        statement: Option<&Query>,
        cluster: &'a ClusterView,
    ) -> QueryPlan<'a>;

    /// Classifies a host under this policy.
    fn distance(&self, node: &Node) -> HostDistance;

    /// Returns the name of the load balancing policy.
    fn name(&self) -> String;
}

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// A Round-robin load balancing policy.
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn new_query_plan<'a>(
        &self,
        _statement: Option<&Query>,
        cluster: &'a ClusterView,
    ) -> QueryPlan<'a> {
        let index = self.index.fetch_add(1, ORDER_TYPE);

        let nodes_count = cluster.all_nodes.len();
        let rotation = compute_rotation(index, nodes_count);
        let rotated_nodes = slice_rotated_left(&cluster.all_nodes, rotation).cloned();

        Box::new(rotated_nodes)
    }

    fn distance(&self, _node: &Node) -> HostDistance {
        HostDistance::Local
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

/// A data-center aware Round-robin load balancing policy: local-DC hosts
/// first, round-robin within each tier.
pub struct DcAwareRoundRobinPolicy {
    index: AtomicUsize,
    local_dc: String,
    include_remote_nodes: bool,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: String) -> Self {
        Self {
            index: AtomicUsize::new(0),
            local_dc,
            include_remote_nodes: true,
        }
    }

    pub fn set_include_remote_nodes(&mut self, val: bool) {
        self.include_remote_nodes = val;
    }

    fn is_local_node(node: &Node, local_dc: &str) -> bool {
        node.datacenter.as_deref() == Some(local_dc)
    }

    fn retrieve_local_nodes<'a>(&self, cluster: &'a ClusterView) -> &'a [Arc<Node>] {
        cluster
            .datacenters
            .get(&self.local_dc)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn retrieve_remote_nodes<'a>(
        &self,
        cluster: &'a ClusterView,
    ) -> impl Iterator<Item = Arc<Node>> + Clone + 'a {
        // local_dc is moved into filter closure so clone is needed
        let local_dc = self.local_dc.clone();

        cluster
            .all_nodes
            .iter()
            .cloned()
            .filter(move |node| !DcAwareRoundRobinPolicy::is_local_node(node, &local_dc))
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn new_query_plan<'a>(
        &self,
        _statement: Option<&Query>,
        cluster: &'a ClusterView,
    ) -> QueryPlan<'a> {
        let index = self.index.fetch_add(1, ORDER_TYPE);

        let local_nodes = self.retrieve_local_nodes(cluster);
        let local_nodes_rotation = compute_rotation(index, local_nodes.len());
        let rotated_local_nodes = slice_rotated_left(local_nodes, local_nodes_rotation).cloned();

        if self.include_remote_nodes {
            let remote_nodes = self.retrieve_remote_nodes(cluster);
            let remote_nodes_count = cluster.all_nodes.len() - local_nodes.len();
            let remote_nodes_rotation = compute_rotation(index, remote_nodes_count);
            let rotated_remote_nodes = iter_rotated_left(remote_nodes, remote_nodes_rotation);
            trace!(local_dc = self.local_dc.as_str(), "DC Aware");
            Box::new(rotated_local_nodes.chain(rotated_remote_nodes))
        } else {
            Box::new(rotated_local_nodes)
        }
    }

    fn distance(&self, node: &Node) -> HostDistance {
        if DcAwareRoundRobinPolicy::is_local_node(node, &self.local_dc) {
            HostDistance::Local
        } else if self.include_remote_nodes {
            HostDistance::Remote
        } else {
            HostDistance::Ignored
        }
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}

// Does safe modulo
fn compute_rotation(index: usize, count: usize) -> usize {
    if count != 0 {
        index % count
    } else {
        0
    }
}

// similar to slice::rotate_left, but works on iterators
fn iter_rotated_left<'a, T>(
    iter: impl Iterator<Item = T> + Clone + 'a,
    mid: usize,
) -> impl Iterator<Item = T> + Clone + 'a {
    let begin = iter.clone().skip(mid);
    let end = iter.take(mid);
    begin.chain(end)
}

// similar to slice::rotate_left, but it returns an iterator, doesn't mutate input
fn slice_rotated_left<T>(slice: &[T], mid: usize) -> impl Iterator<Item = &T> + Clone + '_ {
    let begin = &slice[mid..];
    let end = &slice[..mid];
    begin.iter().chain(end.iter())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;

    #[test]
    fn test_slice_rotation() {
        let a = [1, 2, 3, 4, 5];
        let a_rotated = slice_rotated_left(&a, 2).cloned().collect::<Vec<i32>>();

        assert_eq!(vec![3, 4, 5, 1, 2], a_rotated);
    }

    #[test]
    fn test_iter_rotation() {
        let a = [1, 2, 3, 4, 5];
        let a_iter = a.iter().cloned();
        let a_rotated = iter_rotated_left(a_iter, 2).collect::<Vec<i32>>();

        assert_eq!(vec![3, 4, 5, 1, 2], a_rotated);
    }

    fn mock_cluster_view(nodes_recipe: &[(&str, u16)]) -> ClusterView {
        let all_nodes = nodes_recipe
            .iter()
            .map(|(dc, id)| {
                Arc::new(Node::new(
                    SocketAddr::from(([255, 255, 255, 255], *id)),
                    Some(dc.to_string()),
                    None,
                ))
            })
            .collect::<Vec<_>>();

        ClusterView::new(all_nodes)
    }

    fn get_plan_and_collect_node_identifiers(
        policy: &impl LoadBalancingPolicy,
        cluster: &ClusterView,
    ) -> Vec<u16> {
        let plan = policy.new_query_plan(None, cluster);
        plan.map(|node| node.address.port()).collect::<Vec<_>>()
    }

    #[test]
    fn test_round_robin_policy() {
        let nodes_recipe = [("eu", 1), ("eu", 2), ("us", 3), ("us", 4)];

        let cluster = mock_cluster_view(&nodes_recipe);
        let policy = RoundRobinPolicy::new();

        let plans = (0..5)
            .map(|_| get_plan_and_collect_node_identifiers(&policy, &cluster))
            .collect::<Vec<_>>();

        let expected_plans = vec![
            vec![1, 2, 3, 4],
            vec![2, 3, 4, 1],
            vec![3, 4, 1, 2],
            vec![4, 1, 2, 3],
            vec![1, 2, 3, 4],
        ];

        assert_eq!(plans, expected_plans);
    }

    #[test]
    fn test_dc_aware_round_robin_policy() {
        let nodes_recipe = [("eu", 1), ("eu", 2), ("eu", 3), ("us", 4), ("us", 5)];

        let cluster = mock_cluster_view(&nodes_recipe);
        let local_dc = "eu".to_string();
        let policy = DcAwareRoundRobinPolicy::new(local_dc);

        let plans = (0..4)
            .map(|_| get_plan_and_collect_node_identifiers(&policy, &cluster))
            .collect::<Vec<_>>();

        let expected_plans = vec![
            vec![1, 2, 3, 4, 5],
            vec![2, 3, 1, 5, 4],
            vec![3, 1, 2, 4, 5],
            vec![1, 2, 3, 5, 4],
        ];

        assert_eq!(plans, expected_plans);
    }

    #[test]
    fn test_dc_aware_distances() {
        let cluster = mock_cluster_view(&[("eu", 1), ("us", 2)]);
        let mut policy = DcAwareRoundRobinPolicy::new("eu".to_string());

        assert_eq!(
            policy.distance(&cluster.all_nodes[0]),
            HostDistance::Local
        );
        assert_eq!(
            policy.distance(&cluster.all_nodes[1]),
            HostDistance::Remote
        );

        policy.set_include_remote_nodes(false);
        assert_eq!(
            policy.distance(&cluster.all_nodes[1]),
            HostDistance::Ignored
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(RoundRobinPolicy::new().name(), "RoundRobinPolicy");
        assert_eq!(
            DcAwareRoundRobinPolicy::new("eu".to_string()).name(),
            "DcAwareRoundRobinPolicy"
        );
    }
}
