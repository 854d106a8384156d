use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::client::config::{SessionConfig, SessionListener};
use crate::client::session::Session;
use crate::cluster::{ClusterView, Node};
use crate::errors::{ConnectionPoolError, QueryError};
use crate::frame::response::CqlResult;
use crate::frame::ProtocolVersion;
use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, QueryPlan};
use crate::statement::Query;
use crate::utils::test_utils::{
    mock_session_config, setup_tracing, wait_until, MockBehavior, MockConnectionFactory,
};

fn addr(host: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, host], port))
}

/// Yields hosts in cluster order on every plan; keeps multi-host walks
/// deterministic where the round-robin rotation would not be.
#[derive(Debug)]
struct StaticOrderPolicy;

impl LoadBalancingPolicy for StaticOrderPolicy {
    fn new_query_plan<'a>(
        &self,
        _statement: Option<&Query>,
        cluster: &'a ClusterView,
    ) -> QueryPlan<'a> {
        Box::new(cluster.nodes().iter().cloned())
    }

    fn distance(&self, _node: &Node) -> HostDistance {
        HostDistance::Local
    }

    fn name(&self) -> String {
        "StaticOrderPolicy".to_string()
    }
}

#[derive(Default)]
struct FlagListener {
    ready_fired: AtomicBool,
    defunct_fired: AtomicBool,
}

impl SessionListener for FlagListener {
    fn on_ready(&self, _session_id: Uuid) {
        self.ready_fired.store(true, Ordering::SeqCst);
    }

    fn on_defunct(&self, _session_id: Uuid) {
        self.defunct_fired.store(true, Ordering::SeqCst);
    }
}

async fn new_session(config: SessionConfig) -> Session {
    Session::new(config).await.unwrap()
}

/// A one-shot plan over the session's current cluster view.
fn plan_for(session: &Session) -> QueryPlan<'static> {
    let nodes: Vec<Arc<Node>> = session.cluster_view().nodes().to_vec();
    Box::new(nodes.into_iter())
}

#[tokio::test]
async fn cold_start_single_host() {
    setup_tracing();
    let endpoint = addr(1, 9042);
    let factory = Arc::new(MockConnectionFactory::new());
    let session = new_session(mock_session_config(factory.clone(), &[endpoint])).await;

    assert!(session.empty());

    let result = session
        .query("SELECT cluster_name FROM system.local")
        .await
        .unwrap();
    assert!(matches!(result.result(), CqlResult::Void));

    assert_eq!(session.counter(endpoint), 1);
    assert_eq!(session.size(), 1);
    assert!(!session.empty());
    assert_eq!(factory.open_attempts(), 1);
    assert!(session.ready());
    assert!(!session.defunct());
}

#[tokio::test]
async fn init_warm_up_connects_and_releases_the_stream() {
    setup_tracing();
    let endpoint = addr(1, 9042);
    let factory = Arc::new(MockConnectionFactory::new());
    let session = new_session(mock_session_config(factory.clone(), &[endpoint])).await;

    session.init().await.unwrap();

    assert_eq!(session.size(), 1);
    assert_eq!(factory.open_attempts(), 1);
    let conns = session.pool_connections(endpoint);
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].in_flight(), 0);
}

#[tokio::test]
async fn busy_connection_makes_the_walk_allocate_a_second() {
    setup_tracing();
    let endpoint = addr(1, 9042);
    let factory = Arc::new(MockConnectionFactory::new());
    let mut config = mock_session_config(factory.clone(), &[endpoint]);
    config
        .pooling
        .set_max_simultaneous_requests_per_connection_threshold(HostDistance::Local, 32);
    config
        .pooling
        .set_max_connections_per_host(HostDistance::Local, 2);
    let session = new_session(config).await;

    session.init().await.unwrap();
    let conn = session.pool_connections(endpoint).pop().unwrap();

    // Saturate the first connection right up to the busy boundary
    // (inclusive: in_flight == threshold means busy).
    let streams: Vec<_> = (0..32).map(|_| conn.acquire_stream().unwrap()).collect();
    assert!(conn.is_busy(32));

    session.query("SELECT 1").await.unwrap();

    assert_eq!(session.counter(endpoint), 2);
    assert_eq!(session.size(), 2);
    assert_eq!(factory.open_attempts(), 2);

    // One slot below the boundary the connection is usable again: no
    // further allocation happens.
    conn.release_stream(streams[0]);
    session.query("SELECT 1").await.unwrap();
    assert_eq!(factory.open_attempts(), 2);
    assert_eq!(session.counter(endpoint), 2);
}

#[tokio::test]
async fn surplus_idle_connection_parks_then_recycles() {
    setup_tracing();
    let endpoint = addr(1, 9042);
    let factory = Arc::new(MockConnectionFactory::new());
    let mut config = mock_session_config(factory.clone(), &[endpoint]);
    config
        .pooling
        .set_max_simultaneous_requests_per_connection_threshold(HostDistance::Local, 1);
    config
        .pooling
        .set_min_simultaneous_requests_per_connection_threshold(HostDistance::Local, 4);
    config
        .pooling
        .set_core_connections_per_host(HostDistance::Local, 1);
    let session = new_session(config).await;

    // Two connections: the first is busy (threshold 1) while the second
    // walk runs, forcing an allocation.
    let (c1, s1) = session.connect(plan_for(&session)).await.unwrap();
    let (c2, s2) = session.connect(plan_for(&session)).await.unwrap();
    assert_eq!(session.counter(endpoint), 2);
    assert_eq!(session.size(), 2);
    assert_eq!(factory.open_attempts(), 2);

    c1.release_stream(s1);
    c2.release_stream(s2);

    // Both are idle now and the pool exceeds its core size: the walk
    // picks one and parks the other in the trashcan.
    let (c3, s3) = session.connect(plan_for(&session)).await.unwrap();
    assert_eq!(session.size(), 1);
    assert_eq!(session.parked(endpoint), 1);
    assert_eq!(session.counter(endpoint), 2);
    assert_eq!(factory.open_attempts(), 2);
    c3.release_stream(s3);

    // Kill the remaining active connection; the next walk evicts it,
    // then recycles the parked one instead of opening a fresh socket.
    c3.close();
    wait_until(|| !c3.is_healthy()).await;

    let (c4, s4) = session.connect(plan_for(&session)).await.unwrap();
    assert!(c4.is_healthy());
    assert_eq!(session.size(), 1);
    assert_eq!(session.parked(endpoint), 0);
    assert_eq!(session.counter(endpoint), 1);
    assert_eq!(factory.open_attempts(), 2); // no new handshake
    c4.release_stream(s4);
}

#[tokio::test]
async fn trashcan_sweep_closes_and_decrements() {
    setup_tracing();
    let endpoint = addr(1, 9042);
    let factory = Arc::new(MockConnectionFactory::new());
    let mut config = mock_session_config(factory.clone(), &[endpoint]);
    config.trashcan_ttl = Duration::ZERO;
    config
        .pooling
        .set_max_simultaneous_requests_per_connection_threshold(HostDistance::Local, 1);
    config
        .pooling
        .set_core_connections_per_host(HostDistance::Local, 1);
    let session = new_session(config).await;

    let (c1, s1) = session.connect(plan_for(&session)).await.unwrap();
    let (c2, s2) = session.connect(plan_for(&session)).await.unwrap();
    c1.release_stream(s1);
    c2.release_stream(s2);

    let (c3, s3) = session.connect(plan_for(&session)).await.unwrap();
    c3.release_stream(s3);
    assert_eq!(session.parked(endpoint), 1);
    assert_eq!(session.counter(endpoint), 2);

    // The ttl is zero, so the parked entry is already expired.
    session.trashcan_sweep_now();
    assert_eq!(session.parked(endpoint), 0);
    assert_eq!(session.counter(endpoint), 1);
    assert_eq!(session.size(), 1);
}

#[tokio::test]
async fn all_hosts_down_yields_no_host_available_with_empty_tried() {
    setup_tracing();
    let endpoints = [addr(1, 9042), addr(2, 9042)];
    let factory = Arc::new(MockConnectionFactory::new());
    let session = new_session(mock_session_config(factory.clone(), &endpoints)).await;

    for node in session.cluster_view().nodes() {
        node.set_up(false);
    }

    let err = session.query("SELECT 1").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "could not obtain viable client from the pool."
    );
    match err {
        QueryError::Pool(ConnectionPoolError::NoHostAvailable { tried }) => {
            assert!(tried.is_empty());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(factory.open_attempts(), 0);
}

#[tokio::test]
async fn failing_handshakes_report_all_tried_hosts() {
    setup_tracing();
    let endpoints = [addr(1, 9042), addr(2, 9042)];
    let factory = Arc::new(MockConnectionFactory::new());
    factory.set_behavior(endpoints[0], MockBehavior::RefuseConnect);
    factory.set_behavior(endpoints[1], MockBehavior::RefuseConnect);

    let mut config = mock_session_config(factory.clone(), &endpoints);
    config.load_balancing = Arc::new(StaticOrderPolicy);
    let session = new_session(config).await;

    let err = session.query("SELECT 1").await.unwrap_err();
    match err {
        QueryError::Pool(ConnectionPoolError::NoHostAvailable { tried }) => {
            assert_eq!(tried, endpoints.to_vec());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(factory.open_attempts(), 2);
    // Both reservations were rolled back.
    assert_eq!(session.counter(endpoints[0]), 0);
    assert_eq!(session.counter(endpoints[1]), 0);
}

#[tokio::test]
async fn cap_reached_mid_walk_moves_to_the_next_host() {
    setup_tracing();
    let endpoints = [addr(1, 9042), addr(2, 9042)];
    let factory = Arc::new(MockConnectionFactory::new());
    let mut config = mock_session_config(factory.clone(), &endpoints);
    config.load_balancing = Arc::new(StaticOrderPolicy);
    config
        .pooling
        .set_max_connections_per_host(HostDistance::Local, 1);
    config
        .pooling
        .set_max_simultaneous_requests_per_connection_threshold(HostDistance::Local, 1);
    let session = new_session(config).await;

    // First walk lands on host A and keeps its only connection busy.
    let (c1, _s1) = session.connect(plan_for(&session)).await.unwrap();
    assert_eq!(c1.endpoint(), endpoints[0]);

    // Host A is at its cap with every connection busy: the cap rejection
    // stays internal and the walk succeeds on host B.
    let (c2, s2) = session.connect(plan_for(&session)).await.unwrap();
    assert_eq!(c2.endpoint(), endpoints[1]);
    assert_eq!(session.counter(endpoints[0]), 1);
    assert_eq!(session.counter(endpoints[1]), 1);
    assert_eq!(factory.open_attempts(), 2);
    c2.release_stream(s2);
}

#[tokio::test]
async fn allocation_succeeds_one_below_cap_and_fails_at_cap() {
    setup_tracing();
    let endpoint = addr(1, 9042);
    let factory = Arc::new(MockConnectionFactory::new());
    let mut config = mock_session_config(factory.clone(), &[endpoint]);
    config
        .pooling
        .set_max_connections_per_host(HostDistance::Local, 2);
    config
        .pooling
        .set_max_simultaneous_requests_per_connection_threshold(HostDistance::Local, 1);
    let session = new_session(config).await;

    // counter 0 -> 1 -> 2 through two allocations; both below the cap.
    let (_c1, _s1) = session.connect(plan_for(&session)).await.unwrap();
    let (_c2, _s2) = session.connect(plan_for(&session)).await.unwrap();
    assert_eq!(session.counter(endpoint), 2);

    // At the cap the walk has nowhere to go.
    let err = session.connect(plan_for(&session)).await.unwrap_err();
    let ConnectionPoolError::NoHostAvailable { tried } = err;
    assert_eq!(tried, vec![endpoint]);
    assert_eq!(session.counter(endpoint), 2);
    assert_eq!(factory.open_attempts(), 2);
}

#[tokio::test]
async fn ready_latch_fires_listener_once() {
    setup_tracing();
    let endpoint = addr(1, 9042);
    let factory = Arc::new(MockConnectionFactory::new());
    let listener = Arc::new(FlagListener::default());
    let mut config = mock_session_config(factory.clone(), &[endpoint]);
    config.listener = Some(listener.clone());
    let session = new_session(config).await;

    assert!(!session.ready());
    session.init().await.unwrap();
    assert!(session.ready());
    assert!(listener.ready_fired.load(Ordering::SeqCst));
    assert!(!listener.defunct_fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn session_goes_defunct_when_every_host_exceeds_reconnect_limit() {
    setup_tracing();
    let endpoints = [addr(1, 9042), addr(2, 9042)];
    let factory = Arc::new(MockConnectionFactory::new());
    factory.set_behavior(endpoints[0], MockBehavior::RefuseConnect);
    factory.set_behavior(endpoints[1], MockBehavior::RejectStartup);

    let listener = Arc::new(FlagListener::default());
    let mut config = mock_session_config(factory.clone(), &endpoints);
    config.load_balancing = Arc::new(StaticOrderPolicy);
    config.reconnect_limit = 0;
    config.listener = Some(listener.clone());
    let session = new_session(config).await;

    let err = session.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, QueryError::Pool(_)));

    assert!(session.defunct());
    assert!(!session.ready());
    assert!(listener.defunct_fired.load(Ordering::SeqCst));

    // Hosts over their limit are out of rotation: nothing is tried.
    let err = session.query("SELECT 1").await.unwrap_err();
    match err {
        QueryError::Pool(ConnectionPoolError::NoHostAvailable { tried }) => {
            assert!(tried.is_empty())
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(factory.open_attempts(), 2);
}

#[tokio::test]
async fn close_shuts_every_pooled_connection() {
    setup_tracing();
    let endpoint = addr(1, 9042);
    let factory = Arc::new(MockConnectionFactory::new());
    let mut config = mock_session_config(factory.clone(), &[endpoint]);
    config
        .pooling
        .set_max_simultaneous_requests_per_connection_threshold(HostDistance::Local, 1);
    let session = new_session(config).await;

    let (_c1, _s1) = session.connect(plan_for(&session)).await.unwrap();
    let (_c2, _s2) = session.connect(plan_for(&session)).await.unwrap();
    assert_eq!(session.size(), 2);

    session.close();

    let conns = session.pool_connections(endpoint);
    wait_until(|| conns.iter().all(|conn| !conn.is_healthy())).await;
    // Teardown does not touch the counters.
    assert_eq!(session.counter(endpoint), 2);
}

#[tokio::test]
async fn queries_run_under_every_protocol_version() {
    setup_tracing();
    for version in [
        ProtocolVersion::V1,
        ProtocolVersion::V2,
        ProtocolVersion::V3,
    ] {
        let endpoint = addr(1, 9042);
        let factory = Arc::new(MockConnectionFactory::new());
        let mut config = mock_session_config(factory.clone(), &[endpoint]);
        config.protocol_version = version;
        let session = new_session(config).await;

        let result = session.query("SELECT 1").await.unwrap();
        assert!(matches!(result.result(), CqlResult::Void));

        let prepared = session.prepare("SELECT a FROM t WHERE pk = ?").await.unwrap();
        let result = session.execute(&prepared).await.unwrap();
        assert!(matches!(result.result(), CqlResult::Void));
    }
}

#[tokio::test]
async fn counter_equals_active_plus_parked_throughout() {
    setup_tracing();
    let endpoint = addr(1, 9042);
    let factory = Arc::new(MockConnectionFactory::new());
    let mut config = mock_session_config(factory.clone(), &[endpoint]);
    config
        .pooling
        .set_max_simultaneous_requests_per_connection_threshold(HostDistance::Local, 1);
    config
        .pooling
        .set_core_connections_per_host(HostDistance::Local, 1);
    let session = new_session(config).await;

    let check = |session: &Session| {
        assert_eq!(
            session.counter(endpoint),
            session.size() + session.parked(endpoint)
        );
    };

    check(&session);
    let (c1, s1) = session.connect(plan_for(&session)).await.unwrap();
    check(&session);
    let (c2, s2) = session.connect(plan_for(&session)).await.unwrap();
    check(&session);

    c1.release_stream(s1);
    c2.release_stream(s2);
    let (c3, s3) = session.connect(plan_for(&session)).await.unwrap();
    check(&session); // one active, one parked
    c3.release_stream(s3);

    session.trashcan_sweep_now(); // ttl is long: nothing should expire
    check(&session);
    assert_eq!(session.parked(endpoint), 1);
}
