//! `Session` multiplexes many concurrent requests onto a bounded pool of
//! connections per host.
//!
//! Each request walks a query plan produced by the load balancing policy.
//! For every candidate host the session tries, in order: a free stream on
//! an already-open connection, a connection recycled from the trashcan,
//! and finally a fresh connection - the only step that pays for a TCP
//! handshake and a counter reservation. Surplus idle connections found
//! along the way are parked in the trashcan rather than closed, because
//! parking is reversible up until the sweep.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::RemoteHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::config::SessionConfig;
use crate::cluster::node::resolve_contact_points;
use crate::cluster::{ClusterView, KnownNode, Node};
use crate::errors::{
    AllocateConnectionError, ConnectionPoolError, NewSessionError, QueryError,
};
use crate::frame::StreamId;
use crate::network::connection::{
    Connection, ConnectionConfig, ConnectionFactory, QueryResult, TcpConnectionFactory,
};
use crate::network::pool::{ConnectionCounters, HostPool, Trashcan};
use crate::policies::load_balancing::{HostDistance, QueryPlan};
use crate::statement::{PreparedStatement, Query};

/// The driver's client of the cluster. Owns the per-host connection
/// pools, the trashcan and the connection counters.
///
/// A session is single-use: after [`close`](Session::close) its behaviour
/// is undefined and a new session must be created.
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    connection_config: ConnectionConfig,
    connection_factory: Arc<dyn ConnectionFactory>,

    cluster: ArcSwap<ClusterView>,

    connection_pool: DashMap<SocketAddr, HostPool>,
    connection_counters: Arc<ConnectionCounters>,
    trashcan: Arc<Trashcan>,

    /// Consecutive handshake failures per endpoint; reset on success.
    connect_errors: DashMap<SocketAddr, u32>,

    ready: AtomicBool,
    defunct: AtomicBool,

    _sweeper_handle: RemoteHandle<()>,
}

impl Session {
    /// Creates a session: resolves the contact points and starts the
    /// trashcan sweeper. No connection is opened yet; call
    /// [`init`](Session::init) to fail fast on bad configuration.
    pub async fn new(config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let contact_points = resolve_contact_points(&config.known_nodes).await;
        if contact_points.is_empty() {
            let hostnames = config
                .known_nodes
                .iter()
                .filter_map(|node| match node {
                    KnownNode::Hostname(hostname) => Some(hostname.clone()),
                    KnownNode::Address(_) => None,
                })
                .collect();
            return Err(NewSessionError::FailedToResolveAnyHostname(hostnames));
        }

        let nodes = contact_points
            .into_iter()
            .map(|address| Arc::new(Node::new(address, None, None)))
            .collect();

        let connection_counters = Arc::new(ConnectionCounters::new());
        let trashcan = Arc::new(Trashcan::new(config.trashcan_ttl));

        let sweeper_handle = Session::spawn_sweeper(
            trashcan.clone(),
            connection_counters.clone(),
            config.trashcan_sweep_interval,
        );

        let connection_factory = config
            .connection_factory
            .clone()
            .unwrap_or_else(|| Arc::new(TcpConnectionFactory));

        Ok(Session {
            id: Uuid::new_v4(),
            connection_config: config.connection_config(),
            connection_factory,
            config,
            cluster: ArcSwap::from_pointee(ClusterView::new(nodes)),
            connection_pool: DashMap::new(),
            connection_counters,
            trashcan,
            connect_errors: DashMap::new(),
            ready: AtomicBool::new(false),
            defunct: AtomicBool::new(false),
            _sweeper_handle: sweeper_handle,
        })
    }

    fn spawn_sweeper(
        trashcan: Arc<Trashcan>,
        counters: Arc<ConnectionCounters>,
        sweep_interval: std::time::Duration,
    ) -> RemoteHandle<()> {
        let (fut, handle) = async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                trashcan.sweep(&counters);
            }
        }
        .remote_handle();
        tokio::spawn(fut);
        handle
    }

    /// Warm-up connect to the first viable host, to surface configuration
    /// problems before the first real request. The acquired stream is
    /// released unused; the connection stays pooled.
    pub async fn init(&self) -> Result<(), NewSessionError> {
        let cluster = self.cluster.load_full();
        let plan = self.config.load_balancing.new_query_plan(None, &cluster);
        let (conn, stream) = self.connect(plan).await?;
        conn.release_stream(stream);
        Ok(())
    }

    /// Session-identifying UUID.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// True after the first successful handshake.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// True once every known host has exceeded its reconnect limit.
    /// Terminal.
    pub fn defunct(&self) -> bool {
        self.defunct.load(Ordering::SeqCst)
    }

    /// Number of connections in the active pools (the trashcan does not
    /// count).
    pub fn size(&self) -> usize {
        self.connection_pool
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// The current topology snapshot.
    pub fn cluster_view(&self) -> Arc<ClusterView> {
        self.cluster.load_full()
    }

    /// Installs a new topology snapshot. Called by an external topology
    /// refresher; existing pools for removed hosts are left to drain
    /// through health checks.
    pub fn update_cluster_view(&self, nodes: Vec<Arc<Node>>) {
        self.cluster.store(Arc::new(ClusterView::new(nodes)));
    }

    /// Runs an unprepared statement.
    pub async fn query(&self, query: impl Into<Query>) -> Result<QueryResult, QueryError> {
        let query = query.into();
        let (conn, stream) = self.get_connection().await?;
        conn.query(stream, &query).await
    }

    /// Prepares a statement on some host of the cluster.
    pub async fn prepare(
        &self,
        statement: impl AsRef<str>,
    ) -> Result<PreparedStatement, QueryError> {
        let (conn, stream) = self.get_connection().await?;
        conn.prepare(stream, statement.as_ref()).await
    }

    /// Runs a previously prepared statement.
    pub async fn execute(&self, prepared: &PreparedStatement) -> Result<QueryResult, QueryError> {
        let (conn, stream) = self.get_connection().await?;
        conn.execute(stream, prepared).await
    }

    /// Closes every connection in every pool. Counters are deliberately
    /// left alone: the session is being torn down, not rebalanced.
    pub fn close(&self) {
        info!(session_id = %self.id, "Closing session");
        for entry in self.connection_pool.iter() {
            for conn in entry.value().iter() {
                conn.value().close();
            }
        }
    }

    /// Obtains a viable connection with a reserved stream by walking a
    /// fresh query plan.
    async fn get_connection(&self) -> Result<(Arc<Connection>, StreamId), QueryError> {
        let cluster = self.cluster.load_full();
        let plan = self.config.load_balancing.new_query_plan(None, &cluster);
        self.connect(plan).await.map_err(QueryError::Pool)
    }

    /// The critical path: walks `plan` host by host until a connection
    /// with a reserved stream is obtained, or the plan is exhausted.
    pub(crate) async fn connect(
        &self,
        plan: QueryPlan<'_>,
    ) -> Result<(Arc<Connection>, StreamId), ConnectionPoolError> {
        let mut tried_hosts: Vec<SocketAddr> = Vec::new();

        for host in plan {
            if !host.is_considerably_up() {
                continue;
            }

            let endpoint = host.address;
            tried_hosts.push(endpoint);

            let distance = host.distance(self.config.load_balancing.as_ref());
            let pool = self.add_to_connection_pool(endpoint);

            if let Some((conn, stream)) = self.try_find_free_stream(&pool, distance) {
                return Ok((conn, stream));
            }

            let recycled = match self.trashcan.recycle(endpoint) {
                Some(conn) if !conn.is_healthy() => {
                    self.free_connection(&conn);
                    None
                }
                other => other,
            };

            let conn = match recycled {
                Some(conn) => conn,
                None => match self.allocate_connection(&host, distance).await {
                    Ok(conn) => conn,
                    Err(AllocateConnectionError::TooManyConnections { endpoint, limit }) => {
                        debug!(endpoint = %endpoint, limit, "Host is at its connection cap, moving on");
                        continue;
                    }
                    Err(AllocateConnectionError::Connect(e)) => {
                        warn!(endpoint = %endpoint, error = %e, "Failed to connect to host, moving on");
                        continue;
                    }
                },
            };

            pool.insert(conn.id(), conn.clone());
            match conn.acquire_stream() {
                Some(stream) => return Ok((conn, stream)),
                None => continue,
            }
        }

        Err(ConnectionPoolError::NoHostAvailable { tried: tried_hosts })
    }

    /// Lazily creates the pool entry for `endpoint`. Entry semantics make
    /// the insert-if-absent atomic; racing callers observe one surviving
    /// pool.
    fn add_to_connection_pool(&self, endpoint: SocketAddr) -> HostPool {
        self.connection_pool.entry(endpoint).or_default().clone()
    }

    /// Scans the host's pool for a connection with a free stream, doing
    /// housekeeping as it goes: unhealthy connections are evicted and
    /// freed, and once a stream has been secured, surplus idle
    /// connections are parked in the trashcan.
    fn try_find_free_stream(
        &self,
        pool: &HostPool,
        distance: HostDistance,
    ) -> Option<(Arc<Connection>, StreamId)> {
        let pooling = &self.config.pooling;
        let busy_threshold = pooling.max_simultaneous_requests_per_connection_threshold(distance);
        let free_threshold = pooling.min_simultaneous_requests_per_connection_threshold(distance);
        let core_connections = pooling.core_connections_per_host(distance);

        let mut picked: Option<(Arc<Connection>, StreamId)> = None;

        // Snapshot first: erasing entries of a DashMap while iterating it
        // would deadlock on the shard lock.
        let connections: Vec<(Uuid, Arc<Connection>)> = pool
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (conn_id, conn) in connections {
            if !conn.is_healthy() {
                if pool.remove(&conn_id).is_some() {
                    debug!(endpoint = %conn.endpoint(), id = %conn_id, "Evicting unhealthy connection");
                    self.free_connection(&conn);
                }
            } else if picked.is_none() && !conn.is_busy(busy_threshold) {
                if let Some(stream) = conn.acquire_stream() {
                    picked = Some((conn, stream));
                }
            } else if pool.len() > core_connections && conn.is_free(free_threshold) {
                // Surplus idle capacity is shed into the trashcan, not
                // closed: it may be wanted again shortly.
                if pool.remove(&conn_id).is_some() {
                    self.trashcan.put(conn);
                }
            }
        }

        picked
    }

    /// Reserves a counter slot and opens a fresh connection. The slot is
    /// reserved before the handshake and released again on failure, so
    /// the counter never under-reports connections being established.
    async fn allocate_connection(
        &self,
        host: &Arc<Node>,
        distance: HostDistance,
    ) -> Result<Arc<Connection>, AllocateConnectionError> {
        let endpoint = host.address;
        let limit = self.config.pooling.max_connections_per_host(distance);

        if !self.connection_counters.increase(endpoint, limit) {
            return Err(AllocateConnectionError::TooManyConnections { endpoint, limit });
        }

        match self
            .connection_factory
            .open(endpoint, &self.connection_config)
            .await
        {
            Ok(conn) => {
                self.connect_errors.remove(&endpoint);
                self.note_ready();
                Ok(Arc::new(conn))
            }
            Err(e) => {
                self.connection_counters.decrease(endpoint);
                self.note_connect_error(host);
                Err(e.into())
            }
        }
    }

    /// Closes a connection and retires its counter slot. Every path that
    /// takes a connection out of circulation for good goes through here.
    fn free_connection(&self, conn: &Arc<Connection>) {
        conn.close();
        self.connection_counters.decrease(conn.endpoint());
    }

    fn note_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.id, "Session ready: first connection established");
            if let Some(listener) = &self.config.listener {
                listener.on_ready(self.id);
            }
        }
    }

    fn note_connect_error(&self, host: &Arc<Node>) {
        let errors = {
            let mut entry = self.connect_errors.entry(host.address).or_insert(0);
            *entry += 1;
            *entry
        };

        if errors > self.config.reconnect_limit {
            error!(
                endpoint = %host.address,
                errors,
                "Host has reached its reconnect limit, removing from rotation"
            );
            host.set_up(false);
            self.check_defunct();
        } else {
            info!(endpoint = %host.address, errors, "Connect failed, host stays in rotation");
        }
    }

    fn check_defunct(&self) {
        let cluster = self.cluster.load();
        let any_up = cluster.all_nodes.iter().any(|node| node.is_considerably_up());
        if !any_up && !self.defunct.swap(true, Ordering::SeqCst) {
            self.ready.store(false, Ordering::SeqCst);
            error!(session_id = %self.id, "No live hosts remain, session is defunct");
            if let Some(listener) = &self.config.listener {
                listener.on_defunct(self.id);
            }
        }
    }
}

#[cfg(test)]
impl Session {
    pub(crate) fn counter(&self, endpoint: SocketAddr) -> usize {
        self.connection_counters.get(endpoint)
    }

    pub(crate) fn parked(&self, endpoint: SocketAddr) -> usize {
        self.trashcan.parked_count(endpoint)
    }

    pub(crate) fn pool_connections(&self, endpoint: SocketAddr) -> Vec<Arc<Connection>> {
        self.connection_pool
            .get(&endpoint)
            .map(|pool| pool.iter().map(|entry| entry.value().clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn trashcan_sweep_now(&self) {
        self.trashcan.sweep(&self.connection_counters);
    }
}
