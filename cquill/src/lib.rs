//! Async client core for wide-column databases speaking the CQL native
//! protocol (versions 1-3) over long-lived TCP connections.
//!
//! The driver multiplexes many concurrent requests onto a bounded pool of
//! connections per host, keeps a live view of cluster topology, and picks
//! the next host to contact according to a pluggable load balancing
//! policy.
//!
//! # Connecting
//! All driver activity revolves around the [Session].
//! `Session` is created by specifying a few known nodes and connecting to
//! them:
//!
//! ```rust,no_run
//! use cquill::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("1.2.3.4:9876")
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Making requests
//! After connecting, requests are dispatched with [Session::query],
//! [Session::prepare] and [Session::execute]. Each call walks a fresh
//! query plan: the session prefers a free stream on an already-open
//! connection, then a connection recycled from the trashcan, and only
//! then opens a fresh connection - the one step that pays for a
//! handshake.
//!
//! ```rust,no_run
//! # use cquill::Session;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
//! session
//!     .query("INSERT INTO ks.tab (a, b) VALUES(2, 'some text')")
//!     .await?;
//!
//! let prepared = session.prepare("SELECT a, b FROM ks.tab").await?;
//! let result = session.execute(&prepared).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Row payloads are surfaced raw; decoding CQL values belongs to a layer
//! above this crate.

pub mod client;
pub mod cluster;
pub mod errors;
pub mod frame;
pub mod network;
pub mod policies;
pub mod statement;

pub(crate) mod utils;

pub use client::config::{Credentials, PoolingOptions, SessionConfig, SessionListener};
pub use client::session::Session;
pub use client::session_builder::SessionBuilder;

pub use frame::types::Consistency;
pub use frame::ProtocolVersion;

pub use cluster::{ClusterView, KnownNode, Node};
pub use network::QueryResult;
pub use policies::load_balancing::{
    DcAwareRoundRobinPolicy, HostDistance, LoadBalancingPolicy, QueryPlan, RoundRobinPolicy,
};
pub use statement::{PreparedStatement, Query};
