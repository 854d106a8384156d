//! Error types surfaced by the driver core.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::frame::FrameError;

/// An error code sent by the database in an ERROR response.
///
/// Only the code and message are decoded; code-specific parameters are
/// not parsed by this crate.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Internal server error")]
    ServerError,
    #[error("Protocol violation")]
    ProtocolError,
    #[error("Authentication failed")]
    AuthenticationError,
    #[error("Not enough replicas are alive to satisfy the consistency level")]
    Unavailable,
    #[error("Coordinator is overloaded")]
    Overloaded,
    #[error("Coordinator is bootstrapping and cannot serve reads")]
    IsBootstrapping,
    #[error("Error during truncate")]
    TruncateError,
    #[error("Timeout during a write request")]
    WriteTimeout,
    #[error("Timeout during a read request")]
    ReadTimeout,
    #[error("Syntax error in the query")]
    SyntaxError,
    #[error("Not authorized to perform the operation")]
    Unauthorized,
    #[error("Invalid query")]
    Invalid,
    #[error("Invalid server configuration")]
    ConfigError,
    #[error("The entity already exists")]
    AlreadyExists,
    #[error("The statement is not prepared on the queried host")]
    Unprepared,
    #[error("Unknown error code: {0:#06x}")]
    Other(i32),
}

impl DbError {
    pub(crate) fn from_code(code: i32) -> DbError {
        match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable,
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout,
            0x1200 => DbError::ReadTimeout,
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists,
            0x2500 => DbError::Unprepared,
            other => DbError::Other(other),
        }
    }
}

/// The connection is no longer usable; every request in flight on it
/// receives a clone of this error.
#[derive(Error, Debug, Clone)]
#[error("Connection broken: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BrokenConnectionErrorKind {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("frame error: {0}")]
    Frame(FrameError),
    #[error("closed by the caller")]
    ClosedByCaller,
    #[error("connection dropped before the response arrived")]
    Dropped,
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(kind))
    }
}

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

/// An error that occurred while opening a connection: dialing, or the
/// STARTUP handshake.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Database returned an error: {0}, Error message: {1}")]
    Db(DbError, String),
    #[error("Server requires authentication ({0}), but no credentials were configured")]
    CredentialsRequired(String),
    #[error("Unexpected response during handshake: {0}")]
    UnexpectedHandshakeResponse(&'static str),
    #[error(transparent)]
    Broken(#[from] BrokenConnectionError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(Arc::new(err))
    }
}

/// The query plan was exhausted without yielding a viable connection.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConnectionPoolError {
    #[error("No host is available according to the load balancing policy (tried: {tried:?})")]
    NoHostAvailable { tried: Vec<SocketAddr> },
}

/// Allocation of a fresh connection failed. Internal to the plan walk:
/// both variants make the walk move on to the next host.
#[derive(Error, Debug)]
pub(crate) enum AllocateConnectionError {
    #[error("Too many connections to host {endpoint} (limit: {limit})")]
    TooManyConnections { endpoint: SocketAddr, limit: usize },
    #[error(transparent)]
    Connect(#[from] ConnectionError),
}

/// An error that occurred during request execution.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum QueryError {
    /// The database responded with an ERROR frame; only this request's
    /// stream is affected.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// No viable connection could be obtained for the request.
    #[error("could not obtain viable client from the pool.")]
    Pool(#[source] ConnectionPoolError),

    /// The connection carrying the request died.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The request could not be serialized into a frame.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The server sent a response this request cannot accept.
    #[error("Protocol Error: {0}")]
    ProtocolError(&'static str),
}

impl From<crate::frame::response::Error> for QueryError {
    fn from(error: crate::frame::response::Error) -> QueryError {
        QueryError::DbError(error.error, error.reason)
    }
}

/// An error that occurred during session creation or warm-up.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NewSessionError {
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,
    #[error(transparent)]
    Pool(#[from] ConnectionPoolError),
}
