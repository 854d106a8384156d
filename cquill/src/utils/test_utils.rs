//! In-process CQL server used by unit tests.
//!
//! Tests drive the session core through the connection-factory seam: the
//! mock factory opens `tokio::io::duplex` transports with a server task
//! speaking just enough of the protocol on the other end - STARTUP
//! negotiation, VOID results for queries, PREPARED results for prepares.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::client::config::SessionConfig;
use crate::errors::ConnectionError;
use crate::frame::types;
use crate::frame::ProtocolVersion;
use crate::network::connection::{Connection, ConnectionConfig, ConnectionFactory};

/// Polls `cond` until it holds; panics if it never does. For observing
/// state transitions driven by background tasks (router teardown).
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the mock server at one endpoint treats its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockBehavior {
    /// Handshake succeeds, every request gets a well-formed response.
    Accept,
    /// STARTUP is answered with an ERROR frame.
    RejectStartup,
    /// The dial itself fails; no transport is created.
    RefuseConnect,
    /// STARTUP is answered with AUTHENTICATE; credentials are then
    /// accepted unconditionally.
    RequireAuth,
}

const SERVER_ERROR: u8 = 0x00;
const SERVER_READY: u8 = 0x02;
const SERVER_AUTHENTICATE: u8 = 0x03;
const SERVER_RESULT: u8 = 0x08;
const SERVER_AUTH_SUCCESS: u8 = 0x10;

const REQUEST_STARTUP: u8 = 0x01;
const REQUEST_CREDENTIALS: u8 = 0x04;
const REQUEST_QUERY: u8 = 0x07;
const REQUEST_PREPARE: u8 = 0x09;
const REQUEST_EXECUTE: u8 = 0x0A;
const REQUEST_AUTH_RESPONSE: u8 = 0x0F;

fn wide_stream(version: ProtocolVersion) -> bool {
    matches!(version, ProtocolVersion::V3)
}

pub(crate) async fn read_request(
    transport: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
) -> std::io::Result<(i16, u8, Vec<u8>)> {
    let header_size = if wide_stream(version) { 9 } else { 8 };
    let mut header = [0u8; 9];
    transport.read_exact(&mut header[..header_size]).await?;

    let stream = if wide_stream(version) {
        i16::from_be_bytes([header[2], header[3]])
    } else {
        header[2] as i8 as i16
    };
    let opcode = header[header_size - 5];
    let length = u32::from_be_bytes([
        header[header_size - 4],
        header[header_size - 3],
        header[header_size - 2],
        header[header_size - 1],
    ]);

    let mut body = vec![0u8; length as usize];
    transport.read_exact(&mut body).await?;
    Ok((stream, opcode, body))
}

pub(crate) async fn write_response(
    transport: &mut (impl AsyncWrite + Unpin),
    version: ProtocolVersion,
    stream: i16,
    opcode: u8,
    body: &[u8],
) -> std::io::Result<()> {
    let version_byte = match version {
        ProtocolVersion::V1 => 0x81,
        ProtocolVersion::V2 => 0x82,
        ProtocolVersion::V3 => 0x83,
    };
    let mut frame = Vec::with_capacity(9 + body.len());
    frame.push(version_byte);
    frame.push(0x00);
    if wide_stream(version) {
        frame.extend_from_slice(&stream.to_be_bytes());
    } else {
        frame.push(stream as i8 as u8);
    }
    frame.push(opcode);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);

    transport.write_all(&frame).await?;
    transport.flush().await
}

fn void_result_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0001, &mut body);
    body
}

fn prepared_result_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0004, &mut body);
    types::write_short_bytes(&[0xCA, 0xFE, 0xBA, 0xBE], &mut body).unwrap();
    body
}

fn server_error_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0000, &mut body);
    types::write_string("mock server says no", &mut body).unwrap();
    body
}

/// Serves one client until it hangs up.
pub(crate) async fn run_mock_server(
    mut transport: impl AsyncRead + AsyncWrite + Unpin,
    version: ProtocolVersion,
    behavior: MockBehavior,
) {
    loop {
        let (stream, opcode, _body) = match read_request(&mut transport, version).await {
            Ok(request) => request,
            Err(_) => return, // client hung up
        };

        let result = match opcode {
            REQUEST_STARTUP => match behavior {
                MockBehavior::RejectStartup => {
                    write_response(
                        &mut transport,
                        version,
                        stream,
                        SERVER_ERROR,
                        &server_error_body(),
                    )
                    .await
                }
                MockBehavior::RequireAuth => {
                    let mut body = Vec::new();
                    types::write_string(
                        "org.apache.cassandra.auth.PasswordAuthenticator",
                        &mut body,
                    )
                    .unwrap();
                    write_response(&mut transport, version, stream, SERVER_AUTHENTICATE, &body)
                        .await
                }
                _ => write_response(&mut transport, version, stream, SERVER_READY, &[]).await,
            },
            REQUEST_CREDENTIALS => {
                write_response(&mut transport, version, stream, SERVER_READY, &[]).await
            }
            REQUEST_AUTH_RESPONSE => {
                write_response(&mut transport, version, stream, SERVER_AUTH_SUCCESS, &[]).await
            }
            REQUEST_QUERY | REQUEST_EXECUTE => {
                write_response(
                    &mut transport,
                    version,
                    stream,
                    SERVER_RESULT,
                    &void_result_body(),
                )
                .await
            }
            REQUEST_PREPARE => {
                write_response(
                    &mut transport,
                    version,
                    stream,
                    SERVER_RESULT,
                    &prepared_result_body(),
                )
                .await
            }
            _ => {
                write_response(
                    &mut transport,
                    version,
                    stream,
                    SERVER_ERROR,
                    &server_error_body(),
                )
                .await
            }
        };

        if result.is_err() {
            return;
        }
    }
}

/// A connection factory backed by [`run_mock_server`], with per-endpoint
/// behaviour and an open-attempt counter for handshake-count assertions.
pub(crate) struct MockConnectionFactory {
    behaviors: StdMutex<HashMap<SocketAddr, MockBehavior>>,
    open_attempts: AtomicUsize,
}

impl MockConnectionFactory {
    pub(crate) fn new() -> Self {
        MockConnectionFactory {
            behaviors: StdMutex::new(HashMap::new()),
            open_attempts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_behavior(&self, endpoint: SocketAddr, behavior: MockBehavior) {
        self.behaviors.lock().unwrap().insert(endpoint, behavior);
    }

    pub(crate) fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn open(
        &self,
        endpoint: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<Connection, ConnectionError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&endpoint)
            .copied()
            .unwrap_or(MockBehavior::Accept);

        if behavior == MockBehavior::RefuseConnect {
            return Err(ConnectionError::Io(Arc::new(std::io::Error::new(
                ErrorKind::ConnectionRefused,
                "connection refused",
            ))));
        }

        let (client, server) = tokio::io::duplex(1 << 16);
        tokio::spawn(run_mock_server(server, config.version, behavior));
        Connection::open_on_transport(client, endpoint, config).await
    }
}

pub(crate) fn mock_connection_config(version: ProtocolVersion) -> ConnectionConfig {
    ConnectionConfig {
        version,
        credentials: None,
        connect_timeout: Duration::from_secs(5),
        tcp_nodelay: true,
    }
}

/// Opens a connection to a fresh mock server. For tests that poke the
/// connection directly, without a session.
pub(crate) async fn open_mock_connection(
    endpoint: SocketAddr,
    version: ProtocolVersion,
) -> Connection {
    let (client, server) = tokio::io::duplex(1 << 16);
    tokio::spawn(run_mock_server(server, version, MockBehavior::Accept));
    Connection::open_on_transport(client, endpoint, &mock_connection_config(version))
        .await
        .unwrap()
}

/// A session config wired to the given mock factory, with node addresses
/// already resolved and both timers slowed down so tests control them.
pub(crate) fn mock_session_config(
    factory: Arc<MockConnectionFactory>,
    nodes: &[SocketAddr],
) -> SessionConfig {
    let mut config = SessionConfig::new();
    for node in nodes {
        config.add_known_node_addr(*node);
    }
    config.trashcan_ttl = Duration::from_secs(3600);
    config.trashcan_sweep_interval = Duration::from_secs(3600);
    config.connection_factory = Some(factory);
    config
}
