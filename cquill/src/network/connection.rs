//! A single CQL connection: one TCP session, many multiplexed streams.
//!
//! Requests are submitted to a background router (a writer half and a
//! reader half over the split transport) and matched back to callers by
//! stream id. The session core owns stream acquisition; a request is
//! dispatched on a stream the caller has already reserved, and the
//! reader releases the stream when its response arrives.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::client::config::Credentials;
use crate::errors::{
    BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError, QueryError,
};
use crate::frame::request::{
    AuthResponse, Credentials as CredentialsRequest, Execute, Prepare, Query as QueryRequest,
    SerializableRequest, Startup,
};
use crate::frame::response::{CqlResult, Response, ResponseOpcode};
use crate::frame::{self, ProtocolVersion, SerializedRequest, StreamId};
use crate::network::stream_ids::StreamIdSet;
use crate::statement::{PreparedStatement, Query};

/// Everything a connection needs to know before dialing.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) version: ProtocolVersion,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) connect_timeout: Duration,
    pub(crate) tcp_nodelay: bool,
}

/// Manufactures connected, handshaken connections. The session consumes
/// this seam; tests substitute their own factory to drive the session
/// core without touching the network.
#[async_trait]
pub(crate) trait ConnectionFactory: Send + Sync {
    async fn open(
        &self,
        endpoint: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<Connection, ConnectionError>;
}

/// The default factory: dials TCP and performs the STARTUP handshake.
pub(crate) struct TcpConnectionFactory;

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn open(
        &self,
        endpoint: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<Connection, ConnectionError> {
        Connection::open(endpoint, config).await
    }
}

struct Task {
    serialized_request: SerializedRequest,
}

struct TaskResponse {
    opcode: ResponseOpcode,
    body: Bytes,
}

type ResponseHandler = oneshot::Sender<Result<TaskResponse, QueryError>>;

struct HandlerMap {
    /// Set once the router dies; new registrations are refused with this
    /// error.
    closed: Option<BrokenConnectionError>,
    handlers: HashMap<StreamId, ResponseHandler>,
}

struct ConnectionShared {
    healthy: AtomicBool,
    in_flight: AtomicUsize,
    stream_ids: StdMutex<StreamIdSet>,
    handlers: StdMutex<HandlerMap>,
}

impl ConnectionShared {
    /// Frees a stream id and keeps `in_flight` in step with the bitmap.
    /// Idempotent: a double release changes nothing beyond a log line.
    fn release_stream(&self, stream: StreamId) {
        let released = self.stream_ids.lock().unwrap().release(stream);
        if released {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
        } else {
            warn!(stream = stream, "Double release of a stream id");
        }
    }
}

pub(crate) struct Connection {
    id: Uuid,
    endpoint: SocketAddr,
    version: ProtocolVersion,
    shared: Arc<ConnectionShared>,
    submit_sender: mpsc::Sender<Task>,
    shutdown_sender: StdMutex<Option<oneshot::Sender<()>>>,
    _router_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("version", &self.version)
            .finish()
    }
}

impl Connection {
    /// Dials `endpoint` and performs the handshake.
    pub(crate) async fn open(
        endpoint: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<Connection, ConnectionError> {
        let connect = tokio::time::timeout(config.connect_timeout, TcpStream::connect(endpoint));
        let stream = match connect.await {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout(config.connect_timeout)),
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        Connection::open_on_transport(stream, endpoint, config).await
    }

    /// Performs the handshake over an already-established transport and
    /// spawns the router. Tests enter here with in-memory transports.
    pub(crate) async fn open_on_transport(
        mut transport: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
        endpoint: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<Connection, ConnectionError> {
        let handshake = Connection::perform_handshake(&mut transport, config);
        match tokio::time::timeout(config.connect_timeout, handshake).await {
            Ok(res) => res?,
            Err(_) => return Err(ConnectionError::ConnectTimeout(config.connect_timeout)),
        }

        let shared = Arc::new(ConnectionShared {
            healthy: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            stream_ids: StdMutex::new(StreamIdSet::new(config.version.max_streams())),
            handlers: StdMutex::new(HandlerMap {
                closed: None,
                handlers: HashMap::new(),
            }),
        });

        let (submit_sender, task_receiver) = mpsc::channel(1024);
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        let router = Connection::run_router(
            transport,
            shared.clone(),
            task_receiver,
            shutdown_receiver,
            config.version,
            endpoint,
        );
        let (fut, router_handle) = router.remote_handle();
        tokio::spawn(fut);

        debug!(endpoint = %endpoint, "Connection established");
        Ok(Connection {
            id: Uuid::new_v4(),
            endpoint,
            version: config.version,
            shared,
            submit_sender,
            shutdown_sender: StdMutex::new(Some(shutdown_sender)),
            _router_handle: router_handle,
        })
    }

    /// STARTUP, then either READY, or AUTHENTICATE answered with the
    /// configured credentials (CREDENTIALS in v1, AUTH_RESPONSE above).
    async fn perform_handshake(
        transport: &mut (impl AsyncRead + AsyncWrite + Unpin),
        config: &ConnectionConfig,
    ) -> Result<(), ConnectionError> {
        let version = config.version;
        let startup = Startup::for_handshake(None);
        Connection::send_handshake_request(transport, version, &startup).await?;

        loop {
            let (_, opcode, body) = frame::read_response(transport, version).await?;
            match Response::deserialize(version, opcode, &body)? {
                Response::Ready | Response::AuthSuccess => return Ok(()),
                Response::Authenticate(authenticate) => {
                    let credentials = config.credentials.as_ref().ok_or_else(|| {
                        ConnectionError::CredentialsRequired(authenticate.authenticator_name.clone())
                    })?;
                    match version {
                        ProtocolVersion::V1 => {
                            let request = CredentialsRequest {
                                username: &credentials.username,
                                password: &credentials.password,
                            };
                            Connection::send_handshake_request(transport, version, &request)
                                .await?;
                        }
                        ProtocolVersion::V2 | ProtocolVersion::V3 => {
                            let request = AuthResponse {
                                username: &credentials.username,
                                password: &credentials.password,
                            };
                            Connection::send_handshake_request(transport, version, &request)
                                .await?;
                        }
                    }
                }
                Response::Error(err) => return Err(ConnectionError::Db(err.error, err.reason)),
                Response::AuthChallenge => {
                    return Err(ConnectionError::UnexpectedHandshakeResponse(
                        "AUTH_CHALLENGE (SASL mechanisms beyond PLAIN are not supported)",
                    ))
                }
                _ => {
                    return Err(ConnectionError::UnexpectedHandshakeResponse(
                        "expected READY, AUTHENTICATE or ERROR",
                    ))
                }
            }
        }
    }

    async fn send_handshake_request<R: SerializableRequest>(
        transport: &mut (impl AsyncWrite + Unpin),
        version: ProtocolVersion,
        request: &R,
    ) -> Result<(), ConnectionError> {
        let serialized = SerializedRequest::make(request, version, 0)?;
        transport.write_all(serialized.as_bytes()).await?;
        transport.flush().await?;
        Ok(())
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Relaxed)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    /// True iff the connection already carries `threshold` or more
    /// outstanding streams (the busy boundary is inclusive).
    pub(crate) fn is_busy(&self, threshold: usize) -> bool {
        self.in_flight() >= threshold
    }

    pub(crate) fn is_free(&self, threshold: usize) -> bool {
        self.in_flight() <= threshold
    }

    /// Reserves a free stream id, or `None` when the allocator is
    /// exhausted. Never blocks.
    pub(crate) fn acquire_stream(&self) -> Option<StreamId> {
        let acquired = self.shared.stream_ids.lock().unwrap().acquire();
        if acquired.is_some() {
            self.shared.in_flight.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Returns a reserved stream id without dispatching on it.
    pub(crate) fn release_stream(&self, stream: StreamId) {
        self.shared.release_stream(stream);
    }

    /// Closes the connection. Idempotent; every outstanding caller is
    /// failed with a connection-closed error by the router teardown.
    pub(crate) fn close(&self) {
        if let Some(sender) = self.shutdown_sender.lock().unwrap().take() {
            trace!(endpoint = %self.endpoint, id = %self.id, "Closing connection");
            let _ = sender.send(());
        }
    }

    /// Dispatches QUERY on the reserved `stream` and waits for its result.
    pub(crate) async fn query(
        &self,
        stream: StreamId,
        query: &Query,
    ) -> Result<QueryResult, QueryError> {
        let request = QueryRequest {
            contents: query.get_contents(),
            consistency: query.get_consistency(),
        };
        let response = self.send_request(stream, &request).await?;
        Connection::into_query_result(response)
    }

    /// Dispatches PREPARE on the reserved `stream`.
    pub(crate) async fn prepare(
        &self,
        stream: StreamId,
        statement: &str,
    ) -> Result<PreparedStatement, QueryError> {
        let request = Prepare {
            contents: statement,
        };
        match self.send_request(stream, &request).await? {
            Response::Result(CqlResult::Prepared(prepared)) => {
                Ok(PreparedStatement::new(prepared.id, statement.to_owned()))
            }
            Response::Error(err) => Err(err.into()),
            _ => Err(QueryError::ProtocolError(
                "PREPARE response is not a PREPARED result",
            )),
        }
    }

    /// Dispatches EXECUTE of a prepared statement on the reserved `stream`.
    pub(crate) async fn execute(
        &self,
        stream: StreamId,
        prepared: &PreparedStatement,
    ) -> Result<QueryResult, QueryError> {
        let request = Execute {
            id: prepared.get_id(),
            consistency: prepared.get_consistency(),
        };
        let response = self.send_request(stream, &request).await?;
        Connection::into_query_result(response)
    }

    fn into_query_result(response: Response) -> Result<QueryResult, QueryError> {
        match response {
            Response::Result(result) => Ok(QueryResult { result }),
            Response::Error(err) => Err(err.into()),
            _ => Err(QueryError::ProtocolError(
                "Expected RESULT or ERROR response",
            )),
        }
    }

    async fn send_request<R: SerializableRequest>(
        &self,
        stream: StreamId,
        request: &R,
    ) -> Result<Response, QueryError> {
        let serialized_request = match SerializedRequest::make(request, self.version, stream) {
            Ok(serialized) => serialized,
            Err(e) => {
                self.shared.release_stream(stream);
                return Err(QueryError::InvalidMessage(e.to_string()));
            }
        };

        let (response_sender, receiver) = oneshot::channel();
        {
            let mut handler_map = self.shared.handlers.lock().unwrap();
            if let Some(err) = &handler_map.closed {
                let err = err.clone();
                drop(handler_map);
                self.shared.release_stream(stream);
                return Err(err.into());
            }
            handler_map.handlers.insert(stream, response_sender);
        }

        let submitted = self
            .submit_sender
            .send(Task { serialized_request })
            .await
            .is_ok();
        if !submitted {
            // The writer is gone. The router teardown may have cleaned up
            // already; only undo what it has not.
            let removed = self
                .shared
                .handlers
                .lock()
                .unwrap()
                .handlers
                .remove(&stream);
            if removed.is_some() {
                self.shared.release_stream(stream);
            }
            return Err(BrokenConnectionError::from(BrokenConnectionErrorKind::Dropped).into());
        }

        let task_response = receiver
            .await
            .map_err(|_| BrokenConnectionError::from(BrokenConnectionErrorKind::Dropped))??;

        Response::deserialize(self.version, task_response.opcode, &task_response.body)
            .map_err(|e| QueryError::InvalidMessage(e.to_string()))
    }

    async fn run_router(
        transport: impl AsyncRead + AsyncWrite + Send + 'static,
        shared: Arc<ConnectionShared>,
        task_receiver: mpsc::Receiver<Task>,
        shutdown_receiver: oneshot::Receiver<()>,
        version: ProtocolVersion,
        endpoint: SocketAddr,
    ) {
        let (read_half, write_half) = split(transport);

        let reader = Connection::reader(BufReader::new(read_half), &shared, version);
        let writer = Connection::writer(BufWriter::new(write_half), task_receiver);

        let result: Result<(), BrokenConnectionError> = tokio::select! {
            res = reader => res,
            res = writer => res,
            _ = shutdown_receiver => {
                Err(BrokenConnectionErrorKind::ClosedByCaller.into())
            }
        };

        let error = match result {
            Ok(()) => BrokenConnectionErrorKind::Dropped.into(),
            Err(e) => e,
        };
        Connection::on_connection_broken(&shared, error, endpoint);
    }

    /// Terminal transition: marks the connection unhealthy, fails every
    /// outstanding caller and frees every stream.
    fn on_connection_broken(
        shared: &ConnectionShared,
        error: BrokenConnectionError,
        endpoint: SocketAddr,
    ) {
        debug!(endpoint = %endpoint, error = %error, "Connection closed");
        shared.healthy.store(false, Ordering::Relaxed);

        let drained: Vec<ResponseHandler> = {
            let mut handler_map = shared.handlers.lock().unwrap();
            handler_map.closed = Some(error.clone());
            handler_map.handlers.drain().map(|(_, h)| h).collect()
        };
        for handler in drained {
            let _ = handler.send(Err(error.clone().into()));
        }

        let released = shared.stream_ids.lock().unwrap().release_all();
        shared.in_flight.fetch_sub(released, Ordering::Relaxed);
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        shared: &ConnectionShared,
        version: ProtocolVersion,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response(&mut read_half, version)
                .await
                .map_err(|e| BrokenConnectionError::from(BrokenConnectionErrorKind::Frame(e)))?;

            if params.stream < 0 {
                // Negative stream ids carry server-pushed events; the
                // topology refresher consumes those elsewhere.
                continue;
            }

            let handler = shared
                .handlers
                .lock()
                .unwrap()
                .handlers
                .remove(&params.stream);
            match handler {
                Some(handler) => {
                    shared.release_stream(params.stream);
                    let _ = handler.send(Ok(TaskResponse { opcode, body }));
                }
                None => {
                    debug!(
                        stream = params.stream,
                        "Received response with no waiting caller"
                    );
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        while let Some(task) = task_receiver.recv().await {
            write_half
                .write_all(task.serialized_request.as_bytes())
                .await
                .map_err(|e| BrokenConnectionError::from(BrokenConnectionErrorKind::Io(e)))?;
            write_half
                .flush()
                .await
                .map_err(|e| BrokenConnectionError::from(BrokenConnectionErrorKind::Io(e)))?;
        }
        // All submit handles dropped: the owning Connection is going away.
        Ok(())
    }
}

/// The outcome of a successful QUERY or EXECUTE round trip.
#[derive(Debug, Clone)]
pub struct QueryResult {
    result: CqlResult,
}

impl QueryResult {
    pub fn result(&self) -> &CqlResult {
        &self.result
    }

    /// Raw rows payload, if the response was of the Rows kind. Decoding
    /// values out of it is the business of a higher layer.
    pub fn rows_raw(&self) -> Option<&Bytes> {
        match &self.result {
            CqlResult::Rows(raw) => Some(raw),
            _ => None,
        }
    }
}
