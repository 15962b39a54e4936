//! PostgreSQL connection implementation.
//!
//! Each [`Connection`] is a cheap handle onto one physical socket. The socket
//! itself is owned by a spawned driver task, the only code that touches the
//! protocol state:
//!
//! - callers encode their request (placeholders, parameters) up front and
//!   hand it to the driver over an unbounded channel
//! - the driver writes it immediately (or into the pre-connect backlog) and
//!   appends a [`Statement`] handle to its FIFO
//! - backend frames are dispatched to the front handle, and every
//!   `ReadyForQuery` after the handshake completes exactly one handle
//!
//! Several requests may therefore be outstanding on one socket; the server
//! answers them in submission order.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use super::auth::Authenticator;
use super::codec::{FrameBuffer, MessageWriter};
use super::protocol::{self, rows_from_tag, BackendMessage, TransactionStatus};
use super::statement::{Columns, ExecOptions, PreparedStatements, Statement, StatementResult};
use crate::config::{Address, PgConfig};
use crate::error::{Error, Result};
use crate::sql::{rewrite_placeholders, substitute_literals, Dialect, Query, PG_MAX_PARAMS};
use crate::types::TypeRegistry;
use crate::value::{Row, Rows};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lease token of a connection nobody holds exclusively.
pub(crate) const SHARED: u64 = 0;

// ============================================================================
// Transport
// ============================================================================

/// Byte stream the driver runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;
pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxStream>> + Send>>;

/// Opens new transport streams for a pool.
pub trait Connect: Send + Sync + 'static {
    fn connect(&self) -> ConnectFuture;
}

/// Connects to the TCP or Unix socket address of a [`PgConfig`].
#[derive(Debug, Clone)]
pub struct SocketConnector {
    address: Address,
}

impl SocketConnector {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

impl Connect for SocketConnector {
    fn connect(&self) -> ConnectFuture {
        let address = self.address.clone();
        Box::pin(async move {
            match address {
                Address::Tcp { host, port } => {
                    let stream = TcpStream::connect((host.as_str(), port)).await?;
                    stream.set_nodelay(true)?;
                    Ok(Box::new(stream) as BoxStream)
                }
                #[cfg(unix)]
                Address::Unix(path) => {
                    let stream = tokio::net::UnixStream::connect(path).await?;
                    Ok(Box::new(stream) as BoxStream)
                }
                #[cfg(not(unix))]
                Address::Unix(path) => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("Unix sockets are not supported here: {}", path),
                )),
            }
        })
    }
}

// ============================================================================
// Hooks
// ============================================================================

pub(crate) type NotificationHook = Arc<dyn Fn(i32, String, String) + Send + Sync>;
pub(crate) type DestroyHook = Box<dyn FnOnce(u64, &str) + Send>;

/// Lifecycle callbacks run on the driver task.
#[derive(Default)]
pub(crate) struct ConnectionHooks {
    /// Called once when the connection is destroyed, for any reason.
    pub on_destroy: Option<DestroyHook>,
    /// Called for every `NotificationResponse`.
    pub on_notification: Option<NotificationHook>,
}

// ============================================================================
// Connection handle
// ============================================================================

enum Command {
    Request(Request),
    Destroy(String),
}

struct Request {
    sql: String,
    /// `None` selects the simple query protocol.
    params: Option<Vec<Option<String>>>,
    statement_id: Option<String>,
    sth: Statement,
}

#[derive(Debug, Default)]
struct State {
    status: TransactionStatus,
    connected: bool,
    destroyed: Option<String>,
    backend_key: Option<(i32, i32)>,
    server_params: HashMap<String, String>,
}

struct Shared {
    id: u64,
    state: Mutex<State>,
    lease: AtomicU64,
    registry: Arc<TypeRegistry>,
}

/// Handle to one pipelined server connection.
///
/// The driver task stops once every handle is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("status", &state.status)
            .field("connected", &state.connected)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

impl Connection {
    /// Spawn the driver task for a new connection.
    ///
    /// Returns immediately; requests issued before the handshake completes
    /// are buffered and flushed on the first `ReadyForQuery`.
    pub(crate) fn spawn(
        config: Arc<PgConfig>,
        registry: Arc<TypeRegistry>,
        connector: Arc<dyn Connect>,
        hooks: ConnectionHooks,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State::default()),
            lease: AtomicU64::new(SHARED),
            registry: Arc::clone(&registry),
        });

        let driver = Driver::new(Arc::clone(&shared), &config, registry, hooks);
        tokio::spawn(driver.run(connector, rx));

        Self {
            shared,
            commands: tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed.is_some()
    }

    /// Transaction status reported by the last `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.shared.state.lock().status
    }

    /// Backend process id and secret key from `BackendKeyData`.
    pub fn backend_key(&self) -> Option<(i32, i32)> {
        self.shared.state.lock().backend_key
    }

    /// A run-time parameter reported by `ParameterStatus`.
    pub fn server_param(&self, name: &str) -> Option<String> {
        self.shared.state.lock().server_params.get(name).cloned()
    }

    /// Kill the socket and fail every queued and in-flight request.
    pub fn destroy(&self, reason: &str) {
        // Already gone if the send fails
        let _ = self.commands.send(Command::Destroy(reason.to_string()));
    }

    // ========================================================================
    // Leases
    // ========================================================================

    pub(crate) fn lease(&self) -> u64 {
        self.shared.lease.load(Ordering::Acquire)
    }

    /// Take exclusive ownership. Fails if someone else holds it.
    pub(crate) fn acquire_lease(&self, token: u64) -> bool {
        self.shared
            .lease
            .compare_exchange(SHARED, token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_lease(&self, token: u64) {
        let _ = self
            .shared
            .lease
            .compare_exchange(token, SHARED, Ordering::AcqRel, Ordering::Acquire);
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Encode and queue a request, returning the receiver for its result.
    ///
    /// Usage errors (wrong lease, parameter count, unencodable values) are
    /// returned here, before anything reaches the socket.
    pub(crate) fn submit(
        &self,
        query: Query,
        opts: ExecOptions,
        lease: u64,
    ) -> Result<oneshot::Receiver<Result<StatementResult>>> {
        let held = self.lease();
        if held != lease {
            return Err(Error::Usage(if lease == SHARED {
                format!("Connection {} is held by a transaction", self.shared.id)
            } else {
                "Transaction handle used outside of its transaction".to_string()
            }));
        }
        if let Some(reason) = &self.shared.state.lock().destroyed {
            return Err(Error::Destroyed(reason.clone()));
        }

        let registry = &self.shared.registry;
        let Query {
            text,
            params,
            id,
            types,
        } = query;

        let (sql, params, statement_id) = if params.len() > PG_MAX_PARAMS {
            // Too many to bind, inline them and drop the prepared id since the
            // text now changes per call
            let sql = substitute_literals(&text, &params, registry, Dialect::Postgres)?;
            (sql, Vec::new(), None)
        } else {
            let sql = rewrite_placeholders(&text, params.len(), Dialect::Postgres)?;
            let encoded = params
                .iter()
                .map(|p| registry.encode_param(p))
                .collect::<Result<Vec<_>>>()?;
            (sql, encoded, id.filter(|id| !id.is_empty()))
        };

        let simple = params.is_empty() && statement_id.is_none() && opts.max_rows == 0;
        let (reply, rx) = oneshot::channel();
        let sth = Statement::new(reply, statement_id.clone(), types, opts);

        let request = Request {
            sql,
            params: if simple { None } else { Some(params) },
            statement_id,
            sth,
        };
        self.commands
            .send(Command::Request(request))
            .map_err(|_| Error::Destroyed("Connection closed".to_string()))?;
        Ok(rx)
    }

    pub(crate) async fn request(
        &self,
        query: Query,
        opts: ExecOptions,
        lease: u64,
    ) -> Result<StatementResult> {
        let rx = self.submit(query, opts, lease)?;
        rx.await
            .map_err(|_| Error::Destroyed("Connection closed".to_string()))?
    }

    pub(crate) async fn exec_as(&self, query: Query, lease: u64) -> Result<u64> {
        Ok(self.request(query, ExecOptions::exec(), lease).await?.count)
    }

    pub(crate) async fn execute_as(&self, query: Query, lease: u64) -> Result<u64> {
        Ok(self.request(query, ExecOptions::execute(), lease).await?.count)
    }

    pub(crate) async fn select_as(&self, query: Query, lease: u64) -> Result<Rows> {
        let result = self.request(query, ExecOptions::select(), lease).await?;
        Ok(Rows::new(result.rows, result.count))
    }

    pub(crate) async fn select_row_as(&self, query: Query, lease: u64) -> Result<Option<Row>> {
        let result = self.request(query, ExecOptions::select_row(), lease).await?;
        Ok(result.rows.into_iter().next())
    }
}

// ============================================================================
// Driver task
// ============================================================================

struct Driver {
    shared: Arc<Shared>,
    registry: Arc<TypeRegistry>,
    hooks: ConnectionHooks,
    auth: Authenticator,
    /// Bytes for the socket (handshake replies, requests once connected).
    writer: MessageWriter,
    /// Requests issued before the first `ReadyForQuery`.
    backlog: MessageWriter,
    frames: FrameBuffer,
    pending: VecDeque<Statement>,
    prepared: PreparedStatements,
    connected: bool,
}

fn current(pending: &mut VecDeque<Statement>) -> Result<&mut Statement> {
    pending
        .front_mut()
        .ok_or_else(|| Error::Protocol("Result message with no statement in flight".to_string()))
}

/// Why the driver loop stopped.
enum Exit {
    /// Every handle was dropped.
    Dropped,
    Destroyed(String),
    Failed(Error),
}

impl Driver {
    fn new(
        shared: Arc<Shared>,
        config: &PgConfig,
        registry: Arc<TypeRegistry>,
        hooks: ConnectionHooks,
    ) -> Self {
        let mut writer = MessageWriter::new();
        let mut options = Vec::new();
        if let Some(name) = &config.application_name {
            options.push(("application_name", name.as_str()));
        }
        protocol::startup(&mut writer, &config.user, &config.database, &options);

        Self {
            shared,
            registry,
            hooks,
            auth: Authenticator::new(&config.user, config.password.as_deref()),
            writer,
            backlog: MessageWriter::new(),
            frames: FrameBuffer::new(),
            pending: VecDeque::new(),
            prepared: PreparedStatements::default(),
            connected: false,
        }
    }

    async fn run(
        mut self,
        connector: Arc<dyn Connect>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let id = self.shared.id;
        debug!(connection = id, "connecting");

        let exit = match connector.connect().await {
            Ok(stream) => self.serve(stream, &mut commands).await,
            Err(e) => Exit::Failed(Error::Io(e)),
        };

        let reason = match exit {
            Exit::Dropped => "Connection dropped".to_string(),
            Exit::Destroyed(reason) => {
                debug!(connection = id, %reason, "connection destroyed");
                reason
            }
            Exit::Failed(e) => {
                error!(connection = id, error = %e, "connection failed");
                e.to_string()
            }
        };
        self.teardown(&reason, &mut commands);
    }

    async fn serve(&mut self, stream: BoxStream, commands: &mut mpsc::UnboundedReceiver<Command>) -> Exit {
        let (mut reader, mut writer) = tokio::io::split(stream);
        // Accepted by the driver, not yet by the socket. Reads continue
        // while it drains.
        let mut outbound = Bytes::new();

        loop {
            if outbound.is_empty() && !self.writer.is_empty() {
                outbound = self.writer.take();
                trace!(connection = self.shared.id, bytes = outbound.len(), "write");
            }

            tokio::select! {
                written = writer.write(&outbound), if !outbound.is_empty() => match written {
                    Ok(0) => return Exit::Failed(Error::Io(io::ErrorKind::WriteZero.into())),
                    Ok(n) => outbound.advance(n),
                    Err(e) => return Exit::Failed(Error::Io(e)),
                },
                command = commands.recv() => match command {
                    Some(Command::Request(request)) => self.enqueue(request),
                    Some(Command::Destroy(reason)) => {
                        self.close_socket(&mut writer, outbound).await;
                        let _ = writer.shutdown().await;
                        return Exit::Destroyed(reason);
                    }
                    None => {
                        self.close_socket(&mut writer, outbound).await;
                        return Exit::Dropped;
                    }
                },
                read = reader.read_buf(self.frames.read_target()) => match read {
                    Ok(0) => {
                        return Exit::Destroyed("Server closed the connection".to_string());
                    }
                    Ok(_) => {
                        if let Err(e) = self.dispatch_frames() {
                            return Exit::Failed(e);
                        }
                    }
                    Err(e) => return Exit::Failed(Error::Io(e)),
                },
            }
        }
    }

    /// Finish the pending write and say goodbye. Errors are moot here.
    async fn close_socket<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, outbound: Bytes) {
        protocol::terminate(&mut self.writer);
        let _ = writer.write_all(&outbound).await;
        let _ = writer.write_all(&self.writer.take()).await;
    }

    /// Write one request's messages and queue its handle.
    fn enqueue(&mut self, request: Request) {
        let Request {
            sql,
            params,
            statement_id,
            mut sth,
        } = request;
        let w = if self.connected {
            &mut self.writer
        } else {
            &mut self.backlog
        };

        match params {
            None => protocol::query(w, &sql),
            Some(params) => {
                let name = statement_id.as_deref().unwrap_or("");
                let known = statement_id
                    .as_deref()
                    .is_some_and(|id| self.prepared.contains(id));

                if known {
                    sth.reused = true;
                } else {
                    protocol::parse(w, name, &sql);
                    sth.parse_pending = true;
                    if let Some(id) = &statement_id {
                        self.prepared.mark_parsing(id);
                    }
                }
                protocol::bind(w, "", name, &params);
                // Describe unless the columns are already known
                let described = statement_id
                    .as_deref()
                    .and_then(|id| self.prepared.columns(id))
                    .is_some();
                if !described {
                    protocol::describe_portal(w, "");
                }
                protocol::execute(w, "", sth.opts.max_rows);
                if sth.opts.max_rows > 0 {
                    protocol::close_portal(w, "");
                }
                protocol::flush(w);
                protocol::sync(w);
            }
        }

        trace!(
            connection = self.shared.id,
            statement = ?statement_id,
            reused = sth.reused,
            "queued"
        );
        self.pending.push_back(sth);
    }

    fn dispatch_frames(&mut self) -> Result<()> {
        while let Some((tag, body)) = self.frames.next_frame()? {
            let message = BackendMessage::decode(tag, body)?;
            self.on_message(message)?;
        }
        Ok(())
    }

    fn cached_columns(&self) -> Option<Arc<Columns>> {
        let sth = self.pending.front()?;
        if sth.reused {
            self.prepared.columns(sth.statement_id.as_deref()?)
        } else {
            None
        }
    }

    /// Handle one backend message. An `Err` destroys the connection.
    fn on_message(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::Authentication(request) => {
                if self.connected {
                    return Err(Error::Protocol(
                        "Authentication request after startup".to_string(),
                    ));
                }
                self.auth.on_request(request, &mut self.writer)?;
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.auth.on_backend_key()?;
                self.shared.state.lock().backend_key = Some((process_id, secret_key));
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.shared.state.lock().server_params.insert(name, value);
            }
            BackendMessage::ReadyForQuery { status } => self.on_ready(status)?,
            BackendMessage::RowDescription { fields } => {
                let sth = current(&mut self.pending)?;
                let columns = Arc::new(Columns::resolve(
                    &fields,
                    &self.registry,
                    sth.types.as_deref(),
                ));
                sth.describe(Arc::clone(&columns));
                if let Some(id) = sth.statement_id.clone() {
                    self.prepared.learn(&id, columns);
                }
            }
            BackendMessage::NoData => {
                let columns = Arc::new(Columns::empty());
                let sth = current(&mut self.pending)?;
                sth.describe(Arc::clone(&columns));
                if let Some(id) = sth.statement_id.clone() {
                    self.prepared.learn(&id, columns);
                }
            }
            BackendMessage::DataRow { values } => {
                let cached = self.cached_columns();
                current(&mut self.pending)?.push_row(values, cached)?;
            }
            BackendMessage::CommandComplete { tag } => {
                current(&mut self.pending)?.complete(rows_from_tag(&tag));
            }
            BackendMessage::EmptyQueryResponse => current(&mut self.pending)?.complete(0),
            BackendMessage::PortalSuspended => current(&mut self.pending)?.suspended(),
            BackendMessage::ParseComplete => current(&mut self.pending)?.parse_pending = false,
            BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::ParameterDescription { .. } => {}
            BackendMessage::ErrorResponse(err) => {
                if !self.connected {
                    return Err(Error::Server(err));
                }
                let sth = current(&mut self.pending)?;
                if sth.parse_pending {
                    let id = sth.statement_id.clone();
                    sth.fail(Error::Server(err));
                    if let Some(id) = id {
                        self.prepared.forget(&id);
                    }
                } else {
                    sth.fail(Error::Server(err));
                }
            }
            BackendMessage::NoticeResponse(notice) => {
                warn!(
                    connection = self.shared.id,
                    severity = %notice.severity,
                    code = %notice.code,
                    "{}",
                    notice.message
                );
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                if let Some(hook) = &self.hooks.on_notification {
                    hook(process_id, channel, payload);
                }
            }
        }
        Ok(())
    }

    fn on_ready(&mut self, status: TransactionStatus) -> Result<()> {
        self.shared.state.lock().status = status;

        if !self.connected {
            self.auth.on_ready()?;
            self.connected = true;
            self.shared.state.lock().connected = true;
            debug!(
                connection = self.shared.id,
                queued = self.pending.len(),
                "connected"
            );
            // Flush everything issued while connecting
            let backlog = self.backlog.take();
            self.writer.bytes(&backlog);
            return Ok(());
        }

        let cached = self.cached_columns();
        let sth = self
            .pending
            .pop_front()
            .ok_or_else(|| Error::Protocol("ReadyForQuery with no statement in flight".to_string()))?;
        sth.finish(cached);
        Ok(())
    }

    /// Mark destroyed, fail everything and notify listeners.
    fn teardown(mut self, reason: &str, commands: &mut mpsc::UnboundedReceiver<Command>) {
        {
            let mut state = self.shared.state.lock();
            state.destroyed = Some(reason.to_string());
            state.connected = false;
        }

        commands.close();
        let mut failed = 0usize;
        for sth in self.pending.drain(..) {
            sth.abort(Error::Destroyed(reason.to_string()));
            failed += 1;
        }
        while let Ok(command) = commands.try_recv() {
            if let Command::Request(request) = command {
                request.sth.abort(Error::Destroyed(reason.to_string()));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(connection = self.shared.id, failed, "failed pending requests");
        }

        if let Some(on_destroy) = self.hooks.on_destroy.take() {
            on_destroy(self.shared.id, reason);
        }
    }
}
