//! Connection Handler Module
//!
//! This module owns the socket to one memcached node and moves bytes over
//! it: it opens the socket lazily, notices when the server has gone away,
//! writes one command (or one pipelined batch), and reads back exactly the
//! bytes that belong to each reply.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Connection::new (no socket yet)
//!        │
//!        ▼
//! 2. First command: connect() with connect_timeout
//!        │
//!        ▼
//! 3. ┌──────────────────────────────────┐
//!    │      Per command                 │
//!    │                                  │
//!    │  ┌────────────────────────────┐  │
//!    │  │ ensure_live: EOF? reconnect│  │
//!    │  │ stale bytes? drain         │  │
//!    │  └─────────────┬──────────────┘  │
//!    │                ▼                 │
//!    │  ┌────────────────────────────┐  │
//!    │  │ write command (one call)   │  │
//!    │  └─────────────┬──────────────┘  │
//!    │                ▼                 │
//!    │  ┌────────────────────────────┐  │
//!    │  │ read until framed or       │  │
//!    │  │ response deadline expires  │  │
//!    │  └─────────────┬──────────────┘  │
//!    │                ▼                 │
//!    │           [Loop back]            │
//!    └──────────────────────────────────┘
//!        │
//!        ▼
//! 4. disconnect() / drop: socket closed
//! ```
//!
//! ## Buffer Management
//!
//! Replies are accumulated in a `BytesMut`. TCP is a stream protocol, so a
//! reply may arrive split over many reads; after each read the buffer is
//! handed to [`frame_response`] which says whether a complete reply is
//! present. A reply that does not complete before the deadline is returned
//! as it stands, marked incomplete, and the socket is discarded so its tail
//! cannot be mistaken for the next reply.

use crate::commands::Command;
use crate::protocol::frame::frame_response;
use crate::protocol::types::Response;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// How much to grow the buffer by when it runs low
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Largest reply accepted before giving up on it (256 MB)
const MAX_RESPONSE_SIZE: usize = 256 * 1024 * 1024;

/// Where a memcached node listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerEndpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl ServerEndpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ServerEndpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ServerEndpoint::Unix { path: path.into() }
    }
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        ServerEndpoint::tcp(crate::DEFAULT_HOST, crate::DEFAULT_PORT)
    }
}

impl FromStr for ServerEndpoint {
    type Err = ConnectionError;

    /// Accepts `host:port`, `host`, `[v6]:port`, `unix:/path` or `/path`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConnectionError::InvalidEndpoint(s.to_string());

        if s.is_empty() {
            return Err(invalid());
        }

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(ServerEndpoint::unix(path));
        }

        if s.starts_with('/') {
            return Ok(ServerEndpoint::unix(s));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if after.is_empty() => crate::DEFAULT_PORT,
                None => return Err(invalid()),
            };
            return Ok(ServerEndpoint::tcp(host, port));
        }

        match s.rsplit_once(':') {
            // A bare IPv6 address has several colons and no port.
            Some((host, _)) if host.contains(':') => Ok(ServerEndpoint::tcp(s, crate::DEFAULT_PORT)),
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().map_err(|_| invalid())?;
                Ok(ServerEndpoint::tcp(host, port))
            }
            Some(_) => Err(invalid()),
            None => Ok(ServerEndpoint::tcp(s, crate::DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEndpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "[{}]:{}", host, port)
            }
            ServerEndpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ServerEndpoint::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Counters for one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Sockets opened, including reconnects
    pub connects: AtomicU64,
    /// Sockets replaced because the old one was found dead
    pub reconnects: AtomicU64,
    /// Commands written
    pub commands_sent: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
    /// Replies cut short by the response deadline
    pub timeouts: AtomicU64,
    /// Leftover bytes drained before a command was sent
    pub stale_bytes: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_discarded(&self, count: usize) {
        self.stale_bytes.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// The socket itself, TCP or unix-domain.
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    async fn open(endpoint: &ServerEndpoint) -> io::Result<Self> {
        match endpoint {
            ServerEndpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            ServerEndpoint::Unix { path } => Self::open_unix(path).await,
        }
    }

    #[cfg(unix)]
    async fn open_unix(path: &std::path::Path) -> io::Result<Self> {
        Ok(Stream::Unix(UnixStream::connect(path).await?))
    }

    #[cfg(not(unix))]
    async fn open_unix(_path: &std::path::Path) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        ))
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf).await,
            #[cfg(unix)]
            Stream::Unix(s) => s.write_all(buf).await,
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read_buf(buf).await,
            #[cfg(unix)]
            Stream::Unix(s) => s.read_buf(buf).await,
        }
    }

    /// Reads whatever is already buffered by the OS without waiting.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_read(buf),
        }
    }
}

/// State of an idle socket just before a command is sent.
enum Liveness {
    /// Usable; `stale` bytes left over from an earlier reply were drained.
    Live { stale: usize },
    /// The peer closed the socket or it errored.
    Closed,
}

/// Checks an idle socket without blocking, draining any leftover bytes.
fn liveness(stream: &Stream) -> Liveness {
    let mut scratch = [0u8; 1024];
    let mut stale = 0;

    loop {
        match stream.try_read(&mut scratch) {
            Ok(0) => return Liveness::Closed,
            Ok(n) => stale += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Liveness::Live { stale },
            Err(_) => return Liveness::Closed,
        }
    }
}

/// Result of one write-then-read round trip.
struct Transfer {
    responses: Vec<Response>,
    /// The socket is no longer in a known state and must not be reused.
    discard_stream: bool,
}

/// A lazily established connection to exactly one memcached node.
///
/// One command is in flight at a time: every method that talks to the
/// server takes `&mut self`, so a second command cannot start before the
/// previous reply has been consumed. Wrap the owner in a mutex to share it.
pub struct Connection {
    endpoint: ServerEndpoint,
    connect_timeout: Duration,
    response_timeout: Duration,
    stream: Option<Stream>,
    /// Bumped every time a new socket is opened
    generation: u64,
    stats: ConnectionStats,
}

impl Connection {
    /// Creates a connection handle. No socket is opened until the first
    /// command or an explicit [`Connection::connect`].
    pub fn new(endpoint: ServerEndpoint, connect_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
            response_timeout,
            stream: None,
            generation: 0,
            stats: ConnectionStats::new(),
        }
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Identifies the current socket. Anything learned from the server
    /// (such as its version) is only valid for the generation it was
    /// learned on.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Opens the socket if there is none. Idempotent.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = match timeout(self.connect_timeout, Stream::open(&self.endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(endpoint = %self.endpoint, error = %e, "Connect failed");
                return Err(ConnectionError::Connect {
                    endpoint: self.endpoint.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                debug!(endpoint = %self.endpoint, "Connect timed out");
                return Err(ConnectionError::ConnectTimeout {
                    endpoint: self.endpoint.to_string(),
                    timeout: self.connect_timeout,
                });
            }
        };

        self.stream = Some(stream);
        self.generation += 1;
        self.stats.connection_opened();
        info!(endpoint = %self.endpoint, "Connected");

        Ok(())
    }

    /// Makes sure a usable socket exists before a command is sent.
    ///
    /// A socket the server has closed is dropped and replaced. Bytes that
    /// arrived after an earlier reply was framed are drained so they cannot
    /// be read as part of the next reply.
    ///
    /// Returns `true` when an existing socket is being reused.
    pub async fn ensure_live(&mut self) -> Result<bool, ConnectionError> {
        if let Some(stream) = self.stream.as_ref() {
            match liveness(stream) {
                Liveness::Live { stale } => {
                    if stale > 0 {
                        warn!(endpoint = %self.endpoint, bytes = stale, "Discarded stale reply data");
                        self.stats.stale_discarded(stale);
                    }
                    return Ok(true);
                }
                Liveness::Closed => {
                    debug!(endpoint = %self.endpoint, "Connection closed by server, reconnecting");
                    self.stream = None;
                    self.stats.reconnected();
                }
            }
        }

        self.connect().await?;
        Ok(false)
    }

    /// Closes the socket if one is open. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!(endpoint = %self.endpoint, "Disconnected");
        }
    }

    /// Sends one command and reads its reply.
    pub async fn exchange(&mut self, command: &Command) -> Result<Response, ConnectionError> {
        let mut responses = self.exchange_many(std::slice::from_ref(command)).await?;
        Ok(responses
            .pop()
            .unwrap_or_else(|| Response::incomplete(Bytes::new())))
    }

    /// Sends several commands in one write and reads their replies in
    /// order.
    ///
    /// The result has one entry per command unless the deadline expired or
    /// the peer closed mid-batch, in which case it stops after the first
    /// incomplete reply.
    ///
    /// If a reused socket dies before any reply byte arrives, a batch made
    /// only of [repeatable](Command::is_repeatable) commands is sent again
    /// on a new socket, so the server may see it twice. Any other batch
    /// returns the error; the socket is gone and the next call reconnects.
    pub async fn exchange_many(&mut self, commands: &[Command]) -> Result<Vec<Response>, ConnectionError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let reused = self.ensure_live().await?;
        let repeatable = commands.iter().all(Command::is_repeatable);

        match self.round_trip(commands).await {
            // The server dropped an idle socket and we only found out on
            // use. Nothing was received, so the batch is sent once more.
            Err(e) if reused && repeatable && e.is_disconnect() => {
                debug!(endpoint = %self.endpoint, error = %e, "Idle connection was dead, retrying on a new one");
                self.stats.reconnected();
                self.connect().await?;
                self.round_trip(commands).await
            }
            Err(e) if reused && e.is_disconnect() => {
                warn!(
                    endpoint = %self.endpoint,
                    command = %commands[0],
                    error = %e,
                    "Connection died after sending a command that is unsafe to repeat"
                );
                Err(e)
            }
            other => other,
        }
    }

    async fn round_trip(&mut self, commands: &[Command]) -> Result<Vec<Response>, ConnectionError> {
        let deadline = Instant::now() + self.response_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(ConnectionError::Closed);
        };

        match transfer(stream, &self.stats, commands, deadline).await {
            Ok(transfer) => {
                if transfer.discard_stream {
                    debug!(endpoint = %self.endpoint, "Dropping connection after incomplete reply");
                    self.stream = None;
                }
                Ok(transfer.responses)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.stream.is_some())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Writes the batch, then frames one reply per command.
///
/// Returns an error only when nothing at all was received; once reply
/// bytes have arrived, failures degrade to an incomplete [`Response`].
async fn transfer(
    stream: &mut Stream,
    stats: &ConnectionStats,
    commands: &[Command],
    deadline: Instant,
) -> Result<Transfer, ConnectionError> {
    let mut request = Vec::with_capacity(commands.iter().map(|c| c.as_bytes().len()).sum());
    for command in commands {
        request.extend_from_slice(command.as_bytes());
        stats.command_sent();
    }

    match timeout_at(deadline, stream.write_all(&request)).await {
        Ok(result) => result?,
        Err(_) => {
            stats.timed_out();
            warn!(command = %commands[0], "Timed out writing command");
            return Ok(Transfer {
                responses: vec![Response::incomplete(Bytes::new())],
                discard_stream: true,
            });
        }
    }
    stats.bytes_written(request.len());
    trace!(command = %commands[0], count = commands.len(), bytes = request.len(), "Sent command");

    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    let mut responses = Vec::with_capacity(commands.len());
    let mut received = 0;

    for command in commands {
        if !command.expects_reply() {
            responses.push(Response::complete(Bytes::new()));
            continue;
        }

        loop {
            if let Some(len) = frame_response(&buffer, command.class()) {
                responses.push(Response::complete(buffer.split_to(len).freeze()));
                break;
            }

            if buffer.len() >= MAX_RESPONSE_SIZE {
                warn!(command = %command, size = buffer.len(), "Reply size limit exceeded");
                responses.push(Response::incomplete(buffer.split().freeze()));
                return Ok(Transfer {
                    responses,
                    discard_stream: true,
                });
            }

            if buffer.capacity() - buffer.len() < 1024 {
                buffer.reserve(READ_CHUNK_SIZE);
            }

            match timeout_at(deadline, stream.read_buf(&mut buffer)).await {
                Ok(Ok(0)) => {
                    if received == 0 {
                        return Err(ConnectionError::Closed);
                    }
                    debug!(command = %command, buffered = buffer.len(), "Connection closed mid-reply");
                    responses.push(Response::incomplete(buffer.split().freeze()));
                    return Ok(Transfer {
                        responses,
                        discard_stream: true,
                    });
                }
                Ok(Ok(n)) => {
                    received += n;
                    stats.bytes_read(n);
                    trace!(command = %command, bytes = n, buffered = buffer.len(), "Read reply data");
                }
                Ok(Err(e)) => {
                    if received == 0 {
                        return Err(e.into());
                    }
                    debug!(command = %command, error = %e, "Read failed mid-reply");
                    responses.push(Response::incomplete(buffer.split().freeze()));
                    return Ok(Transfer {
                        responses,
                        discard_stream: true,
                    });
                }
                Err(_) => {
                    stats.timed_out();
                    warn!(
                        command = %command,
                        buffered = buffer.len(),
                        "No complete reply before the deadline, returning partial data"
                    );
                    responses.push(Response::incomplete(buffer.split().freeze()));
                    return Ok(Transfer {
                        responses,
                        discard_stream: true,
                    });
                }
            }
        }
    }

    if !buffer.is_empty() {
        warn!(bytes = buffer.len(), "Discarded unexpected data after reply");
        stats.stale_discarded(buffer.len());
    }

    Ok(Transfer {
        responses,
        discard_stream: false,
    })
}

/// Errors that can occur while establishing or using a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The socket could not be opened (refused, DNS failure, no such path)
    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The socket did not open within the connect timeout
    #[error("timed out connecting to {endpoint} after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    /// I/O error on an established socket
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// The server closed the socket before replying
    #[error("connection closed by server")]
    Closed,

    /// The endpoint string could not be parsed
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
}

impl ConnectionError {
    /// True when the socket died under us rather than never opening.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::Closed => true,
            ConnectionError::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
