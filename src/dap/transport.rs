//! Byte-stream transports for debug adapters.
//!
//! [`Transport`] is the only surface the client engine sees. Three concrete
//! endpoints implement it:
//!
//! - [`ProcessTransport`](crate::dap::spawner::ProcessTransport): spawns the
//!   adapter and talks over its stdin/stdout.
//! - [`SocketTransport`]: connects to an adapter listening on `host:port`.
//! - [`SpawnedSocketTransport`](crate::dap::spawner::SpawnedSocketTransport):
//!   spawns an adapter that serves DAP on a TCP port, then connects to it.
//!
//! All of them delegate the byte plumbing to [`StreamTransport`], which wraps any
//! `AsyncRead`/`AsyncWrite` pair and can be used directly (for example over
//! [`tokio::io::duplex`] pipes).

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dap::codec::FrameCodec;
use crate::dap::message::Message;
use crate::dap::spawner::{ProcessTransport, SpawnedSocketTransport};
use crate::{AppError, Result};

/// Read buffer size for a single [`Transport::read_chunk`] call.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Delay between socket connection attempts.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Boxed future returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How to reach one adapter instance. Produced by endpoint resolution
/// (see [`crate::adapters`]) and consumed by [`open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEndpoint {
    /// Spawn the adapter and use its standard streams.
    Process {
        /// Executable to run.
        command: String,
        /// Arguments passed to the executable.
        args: Vec<String>,
        /// Working directory for the adapter process.
        cwd: Option<PathBuf>,
        /// Extra environment variables layered over the inherited ones.
        env: HashMap<String, String>,
    },
    /// Connect to an adapter already listening on a TCP port.
    Socket {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Spawn the adapter in server mode and connect to the port it listens on.
    SpawnSocket {
        /// Executable to run.
        command: String,
        /// Arguments passed before the listen argument.
        args: Vec<String>,
        /// Working directory for the adapter process.
        cwd: Option<PathBuf>,
        /// Extra environment variables layered over the inherited ones.
        env: HashMap<String, String>,
        /// Where the adapter is told to listen.
        listen: ListenArg,
    },
}

/// The argument that tells a spawned adapter where to listen.
///
/// `{host}` and `{port}` in `template` are substituted when the adapter is
/// started, e.g. `--listen={host}:{port}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenArg {
    /// Argument template appended after the adapter's own arguments.
    pub template: String,
    /// Interface the adapter binds and the bridge connects to.
    pub host: String,
    /// Fixed port; a free one is picked at start when `None`.
    pub port: Option<u16>,
}

impl ListenArg {
    /// Loopback listener on a free port.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            host: "127.0.0.1".to_owned(),
            port: None,
        }
    }

    /// The argument for `port`.
    #[must_use]
    pub fn render(&self, port: u16) -> String {
        self.template
            .replace("{host}", &self.host)
            .replace("{port}", &port.to_string())
    }
}

impl AdapterEndpoint {
    /// Endpoint that spawns `command` with `args` and no overrides.
    #[must_use]
    pub fn process(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::Process {
            command: command.into(),
            args,
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// Endpoint that spawns `command` and connects to it on a free loopback
    /// port announced through `template`.
    #[must_use]
    pub fn spawn_socket(
        command: impl Into<String>,
        args: Vec<String>,
        template: impl Into<String>,
    ) -> Self {
        Self::SpawnSocket {
            command: command.into(),
            args,
            cwd: None,
            env: HashMap::new(),
            listen: ListenArg::new(template),
        }
    }

    /// Endpoint that connects to `host:port`.
    #[must_use]
    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Self::Socket {
            host: host.into(),
            port,
        }
    }
}

/// Options that govern how an endpoint is opened.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// How long to keep retrying a socket connection, including waiting for
    /// a spawned adapter to start listening.
    pub connect_timeout: Duration,
    /// Grace period between `SIGTERM` and a forced kill on close.
    pub kill_grace: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// A bidirectional byte stream to one adapter.
///
/// Implementations guarantee that [`Transport::close`] is idempotent and that
/// a [`Transport::read_chunk`] blocked at the time of closing returns an
/// empty chunk (end of stream).
pub trait Transport: Send + Sync + Debug {
    /// Write all of `bytes` to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] once closed, or
    /// [`AppError::Io`] if the underlying write fails.
    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Suspend until at least one byte is available; an empty chunk means
    /// end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] if the underlying read fails.
    fn read_chunk(&self) -> BoxFuture<'_, Result<Bytes>>;

    /// Close the stream and release its resources. Safe to call repeatedly.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Whether [`Transport::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Short description for log fields.
    fn label(&self) -> &str;
}

/// Open a transport for `endpoint`.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the process cannot be spawned, exits before
/// listening, or the socket cannot be connected within
/// `options.connect_timeout`.
pub async fn open(endpoint: &AdapterEndpoint, options: OpenOptions) -> Result<Arc<dyn Transport>> {
    match endpoint {
        AdapterEndpoint::Process {
            command,
            args,
            cwd,
            env,
        } => {
            let transport =
                ProcessTransport::spawn(command, args, cwd.as_deref(), env, options.kill_grace)?;
            Ok(Arc::new(transport))
        }
        AdapterEndpoint::Socket { host, port } => {
            let transport = SocketTransport::connect(host, *port, options.connect_timeout).await?;
            Ok(Arc::new(transport))
        }
        AdapterEndpoint::SpawnSocket {
            command,
            args,
            cwd,
            env,
            listen,
        } => {
            let transport =
                SpawnedSocketTransport::launch(command, args, cwd.as_deref(), env, listen, options)
                    .await?;
            Ok(Arc::new(transport))
        }
    }
}

// ── StreamTransport ───────────────────────────────────────────────────────────

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport over an arbitrary reader/writer pair.
pub struct StreamTransport {
    label: String,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    /// Fired by [`Transport::close`]; reads end immediately.
    closed: CancellationToken,
    /// Fired when the peer is known to be gone; reads end once buffered
    /// bytes are drained.
    peer_gone: CancellationToken,
}

impl StreamTransport {
    /// Wrap `reader` and `writer` as one transport.
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            label: label.into(),
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Some(Box::new(writer))),
            closed: CancellationToken::new(),
            peer_gone: CancellationToken::new(),
        }
    }

    /// Token that, once cancelled, ends reading after the buffered bytes.
    pub(crate) fn peer_gone_token(&self) -> CancellationToken {
        self.peer_gone.clone()
    }
}

impl Debug for StreamTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("label", &self.label)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Transport for StreamTransport {
    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut guard = tokio::select! {
                biased;
                () = self.closed.cancelled() => {
                    return Err(AppError::TransportClosed(format!("{} is closed", self.label)));
                }
                guard = self.writer.lock() => guard,
            };
            let Some(writer) = guard.as_mut() else {
                return Err(AppError::TransportClosed(format!("{} is closed", self.label)));
            };

            tokio::select! {
                biased;
                () = self.closed.cancelled() => {
                    Err(AppError::TransportClosed(format!("{} closed during write", self.label)))
                }
                written = async {
                    writer.write_all(bytes).await?;
                    writer.flush().await
                } => written.map_err(|err| AppError::Io(format!("write failed: {err}"))),
            }
        })
    }

    fn read_chunk(&self) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Ok(Bytes::new());
            }

            let mut guard = self.reader.lock().await;
            let Some(reader) = guard.as_mut() else {
                return Ok(Bytes::new());
            };

            let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);
            let outcome = tokio::select! {
                biased;
                () = self.closed.cancelled() => Ok(0),
                read = reader.read_buf(&mut buf) => read,
                () = self.peer_gone.cancelled() => Ok(0),
            };

            match outcome {
                Ok(0) => {
                    *guard = None;
                    Ok(Bytes::new())
                }
                Ok(_) => Ok(buf.freeze()),
                Err(err) => {
                    *guard = None;
                    Err(AppError::TransportClosed(format!("read failed: {err}")))
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return;
            }
            self.closed.cancel();

            if let Some(mut writer) = self.writer.lock().await.take() {
                if let Err(err) = writer.shutdown().await {
                    debug!(transport = %self.label, %err, "writer shutdown failed");
                }
            }
            // A reader blocked in `read_chunk` holds the lock and drops itself.
            if let Ok(mut reader) = self.reader.try_lock() {
                reader.take();
            }
            debug!(transport = %self.label, "stream transport closed");
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

// ── SocketTransport ───────────────────────────────────────────────────────────

/// Transport connected to an adapter over TCP.
#[derive(Debug)]
pub struct SocketTransport {
    inner: StreamTransport,
}

impl SocketTransport {
    /// Connect to `host:port`, retrying until `timeout` elapses.
    ///
    /// Adapters started out-of-band may not be listening yet when the
    /// session is created, so refused connections are retried. Each attempt
    /// is itself cut off at the deadline, so a peer that never answers the
    /// SYN cannot hold the caller past `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] with the last connection error once the
    /// deadline passes.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;

        let stream = loop {
            let attempt = tokio::time::timeout_at(deadline, TcpStream::connect((host, port)));
            let err = match attempt.await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("no answer within {timeout:?}"),
            };
            if tokio::time::Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
                return Err(AppError::Io(format!(
                    "failed to connect to {host}:{port}: {err}"
                )));
            }
            debug!(host, port, %err, "adapter socket not ready, retrying");
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
        };

        stream
            .set_nodelay(true)
            .map_err(|err| AppError::Io(format!("failed to set TCP_NODELAY: {err}")))?;

        let label = format!("socket {host}:{port}");
        info!(transport = %label, "connected to adapter socket");

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            inner: StreamTransport::new(label, read_half, write_half),
        })
    }
}

impl Transport for SocketTransport {
    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        self.inner.write(bytes)
    }

    fn read_chunk(&self) -> BoxFuture<'_, Result<Bytes>> {
        self.inner.read_chunk()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn label(&self) -> &str {
        self.inner.label()
    }
}

// ── FrameReader ───────────────────────────────────────────────────────────────

/// Pulls whole [`Message`]s out of a transport's chunk stream.
///
/// Chunks are accumulated until [`FrameCodec`] can produce a frame, so a
/// header or body split across any number of reads decodes correctly.
#[derive(Debug)]
pub struct FrameReader {
    transport: Arc<dyn Transport>,
    codec: FrameCodec,
    buf: BytesMut,
}

impl FrameReader {
    /// Create a reader over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            codec: FrameCodec::new(),
            buf: BytesMut::new(),
        }
    }

    /// Read the next message; `Ok(None)` on a clean end of stream.
    ///
    /// # Errors
    ///
    /// - [`AppError::Framing`] for malformed frames or a stream that ends
    ///   mid-frame.
    /// - [`AppError::TransportClosed`] if the underlying read fails.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(message));
            }

            let chunk = self.transport.read_chunk().await?;
            if chunk.is_empty() {
                return self.codec.decode_eof(&mut self.buf);
            }
            self.buf.extend_from_slice(&chunk);
        }
    }
}
