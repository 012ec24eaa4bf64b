//! Debug adapter process spawner.
//!
//! Spawns an adapter executable and wraps it as a [`Transport`], either over
//! its piped stdio ([`ProcessTransport`]) or over a TCP port it was told to
//! listen on ([`SpawnedSocketTransport`]). Both share one process lifecycle:
//! - `kill_on_drop(true)` so an abandoned transport never leaks a process.
//! - Output that is not protocol traffic is drained line by line into
//!   `DEBUG` logs so a chatty adapter cannot block on a full pipe.
//! - A single monitor task owns the [`Child`]: it reaps the process exactly
//!   once, records the exit code, and signals exit so the client engine
//!   observes it as a transport closure.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dap::transport::{
    BoxFuture, ListenArg, OpenOptions, SocketTransport, StreamTransport, Transport,
};
use crate::{AppError, Result};

/// Transport backed by a spawned adapter process.
#[derive(Debug)]
pub struct ProcessTransport {
    inner: StreamTransport,
    process: AdapterProcess,
}

impl ProcessTransport {
    /// Spawn `command` with `args` and capture its standard streams.
    ///
    /// Must be called from within a tokio runtime: the exit monitor and the
    /// stderr drain are spawned as background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the process cannot be spawned or its
    /// pipes cannot be captured.
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
        kill_grace: Duration,
    ) -> Result<Self> {
        let mut cmd = adapter_command(command, args, cwd, env);
        cmd.stdin(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Io(format!("failed to spawn adapter '{command}': {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Io("failed to capture adapter stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Io("failed to capture adapter stdout".into()))?;

        let label = format!("process {command} (pid {})", child.id().unwrap_or_default());
        info!(transport = %label, "adapter process spawned");

        if let Some(stderr) = child.stderr.take() {
            drain_lines(label.clone(), "stderr", stderr);
        }

        let inner = StreamTransport::new(label.clone(), stdout, stdin);
        let process = AdapterProcess::watch(label, child, inner.peer_gone_token(), kill_grace);

        Ok(Self { inner, process })
    }

    /// OS process id, if the process was still running when spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.pid
    }

    /// Exit code once the process has been reaped; `Some(None)` when it
    /// was terminated by a signal.
    #[must_use]
    pub fn exit_code(&self) -> Option<Option<i32>> {
        self.process.exit_code()
    }
}

impl Transport for ProcessTransport {
    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        self.inner.write(bytes)
    }

    fn read_chunk(&self) -> BoxFuture<'_, Result<Bytes>> {
        self.inner.read_chunk()
    }

    /// Close stdin, stop the process, and wait until it has been reaped.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.inner.close().await;
            self.process.stop().await;
        })
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn label(&self) -> &str {
        self.inner.label()
    }
}

// ── SpawnedSocketTransport ────────────────────────────────────────────────────

/// Transport to an adapter spawned in server mode and reached over TCP.
///
/// The adapter is started with its listen argument appended, then connected
/// to as soon as it accepts. Protocol bytes flow over the socket only; the
/// process's own stdout and stderr go to the logs.
#[derive(Debug)]
pub struct SpawnedSocketTransport {
    socket: SocketTransport,
    process: AdapterProcess,
    port: u16,
}

impl SpawnedSocketTransport {
    /// Spawn `command` listening as described by `listen` and connect to it.
    ///
    /// Waits up to `options.connect_timeout` for the adapter to accept. The
    /// process is stopped again if it never does.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if no free port can be found, the process
    /// cannot be spawned, it exits before listening, or the connection is
    /// not accepted in time.
    pub async fn launch(
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
        listen: &ListenArg,
        options: OpenOptions,
    ) -> Result<Self> {
        let port = match listen.port {
            Some(port) => port,
            None => free_port(&listen.host)?,
        };

        let mut full_args = args.to_vec();
        full_args.push(listen.render(port));

        let mut cmd = adapter_command(command, &full_args, cwd, env);
        cmd.stdin(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Io(format!("failed to spawn adapter '{command}': {err}")))?;

        let label = format!(
            "process {command} (pid {}) on {}:{port}",
            child.id().unwrap_or_default(),
            listen.host
        );
        info!(transport = %label, "adapter server spawned");

        if let Some(stdout) = child.stdout.take() {
            drain_lines(label.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            drain_lines(label.clone(), "stderr", stderr);
        }

        let exited = CancellationToken::new();
        let process = AdapterProcess::watch(label, child, exited.clone(), options.kill_grace);

        let connected = tokio::select! {
            connected = SocketTransport::connect(&listen.host, port, options.connect_timeout) => connected,
            () = exited.cancelled() => Err(AppError::Io(format!(
                "adapter '{command}' exited before listening on {}:{port} ({})",
                listen.host,
                describe_code(process.exit_code().flatten()),
            ))),
        };

        match connected {
            Ok(socket) => Ok(Self {
                socket,
                process,
                port,
            }),
            Err(err) => {
                process.stop().await;
                Err(err)
            }
        }
    }

    /// Port the adapter was told to listen on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// OS process id, if the process was still running when spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.pid
    }

    /// Exit code once the process has been reaped; `Some(None)` when it
    /// was terminated by a signal.
    #[must_use]
    pub fn exit_code(&self) -> Option<Option<i32>> {
        self.process.exit_code()
    }
}

impl Transport for SpawnedSocketTransport {
    fn write<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        self.socket.write(bytes)
    }

    fn read_chunk(&self) -> BoxFuture<'_, Result<Bytes>> {
        self.socket.read_chunk()
    }

    /// Close the socket, then stop the process and wait until it is reaped.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.socket.close().await;
            self.process.stop().await;
        })
    }

    fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    fn label(&self) -> &str {
        self.socket.label()
    }
}

// ── Process lifecycle ─────────────────────────────────────────────────────────

/// A running adapter process, owned by its monitor task.
#[derive(Debug)]
struct AdapterProcess {
    label: String,
    pid: Option<u32>,
    /// Asks the monitor task to stop the child.
    shutdown: CancellationToken,
    exit: Arc<OnceLock<Option<i32>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterProcess {
    /// Hand `child` to a monitor task that cancels `exited` once it is reaped.
    fn watch(label: String, child: Child, exited: CancellationToken, kill_grace: Duration) -> Self {
        let pid = child.id();
        let shutdown = CancellationToken::new();
        let exit = Arc::new(OnceLock::new());
        let monitor = monitor_exit(
            label.clone(),
            child,
            exited,
            shutdown.clone(),
            Arc::clone(&exit),
            kill_grace,
        );
        Self {
            label,
            pid,
            shutdown,
            exit,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    fn exit_code(&self) -> Option<Option<i32>> {
        self.exit.get().copied()
    }

    /// Stop the process and wait until it has been reaped. Idempotent.
    async fn stop(&self) {
        self.shutdown.cancel();

        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(transport = %self.label, %err, "exit monitor task failed");
            }
        }
    }
}

impl Drop for AdapterProcess {
    fn drop(&mut self) {
        // The monitor task still owns the child; let it stop and reap it.
        self.shutdown.cancel();
    }
}

fn adapter_command(
    command: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> Command {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd
}

/// Ask the OS for a port nobody is listening on right now.
fn free_port(host: &str) -> Result<u16> {
    let listener = std::net::TcpListener::bind((host, 0))
        .map_err(|err| AppError::Io(format!("failed to find a free port on {host}: {err}")))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|err| AppError::Io(format!("failed to read bound port: {err}")))
}

// ── Background tasks ─────────────────────────────────────────────────────────

/// Own `child` until it exits, either on its own or because `shutdown`
/// fired. Once reaped, `exited` is cancelled; for stdio transports that
/// lets pending reads finish after consuming what the process already wrote.
fn monitor_exit(
    label: String,
    mut child: Child,
    exited: CancellationToken,
    shutdown: CancellationToken,
    exit: Arc<OnceLock<Option<i32>>>,
    kill_grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            () = shutdown.cancelled() => stop_child(&label, &mut child, kill_grace).await,
        };

        let code = match status {
            Ok(status) => {
                info!(transport = %label, reason = %describe_exit(status), "adapter process exited");
                status.code()
            }
            Err(err) => {
                warn!(transport = %label, %err, "error waiting for adapter process");
                None
            }
        };

        let _ = exit.set(code);
        exited.cancel();
    })
}

/// Ask the child to exit, escalating to a kill after `grace`.
async fn stop_child(label: &str, child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }

    request_terminate(label, child);

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }

    warn!(transport = %label, ?grace, "adapter did not exit within grace period, killing");
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn request_terminate(label: &str, child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(transport = %label, %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn request_terminate(_label: &str, _child: &Child) {}

fn describe_exit(status: ExitStatus) -> String {
    describe_code(status.code())
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(
        || "terminated by signal".to_owned(),
        |code| format!("exited with code {code}"),
    )
}

fn drain_lines<R>(label: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(transport = %label, stream, line = %line, "adapter output"),
                Ok(None) => break,
                Err(err) => {
                    debug!(transport = %label, stream, %err, "adapter output read failed");
                    break;
                }
            }
        }
    });
}
