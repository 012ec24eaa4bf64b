//! DAP client engine.
//!
//! Turns one [`Transport`] into a correlated request/response/event API.
//! Two background tasks run per client:
//!
//! - **reader**: decodes frames, resolves the pending request whose sequence
//!   number matches each response, and fans events out to subscribers.
//! - **writer**: drains an [`mpsc`] queue of outbound frames and writes them
//!   one at a time, reporting each write's outcome back to its caller.
//!
//! Sequence numbers are assigned while holding the queue lock, so the order
//! of sequence numbers is exactly the order frames reach the wire.
//!
//! # Closure
//!
//! End of stream, a read error, or a framing error closes the client:
//! every pending request resolves with the closing cause exactly once and
//! every [`EventStream`] ends. [`DapClient::shutdown`] does the same with a
//! caller-chosen cause.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dap::codec::FrameCodec;
use crate::dap::message::{Event, Message, Request, Response};
use crate::dap::transport::{FrameReader, Transport};
use crate::{AppError, Result};

/// Capacity of the outbound frame queue.
const OUTBOUND_QUEUE: usize = 64;

/// Message sent on behalf of a refused adapter reverse request.
const REVERSE_REQUEST_REFUSAL: &str = "reverse requests are not supported by this client";

// ── Internal state ────────────────────────────────────────────────────────────

/// One frame waiting for the writer task.
struct Outbound {
    message: Message,
    written: Option<oneshot::Sender<Result<()>>>,
}

type Waiter = oneshot::Sender<Result<Response>>;

/// Pending requests keyed by sequence number, plus the closing cause once
/// the client has closed. Both live under one lock so a request can never
/// be registered after the drain.
#[derive(Default)]
struct PendingTable {
    waiters: HashMap<i64, Waiter>,
    closed: Option<AppError>,
}

#[derive(Default)]
struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<Event>>,
    closed: bool,
}

struct ClientShared {
    label: String,
    transport: Arc<dyn Transport>,
    /// Next sequence number; the lock also orders enqueueing.
    next_seq: Mutex<i64>,
    outbound: mpsc::Sender<Outbound>,
    pending: Mutex<PendingTable>,
    subscribers: Mutex<Subscribers>,
    anomalies: AtomicU64,
    cancel: CancellationToken,
}

// ── DapClient ─────────────────────────────────────────────────────────────────

/// Correlating client over one adapter connection.
pub struct DapClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for DapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DapClient")
            .field("transport", &self.shared.label)
            .field("closed", &self.shared.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl DapClient {
    /// Start the reader and writer tasks over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(transport: Arc<dyn Transport>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let shared = Arc::new(ClientShared {
            label: transport.label().to_owned(),
            transport: Arc::clone(&transport),
            next_seq: Mutex::new(1),
            outbound: outbound_tx,
            pending: Mutex::new(PendingTable::default()),
            subscribers: Mutex::new(Subscribers::default()),
            anomalies: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_writer(Arc::clone(&shared), outbound_rx));
        tokio::spawn(run_reader(Arc::clone(&shared), FrameReader::new(transport)));

        debug!(transport = %shared.label, "dap client started");
        Self { shared }
    }

    /// Send a request and suspend until its response arrives.
    ///
    /// # Errors
    ///
    /// - [`AppError::Adapter`] if the adapter answers with `success: false`.
    /// - The closing cause (normally [`AppError::TransportClosed`]) if the
    ///   connection ends before the response.
    /// - [`AppError::Io`] if writing this request fails.
    pub async fn send_request(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        self.issue(command, arguments).await?.wait().await
    }

    /// Send a request without waiting for its response.
    ///
    /// Returns once the frame has been written. The returned handle may be
    /// awaited later or dropped; dropping it leaves the request registered
    /// until the adapter answers or the client closes.
    ///
    /// # Errors
    ///
    /// Fails with the closing cause if the client is closed, or with the
    /// write error if this frame could not be written.
    pub async fn issue(&self, command: &str, arguments: Option<Value>) -> Result<PendingResponse> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        let (written_tx, written_rx) = oneshot::channel();

        let seq = {
            let mut next_seq = self.shared.next_seq.lock().await;
            let seq = *next_seq;

            {
                let mut pending = self.shared.pending.lock().await;
                if let Some(cause) = &pending.closed {
                    return Err(cause.clone());
                }
                pending.waiters.insert(seq, waiter_tx);
            }

            let outbound = Outbound {
                message: Message::Request(Request {
                    seq,
                    command: command.to_owned(),
                    arguments,
                }),
                written: Some(written_tx),
            };
            if self.shared.outbound.send(outbound).await.is_err() {
                self.shared.forget(seq).await;
                return Err(self.shared.closed_cause().await);
            }

            *next_seq += 1;
            seq
        };

        debug!(transport = %self.shared.label, seq, command, "request queued");

        match written_rx.await {
            Ok(Ok(())) => Ok(PendingResponse {
                seq,
                command: command.to_owned(),
                rx: waiter_rx,
            }),
            Ok(Err(err)) => {
                self.shared.forget(seq).await;
                Err(err)
            }
            Err(_) => {
                self.shared.forget(seq).await;
                Err(self.shared.closed_cause().await)
            }
        }
    }

    /// Subscribe to every event that arrives from now on.
    ///
    /// Events received before this call are not replayed. The stream ends
    /// when the client closes; subscribing to a closed client yields an
    /// already-ended stream.
    pub async fn subscribe_events(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.shared.subscribers.lock().await;
        if !subscribers.closed {
            subscribers.senders.push(tx);
        }
        EventStream { rx }
    }

    /// Close with [`AppError::TransportClosed`] as the cause.
    pub async fn close(&self) {
        self.shutdown(AppError::TransportClosed("closed by client".into()))
            .await;
    }

    /// Close the transport, resolve every pending request with `cause`, and
    /// end all event streams. Later calls are no-ops.
    pub async fn shutdown(&self, cause: AppError) {
        shutdown(&self.shared, cause).await;
    }

    /// Whether the client has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// The cause the client closed with, if it has closed.
    pub async fn close_cause(&self) -> Option<AppError> {
        self.shared.pending.lock().await.closed.clone()
    }

    /// Number of requests still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.waiters.len()
    }

    /// Number of responses that matched no pending request.
    #[must_use]
    pub fn anomaly_count(&self) -> u64 {
        self.shared.anomalies.load(Ordering::Relaxed)
    }

    /// Description of the underlying transport.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

impl Drop for DapClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

// ── PendingResponse ───────────────────────────────────────────────────────────

/// Handle to a written request whose response has not been awaited yet.
#[derive(Debug)]
pub struct PendingResponse {
    seq: i64,
    command: String,
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingResponse {
    /// Sequence number the request was sent with.
    #[must_use]
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Command the request was sent with.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Suspend until the response arrives.
    ///
    /// # Errors
    ///
    /// [`AppError::Adapter`] for a failed response, or the client's closing
    /// cause if it closed first.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(cause)) => Err(cause),
            Err(_) => Err(AppError::TransportClosed(format!(
                "client dropped while '{}' was pending",
                self.command
            ))),
        }
    }
}

// ── EventStream ───────────────────────────────────────────────────────────────

/// Per-subscriber sequence of events, in arrival order.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Next event, or `None` once the client has closed.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

impl ClientShared {
    async fn forget(&self, seq: i64) {
        self.pending.lock().await.waiters.remove(&seq);
    }

    async fn closed_cause(&self) -> AppError {
        self.pending
            .lock()
            .await
            .closed
            .clone()
            .unwrap_or_else(|| AppError::TransportClosed(format!("{} is closed", self.label)))
    }

    async fn resolve(&self, response: Response) {
        let waiter = self.pending.lock().await.waiters.remove(&response.request_seq);

        match waiter {
            Some(waiter) => {
                debug!(
                    transport = %self.label,
                    request_seq = response.request_seq,
                    command = %response.command,
                    success = response.success,
                    "response matched"
                );
                // The caller may have stopped waiting; that is not an error.
                let _ = waiter.send(Ok(response));
            }
            None => {
                self.anomalies.fetch_add(1, Ordering::Relaxed);
                warn!(
                    transport = %self.label,
                    request_seq = response.request_seq,
                    command = %response.command,
                    "protocol anomaly: response matches no pending request, dropped"
                );
            }
        }
    }

    async fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.senders.is_empty() {
            debug!(transport = %self.label, event = %event.event, "event discarded, no subscribers");
            return;
        }

        debug!(transport = %self.label, seq = event.seq, event = %event.event, "event received");
        subscribers
            .senders
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Answer an adapter reverse request with a failure response.
    ///
    /// Runs on the reader task and never waits. The refusal is dropped when
    /// the sequence lock is held or the outbound queue is full.
    fn refuse(&self, request: Request) {
        warn!(
            transport = %self.label,
            seq = request.seq,
            command = %request.command,
            "refusing adapter reverse request"
        );

        let Ok(mut next_seq) = self.next_seq.try_lock() else {
            warn!(
                transport = %self.label,
                seq = request.seq,
                "sequence lock busy, refusal dropped"
            );
            return;
        };
        let outbound = Outbound {
            message: Message::Response(Response {
                seq: *next_seq,
                request_seq: request.seq,
                success: false,
                command: request.command,
                message: Some(REVERSE_REQUEST_REFUSAL.into()),
                body: None,
            }),
            written: None,
        };
        match self.outbound.try_send(outbound) {
            Ok(()) => *next_seq += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    transport = %self.label,
                    seq = request.seq,
                    "outbound queue full, refusal dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn shutdown(shared: &ClientShared, cause: AppError) {
    let drained = {
        let mut pending = shared.pending.lock().await;
        if pending.closed.is_some() {
            return;
        }
        pending.closed = Some(cause.clone());
        std::mem::take(&mut pending.waiters)
    };

    {
        let mut subscribers = shared.subscribers.lock().await;
        subscribers.closed = true;
        subscribers.senders.clear();
    }

    info!(
        transport = %shared.label,
        cause = %cause,
        pending = drained.len(),
        "dap client closing"
    );

    for (_, waiter) in drained {
        let _ = waiter.send(Err(cause.clone()));
    }

    shared.cancel.cancel();
    shared.transport.close().await;
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn run_writer(shared: Arc<ClientShared>, mut rx: mpsc::Receiver<Outbound>) {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();

    loop {
        let outbound = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        buf.clear();
        let seq = outbound.message.seq();
        let result = match codec.encode(&outbound.message, &mut buf) {
            Ok(()) => shared.transport.write(&buf).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => debug!(transport = %shared.label, seq, kind = outbound.message.kind(), "frame written"),
            Err(err) => warn!(transport = %shared.label, seq, %err, "frame write failed"),
        }

        if let Some(written) = outbound.written {
            let _ = written.send(result);
        }
    }

    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        if let Some(written) = outbound.written {
            let _ = written.send(Err(shared.closed_cause().await));
        }
    }
    debug!(transport = %shared.label, "writer task stopped");
}

async fn run_reader(shared: Arc<ClientShared>, mut frames: FrameReader) {
    let cause = loop {
        let next = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => {
                debug!(transport = %shared.label, "reader task cancelled");
                return;
            }
            next = frames.next_message() => next,
        };

        match next {
            Ok(Some(Message::Response(response))) => shared.resolve(response).await,
            Ok(Some(Message::Event(event))) => shared.publish(event).await,
            Ok(Some(Message::Request(request))) => shared.refuse(request),
            Ok(None) => {
                break AppError::TransportClosed(format!("{} reached end of stream", shared.label));
            }
            Err(AppError::Framing(msg)) => {
                warn!(transport = %shared.label, error = %msg, "framing error, closing connection");
                break AppError::TransportClosed(format!("framing error: {msg}"));
            }
            Err(err) => {
                warn!(transport = %shared.label, %err, "read failed, closing connection");
                break err;
            }
        }
    };

    shutdown(&shared, cause).await;
}
