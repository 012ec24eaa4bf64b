//! Shared helpers for integration tests.
//!
//! Provides an in-memory peer for driving a `DapClient` frame by frame, and
//! a scripted stub adapter listening on a local TCP port for session and
//! registry tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dap_bridge::config::TimeoutConfig;
use dap_bridge::dap::codec::{self, FrameCodec};
use dap_bridge::dap::message::{Event, Message, Request, Response};
use dap_bridge::dap::transport::{AdapterEndpoint, FrameReader, StreamTransport, Transport};
use dap_bridge::models::session::SessionState;
use dap_bridge::orchestrator::{DebugSession, SessionRequest, SessionSettings, StartRequest};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

/// Bound on every helper wait.
pub const WAIT: Duration = Duration::from_secs(5);

/// Settings with short timeouts for tests.
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        timeouts: TimeoutConfig {
            request_seconds: 5,
            handshake_seconds: 5,
            terminate_seconds: 1,
            connect_seconds: 5,
            stop_wait_seconds: 5,
        },
        output_buffer_lines: 100,
    }
}

/// Poll until `session` reaches `state`.
pub async fn wait_for_state(session: &DebugSession, state: SessionState) {
    tokio::time::timeout(WAIT, async {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never reached {state}, still {}", session.state()));
}

// ── In-memory peer ───────────────────────────────────────────────────────────

/// Two transports joined by an in-memory pipe: (client side, peer side).
pub fn duplex_transports() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
    let (client, peer) = tokio::io::duplex(256 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (peer_read, peer_write) = tokio::io::split(peer);
    (
        Arc::new(StreamTransport::new("duplex client", client_read, client_write)),
        Arc::new(StreamTransport::new("duplex peer", peer_read, peer_write)),
    )
}

/// The adapter end of an in-memory connection.
pub struct Peer {
    transport: Arc<dyn Transport>,
    reader: FrameReader,
    seq: i64,
}

impl Peer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            reader: FrameReader::new(Arc::clone(&transport)),
            transport,
            seq: 0,
        }
    }

    /// Next message the client sent.
    pub async fn next_message(&mut self) -> Message {
        tokio::time::timeout(WAIT, self.reader.next_message())
            .await
            .expect("client sent nothing in time")
            .expect("decode client frame")
            .expect("client closed the stream")
    }

    /// Next request the client sent.
    pub async fn next_request(&mut self) -> Request {
        match self.next_message().await {
            Message::Request(request) => request,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    pub async fn send(&mut self, message: &Message) {
        let bytes = codec::encode(message).expect("encode");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&self, bytes: &[u8]) {
        self.transport.write(bytes).await.expect("peer write");
    }

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    pub async fn respond(&mut self, request: &Request, body: Value) {
        self.respond_to(request.seq, &request.command, body).await;
    }

    pub async fn respond_to(&mut self, request_seq: i64, command: &str, body: Value) {
        let seq = self.next_seq();
        self.send(&Message::Response(Response {
            seq,
            request_seq,
            success: true,
            command: command.into(),
            message: None,
            body: Some(body),
        }))
        .await;
    }

    pub async fn fail(&mut self, request: &Request, id: i64, format: &str) {
        let seq = self.next_seq();
        self.send(&Message::Response(Response {
            seq,
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some("failed".into()),
            body: Some(json!({ "error": { "id": id, "format": format } })),
        }))
        .await;
    }

    pub async fn event(&mut self, name: &str, body: Value) {
        let seq = self.next_seq();
        self.send(&Message::Event(Event {
            seq,
            event: name.into(),
            body: Some(body),
        }))
        .await;
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

// ── Stub adapter over TCP ────────────────────────────────────────────────────

/// Scripted reactions of a [`StubAdapter`].
#[derive(Debug, Clone, Default)]
pub struct StubScript {
    /// Emit a `stopped` (entry) event right after `configurationDone`.
    pub stop_on_entry: bool,
    /// Commands that are recorded but never answered.
    pub hold: HashSet<String>,
    /// Commands answered with a failure carrying this text.
    pub fail: HashMap<String, String>,
    /// Do not send the `initialized` event.
    pub skip_initialized: bool,
}

enum Control {
    Event(String, Value),
    HangUp,
}

/// A minimal adapter that accepts one connection on `127.0.0.1`.
pub struct StubAdapter {
    pub port: u16,
    control: mpsc::UnboundedSender<Control>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl StubAdapter {
    pub async fn start(script: StubScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let port = listener.local_addr().expect("stub addr").port();
        let (control, control_rx) = mpsc::unbounded_channel();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            run_stub(stream, script, control_rx, recorded).await;
        });

        Self {
            port,
            control,
            requests,
        }
    }

    /// Session request that connects to this stub and launches `main.src`.
    pub fn session_request(&self) -> SessionRequest {
        SessionRequest::new(
            "stub",
            AdapterEndpoint::socket("127.0.0.1", self.port),
            StartRequest::Launch(json!({ "program": "main.src" })),
        )
    }

    pub fn emit(&self, event: &str, body: Value) {
        let _ = self.control.send(Control::Event(event.into(), body));
    }

    pub fn hang_up(&self) {
        let _ = self.control.send(Control::HangUp);
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }

    /// Every request received with `command`.
    pub fn requests_for(&self, command: &str) -> Vec<Request> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|r| r.command == command)
            .cloned()
            .collect()
    }

    /// Wait until `command` has been received.
    pub async fn wait_for_command(&self, command: &str) {
        tokio::time::timeout(WAIT, async {
            while !self.commands().iter().any(|c| c == command) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("stub never received '{command}'"));
    }
}

struct StubWriter {
    stream: tokio::net::tcp::OwnedWriteHalf,
    seq: i64,
}

impl StubWriter {
    async fn send(&mut self, message: Message) -> bool {
        let bytes = codec::encode(&message).expect("encode");
        self.stream.write_all(&bytes).await.is_ok()
    }

    async fn respond(&mut self, request: &Request, body: Value) -> bool {
        self.seq += 1;
        self.send(Message::Response(Response {
            seq: self.seq,
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body: Some(body),
        }))
        .await
    }

    async fn fail(&mut self, request: &Request, text: &str) -> bool {
        self.seq += 1;
        self.send(Message::Response(Response {
            seq: self.seq,
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(text.into()),
            body: Some(json!({ "error": { "id": 1, "format": text } })),
        }))
        .await
    }

    async fn event(&mut self, event: &str, body: Value) -> bool {
        self.seq += 1;
        self.send(Message::Event(Event {
            seq: self.seq,
            event: event.into(),
            body: Some(body),
        }))
        .await
    }
}

async fn run_stub(
    stream: tokio::net::TcpStream,
    script: StubScript,
    mut control: mpsc::UnboundedReceiver<Control>,
    recorded: Arc<Mutex<Vec<Request>>>,
) {
    let (read, write) = stream.into_split();
    let mut frames = FramedRead::new(read, FrameCodec::new());
    let mut writer = StubWriter {
        stream: write,
        seq: 0,
    };
    let mut next_breakpoint_id = 0_i64;

    loop {
        tokio::select! {
            frame = frames.next() => {
                let Some(Ok(Message::Request(request))) = frame else {
                    break;
                };
                recorded.lock().expect("requests lock").push(request.clone());
                if !answer(&mut writer, &script, &request, &mut next_breakpoint_id).await {
                    break;
                }
            }
            control = control.recv() => match control {
                Some(Control::Event(name, body)) => {
                    if !writer.event(&name, body).await {
                        break;
                    }
                }
                Some(Control::HangUp) | None => break,
            },
        }
    }
}

/// Answer one request; false once the stub should hang up.
async fn answer(
    writer: &mut StubWriter,
    script: &StubScript,
    request: &Request,
    next_breakpoint_id: &mut i64,
) -> bool {
    if script.hold.contains(&request.command) {
        return true;
    }
    if let Some(text) = script.fail.get(&request.command) {
        return writer.fail(request, text).await;
    }

    let args = request.arguments.clone().unwrap_or(Value::Null);
    match request.command.as_str() {
        "initialize" => {
            let ok = writer
                .respond(
                    request,
                    json!({ "supportsConfigurationDoneRequest": true, "supportsTerminateRequest": true }),
                )
                .await;
            if script.skip_initialized {
                ok
            } else {
                ok && writer.event("initialized", json!({})).await
            }
        }
        "configurationDone" => {
            let ok = writer.respond(request, json!({})).await;
            if script.stop_on_entry {
                ok && writer
                    .event("stopped", json!({ "reason": "entry", "threadId": 1, "allThreadsStopped": true }))
                    .await
            } else {
                ok
            }
        }
        "setBreakpoints" => {
            let requested = args
                .get("breakpoints")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let answered: Vec<Value> = requested
                .iter()
                .map(|bp| {
                    *next_breakpoint_id += 1;
                    json!({ "id": *next_breakpoint_id, "verified": true, "line": bp.get("line") })
                })
                .collect();
            writer
                .respond(request, json!({ "breakpoints": answered }))
                .await
        }
        "continue" => writer.respond(request, json!({ "allThreadsContinued": true })).await,
        "threads" => {
            writer
                .respond(request, json!({ "threads": [{ "id": 1, "name": "MainThread" }] }))
                .await
        }
        "stackTrace" => {
            writer
                .respond(
                    request,
                    json!({ "stackFrames": [
                        { "id": 100, "name": "main", "line": 10, "column": 1, "source": { "path": "main.src" } },
                        { "id": 101, "name": "start", "line": 2, "column": 1 }
                    ], "totalFrames": 2 }),
                )
                .await
        }
        "scopes" => {
            writer
                .respond(
                    request,
                    json!({ "scopes": [{ "name": "Locals", "variablesReference": 5, "expensive": false }] }),
                )
                .await
        }
        "variables" => {
            writer
                .respond(
                    request,
                    json!({ "variables": [{ "name": "x", "value": "1", "type": "int", "variablesReference": 0 }] }),
                )
                .await
        }
        "evaluate" => {
            writer
                .respond(request, json!({ "result": "2", "type": "int", "variablesReference": 0 }))
                .await
        }
        "disconnect" => {
            writer.respond(request, json!({})).await;
            false
        }
        _ => writer.respond(request, json!({})).await,
    }
}
