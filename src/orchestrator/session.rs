//! Debug session state machine.
//!
//! A [`DebugSession`] owns one [`DapClient`] and the session's mutable
//! state. All state lives in one [`watch`] channel, which is the single
//! mutual-exclusion boundary: the event consumer and the operation methods
//! both mutate through `send_modify`/`send_if_modified`, and waiters
//! (`wait_for_stop`, the handshake, the registry watcher) observe changes
//! through receivers.
//!
//! Operations validate the current state first, then issue their request.
//! Debuggee queries always perform a live request.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, TimeoutConfig};
use crate::dap::client::DapClient;
use crate::dap::transport::{self, OpenOptions, Transport};
use crate::models::debug::{
    Breakpoint, EvaluateResult, OutputLine, Scope, SourceLocation, StackFrame, Thread, Variable,
    WireBreakpoint,
};
use crate::models::session::{SessionId, SessionInfo, SessionState, StopDescription};
use crate::orchestrator::events;
use crate::orchestrator::handshake::{self, BreakpointRequest, SessionRequest};
use crate::{AppError, Result};

/// Per-session limits taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
    /// Output lines retained before the oldest are dropped.
    pub output_buffer_lines: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for SessionSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            timeouts: config.timeouts.clone(),
            output_buffer_lines: config.output_buffer_lines,
        }
    }
}

/// Mutable session state guarded by the session's watch channel.
#[derive(Debug, Clone)]
pub(crate) struct SessionData {
    pub state: SessionState,
    pub stop: Option<StopDescription>,
    /// Bumped on every stop and resume, so a late resume acknowledgement
    /// cannot clear a newer stop.
    pub stop_generation: u64,
    pub initialized: bool,
    pub threads: BTreeSet<i64>,
    pub breakpoints: BTreeMap<SourceLocation, Breakpoint>,
    pub capabilities: Option<Value>,
    pub exit_code: Option<i64>,
    pub output: VecDeque<OutputLine>,
    pub output_limit: usize,
    pub termination_cause: Option<String>,
}

impl SessionData {
    pub(crate) fn new(output_limit: usize) -> Self {
        Self {
            state: SessionState::Created,
            stop: None,
            stop_generation: 0,
            initialized: false,
            threads: BTreeSet::new(),
            breakpoints: BTreeMap::new(),
            capabilities: None,
            exit_code: None,
            output: VecDeque::new(),
            output_limit,
            termination_cause: None,
        }
    }
}

/// One live connection to one debug adapter.
pub struct DebugSession {
    id: SessionId,
    adapter: String,
    created_at: DateTime<Utc>,
    client: DapClient,
    data: watch::Sender<SessionData>,
    /// Serializes `setBreakpoints` round trips, which replace a whole file.
    breakpoint_lock: Mutex<()>,
    settings: SessionSettings,
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.id)
            .field("adapter", &self.adapter)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DebugSession {
    /// Open the request's endpoint and start a session over it.
    ///
    /// # Errors
    ///
    /// Returns the spawn/connect failure, or the handshake failure verbatim.
    pub async fn open(
        id: SessionId,
        request: &SessionRequest,
        settings: SessionSettings,
    ) -> Result<Arc<Self>> {
        let options = OpenOptions {
            connect_timeout: settings.timeouts.connect(),
            ..OpenOptions::default()
        };
        let transport = transport::open(&request.endpoint, options).await?;
        Self::start(id, request, transport, settings).await
    }

    /// Start a session over an already open transport and run the
    /// handshake. On failure the transport is closed.
    ///
    /// # Errors
    ///
    /// Returns the handshake failure verbatim.
    pub async fn start(
        id: SessionId,
        request: &SessionRequest,
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
    ) -> Result<Arc<Self>> {
        let client = DapClient::start(transport);
        // Subscribe before the first request so no event can be missed.
        let events = client.subscribe_events().await;

        let (data, _) = watch::channel(SessionData::new(settings.output_buffer_lines));
        let session = Arc::new(Self {
            id,
            adapter: request.adapter.clone(),
            created_at: Utc::now(),
            client,
            data,
            breakpoint_lock: Mutex::new(()),
            settings,
        });
        events::spawn_consumer(Arc::downgrade(&session), events);

        info!(
            session_id = %session.id,
            adapter = %session.adapter,
            transport = %session.client.label(),
            "session created"
        );

        if let Err(err) = handshake::run(&session, request).await {
            warn!(session_id = %session.id, %err, "handshake failed");
            if session.begin_terminating() {
                session
                    .shut_down(
                        session.settings.timeouts.terminate(),
                        &format!("failed to start: {err}"),
                    )
                    .await;
            }
            return Err(err);
        }

        Ok(session)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Adapter name.
    #[must_use]
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.data.borrow().state
    }

    /// Most recent stop, while stopped.
    #[must_use]
    pub fn stop(&self) -> Option<StopDescription> {
        self.data.borrow().stop.clone()
    }

    /// Adapter capabilities from `initialize`.
    #[must_use]
    pub fn capabilities(&self) -> Option<Value> {
        self.data.borrow().capabilities.clone()
    }

    /// Recorded breakpoints ordered by location.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.data.borrow().breakpoints.values().cloned().collect()
    }

    /// Thread identifiers seen so far.
    #[must_use]
    pub fn known_threads(&self) -> Vec<i64> {
        self.data.borrow().threads.iter().copied().collect()
    }

    /// Snapshot of the session.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        let data = self.data.borrow();
        SessionInfo {
            id: self.id.clone(),
            adapter: self.adapter.clone(),
            state: data.state,
            stop: data.stop.clone(),
            threads: data.threads.iter().copied().collect(),
            breakpoints: data.breakpoints.len(),
            has_capabilities: data.capabilities.is_some(),
            exit_code: data.exit_code,
            termination_cause: data.termination_cause.clone(),
            created_at: self.created_at,
        }
    }

    /// Number of responses the adapter sent for unknown requests.
    #[must_use]
    pub fn protocol_anomalies(&self) -> u64 {
        self.client.anomaly_count()
    }

    // ── Breakpoints ───────────────────────────────────────────────────────────

    /// Set or replace the breakpoint at `location`.
    ///
    /// Setting the same location twice replaces the stored record.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless the session is running or stopped;
    /// otherwise the request's failure.
    pub async fn set_breakpoint(
        &self,
        location: SourceLocation,
        condition: Option<String>,
    ) -> Result<Breakpoint> {
        self.ensure("set_breakpoint", SessionState::is_live)?;
        let _guard = self.breakpoint_lock.lock().await;

        let mut requests: Vec<BreakpointRequest> = self
            .data
            .borrow()
            .breakpoints
            .values()
            .filter(|bp| bp.location.path == location.path && bp.location != location)
            .map(|bp| BreakpointRequest {
                location: bp.location.clone(),
                condition: bp.condition.clone(),
            })
            .collect();
        requests.push(BreakpointRequest {
            location: location.clone(),
            condition,
        });
        requests.sort_by_key(|request| request.location.line);

        let records = self.send_file_breakpoints(&location.path, &requests).await?;
        records
            .into_iter()
            .find(|bp| bp.location == location)
            .ok_or_else(|| AppError::Adapter {
                message: format!("no breakpoint returned for {}", location.path.display()),
                code: None,
            })
    }

    /// Remove every breakpoint in `path`.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] before the handshake starts or once the
    /// session is closing; otherwise the request's failure.
    pub async fn clear_breakpoints(&self, path: &Path) -> Result<()> {
        self.ensure("clear_breakpoints", |state| {
            matches!(
                state,
                SessionState::Initializing | SessionState::Running | SessionState::Stopped
            )
        })?;
        let _guard = self.breakpoint_lock.lock().await;
        self.send_file_breakpoints(path, &[]).await?;
        Ok(())
    }

    /// Replace the exception breakpoint filters.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless running or stopped; otherwise the
    /// request's failure.
    pub async fn set_exception_breakpoints(&self, filters: &[String]) -> Result<()> {
        self.ensure("set_exception_breakpoints", SessionState::is_live)?;
        self.request("setExceptionBreakpoints", json!({ "filters": filters }))
            .await?;
        Ok(())
    }

    /// Send one file's full breakpoint list and record the adapter's answer.
    ///
    /// The response array is matched to `requests` positionally.
    pub(crate) async fn send_file_breakpoints(
        &self,
        path: &Path,
        requests: &[BreakpointRequest],
    ) -> Result<Vec<Breakpoint>> {
        let wire_requests: Vec<Value> = requests
            .iter()
            .map(|request| match &request.condition {
                Some(condition) => json!({ "line": request.location.line, "condition": condition }),
                None => json!({ "line": request.location.line }),
            })
            .collect();
        let lines: Vec<i64> = requests.iter().map(|r| r.location.line).collect();

        let body = self
            .request(
                "setBreakpoints",
                json!({
                    "source": { "path": path },
                    "breakpoints": wire_requests,
                    "lines": lines,
                }),
            )
            .await?;
        let answers: Vec<WireBreakpoint> = field(&body, "breakpoints", "setBreakpoints")?;

        let records: Vec<Breakpoint> = requests
            .iter()
            .enumerate()
            .map(|(index, request)| {
                let answer = answers.get(index).cloned().unwrap_or_else(|| WireBreakpoint {
                    message: Some("adapter returned no breakpoint".into()),
                    ..WireBreakpoint::default()
                });
                Breakpoint {
                    id: answer.id,
                    verified: answer.verified,
                    location: request.location.clone(),
                    line: answer.line,
                    condition: request.condition.clone(),
                    message: answer.message,
                }
            })
            .collect();

        self.data.send_modify(|data| {
            data.breakpoints.retain(|location, _| location.path != path);
            for record in &records {
                data.breakpoints.insert(record.location.clone(), record.clone());
            }
        });
        debug!(
            session_id = %self.id,
            path = %path.display(),
            count = records.len(),
            "breakpoints updated"
        );
        Ok(records)
    }

    // ── Execution control ─────────────────────────────────────────────────────

    /// Resume every thread.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless stopped; otherwise the request's
    /// failure.
    pub async fn continue_(&self, thread_id: i64) -> Result<()> {
        self.resume("continue", thread_id).await
    }

    /// Step over the current line.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless stopped; otherwise the request's
    /// failure.
    pub async fn step_over(&self, thread_id: i64) -> Result<()> {
        self.resume("next", thread_id).await
    }

    /// Step into the call on the current line.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless stopped; otherwise the request's
    /// failure.
    pub async fn step_into(&self, thread_id: i64) -> Result<()> {
        self.resume("stepIn", thread_id).await
    }

    /// Run until the current function returns.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless stopped; otherwise the request's
    /// failure.
    pub async fn step_out(&self, thread_id: i64) -> Result<()> {
        self.resume("stepOut", thread_id).await
    }

    /// Ask the adapter to pause `thread_id`. The state changes when the
    /// resulting stop event arrives.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless running; otherwise the request's
    /// failure.
    pub async fn pause(&self, thread_id: i64) -> Result<()> {
        self.ensure("pause", |state| state == SessionState::Running)?;
        self.request("pause", json!({ "threadId": thread_id })).await?;
        Ok(())
    }

    async fn resume(&self, command: &str, thread_id: i64) -> Result<()> {
        let generation = {
            let data = self.data.borrow();
            if data.state != SessionState::Stopped {
                return Err(AppError::InvalidState(format!(
                    "{command} requires a stopped session, session is {}",
                    data.state
                )));
            }
            data.stop_generation
        };

        self.request(command, json!({ "threadId": thread_id })).await?;

        let resumed = self.data.send_if_modified(|data| {
            if data.state == SessionState::Stopped && data.stop_generation == generation {
                data.state = SessionState::Running;
                data.stop = None;
                data.stop_generation += 1;
                true
            } else {
                false
            }
        });
        debug!(session_id = %self.id, command, thread_id, resumed, "execution resumed");
        Ok(())
    }

    /// Wait until the debuggee is stopped and return the stop.
    ///
    /// Returns at once when already stopped.
    ///
    /// # Errors
    ///
    /// [`AppError::SessionTerminated`] if the session ends first, or
    /// [`AppError::Timeout`] after `bound`.
    pub async fn wait_for_stop(&self, bound: Duration) -> Result<StopDescription> {
        let mut rx = self.data.subscribe();
        let waited = tokio::time::timeout(bound, async {
            let stop = match rx
                .wait_for(|data| data.state == SessionState::Stopped || data.state.is_closing())
                .await
            {
                Ok(data) if data.state == SessionState::Stopped => data.stop.clone(),
                _ => None,
            };
            stop.ok_or_else(|| self.terminated_error())
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "session {} did not stop within {bound:?}",
                self.id
            ))),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Evaluate `expression`, optionally in the scope of `frame_id`.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless stopped; [`AppError::Adapter`] with
    /// the adapter's message if evaluation fails.
    pub async fn evaluate(&self, expression: &str, frame_id: Option<i64>) -> Result<EvaluateResult> {
        self.ensure("evaluate", |state| state == SessionState::Stopped)?;
        let mut arguments = json!({ "expression": expression, "context": "repl" });
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        let body = self.request("evaluate", arguments).await?;
        serde_json::from_value(body).map_err(|err| malformed("evaluate", &err))
    }

    /// Live list of threads; also refreshes the known-thread set.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless running or stopped.
    pub async fn get_threads(&self) -> Result<Vec<Thread>> {
        self.ensure("get_threads", SessionState::is_live)?;
        let body = self.request("threads", json!({})).await?;
        let threads: Vec<Thread> = field(&body, "threads", "threads")?;
        self.data.send_modify(|data| {
            data.threads = threads.iter().map(|thread| thread.id).collect();
        });
        Ok(threads)
    }

    /// Call stack of `thread_id`, innermost frame first.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless running or stopped.
    pub async fn get_stack_frames(&self, thread_id: i64) -> Result<Vec<StackFrame>> {
        self.ensure("get_stack_frames", SessionState::is_live)?;
        let body = self
            .request("stackTrace", json!({ "threadId": thread_id, "startFrame": 0 }))
            .await?;
        field(&body, "stackFrames", "stackTrace")
    }

    /// Variable scopes of `frame_id`.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless running or stopped.
    pub async fn get_scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        self.ensure("get_scopes", SessionState::is_live)?;
        let body = self.request("scopes", json!({ "frameId": frame_id })).await?;
        field(&body, "scopes", "scopes")
    }

    /// Children of a variables reference.
    ///
    /// # Errors
    ///
    /// [`AppError::InvalidState`] unless running or stopped.
    pub async fn get_variables(&self, reference: i64) -> Result<Vec<Variable>> {
        self.ensure("get_variables", SessionState::is_live)?;
        let body = self
            .request("variables", json!({ "variablesReference": reference }))
            .await?;
        field(&body, "variables", "variables")
    }

    /// Take the buffered debuggee output.
    #[must_use]
    pub fn drain_output(&self) -> Vec<OutputLine> {
        let mut drained = Vec::new();
        self.data.send_if_modified(|data| {
            drained = data.output.drain(..).collect();
            !drained.is_empty()
        });
        drained
    }

    // ── Termination ───────────────────────────────────────────────────────────

    /// End the session, waiting at most `bound` for the adapter to
    /// acknowledge before forcing the connection closed.
    ///
    /// Calling it again, or on a session that is already ending, does
    /// nothing.
    pub async fn terminate(&self, bound: Duration) {
        if !self.begin_terminating() {
            debug!(session_id = %self.id, "terminate ignored, session already ending");
            return;
        }
        self.shut_down(bound, "terminated by request").await;
    }

    /// Move to `Terminating`; false when the session was already ending.
    pub(crate) fn begin_terminating(&self) -> bool {
        let started = self.data.send_if_modified(|data| {
            if data.state.is_closing() {
                false
            } else {
                data.state = SessionState::Terminating;
                true
            }
        });
        if started {
            info!(session_id = %self.id, "session terminating");
        }
        started
    }

    /// Disconnect, close the connection, and record the end.
    pub(crate) async fn shut_down(&self, bound: Duration, reason: &str) {
        let disconnect = self.client.send_request(
            "disconnect",
            Some(json!({ "restart": false, "terminateDebuggee": true })),
        );
        match tokio::time::timeout(bound, disconnect).await {
            Ok(Ok(_)) => debug!(session_id = %self.id, "adapter acknowledged disconnect"),
            Ok(Err(err)) => debug!(session_id = %self.id, %err, "disconnect not acknowledged"),
            Err(_) => warn!(
                session_id = %self.id,
                ?bound,
                "adapter did not acknowledge disconnect in time, forcing close"
            ),
        }

        self.client
            .shutdown(AppError::SessionTerminated(format!("session {} {reason}", self.id)))
            .await;
        self.mark_terminated(reason);
    }

    /// Record the terminal state; later calls keep the first cause.
    pub(crate) fn mark_terminated(&self, cause: &str) {
        let changed = self.data.send_if_modified(|data| {
            if data.state == SessionState::Terminated {
                return false;
            }
            data.state = SessionState::Terminated;
            data.stop = None;
            data.termination_cause = Some(cause.to_owned());
            true
        });
        if changed {
            info!(session_id = %self.id, cause = %cause, "session terminated");
        }
    }

    /// The connection ended underneath the session.
    pub(crate) async fn connection_lost(&self) {
        let cause = self
            .client
            .close_cause()
            .await
            .map_or_else(|| "connection closed".to_owned(), |err| err.to_string());
        self.mark_terminated(&cause);
    }

    // ── Internals shared with the handshake and event consumer ───────────────

    pub(crate) fn client(&self) -> &DapClient {
        &self.client
    }

    pub(crate) fn data(&self) -> &watch::Sender<SessionData> {
        &self.data
    }

    pub(crate) fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<SessionData> {
        self.data.subscribe()
    }

    /// Move from `from` to `next`; does nothing if another transition
    /// (a stop event, termination) got there first.
    pub(crate) fn transition(&self, from: SessionState, next: SessionState) {
        let changed = self.data.send_if_modified(|data| {
            if data.state == from && from.can_transition_to(next) {
                data.state = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(session_id = %self.id, from = %from, to = %next, "session state changed");
        }
    }

    /// Error describing why the connection is gone, for `operation`.
    pub(crate) async fn closed_error(&self, operation: &str) -> AppError {
        match self.client.close_cause().await {
            Some(cause) => cause,
            None => AppError::SessionTerminated(format!(
                "session {} ended during {operation}",
                self.id
            )),
        }
    }

    fn terminated_error(&self) -> AppError {
        let cause = self
            .data
            .borrow()
            .termination_cause
            .clone()
            .unwrap_or_else(|| "session is ending".into());
        AppError::SessionTerminated(format!("session {}: {cause}", self.id))
    }

    fn ensure(&self, operation: &str, allowed: impl Fn(SessionState) -> bool) -> Result<()> {
        let state = self.state();
        if allowed(state) {
            Ok(())
        } else {
            Err(AppError::InvalidState(format!(
                "{operation} is not valid while the session is {state}"
            )))
        }
    }

    /// Send one request, bounded by the request timeout.
    ///
    /// A connection failure seen while the session is ending is reported as
    /// [`AppError::SessionTerminated`].
    pub(crate) async fn request(&self, command: &str, arguments: Value) -> Result<Value> {
        let bound = self.settings.timeouts.request();
        let reply =
            tokio::time::timeout(bound, self.client.send_request(command, Some(arguments))).await;

        match reply {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(err)) if err.is_connection_fatal() && self.state().is_closing() => {
                Err(self.terminated_error())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AppError::Timeout(format!(
                "'{command}' got no response within {bound:?}"
            ))),
        }
    }
}

/// Decode `body[key]` as `T`; a missing key decodes from an empty array.
fn field<T: DeserializeOwned>(body: &Value, key: &str, command: &str) -> Result<T> {
    let value = body.get(key).cloned().unwrap_or_else(|| json!([]));
    serde_json::from_value(value).map_err(|err| malformed(command, &err))
}

fn malformed(command: &str, err: &serde_json::Error) -> AppError {
    AppError::Adapter {
        message: format!("malformed '{command}' response: {err}"),
        code: None,
    }
}
