//! Session start-up handshake.
//!
//! DAP requires a specific dance before the debuggee runs:
//!
//! 1. `initialize` with the client's capabilities; the reply carries the
//!    adapter's capabilities.
//! 2. `launch` or `attach`. Many adapters only answer this after
//!    `configurationDone`, so the reply is not awaited yet.
//! 3. Wait for the `initialized` event (or a failing launch reply).
//! 4. Initial breakpoints and exception filters.
//! 5. `configurationDone`, then the deferred launch/attach reply.
//!
//! A stop event during the handshake (stop-on-entry) leaves the session
//! `Stopped` rather than `Running`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::pin;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::dap::transport::AdapterEndpoint;
use crate::models::debug::SourceLocation;
use crate::models::session::SessionState;
use crate::orchestrator::session::{DebugSession, SessionData};
use crate::{AppError, Result};

/// Client identity reported in `initialize`.
const CLIENT_ID: &str = "dap-bridge";

/// The request that starts the debuggee, with its opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StartRequest {
    /// Start a new debuggee.
    Launch(Value),
    /// Attach to a running debuggee.
    Attach(Value),
}

impl StartRequest {
    /// DAP command name.
    #[must_use]
    pub fn command(&self) -> &'static str {
        match self {
            Self::Launch(_) => "launch",
            Self::Attach(_) => "attach",
        }
    }

    /// Payload forwarded verbatim.
    #[must_use]
    pub fn arguments(&self) -> &Value {
        match self {
            Self::Launch(args) | Self::Attach(args) => args,
        }
    }
}

/// A breakpoint to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRequest {
    /// Where to break.
    pub location: SourceLocation,
    /// Optional condition expression.
    pub condition: Option<String>,
}

impl BreakpointRequest {
    /// Unconditional breakpoint at `location`.
    #[must_use]
    pub fn at(location: SourceLocation) -> Self {
        Self {
            location,
            condition: None,
        }
    }
}

/// Everything needed to create one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    /// Adapter name, for logs and session info.
    pub adapter: String,
    /// DAP `adapterID` sent in `initialize`.
    pub adapter_id: String,
    /// How to reach the adapter.
    pub endpoint: AdapterEndpoint,
    /// Launch or attach payload.
    pub start: StartRequest,
    /// Breakpoints installed before `configurationDone`.
    pub breakpoints: Vec<BreakpointRequest>,
    /// Exception filters installed before `configurationDone`.
    pub exception_filters: Vec<String>,
}

impl SessionRequest {
    /// Request with no initial breakpoints or exception filters.
    #[must_use]
    pub fn new(adapter_id: impl Into<String>, endpoint: AdapterEndpoint, start: StartRequest) -> Self {
        let adapter_id = adapter_id.into();
        Self {
            adapter: adapter_id.clone(),
            adapter_id,
            endpoint,
            start,
            breakpoints: Vec::new(),
            exception_filters: Vec::new(),
        }
    }

    /// Set the adapter display name.
    #[must_use]
    pub fn with_adapter_name(mut self, name: impl Into<String>) -> Self {
        self.adapter = name.into();
        self
    }

    /// Add an initial breakpoint.
    #[must_use]
    pub fn with_breakpoint(mut self, breakpoint: BreakpointRequest) -> Self {
        self.breakpoints.push(breakpoint);
        self
    }

    /// Set the initial exception filters.
    #[must_use]
    pub fn with_exception_filters(mut self, filters: Vec<String>) -> Self {
        self.exception_filters = filters;
        self
    }
}

/// `initialize` arguments describing this client.
fn initialize_arguments(adapter_id: &str) -> Value {
    json!({
        "clientID": CLIENT_ID,
        "clientName": CLIENT_ID,
        "adapterID": adapter_id,
        "pathFormat": "path",
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "supportsVariableType": true,
        "supportsVariablePaging": true,
        "supportsRunInTerminalRequest": false,
        "supportsMemoryReferences": false,
        "supportsProgressReporting": false,
        "supportsInvalidatedEvent": false,
    })
}

/// Group breakpoint requests per file; a repeated location keeps the last.
pub(crate) fn group_by_file(
    requests: &[BreakpointRequest],
) -> BTreeMap<PathBuf, Vec<BreakpointRequest>> {
    let mut files: BTreeMap<PathBuf, BTreeMap<i64, BreakpointRequest>> = BTreeMap::new();
    for request in requests {
        files
            .entry(request.location.path.clone())
            .or_default()
            .insert(request.location.line, request.clone());
    }
    files
        .into_iter()
        .map(|(path, lines)| (path, lines.into_values().collect()))
        .collect()
}

enum Readiness {
    Initialized,
    Closed,
}

async fn initialized_or_closed(rx: &mut watch::Receiver<SessionData>) -> Readiness {
    match rx
        .wait_for(|data| data.initialized || data.state.is_closing())
        .await
    {
        Ok(data) if data.initialized && !data.state.is_closing() => Readiness::Initialized,
        _ => Readiness::Closed,
    }
}

/// Drive `session` from `Created` to `Running` (or `Stopped`).
///
/// # Errors
///
/// Surfaces the failing step verbatim: an [`AppError::Adapter`] reply, the
/// connection's closing cause, or [`AppError::Timeout`] when the adapter
/// does not get through the sequence within the handshake bound.
pub(crate) async fn run(session: &DebugSession, request: &SessionRequest) -> Result<()> {
    let bound = session.settings().timeouts.handshake();
    let mut deadline = pin!(tokio::time::sleep(bound));

    session.transition(SessionState::Created, SessionState::Initializing);

    let capabilities = tokio::select! {
        reply = session.client().send_request("initialize", Some(initialize_arguments(&request.adapter_id))) => reply?,
        () = &mut deadline => {
            return Err(AppError::Timeout(format!("adapter did not answer initialize within {bound:?}")));
        }
    };
    let supports_configuration_done = capabilities
        .get("supportsConfigurationDoneRequest")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    session.data().send_modify(|data| data.capabilities = Some(capabilities));
    debug!(session_id = %session.id(), "adapter capabilities received");

    let start = session
        .client()
        .issue(request.start.command(), Some(request.start.arguments().clone()))
        .await?;
    let mut start_reply = pin!(start.wait());
    let mut started = false;

    let mut rx = session.data().subscribe();
    loop {
        tokio::select! {
            reply = &mut start_reply, if !started => {
                reply?;
                started = true;
            }
            readiness = initialized_or_closed(&mut rx) => match readiness {
                Readiness::Initialized => break,
                Readiness::Closed => return Err(session.closed_error("handshake").await),
            },
            () = &mut deadline => {
                return Err(AppError::Timeout(format!(
                    "adapter sent no initialized event within {bound:?}"
                )));
            }
        }
    }

    for (path, breakpoints) in group_by_file(&request.breakpoints) {
        session.send_file_breakpoints(&path, &breakpoints).await?;
    }
    if !request.exception_filters.is_empty() {
        session
            .request(
                "setExceptionBreakpoints",
                json!({ "filters": request.exception_filters }),
            )
            .await?;
    }

    if supports_configuration_done {
        session.request("configurationDone", json!({})).await?;
    }

    if !started {
        tokio::select! {
            reply = &mut start_reply => { reply?; }
            () = &mut deadline => {
                return Err(AppError::Timeout(format!(
                    "adapter did not answer {} within {bound:?}",
                    request.start.command()
                )));
            }
        }
    }

    // A stop during configuration (stop on entry) is kept.
    session.transition(SessionState::Initializing, SessionState::Running);
    info!(
        session_id = %session.id(),
        adapter = %request.adapter,
        state = %session.state(),
        "handshake complete"
    );
    Ok(())
}
