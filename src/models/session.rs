//! Debug session lifecycle model.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dap::message::Event;

/// Registry-assigned session identifier.
///
/// Wraps a UUID v4 string; identifiers are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Lifecycle state of a debug session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport open, handshake not started.
    Created,
    /// Handshake in progress.
    Initializing,
    /// Debuggee executing.
    Running,
    /// Debuggee paused on a stop event.
    Stopped,
    /// Shutdown requested; waiting for the adapter to let go.
    Terminating,
    /// Terminal; no further operations are accepted.
    Terminated,
}

impl SessionState {
    /// Whether the session has started shutting down.
    #[must_use]
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }

    /// Whether debuggee queries (threads, frames, variables) are allowed.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::Stopped)
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// A stop event during the handshake (stop-on-entry) moves
    /// `Initializing` straight to `Stopped`. Any non-terminal state may drop
    /// to `Terminated` when the connection fails.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Initializing)
                | (Self::Initializing, Self::Running | Self::Stopped)
                | (Self::Running, Self::Stopped)
                | (Self::Stopped, Self::Running)
                | (
                    Self::Created | Self::Initializing | Self::Running | Self::Stopped,
                    Self::Terminating
                )
                | (
                    Self::Created
                        | Self::Initializing
                        | Self::Running
                        | Self::Stopped
                        | Self::Terminating,
                    Self::Terminated
                )
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why and where the debuggee last stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StopDescription {
    /// Stop reason, e.g. `breakpoint`, `step`, `exception`, `pause`.
    pub reason: String,
    /// Thread that stopped, when the adapter names one.
    pub thread_id: Option<i64>,
    /// Short description shown to a user.
    pub description: Option<String>,
    /// Additional detail, such as exception text.
    pub text: Option<String>,
    /// Whether every thread stopped.
    pub all_threads_stopped: bool,
    /// Breakpoints that triggered this stop.
    pub hit_breakpoint_ids: Vec<i64>,
}

impl StopDescription {
    /// Build a stop description from a `stopped` event body.
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        let body = event.body.as_ref();
        let hit_breakpoint_ids = body
            .and_then(|b| b.get("hitBreakpointIds"))
            .and_then(serde_json::Value::as_array)
            .map(|ids| ids.iter().filter_map(serde_json::Value::as_i64).collect())
            .unwrap_or_default();

        Self {
            reason: event.body_str("reason").unwrap_or("unknown").to_owned(),
            thread_id: event.body_i64("threadId"),
            description: event.body_str("description").map(str::to_owned),
            text: event.body_str("text").map(str::to_owned),
            all_threads_stopped: body
                .and_then(|b| b.get("allThreadsStopped"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            hit_breakpoint_ids,
        }
    }
}

/// Point-in-time snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Adapter name the session was created for.
    pub adapter: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Most recent stop, while stopped.
    pub stop: Option<StopDescription>,
    /// Known thread identifiers, ascending.
    pub threads: Vec<i64>,
    /// Number of recorded breakpoints.
    pub breakpoints: usize,
    /// Whether the adapter reported its capabilities.
    pub has_capabilities: bool,
    /// Debuggee exit code, once reported.
    pub exit_code: Option<i64>,
    /// Why the session ended, once terminated.
    pub termination_cause: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}
