//! Session event consumer.
//!
//! Each session runs exactly one consumer task. It is the only subscriber
//! to the session's event stream, so events are applied one at a time in
//! arrival order. [`apply_event`] is the pure state reducer; the task wraps
//! it in the session's watch channel and handles the end of the debuggee
//! and of the connection.

use std::sync::Weak;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dap::client::EventStream;
use crate::dap::message::Event;
use crate::models::debug::{OutputLine, WireBreakpoint};
use crate::models::session::{SessionState, StopDescription};
use crate::orchestrator::session::{DebugSession, SessionData};

/// What applying one event did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EventEffect {
    /// Nothing changed.
    Ignored,
    /// Session state changed.
    Updated,
    /// The debuggee or the adapter is done; the session should end.
    Ended(String),
}

/// Apply one adapter event to `data`.
pub(crate) fn apply_event(data: &mut SessionData, event: &Event) -> EventEffect {
    match event.event.as_str() {
        "initialized" => {
            data.initialized = true;
            EventEffect::Updated
        }
        "stopped" => {
            if data.state != SessionState::Stopped
                && !data.state.can_transition_to(SessionState::Stopped)
            {
                return EventEffect::Ignored;
            }
            let stop = StopDescription::from_event(event);
            if let Some(thread_id) = stop.thread_id {
                data.threads.insert(thread_id);
            }
            data.stop = Some(stop);
            data.state = SessionState::Stopped;
            data.stop_generation += 1;
            EventEffect::Updated
        }
        "continued" => {
            if data.state != SessionState::Stopped {
                return EventEffect::Ignored;
            }
            data.state = SessionState::Running;
            data.stop = None;
            data.stop_generation += 1;
            EventEffect::Updated
        }
        "thread" => {
            let Some(thread_id) = event.body_i64("threadId") else {
                return EventEffect::Ignored;
            };
            match event.body_str("reason") {
                Some("started") => data.threads.insert(thread_id),
                Some("exited") => data.threads.remove(&thread_id),
                _ => false,
            };
            EventEffect::Updated
        }
        "breakpoint" => apply_breakpoint_event(data, event),
        "output" => {
            let Some(output) = event.body_str("output") else {
                return EventEffect::Ignored;
            };
            data.output.push_back(OutputLine {
                category: event.body_str("category").unwrap_or("console").to_owned(),
                output: output.to_owned(),
            });
            while data.output.len() > data.output_limit {
                data.output.pop_front();
            }
            EventEffect::Updated
        }
        "exited" => {
            data.exit_code = event.body_i64("exitCode");
            let reason = data.exit_code.map_or_else(
                || "debuggee exited".to_owned(),
                |code| format!("debuggee exited with code {code}"),
            );
            EventEffect::Ended(reason)
        }
        "terminated" => EventEffect::Ended("adapter ended the debug session".into()),
        _ => EventEffect::Ignored,
    }
}

/// `changed`/`new` refresh the record with the same id; `removed` drops it.
fn apply_breakpoint_event(data: &mut SessionData, event: &Event) -> EventEffect {
    let Some(wire) = event
        .body
        .as_ref()
        .and_then(|body| body.get("breakpoint"))
        .cloned()
        .and_then(|value: Value| serde_json::from_value::<WireBreakpoint>(value).ok())
    else {
        return EventEffect::Ignored;
    };
    let Some(id) = wire.id else {
        return EventEffect::Ignored;
    };
    let Some(location) = data
        .breakpoints
        .iter()
        .find(|(_, bp)| bp.id == Some(id))
        .map(|(location, _)| location.clone())
    else {
        return EventEffect::Ignored;
    };

    if event.body_str("reason") == Some("removed") {
        data.breakpoints.remove(&location);
    } else if let Some(record) = data.breakpoints.get_mut(&location) {
        record.verified = wire.verified;
        if wire.line.is_some() {
            record.line = wire.line;
        }
        if wire.message.is_some() {
            record.message = wire.message;
        }
    }
    EventEffect::Updated
}

/// Spawn the consumer for one session.
///
/// The task holds only a weak reference, so a dropped session stops it.
pub(crate) fn spawn_consumer(session: Weak<DebugSession>, mut events: EventStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let Some(session) = session.upgrade() else {
                return;
            };

            let mut effect = EventEffect::Ignored;
            session.data().send_if_modified(|data| {
                effect = apply_event(data, &event);
                effect != EventEffect::Ignored
            });

            match effect {
                EventEffect::Ignored => {
                    debug!(session_id = %session.id(), event = %event.event, "event ignored");
                }
                EventEffect::Updated => {
                    debug!(session_id = %session.id(), event = %event.event, state = %session.state(), "event applied");
                }
                EventEffect::Ended(reason) => {
                    info!(session_id = %session.id(), reason = %reason, "adapter reported end of session");
                    if session.begin_terminating() {
                        let bound = session.settings().timeouts.terminate();
                        session.shut_down(bound, &reason).await;
                    }
                }
            }
        }

        if let Some(session) = session.upgrade() {
            session.connection_lost().await;
        }
    })
}
