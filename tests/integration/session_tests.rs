//! Integration tests for the session state machine against a stub adapter.

use std::sync::Arc;
use std::time::Duration;

use dap_bridge::models::debug::SourceLocation;
use dap_bridge::models::session::{SessionId, SessionState};
use dap_bridge::orchestrator::{BreakpointRequest, DebugSession};
use dap_bridge::AppError;
use serde_json::json;

use super::test_helpers::{test_settings, wait_for_state, StubAdapter, StubScript, WAIT};

async fn started(script: StubScript) -> (StubAdapter, Arc<DebugSession>) {
    let stub = StubAdapter::start(script).await;
    let session = DebugSession::open(SessionId::generate(), &stub.session_request(), test_settings())
        .await
        .expect("session starts");
    (stub, session)
}

// ── Handshake ────────────────────────────────────────────────

#[tokio::test]
async fn handshake_runs_in_protocol_order() {
    let (stub, session) = started(StubScript::default()).await;

    assert_eq!(session.state(), SessionState::Running);
    assert!(session.capabilities().is_some());
    assert_eq!(
        stub.commands(),
        vec!["initialize", "launch", "configurationDone"]
    );

    let initialize = &stub.requests_for("initialize")[0];
    let arguments = initialize.arguments.clone().expect("initialize arguments");
    assert_eq!(arguments["adapterID"], json!("stub"));
    assert_eq!(arguments["linesStartAt1"], json!(true));
}

#[tokio::test]
async fn initial_breakpoints_are_sent_before_configuration_done() {
    let stub = StubAdapter::start(StubScript::default()).await;
    let request = stub
        .session_request()
        .with_breakpoint(BreakpointRequest::at(SourceLocation::new("main.src", 12)))
        .with_breakpoint(BreakpointRequest::at(SourceLocation::new("main.src", 4)))
        .with_exception_filters(vec!["raised".into()]);

    let session = DebugSession::open(SessionId::generate(), &request, test_settings())
        .await
        .expect("session starts");

    assert_eq!(
        stub.commands(),
        vec![
            "initialize",
            "launch",
            "setBreakpoints",
            "setExceptionBreakpoints",
            "configurationDone"
        ]
    );
    let lines: Vec<_> = session
        .breakpoints()
        .iter()
        .map(|bp| bp.location.line)
        .collect();
    assert_eq!(lines, vec![4, 12]);
}

#[tokio::test]
async fn stop_on_entry_leaves_session_stopped() {
    let (_stub, session) = started(StubScript {
        stop_on_entry: true,
        ..StubScript::default()
    })
    .await;

    let stop = session.wait_for_stop(WAIT).await.expect("entry stop");
    assert_eq!(stop.reason, "entry");
    assert_eq!(stop.thread_id, Some(1));
    assert!(stop.all_threads_stopped);
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn failing_launch_surfaces_adapter_error_and_closes() {
    let stub = StubAdapter::start(StubScript {
        fail: [("launch".to_owned(), "program not found".to_owned())].into(),
        ..StubScript::default()
    })
    .await;

    let err = DebugSession::open(SessionId::generate(), &stub.session_request(), test_settings())
        .await
        .expect_err("launch fails");
    match err {
        AppError::Adapter { message, .. } => assert_eq!(message, "program not found"),
        other => panic!("expected adapter error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_initialized_event_times_out() {
    let stub = StubAdapter::start(StubScript {
        skip_initialized: true,
        hold: ["launch".to_owned()].into(),
        ..StubScript::default()
    })
    .await;
    let mut settings = test_settings();
    settings.timeouts.handshake_seconds = 1;

    let err = DebugSession::open(SessionId::generate(), &stub.session_request(), settings)
        .await
        .expect_err("handshake times out");
    assert!(matches!(err, AppError::Timeout(_)), "{err:?}");
}

// ── Breakpoints and execution ────────────────────────────────

#[tokio::test]
async fn breakpoint_stop_continue_round_trip() {
    let (stub, session) = started(StubScript::default()).await;

    let breakpoint = session
        .set_breakpoint(SourceLocation::new("main.src", 10), None)
        .await
        .expect("set breakpoint");
    assert_eq!(breakpoint.id, Some(1));
    assert!(breakpoint.verified);

    stub.emit("stopped", json!({ "reason": "breakpoint", "threadId": 1, "hitBreakpointIds": [1] }));
    let stop = session.wait_for_stop(WAIT).await.expect("stopped");
    assert_eq!(stop.reason, "breakpoint");
    assert_eq!(stop.hit_breakpoint_ids, vec![1]);
    assert_eq!(session.state(), SessionState::Stopped);

    session.continue_(1).await.expect("continue");
    assert_eq!(session.state(), SessionState::Running);
    assert!(session.stop().is_none());
}

#[tokio::test]
async fn continue_while_running_is_invalid_and_sends_nothing() {
    let (stub, session) = started(StubScript::default()).await;
    let before = stub.commands().len();

    let err = session.continue_(1).await.expect_err("not stopped");
    assert!(matches!(err, AppError::InvalidState(_)), "{err:?}");
    let err = session.evaluate("1 + 1", None).await.expect_err("not stopped");
    assert!(matches!(err, AppError::InvalidState(_)), "{err:?}");

    assert_eq!(stub.commands().len(), before);
}

#[tokio::test]
async fn setting_same_location_twice_keeps_one_record() {
    let (stub, session) = started(StubScript::default()).await;
    let location = SourceLocation::new("main.src", 10);

    session
        .set_breakpoint(location.clone(), None)
        .await
        .expect("first");
    let second = session
        .set_breakpoint(location.clone(), Some("x > 1".into()))
        .await
        .expect("second");

    assert_eq!(second.id, Some(2));
    assert_eq!(second.condition.as_deref(), Some("x > 1"));
    let records = session.breakpoints();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].location, location);

    let last = stub.requests_for("setBreakpoints").pop().expect("sent");
    let sent = last.arguments.expect("arguments");
    assert_eq!(sent["breakpoints"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn breakpoints_in_one_file_are_sent_together() {
    let (stub, session) = started(StubScript::default()).await;

    session
        .set_breakpoint(SourceLocation::new("main.src", 20), None)
        .await
        .expect("first");
    session
        .set_breakpoint(SourceLocation::new("main.src", 5), None)
        .await
        .expect("second");
    session
        .set_breakpoint(SourceLocation::new("other.src", 1), None)
        .await
        .expect("other file");

    let sent = stub.requests_for("setBreakpoints")[1]
        .arguments
        .clone()
        .expect("arguments");
    assert_eq!(sent["lines"], json!([5, 20]));
    assert_eq!(session.breakpoints().len(), 3);

    session
        .clear_breakpoints(std::path::Path::new("main.src"))
        .await
        .expect("clear");
    let remaining: Vec<_> = session
        .breakpoints()
        .into_iter()
        .map(|bp| bp.location)
        .collect();
    assert_eq!(remaining, vec![SourceLocation::new("other.src", 1)]);
}

#[tokio::test]
async fn pause_requires_running() {
    let (stub, session) = started(StubScript {
        stop_on_entry: true,
        ..StubScript::default()
    })
    .await;
    wait_for_state(&session, SessionState::Stopped).await;

    let err = session.pause(1).await.expect_err("already stopped");
    assert!(matches!(err, AppError::InvalidState(_)));

    session.step_over(1).await.expect("step over");
    assert_eq!(session.state(), SessionState::Running);
    session.pause(1).await.expect("pause");
    assert!(stub.commands().contains(&"pause".to_owned()));
}

#[tokio::test]
async fn step_into_and_step_out_resume_a_stopped_session() {
    let (stub, session) = started(StubScript {
        stop_on_entry: true,
        ..StubScript::default()
    })
    .await;
    wait_for_state(&session, SessionState::Stopped).await;

    session.step_into(1).await.expect("step into");
    assert_eq!(session.state(), SessionState::Running);
    assert!(session.stop().is_none());
    let step_in = &stub.requests_for("stepIn")[0];
    assert_eq!(step_in.arguments, Some(json!({ "threadId": 1 })));

    let err = session.step_out(1).await.expect_err("running again");
    assert!(matches!(err, AppError::InvalidState(_)), "{err:?}");

    stub.emit("stopped", json!({ "reason": "step", "threadId": 1 }));
    wait_for_state(&session, SessionState::Stopped).await;

    session.step_out(1).await.expect("step out");
    assert_eq!(session.state(), SessionState::Running);
    let step_out = &stub.requests_for("stepOut")[0];
    assert_eq!(step_out.arguments, Some(json!({ "threadId": 1 })));
    assert_eq!(stub.requests_for("stepOut").len(), 1);
}

#[tokio::test]
async fn exception_filters_are_sent_as_one_list() {
    let (stub, session) = started(StubScript::default()).await;

    session
        .set_exception_breakpoints(&["raised".into(), "uncaught".into()])
        .await
        .expect("set exception breakpoints");

    let sent = stub.requests_for("setExceptionBreakpoints");
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].arguments,
        Some(json!({ "filters": ["raised", "uncaught"] }))
    );
}

// ── Queries ──────────────────────────────────────────────────

#[tokio::test]
async fn stopped_session_answers_live_queries() {
    let (_stub, session) = started(StubScript {
        stop_on_entry: true,
        ..StubScript::default()
    })
    .await;
    wait_for_state(&session, SessionState::Stopped).await;

    let threads = session.get_threads().await.expect("threads");
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].name, "MainThread");

    let frames = session.get_stack_frames(1).await.expect("frames");
    assert_eq!(frames.iter().map(|f| f.id).collect::<Vec<_>>(), vec![100, 101]);
    assert_eq!(frames[0].line, 10);

    let scopes = session.get_scopes(frames[0].id).await.expect("scopes");
    assert_eq!(scopes[0].name, "Locals");

    let variables = session
        .get_variables(scopes[0].variables_reference)
        .await
        .expect("variables");
    assert_eq!(variables[0].name, "x");
    assert_eq!(variables[0].value, "1");
    assert_eq!(variables[0].type_name.as_deref(), Some("int"));

    let result = session.evaluate("x + 1", Some(100)).await.expect("evaluate");
    assert_eq!(result.result, "2");
}

#[tokio::test]
async fn failed_evaluation_keeps_adapter_message() {
    let (_stub, session) = started(StubScript {
        stop_on_entry: true,
        fail: [("evaluate".to_owned(), "name 'y' is not defined".to_owned())].into(),
        ..StubScript::default()
    })
    .await;
    wait_for_state(&session, SessionState::Stopped).await;

    let err = session.evaluate("y", None).await.expect_err("fails");
    assert_eq!(
        err,
        AppError::Adapter {
            message: "name 'y' is not defined".into(),
            code: Some(1),
        }
    );
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn output_events_are_buffered_until_drained() {
    let (stub, session) = started(StubScript::default()).await;

    stub.emit("output", json!({ "category": "stdout", "output": "hello\n" }));
    stub.emit("output", json!({ "output": "world\n" }));

    let mut lines = Vec::new();
    tokio::time::timeout(WAIT, async {
        while lines.len() < 2 {
            lines.extend(session.drain_output());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("output arrives");

    assert_eq!(lines[0].category, "stdout");
    assert_eq!(lines[0].output, "hello\n");
    assert_eq!(lines[1].category, "console");
    assert!(session.drain_output().is_empty());
}

// ── Termination ──────────────────────────────────────────────

#[tokio::test]
async fn terminate_is_idempotent() {
    let (stub, session) = started(StubScript::default()).await;

    session.terminate(Duration::from_secs(1)).await;
    assert_eq!(session.state(), SessionState::Terminated);
    session.terminate(Duration::from_secs(1)).await;

    assert_eq!(stub.requests_for("disconnect").len(), 1);
    let err = session.get_threads().await.expect_err("terminated");
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[tokio::test]
async fn terminate_is_bounded_when_adapter_is_silent() {
    let (_stub, session) = started(StubScript {
        hold: ["disconnect".to_owned()].into(),
        ..StubScript::default()
    })
    .await;

    let started_at = tokio::time::Instant::now();
    session.terminate(Duration::from_millis(200)).await;
    assert!(started_at.elapsed() < Duration::from_secs(3));
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn exited_event_ends_session_with_exit_code() {
    let (stub, session) = started(StubScript::default()).await;

    stub.emit("exited", json!({ "exitCode": 3 }));
    wait_for_state(&session, SessionState::Terminated).await;

    let info = session.info();
    assert_eq!(info.exit_code, Some(3));
    assert!(info
        .termination_cause
        .expect("cause recorded")
        .contains("code 3"));
}

#[tokio::test]
async fn adapter_hang_up_fails_in_flight_step_and_terminates() {
    let (stub, session) = started(StubScript {
        stop_on_entry: true,
        hold: ["next".to_owned()].into(),
        ..StubScript::default()
    })
    .await;
    wait_for_state(&session, SessionState::Stopped).await;

    let stepping = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.step_over(1).await })
    };
    stub.wait_for_command("next").await;
    stub.hang_up();

    let outcome = tokio::time::timeout(WAIT, stepping)
        .await
        .expect("step resolves")
        .expect("task");
    assert!(
        matches!(
            outcome,
            Err(AppError::TransportClosed(_) | AppError::SessionTerminated(_))
        ),
        "{outcome:?}"
    );
    wait_for_state(&session, SessionState::Terminated).await;

    let err = session
        .wait_for_stop(WAIT)
        .await
        .expect_err("no stop after end");
    assert!(matches!(err, AppError::SessionTerminated(_)));
}

#[tokio::test]
async fn wait_for_stop_times_out_while_running() {
    let (_stub, session) = started(StubScript::default()).await;

    let err = session
        .wait_for_stop(Duration::from_millis(100))
        .await
        .expect_err("no stop");
    assert!(matches!(err, AppError::Timeout(_)));
}
