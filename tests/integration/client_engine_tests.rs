//! Integration tests for the DAP client engine over in-memory pipes.
//!
//! Covers sequence assignment under concurrency, response correlation with
//! interleaved events, closure draining, anomalies, and reverse requests.

use std::sync::Arc;

use dap_bridge::dap::client::DapClient;
use dap_bridge::dap::message::{Message, Request};
use dap_bridge::dap::transport::{StreamTransport, Transport};
use dap_bridge::AppError;
use futures_util::future::join_all;
use serde_json::json;

use super::test_helpers::{duplex_transports, Peer, WAIT};

fn connected() -> (DapClient, Peer) {
    let (client_side, peer_side) = duplex_transports();
    (DapClient::start(client_side), Peer::new(peer_side))
}

// ── Correlation ──────────────────────────────────────────────

#[tokio::test]
async fn concurrent_requests_get_distinct_increasing_seqs_and_matching_responses() {
    const N: usize = 20;
    let (client, mut peer) = connected();
    let client = Arc::new(client);
    let mut events = client.subscribe_events().await;

    let adapter = tokio::spawn(async move {
        let mut requests = Vec::new();
        for _ in 0..N {
            requests.push(peer.next_request().await);
        }
        // Answer in reverse order with events interleaved.
        for request in requests.iter().rev() {
            peer.event("output", json!({ "output": request.command.clone() }))
                .await;
            peer.respond(request, json!({ "command": request.command.clone() }))
                .await;
        }
        requests.iter().map(|r| r.seq).collect::<Vec<_>>()
    });

    let calls = (0..N).map(|i| {
        let client = Arc::clone(&client);
        async move {
            let command = format!("cmd{i}");
            let body = client.send_request(&command, None).await.expect("response");
            (command, body)
        }
    });
    let results = join_all(calls).await;
    let seqs = adapter.await.expect("adapter task");

    assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]), "seqs {seqs:?}");
    assert_eq!(seqs.len(), N);
    for (command, body) in results {
        assert_eq!(body["command"], json!(command));
    }

    for _ in 0..N {
        let event = tokio::time::timeout(WAIT, events.next())
            .await
            .expect("event in time")
            .expect("stream open");
        assert_eq!(event.event, "output");
    }
    assert_eq!(client.anomaly_count(), 0);
}

#[tokio::test]
async fn sequential_requests_are_written_in_issue_order() {
    let (client, mut peer) = connected();

    let first = client.issue("first", None).await.expect("issue first");
    let second = client.issue("second", None).await.expect("issue second");
    assert!(first.seq() < second.seq());

    let a = peer.next_request().await;
    let b = peer.next_request().await;
    assert_eq!((a.command.as_str(), a.seq), ("first", first.seq()));
    assert_eq!((b.command.as_str(), b.seq), ("second", second.seq()));
}

#[tokio::test]
async fn adapter_failure_is_local_to_the_request() {
    let (client, mut peer) = connected();

    let failing = client.issue("evaluate", Some(json!({ "expression": "x" }))).await.expect("issue");
    let request = peer.next_request().await;
    peer.fail(&request, 2001, "name 'x' is not defined").await;

    let err = failing.wait().await.expect_err("adapter failure");
    assert_eq!(
        err,
        AppError::Adapter {
            message: "name 'x' is not defined".into(),
            code: Some(2001),
        }
    );

    // The connection stays usable.
    let next = client.issue("threads", None).await.expect("issue");
    let request = peer.next_request().await;
    peer.respond(&request, json!({ "threads": [] })).await;
    assert_eq!(next.wait().await.expect("threads"), json!({ "threads": [] }));
}

#[tokio::test]
async fn unknown_response_is_an_anomaly_not_fatal() {
    let (client, mut peer) = connected();

    peer.respond_to(999, "ghost", json!({})).await;

    let pending = client.issue("threads", None).await.expect("issue");
    let request = peer.next_request().await;
    peer.respond(&request, json!({ "ok": true })).await;

    assert_eq!(pending.wait().await.expect("response"), json!({ "ok": true }));
    assert_eq!(client.anomaly_count(), 1);
    assert!(!client.is_closed());
}

#[tokio::test]
async fn abandoned_wait_leaves_request_registered() {
    let (client, mut peer) = connected();

    let pending = client.issue("slow", None).await.expect("issue");
    drop(pending);
    assert_eq!(client.pending_count().await, 1);

    let request = peer.next_request().await;
    peer.respond(&request, json!({})).await;

    tokio::time::timeout(WAIT, async {
        while client.pending_count().await != 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late response resolves the entry");
    assert_eq!(client.anomaly_count(), 0);
}

// ── Closure ──────────────────────────────────────────────────

#[tokio::test]
async fn closing_with_k_pending_resolves_exactly_k_with_transport_closed() {
    const K: usize = 7;
    let (client, _peer) = connected();

    let mut pending = Vec::new();
    for i in 0..K {
        pending.push(client.issue(&format!("hold{i}"), None).await.expect("issue"));
    }
    assert_eq!(client.pending_count().await, K);

    client.close().await;

    let outcomes = join_all(pending.into_iter().map(|p| p.wait())).await;
    assert_eq!(outcomes.len(), K);
    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome, Err(AppError::TransportClosed(_)))));
    assert_eq!(client.pending_count().await, 0);
    assert!(client.is_closed());
}

#[tokio::test]
async fn peer_hang_up_drains_pending_and_ends_event_streams() {
    let (client, mut peer) = connected();
    let mut events = client.subscribe_events().await;

    let pending = client.issue("next", None).await.expect("issue");
    let _ = peer.next_request().await;
    peer.close().await;

    let err = pending.wait().await.expect_err("closed");
    assert!(matches!(err, AppError::TransportClosed(_)), "{err:?}");

    let end = tokio::time::timeout(WAIT, events.next()).await.expect("stream ends");
    assert!(end.is_none());
}

#[tokio::test]
async fn framing_error_closes_engine_with_cause() {
    let (client, peer) = connected();

    let pending = client.issue("threads", None).await.expect("issue");
    peer.send_raw(b"Content-Length: -5\r\n\r\n").await;

    match pending.wait().await {
        Err(AppError::TransportClosed(cause)) => assert!(cause.contains("framing"), "{cause}"),
        other => panic!("expected transport closed, got {other:?}"),
    }
    assert!(matches!(
        client.close_cause().await,
        Some(AppError::TransportClosed(_))
    ));
}

#[tokio::test]
async fn requests_after_close_fail_immediately() {
    let (client, _peer) = connected();
    client.close().await;
    client.close().await;

    let err = client.send_request("threads", None).await.expect_err("closed");
    assert!(matches!(err, AppError::TransportClosed(_)));

    let mut events = client.subscribe_events().await;
    assert!(events.next().await.is_none());
}

// ── Events ───────────────────────────────────────────────────

#[tokio::test]
async fn events_reach_every_current_subscriber_in_order() {
    let (client, mut peer) = connected();
    let mut first = client.subscribe_events().await;
    let mut second = client.subscribe_events().await;

    peer.event("thread", json!({ "reason": "started", "threadId": 1 })).await;
    peer.event("brand-new-kind", json!({ "x": 1 })).await;

    for stream in [&mut first, &mut second] {
        let a = tokio::time::timeout(WAIT, stream.next()).await.expect("a").expect("open");
        let b = tokio::time::timeout(WAIT, stream.next()).await.expect("b").expect("open");
        assert_eq!(a.event, "thread");
        assert_eq!(b.event, "brand-new-kind");
        assert_eq!(b.body, Some(json!({ "x": 1 })));
    }
}

#[tokio::test]
async fn late_subscriber_does_not_see_earlier_events() {
    let (client, mut peer) = connected();
    let mut early = client.subscribe_events().await;

    peer.event("output", json!({ "output": "one" })).await;
    let _ = tokio::time::timeout(WAIT, early.next()).await.expect("delivered");

    let mut late = client.subscribe_events().await;
    peer.event("output", json!({ "output": "two" })).await;

    let event = tokio::time::timeout(WAIT, late.next()).await.expect("event").expect("open");
    assert_eq!(event.body_str("output"), Some("two"));
}

#[tokio::test]
async fn reverse_request_is_refused_not_published() {
    let (client, mut peer) = connected();
    let mut events = client.subscribe_events().await;

    peer.send(&Message::Request(Request {
        seq: 50,
        command: "runInTerminal".into(),
        arguments: Some(json!({ "args": ["python"] })),
    }))
    .await;

    match peer.next_message().await {
        Message::Response(response) => {
            assert_eq!(response.request_seq, 50);
            assert!(!response.success);
            assert_eq!(response.command, "runInTerminal");
        }
        other => panic!("expected refusal, got {other:?}"),
    }

    peer.event("output", json!({ "output": "after" })).await;
    let event = tokio::time::timeout(WAIT, events.next()).await.expect("event").expect("open");
    assert_eq!(event.event, "output");
}

#[tokio::test]
async fn reverse_request_does_not_stall_reader_behind_full_queue() {
    // The peer never reads, so the first write blocks and the queue fills.
    let (client_io, peer_io) = tokio::io::duplex(64);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (peer_read, peer_write) = tokio::io::split(peer_io);
    let client = Arc::new(DapClient::start(Arc::new(StreamTransport::new(
        "narrow client",
        client_read,
        client_write,
    ))));
    let mut peer = Peer::new(Arc::new(StreamTransport::new("narrow peer", peer_read, peer_write))
        as Arc<dyn Transport>);
    let mut events = client.subscribe_events().await;

    let padding = "x".repeat(256);
    let senders: Vec<_> = (0..80)
        .map(|i| {
            let client = Arc::clone(&client);
            let padding = padding.clone();
            tokio::spawn(async move {
                let _ = client
                    .issue(&format!("cmd{i}"), Some(json!({ "padding": padding })))
                    .await;
            })
        })
        .collect();

    // One frame in the writer, a full queue, and a caller parked on it.
    tokio::time::timeout(WAIT, async {
        while client.pending_count().await < 66 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("outbound queue fills");

    peer.send(&Message::Request(Request {
        seq: 7,
        command: "startDebugging".into(),
        arguments: None,
    }))
    .await;
    peer.event("output", json!({ "output": "still flowing" })).await;

    let event = tokio::time::timeout(WAIT, events.next())
        .await
        .expect("reader keeps delivering events")
        .expect("stream open");
    assert_eq!(event.body_str("output"), Some("still flowing"));

    client.close().await;
    for sender in senders {
        sender.await.expect("issuer task");
    }
}
