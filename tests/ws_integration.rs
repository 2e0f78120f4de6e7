//! Live-server tests for `/ws/{id}`: replay, live streaming, terminal
//! close, and isolation between subscribers.
#![cfg(unix)]

mod common;

use std::time::Duration;

use common::*;
use futures::SinkExt;
use tokio_tungstenite::tungstenite::{self, Message};

#[tokio::test]
async fn subscriber_sees_full_stream_then_normal_close() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("{}echo line1\necho line2\n", wait_for_file("go"));
    let script = write_script(dir.path(), &body);
    let addr = start_server(create_test_state(sh_job(script))).await;

    let id = create_session(addr).await;
    let mut ws = connect_ws(addr, &id).await;
    touch(dir.path(), "go");

    let observed = read_until_close(&mut ws).await;
    assert_eq!(
        observed.durable(),
        vec![output("line1"), output("line2"), completed("line1\nline2\n")]
    );
    assert_eq!(observed.close_code(), Some(1000));

    let snapshot = get_session(addr, &id).await;
    assert_eq!(snapshot["status"], "completed");
    assert_eq!(snapshot["result"], "line1\nline2\n");
    assert_eq!(snapshot["output"], serde_json::json!(["line1", "line2"]));
}

#[tokio::test]
async fn subscriber_receives_status_when_attached_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "echo done\n");
    let state = create_test_state(sh_job(script));
    let addr = start_server(state.clone()).await;

    // Register the session without launching, attach, then start the job.
    let session = state
        .sessions
        .create(serde_json::from_value(analysis_body()).unwrap())
        .unwrap();
    let mut ws = connect_ws(addr, &session.id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    state.runner.launch(session.clone());

    let observed = read_until_close(&mut ws).await;
    assert_eq!(observed.events[0]["type"], "status");
    assert_eq!(observed.events[1], output("done"));
    assert_eq!(observed.events[2], completed("done\n"));
    assert_eq!(observed.events.len(), 3);
}

#[tokio::test]
async fn late_subscriber_gets_replay_and_terminal_event() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "echo line1\necho line2\n");
    let addr = start_server(create_test_state(sh_job(script))).await;

    let id = create_session(addr).await;
    let snapshot = wait_for_finish(addr, &id).await;
    assert_eq!(snapshot["status"], "completed");

    let mut ws = connect_ws(addr, &id).await;
    let observed = read_until_close(&mut ws).await;
    assert_eq!(
        observed.events,
        vec![output("line1"), output("line2"), completed("line1\nline2\n")]
    );
    assert_eq!(observed.close_code(), Some(1000));
}

#[tokio::test]
async fn mid_stream_subscriber_sees_each_line_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "echo line1\ntouch started\n{}echo line2\n",
        wait_for_file("go")
    );
    let script = write_script(dir.path(), &body);
    let addr = start_server(create_test_state(sh_job(script))).await;

    let id = create_session(addr).await;
    let mut early = connect_ws(addr, &id).await;
    wait_until_exists(dir.path(), "started").await;
    let mut late = connect_ws(addr, &id).await;
    touch(dir.path(), "go");

    let expected = vec![output("line1"), output("line2"), completed("line1\nline2\n")];
    assert_eq!(read_until_close(&mut early).await.durable(), expected);
    assert_eq!(read_until_close(&mut late).await.durable(), expected);
}

#[tokio::test]
async fn broken_subscriber_does_not_affect_others() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("echo before\n{}echo after\n", wait_for_file("go"));
    let script = write_script(dir.path(), &body);
    let addr = start_server(create_test_state(sh_job(script))).await;

    let id = create_session(addr).await;
    let broken = connect_ws(addr, &id).await;
    let mut healthy = connect_ws(addr, &id).await;
    drop(broken);
    tokio::time::sleep(Duration::from_millis(50)).await;
    touch(dir.path(), "go");

    let observed = read_until_close(&mut healthy).await;
    assert_eq!(
        observed.durable(),
        vec![output("before"), output("after"), completed("before\nafter\n")]
    );
    let snapshot = wait_for_finish(addr, &id).await;
    assert_eq!(snapshot["status"], "completed");
}

#[tokio::test]
async fn failed_job_ends_stream_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(create_test_state(sh_job(dir.path().join("missing.sh")))).await;

    let id = create_session(addr).await;
    let mut ws = connect_ws(addr, &id).await;
    let observed = read_until_close(&mut ws).await;

    let last = observed.events.last().expect("terminal event");
    assert_eq!(last["type"], "error");
    assert!(last["data"].as_str().unwrap().contains("script not found"));
    assert_eq!(observed.events.iter().filter(|e| e["type"] == "error").count(), 1);

    let snapshot = get_session(addr, &id).await;
    assert_eq!(snapshot["status"], "failed");
    assert!(snapshot["end_time"].is_string());
}

#[tokio::test]
async fn nonzero_exit_reports_failure_to_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("{}echo partial\necho oops >&2\nexit 2\n", wait_for_file("go"));
    let script = write_script(dir.path(), &body);
    let addr = start_server(create_test_state(sh_job(script))).await;

    let id = create_session(addr).await;
    let mut ws = connect_ws(addr, &id).await;
    touch(dir.path(), "go");

    let observed = read_until_close(&mut ws).await;
    let durable = observed.durable();
    assert!(durable.contains(&output("partial")));
    assert!(durable.contains(&output("[stderr] oops")));
    let last = durable.last().unwrap();
    assert_eq!(last["type"], "error");
    assert!(last["data"].as_str().unwrap().contains("exit status: 2"));
}

#[tokio::test]
async fn cancel_over_http_stops_job() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "echo started\nexec sleep 30\n");
    let addr = start_server(create_test_state(sh_job(script))).await;

    let id = create_session(addr).await;
    let mut ws = connect_ws(addr, &id).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/session/{id}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let observed = read_until_close(&mut ws).await;
    assert_eq!(
        observed.events.last(),
        Some(&serde_json::json!({ "type": "error", "data": "analysis cancelled" }))
    );

    let response = client
        .post(format!("http://{addr}/api/session/{id}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn unknown_session_is_rejected_before_upgrade() {
    let addr = start_server(create_test_state(sh_job("unused.sh".into()))).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/no-such-session"))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 404),
        other => panic!("expected HTTP 404, got {other:?}"),
    }
}

#[tokio::test]
async fn inbound_frames_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!("{}echo ok\n", wait_for_file("go"));
    let script = write_script(dir.path(), &body);
    let addr = start_server(create_test_state(sh_job(script))).await;

    let id = create_session(addr).await;
    let mut ws = connect_ws(addr, &id).await;
    ws.send(Message::Text("hello?".into())).await.unwrap();
    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    touch(dir.path(), "go");

    let observed = read_until_close(&mut ws).await;
    assert_eq!(observed.durable(), vec![output("ok"), completed("ok\n")]);
}

#[tokio::test]
async fn shutdown_closes_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "exec sleep 30\n");
    let state = create_test_state(sh_job(script));
    let addr = start_server(state.clone()).await;

    let id = create_session(addr).await;
    let mut ws = connect_ws(addr, &id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    state.shutdown.shutdown();
    let observed = read_until_close(&mut ws).await;
    let frame = observed.close.expect("close frame");
    assert_eq!(frame.reason.as_str(), "server shutting down");

    assert_eq!(state.sessions.drain(), 1);
    assert!(state.runner.shutdown(Duration::from_secs(5)).await);
    assert_eq!(get_session(addr, &id).await["status"], "failed");
}

#[tokio::test]
async fn wind_down_delivers_cancellation_before_closing() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "echo started\nexec sleep 30\n");
    let state = create_test_state(sh_job(script));
    let addr = start_server(state.clone()).await;

    let id = create_session(addr).await;
    let mut ws = connect_ws(addr, &id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(state.wind_down(Duration::from_secs(5)).await);
    let observed = read_until_close(&mut ws).await;
    assert_eq!(
        observed.durable().last(),
        Some(&serde_json::json!({ "type": "error", "data": "analysis cancelled" }))
    );
    assert_eq!(observed.close_code(), Some(1000));

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/analyze"))
        .json(&analysis_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(state.sessions.len(), 1);
}
