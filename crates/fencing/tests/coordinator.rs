//! Integration tests for the fencer protocol client.
//!
//! A mock fencer listens on a Unix socket in a temporary directory; each test
//! scripts its side of the conversation line by line.

use std::sync::Arc;
use std::time::Duration;

use fencing::client::{
    events, ops, CallbackData, FenceEvent, Frame, Notification, Reply, Request, Response,
    TimeoutUpdate,
};
use fencing::{CallOptions, ConnectionMode, FenceError, FencerClient, FencingConfig, NodeRef};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

// =============================================================================
// Mock Fencer
// =============================================================================

/// One accepted client connection, seen from the fencer's side.
struct MockFencer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl MockFencer {
    async fn recv(&mut self) -> Request {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("client sent nothing")
            .unwrap()
            .expect("client hung up");
        match Frame::decode(&line).unwrap() {
            Frame::Command(request) => request,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    async fn send(&mut self, frame: Frame) {
        self.writer
            .write_all(frame.encode().unwrap().as_bytes())
            .await
            .unwrap();
    }

    async fn respond(&mut self, call_id: i32, result_code: i32, payload: Option<serde_json::Value>) {
        self.send(Frame::Response(Response {
            call_id: Some(call_id),
            result_code: Some(result_code),
            payload,
            ..Response::default()
        }))
        .await;
    }

    /// Answer the registration handshake.
    async fn accept_registration(&mut self) {
        let hello = self.recv().await;
        assert_eq!(hello.operation, ops::REGISTER);
        self.send(Frame::Response(Response {
            operation: Some(ops::REGISTER.to_string()),
            client_id: Some("client-7f3a".to_string()),
            ..Response::default()
        }))
        .await;
    }
}

/// Bind a mock fencer and return a config pointing at it plus a stream of connections.
fn start_mock_fencer(dir: &TempDir) -> (FencingConfig, mpsc::UnboundedReceiver<MockFencer>) {
    let socket_path = dir.path().join("fencer.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (read_half, writer) = stream.into_split();
            let fencer = MockFencer {
                lines: BufReader::new(read_half).lines(),
                writer,
            };
            if tx.send(fencer).is_err() {
                break;
            }
        }
    });
    let config = FencingConfig {
        socket_path,
        client_name: "integration-test".to_string(),
        default_timeout_secs: 5,
        callback_grace_secs: 1,
        ..FencingConfig::default()
    };
    (config, rx)
}

async fn connect(
    config: &FencingConfig,
    accepted: &mut mpsc::UnboundedReceiver<MockFencer>,
    mode: ConnectionMode,
) -> (FencerClient, MockFencer) {
    let client = FencerClient::new(config.clone());
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(mode).await })
    };
    let mut fencer = accepted.recv().await.unwrap();
    fencer.accept_registration().await;
    connecting.await.unwrap().unwrap();
    (client, fencer)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_connect_without_fencer_fails() {
    let dir = TempDir::new().unwrap();
    let config = FencingConfig {
        socket_path: dir.path().join("missing.sock"),
        ..FencingConfig::default()
    };
    let client = FencerClient::new(config);
    let err = client.connect(ConnectionMode::Command).await.unwrap_err();
    assert_eq!(err, FenceError::NotConnected);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_registration_announces_client_name() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);

    let client = FencerClient::new(config);
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(ConnectionMode::Command).await })
    };
    let mut fencer = accepted.recv().await.unwrap();
    let hello = fencer.recv().await;
    assert_eq!(hello.client_name.as_deref(), Some("integration-test"));
    assert_eq!(hello.call_id, 0);
    fencer
        .send(Frame::Response(Response {
            operation: Some(ops::REGISTER.to_string()),
            client_id: Some("client-7f3a".to_string()),
            ..Response::default()
        }))
        .await;
    connecting.await.unwrap().unwrap();

    let again = client.connect(ConnectionMode::Command).await.unwrap_err();
    assert!(matches!(again, FenceError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_query_returns_device_ids() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);
    let (client, mut fencer) = connect(&config, &mut accepted, ConnectionMode::Command).await;

    let querying = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .query(CallOptions::default(), "node2", Duration::from_secs(5))
                .await
        })
    };
    let request = fencer.recv().await;
    assert_eq!(request.operation, ops::QUERY);
    assert!(request.call_options.sync_call);
    assert_eq!(request.client_token.as_deref(), Some("client-7f3a"));
    assert_eq!(request.payload.as_ref().unwrap()["target"], "node2");
    fencer
        .respond(
            request.call_id,
            0,
            Some(json!({"devices": [{"id": "ipmi-node2", "agent": "fence_ipmilan"}, {"id": "pdu-a"}]})),
        )
        .await;

    let devices = querying.await.unwrap().unwrap();
    assert_eq!(devices, vec!["ipmi-node2", "pdu-a"]);
}

#[tokio::test]
async fn test_stale_reply_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);
    let (client, mut fencer) = connect(&config, &mut accepted, ConnectionMode::Command).await;

    let fencing = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .fence(
                    CallOptions::sync(),
                    "node3",
                    "reboot",
                    Duration::from_secs(5),
                    Duration::ZERO,
                )
                .await
        })
    };
    let request = fencer.recv().await;
    fencer.respond(request.call_id + 1, 0, None).await;

    let err = fencing.await.unwrap().unwrap_err();
    assert!(matches!(err, FenceError::Protocol(ref m) if m.contains("mismatched reply")));
}

#[tokio::test]
async fn test_late_reply_does_not_break_later_calls() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);
    let (client, mut fencer) = connect(&config, &mut accepted, ConnectionMode::Command).await;

    // Zero timeout: the caller only waits for the one second grace.
    let fencing = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .fence(CallOptions::sync(), "node3", "reboot", Duration::ZERO, Duration::ZERO)
                .await
        })
    };
    let late = fencer.recv().await;
    let err = fencing.await.unwrap().unwrap_err();
    assert!(matches!(err, FenceError::Communication(_)));
    assert!(client.is_connected());

    fencer.respond(late.call_id, 0, None).await;

    for target in ["node4", "node5"] {
        let fencing = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .fence(
                        CallOptions::sync(),
                        target,
                        "off",
                        Duration::from_secs(5),
                        Duration::ZERO,
                    )
                    .await
            })
        };
        let request = fencer.recv().await;
        assert!(request.call_id > late.call_id);
        fencer.respond(request.call_id, 0, None).await;

        let reply = fencing.await.unwrap().unwrap();
        assert_eq!(reply.call_id, request.call_id);
    }
}

#[tokio::test]
async fn test_immediate_reply_reaches_callback_registered_with_send() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);
    let (client, mut fencer) = connect(&config, &mut accepted, ConnectionMode::EventLoop).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_command_with_callback(
                    ops::FENCE,
                    Some(json!({ "target": "node6", "action": "off", "timeout": 1, "tolerance": 0 })),
                    CallOptions::default(),
                    Duration::from_secs(1),
                    "fence-node6",
                    move |data: &CallbackData| {
                        let _ = tx.send((data.call_id, data.result.clone()));
                    },
                )
                .await
        })
    };

    // Answer before the sender has had a chance to look at its result.
    let request = fencer.recv().await;
    assert!(!request.call_options.sync_call);
    fencer
        .send(Frame::Reply(Reply {
            call_id: request.call_id,
            result_code: 0,
            payload: None,
        }))
        .await;

    let reply = sending.await.unwrap().unwrap();
    assert_eq!(reply.call_id, request.call_id);

    let (call_id, result) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call_id, request.call_id);
    assert_eq!(result, Ok(()));

    // Past timeout plus grace: the timer must not fire a second time.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(rx.try_recv().is_err());
    assert!(client.pending_calls().is_empty());
}

#[tokio::test]
async fn test_remote_error_code_is_surfaced() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);
    let (client, mut fencer) = connect(&config, &mut accepted, ConnectionMode::Command).await;

    let fencing = {
        let client = client.clone();
        tokio::spawn(async move { client.confirm(CallOptions::sync(), "node3").await })
    };
    let request = fencer.recv().await;
    assert_eq!(request.operation, ops::FENCE);
    assert!(request.call_options.manual_ack);
    assert_eq!(request.payload.as_ref().unwrap()["action"], "off");
    fencer.respond(request.call_id, -libc::ENODEV, None).await;

    let err = fencing.await.unwrap().unwrap_err();
    assert_eq!(err, FenceError::Remote(-libc::ENODEV));
}

#[tokio::test]
async fn test_async_reply_reaches_callback() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);
    let (client, mut fencer) = connect(&config, &mut accepted, ConnectionMode::EventLoop).await;

    let reply = client
        .fence(
            CallOptions::default(),
            "node4",
            "off",
            Duration::from_secs(30),
            Duration::ZERO,
        )
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(client.register_callback(
        reply.call_id,
        Some(Duration::from_secs(30)),
        CallOptions::default(),
        "fence-node4",
        move |data: &CallbackData| {
            let _ = tx.send((data.call_id, data.result.clone()));
        },
    ));

    let request = fencer.recv().await;
    assert_eq!(request.call_id, reply.call_id);
    assert!(!request.call_options.sync_call);
    fencer
        .send(Frame::Reply(Reply {
            call_id: request.call_id,
            result_code: 0,
            payload: None,
        }))
        .await;

    let (call_id, result) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call_id, reply.call_id);
    assert_eq!(result, Ok(()));
    assert!(client.pending_calls().is_empty());
}

#[tokio::test]
async fn test_timeout_update_extends_callback_timer() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);
    let (client, mut fencer) = connect(&config, &mut accepted, ConnectionMode::EventLoop).await;

    let reply = client
        .fence(
            CallOptions::default(),
            "node5",
            "reboot",
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .await
        .unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    client.register_callback(
        reply.call_id,
        Some(Duration::from_secs(1)),
        CallOptions::default().with_timeout_updates(true),
        "fence-node5",
        move |data: &CallbackData| sink.lock().push(data.result.clone()),
    );
    fencer.recv().await;
    fencer
        .send(Frame::Timeout(TimeoutUpdate {
            call_id: reply.call_id,
            timeout: 10,
        }))
        .await;

    // The original timer (1s + 1s grace) would have fired by now.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(results.lock().is_empty());
    assert_eq!(client.pending_calls(), vec![(reply.call_id, "fence-node5".to_string())]);

    fencer
        .send(Frame::Reply(Reply {
            call_id: reply.call_id,
            result_code: 0,
            payload: None,
        }))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*results.lock(), vec![Ok(())]);
}

#[tokio::test]
async fn test_notifications_are_activated_and_delivered() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);
    let client = FencerClient::new(config);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe(events::FENCE, "watcher", move |event: &FenceEvent| {
            let _ = tx.send(event.clone());
        })
        .await
        .unwrap();

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(ConnectionMode::EventLoop).await })
    };
    let mut fencer = accepted.recv().await.unwrap();
    fencer.accept_registration().await;
    let activation = fencer.recv().await;
    assert_eq!(activation.operation, ops::NOTIFY);
    assert_eq!(
        activation.payload,
        Some(json!({"activate": events::FENCE}))
    );
    fencer.respond(activation.call_id, 0, None).await;
    connecting.await.unwrap().unwrap();

    fencer
        .send(Frame::Notify(Notification {
            subtype: events::FENCE.to_string(),
            operation: Some(ops::FENCE.to_string()),
            result_code: 0,
            payload: Some(json!({
                "target": "node6",
                "action": "reboot",
                "origin": "node1",
                "delegate": "node2",
                "remote_op_id": "op-1",
            })),
        }))
        .await;

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.target.as_deref(), Some("node6"));
    assert_eq!(event.executioner.as_deref(), Some("node2"));
    assert_eq!(event.id.as_deref(), Some("op-1"));
}

#[tokio::test]
async fn test_fencer_hangup_fails_pending_work() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);
    let (client, fencer) = connect(&config, &mut accepted, ConnectionMode::Command).await;

    drop(fencer);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client
        .fence(
            CallOptions::sync(),
            "node7",
            "reboot",
            Duration::from_secs(1),
            Duration::ZERO,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FenceError::Communication(_) | FenceError::NotConnected
    ));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_history_and_last_fenced() {
    let dir = TempDir::new().unwrap();
    let (config, mut accepted) = start_mock_fencer(&dir);

    let looking_up = {
        let config = config.clone();
        tokio::spawn(async move {
            fencing::client::last_fenced_time(&config, &NodeRef::Id(3), false).await
        })
    };
    let mut fencer = accepted.recv().await.unwrap();
    fencer.accept_registration().await;
    let request = fencer.recv().await;
    assert_eq!(request.operation, ops::FENCE_HISTORY);
    assert!(request.call_options.cs_nodeid);
    assert_eq!(request.payload.as_ref().unwrap()["target"], "3");
    fencer
        .respond(
            request.call_id,
            0,
            Some(json!({"history": [
                {"target": "node3", "action": "reboot", "state": "done", "completed": "2026-01-02T03:04:05Z"},
                {"target": "node3", "action": "off", "state": "failed", "completed": "2026-02-01T00:00:00Z"},
                {"target": "node3", "action": "reboot", "state": "done", "completed": "2025-12-31T00:00:00Z"},
            ]})),
        )
        .await;

    let when = looking_up.await.unwrap().unwrap().unwrap();
    assert_eq!(when.to_rfc3339(), "2026-01-02T03:04:05+00:00");
}
