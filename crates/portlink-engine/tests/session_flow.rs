#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use portlink_core::envelope::Envelope;
use portlink_core::{ErrorCode, PortLinkError};
use portlink_engine::config::EngineConfig;
use portlink_engine::session::SessionManager;
use portlink_engine::transport::{InProcPort, PortKind, PortPair};
use portlink_engine::{
    Channel, ChannelOptions, ChannelState, FrameChannel, FrameSide, RegisterOptions, SendOptions,
    SystemEvent, SystemEventKind, WindowRole,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

const PARENT: &str = "https://parent.test";
const CHILD: &str = "https://child.test";

fn cfg(allowed: &[&str]) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.engine.allowed_origins = allowed.iter().map(|s| s.to_string()).collect();
    cfg.heartbeat.enabled = false;
    cfg
}

/// One parent/child frame pair, fully handshaken. The ports come back too so
/// tests can sabotage the transport.
async fn frame_pair(
    parent_cfg: EngineConfig,
    child_cfg: EngineConfig,
) -> (
    Arc<SessionManager>,
    Arc<SessionManager>,
    Arc<InProcPort>,
    Arc<InProcPort>,
) {
    let (pa, pb) = PortPair::linked(PortKind::EmbeddedFrame, PARENT, CHILD, false);
    let parent = SessionManager::new(parent_cfg, PARENT).unwrap();
    let child = SessionManager::new(child_cfg, CHILD).unwrap();
    let (r_parent, r_child) = tokio::join!(
        parent.connect_frame("child", pa.clone(), FrameSide::Host, Some(CHILD.to_string())),
        child.connect_frame("parent", pb.clone(), FrameSide::Embedded, None),
    );
    r_parent.unwrap();
    r_child.unwrap();
    (parent, child, pa, pb)
}

fn watch_events(
    mgr: &SessionManager,
    kind: SystemEventKind,
) -> mpsc::UnboundedReceiver<SystemEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    mgr.on_system(kind, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SystemEvent>) -> SystemEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event wait timed out")
        .expect("event stream closed")
}

#[tokio::test]
async fn handshake_and_request_reply_roundtrip() {
    let (parent, child, _pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;
    assert_eq!(parent.connected_targets(), vec!["child"]);
    assert_eq!(child.connected_targets(), vec!["parent"]);

    child
        .on(
            "math.add",
            |delivery, responder| {
                let a = delivery.payload["a"].as_i64().unwrap();
                let b = delivery.payload["b"].as_i64().unwrap();
                responder.ok(json!({ "sum": a + b }));
            },
            RegisterOptions::default(),
        )
        .unwrap();

    let reply = parent
        .send("child", "math.add", json!({ "a": 2, "b": 3 }), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply["sum"], 5);
}

#[tokio::test]
async fn handler_error_reply_maps_back_to_typed_error() {
    let (parent, child, _pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;

    child
        .on(
            "math.sqrt",
            |delivery, responder| {
                let n = delivery.payload["n"].as_f64().unwrap_or(-1.0);
                if n < 0.0 {
                    responder.err(ErrorCode::Validation, "negative input");
                } else {
                    responder.ok(json!({ "root": n.sqrt() }));
                }
            },
            RegisterOptions::default(),
        )
        .unwrap();

    let err = parent
        .send("child", "math.sqrt", json!({ "n": -4 }), SendOptions::default())
        .await
        .expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::Validation);
}

#[tokio::test]
async fn unanswered_request_times_out_after_all_attempts() {
    let (parent, _child, _pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;

    // The child has no handler for this type; every attempt goes unanswered.
    let opts = SendOptions {
        timeout_ms: Some(60),
        retries: Some(2),
        ..SendOptions::default()
    };
    let mut timeouts = watch_events(&parent, SystemEventKind::MessageTimeout);

    let err = parent
        .send("child", "quiet.void", json!({}), opts)
        .await
        .expect_err("must time out");
    match err {
        PortLinkError::Timeout { attempts } => assert_eq!(attempts, 3),
        other => panic!("expected timeout, got {other:?}"),
    }

    let event = next_event(&mut timeouts).await;
    assert_eq!(event.target_id.as_deref(), Some("child"));
    assert_eq!(event.detail.unwrap()["attempts"], 3);
}

#[tokio::test]
async fn send_side_schema_failure_is_rejected_before_transmission() {
    let (parent, child, _pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;

    let schema = portlink_core::schema::Schema::parse(json!({
        "type": "object",
        "required": ["name"],
        "properties": { "name": { "type": "string", "minLength": 1 } }
    }))
    .unwrap();
    parent
        .on("user.create", |_, _| {}, RegisterOptions {
            schema: Some(schema),
            ..RegisterOptions::default()
        })
        .unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    child
        .on(
            "user.create",
            move |delivery, _| {
                let _ = seen_tx.send(delivery.payload);
            },
            RegisterOptions::default(),
        )
        .unwrap();

    let err = parent
        .send("child", "user.create", json!({ "name": 42 }), SendOptions::fire_and_forget())
        .await
        .expect_err("must fail validation");
    assert_eq!(err.code(), ErrorCode::Validation);

    // Nothing crossed the wire.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen_rx.try_recv().is_err());
}

#[tokio::test]
async fn reserved_type_names_are_rejected() {
    let (parent, _child, _pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;

    let err = parent
        .on("__portlink_ping__", |_, _| {}, RegisterOptions::default())
        .expect_err("must reject");
    assert_eq!(err.code(), ErrorCode::Config);

    let err = parent
        .send("child", "__portlink_disconnect__", json!({}), SendOptions::default())
        .await
        .expect_err("must reject");
    assert_eq!(err.code(), ErrorCode::Validation);
}

#[tokio::test]
async fn unknown_target_is_reported() {
    let parent = SessionManager::new(cfg(&[CHILD]), PARENT).unwrap();
    let err = parent
        .send("ghost", "any.type", json!({}), SendOptions::default())
        .await
        .expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::TargetNotFound);

    let err = parent.disconnect("ghost").await.expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::TargetNotFound);
}

#[tokio::test]
async fn local_disconnect_notifies_both_sides() {
    let (parent, child, _pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;
    let mut parent_events = watch_events(&parent, SystemEventKind::Disconnected);
    let mut child_events = watch_events(&child, SystemEventKind::Disconnected);

    parent.disconnect("child").await.unwrap();

    let event = next_event(&mut parent_events).await;
    assert_eq!(event.target_id.as_deref(), Some("child"));
    assert_eq!(event.reason.as_deref(), Some("local_disconnect"));
    assert!(parent.target_state("child").is_none());

    // The goodbye control envelope tears the counterparty down too.
    let event = next_event(&mut child_events).await;
    assert_eq!(event.reason.as_deref(), Some("remote_disconnect"));

    let err = parent
        .send("child", "any.type", json!({}), SendOptions::default())
        .await
        .expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::TargetNotFound);
}

#[tokio::test]
async fn heartbeat_misses_disconnect_and_reject_pending() {
    let mut parent_cfg = cfg(&[CHILD]);
    parent_cfg.heartbeat.enabled = true;
    parent_cfg.heartbeat.interval_ms = 40;
    parent_cfg.heartbeat.timeout_ms = 25;
    parent_cfg.heartbeat.max_missed = 3;
    let (parent, _child, pa, _pb) = frame_pair(parent_cfg, cfg(&[PARENT])).await;

    let mut disconnects = watch_events(&parent, SystemEventKind::Disconnected);

    // Leave a response-expecting request in flight, then kill the transport
    // underneath the heartbeat.
    let pending = {
        let parent = Arc::clone(&parent);
        tokio::spawn(async move {
            parent
                .send(
                    "child",
                    "slow.op",
                    json!({}),
                    SendOptions {
                        timeout_ms: Some(5_000),
                        retries: Some(0),
                        ..SendOptions::default()
                    },
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pa.set_fail_sends(true);

    let event = next_event(&mut disconnects).await;
    assert_eq!(event.target_id.as_deref(), Some("child"));
    assert_eq!(event.reason.as_deref(), Some("heartbeat_timeout"));

    // The in-flight request was rejected immediately, not left to its timeout.
    let err = timeout(Duration::from_millis(500), pending)
        .await
        .expect("pending must settle")
        .unwrap()
        .expect_err("must be rejected");
    assert_eq!(err.code(), ErrorCode::Connection);
}

#[tokio::test]
async fn broadcast_isolates_per_target_failures() {
    let origins = ["https://c1.test", "https://c2.test", "https://c3.test"];
    let parent = SessionManager::new(cfg(&origins), PARENT).unwrap();

    let mut ports = Vec::new();
    let mut receipts = Vec::new();
    for origin in origins {
        let (pa, pb) = PortPair::linked(PortKind::EmbeddedFrame, PARENT, origin, false);
        let child = SessionManager::new(cfg(&[PARENT]), origin).unwrap();
        let (r_parent, r_child) = tokio::join!(
            parent.connect_frame(origin, pa.clone(), FrameSide::Host, Some(origin.to_string())),
            child.connect_frame("parent", pb, FrameSide::Embedded, None),
        );
        r_parent.unwrap();
        r_child.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        child
            .on(
                "announce",
                move |delivery, _| {
                    let _ = tx.send(delivery.payload);
                },
                RegisterOptions::default(),
            )
            .unwrap();
        ports.push(pa);
        receipts.push((origin, child, rx));
    }

    // Sabotage the middle target's transport only.
    ports[1].set_fail_sends(true);

    let result = parent.broadcast("announce", json!({ "n": 7 })).await.unwrap();
    assert_eq!(result.outcomes.len(), 3);
    assert_eq!(result.delivered(), 2);
    assert_eq!(result.failed(), vec!["https://c2.test"]);
    assert!(!result.all_ok());

    for (origin, _child, rx) in &mut receipts {
        if *origin == "https://c2.test" {
            continue;
        }
        let payload = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("broadcast delivery timed out")
            .expect("receipt stream closed");
        assert_eq!(payload["n"], 7);
    }
}

#[tokio::test]
async fn hostile_and_foreign_traffic_is_dropped_without_a_trace() {
    let (parent, _child, pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    parent
        .on(
            "evil.op",
            move |delivery, _| {
                let _ = seen_tx.send(delivery.payload);
            },
            RegisterOptions::default(),
        )
        .unwrap();

    // Well-formed protocol envelope from a non-allow-listed origin.
    let env = Envelope::message("evil.op", json!({ "x": 1 }), "https://evil.test", false);
    pa.inject("https://evil.test", &env.encode().unwrap()).await;

    // Allow-listed event origin, but the envelope claims a different sender.
    let env = Envelope::message("evil.op", json!({ "x": 2 }), "https://evil.test", false);
    pa.inject(CHILD, &env.encode().unwrap()).await;

    // Unrelated traffic sharing the primitive.
    pa.inject(CHILD, r#"{"jsonrpc":"2.0","method":"evil.op"}"#).await;
    pa.inject(CHILD, "not json at all").await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(seen_rx.try_recv().is_err());
    // The channel is unharmed.
    assert_eq!(parent.target_state("child"), Some(portlink_engine::TargetState::Connected));
}

#[tokio::test]
async fn failed_handshake_leaves_no_reader_behind() {
    // Counterparty endpoint exists but never answers, so the failure is a
    // handshake timeout rather than a closed port.
    let (pa, _pb) = PortPair::linked(PortKind::EmbeddedFrame, PARENT, CHILD, false);
    let before = Arc::strong_count(&pa);
    let channel = FrameChannel::new(
        pa.clone(),
        FrameSide::Host,
        ChannelOptions {
            allowed_origins: vec![CHILD.to_string()],
            handshake_timeout_ms: 100,
            remote_origin: Some(CHILD.to_string()),
        },
    );
    let err = channel.connect().await.expect_err("must time out");
    assert_eq!(err.code(), ErrorCode::Connection);
    assert_eq!(channel.state(), ChannelState::Disconnected);

    // Dropping the failed channel must release the port: the reader task was
    // torn down with the attempt and holds nothing. Abortion lands at the
    // task's next cancellation point, so poll briefly.
    drop(channel);
    for _ in 0..100 {
        if Arc::strong_count(&pa) == before {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(Arc::strong_count(&pa), before);
}

#[tokio::test]
async fn inbound_schema_failure_reaches_only_the_error_hook() {
    let (parent, child, _pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;

    let schema = portlink_core::schema::Schema::parse(json!({
        "type": "object",
        "required": ["name"]
    }))
    .unwrap();
    let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    child
        .on(
            "user.create",
            move |delivery, _| {
                let _ = seen_tx.send(delivery.payload);
            },
            RegisterOptions {
                schema: Some(schema),
                on_error: Some(Arc::new(move |e: &PortLinkError| {
                    let _ = hook_tx.send(e.code());
                })),
                ..RegisterOptions::default()
            },
        )
        .unwrap();

    // The sender holds no schema for this type, so the envelope goes out and
    // fails validation on the receiving side.
    parent
        .send("child", "user.create", json!({}), SendOptions::fire_and_forget())
        .await
        .unwrap();

    let code = timeout(Duration::from_secs(2), hook_rx.recv())
        .await
        .expect("hook wait timed out")
        .expect("hook stream closed");
    assert_eq!(code, ErrorCode::Validation);
    // No handler ran.
    assert!(seen_rx.try_recv().is_err());
}

#[tokio::test]
async fn responder_transmits_only_the_first_reply() {
    let (parent, child, _pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;

    child
        .on(
            "greet",
            |_, responder| {
                responder.ok(json!({ "seq": 1 }));
                responder.ok(json!({ "seq": 2 }));
                responder.err(ErrorCode::Internal, "late");
            },
            RegisterOptions::default(),
        )
        .unwrap();

    let reply = parent
        .send("child", "greet", json!({}), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply["seq"], 1);

    // A stray duplicate would arrive with no pending entry; correlation and
    // dispatch keep working afterwards.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reply = parent
        .send("child", "greet", json!({}), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply["seq"], 1);
}

#[tokio::test]
async fn window_channel_handshakes_and_delivers() {
    let (pa, pb) = PortPair::linked(PortKind::OpenedWindow, PARENT, CHILD, false);
    let opener = SessionManager::new(cfg(&[CHILD]), PARENT).unwrap();
    let opened = SessionManager::new(cfg(&[PARENT]), CHILD).unwrap();
    let (r_opener, r_opened) = tokio::join!(
        opener.connect_window("popup", pa, WindowRole::Opener, Some(CHILD.to_string())),
        opened.connect_window("opener", pb, WindowRole::Opened, None),
    );
    r_opener.unwrap();
    r_opened.unwrap();

    opened
        .on(
            "echo",
            |delivery, responder| responder.ok(delivery.payload),
            RegisterOptions::default(),
        )
        .unwrap();
    let reply = opener
        .send("popup", "echo", json!({ "hello": "window" }), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply["hello"], "window");
}

#[tokio::test]
async fn connect_rejects_duplicate_target_ids() {
    let (parent, _child, pa, _pb) = frame_pair(cfg(&[CHILD]), cfg(&[PARENT])).await;
    let err = parent
        .connect_frame("child", pa, FrameSide::Host, Some(CHILD.to_string()))
        .await
        .expect_err("must reject duplicate id");
    assert_eq!(err.code(), ErrorCode::Config);
}
