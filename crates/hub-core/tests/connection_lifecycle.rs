use std::sync::Arc;
use std::time::Duration;

use devhub_core::channel::memory::{self, Frame, MemoryDevice};
use devhub_core::channel::{close_code, OutboundChannel};
use devhub_core::{
    CloseReason, CommandEnvelope, CommandRequest, Hub, HubConfig, HubError, PeerId,
    PeerRegistration, PeerStatus, TaskState,
};
use serde_json::json;
use tokio::task::JoinHandle;

fn hub_with(config: HubConfig) -> Arc<Hub> {
    Arc::new(Hub::new(&config).expect("valid secret"))
}

fn hub() -> Arc<Hub> {
    hub_with(HubConfig {
        secret: "test-secret".into(),
        ..HubConfig::default()
    })
}

fn phone(name: &str) -> PeerRegistration {
    PeerRegistration {
        name: name.into(),
        device_type: "android".into(),
        os_info: Some("Android 14".into()),
        capabilities: Some(vec!["screenshot".into()]),
    }
}

fn connect(
    hub: &Arc<Hub>,
    peer_id: &PeerId,
) -> (MemoryDevice, JoinHandle<devhub_core::ConnectionReport>) {
    let (outbound, inbound, device) = memory::pair();
    let outbound: Arc<dyn OutboundChannel> = Arc::new(outbound);
    let hub = Arc::clone(hub);
    let peer_id = peer_id.clone();
    let handle = tokio::spawn(async move { hub.serve_connection(peer_id, outbound, inbound).await });
    (device, handle)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn next_command(device: &MemoryDevice) -> CommandEnvelope {
    match device.recv().await {
        Some(Frame::Text(text)) => serde_json::from_str(&text).expect("command envelope"),
        other => panic!("expected command, got {other:?}"),
    }
}

#[tokio::test]
async fn screenshot_reply_completes_task() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();

    let (device, _handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;
    assert_eq!(hub.peer(&peer).unwrap().status, PeerStatus::Connected);

    let task = hub
        .open_screenshot_task(&peer, Some("r1".into()), None)
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Pending);

    let command = next_command(&device).await;
    assert_eq!(command.command_id, "r1");
    assert_eq!(command.action, "screenshot");

    device
        .send(r#"{"command_id":"r1","status":"success","result":{"screenshot":"iVBORw0"}}"#)
        .unwrap();
    wait_until(|| {
        hub.read_screenshot_task("r1")
            .map(|task| task.state == TaskState::Completed)
            .unwrap_or(false)
    })
    .await;

    let task = hub.read_screenshot_task("r1").unwrap();
    assert_eq!(task.result, Some(json!({"screenshot": "iVBORw0"})));
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn failed_reply_marks_task_failed() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (device, _handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;

    hub.open_screenshot_task(&peer, Some("r2".into()), None)
        .await
        .unwrap();
    next_command(&device).await;
    device
        .send(r#"{"command_id":"r2","status":"error","error_message":"no display"}"#)
        .unwrap();

    wait_until(|| {
        hub.read_screenshot_task("r2")
            .map(|task| task.state == TaskState::Failed)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(
        hub.read_screenshot_task("r2").unwrap().error.as_deref(),
        Some("no display")
    );
}

#[tokio::test]
async fn dispatch_to_never_connected_peer_creates_no_task() {
    let hub = hub();
    let peer = hub.register_peer(phone("phone-1")).device_id;

    let err = hub
        .dispatch_command(&peer, CommandRequest::new("click"))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::PeerNotConnected(_)));

    let err = hub
        .open_screenshot_task(&peer, Some("r1".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::PeerNotConnected(_)));
    assert!(matches!(
        hub.read_screenshot_task("r1"),
        Err(HubError::UnknownTask(_))
    ));
    assert!(hub.correlator().is_empty());
}

#[tokio::test]
async fn credential_for_other_peer_is_rejected() {
    let hub = hub();
    let target = hub.register_peer(phone("phone-1")).device_id;
    let intruder = hub.register_peer(phone("phone-2"));

    let (device, handle) = connect(&hub, &target);
    device
        .send(json!({ "token": intruder.token }).to_string())
        .unwrap();

    let report = handle.await.unwrap();
    assert!(matches!(report.reason, CloseReason::AuthFailed(_)));
    assert!(!report.authenticated);
    assert_eq!(
        device.recv().await,
        Some(Frame::Close {
            code: close_code::POLICY_VIOLATION,
            reason: "Auth failed".into()
        })
    );
    assert!(!hub.connections().is_connected(&target));
    assert_eq!(hub.peer(&target).unwrap().status, PeerStatus::Registered);
}

#[tokio::test]
async fn unparseable_auth_message_is_rejected() {
    let hub = hub();
    let peer = hub.register_peer(phone("phone-1")).device_id;
    let (device, handle) = connect(&hub, &peer);
    device.send("not json").unwrap();

    let report = handle.await.unwrap();
    assert!(matches!(
        report.reason.error(),
        Some(HubError::AuthFailed(_))
    ));
    assert!(!hub.connections().is_connected(&peer));
}

#[tokio::test(start_paused = true)]
async fn silent_connection_times_out() {
    let hub = hub();
    let peer = hub.register_peer(phone("phone-1")).device_id;
    let (device, handle) = connect(&hub, &peer);

    let report = handle.await.unwrap();
    assert!(matches!(report.reason, CloseReason::AuthTimeout));
    assert_eq!(
        device.recv().await,
        Some(Frame::Close {
            code: close_code::POLICY_VIOLATION,
            reason: "Auth timeout".into()
        })
    );
}

#[tokio::test]
async fn dropped_connection_leaves_task_pending() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (mut device, handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;

    hub.open_screenshot_task(&peer, Some("r1".into()), None)
        .await
        .unwrap();
    device.hang_up();

    let report = handle.await.unwrap();
    assert!(matches!(report.reason, CloseReason::EndOfStream));
    assert!(!hub.connections().is_connected(&peer));
    assert_eq!(hub.peer(&peer).unwrap().status, PeerStatus::Disconnected);
    assert_eq!(
        hub.read_screenshot_task("r1").unwrap().state,
        TaskState::Pending
    );
}

#[tokio::test]
async fn disconnect_sweep_fails_pending_tasks_when_enabled() {
    let hub = hub_with(HubConfig {
        secret: "test-secret".into(),
        fail_pending_on_disconnect: true,
        ..HubConfig::default()
    });
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (mut device, handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;

    hub.open_screenshot_task(&peer, Some("r1".into()), None)
        .await
        .unwrap();
    device.hang_up();
    handle.await.unwrap();

    let task = hub.read_screenshot_task("r1").unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error.as_deref(), Some("peer disconnected"));
}

#[tokio::test]
async fn malformed_reply_closes_connection() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (device, handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    device.send("{broken").unwrap();

    let report = handle.await.unwrap();
    assert!(report.authenticated);
    assert!(matches!(report.reason, CloseReason::Malformed(_)));
    assert!(!hub.connections().is_connected(&peer));
    assert_eq!(
        device.recv().await,
        Some(Frame::Close {
            code: close_code::INVALID_PAYLOAD,
            reason: "Malformed message".into()
        })
    );
}

#[tokio::test]
async fn array_shaped_auth_is_rejected() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (device, handle) = connect(&hub, &peer);
    device
        .send(json!([registration.token]).to_string())
        .unwrap();

    let report = handle.await.unwrap();
    assert!(!report.authenticated);
    assert!(matches!(report.reason, CloseReason::AuthFailed(_)));
    assert!(!hub.connections().is_connected(&peer));
    assert_eq!(
        device.recv().await,
        Some(Frame::Close {
            code: close_code::POLICY_VIOLATION,
            reason: "Auth failed".into()
        })
    );
}

#[tokio::test]
async fn array_shaped_reply_closes_without_resolving() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (device, handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;

    hub.open_screenshot_task(&peer, Some("r1".into()), None)
        .await
        .unwrap();
    next_command(&device).await;
    device
        .send(json!(["r1", "success", { "screenshot": "x" }]).to_string())
        .unwrap();

    let report = handle.await.unwrap();
    assert!(matches!(report.reason, CloseReason::Malformed(_)));
    assert_eq!(report.replies_routed, 0);
    assert_eq!(
        hub.read_screenshot_task("r1").unwrap().state,
        TaskState::Pending
    );
    assert_eq!(
        device.recv().await,
        Some(Frame::Close {
            code: close_code::INVALID_PAYLOAD,
            reason: "Malformed message".into()
        })
    );
}

#[tokio::test]
async fn empty_array_reply_closes_connection() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (device, handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    device.send("[]").unwrap();

    let report = handle.await.unwrap();
    assert!(report.authenticated);
    assert!(matches!(report.reason, CloseReason::Malformed(_)));
    assert_eq!(report.replies_dropped, 0);
    assert!(!hub.connections().is_connected(&peer));
}

#[tokio::test]
async fn caller_request_id_is_sent_verbatim() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (device, _handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;

    let task = hub
        .open_screenshot_task(&peer, Some(" r1 ".into()), None)
        .await
        .unwrap();
    assert_eq!(task.request_id, " r1 ");
    assert_eq!(next_command(&device).await.command_id, " r1 ");

    let generated = hub
        .open_screenshot_task(&peer, Some("   ".into()), None)
        .await
        .unwrap();
    assert!(!generated.request_id.trim().is_empty());
    assert_eq!(next_command(&device).await.command_id, generated.request_id);
}

#[tokio::test]
async fn unmatched_and_duplicate_replies_are_dropped() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (mut device, handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;
    hub.open_screenshot_task(&peer, Some("r1".into()), None)
        .await
        .unwrap();

    device
        .send(r#"{"command_id":"r1","status":"success","result":{"n":1}}"#)
        .unwrap();
    device
        .send(r#"{"command_id":"r1","status":"success","result":{"n":2}}"#)
        .unwrap();
    device
        .send(r#"{"command_id":"nobody","status":"success"}"#)
        .unwrap();
    device.send(r#"{"status":"success"}"#).unwrap();
    device.hang_up();

    let report = handle.await.unwrap();
    assert_eq!(report.replies_routed, 1);
    assert_eq!(report.replies_dropped, 3);
    assert_eq!(
        hub.read_screenshot_task("r1").unwrap().result,
        Some(json!({"n": 1}))
    );
}

#[tokio::test]
async fn reconnect_supersedes_and_stale_cleanup_keeps_new_binding() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let auth = json!({ "token": registration.token }).to_string();

    let (mut first, first_handle) = connect(&hub, &peer);
    first.send(auth.clone()).unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;
    let first_generation = hub.connections().generation(&peer);

    let (second, _second_handle) = connect(&hub, &peer);
    second.send(auth).unwrap();
    wait_until(|| hub.connections().generation(&peer) != first_generation).await;

    first.hang_up();
    first_handle.await.unwrap();
    assert!(hub.connections().is_connected(&peer));
    assert_eq!(hub.peer(&peer).unwrap().status, PeerStatus::Connected);

    hub.dispatch_command(&peer, CommandRequest::new("click").with_command_id("c1"))
        .await
        .unwrap();
    assert_eq!(next_command(&second).await.command_id, "c1");
}

#[tokio::test]
async fn shutdown_closes_active_connections() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (device, handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;

    hub.shutdown();
    let report = handle.await.unwrap();
    assert!(matches!(report.reason, CloseReason::Shutdown));
    assert!(hub.is_shutting_down());
    assert!(hub.connections().is_empty());
    assert_eq!(
        device.recv().await,
        Some(Frame::Close {
            code: close_code::GOING_AWAY,
            reason: "Server shutting down".into()
        })
    );
}

#[tokio::test]
async fn cancelled_connection_still_unbinds() {
    let hub = hub();
    let registration = hub.register_peer(phone("phone-1"));
    let peer = registration.device_id.clone();
    let (device, handle) = connect(&hub, &peer);
    device
        .send(json!({ "token": registration.token }).to_string())
        .unwrap();
    wait_until(|| hub.connections().is_connected(&peer)).await;

    handle.abort();
    let _ = handle.await;
    assert!(!hub.connections().is_connected(&peer));
    assert_eq!(hub.peer(&peer).unwrap().status, PeerStatus::Disconnected);
}
