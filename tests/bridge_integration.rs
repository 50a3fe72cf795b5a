//! End-to-end tests for the bridge: a real `BridgeHub` plus the BROP, CDP,
//! and extension-conduit listeners bound to loopback ports, driven with
//! plain WebSocket clients standing in for a CDP client, a BROP client, and
//! the extension. Same shape as the teacher's own `extension_bridge_test`
//! harness — free-port helper, `ws_connect`/`send_json`/`recv_json`, real
//! `#[tokio::test]`s instead of mocks — scaled up from one accept loop to
//! three.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use brop_bridge::bridge::{brop_listener, cdp_listener, extension_conduit, hub::BridgeHub};
use brop_bridge::config::BridgeConfig;
use brop_bridge::logging::EventLog;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port by binding to port 0 and reading the assigned port back.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn ws_connect(port: u16, path: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}{path}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("failed to connect to bridge");
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("failed to send message");
}

async fn recv_json_timeout(ws: &mut Ws, timeout_ms: u64) -> Option<Value> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).expect("bridge sent invalid JSON")
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => panic!("connection closed unexpectedly"),
                Some(Err(e)) => panic!("websocket error: {e}"),
                _ => continue,
            }
        }
    })
    .await
    .ok()
}

/// Like `recv_json_timeout`, but a timeout or closed connection is `None`
/// instead of a panic — used to assert something does *not* arrive.
async fn try_recv_json_timeout(ws: &mut Ws, timeout_ms: u64) -> Option<Value> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).ok(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                _ => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

struct TestBridge {
    hub: Arc<BridgeHub>,
    config: Arc<BridgeConfig>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for TestBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Spin up all three listeners on fresh loopback ports, sharing one hub —
/// the same wiring `bridge::run` does, minus the signal-driven shutdown race
/// and the periodic sweeper, neither of which these tests need.
async fn start_bridge() -> TestBridge {
    start_bridge_with(|_| {}).await
}

/// Like `start_bridge`, but lets a test tweak the config (e.g. shorten the
/// queue deadline) before the listeners bind.
async fn start_bridge_with(customize: impl FnOnce(&mut BridgeConfig)) -> TestBridge {
    let mut config = BridgeConfig::default();
    config.brop_port = free_port().await;
    config.extension_port = free_port().await;
    config.cdp_port = free_port().await;
    customize(&mut config);
    let hub = Arc::new(BridgeHub::new(EventLog::new(100)));
    let config = Arc::new(config);

    let brop_addr = SocketAddr::from(([127, 0, 0, 1], config.brop_port));
    let extension_addr = SocketAddr::from(([127, 0, 0, 1], config.extension_port));
    let cdp_addr = SocketAddr::from(([127, 0, 0, 1], config.cdp_port));

    let tasks = vec![
        tokio::spawn({
            let hub = Arc::clone(&hub);
            let config = Arc::clone(&config);
            async move {
                let _ = brop_listener::serve(hub, config, brop_addr).await;
            }
        }),
        tokio::spawn({
            let hub = Arc::clone(&hub);
            let config = Arc::clone(&config);
            async move {
                let _ = extension_conduit::serve(hub, config, extension_addr).await;
            }
        }),
        tokio::spawn({
            let hub = Arc::clone(&hub);
            let config = Arc::clone(&config);
            async move {
                let _ = cdp_listener::serve(hub, config, cdp_addr).await;
            }
        }),
    ];

    // Give the listeners a moment to bind before the test starts connecting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestBridge { hub, config, tasks }
}

async fn connect_extension(bridge: &TestBridge) -> Ws {
    ws_connect(bridge.config.extension_port, "/").await
}

async fn connect_cdp_browser_level(bridge: &TestBridge) -> Ws {
    ws_connect(bridge.config.cdp_port, "/devtools/browser/dummy").await
}

async fn connect_brop(bridge: &TestBridge) -> Ws {
    ws_connect(bridge.config.brop_port, "/").await
}

/// Run one pass of `bridge::mod`'s periodic sweep by hand — these tests spin
/// up the listeners directly rather than through `bridge::run`, so nothing
/// else drives `sweep_expired_queue`/`fail_pending` on a timer.
async fn sweep_once(bridge: &TestBridge) {
    for pending in bridge.hub.sweep_expired_pending().await {
        extension_conduit::fail_pending(&bridge.hub, &bridge.hub.log, pending, -32000, "command timed out").await;
    }
    for cmd in bridge.hub.sweep_expired_queue().await {
        let pending = brop_bridge::bridge::hub::PendingRequest {
            request_id: brop_bridge::bridge::frame::RequestId(0),
            origin: cmd.client_id,
            method: cmd.method,
            session_id: None,
            original_params: Value::Null,
            client_facing_id: cmd.request_id,
            deadline: cmd.deadline,
            keep_across_reconnect: false,
            is_create_target: false,
        };
        extension_conduit::fail_pending(&bridge.hub, &bridge.hub.log, pending, -32000, "Chrome extension not connected").await;
    }
}

/// A bare HTTP/1.1 GET over a raw socket — mirrors `cli::http_get`, kept
/// local to the test since that helper isn't part of the crate's public
/// surface.
async fn http_get(port: u16, path: &str) -> Value {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut stream = TcpStream::connect(addr).await.expect("connect for HTTP GET");
    let request = format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    let (_, body) = text.split_once("\r\n\r\n").expect("well-formed HTTP response");
    serde_json::from_str(body).expect("valid JSON body")
}

#[tokio::test]
async fn discovery_json_version_mimics_chrome() {
    let bridge = start_bridge().await;

    let version = http_get(bridge.config.cdp_port, "/json/version").await;
    assert_eq!(version["Browser"].as_str().unwrap(), "Chrome/124.0.6367.91");
    assert!(version["webSocketDebuggerUrl"]
        .as_str()
        .unwrap()
        .starts_with("ws://127.0.0.1:"));

    let list = http_get(bridge.config.cdp_port, "/json/list").await;
    let entries = list.as_array().unwrap();
    assert_eq!(entries.len(), 1, "only the browser target is pre-advertised");
    assert_eq!(entries[0]["type"].as_str(), Some("browser"));
}

#[tokio::test]
async fn target_creation_emits_response_then_three_events_in_order() {
    let bridge = start_bridge().await;
    let mut ext_ws = connect_extension(&bridge).await;
    let mut cdp_ws = connect_cdp_browser_level(&bridge).await;

    send_json(
        &mut cdp_ws,
        json!({ "id": 1, "method": "Target.createTarget", "params": { "url": "https://example.com" } }),
    )
    .await;

    // The extension sees the forwarded command with a bridge-assigned id.
    let ext_msg = recv_json_timeout(&mut ext_ws, 3000)
        .await
        .expect("extension should receive createTarget");
    assert_eq!(ext_msg["method"].as_str(), Some("Target.createTarget"));
    let bridge_id = ext_msg["id"].as_u64().unwrap();

    send_json(
        &mut ext_ws,
        json!({ "id": bridge_id, "result": { "targetId": "abc123" } }),
    )
    .await;

    let first = recv_json_timeout(&mut cdp_ws, 3000).await.expect("response");
    assert_eq!(first["id"].as_u64(), Some(1));
    assert_eq!(first["result"]["targetId"].as_str(), Some("abc123"));

    let second = recv_json_timeout(&mut cdp_ws, 3000).await.expect("targetCreated");
    assert_eq!(second["method"].as_str(), Some("Target.targetCreated"));

    let third = recv_json_timeout(&mut cdp_ws, 3000).await.expect("targetInfoChanged");
    assert_eq!(third["method"].as_str(), Some("Target.targetInfoChanged"));

    let fourth = recv_json_timeout(&mut cdp_ws, 3000).await.expect("attachedToTarget");
    assert_eq!(fourth["method"].as_str(), Some("Target.attachedToTarget"));
    assert!(fourth["params"]["sessionId"].is_string());
}

#[tokio::test]
async fn duplicate_extension_attach_event_is_suppressed() {
    let bridge = start_bridge().await;
    let mut ext_ws = connect_extension(&bridge).await;
    let mut cdp_ws = connect_cdp_browser_level(&bridge).await;

    send_json(
        &mut cdp_ws,
        json!({ "id": 1, "method": "Target.createTarget", "params": { "url": "https://example.com" } }),
    )
    .await;
    let ext_msg = recv_json_timeout(&mut ext_ws, 3000).await.unwrap();
    let bridge_id = ext_msg["id"].as_u64().unwrap();
    send_json(&mut ext_ws, json!({ "id": bridge_id, "result": { "targetId": "dup1" } })).await;

    // Drain the four frames the creation sequence produces.
    for _ in 0..4 {
        recv_json_timeout(&mut cdp_ws, 3000).await.expect("creation frame");
    }

    // The extension now emits its own attach notification for the same
    // target, unprompted — this must not reach the CDP client a second time.
    send_json(
        &mut ext_ws,
        json!({
            "method": "Target.attachedToTarget",
            "params": {
                "sessionId": "EXTRA",
                "targetInfo": { "targetId": "dup1" },
            }
        }),
    )
    .await;

    let extra = try_recv_json_timeout(&mut cdp_ws, 500).await;
    assert!(extra.is_none(), "duplicate attach event should have been suppressed, got {extra:?}");
}

#[tokio::test]
async fn command_sent_while_extension_offline_is_queued_and_replayed_on_reconnect() {
    let bridge = start_bridge().await;
    let mut cdp_ws = connect_cdp_browser_level(&bridge).await;

    send_json(
        &mut cdp_ws,
        json!({ "id": 9, "method": "Page.navigate", "params": { "url": "https://example.com" } }),
    )
    .await;

    // No extension attached yet: the command is queued silently. The client
    // gets nothing until either the extension reconnects or the deadline
    // passes — never both an immediate error and a later real response.
    let nothing_yet = try_recv_json_timeout(&mut cdp_ws, 300).await;
    assert!(nothing_yet.is_none(), "queued command must not produce an immediate reply");

    let mut ext_ws = connect_extension(&bridge).await;
    let replayed = recv_json_timeout(&mut ext_ws, 3000)
        .await
        .expect("queued command should be replayed to the newly connected extension");
    assert_eq!(replayed["method"].as_str(), Some("Page.navigate"));
    let bridge_id = replayed["id"].as_u64().unwrap();

    send_json(&mut ext_ws, json!({ "id": bridge_id, "result": { "ok": true } })).await;

    let only = recv_json_timeout(&mut cdp_ws, 3000)
        .await
        .expect("the original client should get exactly one response");
    assert_eq!(only["id"].as_u64(), Some(9));
    assert_eq!(only["result"]["ok"].as_bool(), Some(true));

    let extra = try_recv_json_timeout(&mut cdp_ws, 300).await;
    assert!(extra.is_none(), "client must not receive a second frame for the same request");
}

#[tokio::test]
async fn command_sent_while_extension_offline_times_out_once_if_never_reconnected() {
    let bridge = start_bridge_with(|c| c.queue_deadline_ms = 50).await;
    let mut cdp_ws = connect_cdp_browser_level(&bridge).await;

    send_json(
        &mut cdp_ws,
        json!({ "id": 9, "method": "Page.navigate", "params": { "url": "https://example.com" } }),
    )
    .await;

    let nothing_yet = try_recv_json_timeout(&mut cdp_ws, 100).await;
    assert!(nothing_yet.is_none(), "queued command must not produce an immediate reply");

    tokio::time::sleep(Duration::from_millis(75)).await;
    sweep_once(&bridge).await;

    let timeout_err = recv_json_timeout(&mut cdp_ws, 1000)
        .await
        .expect("exactly one synthesized timeout error");
    assert_eq!(timeout_err["id"].as_u64(), Some(9));
    assert!(timeout_err["error"]["message"].is_string());

    let extra = try_recv_json_timeout(&mut cdp_ws, 300).await;
    assert!(extra.is_none(), "client must not receive a second frame for the same request");
}

#[tokio::test]
async fn tab_subscription_is_isolated_to_subscribers() {
    let bridge = start_bridge().await;
    let mut ext_ws = connect_extension(&bridge).await;
    let mut subscribed = connect_brop(&bridge).await;
    let mut unsubscribed = connect_brop(&bridge).await;

    send_json(
        &mut subscribed,
        json!({ "id": 1, "method": "subscribe_tab_events", "params": { "tabId": 7 } }),
    )
    .await;
    let ack = recv_json_timeout(&mut subscribed, 1000).await.expect("subscribe ack");
    assert_eq!(ack["success"].as_bool(), Some(true));

    send_json(
        &mut ext_ws,
        json!({ "type": "tab_updated", "tabId": 7, "title": "Example" }),
    )
    .await;

    let received = recv_json_timeout(&mut subscribed, 1000)
        .await
        .expect("subscribed client should see the tab event");
    assert_eq!(received["tabId"].as_u64(), Some(7));

    let leaked = try_recv_json_timeout(&mut unsubscribed, 500).await;
    assert!(leaked.is_none(), "an unsubscribed client must not see another tab's events");
}

#[tokio::test]
async fn malformed_cdp_frame_without_id_is_silently_dropped() {
    let bridge = start_bridge().await;
    let mut cdp_ws = connect_cdp_browser_level(&bridge).await;

    // No `id` at all: nothing recoverable to reply with, so the bridge must
    // neither crash nor send anything back.
    send_json(&mut cdp_ws, json!({ "method": "Target.createTarget" })).await;
    let nothing = try_recv_json_timeout(&mut cdp_ws, 500).await;
    assert!(nothing.is_none());

    // An id but no method: recoverable, answered with a -32600 immediately.
    send_json(&mut cdp_ws, json!({ "id": 5 })).await;
    let response = recv_json_timeout(&mut cdp_ws, 1000).await.expect("invalid request response");
    assert_eq!(response["id"].as_u64(), Some(5));
    assert_eq!(response["error"]["code"].as_i64(), Some(-32600));

    // `id: null` with a method present: the id key is there but invalid, so
    // this still gets a single -32600 — it must not be silently dropped like
    // the no-id case above.
    send_json(&mut cdp_ws, json!({ "id": null, "method": "Runtime.enable" })).await;
    let null_id_response = recv_json_timeout(&mut cdp_ws, 1000).await.expect("invalid request response");
    assert!(null_id_response["id"].is_null());
    assert_eq!(null_id_response["error"]["code"].as_i64(), Some(-32600));
}

#[tokio::test]
async fn brop_get_server_status_reports_extension_connection() {
    let bridge = start_bridge().await;
    let mut brop_ws = connect_brop(&bridge).await;

    send_json(&mut brop_ws, json!({ "id": 1, "method": "get_server_status", "params": {} })).await;
    let before = recv_json_timeout(&mut brop_ws, 1000).await.expect("status response");
    assert_eq!(before["result"]["extensionConnected"].as_bool(), Some(false));

    let _ext_ws = connect_extension(&bridge).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    send_json(&mut brop_ws, json!({ "id": 2, "method": "get_server_status", "params": {} })).await;
    let after = recv_json_timeout(&mut brop_ws, 1000).await.expect("status response");
    assert_eq!(after["result"]["extensionConnected"].as_bool(), Some(true));
}
