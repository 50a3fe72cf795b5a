//! Component B — the extension conduit.
//!
//! Exactly one extension connects here at a time (§3, §5). This module
//! accepts that connection, keeps it alive with a ping loop, submits
//! commands from BROP/CDP listeners, and demultiplexes whatever comes
//! back into either a response delivered to the originating client or an
//! event routed through [`crate::bridge::events`].
//!
//! Grounded on the teacher's `handle_extension_client` in
//! `extension_bridge.rs`: same accept-one-peer shape, same
//! id-correlated-response pattern, generalized from "one pending CLI
//! request at a time" to the hub's full pending-request table so any
//! number of BROP/CDP clients can have requests in flight concurrently —
//! the same generalization the reference proxycast `ChromeBridgeHub` and
//! pw-rs `RelayState` both make over a single-client bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::bridge::client::{ClientId, ClientKind, OutboundMessage};
use crate::bridge::frame::{BropResponse, CdpOutbound, MessageId, RequestId};
use crate::bridge::hub::{deadline_in, BridgeHub, PendingRequest, QueuedCommand};
use crate::bridge::session_manager;
use crate::bridge::transport::{Frame, FramedTransport};
use crate::bridge::events;
use crate::error::{BridgeError, Result};
use crate::logging::{EventLog, LogLevel};

const EXTENSION_CHANNEL_CAPACITY: usize = 1024;

/// A connection that has sent nothing at all — not even a pong — for this
/// many keepalive intervals is treated as dead (§4.1 keepalive: "absence of
/// any message for >N s as a failure"), even if the TCP socket itself
/// hasn't noticed yet.
const STALE_INTERVALS: u32 = 3;

/// Bind the extension port and accept connections forever, one at a time.
/// A second extension trying to connect while one is already attached is
/// rejected immediately (§1 Non-goals: no multiple simultaneous
/// extensions).
pub async fn serve(hub: Arc<BridgeHub>, config: Arc<crate::config::BridgeConfig>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::BindFailed {
            addr: addr.to_string(),
            source: e,
        })?;
    tracing::info!(%addr, "extension conduit listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        if hub.is_extension_connected().await {
            tracing::warn!(%peer, "rejecting extension connection, one is already attached");
            continue;
        }
        let hub = Arc::clone(&hub);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(e) = handle_extension(stream, hub, config).await {
                tracing::warn!(error = %e, "extension connection ended");
            }
        });
    }
}

async fn handle_extension(stream: TcpStream, hub: Arc<BridgeHub>, config: Arc<crate::config::BridgeConfig>) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let mut transport = FramedTransport::new(ws);
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(EXTENSION_CHANNEL_CAPACITY);
    let log = &hub.log;

    hub.set_extension(tx).await;
    log.record(LogLevel::Info, "extension", "connect", "extension", "connected");
    drain_queue(&hub, log).await;

    let keepalive_interval = config.keepalive_interval();
    let stale_after = keepalive_interval * STALE_INTERVALS;
    let mut ping_tick = tokio::time::interval(keepalive_interval);
    ping_tick.tick().await; // first tick fires immediately; consume it
    let mut last_seen = std::time::Instant::now();

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if last_seen.elapsed() > stale_after {
                    log.record(LogLevel::Warn, "extension", "stale", "extension", "no message received within keepalive window");
                    break;
                }
                if transport.send_ping().await.is_err() {
                    break;
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if transport.send_raw(text).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = transport.receive() => {
                last_seen = std::time::Instant::now();
                match frame {
                    Frame::Json(v) => {
                        hub.touch_pong().await;
                        handle_inbound(&hub, log, &config, v).await;
                    }
                    Frame::ParseError(text) => {
                        log.record(LogLevel::Warn, "parse-error", "extension", "extension", &text);
                    }
                    Frame::Closed => break,
                }
            }
        }
    }

    transport.close().await;
    let stranded = hub.clear_extension().await;
    log.record(
        LogLevel::Warn,
        "extension",
        "disconnect",
        "extension",
        &format!("{} request(s) failed fast", stranded.len()),
    );
    for pending in stranded {
        fail_pending(&hub, log, pending, BridgeError::TransportLost.cdp_code(), "extension connection lost").await;
    }
    Ok(())
}

/// Forward one command toward the extension on behalf of `origin`,
/// registering it in the pending-request table first so the response can
/// find its way back (§4.3). Returns `Err(ExtensionOffline)` when there is
/// no attached extension — callers (the BROP/CDP listeners) decide
/// whether to queue it (§4.8) or fail it immediately.
#[allow(clippy::too_many_arguments)]
pub async fn submit(
    hub: &BridgeHub,
    origin: ClientId,
    origin_kind: ClientKind,
    method: String,
    params: Value,
    session_id: Option<String>,
    client_facing_id: Value,
    timeout: Duration,
    keep_across_reconnect: bool,
    is_create_target: bool,
) -> Result<()> {
    let Some(sender) = hub.extension_sender().await else {
        return Err(BridgeError::ExtensionOffline);
    };

    let request_id = hub.next_request_id().await;
    hub.register_pending(PendingRequest {
        request_id,
        origin,
        method: method.clone(),
        session_id: session_id.clone(),
        original_params: params.clone(),
        client_facing_id,
        deadline: deadline_in(timeout),
        keep_across_reconnect,
        is_create_target,
    })
    .await;

    // BROP commands are tagged so the extension can tell the two protocols'
    // forwarded shapes apart (§4.4); CDP commands are sent as a plain
    // id/method/params/sessionId frame, matching the teacher's own
    // extension-facing wire shape in `extension_bridge.rs`.
    let wire = match origin_kind {
        ClientKind::Brop => json!({
            "type": "brop_command",
            "id": request_id.0,
            "method": method,
            "params": params,
        }),
        ClientKind::Cdp => json!({
            "id": request_id.0,
            "method": method,
            "params": params,
            "sessionId": session_id,
        }),
    };
    let text = serde_json::to_string(&wire)?;

    if sender.send(text).await.is_err() {
        hub.take_pending(request_id).await;
        return Err(BridgeError::TransportLost);
    }
    Ok(())
}

async fn handle_inbound(hub: &BridgeHub, log: &EventLog, config: &crate::config::BridgeConfig, raw: Value) {
    if let Some(id_num) = raw.get("id").and_then(Value::as_u64) {
        let request_id = RequestId(id_num);
        match hub.take_pending(request_id).await {
            Some(pending) => deliver_response(hub, log, pending, raw).await,
            None => log.record(
                LogLevel::Warn,
                "extension",
                "response",
                "extension",
                &format!("no pending request for id {id_num}"),
            ),
        }
        return;
    }

    match events::parse_extension_event(&raw) {
        Some(event) => events::route(hub, log, config, event).await,
        None => log.record(
            LogLevel::Warn,
            "parse-error",
            "extension",
            "extension",
            "unrecognized extension frame shape",
        ),
    }
}

async fn deliver_response(hub: &BridgeHub, log: &EventLog, pending: PendingRequest, raw: Value) {
    let error = raw.get("error").cloned();
    let result = raw.get("result").cloned().unwrap_or(Value::Null);

    if pending.is_create_target && error.is_none() {
        let url = pending
            .original_params
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("about:blank")
            .to_string();
        let original_id =
            MessageId::from_value(&pending.client_facing_id).unwrap_or(MessageId::Num(0));
        let frames = session_manager::handle_create_target_response(
            hub,
            log,
            pending.origin,
            original_id,
            &url,
            &result,
        )
        .await;
        let texts: Vec<String> = frames
            .iter()
            .filter_map(|f| serde_json::to_string(f).ok())
            .collect();
        hub.send_many_to(pending.origin, texts).await;
        return;
    }

    let kind = hub.client_kind(pending.origin).await;
    let text = match kind {
        Some(ClientKind::Cdp) => {
            let id = MessageId::from_value(&pending.client_facing_id).unwrap_or(MessageId::Num(0));
            let frame = match &error {
                Some(e) => CdpOutbound::response_err(
                    id,
                    pending.session_id.clone(),
                    e.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                    e.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("extension error")
                        .to_string(),
                ),
                None => CdpOutbound::response_ok(id, pending.session_id.clone(), result),
            };
            serde_json::to_string(&frame).ok()
        }
        _ => {
            let frame = match &error {
                Some(e) => BropResponse::err(
                    pending.client_facing_id.clone(),
                    e.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("extension error")
                        .to_string(),
                ),
                None => BropResponse::ok(pending.client_facing_id.clone(), result),
            };
            serde_json::to_string(&frame).ok()
        }
    };

    if let Some(text) = text {
        hub.send_to(pending.origin, text).await;
    }
    log.record(
        LogLevel::Info,
        "cdp_command",
        &pending.method,
        &pending.origin.to_string(),
        if error.is_some() { "extension error" } else { "ok" },
    );
}

/// Fail one stranded pending request with a synthetic error, shaped for
/// whichever protocol its origin client speaks (§7, §4.8).
pub async fn fail_pending(hub: &BridgeHub, log: &EventLog, pending: PendingRequest, code: i64, message: &str) {
    let kind = hub.client_kind(pending.origin).await;
    let text = match kind {
        Some(ClientKind::Cdp) => {
            let id = MessageId::from_value(&pending.client_facing_id).unwrap_or(MessageId::Num(0));
            serde_json::to_string(&CdpOutbound::response_err(
                id,
                pending.session_id.clone(),
                code,
                message.to_string(),
            ))
            .ok()
        }
        _ => serde_json::to_string(&BropResponse::err(pending.client_facing_id.clone(), message)).ok(),
    };
    if let Some(text) = text {
        hub.send_to(pending.origin, text).await;
    }
    log.record(LogLevel::Warn, "command-timeout", &pending.method, &pending.origin.to_string(), message);
}

/// Drain whatever accumulated in the offline command queue (§4.8), in FIFO
/// order, straight into the newly (re)connected extension. Entries past
/// their own deadline are failed instead of forwarded.
async fn drain_queue(hub: &BridgeHub, log: &EventLog) {
    let queued = hub.drain_queue().await;
    if queued.is_empty() {
        return;
    }
    log.record(
        LogLevel::Info,
        "extension",
        "drain",
        "extension",
        &format!("replaying {} queued command(s)", queued.len()),
    );
    for cmd in queued {
        replay_queued(hub, log, cmd).await;
    }
}

async fn replay_queued(hub: &BridgeHub, log: &EventLog, cmd: QueuedCommand) {
    if cmd.deadline <= std::time::Instant::now() {
        let pending = PendingRequest {
            request_id: RequestId(0),
            origin: cmd.client_id,
            method: cmd.method,
            session_id: None,
            original_params: Value::Null,
            client_facing_id: cmd.request_id,
            deadline: cmd.deadline,
            keep_across_reconnect: false,
            is_create_target: false,
        };
        fail_pending(hub, log, pending, -32000, "Chrome extension not connected").await;
        return;
    }

    let params = cmd.raw.get("params").cloned().unwrap_or(Value::Null);
    let session_id = cmd
        .raw
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let remaining = cmd.deadline.saturating_duration_since(std::time::Instant::now());

    let origin_kind = hub.client_kind(cmd.client_id).await.unwrap_or(ClientKind::Brop);
    if submit(
        hub,
        cmd.client_id,
        origin_kind,
        cmd.method.clone(),
        params,
        session_id,
        cmd.request_id.clone(),
        remaining,
        false,
        cmd.method == "Target.createTarget",
    )
    .await
    .is_err()
    {
        log.record(
            LogLevel::Error,
            "extension",
            "drain",
            &cmd.client_id.to_string(),
            "failed to replay queued command after reconnect",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::client::ClientKind;

    #[tokio::test]
    async fn submit_without_extension_reports_offline() {
        let hub = BridgeHub::new(EventLog::new(10));
        let (client_id, _rx) = hub.register_client("c1".into(), ClientKind::Cdp, None).await;
        let result = submit(
            &hub,
            client_id,
            ClientKind::Cdp,
            "Page.navigate".into(),
            json!({}),
            None,
            Value::from(1),
            Duration::from_secs(1),
            false,
            false,
        )
        .await;
        assert!(matches!(result, Err(BridgeError::ExtensionOffline)));
    }
}
