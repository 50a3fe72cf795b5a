//! Component D — the BROP listener.
//!
//! Accepts BROP clients on their own port, parses both frame shapes
//! (§4.4), answers `get_server_status`/`subscribe_tab_events`/
//! `unsubscribe_tab_events` locally, and forwards everything else through
//! the extension conduit. Structured the same way as
//! [`crate::bridge::extension_conduit`]'s accept loop, which is itself
//! grounded on the teacher's `serve`/`handle_connection` pair in
//! `extension_bridge.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};

use crate::bridge::client::{AnonymousIdCounter, ClientKind};
use crate::bridge::extension_conduit;
use crate::bridge::frame::{BropCommand, BropResponse};
use crate::bridge::hub::{BridgeHub, QueuedCommand};
use crate::bridge::transport::{Frame, FramedTransport};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::logging::{EventLog, LogLevel};

pub async fn serve(hub: Arc<BridgeHub>, config: Arc<BridgeConfig>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| crate::error::BridgeError::BindFailed {
            addr: addr.to_string(),
            source: e,
        })?;
    tracing::info!(%addr, "BROP listener listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let hub = Arc::clone(&hub);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, hub, config, peer.to_string()).await {
                tracing::debug!(error = %e, %peer, "BROP client connection ended");
            }
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    hub: Arc<BridgeHub>,
    config: Arc<BridgeConfig>,
    peer_label: String,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let mut transport = FramedTransport::new(ws);
    let (client_id, mut rx) = hub.register_client(peer_label.clone(), ClientKind::Brop, None).await;
    let log = &hub.log;

    let mut anon_ids = AnonymousIdCounter::default();

    log.record(LogLevel::Info, "brop", "connect", &client_id.to_string(), &peer_label);

    let mut ping_tick = tokio::time::interval(config.keepalive_interval());
    ping_tick.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
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
                match frame {
                    Frame::Json(v) => {
                        handle_frame(&hub, log, &config, client_id, v, &mut anon_ids).await;
                    }
                    Frame::ParseError(text) => {
                        log.record(LogLevel::Warn, "parse-error", "brop", &client_id.to_string(), &text);
                    }
                    Frame::Closed => break,
                }
            }
        }
    }

    hub.remove_client(client_id).await;
    log.record(LogLevel::Info, "brop", "disconnect", &client_id.to_string(), "");
    transport.close().await;
    Ok(())
}

async fn handle_frame(
    hub: &BridgeHub,
    log: &EventLog,
    config: &BridgeConfig,
    client_id: crate::bridge::client::ClientId,
    raw: Value,
    anon_ids: &mut AnonymousIdCounter,
) {
    let Some(cmd) = BropCommand::parse(&raw, || anon_ids.next()) else {
        send_brop(hub, client_id, BropResponse::err(raw.get("id").cloned().unwrap_or(Value::Null), "malformed command")).await;
        return;
    };

    match cmd.method.as_str() {
        "get_server_status" => {
            let status = json!({
                "extensionConnected": hub.is_extension_connected().await,
                "bropClients": hub.all_brop_clients().await.len(),
            });
            send_brop(hub, client_id, BropResponse::ok(cmd.id, status)).await;
        }
        "subscribe_tab_events" => {
            match cmd.params.get("tabId").and_then(Value::as_u64) {
                Some(tab_id) => {
                    hub.subscribe_tab(tab_id, client_id).await;
                    send_brop(hub, client_id, BropResponse::ok(cmd.id, json!({}))).await;
                }
                None => {
                    send_brop(hub, client_id, BropResponse::err(cmd.id, "tabId is required")).await;
                }
            }
        }
        "unsubscribe_tab_events" => {
            match cmd.params.get("tabId").and_then(Value::as_u64) {
                Some(tab_id) => {
                    hub.unsubscribe_tab(tab_id, client_id).await;
                    send_brop(hub, client_id, BropResponse::ok(cmd.id, json!({}))).await;
                }
                None => {
                    send_brop(hub, client_id, BropResponse::err(cmd.id, "tabId is required")).await;
                }
            }
        }
        other => forward_to_extension(hub, log, config, client_id, other.to_string(), cmd.id, cmd.params).await,
    }
}

async fn forward_to_extension(
    hub: &BridgeHub,
    log: &EventLog,
    config: &BridgeConfig,
    client_id: crate::bridge::client::ClientId,
    method: String,
    client_facing_id: Value,
    params: Value,
) {
    let result = extension_conduit::submit(
        hub,
        client_id,
        ClientKind::Brop,
        method.clone(),
        params.clone(),
        None,
        client_facing_id.clone(),
        config.brop_timeout(),
        false,
        false,
    )
    .await;

    if let Err(crate::error::BridgeError::ExtensionOffline) = result {
        // Queue-and-wait (§4.4 point 4, §4.8): enqueue silently rather than
        // also answering now. The client gets exactly one reply — the real
        // result if the extension reconnects before `request_id`'s deadline,
        // otherwise the single synthesized timeout error from
        // `sweep_expired_queue`/`fail_pending`. Replying here too would
        // double-deliver a response to the same request id.
        let raw = json!({ "id": client_facing_id, "method": method, "params": params });
        hub.enqueue_command(QueuedCommand {
            client_id,
            raw,
            method,
            request_id: client_facing_id.clone(),
            enqueued_at: std::time::Instant::now(),
            deadline: std::time::Instant::now() + config.queue_deadline(),
        })
        .await;
        log.record(LogLevel::Warn, "extension-offline", "brop_command", &client_id.to_string(), "queued");
    }
}

async fn send_brop(hub: &BridgeHub, client_id: crate::bridge::client::ClientId, response: BropResponse) {
    if let Ok(text) = serde_json::to_string(&response) {
        hub.send_to(client_id, text).await;
    }
}
