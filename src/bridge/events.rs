//! Component G — event fan-out.
//!
//! Classifies an event arriving from the extension and decides which
//! connected client(s) should see it. BROP events route by tab
//! subscription; CDP events route by the §4.6 rules (`Target.*` goes to
//! every browser-level client, everything else goes to the session that
//! owns it). Dedup against the bridge's own synthetic events is delegated
//! to [`crate::bridge::session_manager::should_suppress_extension_event`].

use serde_json::Value;

use crate::bridge::hub::BridgeHub;
use crate::bridge::session_manager;
use crate::config::BridgeConfig;
use crate::logging::{EventLog, LogLevel};

/// An event as received from the extension, before routing.
#[derive(Debug, Clone)]
pub enum ExtensionEvent {
    /// A BROP-shaped notification: `{type, tabId?, ...}`.
    Brop {
        kind: String,
        tab_id: Option<u64>,
        payload: Value,
    },
    /// A CDP event: `{method, params, sessionId?}`.
    Cdp {
        method: String,
        params: Value,
        session_id: Option<String>,
    },
}

/// Classify a raw JSON value pushed by the extension outside of any
/// request/response correlation. CDP events carry `method`; BROP
/// notifications carry `type` instead (matching the command shape in
/// §4.4). Returns `None` for anything recognizable as neither.
pub fn parse_extension_event(raw: &Value) -> Option<ExtensionEvent> {
    if let Some(method) = raw.get("method").and_then(Value::as_str) {
        return Some(ExtensionEvent::Cdp {
            method: method.to_string(),
            params: raw.get("params").cloned().unwrap_or(Value::Null),
            session_id: raw
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }
    let kind = raw.get("type").and_then(Value::as_str)?.to_string();
    let tab_id = raw.get("tabId").and_then(Value::as_u64);
    Some(ExtensionEvent::Brop {
        kind,
        tab_id,
        payload: raw.clone(),
    })
}

/// Route one classified event to its destination client(s), sending each
/// a fully-formed outbound frame. Never fails: a client that can't accept
/// the frame is left for its own read loop to notice and clean up.
pub async fn route(hub: &BridgeHub, log: &EventLog, config: &BridgeConfig, event: ExtensionEvent) {
    match event {
        ExtensionEvent::Brop {
            kind,
            tab_id,
            payload,
        } => route_brop(hub, log, &kind, tab_id, payload).await,
        ExtensionEvent::Cdp {
            method,
            params,
            session_id,
        } => route_cdp(hub, log, config, &method, params, session_id).await,
    }
}

async fn route_brop(hub: &BridgeHub, log: &EventLog, kind: &str, tab_id: Option<u64>, payload: Value) {
    let targets = match tab_id {
        Some(tab_id) => hub.tab_subscribers(tab_id).await,
        None => hub.all_brop_clients().await.into_iter().collect(),
    };

    let text = match serde_json::to_string(&payload) {
        Ok(t) => t,
        Err(_) => return,
    };
    for client in &targets {
        hub.send_to(*client, text.clone()).await;
    }

    if matches!(kind, "tab_closed" | "tab_removed") {
        if let Some(tab_id) = tab_id {
            hub.drop_tab_subscriptions(tab_id).await;
        }
    }

    log.record(
        LogLevel::Debug,
        "brop_event",
        kind,
        "extension",
        &format!("fanned out to {} client(s)", targets.len()),
    );
}

async fn route_cdp(
    hub: &BridgeHub,
    log: &EventLog,
    config: &BridgeConfig,
    method: &str,
    params: Value,
    session_id: Option<String>,
) {
    if session_manager::should_suppress_extension_event(hub, config, method, &params).await {
        log.record(
            LogLevel::Debug,
            "async-skipped",
            method,
            "extension",
            "duplicate of a bridge-synthesized event, dropped",
        );
        return;
    }

    let frame = crate::bridge::frame::CdpOutbound::event(method, params, session_id.clone());
    let text = match serde_json::to_string(&frame) {
        Ok(t) => t,
        Err(_) => return,
    };

    if method.starts_with("Target.") {
        let targets = hub.browser_level_clients().await;
        for client in &targets {
            hub.send_to(*client, text.clone()).await;
        }
        log.record(
            LogLevel::Debug,
            "cdp_event",
            method,
            "extension",
            &format!("broadcast to {} browser-level client(s)", targets.len()),
        );
        return;
    }

    let owner = match &session_id {
        Some(sid) => hub.session_owner(sid).await,
        None => None,
    };

    match owner {
        Some(client) => {
            hub.send_to(client, text).await;
            log.record(LogLevel::Debug, "cdp_event", method, &client.to_string(), "");
        }
        None => {
            let targets = hub.browser_level_clients().await;
            for client in &targets {
                hub.send_to(*client, text.clone()).await;
            }
            log.record(
                LogLevel::Debug,
                "cdp_event",
                method,
                "extension",
                "no session owner, fell back to browser-level client(s)",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::client::ClientKind;
    use serde_json::json;

    #[test]
    fn parses_cdp_shape() {
        let raw = json!({"method": "Target.targetCreated", "params": {}});
        match parse_extension_event(&raw) {
            Some(ExtensionEvent::Cdp { method, .. }) => assert_eq!(method, "Target.targetCreated"),
            other => panic!("expected Cdp, got {other:?}"),
        }
    }

    #[test]
    fn parses_brop_shape() {
        let raw = json!({"type": "tab_closed", "tabId": 7});
        match parse_extension_event(&raw) {
            Some(ExtensionEvent::Brop { kind, tab_id, .. }) => {
                assert_eq!(kind, "tab_closed");
                assert_eq!(tab_id, Some(7));
            }
            other => panic!("expected Brop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tab_closed_drops_subscriptions() {
        let hub = BridgeHub::new(EventLog::new(10));
        let (client_id, _rx) = hub.register_client("c1".into(), ClientKind::Brop, None).await;
        hub.subscribe_tab(7, client_id).await;
        assert!(!hub.tab_subscribers(7).await.is_empty());

        let log = EventLog::new(10);
        route_brop(&hub, &log, "tab_closed", Some(7), json!({"type": "tab_closed", "tabId": 7})).await;

        assert!(hub.tab_subscribers(7).await.is_empty());
    }

    #[tokio::test]
    async fn target_events_broadcast_to_browser_level_clients() {
        let hub = BridgeHub::new(EventLog::new(10));
        let (_id, mut rx) = hub
            .register_client(
                "c1".into(),
                ClientKind::Cdp,
                Some(crate::bridge::client::CdpRole::BrowserLevel),
            )
            .await;
        let log = EventLog::new(10);

        let config = BridgeConfig::default();
        route_cdp(&hub, &log, &config, "Target.targetInfoChanged", json!({}), None).await;

        let msg = rx.try_recv().expect("should have received the event");
        assert!(msg.contains("Target.targetInfoChanged"));
    }
}
