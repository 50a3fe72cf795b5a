//! The bridge's single shared, mutex-guarded state.
//!
//! §5 calls for "a single sequential mutator" for the
//! pending-request/target/session tables. None of the grounding examples —
//! the teacher's `BridgeState` (`extension_bridge.rs`), the reference
//! proxycast `ChromeBridgeHub`, or the reference pw-rs `RelayState` —
//! implement that as a literal actor task; all three hold one
//! `tokio::sync::Mutex`-guarded struct and touch it only through short,
//! non-blocking critical sections. `BridgeHub` follows that same shape:
//! every mutation takes the lock, does plain synchronous work, and releases
//! it before any `.await` that could suspend, so the single-writer
//! discipline holds without ever blocking a second caller mid-mutation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::bridge::client::{ClientHandle, ClientId, ClientKind, OutboundMessage, CLIENT_CHANNEL_CAPACITY};
use crate::bridge::frame::RequestId;
use crate::logging::EventLog;

/// The single active upstream extension connection (§3).
pub struct ExtensionSession {
    pub sender: mpsc::Sender<OutboundMessage>,
    pub connected_at: Instant,
    pub last_pong: Instant,
}

/// §3 "Pending request".
pub struct PendingRequest {
    pub request_id: RequestId,
    pub origin: ClientId,
    pub method: String,
    pub session_id: Option<String>,
    pub original_params: Value,
    /// The id the originating client used on its own wire (a `MessageId` for
    /// CDP, an arbitrary `Value` for BROP) — echoed back unchanged once the
    /// extension's response arrives, since the extension only ever sees the
    /// bridge-assigned `RequestId`.
    pub client_facing_id: Value,
    pub deadline: Instant,
    /// If true, a transport-lost event does not fail this request — it is
    /// left pending through the grace period (§4.2 state machine).
    pub keep_across_reconnect: bool,
    /// Marks a tracked `Target.createTarget` so response dispatch knows to
    /// run the post-creation hook (§4.3, §4.6).
    pub is_create_target: bool,
}

/// §3 "Target".
#[derive(Debug, Clone)]
pub struct Target {
    pub target_id: String,
    pub browser_context_id: String,
    pub owner: ClientId,
    pub sessions: HashSet<String>,
    pub url: String,
}

/// §3 "Session".
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub target_id: String,
    pub owner: ClientId,
    pub created_at: Instant,
}

/// §3 "Queued command" — buffered while the extension is offline (§4.8).
pub struct QueuedCommand {
    pub client_id: ClientId,
    pub raw: Value,
    pub method: String,
    pub request_id: Value,
    pub enqueued_at: Instant,
    pub deadline: Instant,
}

#[derive(Default)]
pub struct HubState {
    pub extension: Option<ExtensionSession>,
    pub clients: HashMap<ClientId, ClientHandle>,
    pub pending: HashMap<RequestId, PendingRequest>,
    pub targets: HashMap<String, Target>,
    pub sessions: HashMap<String, Session>,
    pub tab_subscribers: HashMap<u64, HashSet<ClientId>>,
    pub queue: VecDeque<QueuedCommand>,
    next_client_id: u64,
    next_request_id: u64,
}

pub struct BridgeHub {
    pub state: Mutex<HubState>,
    pub log: EventLog,
}

impl BridgeHub {
    pub fn new(log: EventLog) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            log,
        }
    }

    // --- client lifecycle -------------------------------------------------

    pub async fn register_client(
        &self,
        label: String,
        kind: ClientKind,
        cdp_role: Option<crate::bridge::client::CdpRole>,
    ) -> (ClientId, mpsc::Receiver<OutboundMessage>) {
        let mut s = self.state.lock().await;
        s.next_client_id += 1;
        let id = ClientId(s.next_client_id);
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        s.clients
            .insert(id, ClientHandle::new(id, label, kind, tx, cdp_role));
        (id, rx)
    }

    /// Remove a client and everything it owned: pending requests, sessions
    /// (and their targets' session sets), and subscription membership.
    /// Targets themselves persist per process (default policy, §5).
    pub async fn remove_client(&self, id: ClientId) -> Vec<PendingRequest> {
        let mut s = self.state.lock().await;
        s.clients.remove(&id);

        let dead_sessions: Vec<String> = s
            .sessions
            .iter()
            .filter(|(_, sess)| sess.owner == id)
            .map(|(sid, _)| sid.clone())
            .collect();
        for sid in &dead_sessions {
            if let Some(sess) = s.sessions.remove(sid) {
                if let Some(target) = s.targets.get_mut(&sess.target_id) {
                    target.sessions.remove(sid);
                }
            }
        }

        for subs in s.tab_subscribers.values_mut() {
            subs.remove(&id);
        }

        let dead_request_ids: Vec<RequestId> = s
            .pending
            .iter()
            .filter(|(_, p)| p.origin == id)
            .map(|(rid, _)| *rid)
            .collect();
        let mut cancelled = Vec::new();
        for rid in dead_request_ids {
            if let Some(p) = s.pending.remove(&rid) {
                cancelled.push(p);
            }
        }
        cancelled
    }

    pub async fn send_to(&self, id: ClientId, text: OutboundMessage) -> bool {
        let mut should_close = false;
        {
            let s = self.state.lock().await;
            if let Some(client) = s.clients.get(&id) {
                if !client.try_send(text) {
                    should_close = true;
                }
            }
        }
        !should_close
    }

    /// Send several frames to one client atomically with respect to every
    /// other dispatch path that goes through the hub — the lock is taken
    /// once and held across all sends. Used for the `Target.createTarget`
    /// critical path (§4.6, §5) where response-then-three-events ordering
    /// is non-negotiable.
    pub async fn send_many_to(&self, id: ClientId, texts: Vec<OutboundMessage>) -> bool {
        let s = self.state.lock().await;
        let Some(client) = s.clients.get(&id) else {
            return false;
        };
        let mut ok = true;
        for text in texts {
            if !client.try_send(text) {
                ok = false;
            }
        }
        ok
    }

    pub async fn browser_level_clients(&self) -> Vec<ClientId> {
        let s = self.state.lock().await;
        s.clients
            .iter()
            .filter(|(_, c)| {
                matches!(
                    c.cdp_role,
                    Some(crate::bridge::client::CdpRole::BrowserLevel)
                )
            })
            .map(|(id, _)| *id)
            .collect()
    }

    // --- extension lifecycle ----------------------------------------------

    pub async fn set_extension(&self, sender: mpsc::Sender<OutboundMessage>) {
        let mut s = self.state.lock().await;
        s.extension = Some(ExtensionSession {
            sender,
            connected_at: Instant::now(),
            last_pong: Instant::now(),
        });
    }

    pub async fn is_extension_connected(&self) -> bool {
        self.state.lock().await.extension.is_some()
    }

    pub async fn extension_sender(&self) -> Option<mpsc::Sender<OutboundMessage>> {
        self.state
            .lock()
            .await
            .extension
            .as_ref()
            .map(|e| e.sender.clone())
    }

    pub async fn touch_pong(&self) {
        if let Some(ext) = self.state.lock().await.extension.as_mut() {
            ext.last_pong = Instant::now();
        }
    }

    /// Extension disconnected: fail every pending request that does not
    /// tolerate reconnects, clear the extension slot, and return the
    /// remainder (left for queuing, §4.2/§4.8).
    pub async fn clear_extension(&self) -> Vec<PendingRequest> {
        let mut s = self.state.lock().await;
        s.extension = None;
        let failing_ids: Vec<RequestId> = s
            .pending
            .iter()
            .filter(|(_, p)| !p.keep_across_reconnect)
            .map(|(rid, _)| *rid)
            .collect();
        let mut failed = Vec::new();
        for rid in failing_ids {
            if let Some(p) = s.pending.remove(&rid) {
                failed.push(p);
            }
        }
        failed
    }

    // --- request registry (component C) ------------------------------------

    pub async fn next_request_id(&self) -> RequestId {
        let mut s = self.state.lock().await;
        s.next_request_id += 1;
        RequestId(s.next_request_id)
    }

    pub async fn register_pending(&self, pending: PendingRequest) {
        let mut s = self.state.lock().await;
        s.pending.insert(pending.request_id, pending);
    }

    pub async fn take_pending(&self, request_id: RequestId) -> Option<PendingRequest> {
        self.state.lock().await.pending.remove(&request_id)
    }

    /// Sweep requests whose deadline has passed. Called once per timer
    /// tick from a dedicated task (§5 "timer fires").
    pub async fn sweep_expired_pending(&self) -> Vec<PendingRequest> {
        let mut s = self.state.lock().await;
        let now = Instant::now();
        let expired_ids: Vec<RequestId> = s
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(rid, _)| *rid)
            .collect();
        let mut expired = Vec::new();
        for rid in expired_ids {
            if let Some(p) = s.pending.remove(&rid) {
                expired.push(p);
            }
        }
        expired
    }

    // --- targets & sessions (component F) -----------------------------------

    pub fn generate_session_id() -> String {
        const HEX: &[u8] = b"0123456789ABCDEF";
        let mut rng = rand::thread_rng();
        (0..32)
            .map(|_| HEX[rng.gen_range(0..16)] as char)
            .collect()
    }

    pub async fn create_target(
        &self,
        target_id: String,
        browser_context_id: String,
        owner: ClientId,
        url: String,
    ) {
        let mut s = self.state.lock().await;
        s.targets.insert(
            target_id.clone(),
            Target {
                target_id,
                browser_context_id,
                owner,
                sessions: HashSet::new(),
                url,
            },
        );
    }

    pub async fn register_session(&self, session_id: String, target_id: String, owner: ClientId) {
        let mut s = self.state.lock().await;
        if let Some(target) = s.targets.get_mut(&target_id) {
            target.sessions.insert(session_id.clone());
        }
        s.sessions.insert(
            session_id.clone(),
            Session {
                session_id,
                target_id,
                owner,
                created_at: Instant::now(),
            },
        );
    }

    pub async fn session_owner(&self, session_id: &str) -> Option<ClientId> {
        self.state
            .lock()
            .await
            .sessions
            .get(session_id)
            .map(|s| s.owner)
    }

    pub async fn target_by_id(&self, target_id: &str) -> Option<Target> {
        self.state.lock().await.targets.get(target_id).cloned()
    }

    pub async fn has_emitted_target(&self, target_id: &str) -> bool {
        self.state.lock().await.targets.contains_key(target_id)
    }

    pub async fn session_for_target_owned_by(
        &self,
        target_id: &str,
    ) -> Option<(String, ClientId)> {
        let s = self.state.lock().await;
        s.sessions
            .values()
            .find(|sess| sess.target_id == target_id)
            .map(|sess| (sess.session_id.clone(), sess.owner))
    }

    pub async fn any_target(&self) -> Option<Target> {
        self.state.lock().await.targets.values().next().cloned()
    }

    /// All known targets, used only by the legacy per-page discovery form
    /// (§4.5, §9 Open Question — off by default).
    pub async fn all_targets(&self) -> Vec<Target> {
        self.state.lock().await.targets.values().cloned().collect()
    }

    pub async fn remove_target(&self, target_id: &str) {
        let mut s = self.state.lock().await;
        if let Some(target) = s.targets.remove(target_id) {
            for sid in target.sessions {
                s.sessions.remove(&sid);
            }
        }
    }

    // --- tab subscriptions (component G) ------------------------------------

    pub async fn subscribe_tab(&self, tab_id: u64, client: ClientId) {
        let mut s = self.state.lock().await;
        s.tab_subscribers.entry(tab_id).or_default().insert(client);
    }

    pub async fn unsubscribe_tab(&self, tab_id: u64, client: ClientId) {
        let mut s = self.state.lock().await;
        if let Some(subs) = s.tab_subscribers.get_mut(&tab_id) {
            subs.remove(&client);
        }
    }

    pub async fn tab_subscribers(&self, tab_id: u64) -> HashSet<ClientId> {
        self.state
            .lock()
            .await
            .tab_subscribers
            .get(&tab_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn drop_tab_subscriptions(&self, tab_id: u64) {
        self.state.lock().await.tab_subscribers.remove(&tab_id);
    }

    pub async fn all_brop_clients(&self) -> Vec<ClientId> {
        let s = self.state.lock().await;
        s.clients
            .iter()
            .filter(|(_, c)| c.kind == ClientKind::Brop)
            .map(|(id, _)| *id)
            .collect()
    }

    // --- command queue (component I) ----------------------------------------

    pub async fn enqueue_command(&self, cmd: QueuedCommand) {
        self.state.lock().await.queue.push_back(cmd);
    }

    pub async fn drain_queue(&self) -> Vec<QueuedCommand> {
        let mut s = self.state.lock().await;
        s.queue.drain(..).collect()
    }

    pub async fn sweep_expired_queue(&self) -> Vec<QueuedCommand> {
        let mut s = self.state.lock().await;
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut remaining = VecDeque::new();
        for cmd in s.queue.drain(..) {
            if cmd.deadline <= now {
                expired.push(cmd);
            } else {
                remaining.push_back(cmd);
            }
        }
        s.queue = remaining;
        expired
    }

    /// Remember a CDP client's `Target.setDiscoverTargets` flag (§4.6).
    pub async fn set_discover_targets(&self, id: ClientId, enabled: bool) {
        let mut s = self.state.lock().await;
        if let Some(client) = s.clients.get_mut(&id) {
            client.discover_targets = enabled;
        }
    }

    /// Remember a CDP client's `Target.setAutoAttach` flag (§4.6).
    pub async fn set_auto_attach(&self, id: ClientId, enabled: bool) {
        let mut s = self.state.lock().await;
        if let Some(client) = s.clients.get_mut(&id) {
            client.auto_attach = enabled;
        }
    }

    pub async fn client_kind(&self, id: ClientId) -> Option<ClientKind> {
        self.state.lock().await.clients.get(&id).map(|c| c.kind)
    }

    pub async fn client_label(&self, id: ClientId) -> String {
        self.state
            .lock()
            .await
            .clients
            .get(&id)
            .map(|c| c.label.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

/// Default deadline-sorted wait before a pending entry is swept (used to
/// build `PendingRequest::deadline` from a configured timeout).
pub fn deadline_in(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_32_uppercase_hex_chars() {
        let id = BridgeHub::generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn removing_a_client_cancels_its_pending_and_sessions() {
        let hub = BridgeHub::new(EventLog::new(10));
        let (client_id, _rx) = hub.register_client("c1".into(), ClientKind::Cdp, None).await;

        hub.create_target("T1".into(), "default".into(), client_id, "about:blank".into())
            .await;
        hub.register_session("S1".repeat(8)[..32].to_string(), "T1".into(), client_id)
            .await;

        hub.register_pending(PendingRequest {
            request_id: RequestId(1),
            origin: client_id,
            method: "Target.createTarget".into(),
            session_id: None,
            original_params: Value::Null,
            client_facing_id: Value::from(1),
            deadline: Instant::now() + Duration::from_secs(30),
            keep_across_reconnect: false,
            is_create_target: true,
        })
        .await;

        let cancelled = hub.remove_client(client_id).await;
        assert_eq!(cancelled.len(), 1);
        assert!(hub.take_pending(RequestId(1)).await.is_none());
    }
}
