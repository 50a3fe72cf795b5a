//! Client connection model (§3 Data model — "Client connection").

use tokio::sync::mpsc;

/// Opaque, process-unique client id. Generated from a monotone counter, not
/// exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Brop,
    Cdp,
}

/// A CDP client's role, classified at WebSocket-upgrade time (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdpRole {
    /// Connected at `/devtools/browser/...` (or an unclassifiable path when
    /// it is the first such connection): sees `Target.*` events and issues
    /// browser-level commands.
    BrowserLevel,
    /// Connected at `/devtools/page/...` or `/session/...`: scoped to one
    /// `sessionId`.
    SessionBound,
}

/// Outbound message queued for delivery to one client. Carries the raw JSON
/// text since BROP and CDP frames are serialized differently upstream.
pub type OutboundMessage = String;

/// Bounded outbound channel capacity per client (§4.7 backpressure: a slow
/// client is closed rather than stalling fan-out).
pub const CLIENT_CHANNEL_CAPACITY: usize = 256;

/// Handle the hub keeps for one connected client. The read loop that owns
/// the actual socket lives elsewhere; this is only the send-side handle plus
/// bookkeeping the hub needs for routing decisions.
pub struct ClientHandle {
    pub id: ClientId,
    pub label: String,
    pub kind: ClientKind,
    pub sender: mpsc::Sender<OutboundMessage>,
    /// CDP-only: this client's role.
    pub cdp_role: Option<CdpRole>,
    /// CDP-only, per client `Target.setDiscoverTargets`/`setAutoAttach`
    /// flags remembered per §4.6's synthetic-method table.
    pub discover_targets: bool,
    pub auto_attach: bool,
}

impl ClientHandle {
    pub fn new(
        id: ClientId,
        label: String,
        kind: ClientKind,
        sender: mpsc::Sender<OutboundMessage>,
        cdp_role: Option<CdpRole>,
    ) -> Self {
        Self {
            id,
            label,
            kind,
            sender,
            cdp_role,
            discover_targets: false,
            auto_attach: false,
        }
    }

    /// Enqueue a raw text frame, never blocking: `try_send` and a closed or
    /// full channel are both treated as "this client is going away".
    pub fn try_send(&self, text: OutboundMessage) -> bool {
        self.sender.try_send(text).is_ok()
    }
}

/// Helper used only for constructing reply ids when a BROP frame never had
/// one. Kept here rather than in `frame.rs` since it is per-client state.
#[derive(Debug, Default)]
pub struct AnonymousIdCounter(u64);

impl AnonymousIdCounter {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}
