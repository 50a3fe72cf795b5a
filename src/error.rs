use thiserror::Error;

/// The bridge's error taxonomy (see §7 error handling design).
///
/// Every variant here surfaces to at most one client response and one log
/// line; none of them are fatal to the process. The only fatal conditions
/// (bind failure, shutdown signal) are handled directly in `main`/`cli` via
/// `anyhow`, not through this enum.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport closed")]
    TransportClosed,

    #[error("extension not connected")]
    ExtensionOffline,

    #[error("command timed out")]
    CommandTimeout,

    #[error("extension connection lost mid-request")]
    TransportLost,

    #[error("malformed message: {0}")]
    ParseError(String),

    #[error("invalid message id (must be a number or string)")]
    InvalidMessageId,

    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// The CDP JSON-RPC-ish error code to attach when this error is surfaced
    /// on a CDP connection (§7).
    pub fn cdp_code(&self) -> i64 {
        match self {
            BridgeError::ExtensionOffline => -32000,
            BridgeError::InvalidMessageId => -32600,
            BridgeError::CommandTimeout => -32000,
            BridgeError::TransportLost => -32000,
            _ => -32603,
        }
    }
}
