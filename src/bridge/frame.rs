//! Wire-level message shapes shared by BROP and CDP traffic.
//!
//! The distilled spec's Design Notes call out that a CDP frame is really a
//! sum type — `Request{id,method,params,sessionId?}`,
//! `Response{id,result|error}`, `Event{method,params,sessionId?}` — and that
//! modeling it that way turns the `method ⇒ ¬id` / `id ⇒ result ∨ error`
//! invariant into something the type system enforces instead of something
//! every call site has to remember. `MessageId` mirrors CDP's actual wire
//! shape (a number or a string; anything else is `invalid-message-id`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Num(u64),
    Str(String),
    /// Stands in for an `id` that was present but neither a number nor a
    /// string (`null`, a bool, an array, an object) — `invalid-message-id`.
    /// Never produced for a genuinely absent `id` key.
    Null,
}

impl MessageId {
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => n.as_u64().map(MessageId::Num),
            Value::String(s) => Some(MessageId::Str(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Num(n) => write!(f, "{n}"),
            MessageId::Str(s) => write!(f, "{s}"),
            MessageId::Null => write!(f, "null"),
        }
    }
}

/// A process-unique, monotonically increasing id used to correlate a
/// request sent toward the extension with the response that eventually
/// comes back (component C). Distinct from `MessageId`, which is whatever
/// id a *client* chose for its own request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parsed client→bridge CDP frame. Exactly one of `Command`/`Response`-ish
/// shapes — here only `Command` is relevant, since clients never send us
/// CDP responses or events.
#[derive(Debug, Clone)]
pub struct CdpCommand {
    pub id: MessageId,
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

impl CdpCommand {
    /// Parse a raw client frame. Returns `Err(None)` when the `id` key is
    /// absent entirely (don't even attempt a reply); `Err(Some(_))` when an
    /// `id` was present — whether a valid number/string or not — but the
    /// frame is otherwise invalid. An `id` present but neither a number nor
    /// a string (e.g. `null`) is reported as `Err(Some(MessageId::Null))`
    /// rather than folded into the "absent" case: the caller still owes
    /// that client a single CDP `-32600` response (`invalid-message-id`).
    pub fn parse(raw: &Value) -> std::result::Result<CdpCommand, Option<MessageId>> {
        let Some(id_value) = raw.get("id") else {
            return Err(None);
        };
        let Some(id) = MessageId::from_value(id_value) else {
            return Err(Some(MessageId::Null));
        };
        let method = match raw.get("method").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => return Err(Some(id)),
        };
        let params = raw.get("params").cloned().unwrap_or(Value::Null);
        let session_id = raw
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(CdpCommand {
            id,
            method,
            params,
            session_id,
        })
    }
}

/// A bridge→client CDP frame: either a response to a prior command (has
/// `id`) or an unsolicited event (has `method`, never `id`). Kept as two
/// constructors on one type rather than an enum so call sites can't forget
/// to serialize the exclusivity rule.
#[derive(Debug, Clone, Serialize)]
pub struct CdpOutbound {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CdpOutbound {
    pub fn response_ok(id: MessageId, session_id: Option<String>, result: Value) -> Self {
        Self {
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
            session_id,
        }
    }

    pub fn response_err(id: MessageId, session_id: Option<String>, code: i64, message: String) -> Self {
        Self {
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(serde_json::json!({"code": code, "message": message})),
            session_id,
        }
    }

    pub fn event(method: impl Into<String>, params: Value, session_id: Option<String>) -> Self {
        Self {
            id: None,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
            session_id,
        }
    }

    /// Invariant check used by tests and debug assertions: `method ⇒ ¬id`
    /// and `id ⇒ (result ∨ error)`, never both `method` and `id`.
    pub fn is_well_formed(&self) -> bool {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => false,
            (Some(_), None) => self.result.is_some() || self.error.is_some(),
            (None, Some(_)) => true,
            (None, None) => false,
        }
    }
}

/// A parsed BROP command frame: `{id?, method, params?}` or the legacy
/// `{id?, command:{type,...}}` shape (§4.4).
#[derive(Debug, Clone)]
pub struct BropCommand {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl BropCommand {
    pub fn parse(raw: &Value, next_anonymous_id: impl FnOnce() -> u64) -> Option<BropCommand> {
        let id = raw
            .get("id")
            .cloned()
            .unwrap_or_else(|| Value::from(next_anonymous_id()));

        if let Some(method) = raw.get("method").and_then(Value::as_str) {
            let params = raw.get("params").cloned().unwrap_or(Value::Null);
            return Some(BropCommand {
                id,
                method: method.to_string(),
                params,
            });
        }

        // Legacy shape: {id?, command: {type, ...}}
        let command = raw.get("command")?;
        let method = command.get("type").and_then(Value::as_str)?.to_string();
        Some(BropCommand {
            id,
            method,
            params: command.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BropResponse {
    pub id: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl BropResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(Value::String(error.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cdp_outbound_response_and_event_are_mutually_exclusive() {
        let resp = CdpOutbound::response_ok(MessageId::Num(1), None, json!({}));
        assert!(resp.is_well_formed());
        let evt = CdpOutbound::event("Target.targetCreated", json!({}), None);
        assert!(evt.is_well_formed());
    }

    #[test]
    fn cdp_command_parse_rejects_missing_method_but_keeps_id() {
        let raw = json!({"id": 5});
        match CdpCommand::parse(&raw) {
            Err(Some(MessageId::Num(5))) => {}
            other => panic!("expected recoverable id, got {other:?}"),
        }
    }

    #[test]
    fn cdp_command_parse_distinguishes_absent_id_from_null_id() {
        // No `id` key at all: nothing to reply with.
        let raw = json!({"method": "Runtime.enable"});
        assert!(matches!(CdpCommand::parse(&raw), Err(None)));

        // `id: null` (scenario: a CDP client sends a null id): present but
        // invalid, still answered with a single -32600.
        let raw = json!({"id": null, "method": "Runtime.enable"});
        assert!(matches!(CdpCommand::parse(&raw), Err(Some(MessageId::Null))));
    }

    #[test]
    fn brop_command_parses_legacy_shape() {
        let raw = json!({"id": 1, "command": {"type": "navigate", "url": "https://example.com"}});
        let cmd = BropCommand::parse(&raw, || 0).expect("should parse");
        assert_eq!(cmd.method, "navigate");
    }

    #[test]
    fn brop_command_assigns_id_when_missing() {
        let raw = json!({"method": "get_server_status"});
        let cmd = BropCommand::parse(&raw, || 42).expect("should parse");
        assert_eq!(cmd.id, json!(42));
    }
}
