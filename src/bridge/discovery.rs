//! Shared discovery payloads — used both by the `/json/version` HTTP route
//! (component E) and by the synthetic `Browser.getVersion` CDP method
//! (component F), which the distilled spec requires to return the exact
//! same object (§4.6).

use serde_json::{json, Value};

/// A fixed browser-identification object mimicking a real, recent Chrome
/// build. Downstream CDP clients such as Playwright/Puppeteer refuse to
/// attach if this doesn't look like Chrome (§4.5) — every field here is
/// policy-critical, not decorative.
pub fn browser_version_payload(cdp_port: u16) -> Value {
    json!({
        "Browser": "Chrome/124.0.6367.91",
        "Protocol-Version": "1.3",
        "User-Agent": "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.6367.91 Safari/537.36",
        "V8-Version": "12.4.254.12",
        "WebKit-Version": "537.36 (@deadbeefcafebabefeedfacec0ffee1234567890)",
        "webSocketDebuggerUrl": format!("ws://127.0.0.1:{cdp_port}/devtools/browser/00000000-0000-4000-8000-000000000000"),
    })
}

/// The synthetic browser target advertised by `/json` and `/json/list` at
/// startup. Page targets are never pre-advertised here (§4.5) — only
/// through `Target.*` events — because advertising them causes
/// duplicate-target errors in downstream clients.
pub fn browser_target_entry(cdp_port: u16) -> Value {
    json!({
        "type": "browser",
        "id": "00000000-0000-4000-8000-000000000000",
        "title": "Browser",
        "description": "",
        "url": "",
        "webSocketDebuggerUrl": format!("ws://127.0.0.1:{cdp_port}/devtools/browser/00000000-0000-4000-8000-000000000000"),
    })
}

/// Legacy per-page discovery entry, only emitted when
/// `behavior.legacy_page_discovery` is set (§9 Open Question — the default
/// form omits these because the alternative provoked duplicate-target
/// errors downstream).
pub fn legacy_page_entry(cdp_port: u16, target_id: &str, url: &str, title: &str) -> Value {
    json!({
        "type": "page",
        "id": target_id,
        "title": title,
        "url": url,
        "webSocketDebuggerUrl": format!("ws://127.0.0.1:{cdp_port}/devtools/page/{target_id}"),
    })
}
