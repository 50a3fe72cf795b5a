use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

fn default_brop_port() -> u16 {
    9225
}
fn default_extension_port() -> u16 {
    9224
}
fn default_cdp_port() -> u16 {
    9222
}
fn default_cdp_timeout_secs() -> u64 {
    30
}
fn default_brop_timeout_secs() -> u64 {
    10
}
fn default_queue_deadline_ms() -> u64 {
    2_000
}
fn default_log_capacity() -> usize {
    1_000
}
fn default_keepalive_interval_secs() -> u64 {
    10
}

/// Where structured log lines go. Forced to `Stderr` whenever the process is
/// serving an stdio-based MCP adapter, so stdout stays free of anything but
/// protocol frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Behavior flags preserved from the distilled spec's Open Questions
/// (§9) rather than guessed away — see DESIGN.md for the chosen defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorFlags {
    /// Forward extension-sourced `Target.attachedToTarget` events for
    /// targets the bridge did not itself create, instead of suppressing
    /// all of them unconditionally.
    pub forward_foreign_attach_events: bool,
    /// Legacy discovery form that advertises page targets (with per-page
    /// ports) in `/json` and `/json/list` in addition to the browser
    /// target. Off by default — the alternative caused duplicate-target
    /// errors downstream (§4.5, §9).
    pub legacy_page_discovery: bool,
}

impl Default for BehaviorFlags {
    fn default() -> Self {
        Self {
            forward_foreign_attach_events: false,
            legacy_page_discovery: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub brop_port: u16,
    pub extension_port: u16,
    pub cdp_port: u16,
    pub cdp_timeout_secs: u64,
    pub brop_timeout_secs: u64,
    pub queue_deadline_ms: u64,
    pub log_capacity: usize,
    pub keepalive_interval_secs: u64,
    pub log_stream: LogStream,
    pub behavior: BehaviorFlags,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            brop_port: default_brop_port(),
            extension_port: default_extension_port(),
            cdp_port: default_cdp_port(),
            cdp_timeout_secs: default_cdp_timeout_secs(),
            brop_timeout_secs: default_brop_timeout_secs(),
            queue_deadline_ms: default_queue_deadline_ms(),
            log_capacity: default_log_capacity(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            log_stream: LogStream::Stdout,
            behavior: BehaviorFlags::default(),
        }
    }
}

impl BridgeConfig {
    pub fn cdp_timeout(&self) -> Duration {
        Duration::from_secs(self.cdp_timeout_secs)
    }

    pub fn brop_timeout(&self) -> Duration {
        Duration::from_secs(self.brop_timeout_secs)
    }

    pub fn queue_deadline(&self) -> Duration {
        Duration::from_millis(self.queue_deadline_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Default config file location: `~/.config/brop-bridge/config.toml`.
    pub fn config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            BridgeError::Other("could not determine config directory".to_string())
        })?;
        Ok(dir.join("brop-bridge").join("config.toml"))
    }

    /// Load configuration by layering, in increasing precedence: built-in
    /// defaults, the on-disk TOML file (if present), then `BRIDGE_*`
    /// environment variables. CLI flags are applied by the caller on top of
    /// the result (see `cli::ServeArgs::apply`), matching the teacher's
    /// figment-based `Config::load()` shape.
    pub fn load() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(BridgeConfig::default()));

        if let Ok(path) = Self::config_path() {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("BRIDGE_"));

        figment
            .extract()
            .map_err(|e| BridgeError::Other(format!("failed to load configuration: {e}")))
    }
}
