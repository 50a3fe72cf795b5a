//! CLI surface (§11 ambient stack), styled after the teacher's
//! `cli`/`commands::extension` split: a top-level [`Cli`] with
//! subcommands, each rendering its own small `colored` banner.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{BridgeConfig, LogStream};
use crate::error::{BridgeError, Result};

#[derive(Parser)]
#[command(name = "brop-bridge", about = "Multiplex BROP/CDP automation clients onto a single browser extension connection")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bridge: BROP listener, extension conduit, and CDP listener + discovery.
    Serve {
        #[arg(long, env = "BRIDGE_BROP_PORT")]
        brop_port: Option<u16>,
        #[arg(long, env = "BRIDGE_EXTENSION_PORT")]
        extension_port: Option<u16>,
        #[arg(long, env = "BRIDGE_CDP_PORT")]
        cdp_port: Option<u16>,
        #[arg(long, value_enum)]
        log_stream: Option<LogStream>,
        /// Force stderr logging, for when this process is driven as an
        /// stdio-framed MCP adapter and stdout must stay clean (§4.9).
        #[arg(long)]
        mcp_stdio: bool,
    },
    /// Check whether the bridge's three ports are reachable.
    Status {
        #[arg(long, env = "BRIDGE_BROP_PORT")]
        brop_port: Option<u16>,
        #[arg(long, env = "BRIDGE_EXTENSION_PORT")]
        extension_port: Option<u16>,
        #[arg(long, env = "BRIDGE_CDP_PORT")]
        cdp_port: Option<u16>,
    },
    /// Print a snapshot of the bridge's structured log ring buffer.
    Logs {
        #[arg(long, env = "BRIDGE_CDP_PORT")]
        cdp_port: Option<u16>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        level: Option<String>,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Serve {
                brop_port,
                extension_port,
                cdp_port,
                log_stream,
                mcp_stdio,
            } => serve(brop_port, extension_port, cdp_port, log_stream, mcp_stdio).await,
            Commands::Status {
                brop_port,
                extension_port,
                cdp_port,
            } => status(brop_port, extension_port, cdp_port).await,
            Commands::Logs {
                cdp_port,
                limit,
                level,
            } => logs(cdp_port, limit, level).await,
        }
    }
}

async fn serve(
    brop_port: Option<u16>,
    extension_port: Option<u16>,
    cdp_port: Option<u16>,
    log_stream: Option<LogStream>,
    mcp_stdio: bool,
) -> Result<()> {
    let mut config = BridgeConfig::load()?;
    if let Some(p) = brop_port {
        config.brop_port = p;
    }
    if let Some(p) = extension_port {
        config.extension_port = p;
    }
    if let Some(p) = cdp_port {
        config.cdp_port = p;
    }
    if let Some(stream) = log_stream {
        config.log_stream = stream;
    }
    if mcp_stdio {
        config.log_stream = LogStream::Stderr;
    }

    init_tracing(config.log_stream);

    // Keep stdout free of anything but intentional output when the process
    // is wired up as an MCP adapter's subprocess (§4.9, §6).
    if !mcp_stdio {
        println!();
        println!("  {}", "Browser Automation Bridge".bold());
        println!("  {}", "─".repeat(40).dimmed());
        println!();
        println!("  {}  BROP listener on ws://127.0.0.1:{}", "◆".cyan(), config.brop_port);
        println!("  {}  Extension conduit on ws://127.0.0.1:{}", "◆".cyan(), config.extension_port);
        println!("  {}  CDP listener + discovery on http://127.0.0.1:{}", "◆".cyan(), config.cdp_port);
        println!();
        println!("  {}  Waiting for the extension to connect...", "ℹ".dimmed());
        println!("  {}  Press Ctrl+C to stop", "ℹ".dimmed());
        println!();
    }

    crate::bridge::run(config).await
}

/// Route `tracing` output to whichever stream the configuration picked.
/// `EnvFilter` still takes precedence via `RUST_LOG` so operators can raise
/// verbosity without a recompile, matching the teacher's own filter setup.
fn init_tracing(stream: LogStream) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match stream {
        LogStream::Stdout => {
            registry.with(fmt::layer().with_writer(std::io::stdout)).init();
        }
        LogStream::Stderr => {
            registry.with(fmt::layer().with_writer(std::io::stderr)).init();
        }
    }
}

async fn status(brop_port: Option<u16>, extension_port: Option<u16>, cdp_port: Option<u16>) -> Result<()> {
    let config = BridgeConfig::load()?;
    let brop_port = brop_port.unwrap_or(config.brop_port);
    let extension_port = extension_port.unwrap_or(config.extension_port);
    let cdp_port = cdp_port.unwrap_or(config.cdp_port);

    for (label, port) in [
        ("BROP listener", brop_port),
        ("Extension conduit", extension_port),
        ("CDP listener", cdp_port),
    ] {
        if is_port_open(port).await {
            println!("  {} {} is listening on {}", "✓".green(), label, port);
        } else {
            println!("  {} {} is not reachable on {}", "✗".red(), label, port);
        }
    }
    Ok(())
}

async fn is_port_open(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

async fn logs(cdp_port: Option<u16>, limit: Option<usize>, level: Option<String>) -> Result<()> {
    let config = BridgeConfig::load()?;
    let port = cdp_port.unwrap_or(config.cdp_port);

    let mut path = "/logs".to_string();
    let mut query = Vec::new();
    if let Some(limit) = limit {
        query.push(format!("limit={limit}"));
    }
    if let Some(level) = level {
        query.push(format!("level={level}"));
    }
    if !query.is_empty() {
        path.push('?');
        path.push_str(&query.join("&"));
    }

    let body = http_get(port, &path).await?;
    let records: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| BridgeError::Other(format!("could not parse /logs response: {e}")))?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

/// A bare-bones HTTP/1.1 GET over a raw TCP socket, used only by `logs` so
/// this crate doesn't need an HTTP client dependency for one diagnostic
/// command (the listener itself is served with `axum`; this is the client
/// side, deliberately minimal).
async fn http_get(port: u16, path: &str) -> Result<String> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| BridgeError::Other(format!("cannot connect to bridge on port {port}: {e}")))?;

    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let text = String::from_utf8_lossy(&raw);

    match text.split_once("\r\n\r\n") {
        Some((_, body)) => Ok(body.to_string()),
        None => Err(BridgeError::Other("malformed HTTP response from bridge".to_string())),
    }
}
