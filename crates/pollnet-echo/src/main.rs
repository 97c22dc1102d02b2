//! pollnet echo server.
//!
//! Serves one listener in one of three modes and sends every message back to
//! the connection it came from:
//!
//! | Mode        | Wire format                         | Echoed as                   |
//! |-------------|-------------------------------------|-----------------------------|
//! | `framed`    | `[len:u32 LE][id:u32 LE][payload]`  | same id, same payload       |
//! | `websocket` | RFC 6455 text / binary messages     | same opcode, same payload   |
//! | `udp`       | one framed packet per datagram      | same id, same payload       |
//!
//! Framed and UDP modes only route the message id given by `--route-id`;
//! other ids are logged and dropped.
//!
//! # Usage
//!
//! ```text
//! pollnet-echo [OPTIONS]
//!
//! Options:
//!   --addr <ADDR>            Listen address [default: 127.0.0.1:7000]
//!   --mode <MODE>            framed | websocket | udp [default: framed]
//!   --config <PATH>          TOML file with server settings
//!   --event-loops <N>        Poller shards (overrides the file)
//!   --workers <N>            Concurrent handlers (overrides the file)
//!   --max-body-length <N>    Largest message in bytes, 0 = unlimited
//!   --route-id <ID>          Message id echoed in framed / udp mode [default: 1]
//!   --log-level <FILTER>     Log filter, e.g. `debug` or `pollnet_server=trace`
//! ```
//!
//! Every option can also be set through a `POLLNET_*` environment variable
//! (`POLLNET_ADDR`, `POLLNET_MODE`, ...).  Without `--log-level` the filter
//! comes from `RUST_LOG`, falling back to `info`.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use pollnet_server::{Request, Server, ServerBuilder, ServerConfig, WebSocketHandler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Framed,
    Websocket,
    Udp,
}

/// Echo server for the pollnet engine.
#[derive(Debug, Parser)]
#[command(name = "pollnet-echo", version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7000", env = "POLLNET_ADDR")]
    addr: SocketAddr,

    #[arg(long, value_enum, default_value_t = Mode::Framed, env = "POLLNET_MODE")]
    mode: Mode,

    /// TOML file with `ServerConfig` settings; missing keys keep their
    /// defaults.
    #[arg(long, env = "POLLNET_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "POLLNET_EVENT_LOOPS")]
    event_loops: Option<usize>,

    #[arg(long, env = "POLLNET_WORKERS")]
    workers: Option<usize>,

    #[arg(long, env = "POLLNET_MAX_BODY_LENGTH")]
    max_body_length: Option<u32>,

    #[arg(long, default_value_t = 1, env = "POLLNET_ROUTE_ID")]
    route_id: u32,

    #[arg(long, env = "POLLNET_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the config file (if any) and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(event_loops) = self.event_loops {
            config.event_loops = event_loops;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max_body_length) = self.max_body_length {
            config.max_body_length = max_body_length;
        }
        Ok(config.validate())
    }

    fn log_filter(&self) -> EnvFilter {
        match &self.log_level {
            Some(level) => EnvFilter::new(level),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }
}

// ── Echo handlers ─────────────────────────────────────────────────────────────

fn echo_packet(req: &Request) -> anyhow::Result<()> {
    let message = req.message();
    req.connection().send(message.id(), message.payload())?;
    Ok(())
}

struct WebSocketEcho;

impl WebSocketHandler for WebSocketEcho {
    fn message(&self, req: &Request) -> anyhow::Result<()> {
        let conn = req.connection();
        match req.message().text() {
            Some(text) => conn.text(text)?,
            None => conn.binary(req.message().payload())?,
        }
        Ok(())
    }
}

/// Binds the listener for `cli.mode`.
fn build_server(cli: &Cli, config: ServerConfig) -> anyhow::Result<Server> {
    let builder = ServerBuilder::new(config);
    let server = match cli.mode {
        Mode::Framed => builder.route(cli.route_id, echo_packet).bind_tcp(cli.addr),
        Mode::Udp => builder.route(cli.route_id, echo_packet).bind_udp(cli.addr),
        Mode::Websocket => builder.websocket_handler(WebSocketEcho).bind_websocket(cli.addr),
    };
    server.with_context(|| format!("binding {:?} listener on {}", cli.mode, cli.addr))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_env_filter(cli.log_filter()).init();

    let config = cli.server_config()?;
    let server = build_server(&cli, config)?;
    server.start().context("starting server")?;
    info!(addr = %server.local_addr(), mode = ?cli.mode, "pollnet-echo ready; press Ctrl-C to exit");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {e}");
    }
    info!("shutdown signal received");

    // Joins reactor threads; keep it off the async workers.
    tokio::task::spawn_blocking(move || server.stop())
        .await
        .context("stopping server")?;
    info!("pollnet-echo stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
