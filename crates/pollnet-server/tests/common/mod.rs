//! Helpers shared by the integration test binaries.
//!
//! Each `tests/*.rs` file is compiled as its own crate and uses a different
//! subset of these helpers.
#![allow(dead_code)]

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pollnet_server::{Connection, ConnectionHooks, DataPacker, Packer, ServerConfig};
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Routes server logs through the test harness; `RUST_LOG` picks the level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Two shards and a small worker pool: enough to exercise the hand-offs.
///
/// Every test starts from here, so it also installs logging.
pub fn config() -> ServerConfig {
    init_logging();
    ServerConfig {
        event_loops: 2,
        workers: 4,
        ..ServerConfig::default()
    }
}

pub fn packet(id: u32, payload: &[u8]) -> Vec<u8> {
    DataPacker::new().pack(id, payload).unwrap()
}

/// Reads one `[len][id][payload]` packet from a blocking stream.
pub fn read_packet(stream: &mut impl Read) -> io::Result<(u32, Vec<u8>)> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok((id, payload))
}

/// True once the peer has closed: EOF or a reset.
pub fn is_closed_by_peer(stream: &mut impl Read) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => return false,
            Err(_) => return true,
        }
    }
}

/// Polls `done` until it holds or [`TIMEOUT`] passes.
pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

/// Counts lifecycle callbacks.
#[derive(Default)]
pub struct HookCounter {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

impl HookCounter {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Lets a test keep an `Arc<HookCounter>` while the server owns the hooks.
pub struct SharedHooks(pub Arc<HookCounter>);

impl ConnectionHooks for SharedHooks {
    fn on_open(&self, _conn: &Arc<Connection>) {
        self.0.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _conn: &Arc<Connection>) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}
