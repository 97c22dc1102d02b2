//! Server-side TLS over a non-blocking descriptor.
//!
//! rustls never touches the socket itself.  The connection feeds it
//! ciphertext with [`TlsSession::read_tls`], lets it decrypt with
//! [`TlsSession::process`], and collects whatever it wants to send
//! (handshake records, alerts, sealed application data) as plain byte
//! buffers that go through the ordinary write queue.
//!
//! ```text
//!   socket ──read_tls──► rustls ──plaintext()──► frame / packet decoder
//!   send()  ──seal()───► rustls ──ciphertext──► WriteQueue ──► socket
//! ```
//!
//! Decrypted bytes may sit inside rustls after the socket is drained, and the
//! poller will not report readiness for them.  A read pass that stops before
//! [`TlsSession::plaintext`] reports `WouldBlock` must be resumed without
//! waiting for the poller, and must drain that plaintext before the next
//! [`TlsSession::read_tls`]: rustls rejects ciphertext while its plaintext
//! buffer is full.

use std::io::{self, Write};
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};

use super::write_queue::{RawReader, RawSocket};

pub(crate) struct TlsSession {
    conn: ServerConnection,
}

impl TlsSession {
    pub(crate) fn new(config: Arc<ServerConfig>) -> Result<Self, rustls::Error> {
        let mut conn = ServerConnection::new(config)?;
        // Backpressure is handled by the write queue, not by rustls.
        conn.set_buffer_limit(None);
        Ok(Self { conn })
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// One read of ciphertext from the socket.  `Ok(0)` is end of stream.
    pub(crate) fn read_tls(&mut self, sock: &dyn RawSocket) -> io::Result<usize> {
        self.conn.read_tls(&mut RawReader(sock))
    }

    /// Decrypts buffered records and advances the handshake.
    pub(crate) fn process(&mut self) -> Result<(), rustls::Error> {
        self.conn.process_new_packets().map(|_| ())
    }

    /// Drains every record rustls wants to send.
    pub(crate) fn take_ciphertext(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out)?;
        }
        Ok(out)
    }

    /// Encrypts `plaintext` and returns the records to write.
    ///
    /// Data written before the handshake finishes is held by rustls and
    /// released with the first ciphertext after it.
    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        self.conn.writer().write_all(plaintext)?;
        self.take_ciphertext()
    }

    /// Decrypted application bytes.  Reports `WouldBlock` once drained and
    /// `Ok(0)` after the peer's `close_notify`.
    pub(crate) fn plaintext(&mut self) -> rustls::Reader<'_> {
        self.conn.reader()
    }

    /// Queues a `close_notify` alert and returns it sealed.
    pub(crate) fn close_notify(&mut self) -> io::Result<Vec<u8>> {
        self.conn.send_close_notify();
        self.take_ciphertext()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
