//! Error taxonomy shared by the packet codec and the WebSocket layer.
//!
//! Errors fall into three classes, and callers treat each class differently:
//!
//! | Class              | Example                              | Reaction                        |
//! |--------------------|--------------------------------------|---------------------------------|
//! | transient          | `WouldBlock`, `Interrupted`          | keep decode state, wait         |
//! | protocol violation | oversized body, bad opcode, RSV bits | close, WebSocket close code     |
//! | transport failure  | peer EOF, reset, broken pipe         | close silently, on-close fires  |
//!
//! [`ProtocolError::is_would_block`] and [`ProtocolError::close_code`] are the
//! two questions the reactor asks of every error.

use std::io;

use thiserror::Error;

use crate::websocket::frame::close_code;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed its half of the stream (a read returned zero bytes).
    #[error("connection closed by peer")]
    Eof,

    /// A datagram or buffer is shorter than the fixed header.
    #[error("short header: need {needed} bytes, got {available}")]
    ShortHeader { needed: usize, available: usize },

    /// A datagram's payload length disagrees with its header.
    #[error("payload length mismatch: header says {declared}, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// The declared body length exceeds the configured (or representable) limit.
    #[error("body length {declared} exceeds limit {limit}")]
    BodyTooLarge { declared: u64, limit: u64 },

    /// A WebSocket frame carried an opcode RFC 6455 does not define.
    #[error("unknown websocket opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// RSV1-3 were set but no extension was negotiated.
    #[error("reserved bits set in frame header: 0x{0:02X}")]
    ReservedBits(u8),

    /// A control frame declared more than 125 payload bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(u64),

    /// A control frame arrived with FIN cleared.
    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,

    /// A continuation frame arrived with no message in progress.
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// A new TEXT/BINARY frame started before the previous message finished.
    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,

    /// A client-to-server frame was not masked.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// A TEXT message or close reason was not valid UTF-8.
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// A CLOSE frame payload was malformed (1-byte body or reserved status code).
    #[error("invalid close frame: {0}")]
    InvalidClose(String),

    /// The HTTP upgrade request was malformed or not a WebSocket upgrade.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// The HTTP upgrade request did not terminate within the buffer limit.
    #[error("websocket handshake exceeds {limit} bytes")]
    HandshakeTooLarge { limit: usize },

    /// The underlying read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True when the error only means "no data yet"; decode state is intact
    /// and the caller should wait for the next readiness notification.
    pub fn is_would_block(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted
        )
    }

    /// True for peer EOF and socket-level failures.
    pub fn is_transport(&self) -> bool {
        match self {
            ProtocolError::Eof => true,
            ProtocolError::Io(_) => !self.is_would_block(),
            _ => false,
        }
    }

    /// The RFC 6455 status code to send before closing, for protocol violations.
    ///
    /// Returns `None` for transient and transport errors: there is either
    /// nothing to report or nobody left to report it to.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ProtocolError::Eof | ProtocolError::Io(_) => None,
            ProtocolError::InvalidUtf8 => Some(close_code::INVALID_PAYLOAD),
            ProtocolError::BodyTooLarge { .. } => Some(close_code::MESSAGE_TOO_BIG),
            _ => Some(close_code::PROTOCOL_ERROR),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
