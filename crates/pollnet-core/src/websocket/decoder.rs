//! Resumable WebSocket frame decoder.
//!
//! # State machine
//!
//! ```text
//!   Header ──► ExtendedLength ──► MaskKey ──► Payload ──┐
//!     ▲   └──────────┴──────────────┴────────────┘       │
//!     └──────────────────── frame complete ◄──────────────┘
//! ```
//!
//! Every stage reads into a fixed scratch area and records how many bytes it
//! already holds (`step`).  A slow peer may deliver the 2-byte base header,
//! the extended length and the mask key in separate segments; the decoder
//! simply picks up where it stopped on the next call.
//!
//! Data frames (TEXT/BINARY + CONTINUATION) are reassembled into one
//! [`Message`].  Control frames may interleave between fragments and are
//! returned immediately as [`WsEvent`]s.  TEXT messages are UTF-8 validated
//! once the final fragment arrives, never per fragment, because a multi-byte
//! character may straddle a fragment boundary.

use std::io::{self, Read};

use crate::error::ProtocolError;
use crate::protocol::message::Message;
use crate::websocket::frame::{parse_close_payload, OpCode, MAX_CONTROL_PAYLOAD};

/// Payload buffers grow by at most this much per read.
const READ_CHUNK: usize = 64 * 1024;

/// Something the application or the connection must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    /// A complete TEXT or BINARY message.
    Message(Message),
    /// The peer pinged; answer with a PONG carrying the same payload.
    Ping(Vec<u8>),
    /// A PONG arrived (solicited or not); safe to ignore.
    Pong(Vec<u8>),
    /// The peer started the closing handshake.
    Close { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    ExtendedLength,
    MaskKey,
    Payload,
}

/// Per-connection WebSocket decode state.
#[derive(Debug)]
pub struct FrameDecoder {
    stage: Stage,
    scratch: [u8; 8],
    step: usize,

    // Current frame
    fin: bool,
    opcode: OpCode,
    masked: bool,
    ext_len_bytes: usize,
    frame_len: u64,
    mask: [u8; 4],
    frame: Vec<u8>,

    // Current logical message
    message_mode: Option<OpCode>,
    continuation: Vec<u8>,
    next_id: u32,

    // Limits
    max_message_len: Option<u64>,
    require_mask: bool,

    // Bytes read past the end of the handshake, consumed before the socket.
    carry: Vec<u8>,
    carry_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// A decoder for client-to-server traffic: frames must be masked, no
    /// size limit.
    pub fn new() -> Self {
        Self {
            stage: Stage::Header,
            scratch: [0; 8],
            step: 0,
            fin: false,
            opcode: OpCode::Continuation,
            masked: false,
            ext_len_bytes: 0,
            frame_len: 0,
            mask: [0; 4],
            frame: Vec::new(),
            message_mode: None,
            continuation: Vec::new(),
            next_id: 0,
            max_message_len: None,
            require_mask: true,
            carry: Vec::new(),
            carry_pos: 0,
        }
    }

    /// Rejects messages whose total (reassembled) length exceeds `limit`.
    ///
    /// The check runs on each frame header, before the payload is buffered.
    pub fn with_max_message_len(mut self, limit: Option<u64>) -> Self {
        self.max_message_len = limit;
        self
    }

    /// Whether unmasked frames are a protocol error (true for servers).
    pub fn with_require_mask(mut self, require: bool) -> Self {
        self.require_mask = require;
        self
    }

    /// Queues bytes that were read together with the handshake so they are
    /// decoded before anything new from the socket.
    pub fn push_prefix(&mut self, bytes: Vec<u8>) {
        if self.carry_pos == self.carry.len() {
            self.carry = bytes;
            self.carry_pos = 0;
        } else {
            self.carry.extend(bytes);
        }
    }

    /// Performs at most one read from `src` and advances the decoder.
    ///
    /// Returns `Ok(None)` when bytes were consumed but no event is complete.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Eof`] on end of stream, a protocol violation, or the
    /// read error itself (check [`ProtocolError::is_would_block`]).
    pub fn decode<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<Option<WsEvent>, ProtocolError> {
        loop {
            match self.stage {
                Stage::Header => {
                    if !self.fill(src, 2)? {
                        return Ok(None);
                    }
                    self.parse_header()?;
                }
                Stage::ExtendedLength => {
                    if !self.fill(src, self.ext_len_bytes)? {
                        return Ok(None);
                    }
                    self.parse_extended_length()?;
                }
                Stage::MaskKey => {
                    if !self.fill(src, 4)? {
                        return Ok(None);
                    }
                    self.mask.copy_from_slice(&self.scratch[..4]);
                    self.step = 0;
                    self.stage = Stage::Payload;
                }
                Stage::Payload => {
                    if !self.read_payload(src)? {
                        return Ok(None);
                    }
                    match self.finish_frame()? {
                        Some(event) => return Ok(Some(event)),
                        // Non-final fragment: report progress, resume later.
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Reads into `scratch[step..want]`; true once `want` bytes are held.
    fn fill<R: Read + ?Sized>(&mut self, src: &mut R, want: usize) -> Result<bool, ProtocolError> {
        if self.step < want {
            let n = read_with_carry(&mut self.carry, &mut self.carry_pos, src, &mut self.scratch[self.step..want])?;
            if n == 0 {
                return Err(ProtocolError::Eof);
            }
            self.step += n;
        }
        Ok(self.step == want)
    }

    fn parse_header(&mut self) -> Result<(), ProtocolError> {
        let b0 = self.scratch[0];
        let b1 = self.scratch[1];
        self.step = 0;

        let rsv = b0 & 0x70;
        if rsv != 0 {
            return Err(ProtocolError::ReservedBits(rsv));
        }

        let opcode = OpCode::try_from(b0 & 0x0F)?;
        let fin = b0 & 0x80 != 0;
        let masked = b1 & 0x80 != 0;
        let len7 = b1 & 0x7F;

        if self.require_mask && !masked {
            return Err(ProtocolError::UnmaskedFrame);
        }

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
            if usize::from(len7) > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooLarge(u64::from(len7)));
            }
        } else {
            match (opcode, self.message_mode) {
                (OpCode::Continuation, None) => return Err(ProtocolError::UnexpectedContinuation),
                (OpCode::Text | OpCode::Binary, Some(_)) => {
                    return Err(ProtocolError::InterleavedMessage)
                }
                _ => {}
            }
        }

        self.fin = fin;
        self.opcode = opcode;
        self.masked = masked;

        match len7 {
            126 => {
                self.ext_len_bytes = 2;
                self.stage = Stage::ExtendedLength;
                Ok(())
            }
            127 => {
                self.ext_len_bytes = 8;
                self.stage = Stage::ExtendedLength;
                Ok(())
            }
            n => self.set_frame_len(u64::from(n)),
        }
    }

    fn parse_extended_length(&mut self) -> Result<(), ProtocolError> {
        let len = if self.ext_len_bytes == 2 {
            u64::from(u16::from_be_bytes([self.scratch[0], self.scratch[1]]))
        } else {
            u64::from_be_bytes(self.scratch)
        };
        self.step = 0;

        // The most significant bit of a 64-bit length must be zero.
        if len > i64::MAX as u64 {
            return Err(ProtocolError::BodyTooLarge {
                declared: len,
                limit: i64::MAX as u64,
            });
        }
        self.set_frame_len(len)
    }

    fn set_frame_len(&mut self, len: u64) -> Result<(), ProtocolError> {
        if !self.opcode.is_control() {
            if let Some(limit) = self.max_message_len {
                let total = self.continuation.len() as u64 + len;
                if total > limit {
                    return Err(ProtocolError::BodyTooLarge { declared: total, limit });
                }
            }
        }

        self.frame_len = len;
        self.frame.clear();
        self.stage = if self.masked { Stage::MaskKey } else { Stage::Payload };
        Ok(())
    }

    /// Reads the next payload chunk; true once the frame payload is complete.
    fn read_payload<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<bool, ProtocolError> {
        let want = self.frame_len as usize;
        let filled = self.frame.len();
        if filled == want {
            return Ok(true);
        }

        let chunk = (want - filled).min(READ_CHUNK);
        self.frame.resize(filled + chunk, 0);
        let n = match read_with_carry(&mut self.carry, &mut self.carry_pos, src, &mut self.frame[filled..]) {
            Ok(n) => n,
            Err(e) => {
                self.frame.truncate(filled);
                return Err(e.into());
            }
        };
        self.frame.truncate(filled + n);
        if n == 0 {
            return Err(ProtocolError::Eof);
        }

        if self.masked {
            for (i, byte) in self.frame[filled..].iter_mut().enumerate() {
                *byte ^= self.mask[(filled + i) % 4];
            }
        }

        Ok(self.frame.len() == want)
    }

    fn finish_frame(&mut self) -> Result<Option<WsEvent>, ProtocolError> {
        self.stage = Stage::Header;
        self.step = 0;
        let payload = std::mem::take(&mut self.frame);

        match self.opcode {
            OpCode::Close => {
                let (code, reason) = parse_close_payload(&payload)?;
                Ok(Some(WsEvent::Close { code, reason }))
            }
            OpCode::Ping => Ok(Some(WsEvent::Ping(payload))),
            OpCode::Pong => Ok(Some(WsEvent::Pong(payload))),
            data => {
                if data != OpCode::Continuation {
                    self.message_mode = Some(data);
                }
                if self.continuation.is_empty() {
                    self.continuation = payload;
                } else {
                    self.continuation.extend_from_slice(&payload);
                }

                if !self.fin {
                    return Ok(None);
                }

                let mode = self.message_mode.take().unwrap_or(OpCode::Binary);
                let body = std::mem::take(&mut self.continuation);
                if mode == OpCode::Text && std::str::from_utf8(&body).is_err() {
                    return Err(ProtocolError::InvalidUtf8);
                }

                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1);
                Ok(Some(WsEvent::Message(Message::websocket(id, mode, body))))
            }
        }
    }
}

/// Serves `dst` from the carried-over handshake bytes first, then from `src`.
fn read_with_carry<R: Read + ?Sized>(
    carry: &mut Vec<u8>,
    carry_pos: &mut usize,
    src: &mut R,
    dst: &mut [u8],
) -> io::Result<usize> {
    if *carry_pos < carry.len() {
        let n = dst.len().min(carry.len() - *carry_pos);
        dst[..n].copy_from_slice(&carry[*carry_pos..*carry_pos + n]);
        *carry_pos += n;
        if *carry_pos == carry.len() {
            carry.clear();
            *carry_pos = 0;
        }
        return Ok(n);
    }
    src.read(dst)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
