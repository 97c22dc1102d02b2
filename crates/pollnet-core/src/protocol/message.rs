//! The unit of work handed from a connection's decoder to the dispatcher.

use crate::websocket::frame::OpCode;

/// A completed, fully buffered application message.
///
/// Framed TCP/UDP messages carry the id from the packet header.  WebSocket
/// messages carry a per-connection sequence number as their id plus the
/// opcode of the first frame (TEXT or BINARY).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    payload: Vec<u8>,
    opcode: Option<OpCode>,
}

impl Message {
    /// Builds a framed (non-WebSocket) message.
    pub fn new(id: u32, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            opcode: None,
        }
    }

    /// Builds a WebSocket data message.
    pub fn websocket(id: u32, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            opcode: Some(opcode),
        }
    }

    /// Message id (routing key for framed messages).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// WebSocket opcode, `None` for framed messages.
    pub fn opcode(&self) -> Option<OpCode> {
        self.opcode
    }

    pub fn is_websocket(&self) -> bool {
        self.opcode.is_some()
    }

    pub fn is_text(&self) -> bool {
        self.opcode == Some(OpCode::Text)
    }

    /// The payload as UTF-8 for TEXT messages.
    ///
    /// The WebSocket decoder validates TEXT payloads before surfacing them,
    /// so this only returns `None` for non-TEXT messages.
    pub fn text(&self) -> Option<&str> {
        if self.is_text() {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }
}
