//! WebSocket frame layout and server-side encoding.
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| payload len |    extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 / 64 bits)        |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |  masking key (client frames only, 4 bytes)  |   payload ...   |
//! +---------------------------------------------+-----------------+
//! ```
//!
//! Servers never mask, so [`encode_frame`] only picks the length encoding:
//! 7 bits up to 125, `126` + 16-bit big-endian up to 65535, `127` + 64-bit
//! big-endian beyond.

use crate::error::ProtocolError;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcodes defined by RFC 6455.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Control frames (close, ping, pong) have the high opcode bit set.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Close status codes (RFC 6455 §7.4.1).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Whether `code` may appear on the wire.
    ///
    /// 1005, 1006 and 1015 are reserved for local reporting; 3000-4999 belong
    /// to libraries and applications.
    pub fn is_valid(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

/// Encodes one unmasked frame.
///
/// # Examples
///
/// ```rust
/// use pollnet_core::{encode_frame, OpCode};
///
/// let frame = encode_frame(true, OpCode::Text, b"hi");
/// assert_eq!(frame, vec![0x81, 0x02, b'h', b'i']);
/// ```
pub fn encode_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut buf = Vec::with_capacity(len + 10);

    let fin_bit = if fin { 0x80 } else { 0x00 };
    buf.push(fin_bit | opcode as u8);

    if len <= 125 {
        buf.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.push(126);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(127);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }

    buf.extend_from_slice(payload);
    buf
}

/// Builds a CLOSE payload: 2-byte big-endian code followed by a UTF-8 reason.
///
/// The reason is truncated on a character boundary so the payload stays
/// within the 125-byte control frame limit.
pub fn encode_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut buf = Vec::with_capacity(2 + end);
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&reason.as_bytes()[..end]);
    buf
}

/// Parses a CLOSE payload into `(code, reason)`.
///
/// An empty payload is legal and carries no code.
///
/// # Errors
///
/// [`ProtocolError::InvalidClose`] for a 1-byte payload or a code that may
/// not appear on the wire, [`ProtocolError::InvalidUtf8`] for a bad reason.
pub fn parse_close_payload(payload: &[u8]) -> Result<(Option<u16>, String), ProtocolError> {
    match payload.len() {
        0 => Ok((None, String::new())),
        1 => Err(ProtocolError::InvalidClose("1-byte payload".into())),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !close_code::is_valid(code) {
                return Err(ProtocolError::InvalidClose(format!("status code {code}")));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_owned();
            Ok((Some(code), reason))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_try_from_known_values() {
        assert_eq!(OpCode::try_from(0x1).unwrap(), OpCode::Text);
        assert_eq!(OpCode::try_from(0xA).unwrap(), OpCode::Pong);
    }

    #[test]
    fn test_opcode_try_from_reserved_value_is_error() {
        for value in [0x3, 0x7, 0xB, 0xF] {
            assert!(matches!(
                OpCode::try_from(value),
                Err(ProtocolError::UnknownOpcode(v)) if v == value
            ));
        }
    }

    #[test]
    fn test_is_control() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(!OpCode::Continuation.is_control());
    }

    #[test]
    fn test_encode_frame_length_boundaries() {
        // (payload length, expected header length)
        let cases = [(0usize, 2usize), (1, 2), (125, 2), (126, 4), (65535, 4), (65536, 10)];

        for (len, header_len) in cases {
            let frame = encode_frame(true, OpCode::Binary, &vec![0u8; len]);
            assert_eq!(frame.len(), header_len + len, "payload length {len}");
        }
    }

    #[test]
    fn test_encode_frame_extended_16_bit_length() {
        let frame = encode_frame(true, OpCode::Binary, &[0u8; 300]);
        assert_eq!(&frame[..4], &[0x82, 126, 0x01, 0x2C]);
    }

    #[test]
    fn test_encode_frame_extended_64_bit_length() {
        let frame = encode_frame(false, OpCode::Text, &vec![0u8; 65536]);
        assert_eq!(frame[0], 0x01);
        assert_eq!(frame[1], 127);
        assert_eq!(&frame[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn test_close_payload_roundtrip() {
        let payload = encode_close_payload(close_code::GOING_AWAY, "bye");
        assert_eq!(&payload[..2], &[0x03, 0xE9]);

        let (code, reason) = parse_close_payload(&payload).unwrap();

        assert_eq!(code, Some(1001));
        assert_eq!(reason, "bye");
    }

    #[test]
    fn test_close_payload_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);

        let payload = encode_close_payload(close_code::NORMAL, &reason);

        assert!(payload.len() <= MAX_CONTROL_PAYLOAD);
        assert!(std::str::from_utf8(&payload[2..]).is_ok());
    }

    #[test]
    fn test_parse_close_empty_payload() {
        assert_eq!(parse_close_payload(&[]).unwrap(), (None, String::new()));
    }

    #[test]
    fn test_parse_close_one_byte_is_error() {
        assert!(matches!(
            parse_close_payload(&[0x03]),
            Err(ProtocolError::InvalidClose(_))
        ));
    }

    #[test]
    fn test_parse_close_reserved_code_is_error() {
        let payload = encode_close_payload(1005, "");
        assert!(parse_close_payload(&payload).is_err());
    }

    #[test]
    fn test_parse_close_invalid_utf8_reason() {
        assert!(matches!(
            parse_close_payload(&[0x03, 0xE8, 0xFF]),
            Err(ProtocolError::InvalidUtf8)
        ));
    }
}
