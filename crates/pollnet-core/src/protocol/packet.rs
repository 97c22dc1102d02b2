//! Binary packet framing.
//!
//! Wire format:
//! ```text
//! [len:4][msg_id:4][payload:len]
//! ```
//! Total header size: 8 bytes. Both integers are little-endian.
//!
//! The header is parsed on its own because the payload of a large frame may
//! still be in flight when the header arrives.  A body limit is enforced at
//! header-decode time, so a corrupt or hostile length is rejected before a
//! single payload byte is buffered.

use crate::error::ProtocolError;
use crate::protocol::message::Message;

/// Size of the default header in bytes.
pub const HEADER_LEN: usize = 8;

/// Fields parsed from a packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length in bytes (header excluded).
    pub len: u32,
    /// Application message id.
    pub id: u32,
}

/// A packet codec.
///
/// Implement this to use a different header layout; the server takes any
/// `Packer` through its builder.  Implementations must be stateless: one
/// instance is shared by every connection.
pub trait Packer: Send + Sync {
    /// Fixed header size in bytes.
    fn header_len(&self) -> usize;

    /// Encodes `payload` under message id `id` into one wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BodyTooLarge`] when the payload length cannot
    /// be represented in the header.
    fn pack(&self, id: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError>;

    /// Parses exactly [`header_len`](Packer::header_len) bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ShortHeader`] if `header` is too short and
    /// [`ProtocolError::BodyTooLarge`] if the declared length is over the limit.
    fn unpack(&self, header: &[u8]) -> Result<PacketHeader, ProtocolError>;

    /// Largest accepted payload, `None` for unlimited.
    fn max_body_length(&self) -> Option<u32>;
}

/// The default 8-byte little-endian packer.
///
/// # Examples
///
/// ```rust
/// use pollnet_core::{DataPacker, Packer};
///
/// let packer = DataPacker::default();
/// let frame = packer.pack(3, b"hi").unwrap();
/// let header = packer.unpack(&frame[..8]).unwrap();
/// assert_eq!((header.id, header.len), (3, 2));
/// assert_eq!(&frame[8..], b"hi");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataPacker {
    max_body_length: Option<u32>,
}

impl DataPacker {
    /// Creates a packer with no body limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a packer rejecting bodies longer than `limit` bytes.
    ///
    /// A limit of zero means unlimited, matching the configuration file.
    pub fn with_max_body_length(limit: u32) -> Self {
        Self {
            max_body_length: (limit > 0).then_some(limit),
        }
    }
}

impl Packer for DataPacker {
    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn pack(&self, id: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::BodyTooLarge {
            declared: payload.len() as u64,
            limit: u64::from(u32::MAX),
        })?;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    fn unpack(&self, header: &[u8]) -> Result<PacketHeader, ProtocolError> {
        if header.len() < HEADER_LEN {
            return Err(ProtocolError::ShortHeader {
                needed: HEADER_LEN,
                available: header.len(),
            });
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if let Some(limit) = self.max_body_length {
            if len > limit {
                return Err(ProtocolError::BodyTooLarge {
                    declared: u64::from(len),
                    limit: u64::from(limit),
                });
            }
        }

        Ok(PacketHeader { len, id })
    }

    fn max_body_length(&self) -> Option<u32> {
        self.max_body_length
    }
}

/// Decodes one complete datagram (header and payload in a single buffer).
///
/// Unlike the stream decoder there is nothing to resume: a datagram shorter
/// than the header, or whose payload length disagrees with the header, is
/// rejected outright.
///
/// # Errors
///
/// [`ProtocolError::ShortHeader`], [`ProtocolError::LengthMismatch`], or any
/// error from [`Packer::unpack`].
pub fn decode_datagram(packer: &dyn Packer, datagram: &[u8]) -> Result<Message, ProtocolError> {
    let header_len = packer.header_len();
    if datagram.len() < header_len {
        return Err(ProtocolError::ShortHeader {
            needed: header_len,
            available: datagram.len(),
        });
    }

    let header = packer.unpack(&datagram[..header_len])?;
    let body = &datagram[header_len..];
    if body.len() != header.len as usize {
        return Err(ProtocolError::LengthMismatch {
            declared: header.len as usize,
            actual: body.len(),
        });
    }

    Ok(Message::new(header.id, body.to_vec()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_writes_little_endian_header() {
        // Arrange
        let packer = DataPacker::new();

        // Act
        let frame = packer.pack(0x0102_0304, b"xyz").unwrap();

        // Assert
        assert_eq!(&frame[..4], &[3, 0, 0, 0]);
        assert_eq!(&frame[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&frame[8..], b"xyz");
    }

    #[test]
    fn test_pack_empty_payload_is_header_only() {
        let frame = DataPacker::new().pack(9, &[]).unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
    }

    #[test]
    fn test_unpack_reads_header_fields() {
        let packer = DataPacker::new();
        let frame = packer.pack(42, &[0u8; 300]).unwrap();

        let header = packer.unpack(&frame[..HEADER_LEN]).unwrap();

        assert_eq!(header, PacketHeader { len: 300, id: 42 });
    }

    #[test]
    fn test_unpack_short_header_is_error() {
        let err = DataPacker::new().unpack(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortHeader {
                needed: 8,
                available: 3
            }
        ));
    }

    #[test]
    fn test_unpack_rejects_body_over_limit() {
        // Arrange: header declares 1 MiB, limit is 1 KiB
        let packer = DataPacker::with_max_body_length(1024);
        let mut header = Vec::new();
        header.extend_from_slice(&(1024u32 * 1024).to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());

        // Act
        let err = packer.unpack(&header).unwrap_err();

        // Assert
        assert!(matches!(
            err,
            ProtocolError::BodyTooLarge {
                declared: 1_048_576,
                limit: 1024
            }
        ));
    }

    #[test]
    fn test_unpack_accepts_body_at_limit() {
        let packer = DataPacker::with_max_body_length(16);
        let frame = DataPacker::new().pack(1, &[0u8; 16]).unwrap();
        assert!(packer.unpack(&frame[..HEADER_LEN]).is_ok());
    }

    #[test]
    fn test_zero_limit_means_unlimited() {
        assert_eq!(DataPacker::with_max_body_length(0).max_body_length(), None);
    }

    #[test]
    fn test_decode_datagram_roundtrip() {
        let packer = DataPacker::new();
        let frame = packer.pack(5, b"ping").unwrap();

        let msg = decode_datagram(&packer, &frame).unwrap();

        assert_eq!(msg.id(), 5);
        assert_eq!(msg.payload(), b"ping");
    }

    #[test]
    fn test_decode_datagram_shorter_than_header() {
        let err = decode_datagram(&DataPacker::new(), &[0u8; 5]).unwrap_err();
        assert!(matches!(err, ProtocolError::ShortHeader { .. }));
    }

    #[test]
    fn test_decode_datagram_length_disagrees_with_header() {
        let packer = DataPacker::new();
        let mut frame = packer.pack(5, b"ping").unwrap();
        frame.push(b'!');

        let err = decode_datagram(&packer, &frame).unwrap_err();

        assert!(matches!(
            err,
            ProtocolError::LengthMismatch {
                declared: 4,
                actual: 5
            }
        ));
    }
}
