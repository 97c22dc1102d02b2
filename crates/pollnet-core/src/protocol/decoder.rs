//! Resumable stream decoder for length-prefixed packets.
//!
//! A [`PacketDecoder`] lives inside one connection for its whole lifetime.
//! Each call to [`PacketDecoder::decode`] performs at most one read and
//! returns:
//!
//! - `Ok(Some(msg))` – a frame completed,
//! - `Ok(None)` – bytes arrived but the frame is not complete yet,
//! - `Err(e)` with `e.is_would_block()` – nothing to read right now,
//! - any other `Err` – the connection must be closed.
//!
//! Progress (header bytes, declared length, payload so far) is kept between
//! calls, so a frame delivered in any number of chunks, down to one byte per
//! read, decodes to the same message as a frame delivered in one read.

use std::io::Read;

use crate::error::ProtocolError;
use crate::protocol::message::Message;
use crate::protocol::packet::{PacketHeader, Packer};

/// Payload buffers grow by at most this much per read so a large (but legal)
/// declared length does not allocate its full size before the bytes arrive.
const READ_CHUNK: usize = 64 * 1024;

/// Per-connection decode state for the packet protocol.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    header: Vec<u8>,
    header_filled: usize,
    pending: Option<PacketHeader>,
    body: Vec<u8>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when part of a frame has been consumed.
    pub fn is_mid_frame(&self) -> bool {
        self.header_filled > 0 || self.pending.is_some()
    }

    /// Performs one read from `src` and advances the frame in progress.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Eof`] when `src` reports end of stream, header errors
    /// from `packer`, or the read error itself (check
    /// [`ProtocolError::is_would_block`]).
    pub fn decode<R: Read + ?Sized>(
        &mut self,
        packer: &dyn Packer,
        src: &mut R,
    ) -> Result<Option<Message>, ProtocolError> {
        let header = match self.pending {
            Some(header) => header,
            None => match self.read_header(packer, src)? {
                Some(header) => header,
                None => return Ok(None),
            },
        };

        // A zero-length body completes with the header.
        if header.len == 0 {
            return Ok(Some(self.finish(header)));
        }

        let want = header.len as usize;
        let filled = self.body.len();
        let chunk = (want - filled).min(READ_CHUNK);

        self.body.resize(filled + chunk, 0);
        let n = match src.read(&mut self.body[filled..]) {
            Ok(n) => n,
            Err(e) => {
                self.body.truncate(filled);
                return Err(e.into());
            }
        };
        self.body.truncate(filled + n);
        if n == 0 {
            return Err(ProtocolError::Eof);
        }

        if self.body.len() == want {
            Ok(Some(self.finish(header)))
        } else {
            Ok(None)
        }
    }

    fn read_header<R: Read + ?Sized>(
        &mut self,
        packer: &dyn Packer,
        src: &mut R,
    ) -> Result<Option<PacketHeader>, ProtocolError> {
        let header_len = packer.header_len();
        if self.header.len() != header_len {
            self.header.resize(header_len, 0);
        }

        let n = src.read(&mut self.header[self.header_filled..])?;
        if n == 0 {
            return Err(ProtocolError::Eof);
        }
        self.header_filled += n;
        if self.header_filled < header_len {
            return Ok(None);
        }

        // The body limit is checked here, before any payload is buffered.
        let header = packer.unpack(&self.header)?;
        self.header_filled = 0;
        self.pending = Some(header);
        Ok(Some(header))
    }

    fn finish(&mut self, header: PacketHeader) -> Message {
        self.pending = None;
        Message::new(header.id, std::mem::take(&mut self.body))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::protocol::packet::DataPacker;

    /// Hands out at most `chunk` bytes per read, then `WouldBlock` once drained.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl ChunkedReader {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self { data, pos: 0, chunk }
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn drain(decoder: &mut PacketDecoder, packer: &dyn Packer, src: &mut ChunkedReader) -> Vec<Message> {
        let mut out = Vec::new();
        loop {
            match decoder.decode(packer, src) {
                Ok(Some(msg)) => out.push(msg),
                Ok(None) => {}
                Err(e) if e.is_would_block() => return out,
                Err(e) => panic!("unexpected decode error: {e}"),
            }
        }
    }

    #[test]
    fn test_decode_whole_frame_in_one_read() {
        // Arrange
        let packer = DataPacker::new();
        let frame = packer.pack(11, b"hello").unwrap();
        let mut src = ChunkedReader::new(frame, usize::MAX);
        let mut decoder = PacketDecoder::new();

        // Act
        let msgs = drain(&mut decoder, &packer, &mut src);

        // Assert
        assert_eq!(msgs, vec![Message::new(11, b"hello".to_vec())]);
    }

    #[test]
    fn test_decode_one_byte_chunks_matches_single_read() {
        let packer = DataPacker::new();
        let payload: Vec<u8> = (0..=255).collect();
        let frame = packer.pack(77, &payload).unwrap();
        let mut src = ChunkedReader::new(frame, 1);
        let mut decoder = PacketDecoder::new();

        let msgs = drain(&mut decoder, &packer, &mut src);

        assert_eq!(msgs, vec![Message::new(77, payload)]);
    }

    #[test]
    fn test_decode_back_to_back_frames_in_order() {
        let packer = DataPacker::new();
        let mut stream = packer.pack(1, b"a").unwrap();
        stream.extend(packer.pack(2, b"").unwrap());
        stream.extend(packer.pack(3, b"ccc").unwrap());
        let mut src = ChunkedReader::new(stream, 3);
        let mut decoder = PacketDecoder::new();

        let msgs = drain(&mut decoder, &packer, &mut src);

        let ids: Vec<u32> = msgs.iter().map(Message::id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(msgs[1].is_empty());
    }

    #[test]
    fn test_partial_header_is_kept_across_would_block() {
        // Arrange: only 5 header bytes available
        let packer = DataPacker::new();
        let frame = packer.pack(4, b"xyz").unwrap();
        let mut decoder = PacketDecoder::new();
        let mut first = ChunkedReader::new(frame[..5].to_vec(), usize::MAX);

        // Act
        assert!(drain(&mut decoder, &packer, &mut first).is_empty());
        assert!(decoder.is_mid_frame());
        let mut rest = ChunkedReader::new(frame[5..].to_vec(), usize::MAX);
        let msgs = drain(&mut decoder, &packer, &mut rest);

        // Assert
        assert_eq!(msgs, vec![Message::new(4, b"xyz".to_vec())]);
        assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn test_oversized_header_rejected_before_body_is_read() {
        // Arrange: header declares 100 bytes, limit 10, body bytes follow
        let packer = DataPacker::with_max_body_length(10);
        let frame = DataPacker::new().pack(1, &[7u8; 100]).unwrap();
        let mut src = ChunkedReader::new(frame, usize::MAX);
        let mut decoder = PacketDecoder::new();

        // Act
        let err = decoder.decode(&packer, &mut src).unwrap_err();

        // Assert: header consumed, body untouched, no buffer allocated
        assert!(matches!(err, ProtocolError::BodyTooLarge { declared: 100, limit: 10 }));
        assert_eq!(src.pos, 8);
        assert_eq!(decoder.body.capacity(), 0);
    }

    #[test]
    fn test_zero_byte_read_is_eof() {
        let packer = DataPacker::new();
        let mut decoder = PacketDecoder::new();
        let mut empty: &[u8] = &[];

        let err = decoder.decode(&packer, &mut empty).unwrap_err();

        assert!(matches!(err, ProtocolError::Eof));
    }

    #[test]
    fn test_eof_mid_body_is_eof() {
        let packer = DataPacker::new();
        let frame = packer.pack(1, b"abcdef").unwrap();
        let mut truncated: &[u8] = &frame[..10];
        let mut decoder = PacketDecoder::new();

        assert!(decoder.decode(&packer, &mut truncated).unwrap().is_none());
        let err = decoder.decode(&packer, &mut truncated).unwrap_err();

        assert!(matches!(err, ProtocolError::Eof));
    }

    #[test]
    fn test_large_body_grows_in_chunks() {
        let packer = DataPacker::new();
        let payload = vec![0xAB; READ_CHUNK * 3 + 17];
        let frame = packer.pack(9, &payload).unwrap();
        let mut src = ChunkedReader::new(frame, usize::MAX);
        let mut decoder = PacketDecoder::new();

        let msgs = drain(&mut decoder, &packer, &mut src);

        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload(), payload.as_slice());
    }
}
