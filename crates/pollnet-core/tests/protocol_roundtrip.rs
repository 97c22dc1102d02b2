//! Integration tests for the pollnet-core codecs.
//!
//! These tests drive the public API only: frames are packed with a
//! [`Packer`], served through a reader that hands out a few bytes at a time
//! (the way a non-blocking socket does), and decoded with the resumable
//! decoders.

use std::io::{self, Read};

use pollnet_core::websocket::frame::{encode_close_payload, parse_close_payload};
use pollnet_core::{
    decode_datagram, encode_frame, DataPacker, FrameDecoder, Message, OpCode, PacketDecoder,
    Packer, ProtocolError, WsEvent, HEADER_LEN,
};

/// A non-blocking-socket stand-in: at most `chunk` bytes per read, then
/// `WouldBlock` once the data runs out.
struct Trickle {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl Trickle {
    fn new(data: Vec<u8>, chunk: usize) -> Self {
        Self { data, pos: 0, chunk }
    }
}

impl Read for Trickle {
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

fn decode_stream(packer: &dyn Packer, stream: Vec<u8>, chunk: usize) -> Vec<Message> {
    let mut src = Trickle::new(stream, chunk);
    let mut decoder = PacketDecoder::new();
    let mut out = Vec::new();
    loop {
        match decoder.decode(packer, &mut src) {
            Ok(Some(msg)) => out.push(msg),
            Ok(None) => {}
            Err(e) if e.is_would_block() => return out,
            Err(e) => panic!("decode failed: {e}"),
        }
    }
}

#[test]
fn test_packet_roundtrip_across_payload_sizes() {
    let packer = DataPacker::new();

    for len in [0usize, 1, 125, 126, 65535, 65536] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let frame = packer.pack(len as u32, &payload).expect("pack must succeed");

        let header = packer.unpack(&frame[..HEADER_LEN]).expect("unpack must succeed");
        assert_eq!(header.len as usize, len);

        let msgs = decode_stream(&packer, frame, 1500);
        assert_eq!(msgs, vec![Message::new(len as u32, payload)], "payload length {len}");
    }
}

#[test]
fn test_packet_roundtrip_100_mib_payload() {
    let packer = DataPacker::new();
    let payload = vec![0xC7u8; 100 * 1024 * 1024];
    let frame = packer.pack(1, &payload).expect("pack must succeed");

    let msgs = decode_stream(&packer, frame, 256 * 1024);

    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].len(), payload.len());
    assert!(msgs[0].payload() == payload.as_slice());
}

#[test]
fn test_one_byte_reads_decode_same_messages_as_one_read() {
    let packer = DataPacker::new();
    let mut stream = Vec::new();
    for id in 0..20u32 {
        stream.extend(packer.pack(id, &vec![id as u8; id as usize * 7]).unwrap());
    }

    let bulk = decode_stream(&packer, stream.clone(), usize::MAX);
    let trickled = decode_stream(&packer, stream, 1);

    assert_eq!(bulk.len(), 20);
    assert_eq!(bulk, trickled);
}

#[test]
fn test_oversized_body_is_rejected_at_header() {
    let limited = DataPacker::with_max_body_length(1024);
    let frame = DataPacker::new().pack(1, &vec![0u8; 4096]).unwrap();
    let mut src = Trickle::new(frame, usize::MAX);

    let err = PacketDecoder::new().decode(&limited, &mut src).unwrap_err();

    assert!(matches!(err, ProtocolError::BodyTooLarge { declared: 4096, limit: 1024 }));
    assert_eq!(src.pos, HEADER_LEN, "no payload byte may be consumed");
}

#[test]
fn test_datagram_decode_matches_stream_decode() {
    let packer = DataPacker::new();
    let frame = packer.pack(12, b"datagram").unwrap();

    let from_datagram = decode_datagram(&packer, &frame).unwrap();
    let from_stream = decode_stream(&packer, frame, usize::MAX);

    assert_eq!(vec![from_datagram], from_stream);
}

// ── WebSocket ─────────────────────────────────────────────────────────────────

/// Masks a server-style frame so it looks like it came from a client.
fn mask_frame(frame: Vec<u8>, mask: [u8; 4]) -> Vec<u8> {
    let len7 = frame[1] & 0x7F;
    let header_len = match len7 {
        126 => 4,
        127 => 10,
        _ => 2,
    };
    let mut out = frame[..header_len].to_vec();
    out[1] |= 0x80;
    out.extend_from_slice(&mask);
    out.extend(
        frame[header_len..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 4]),
    );
    out
}

fn decode_ws(stream: Vec<u8>, chunk: usize) -> Result<Vec<WsEvent>, ProtocolError> {
    let mut src = Trickle::new(stream, chunk);
    let mut decoder = FrameDecoder::new();
    let mut out = Vec::new();
    loop {
        match decoder.decode(&mut src) {
            Ok(Some(ev)) => out.push(ev),
            Ok(None) => {}
            Err(e) if e.is_would_block() => return Ok(out),
            Err(e) => return Err(e),
        }
    }
}

#[test]
fn test_ws_server_encoded_frames_decode_after_masking() {
    let mask = [1, 2, 3, 4];
    for len in [0usize, 1, 125, 126, 65535, 65536] {
        let payload = vec![b'z'; len];
        let frame = mask_frame(encode_frame(true, OpCode::Text, &payload), mask);

        let events = decode_ws(frame, 997).unwrap();

        assert_eq!(
            events,
            vec![WsEvent::Message(Message::websocket(0, OpCode::Text, payload))],
            "payload length {len}"
        );
    }
}

#[test]
fn test_ws_text_split_into_many_continuations() {
    let text = "fragmented ✓ message across frames";
    let bytes = text.as_bytes();
    let mut stream = mask_frame(encode_frame(false, OpCode::Text, &bytes[..4]), [9, 8, 7, 6]);
    for chunk in bytes[4..bytes.len() - 3].chunks(5) {
        stream.extend(mask_frame(encode_frame(false, OpCode::Continuation, chunk), [5, 5, 5, 5]));
    }
    stream.extend(mask_frame(
        encode_frame(true, OpCode::Continuation, &bytes[bytes.len() - 3..]),
        [0, 1, 0, 1],
    ));

    let events = decode_ws(stream, 1).unwrap();

    match events.as_slice() {
        [WsEvent::Message(msg)] => assert_eq!(msg.text(), Some(text)),
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn test_ws_close_payload_survives_framing() {
    let payload = encode_close_payload(4001, "auth expired");
    let frame = mask_frame(encode_frame(true, OpCode::Close, &payload), [3, 3, 3, 3]);

    let events = decode_ws(frame, 3).unwrap();

    assert_eq!(
        events,
        vec![WsEvent::Close {
            code: Some(4001),
            reason: "auth expired".into()
        }]
    );
    assert_eq!(parse_close_payload(&payload).unwrap().0, Some(4001));
}
