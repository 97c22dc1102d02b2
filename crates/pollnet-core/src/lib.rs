//! # pollnet-core
//!
//! Wire-level building blocks shared by the pollnet server engine.
//!
//! This crate has zero dependencies on OS APIs, threads, or sockets.  Every
//! decoder reads from any [`std::io::Read`] source, so the same state machines
//! are driven by a raw non-blocking descriptor in production and by an
//! in-memory chunked reader in tests.
//!
//! # Architecture overview (for beginners)
//!
//! A non-blocking socket may hand you any number of bytes per read: half a
//! header, three frames and a bit, or nothing at all (`WouldBlock`).  The
//! decoders in this crate therefore never assume a frame arrives in one piece.
//! They remember how far they got and resume on the next call.
//!
//! - **`protocol`** – the binary length-prefixed packet format:
//!   `[len:u32 LE][msg_id:u32 LE][payload]`, the [`Packer`] trait that lets an
//!   application swap in its own header layout, and the resumable
//!   [`PacketDecoder`].
//!
//! - **`websocket`** – RFC 6455: the HTTP upgrade handshake, frame encoding,
//!   and a resumable [`FrameDecoder`] that reassembles fragmented messages and
//!   surfaces control frames.
//!
//! - **`error`** – [`ProtocolError`], the single error taxonomy both layers
//!   report through.

pub mod error;
pub mod protocol;
pub mod websocket;

pub use error::ProtocolError;
pub use protocol::decoder::PacketDecoder;
pub use protocol::message::Message;
pub use protocol::packet::{decode_datagram, DataPacker, PacketHeader, Packer, HEADER_LEN};
pub use websocket::decoder::{FrameDecoder, WsEvent};
pub use websocket::frame::{close_code, encode_frame, OpCode};
pub use websocket::handshake::{accept_key, HandshakeBuffer, HandshakeRequest, QueryParams};
