//! RFC 6455 WebSocket support.
//!
//! - [`handshake`] – HTTP/1.1 upgrade parsing, accept key, 101 response.
//! - [`frame`] – opcodes, close codes, server-side frame encoding.
//! - [`decoder`] – resumable frame decoder and message reassembly.

pub mod decoder;
pub mod frame;
pub mod handshake;

pub use decoder::{FrameDecoder, WsEvent};
pub use frame::{close_code, encode_close_payload, encode_frame, parse_close_payload, OpCode};
pub use handshake::{accept_key, HandshakeBuffer, HandshakeRequest, QueryParams};
