//! Length-prefixed packet protocol.
//!
//! - [`packet`] – header layout, the [`Packer`](packet::Packer) trait and the
//!   default [`DataPacker`](packet::DataPacker).
//! - [`decoder`] – resumable stream decoder built on any `Packer`.
//! - [`message`] – the completed [`Message`](message::Message) handed to
//!   application code.

pub mod decoder;
pub mod message;
pub mod packet;

pub use decoder::PacketDecoder;
pub use message::Message;
pub use packet::{decode_datagram, DataPacker, PacketHeader, Packer, HEADER_LEN};
