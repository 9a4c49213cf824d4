//! Packet-level codec for the Intel Processor Trace wire format.
//!
//! This crate only knows how to turn bytes into [`Packet`] values and
//! back; it carries no notion of IP accumulation, TNT queuing, or
//! event semantics (see `pt-query` for that). Grounded in
//! `iptr-decoder`, generalized from its push-style `HandlePacket`
//! callback into the pull-style `Cursor::decode_next` this workspace's
//! higher layers drive directly.
#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

mod error;
mod iter;
mod opcode;
mod packet;
mod sync;
mod tnt;

pub use error::{DecodeCallback, ErrorKind, PtResult};
pub use iter::PacketIterator;
pub use packet::{
    IpCompression, IpPacket, ModeExecPacket, ModeTsxPacket, Packet, TntPacket,
};
pub use sync::{Cursor, Encoder};
