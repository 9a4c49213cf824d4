//! The closed error taxonomy shared by every crate in this workspace.
//!
//! Every fallible operation in `pt-packet`, `pt-query`, `pt-image` and
//! `pt-insn` returns a [`Result<T, ErrorKind>`] (or a status-flags-carrying
//! variant of one). Mirrors `enum pt_error_code` in
//! `original_source/libipt/include/intel-pt.h`: a fixed, non-extensible
//! set of kinds rather than a per-crate error type, since callers need to
//! match on the *kind* of failure (e.g. to decide whether `sync_forward`
//! can recover) regardless of which layer raised it.
#![no_std]

use core as std; // workaround so thiserror's derive resolves `std::error::Error` to `core::error::Error`

use thiserror::Error;

/// A decode/query/image/instruction-flow error kind.
///
/// `internal` always indicates a bug: an invariant this crate is
/// supposed to uphold was violated. Every other kind is a normal,
/// recoverable-by-the-caller outcome.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Internal invariant violation. Always a bug.
    #[error("{}", errstr(*self))]
    Internal,
    /// Invalid argument.
    #[error("{}", errstr(*self))]
    Invalid,
    /// Decoder is out of sync (no valid PSB found yet).
    #[error("{}", errstr(*self))]
    NoSync,
    /// Unknown opcode.
    #[error("{}", errstr(*self))]
    BadOpc,
    /// Opcode recognized, payload malformed.
    #[error("{}", errstr(*self))]
    BadPacket,
    /// Packet arrived in a context where it is not allowed.
    #[error("{}", errstr(*self))]
    BadContext,
    /// Reached the end of the trace buffer.
    #[error("{}", errstr(*self))]
    Eos,
    /// No packet matching the requested query could be found.
    #[error("{}", errstr(*self))]
    BadQuery,
    /// Out of memory.
    #[error("{}", errstr(*self))]
    NoMem,
    /// Bad configuration.
    #[error("{}", errstr(*self))]
    BadConfig,
    /// There is no IP.
    #[error("{}", errstr(*self))]
    NoIp,
    /// The IP has been suppressed.
    #[error("{}", errstr(*self))]
    IpSuppressed,
    /// No memory mapped at the requested address.
    #[error("{}", errstr(*self))]
    NoMap,
    /// An instruction could not be decoded.
    #[error("{}", errstr(*self))]
    BadInsn,
    /// No timing information available.
    #[error("{}", errstr(*self))]
    NoTime,
    /// No core:bus ratio available.
    #[error("{}", errstr(*self))]
    NoCbr,
    /// Bad traced image (overlap, or the backing file was mutated).
    #[error("{}", errstr(*self))]
    BadImage,
    /// A locking error.
    #[error("{}", errstr(*self))]
    BadLock,
    /// The requested feature is not supported.
    #[error("{}", errstr(*self))]
    NotSupported,
}

/// A human-readable message for an [`ErrorKind`], mirroring `pt_errstr`.
#[must_use]
pub fn errstr(kind: ErrorKind) -> &'static str {
    use ErrorKind::{
        BadConfig, BadContext, BadImage, BadInsn, BadLock, BadOpc, BadPacket, BadQuery, Eos,
        Internal, Invalid, IpSuppressed, NoCbr, NoIp, NoMap, NoMem, NoSync, NoTime, NotSupported,
    };
    match kind {
        Internal => "internal decoder error",
        Invalid => "invalid argument",
        NoSync => "decoder out of sync",
        BadOpc => "unknown opcode",
        BadPacket => "unknown payload",
        BadContext => "unexpected packet context",
        Eos => "reached end of trace stream",
        BadQuery => "no packet matching the query could be found",
        NoMem => "decoder out of memory",
        BadConfig => "bad configuration",
        NoIp => "there is no IP",
        IpSuppressed => "the IP has been suppressed",
        NoMap => "no memory mapped at the requested address",
        BadInsn => "an instruction could not be decoded",
        NoTime => "no timing information is available",
        NoCbr => "no core:bus ratio available",
        BadImage => "bad traced image",
        BadLock => "a locking error occurred",
        NotSupported => "the requested feature is not supported",
    }
}

/// Result alias used throughout the workspace.
pub type PtResult<T> = core::result::Result<T, ErrorKind>;

bitflags::bitflags! {
    /// Status flags returned alongside a non-negative query/decode result,
    /// mirroring `enum pt_status_flag`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u8 {
        /// A queued event would be released by the next packet boundary.
        const EVENT_PENDING = 1 << 0;
        /// The IP carried by this result has been suppressed.
        const IP_SUPPRESSED = 1 << 1;
        /// There is no more trace data available.
        const EOS = 1 << 2;
    }
}
