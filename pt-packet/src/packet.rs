//! The [`Packet`] tagged union and its payload types.

use derive_more::Display;

/// IP compression scheme carried by a TIP/FUP-family packet.
///
/// This is a closed, 4-variant set (see `original_source/libipt`'s
/// `pt_ip_compression`): any other IP-bytes encoding on the wire is
/// a reserved combination and decodes as [`pt_error::ErrorKind::BadPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IpCompression {
    /// No payload. The IP has been suppressed.
    Suppressed,
    /// Payload: 16 bits, updates the low 16 bits of the last IP.
    Upd16,
    /// Payload: 32 bits, updates the low 32 bits of the last IP.
    Upd32,
    /// Payload: 48 bits, sign-extended to the full 64-bit address.
    Sext48,
}

/// A TIP/FUP-family IP payload.
///
/// `ip` is the raw, zero-extended payload as it appears on the wire;
/// combining it with the last IP is the IP accumulator's job
/// (see `pt-query`'s `LastIp::update`), not the codec's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPacket {
    pub ipc: IpCompression,
    pub ip: u64,
}

/// A TNT (short or long) payload.
///
/// `bit_count` is at most 47; `payload` holds the taken/not-taken bits
/// excluding the trailing stop bit, with bit 0 the oldest (first-to-pop)
/// outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TntPacket {
    pub bit_count: u8,
    pub payload: u64,
}

/// MODE.Exec payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeExecPacket {
    pub csl: bool,
    pub csd: bool,
}

/// MODE.TSX payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTsxPacket {
    pub intx: bool,
    pub abrt: bool,
}

/// An Intel PT packet.
///
/// This is a closed sum type over the packet kinds this workspace
/// understands (see spec §3); anything else is represented as
/// [`Packet::Unknown`] via the decode callback escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Pad,
    Ovf,
    Psb,
    PsbEnd,
    Tnt(TntPacket),
    Tip(IpPacket),
    Fup(IpPacket),
    TipPge(IpPacket),
    TipPgd(IpPacket),
    ModeExec(ModeExecPacket),
    ModeTsx(ModeTsxPacket),
    /// PIP. `cr3` is the 58-bit CR3 value with the low 5 bits cleared;
    /// `non_root` is the RSVD/NR bit (set inside a VMX non-root guest).
    Pip { cr3: u64, non_root: bool },
    /// TSC. The low 56 bits of the time stamp counter.
    Tsc(u64),
    /// CBR. Core:bus cycle ratio.
    Cbr(u8),
    /// A packet this codec does not know how to parse, recognized only
    /// through the caller's `decode_callback`.
    Unknown { len: u8, context: u64 },
}

impl Packet {
    /// The wire length of this packet, in bytes, ignoring any encoded
    /// `len` stored on a `size` field elsewhere (there is none: this
    /// codec always computes size itself, both on encode and here).
    #[must_use]
    pub fn size_on_wire(&self) -> u8 {
        match self {
            Packet::Pad => 1,
            Packet::Ovf | Packet::PsbEnd => 2,
            Packet::Psb => 16,
            Packet::Tnt(t) => {
                if fits_short_tnt(t.bit_count) {
                    1
                } else {
                    8
                }
            }
            Packet::Tip(ip) | Packet::Fup(ip) | Packet::TipPge(ip) | Packet::TipPgd(ip) => {
                1 + ip_payload_len(ip.ipc)
            }
            Packet::ModeExec(_) | Packet::ModeTsx(_) => 2,
            Packet::Pip { .. } => 8,
            Packet::Tsc(_) => 8,
            Packet::Cbr(_) => 4,
            Packet::Unknown { len, .. } => *len,
        }
    }
}

/// A short TNT packet (one byte) can hold 1 to 6 TNT bits; zero bits, or
/// more than 6, must use the long (8-byte) encoding. (`0b0000_0010` is
/// reserved for the two-byte escape opcode, so a short TNT packet can
/// never encode zero bits.)
pub(crate) fn fits_short_tnt(bit_count: u8) -> bool {
    (1..=6).contains(&bit_count)
}

/// The 16-byte PSB synchronization pattern (`0x02 0x82` repeated 8 times).
pub(crate) const PSB_PATTERN: [u8; 16] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
];

pub(crate) fn ip_payload_len(ipc: IpCompression) -> u8 {
    match ipc {
        IpCompression::Suppressed => 0,
        IpCompression::Upd16 => 2,
        IpCompression::Upd32 => 4,
        IpCompression::Sext48 => 6,
    }
}
