//! First- and second-byte opcode dispatch.
//!
//! Grounded in `iptr-decoder::raw_packet_handler::{level1, level2}`:
//! the first byte is classified by a fixed bitmask (low 5 bits for the
//! IP-compression family, low 1 bit for short TNT, an exact match for
//! everything else) and `0x02` escapes to a second-byte table for the
//! multi-byte packets (PSB, PSBEND, OVF, PIP, long TNT, CBR).

use pt_error::ErrorKind;

use crate::packet::{
    IpCompression, IpPacket, ModeExecPacket, ModeTsxPacket, PSB_PATTERN, Packet, ip_payload_len,
};
use crate::tnt;

/// Decode the packet starting at `bytes[0]`, returning it and the
/// number of bytes consumed. `bytes` need not contain only one packet;
/// trailing bytes beyond the returned length are ignored.
///
/// Returns [`ErrorKind::Eos`] if `bytes` is too short to hold even the
/// packet's header, and [`ErrorKind::BadOpc`]/[`ErrorKind::BadPacket`]
/// for opcodes/payloads this codec does not recognize (the caller's
/// [`crate::DecodeCallback`], if any, gets first refusal through
/// [`crate::sync::Cursor`] before either of those is surfaced).
pub(crate) fn decode_packet(bytes: &[u8]) -> Result<(Packet, u8), ErrorKind> {
    let &first = bytes.first().ok_or(ErrorKind::Eos)?;

    if first == 0x00 {
        return Ok((Packet::Pad, 1));
    }
    if first == 0x02 {
        return decode_ext(bytes);
    }
    // IP-compression family: low 5 bits identify TIP/FUP/TIP.PGE/TIP.PGD,
    // top 3 bits carry the IP-compression selector.
    match first & 0x1F {
        0x0D => return decode_ip(bytes, first >> 5).map(|(ip, n)| (Packet::Tip(ip), n)),
        0x1D => return decode_ip(bytes, first >> 5).map(|(ip, n)| (Packet::Fup(ip), n)),
        0x11 => return decode_ip(bytes, first >> 5).map(|(ip, n)| (Packet::TipPge(ip), n)),
        0x01 => return decode_ip(bytes, first >> 5).map(|(ip, n)| (Packet::TipPgd(ip), n)),
        _ => {}
    }
    if first == 0x19 {
        return decode_tsc(bytes);
    }
    if first == 0x99 {
        return decode_mode(bytes);
    }
    if first & 0x01 == 0 {
        return tnt::decode_short(first).map(|t| (Packet::Tnt(t), 1));
    }
    Err(ErrorKind::BadOpc)
}

fn decode_ext(bytes: &[u8]) -> Result<(Packet, u8), ErrorKind> {
    let second = *bytes.get(1).ok_or(ErrorKind::Eos)?;
    match second {
        0x23 => Ok((Packet::PsbEnd, 2)),
        0xF3 => Ok((Packet::Ovf, 2)),
        0x82 => {
            let window = bytes.get(..16).ok_or(ErrorKind::Eos)?;
            if window == PSB_PATTERN {
                Ok((Packet::Psb, 16))
            } else {
                Err(ErrorKind::BadPacket)
            }
        }
        0x03 => {
            let cbr = *bytes.get(2).ok_or(ErrorKind::Eos)?;
            bytes.get(3).ok_or(ErrorKind::Eos)?;
            Ok((Packet::Cbr(cbr), 4))
        }
        0x43 => {
            let window = bytes.get(2..8).ok_or(ErrorKind::Eos)?;
            let mut raw = [0u8; 8];
            raw[..6].copy_from_slice(window);
            let value = u64::from_le_bytes(raw);
            let non_root = value & 1 != 0;
            let cr3 = value & !0x1F;
            Ok((Packet::Pip { cr3, non_root }, 8))
        }
        0xA3 => {
            let window = bytes.get(2..8).ok_or(ErrorKind::Eos)?;
            let mut raw = [0u8; 8];
            raw[..6].copy_from_slice(window);
            let payload = u64::from_le_bytes(raw);
            tnt::decode_long(payload).map(|t| (Packet::Tnt(t), 8))
        }
        _ => Err(ErrorKind::BadOpc),
    }
}

fn decode_ip(bytes: &[u8], ipc_bits: u8) -> Result<(IpPacket, u8), ErrorKind> {
    let ipc = match ipc_bits & 0b111 {
        0b000 => IpCompression::Suppressed,
        0b001 => IpCompression::Upd16,
        0b010 => IpCompression::Upd32,
        0b011 => IpCompression::Sext48,
        _ => return Err(ErrorKind::BadPacket),
    };
    let payload_len = ip_payload_len(ipc) as usize;
    let payload = bytes.get(1..1 + payload_len).ok_or(ErrorKind::Eos)?;
    let mut raw = [0u8; 8];
    raw[..payload_len].copy_from_slice(payload);
    let ip = u64::from_le_bytes(raw);
    Ok((IpPacket { ipc, ip }, 1 + payload_len as u8))
}

fn decode_tsc(bytes: &[u8]) -> Result<(Packet, u8), ErrorKind> {
    let payload = bytes.get(1..8).ok_or(ErrorKind::Eos)?;
    let mut raw = [0u8; 8];
    raw[..7].copy_from_slice(payload);
    Ok((Packet::Tsc(u64::from_le_bytes(raw)), 8))
}

fn decode_mode(bytes: &[u8]) -> Result<(Packet, u8), ErrorKind> {
    let second = *bytes.get(1).ok_or(ErrorKind::Eos)?;
    let leaf = (second >> 5) & 0b111;
    let bits = second & 0x1F;
    match leaf {
        0 => Ok((
            Packet::ModeExec(ModeExecPacket {
                csl: bits & 0b001 != 0,
                csd: bits & 0b010 != 0,
            }),
            2,
        )),
        1 => Ok((
            Packet::ModeTsx(ModeTsxPacket {
                intx: bits & 0b001 != 0,
                abrt: bits & 0b010 != 0,
            }),
            2,
        )),
        _ => Err(ErrorKind::BadPacket),
    }
}

/// Encode `packet` into `out`, returning the number of bytes written.
///
/// Returns [`ErrorKind::Eos`] if `out` is too small, and
/// [`ErrorKind::BadPacket`] if `packet` carries an out-of-range payload
/// (e.g. a `Tnt` with `bit_count > 47`). `Unknown` packets cannot be
/// re-encoded by this codec; encoding one is also `BadPacket`, since
/// this crate never learned their payload layout.
pub(crate) fn encode_packet(packet: &Packet, out: &mut [u8]) -> Result<u8, ErrorKind> {
    let len = packet.size_on_wire() as usize;
    let buf = out.get_mut(..len).ok_or(ErrorKind::Eos)?;
    match packet {
        Packet::Pad => buf[0] = 0x00,
        Packet::Ovf => {
            buf[0] = 0x02;
            buf[1] = 0xF3;
        }
        Packet::Psb => buf.copy_from_slice(&PSB_PATTERN),
        Packet::PsbEnd => {
            buf[0] = 0x02;
            buf[1] = 0x23;
        }
        Packet::Tnt(t) => {
            if len == 1 {
                buf[0] = tnt::encode_short(t)?;
            } else {
                let payload = tnt::encode_long(t)?;
                buf[0] = 0x02;
                buf[1] = 0xA3;
                buf[2..8].copy_from_slice(&payload.to_le_bytes()[..6]);
            }
        }
        Packet::Tip(ip) => encode_ip(0x0D, ip, buf),
        Packet::Fup(ip) => encode_ip(0x1D, ip, buf),
        Packet::TipPge(ip) => encode_ip(0x11, ip, buf),
        Packet::TipPgd(ip) => encode_ip(0x01, ip, buf),
        Packet::ModeExec(m) => {
            buf[0] = 0x99;
            buf[1] = (u8::from(m.csl) | (u8::from(m.csd) << 1)) & 0x1F;
        }
        Packet::ModeTsx(m) => {
            buf[0] = 0x99;
            buf[1] = (0b001 << 5) | ((u8::from(m.intx) | (u8::from(m.abrt) << 1)) & 0x1F);
        }
        Packet::Pip { cr3, non_root } => {
            let value = (cr3 & !0x1F) | u64::from(*non_root);
            buf[0] = 0x02;
            buf[1] = 0x43;
            buf[2..8].copy_from_slice(&value.to_le_bytes()[..6]);
        }
        Packet::Tsc(tsc) => {
            buf[0] = 0x19;
            buf[1..8].copy_from_slice(&tsc.to_le_bytes()[..7]);
        }
        Packet::Cbr(cbr) => {
            buf[0] = 0x02;
            buf[1] = 0x03;
            buf[2] = *cbr;
            buf[3] = 0;
        }
        Packet::Unknown { .. } => return Err(ErrorKind::BadPacket),
    }
    Ok(len as u8)
}

fn encode_ip(opcode: u8, ip: &IpPacket, buf: &mut [u8]) {
    let ipc_bits = match ip.ipc {
        IpCompression::Suppressed => 0b000,
        IpCompression::Upd16 => 0b001,
        IpCompression::Upd32 => 0b010,
        IpCompression::Sext48 => 0b011,
    };
    buf[0] = (ipc_bits << 5) | opcode;
    let payload_len = ip_payload_len(ip.ipc) as usize;
    buf[1..1 + payload_len].copy_from_slice(&ip.ip.to_le_bytes()[..payload_len]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TntPacket;

    #[test]
    fn pad_round_trip() {
        let mut buf = [0xAAu8; 1];
        let n = encode_packet(&Packet::Pad, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(decode_packet(&buf).unwrap(), (Packet::Pad, 1));
    }

    #[test]
    fn psb_requires_exact_pattern() {
        assert_eq!(decode_packet(&PSB_PATTERN).unwrap(), (Packet::Psb, 16));
        let mut corrupt = PSB_PATTERN;
        corrupt[15] = 0x00;
        assert_eq!(decode_packet(&corrupt).unwrap_err(), ErrorKind::BadPacket);
    }

    #[test]
    fn ip_packet_round_trip_each_compression() {
        for (ipc, ip) in [
            (IpCompression::Suppressed, 0),
            (IpCompression::Upd16, 0xBEEF),
            (IpCompression::Upd32, 0xDEAD_BEEF),
            (IpCompression::Sext48, 0x0000_7FFF_FFFF_FFFF),
        ] {
            let packet = Packet::Tip(IpPacket { ipc, ip });
            let mut buf = [0u8; 8];
            let n = encode_packet(&packet, &mut buf).unwrap();
            assert_eq!(decode_packet(&buf[..n as usize]).unwrap(), (packet, n));
        }
    }

    #[test]
    fn reserved_ip_compression_is_bad_packet() {
        // 0b100 in the top 3 bits of a TIP opcode byte.
        let bytes = [0b100_0_1101u8, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_packet(&bytes).unwrap_err(), ErrorKind::BadPacket);
    }

    #[test]
    fn tnt_short_and_long_round_trip() {
        let short = Packet::Tnt(TntPacket {
            bit_count: 3,
            payload: 0b101,
        });
        let mut buf = [0u8; 8];
        let n = encode_packet(&short, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(decode_packet(&buf[..1]).unwrap(), (short, 1));

        let long = Packet::Tnt(TntPacket {
            bit_count: 20,
            payload: 0xA_BCDE,
        });
        let n = encode_packet(&long, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(decode_packet(&buf).unwrap(), (long, 8));
    }

    #[test]
    fn pip_masks_low_bits_and_keeps_non_root() {
        let packet = Packet::Pip {
            cr3: 0x1234_5678_9AB0,
            non_root: true,
        };
        let mut buf = [0u8; 8];
        let n = encode_packet(&packet, &mut buf).unwrap();
        assert_eq!(decode_packet(&buf[..n as usize]).unwrap(), (packet, 8));
    }

    #[test]
    fn cbr_round_trip() {
        let packet = Packet::Cbr(0x2A);
        let mut buf = [0u8; 4];
        let n = encode_packet(&packet, &mut buf).unwrap();
        assert_eq!(decode_packet(&buf[..n as usize]).unwrap(), (packet, 4));
    }

    #[test]
    fn truncated_buffer_is_eos() {
        assert_eq!(decode_packet(&[]).unwrap_err(), ErrorKind::Eos);
        assert_eq!(decode_packet(&[0x02]).unwrap_err(), ErrorKind::Eos);
        assert_eq!(decode_packet(&[0x19, 1, 2]).unwrap_err(), ErrorKind::Eos);
    }

    #[test]
    fn unknown_opcode_is_bad_opc() {
        assert_eq!(decode_packet(&[0xFF]).unwrap_err(), ErrorKind::BadOpc);
    }
}
