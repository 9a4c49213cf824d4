//! TNT bit packing shared by the short (1-byte) and long (8-byte) encodings.
//!
//! Both encodings use a unary "stop bit" convention: the payload's
//! most-significant set bit marks the end of the valid taken/not-taken
//! run and is itself excluded from the bit count, exactly as
//! `original_source/libipt`'s `pt_ip_compression`-adjacent TNT packets
//! do and as `iptr-edge-analyzer::tnt_buffer` implements for the real
//! wire encoding. Bit 0 of the payload (nearest the stop bit) is the
//! oldest (first-to-pop) outcome.

use pt_error::ErrorKind;

use crate::packet::TntPacket;

/// Decode a short TNT packet byte (`0bxxxxxxx0`, never `0x00` or `0x02`).
pub(crate) fn decode_short(byte: u8) -> Result<TntPacket, ErrorKind> {
    debug_assert!(byte & 1 == 0 && byte != 0);
    // Bit 0 is reserved (always clear) for opcode classification; search
    // the stop bit among bits 7..=1.
    let stop_pos = 7 - byte.leading_zeros();
    if stop_pos == 0 {
        // Only bit 0 could be set, but it's always clear here: unreachable.
        return Err(ErrorKind::BadPacket);
    }
    let bit_count = u8::try_from(stop_pos - 1).expect("stop_pos <= 7");
    let mask = (1u16 << bit_count) - 1;
    let payload = u64::from((u16::from(byte) >> 1) & mask);
    Ok(TntPacket { bit_count, payload })
}

/// Encode a [`TntPacket`] with `bit_count <= 6` as a short TNT byte.
pub(crate) fn encode_short(packet: &TntPacket) -> Result<u8, ErrorKind> {
    if !(1..=6).contains(&packet.bit_count) {
        return Err(ErrorKind::BadPacket);
    }
    if packet.payload >> packet.bit_count != 0 {
        return Err(ErrorKind::BadPacket);
    }
    let stop_bit = 1u16 << packet.bit_count;
    let body = (packet.payload as u16) | stop_bit;
    Ok(((body << 1) & 0xFF) as u8)
}

/// Decode the 48-bit payload of a long TNT packet (already stripped of
/// its 2-byte `0x02 0xA3` header).
pub(crate) fn decode_long(payload48: u64) -> Result<TntPacket, ErrorKind> {
    debug_assert_eq!(payload48 >> 48, 0, "caller must clear the upper 16 bits");
    if payload48 == 0 {
        return Err(ErrorKind::BadPacket);
    }
    let stop_pos = 63 - payload48.leading_zeros();
    let bit_count = u8::try_from(stop_pos).expect("stop_pos <= 47");
    if bit_count > 47 {
        return Err(ErrorKind::BadPacket);
    }
    let mask = if bit_count == 64 {
        u64::MAX
    } else {
        (1u64 << bit_count) - 1
    };
    Ok(TntPacket {
        bit_count,
        payload: payload48 & mask,
    })
}

/// Encode a [`TntPacket`] with `bit_count <= 47` as the 48-bit payload
/// of a long TNT packet (caller prepends the 2-byte header).
pub(crate) fn encode_long(packet: &TntPacket) -> Result<u64, ErrorKind> {
    if packet.bit_count > 47 {
        return Err(ErrorKind::BadPacket);
    }
    if packet.bit_count < 64 && packet.payload >> packet.bit_count != 0 {
        return Err(ErrorKind::BadPacket);
    }
    Ok(packet.payload | (1u64 << packet.bit_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_round_trip_all_counts() {
        for bit_count in 1..=6u8 {
            for payload in 0..(1u64 << bit_count) {
                let packet = TntPacket { bit_count, payload };
                let byte = encode_short(&packet).unwrap();
                let decoded = decode_short(byte).unwrap();
                assert_eq!(decoded.bit_count, bit_count);
                assert_eq!(decoded.payload, payload);
            }
        }
    }

    #[test]
    fn short_max_capacity_is_six_bits() {
        let packet = TntPacket {
            bit_count: 6,
            payload: 0b10_1101,
        };
        let byte = encode_short(&packet).unwrap();
        assert_eq!(decode_short(byte).unwrap().bit_count, 6);
        assert!(encode_short(&TntPacket {
            bit_count: 7,
            payload: 0,
        })
        .is_err());
    }

    #[test]
    fn long_round_trip_spot_checks() {
        for (bit_count, payload) in [(0u8, 0u64), (1, 1), (47, (1u64 << 47) - 1), (30, 0x3_FFFF)] {
            let encoded = encode_long(&TntPacket { bit_count, payload }).unwrap();
            let decoded = decode_long(encoded).unwrap();
            assert_eq!(decoded.bit_count, bit_count);
            assert_eq!(decoded.payload, payload);
        }
    }

    #[test]
    fn long_rejects_too_many_bits() {
        assert!(encode_long(&TntPacket {
            bit_count: 48,
            payload: 0,
        })
        .is_err());
    }

    #[test]
    fn long_zero_payload_is_bad_packet() {
        assert_eq!(decode_long(0).unwrap_err(), ErrorKind::BadPacket);
    }
}
