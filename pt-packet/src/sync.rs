//! The decoder position and PSB synchronization.
//!
//! Grounded in `iptr-decoder`'s use of `memchr::memmem` to scan for the
//! PSB byte pattern, generalized from the teacher's push-style
//! `HandlePacket::handle_psb` entry point into the pull-style cursor
//! the spec describes: `(buffer_begin, buffer_end, cursor, last_sync)`.

use memchr::memmem;
use pt_error::ErrorKind;

use crate::error::DecodeCallback;
use crate::opcode::{decode_packet, encode_packet};
use crate::packet::{PSB_PATTERN, Packet};

/// A read-only decode position over a trace buffer.
///
/// Invariant: `0 <= cursor <= buf.len()`, and `last_sync`, when
/// present, is always `<= cursor`.
pub struct Cursor<'a> {
    buf: &'a [u8],
    cursor: usize,
    last_sync: Option<usize>,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`, unsynchronized.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            cursor: 0,
            last_sync: None,
        }
    }

    /// The current offset from the start of the buffer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.cursor
    }

    /// The offset of the last PSB this cursor synchronized to, if any.
    #[must_use]
    pub fn sync_offset(&self) -> Option<usize> {
        self.last_sync
    }

    /// Whether the cursor is positioned exactly on a PSB.
    #[must_use]
    pub fn sync_is_at(&self, offset: usize) -> bool {
        self.buf.get(offset..offset + PSB_PATTERN.len()) == Some(&PSB_PATTERN[..])
    }

    /// Bytes remaining between the cursor and the end of the buffer.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.cursor..]
    }

    /// Scan forward from the cursor for the next PSB, moving the
    /// cursor to its first byte and recording it as `last_sync`.
    ///
    /// # Errors
    /// [`ErrorKind::Eos`] if no PSB is found before the end of the buffer.
    pub fn sync_forward(&mut self) -> Result<usize, ErrorKind> {
        let found = memmem::find(&self.buf[self.cursor..], &PSB_PATTERN).ok_or(ErrorKind::Eos)?;
        let offset = self.cursor + found;
        self.cursor = offset;
        self.last_sync = Some(offset);
        Ok(offset)
    }

    /// Scan backward from just before the cursor for the previous PSB.
    ///
    /// # Errors
    /// [`ErrorKind::Eos`] if no PSB lies before the cursor.
    pub fn sync_backward(&mut self) -> Result<usize, ErrorKind> {
        let search_end = self.cursor;
        let offset = (0..search_end)
            .rev()
            .find(|&start| self.buf[start..].starts_with(&PSB_PATTERN) && start < search_end)
            .ok_or(ErrorKind::Eos)?;
        self.cursor = offset;
        self.last_sync = Some(offset);
        Ok(offset)
    }

    /// Jump directly to `offset`, which must land exactly on a PSB.
    ///
    /// # Errors
    /// [`ErrorKind::NoSync`] if `offset` is out of range or not a PSB.
    pub fn sync_set(&mut self, offset: usize) -> Result<(), ErrorKind> {
        if !self.sync_is_at(offset) {
            return Err(ErrorKind::NoSync);
        }
        self.cursor = offset;
        self.last_sync = Some(offset);
        Ok(())
    }

    /// Decode the packet at the cursor and advance past it.
    ///
    /// # Errors
    /// [`ErrorKind::NoSync`] if the cursor has never synchronized;
    /// [`ErrorKind::Eos`] at the end of the buffer; otherwise whatever
    /// [`crate::opcode::decode_packet`] returns.
    pub fn decode_next(&mut self) -> Result<(Packet, u8), ErrorKind> {
        self.decode_next_impl(None::<&mut NoCallback>)
    }

    /// As [`Self::decode_next`], but unknown opcodes are offered to
    /// `callback` before [`ErrorKind::BadOpc`] is returned.
    pub fn decode_next_with_callback<C: DecodeCallback>(
        &mut self,
        callback: &mut C,
    ) -> Result<(Packet, u8), ErrorKind> {
        self.decode_next_impl(Some(callback))
    }

    fn decode_next_impl<C: DecodeCallback>(
        &mut self,
        callback: Option<&mut C>,
    ) -> Result<(Packet, u8), ErrorKind> {
        if self.last_sync.is_none() {
            return Err(ErrorKind::NoSync);
        }
        let remaining = self.remaining();
        if remaining.is_empty() {
            return Err(ErrorKind::Eos);
        }
        match decode_packet(remaining) {
            Ok((packet, consumed)) => {
                log::trace!("{:#x}: {packet:?} ({consumed} bytes)", self.cursor);
                self.cursor += consumed as usize;
                Ok((packet, consumed))
            }
            Err(ErrorKind::BadOpc) => {
                let Some(callback) = callback else {
                    return Err(ErrorKind::BadOpc);
                };
                let (consumed, context) = callback.decode(remaining)?;
                let consumed = consumed.max(1);
                self.cursor += consumed as usize;
                Ok((
                    Packet::Unknown {
                        len: consumed,
                        context,
                    },
                    consumed,
                ))
            }
            Err(other) => Err(other),
        }
    }
}

/// An append position over a mutable trace buffer, used for encoding.
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    cursor: usize,
}

impl<'a> Encoder<'a> {
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.cursor
    }

    /// Encode `packet` at the cursor and advance past it.
    ///
    /// # Errors
    /// [`ErrorKind::Eos`] if the remaining buffer is too small.
    pub fn encode(&mut self, packet: &Packet) -> Result<u8, ErrorKind> {
        let written = encode_packet(packet, &mut self.buf[self.cursor..])?;
        self.cursor += written as usize;
        Ok(written)
    }
}

/// Uninhabited placeholder so [`Cursor::decode_next`] can share
/// [`Cursor::decode_next_impl`] with the callback-taking variant
/// without requiring callers to name a concrete callback type.
enum NoCallback {}

impl DecodeCallback for NoCallback {
    fn decode(&mut self, _buf: &[u8]) -> Result<(u8, u64), ErrorKind> {
        match *self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TntPacket;

    fn trace_with_one_psb() -> Vec<u8> {
        let mut buf = vec![0xCCu8; 4];
        buf.extend_from_slice(&PSB_PATTERN);
        buf.push(0x00); // PAD
        buf
    }

    #[test]
    fn decode_before_sync_is_no_sync() {
        let buf = trace_with_one_psb();
        let mut cursor = Cursor::new(&buf);
        assert_eq!(cursor.decode_next().unwrap_err(), ErrorKind::NoSync);
    }

    #[test]
    fn sync_forward_then_decode_psb_and_pad() {
        let buf = trace_with_one_psb();
        let mut cursor = Cursor::new(&buf);
        let offset = cursor.sync_forward().unwrap();
        assert_eq!(offset, 4);
        assert_eq!(cursor.sync_offset(), Some(4));
        assert_eq!(cursor.decode_next().unwrap(), (Packet::Psb, 16));
        assert_eq!(cursor.decode_next().unwrap(), (Packet::Pad, 1));
        assert_eq!(cursor.decode_next().unwrap_err(), ErrorKind::Eos);
    }

    #[test]
    fn sync_forward_with_no_psb_is_eos() {
        let buf = vec![0xCCu8; 32];
        let mut cursor = Cursor::new(&buf);
        assert_eq!(cursor.sync_forward().unwrap_err(), ErrorKind::Eos);
    }

    #[test]
    fn sync_backward_finds_earlier_psb() {
        let mut buf = PSB_PATTERN.to_vec();
        buf.extend_from_slice(&[0xAA; 20]);
        let mut cursor = Cursor::new(&buf);
        cursor.cursor = buf.len();
        assert_eq!(cursor.sync_backward().unwrap(), 0);
    }

    #[test]
    fn encoder_round_trips_through_cursor() {
        let mut buf = vec![0u8; 32];
        let mut encoder = Encoder::new(&mut buf);
        encoder.encode(&Packet::Psb).unwrap();
        encoder
            .encode(&Packet::Tnt(TntPacket {
                bit_count: 4,
                payload: 0b1010,
            }))
            .unwrap();
        let written = encoder.offset();

        let mut cursor = Cursor::new(&buf[..written]);
        cursor.sync_forward().unwrap();
        assert_eq!(cursor.decode_next().unwrap(), (Packet::Psb, 16));
        assert_eq!(
            cursor.decode_next().unwrap(),
            (
                Packet::Tnt(TntPacket {
                    bit_count: 4,
                    payload: 0b1010,
                }),
                1
            )
        );
    }

    struct CountBytes;

    impl DecodeCallback for CountBytes {
        fn decode(&mut self, buf: &[u8]) -> Result<(u8, u64), ErrorKind> {
            Ok((1, u64::from(buf[0])))
        }
    }

    #[test]
    fn unknown_opcode_falls_through_to_callback() {
        let mut buf = PSB_PATTERN.to_vec();
        buf.push(0xFF);
        let mut cursor = Cursor::new(&buf);
        cursor.sync_forward().unwrap();
        cursor.decode_next().unwrap();
        let mut callback = CountBytes;
        let (packet, consumed) = cursor.decode_next_with_callback(&mut callback).unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(
            packet,
            Packet::Unknown {
                len: 1,
                context: 0xFF,
            }
        );
    }
}
