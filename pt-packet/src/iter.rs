//! A convenience iterator over a [`Cursor`], used by `pt-cli`'s `dump`
//! subcommand and by `pt-packet`'s own fuzz target.

use pt_error::ErrorKind;

use crate::packet::Packet;
use crate::sync::Cursor;

/// Repeatedly calls [`Cursor::decode_next`] until [`ErrorKind::Eos`],
/// which ends iteration rather than being yielded as an error.
pub struct PacketIterator<'a> {
    cursor: Cursor<'a>,
    done: bool,
}

impl<'a> PacketIterator<'a> {
    #[must_use]
    pub fn new(cursor: Cursor<'a>) -> Self {
        Self { cursor, done: false }
    }

    #[must_use]
    pub fn into_cursor(self) -> Cursor<'a> {
        self.cursor
    }
}

impl<'a> Iterator for PacketIterator<'a> {
    type Item = Result<(Packet, u8), ErrorKind>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.decode_next() {
            Ok(item) => Some(Ok(item)),
            Err(ErrorKind::Eos) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Encoder;

    #[test]
    fn iterates_until_eos() {
        let buf: &'static mut [u8] = Box::leak(Box::new([0u8; 64]));
        let mut encoder = Encoder::new(buf);
        encoder.encode(&Packet::Pad).unwrap();
        encoder.encode(&Packet::Pad).unwrap();
        encoder.encode(&Packet::Psb).unwrap();
        let written = encoder.offset();

        let packets: Vec<_> = PacketIterator::new(Cursor::new(&buf[..written]))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(packets.len(), 3);
    }

    #[test]
    fn stops_after_decode_error() {
        let bytes = [0xFFu8; 4];
        let mut count = 0;
        for item in PacketIterator::new(Cursor::new(&bytes)) {
            count += 1;
            assert!(item.is_err() || count < 10);
        }
        assert!(count <= 1);
    }
}
