#![no_main]

use libfuzzer_sys::fuzz_target;
use pt_packet::{Cursor, DecodeCallback, ErrorKind};

struct NeverKnows;

impl DecodeCallback for NeverKnows {
    fn decode(&mut self, buf: &[u8]) -> Result<(u8, u64), ErrorKind> {
        Ok((1, u64::from(buf[0])))
    }
}

fuzz_target!(|data: &[u8]| {
    let mut cursor = Cursor::new(data);
    if cursor.sync_forward().is_err() {
        return;
    }
    let mut callback = NeverKnows;
    loop {
        match cursor.decode_next_with_callback(&mut callback) {
            Ok(_) => continue,
            Err(ErrorKind::Eos) => break,
            Err(_) => break,
        }
    }
});
