//! Re-exports of the shared error taxonomy, plus the decode callback.

pub use pt_error::{ErrorKind, PtResult};

/// The "unknown packet" escape hatch (see spec §4.B / §9).
///
/// Passed to [`crate::Cursor::decode_next_with_callback`], this is
/// invoked for any first byte that does not decode as a known packet.
/// It returns either the number of bytes consumed (the packet becomes
/// [`crate::Packet::Unknown`] carrying the given `context`) or an
/// error, surfaced unchanged.
pub trait DecodeCallback {
    /// Decode the unknown packet starting at `buf[0]`.
    ///
    /// Returns `(bytes_consumed, context)` on success. `bytes_consumed`
    /// must be at least 1 and at most `buf.len()`.
    fn decode(&mut self, buf: &[u8]) -> PtResult<(u8, u64)>;
}
