//! Per-instruction status flags, mirroring `enum pt_insn_class` /
//! `struct pt_insn`'s bitfields in
//! `original_source/libipt/include/intel-pt.h`.

use bitflags::bitflags;

bitflags! {
    /// Flags decorating one [`crate::InstructionRecord`], set by
    /// [`crate::InsnDecoder::next`] as events drain between steps.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsnFlags: u16 {
        /// Executed speculatively (inside a not-yet-committed TSX region).
        const SPECULATIVE = 1 << 0;
        /// The speculative region containing this instruction aborted.
        const ABORTED = 1 << 1;
        /// A previously speculative region committed at this instruction.
        const COMMITTED = 1 << 2;
        /// This is the last instruction before tracing was disabled.
        const DISABLED = 1 << 3;
        /// This is the first instruction after tracing was (re-)enabled.
        const ENABLED = 1 << 4;
        /// Tracing resumed at a known IP after being disabled.
        const RESUMED = 1 << 5;
        /// Execution was asynchronously interrupted (an async branch).
        const INTERRUPTED = 1 << 6;
        /// The decoder just resynchronized after a trace overflow.
        const RESYNCED = 1 << 7;
    }
}
