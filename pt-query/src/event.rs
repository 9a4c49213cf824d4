//! The event type produced by the query/event decoder.
//!
//! Field names and the nine-way split mirror `struct pt_event` /
//! `enum pt_event_type` in `original_source/libipt/include/intel-pt.h`.

use crate::exec_mode::ExecMode;

/// Event-kind-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Tracing resumed at `ip`.
    Enabled { ip: u64 },
    /// Tracing disabled; `ip` is the destination of the first branch
    /// inside the filtered area (invalid if `ip_suppressed`).
    Disabled { ip: u64 },
    /// Tracing disabled asynchronously. `at` is the branch source.
    AsyncDisabled { at: u64, ip: u64 },
    /// An asynchronous branch (e.g. an interrupt).
    AsyncBranch { from: u64, to: u64 },
    /// A synchronous paging event.
    Paging { cr3: u64, non_root: bool },
    /// An asynchronous paging event, effective at `ip`.
    AsyncPaging { cr3: u64, non_root: bool, ip: u64 },
    /// Trace overflow; tracing resumes at `ip`.
    Overflow { ip: u64 },
    /// An execution mode change, effective at `ip`.
    ExecMode { mode: ExecMode, ip: u64 },
    /// A transactional execution state change.
    Tsx {
        ip: u64,
        speculative: bool,
        aborted: bool,
    },
}

/// A decoded event plus the flags common to every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// The event's IP has been suppressed (the carrying field above is
    /// not meaningful).
    pub ip_suppressed: bool,
    /// Emitted as PSB+ catch-up re-states context, not a fresh occurrence.
    pub status_update: bool,
    pub has_tsc: bool,
    pub tsc: u64,
    /// Set when the BDM64 errata means this event's branch target may
    /// be wrong (it follows a TSX abort on affected silicon).
    pub bdm64_tainted: bool,
}

impl Event {
    pub(crate) fn new(kind: EventKind) -> Self {
        Self {
            kind,
            ip_suppressed: false,
            status_update: false,
            has_tsc: false,
            tsc: 0,
            bdm64_tainted: false,
        }
    }
}

/// The future packet boundary at which a queued event becomes observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    /// Observable immediately, ahead of the next query answer.
    Now,
    /// Observable when the enclosing PSB+ block's PSBEND is reached.
    Psbend,
    /// Observable at the next TIP-family packet (TIP, TIP.PGE, TIP.PGD).
    Tip,
    /// Observable at the next FUP.
    Fup,
}

impl Binding {
    pub(crate) const COUNT: usize = 4;

    pub(crate) fn index(self) -> usize {
        match self {
            Binding::Now => 0,
            Binding::Psbend => 1,
            Binding::Tip => 2,
            Binding::Fup => 3,
        }
    }
}
