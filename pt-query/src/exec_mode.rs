//! Execution mode derived from a MODE.Exec packet.

/// The processor's execution mode, derived from `(csl, csd)`.
///
/// Mirrors `enum pt_exec_mode` / `pt_get_exec_mode` in
/// `original_source/libipt/include/intel-pt.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    #[default]
    Unknown,
    Bit16,
    Bit32,
    Bit64,
}

impl ExecMode {
    #[must_use]
    pub fn from_csl_csd(csl: bool, csd: bool) -> Self {
        match (csl, csd) {
            (false, false) => ExecMode::Bit16,
            (false, true) => ExecMode::Bit32,
            (true, false) => ExecMode::Bit64,
            (true, true) => ExecMode::Unknown,
        }
    }
}
