//! The per-step instruction record and its classification.

use iced_x86::{FlowControl, Instruction};
use pt_query::ExecMode;

use crate::flags::InsnFlags;

/// How an instruction affects control flow, derived from
/// [`iced_x86::Instruction::flow_control`] the way
/// `iptr-edge-analyzer::static_analyzer::CfgTerminator::try_from` does,
/// collapsed to the three-way split spec's `next()` algorithm branches
/// on (direct vs. conditional vs. indirect) plus `Other` for everything
/// that does not change control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnClass {
    /// Does not change control flow; `IP += size`.
    Other,
    /// An unconditional direct jump or call; `IP := direct_target`.
    DirectBranch,
    /// A conditional jump; resolved via `cond_branch()`.
    CondBranch,
    /// An indirect jump, indirect call, return, or far transfer;
    /// resolved via `indirect_branch()`.
    IndirectBranch,
}

impl InsnClass {
    #[must_use]
    pub fn classify(insn: &Instruction) -> Self {
        if insn.is_jcc_short_or_near() || insn.is_loopcc() {
            InsnClass::CondBranch
        } else if insn.is_loop() {
            // An unconditional-looking mnemonic that still depends on
            // rCX, so it has a taken/not-taken TNT answer like a Jcc.
            InsnClass::CondBranch
        } else if insn.is_jmp_near_indirect() || insn.is_call_near_indirect() {
            InsnClass::IndirectBranch
        } else if insn.is_jmp_short_or_near() || insn.is_call_near() {
            InsnClass::DirectBranch
        } else {
            match insn.flow_control() {
                FlowControl::Next
                | FlowControl::Call
                | FlowControl::Interrupt
                | FlowControl::XbeginXabortXend
                | FlowControl::Exception => InsnClass::Other,
                FlowControl::UnconditionalBranch => InsnClass::DirectBranch,
                FlowControl::ConditionalBranch => InsnClass::CondBranch,
                FlowControl::IndirectBranch | FlowControl::IndirectCall | FlowControl::Return => {
                    InsnClass::IndirectBranch
                }
            }
        }
    }
}

/// One decoded, executed instruction plus the event flags it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionRecord {
    pub ip: u64,
    pub cr3: u64,
    pub exec_mode: ExecMode,
    pub iclass: InsnClass,
    /// Raw instruction bytes, left-padded with zeros past `size`.
    pub raw: [u8; 15],
    pub size: u8,
    pub flags: InsnFlags,
}

impl InstructionRecord {
    pub(crate) fn new(
        ip: u64,
        cr3: u64,
        exec_mode: ExecMode,
        iclass: InsnClass,
        bytes: &[u8],
    ) -> Self {
        let size = bytes.len().min(15);
        let mut raw = [0u8; 15];
        raw[..size].copy_from_slice(&bytes[..size]);
        Self {
            ip,
            cr3,
            exec_mode,
            iclass,
            raw,
            size: size as u8,
            flags: InsnFlags::empty(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.raw[..self.size as usize]
    }
}
