//! The instruction-flow decoder (spec §4.F): reconstructs executed
//! instructions from a packet-level query decoder and a traced memory
//! image, one instruction per call.
//!
//! Grounded in `iptr-edge-analyzer::static_analyzer`'s use of
//! `iced-x86` as the external instruction decoder, generalized from a
//! CFG-terminator cache into single-instruction stepping driven by
//! [`pt_query::QueryDecoder`]'s branch queries.

mod decoder;
mod flags;
mod record;

pub use decoder::InsnDecoder;
pub use flags::InsnFlags;
pub use record::{InsnClass, InstructionRecord};
