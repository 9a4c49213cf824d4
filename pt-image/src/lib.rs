//! The traced memory image (spec §4.E): an address-space-aware set of
//! file-backed sections, mapped lazily on first read.
//!
//! Grounded in `iptr-edge-analyzer::memory_reader`'s `ReadMemory`
//! trait and its `PerfMmapBasedMemoryReader` implementation, but
//! generalized from a read-only, build-once-from-perf.data reader into
//! a mutable image supporting `add_file`/`remove_by_*`/`copy` the way
//! libipt's `pt_image` does.

mod asid;
mod image;
mod section;

pub use asid::{Cr3, NO_CR3, cr3_matches};
pub use image::{NewCr3Callback, ReadMemoryCallback, TracedImage};
pub use section::{Section, SectionSpec};
