//! A single mapped region of a traced image.
//!
//! Lazy-mmap-on-first-read, grounded in
//! `iptr-edge-analyzer::memory_reader::perf_mmap`'s
//! `PerfMmapBasedMemoryReader`: open the file, `memmap2::Mmap` it, and
//! detect a since-mutated backing file the same way that module's
//! `FileTooShort` check does, generalized into a re-check performed on
//! every (re-)map rather than only once at construction.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use memmap2::{Mmap, MmapOptions};
use pt_error::ErrorKind;

use crate::asid::Cr3;

/// The parameters needed to add one section to a [`crate::TracedImage`].
#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub filename: PathBuf,
    pub file_offset: u64,
    pub size: u64,
    pub cr3: Cr3,
    pub vaddr: u64,
}

#[derive(Default)]
struct MappingState {
    mmap: Option<Arc<Mmap>>,
    /// Counts how many times this section has been (re-)mapped;
    /// re-mapping an already-mapped section is idempotent and just
    /// increments this rather than opening the file again.
    map_count: u64,
    /// File length and modification time observed at the last
    /// successful map, used to detect a mutated backing file.
    observed_len: u64,
    observed_mtime: Option<SystemTime>,
}

/// One `(file, file_offset, size, ASID, virtual_address)` region.
pub struct Section {
    filename: PathBuf,
    file_offset: u64,
    size: u64,
    cr3: Cr3,
    vaddr: u64,
    mapping: Mutex<MappingState>,
}

impl Section {
    /// Build a section from `spec`, truncating `size` against the
    /// backing file's current length if the file is shorter.
    ///
    /// # Errors
    /// [`ErrorKind::BadImage`] if the file cannot be opened or statted.
    pub fn new(spec: SectionSpec) -> Result<Self, ErrorKind> {
        let metadata = std::fs::metadata(&spec.filename).map_err(|_| ErrorKind::BadImage)?;
        let available = metadata.len().saturating_sub(spec.file_offset);
        let size = spec.size.min(available);
        Ok(Self {
            filename: spec.filename,
            file_offset: spec.file_offset,
            size,
            cr3: spec.cr3,
            vaddr: spec.vaddr,
            mapping: Mutex::new(MappingState::default()),
        })
    }

    #[must_use]
    pub fn filename(&self) -> &std::path::Path {
        &self.filename
    }

    #[must_use]
    pub fn cr3(&self) -> Cr3 {
        self.cr3
    }

    #[must_use]
    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.vaddr.saturating_add(self.size)
    }

    #[must_use]
    pub fn covers(&self, cr3: Cr3, ip: u64) -> bool {
        crate::asid::cr3_matches(self.cr3, cr3) && ip >= self.vaddr && ip < self.end()
    }

    /// Map (or re-map, idempotently) this section's backing file and
    /// run `f` with the bytes starting at the section's byte for `ip`,
    /// bounded to `max_len` and to the end of the section.
    ///
    /// # Errors
    /// [`ErrorKind::BadImage`] if the backing file shrank or changed
    /// since it was first mapped, or can no longer be opened/mapped;
    /// [`ErrorKind::BadLock`] if the mapping mutex was poisoned.
    pub fn with_mapped_bytes<R>(
        &self,
        ip: u64,
        max_len: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, ErrorKind> {
        if self.size == 0 {
            return Ok(f(&[]));
        }
        let mut state = self.mapping.lock().map_err(|_| ErrorKind::BadLock)?;
        let metadata = std::fs::metadata(&self.filename).map_err(|_| ErrorKind::BadImage)?;
        let len = metadata.len();
        let mtime = metadata.modified().ok();
        if state.mmap.is_some() {
            if len != state.observed_len || mtime != state.observed_mtime {
                log::warn!(
                    "traced image backing file {} changed since it was mapped",
                    self.filename.display()
                );
                return Err(ErrorKind::BadImage);
            }
        } else {
            let file = File::open(&self.filename).map_err(|_| ErrorKind::BadImage)?;
            // SAFETY: caller guarantees `self.filename` is not concurrently
            // truncated by another process while mapped; violations are
            // caught on a best-effort basis above via the length/mtime check.
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(self.file_offset)
                    .len(self.size as usize)
                    .map(&file)
            }
            .map_err(|_| ErrorKind::BadImage)?;
            state.mmap = Some(Arc::new(mmap));
            state.observed_len = len;
            state.observed_mtime = mtime;
        }
        state.map_count += 1;
        let offset_in_section = ip.saturating_sub(self.vaddr) as usize;
        let mmap = state.mmap.as_ref().expect("mapped above");
        let avail = mmap.len().saturating_sub(offset_in_section);
        let len = max_len.min(avail);
        let bytes = mmap
            .get(offset_in_section..offset_in_section + len)
            .ok_or(ErrorKind::BadImage)?;
        Ok(f(bytes))
    }

    #[cfg(test)]
    pub(crate) fn map_count(&self) -> u64 {
        self.mapping.lock().unwrap().map_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_file(contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("pt-image-test-{:p}", contents.as_ptr()));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn truncates_size_against_short_file() {
        let path = write_temp_file(b"0123456789");
        let section = Section::new(SectionSpec {
            filename: path.clone(),
            file_offset: 5,
            size: 100,
            cr3: 0,
            vaddr: 0x1000,
        })
        .unwrap();
        assert_eq!(section.size(), 5);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn maps_once_and_reuses_on_repeated_reads() {
        let path = write_temp_file(b"hello world");
        let section = Section::new(SectionSpec {
            filename: path.clone(),
            file_offset: 0,
            size: 11,
            cr3: 0,
            vaddr: 0x2000,
        })
        .unwrap();
        section
            .with_mapped_bytes(0x2000, 5, |b| assert_eq!(b, b"hello"))
            .unwrap();
        section
            .with_mapped_bytes(0x2006, 5, |b| assert_eq!(b, b"world"))
            .unwrap();
        assert_eq!(section.map_count(), 2);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn covers_respects_asid_and_range() {
        let path = write_temp_file(b"xxxxxxxx");
        let section = Section::new(SectionSpec {
            filename: path.clone(),
            file_offset: 0,
            size: 8,
            cr3: 0x42,
            vaddr: 0x1000,
        })
        .unwrap();
        assert!(section.covers(0x42, 0x1004));
        assert!(!section.covers(0x43, 0x1004));
        assert!(!section.covers(0x42, 0x1100));
        std::fs::remove_file(path).ok();
    }
}
