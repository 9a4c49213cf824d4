//! The traced image: an address-space-aware, lazily-mapped section map.
//!
//! `read` takes `&self`, not `&mut self`: every piece of state it may
//! touch (the section list, the callbacks, the set of known CR3s) is
//! `Mutex`-protected, the same per-field-lock approach
//! [`crate::section::Section`] uses for its own mapping cache. This is
//! what lets independent `InsnDecoder`s on different threads share one
//! `Arc<TracedImage>`, while `add_file`/`remove_by_*`/`copy` keep the
//! stronger `&mut self` the single-owner setup phase wants.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use pt_error::ErrorKind;

use crate::asid::{Cr3, NO_CR3, cr3_matches};
use crate::section::{Section, SectionSpec};

/// Supplies bytes for addresses not covered by any section.
///
/// Grounded in spec's memory-read callback contract: `(buffer, size,
/// ASID, IP, ctx) -> bytes_read | error`, realized here as a trait
/// object rather than a raw function pointer plus context pointer,
/// matching the teacher's capability-as-trait pattern.
pub trait ReadMemoryCallback: Send {
    fn read_memory(&mut self, buffer: &mut [u8], cr3: Cr3, ip: u64) -> Result<usize, ErrorKind>;
}

/// Invoked once per first observation of a CR3 unknown to the image;
/// may return sections to add for that address space.
pub trait NewCr3Callback: Send {
    fn new_cr3(&mut self, cr3: Cr3, ip: u64) -> Result<Vec<SectionSpec>, ErrorKind>;
}

/// An address-space-aware set of sections, searchable by `(ASID, VA)`.
#[derive(Default)]
pub struct TracedImage {
    sections: Mutex<Vec<Arc<Section>>>,
    read_memory_callback: Mutex<Option<Box<dyn ReadMemoryCallback>>>,
    new_cr3_callback: Mutex<Option<Box<dyn NewCr3Callback>>>,
    known_cr3s: Mutex<HashSet<Cr3>>,
}

impl TracedImage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// [`ErrorKind::BadLock`] if the section-list mutex was poisoned.
    pub fn section_count(&self) -> Result<usize, ErrorKind> {
        Ok(self.sections.lock().map_err(|_| ErrorKind::BadLock)?.len())
    }

    /// Run `f` over a snapshot of the current sections, for diagnostics.
    ///
    /// # Errors
    /// [`ErrorKind::BadLock`] if the section-list mutex was poisoned.
    pub fn with_sections<R>(&self, f: impl FnOnce(&[Arc<Section>]) -> R) -> Result<R, ErrorKind> {
        let sections = self.sections.lock().map_err(|_| ErrorKind::BadLock)?;
        Ok(f(&sections))
    }

    fn overlaps_existing(sections: &[Arc<Section>], cr3: Cr3, start: u64, end: u64) -> bool {
        sections
            .iter()
            .any(|s| cr3_matches(s.cr3(), cr3) && start < s.end() && s.vaddr() < end)
    }

    /// Add a section; truncates `size` if the backing file is shorter.
    ///
    /// # Errors
    /// [`ErrorKind::BadImage`] if the new range overlaps an existing
    /// section visible from the same address space, or the file cannot
    /// be opened/statted. [`ErrorKind::BadLock`] if the mutex was
    /// poisoned.
    pub fn add_file(
        &mut self,
        filename: impl AsRef<Path>,
        file_offset: u64,
        size: u64,
        cr3: Cr3,
        vaddr: u64,
    ) -> Result<(), ErrorKind> {
        let spec = SectionSpec {
            filename: filename.as_ref().to_path_buf(),
            file_offset,
            size,
            cr3,
            vaddr,
        };
        let section = Section::new(spec)?;
        let sections = self.sections.get_mut().map_err(|_| ErrorKind::BadLock)?;
        if Self::overlaps_existing(sections, cr3, section.vaddr(), section.end()) {
            return Err(ErrorKind::BadImage);
        }
        sections.push(Arc::new(section));
        Ok(())
    }

    /// Remove every section backed by `filename` visible from `cr3`.
    /// Returns the count removed.
    ///
    /// # Errors
    /// [`ErrorKind::BadLock`] if the mutex was poisoned.
    pub fn remove_by_filename(
        &mut self,
        filename: impl AsRef<Path>,
        cr3: Cr3,
    ) -> Result<usize, ErrorKind> {
        let filename = filename.as_ref();
        let sections = self.sections.get_mut().map_err(|_| ErrorKind::BadLock)?;
        let before = sections.len();
        sections.retain(|s| !(s.filename() == filename && cr3_matches(s.cr3(), cr3)));
        Ok(before - sections.len())
    }

    /// Remove every section visible from `cr3`. Returns the count removed.
    ///
    /// # Errors
    /// [`ErrorKind::BadLock`] if the mutex was poisoned.
    pub fn remove_by_asid(&mut self, cr3: Cr3) -> Result<usize, ErrorKind> {
        let sections = self.sections.get_mut().map_err(|_| ErrorKind::BadLock)?;
        let before = sections.len();
        sections.retain(|s| !cr3_matches(s.cr3(), cr3));
        Ok(before - sections.len())
    }

    /// Add every section from `src`, skipping overlaps rather than
    /// erroring. Returns the count skipped.
    ///
    /// # Errors
    /// [`ErrorKind::BadLock`] if either image's mutex was poisoned.
    pub fn copy(&mut self, src: &TracedImage) -> Result<usize, ErrorKind> {
        let src_sections = src.sections.lock().map_err(|_| ErrorKind::BadLock)?;
        let dst_sections = self.sections.get_mut().map_err(|_| ErrorKind::BadLock)?;
        let mut skipped = 0;
        for section in src_sections.iter() {
            if Self::overlaps_existing(dst_sections, section.cr3(), section.vaddr(), section.end())
            {
                skipped += 1;
                continue;
            }
            dst_sections.push(Arc::clone(section));
        }
        Ok(skipped)
    }

    pub fn set_callback(&mut self, callback: impl ReadMemoryCallback + 'static) {
        *self.read_memory_callback.get_mut().unwrap() = Some(Box::new(callback));
    }

    pub fn set_new_cr3_callback(&mut self, callback: impl NewCr3Callback + 'static) {
        *self.new_cr3_callback.get_mut().unwrap() = Some(Box::new(callback));
    }

    /// Notify the new-CR3 callback, if any, and add any sections it
    /// returns. No-op if `cr3` has already been observed.
    fn observe_cr3(&self, cr3: Cr3, ip: u64) -> Result<(), ErrorKind> {
        if cr3 == NO_CR3 {
            return Ok(());
        }
        {
            let mut known = self.known_cr3s.lock().map_err(|_| ErrorKind::BadLock)?;
            if !known.insert(cr3) {
                return Ok(());
            }
        }
        let mut callback_slot = self.new_cr3_callback.lock().map_err(|_| ErrorKind::BadLock)?;
        let Some(callback) = callback_slot.as_mut() else {
            return Ok(());
        };
        let new_sections = callback.new_cr3(cr3, ip)?;
        drop(callback_slot);
        let mut sections = self.sections.lock().map_err(|_| ErrorKind::BadLock)?;
        for spec in new_sections {
            // A section the callback supplies for an address space we
            // already model is a normal occurrence (e.g. re-observing a
            // CR3 the image also has a static section for); skip
            // silently rather than treating it as `bad_image`.
            if Self::overlaps_existing(
                &sections,
                spec.cr3,
                spec.vaddr,
                spec.vaddr.saturating_add(spec.size),
            ) {
                continue;
            }
            if let Ok(section) = Section::new(spec) {
                sections.push(Arc::new(section));
            }
        }
        Ok(())
    }

    /// Copy up to `buffer.len()` bytes starting at `(cr3, ip)` into
    /// `buffer`, stopping at a section boundary. Returns the number of
    /// bytes copied, which may be `0` if nothing covers the address and
    /// no fallback callback is set (or it also found nothing).
    ///
    /// # Errors
    /// [`ErrorKind::BadImage`] if a covering section's backing file
    /// changed since it was mapped; [`ErrorKind::BadLock`] if a mutex
    /// was poisoned; whatever the fallback callback returns on its own
    /// failure.
    pub fn read(&self, buffer: &mut [u8], cr3: Cr3, ip: u64) -> Result<usize, ErrorKind> {
        self.observe_cr3(cr3, ip)?;
        let found = {
            let sections = self.sections.lock().map_err(|_| ErrorKind::BadLock)?;
            sections.iter().find(|s| s.covers(cr3, ip)).cloned()
        };
        if let Some(section) = found {
            let len = buffer.len();
            return section.with_mapped_bytes(ip, len, |bytes| {
                buffer[..bytes.len()].copy_from_slice(bytes);
                bytes.len()
            });
        }
        let mut callback_slot = self
            .read_memory_callback
            .lock()
            .map_err(|_| ErrorKind::BadLock)?;
        let Some(callback) = callback_slot.as_mut() else {
            return Ok(0);
        };
        callback.read_memory(buffer, cr3, ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_temp_file(tag: &str, contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("pt-image-test-{tag}-{:p}", contents.as_ptr()));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn add_file_rejects_overlap_in_same_asid() {
        let path = write_temp_file("a", &[0u8; 0x2000]);
        let mut image = TracedImage::new();
        image.add_file(&path, 0, 0x1000, 0, 0x1000).unwrap();
        assert_eq!(
            image.add_file(&path, 0, 0x1000, 0, 0x1800).unwrap_err(),
            ErrorKind::BadImage
        );
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn add_file_allows_same_range_in_different_asid() {
        let path = write_temp_file("b", &[0u8; 0x1000]);
        let mut image = TracedImage::new();
        image.add_file(&path, 0, 0x1000, 1, 0x1000).unwrap();
        image.add_file(&path, 0, 0x1000, 2, 0x1000).unwrap();
        assert_eq!(image.section_count().unwrap(), 2);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn no_cr3_section_conflicts_with_every_asid() {
        let path = write_temp_file("c", &[0u8; 0x1000]);
        let mut image = TracedImage::new();
        image.add_file(&path, 0, 0x1000, NO_CR3, 0x1000).unwrap();
        assert_eq!(
            image.add_file(&path, 0, 0x1000, 42, 0x1000).unwrap_err(),
            ErrorKind::BadImage
        );
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn read_returns_bytes_from_covering_section() {
        let path = write_temp_file("d", b"abcdefgh");
        let mut image = TracedImage::new();
        image.add_file(&path, 0, 8, 0, 0x4000).unwrap();
        let mut buf = [0u8; 4];
        let n = image.read(&mut buf, 0, 0x4002).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"cdef");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn read_with_no_covering_section_and_no_callback_returns_zero() {
        let image = TracedImage::new();
        let mut buf = [0u8; 4];
        assert_eq!(image.read(&mut buf, 0, 0x1000).unwrap(), 0);
    }

    #[test]
    fn remove_by_filename_counts_matches() {
        let path = write_temp_file("e", &[0u8; 0x1000]);
        let mut image = TracedImage::new();
        image.add_file(&path, 0, 0x1000, 1, 0x1000).unwrap();
        image.add_file(&path, 0, 0x1000, 2, 0x2000).unwrap();
        assert_eq!(image.remove_by_filename(&path, NO_CR3).unwrap(), 2);
        assert_eq!(image.section_count().unwrap(), 0);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn copy_skips_overlaps_and_counts_them() {
        let path = write_temp_file("f", &[0u8; 0x1000]);
        let mut src = TracedImage::new();
        src.add_file(&path, 0, 0x1000, 0, 0x1000).unwrap();
        let mut dst = TracedImage::new();
        dst.add_file(&path, 0, 0x1000, 0, 0x1000).unwrap();
        assert_eq!(dst.copy(&src).unwrap(), 1);
        assert_eq!(dst.section_count().unwrap(), 1);
        std::fs::remove_file(path).ok();
    }

    struct CountingNewCr3 {
        calls: usize,
        path: PathBuf,
    }

    impl NewCr3Callback for CountingNewCr3 {
        fn new_cr3(&mut self, cr3: Cr3, _ip: u64) -> Result<Vec<SectionSpec>, ErrorKind> {
            self.calls += 1;
            Ok(vec![SectionSpec {
                filename: self.path.clone(),
                file_offset: 0,
                size: 0x1000,
                cr3,
                vaddr: 0x5000,
            }])
        }
    }

    #[test]
    fn new_cr3_callback_fires_once_per_cr3_and_adds_sections() {
        let path = write_temp_file("g", &[0u8; 0x1000]);
        let mut image = TracedImage::new();
        image.set_new_cr3_callback(CountingNewCr3 {
            calls: 0,
            path: path.clone(),
        });
        let mut buf = [0u8; 4];
        image.read(&mut buf, 0x9000, 0x5000).ok();
        image.read(&mut buf, 0x9000, 0x5000).ok();
        assert_eq!(image.section_count().unwrap(), 1);
        std::fs::remove_file(path).ok();
    }
}
