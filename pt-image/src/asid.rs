//! Address-space identification: a CR3 value, with a wildcard that
//! matches any concrete CR3.
//!
//! Grounded in spec's ASID match rule (`no_cr3` matches any CR3; a
//! concrete CR3 matches only itself) and in libipt's `pt_asid`.

/// A CR3 value used to identify an address space.
pub type Cr3 = u64;

/// The wildcard CR3: a section carrying this value is visible from
/// every address space.
pub const NO_CR3: Cr3 = 0xffff_ffff_ffff_ffff;

/// Whether a section's CR3 is visible to a query for `query_cr3`.
#[must_use]
pub fn cr3_matches(section_cr3: Cr3, query_cr3: Cr3) -> bool {
    section_cr3 == NO_CR3 || query_cr3 == NO_CR3 || section_cr3 == query_cr3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_section_matches_any_query() {
        assert!(cr3_matches(NO_CR3, 0x1000));
        assert!(cr3_matches(NO_CR3, NO_CR3));
    }

    #[test]
    fn wildcard_query_matches_any_section() {
        assert!(cr3_matches(0x2000, NO_CR3));
    }

    #[test]
    fn concrete_cr3_matches_only_itself() {
        assert!(cr3_matches(0x1000, 0x1000));
        assert!(!cr3_matches(0x1000, 0x2000));
    }
}
