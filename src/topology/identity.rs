/*
 * This file is part of Hwprobe.
 *
 * Copyright (C) 2025 Hwprobe contributors
 *
 * Hwprobe is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Hwprobe is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Hwprobe. If not, see <https://www.gnu.org/licenses/>.
 */

//! Per-thread identification derived from raw CPUID tables

use serde::Serialize;

use crate::access::{thread_mask, RegisterAccess};
use crate::constants::cpuid::{self, EXTENDED_BASE, MAX_EXTENDED_LEAF, MAX_STANDARD_LEAF};

const EAX: usize = 0;
const EBX: usize = 1;
const ECX: usize = 2;
const EDX: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Intel => "Intel",
            Vendor::Amd => "AMD",
            Vendor::Unknown => "Unknown",
        }
    }

    fn from_signature(signature: &str) -> Self {
        match signature {
            cpuid::VENDOR_INTEL => Vendor::Intel,
            cpuid::VENDOR_AMD => Vendor::Amd,
            _ => Vendor::Unknown,
        }
    }
}

/// Identity of one logical processor. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadIdentity {
    index: u32,
    vendor: Vendor,
    brand: String,
    name: String,
    family: u32,
    model: u32,
    stepping: u32,
    apic_id: u32,
    processor_id: u32,
    core_id: u32,
    thread_id: u32,
    node_id: u32,
    standard: Vec<[u32; 4]>,
    extended: Vec<[u32; 4]>,
}

/// Bits needed to hold `x` distinct ids
fn next_log2(x: u32) -> u32 {
    if x <= 1 {
        return 0;
    }
    32 - (x - 1).leading_zeros()
}

fn words_to_string(words: &[u32]) -> String {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Strip marketing noise from a CPUID brand string.
///
/// `"Intel(R) Core(TM) i7-8700K CPU @ 3.70GHz"` becomes `"Intel Core i7-8700K"`.
pub fn clean_brand_name(brand: &str) -> String {
    const NOISE: &[&str] = &[
        "(R)",
        "(TM)",
        "(tm)",
        "CPU",
        "Dual-Core Processor",
        "Triple-Core Processor",
        "Quad-Core Processor",
        "Six-Core Processor",
        "Eight-Core Processor",
        "12-Core Processor",
        "16-Core Processor",
        "24-Core Processor",
        "32-Core Processor",
        "Processor",
    ];
    let mut name = match brand.find('@') {
        Some(at) => brand[..at].to_string(),
        None => brand.to_string(),
    };
    for noise in NOISE {
        name = name.replace(noise, " ");
    }
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl ThreadIdentity {
    /// Read the identity of logical processor `index`.
    ///
    /// Returns `None` when the processor does not exist or cannot be queried.
    pub fn probe<A: RegisterAccess + ?Sized>(access: &A, index: u32) -> Option<Self> {
        let leaf0 = access.cpuid(index, 0, 0)?;
        let max_standard = leaf0[EAX].min(MAX_STANDARD_LEAF);
        let mut standard = Vec::with_capacity(max_standard as usize + 1);
        standard.push(leaf0);
        for leaf in 1..=max_standard {
            standard.push(access.cpuid(index, leaf, 0).unwrap_or_default());
        }

        let mut extended = Vec::new();
        if let Some(ext0) = access.cpuid(index, EXTENDED_BASE, 0) {
            let max_extended = if ext0[EAX] > EXTENDED_BASE {
                (ext0[EAX] - EXTENDED_BASE).min(MAX_EXTENDED_LEAF)
            } else {
                0
            };
            extended.push(ext0);
            for leaf in 1..=max_extended {
                extended.push(access.cpuid(index, EXTENDED_BASE + leaf, 0).unwrap_or_default());
            }
        }

        Some(Self::from_tables(index, standard, extended))
    }

    /// Derive an identity from raw standard and extended leaf tables
    pub fn from_tables(index: u32, standard: Vec<[u32; 4]>, extended: Vec<[u32; 4]>) -> Self {
        let leaf = |table: &[[u32; 4]], l: usize, r: usize| table.get(l).map(|row| row[r]).unwrap_or(0);

        let vendor_words = [leaf(&standard, 0, EBX), leaf(&standard, 0, EDX), leaf(&standard, 0, ECX)];
        let vendor = Vendor::from_signature(&words_to_string(&vendor_words));

        let brand = if extended.len() > 4 {
            let words: Vec<u32> = extended[2..5].iter().flatten().copied().collect();
            words_to_string(&words).trim().to_string()
        } else {
            String::new()
        };
        let name = clean_brand_name(&brand);

        let signature = leaf(&standard, 1, EAX);
        let family = ((signature & 0x0FF0_0000) >> 20) + ((signature & 0x0F00) >> 8);
        let model = ((signature & 0x0F_0000) >> 12) + ((signature & 0xF0) >> 4);
        let stepping = signature & 0x0F;
        let apic_id = (leaf(&standard, 1, EBX) >> 24) & 0xFF;

        let zen_topology = vendor == Vendor::Amd && family >= 0x17 && extended.len() > 0x1E;

        let (thread_width, core_width) = match vendor {
            Vendor::Intel => {
                let max_core_and_thread = ((leaf(&standard, 1, EBX) >> 16) & 0xFF).max(1);
                let max_core = if standard.len() > 4 {
                    ((leaf(&standard, 4, EAX) >> 26) & 0x3F) + 1
                } else {
                    1
                };
                (next_log2(max_core_and_thread / max_core), next_log2(max_core))
            }
            Vendor::Amd => {
                let cores_per_package = if extended.len() > 8 {
                    (leaf(&extended, 8, ECX) & 0xFF) + 1
                } else {
                    1
                };
                if zen_topology {
                    let threads_per_core = ((leaf(&extended, 0x1E, EBX) >> 8) & 0xFF) + 1;
                    (next_log2(threads_per_core), next_log2(cores_per_package))
                } else {
                    (0, next_log2(cores_per_package))
                }
            }
            Vendor::Unknown => (0, 0),
        };

        let processor_id = apic_id >> (core_width + thread_width);
        let (core_id, thread_id, node_id) = if zen_topology {
            (
                leaf(&extended, 0x1E, EBX) & 0xFF,
                apic_id & ((1 << thread_width) - 1),
                leaf(&extended, 0x1E, ECX) & 0xFF,
            )
        } else {
            let core_id = (apic_id >> thread_width) - (processor_id << core_width);
            let thread_id = apic_id - (processor_id << (core_width + thread_width)) - (core_id << thread_width);
            (core_id, thread_id, 0)
        };

        Self {
            index,
            vendor,
            brand,
            name,
            family,
            model,
            stepping,
            apic_id,
            processor_id,
            core_id,
            thread_id,
            node_id,
            standard,
            extended,
        }
    }

    /// Logical processor index, also the affinity bit position
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn affinity_mask(&self) -> u64 {
        thread_mask(self.index)
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    /// Raw brand string as reported by the processor
    pub fn brand(&self) -> &str {
        &self.brand
    }

    /// Cleaned brand string
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn model(&self) -> u32 {
        self.model
    }

    pub fn stepping(&self) -> u32 {
        self.stepping
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    pub fn processor_id(&self) -> u32 {
        self.processor_id
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// NUMA node on Zen parts, 0 elsewhere
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn standard_leaves(&self) -> &[[u32; 4]] {
        &self.standard
    }

    pub fn extended_leaves(&self) -> &[[u32; 4]] {
        &self.extended
    }

    /// Register `reg` (0 = EAX .. 3 = EDX) of standard `leaf`, 0 if not read
    pub fn standard(&self, leaf: usize, reg: usize) -> u32 {
        self.standard.get(leaf).map(|row| row[reg]).unwrap_or(0)
    }

    /// Register `reg` of extended leaf `0x80000000 + leaf`, 0 if not read
    pub fn extended(&self, leaf: usize, reg: usize) -> u32 {
        self.extended.get(leaf).map(|row| row[reg]).unwrap_or(0)
    }

    pub fn has_msr(&self) -> bool {
        self.standard(1, EDX) & cpuid::FEATURE_MSR != 0
    }

    pub fn has_tsc(&self) -> bool {
        self.standard(1, EDX) & cpuid::FEATURE_TSC != 0
    }

    pub fn has_invariant_tsc(&self) -> bool {
        self.extended(7, EDX) & cpuid::POWER_INVARIANT_TSC != 0
    }

    pub fn has_core_dts(&self) -> bool {
        self.standard(6, EAX) & cpuid::THERMAL_CORE_DTS != 0
    }

    pub fn has_package_dts(&self) -> bool {
        self.standard(6, EAX) & cpuid::THERMAL_PACKAGE_DTS != 0
    }

    pub fn has_thermal_trip(&self) -> bool {
        self.extended(7, EDX) & cpuid::POWER_THERMAL_TRIP != 0
    }

    pub fn has_core_performance_boost(&self) -> bool {
        self.extended(7, EDX) & cpuid::POWER_CORE_PERFORMANCE_BOOST != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_utils::{amd_identity, intel_identity, zen_identity, FakeAccess};

    #[test]
    fn test_next_log2() {
        assert_eq!(next_log2(0), 0);
        assert_eq!(next_log2(1), 0);
        assert_eq!(next_log2(2), 1);
        assert_eq!(next_log2(3), 2);
        assert_eq!(next_log2(8), 3);
        assert_eq!(next_log2(16), 4);
    }

    #[test]
    fn test_clean_brand_name() {
        assert_eq!(
            clean_brand_name("Intel(R) Core(TM) i7-8700K CPU @ 3.70GHz"),
            "Intel Core i7-8700K"
        );
        assert_eq!(
            clean_brand_name("AMD Ryzen 7 1800X Eight-Core Processor"),
            "AMD Ryzen 7 1800X"
        );
        assert_eq!(clean_brand_name("  AMD Phenom(tm) II X4 965 Processor "), "AMD Phenom II X4 965");
        assert_eq!(clean_brand_name(""), "");
    }

    #[test]
    fn test_intel_identity_fields() {
        // package 1, core 2, thread 1 with 8 cores x 2 threads
        let id = intel_identity(5, 6, 0x9E, (1 << 4) | (2 << 1) | 1, "Intel(R) Core(TM) i7-8700K CPU @ 3.70GHz");
        assert_eq!(id.vendor(), Vendor::Intel);
        assert_eq!(id.family(), 6);
        assert_eq!(id.model(), 0x9E);
        assert_eq!(id.stepping(), 3);
        assert_eq!(id.processor_id(), 1);
        assert_eq!(id.core_id(), 2);
        assert_eq!(id.thread_id(), 1);
        assert_eq!(id.name(), "Intel Core i7-8700K");
        assert_eq!(id.affinity_mask(), 1 << 5);
        assert!(id.has_msr());
        assert!(id.has_tsc());
        assert!(id.has_invariant_tsc());
        assert!(id.has_core_dts());
        assert!(id.has_package_dts());
    }

    #[test]
    fn test_amd_extended_family() {
        let id = amd_identity(0, 0x15, 0x02, 3, 4, "AMD FX(tm)-4300 Quad-Core Processor");
        assert_eq!(id.vendor(), Vendor::Amd);
        assert_eq!(id.family(), 0x15);
        assert_eq!(id.model(), 0x02);
        assert_eq!(id.core_id(), 3);
        assert_eq!(id.processor_id(), 0);
        assert_eq!(id.thread_id(), 0);
        assert_eq!(id.name(), "AMD FX -4300");
        assert!(id.has_thermal_trip());
    }

    #[test]
    fn test_zen_node_and_core_from_topology_leaf() {
        let id = zen_identity(3, 3, 1, 6, "AMD Ryzen 7 1800X Eight-Core Processor");
        assert_eq!(id.family(), 0x17);
        assert_eq!(id.node_id(), 1);
        assert_eq!(id.core_id(), 6);
        assert_eq!(id.thread_id(), 1);
        assert_eq!(id.processor_id(), 0);
    }

    #[test]
    fn test_probe_reads_tables_through_access() {
        let access = FakeAccess::new();
        let source = intel_identity(2, 6, 0x3C, 4, "Intel(R) Core(TM) i7-4770 CPU @ 3.40GHz");
        access.install_identity(2, &source);

        let probed = ThreadIdentity::probe(&access, 2).unwrap();
        assert_eq!(probed, source);
        assert!(ThreadIdentity::probe(&access, 3).is_none());
    }

    #[test]
    fn test_unknown_vendor_uses_apic_as_processor() {
        let mut std = vec![[0u32; 4]; 2];
        std[0] = [1, u32::from_le_bytes(*b"Cent"), u32::from_le_bytes(*b"auls"), u32::from_le_bytes(*b"aurH")];
        std[1] = [0x6F2, 2 << 24, 0, 0];
        let id = ThreadIdentity::from_tables(0, std, Vec::new());
        assert_eq!(id.vendor(), Vendor::Unknown);
        assert_eq!(id.processor_id(), 2);
        assert_eq!(id.core_id(), 0);
        assert!(!id.has_msr());
        assert_eq!(id.name(), "");
    }
}
