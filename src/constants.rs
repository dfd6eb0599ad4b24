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

//! Register addresses, device paths and engine defaults.
//!
//! Every magic number used by the decoders lives here, grouped by vendor.

/// Device and procfs paths used by the Linux register backend
pub mod paths {
    /// Per-CPU MSR device node, `{}` is the logical processor index
    pub const MSR_DEVICE: &str = "/dev/cpu/{}/msr";

    /// Per-CPU CPUID device node
    pub const CPUID_DEVICE: &str = "/dev/cpu/{}/cpuid";

    /// PCI configuration space in sysfs
    pub const PCI_DEVICES: &str = "/sys/bus/pci/devices";

    /// Kernel per-CPU busy/idle accounting
    pub const PROC_STAT: &str = "/proc/stat";

    /// System-wide configuration file
    pub const SYSTEM_CONFIG: &str = "/etc/hwprobe/config.json";

    pub fn msr_device(cpu: u32) -> String {
        MSR_DEVICE.replace("{}", &cpu.to_string())
    }

    pub fn cpuid_device(cpu: u32) -> String {
        CPUID_DEVICE.replace("{}", &cpu.to_string())
    }
}

/// CPUID leaves and feature bits
pub mod cpuid {
    pub const EXTENDED_BASE: u32 = 0x8000_0000;

    /// Highest standard leaf stored in an identity table
    pub const MAX_STANDARD_LEAF: u32 = 0x1F;

    /// Highest extended leaf offset stored in an identity table
    pub const MAX_EXTENDED_LEAF: u32 = 0x1F;

    /// Leaf 1 EDX
    pub const FEATURE_TSC: u32 = 1 << 4;
    pub const FEATURE_MSR: u32 = 1 << 5;

    /// Leaf 6 EAX
    pub const THERMAL_CORE_DTS: u32 = 1 << 0;
    pub const THERMAL_PACKAGE_DTS: u32 = 1 << 6;

    /// Extended leaf 7 EDX
    pub const POWER_THERMAL_TRIP: u32 = 1 << 0;
    pub const POWER_INVARIANT_TSC: u32 = 1 << 8;
    pub const POWER_CORE_PERFORMANCE_BOOST: u32 = 1 << 9;

    pub const VENDOR_INTEL: &str = "GenuineIntel";
    pub const VENDOR_AMD: &str = "AuthenticAMD";
}

/// Intel model-specific registers
pub mod intel {
    pub const IA32_PERF_STATUS: u32 = 0x0198;
    pub const IA32_THERM_STATUS: u32 = 0x019C;
    pub const IA32_TEMPERATURE_TARGET: u32 = 0x01A2;
    pub const IA32_PACKAGE_THERM_STATUS: u32 = 0x01B1;
    pub const MSR_PLATFORM_INFO: u32 = 0x00CE;
    pub const MSR_RAPL_POWER_UNIT: u32 = 0x0606;
    pub const MSR_PKG_ENERGY_STATUS: u32 = 0x0611;
    pub const MSR_DRAM_ENERGY_STATUS: u32 = 0x0619;
    pub const MSR_PP0_ENERGY_STATUS: u32 = 0x0639;
    pub const MSR_PP1_ENERGY_STATUS: u32 = 0x0641;

    /// Thermal status reading valid bit
    pub const THERM_READING_VALID: u32 = 0x8000_0000;

    /// TjMax used when IA32_TEMPERATURE_TARGET cannot be read
    pub const DEFAULT_TJMAX: f32 = 100.0;
}

/// AMD model-specific registers and PCI functions
pub mod amd {
    pub const PERF_CTL_0: u32 = 0xC001_0000;
    pub const PERF_CTR_0: u32 = 0xC001_0004;
    pub const HWCR: u32 = 0xC001_0015;
    pub const FIDVID_STATUS: u32 = 0xC001_0042;
    pub const COFVID_STATUS: u32 = 0xC001_0071;

    /// HWCR bit that disables core performance boost
    pub const HWCR_CPB_DISABLE: u32 = 1 << 25;

    /// "CPU clocks not halted" event, counted in user and OS mode
    pub const PERF_CTL_CLOCKS_NOT_HALTED: u32 = (1 << 22) | (1 << 17) | (1 << 16) | 0x76;

    pub const PCI_BUS: u32 = 0;
    pub const PCI_BASE_DEVICE: u32 = 0x18;
    pub const PCI_VENDOR_ID: u32 = 0x1022;
    pub const DEVICE_VENDOR_ID_REGISTER: u32 = 0x00;
    pub const MISCELLANEOUS_CONTROL_FUNCTION: u32 = 3;

    /// Family 0Fh
    pub mod f0f {
        pub const MISCELLANEOUS_CONTROL_DEVICE_ID: u16 = 0x1103;
        pub const THERMTRIP_STATUS_REGISTER: u32 = 0xE4;
    }

    /// Families 10h to 16h
    pub mod f10 {
        pub const FAMILY_10H_MISC_CONTROL_DEVICE_ID: u16 = 0x1203;
        pub const FAMILY_11H_MISC_CONTROL_DEVICE_ID: u16 = 0x1303;
        pub const FAMILY_12H_MISC_CONTROL_DEVICE_ID: u16 = 0x1703;
        pub const FAMILY_14H_MISC_CONTROL_DEVICE_ID: u16 = 0x1703;
        pub const FAMILY_15H_MODEL_00_MISC_CONTROL_DEVICE_ID: u16 = 0x1603;
        pub const FAMILY_15H_MODEL_10_MISC_CONTROL_DEVICE_ID: u16 = 0x1403;
        pub const FAMILY_15H_MODEL_30_MISC_CONTROL_DEVICE_ID: u16 = 0x141D;
        pub const FAMILY_15H_MODEL_60_MISC_CONTROL_DEVICE_ID: u16 = 0x1573;
        pub const FAMILY_16H_MODEL_00_MISC_CONTROL_DEVICE_ID: u16 = 0x1533;
        pub const FAMILY_16H_MODEL_30_MISC_CONTROL_DEVICE_ID: u16 = 0x1583;

        pub const REPORTED_TEMPERATURE_CONTROL_REGISTER: u32 = 0xA4;
        pub const CLOCK_POWER_TIMING_CONTROL_0_REGISTER: u32 = 0xD4;

        /// SMN index/data pair on the root complex for family 15h model 60h
        pub const F15H_M60H_SMN_INDEX_REGISTER: u32 = 0xB8;
        pub const F15H_M60H_REPORTED_TEMP_CTRL_OFFSET: u32 = 0xD820_0CA4;
    }

    /// Family 17h (Zen)
    pub mod f17 {
        pub const MSR_PWR_UNIT: u32 = 0xC001_0299;
        pub const MSR_CORE_ENERGY_STAT: u32 = 0xC001_029A;
        pub const MSR_PKG_ENERGY_STAT: u32 = 0xC001_029B;
        pub const MSR_HARDWARE_PSTATE_STATUS: u32 = 0xC001_0293;

        /// SMN index register on the root complex, data follows at +4
        pub const SMN_INDEX_REGISTER: u32 = 0x60;
        pub const THM_TCON_CUR_TMP: u32 = 0x0005_9800;
        pub const SVI_BASE: u32 = 0x0005_A000;
        pub const SVI_TFN: u32 = SVI_BASE + 0x8;
        pub const SVI_PLANE0: u32 = SVI_BASE + 0xC;
        pub const SVI_PLANE1: u32 = SVI_BASE + 0x10;

        /// Core frequency reference for FID/DFS decoding, in MHz
        pub const FID_REFERENCE_MHZ: f64 = 200.0;
    }
}

/// Voltage identifier decoding shared by SVI2 and P-state VIDs
pub mod vid {
    pub const BASE_VOLTS: f64 = 1.550;
    pub const STEP_VOLTS: f64 = 0.00625;
}

/// Defaults for the tunable engine parameters
pub mod defaults {
    /// Logical processor indices probed during discovery
    pub const MAX_LOGICAL_PROCESSORS: u32 = 64;

    pub const CALIBRATION_WINDOW_MS: u64 = 25;
    pub const CALIBRATION_WINDOWS: u32 = 5;
    pub const CALIBRATION_ERROR_THRESHOLD: f64 = 1e-4;

    pub const TSC_CORRECTION_MIN_INTERVAL_SECS: f64 = 0.5;
    pub const TSC_CORRECTION_MAX_INTERVAL_SECS: f64 = 2.0;
    pub const TSC_CORRECTION_MAX_ERROR_SECS: f64 = 1e-4;

    pub const CLOCK_READ_SPACING_MS: u64 = 1;
    pub const POWER_MIN_INTERVAL_MS: u64 = 10;

    /// One day
    pub const HISTORY_RETENTION_SECS: u64 = 24 * 60 * 60;
    pub const HISTORY_SAMPLES_PER_ENTRY: usize = 4;
}
