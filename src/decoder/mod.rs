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

//! Microarchitecture decoders
//!
//! A decoder turns raw MSR and PCI reads into sensor values for one family
//! of processors. Selection walks a static descriptor table in order; the
//! first descriptor whose predicate accepts the processor's primary thread
//! wins, and the generic decoder (load only) is the fallback.
//!
//! | Decoder | Matches                          | Sensors                                   |
//! |---------|----------------------------------|-------------------------------------------|
//! | Intel   | GenuineIntel with MSR support    | DTS temperatures, clocks, RAPL power      |
//! | Amd0f   | AMD family 0Fh                   | thermtrip temperatures, FID/VID clocks    |
//! | Amd10   | AMD families 10h to 16h          | reported temperature, COFVID clocks       |
//! | Amd17   | AMD family 17h (Zen)             | Tctl/Tdie, SVI2 voltages, per-core P-state |
//! | Generic | everything else                  | none beyond load                          |

pub mod amd0f;
pub mod amd10;
pub mod amd17;
pub mod energy;
pub mod intel;

pub use amd0f::Amd0fDecoder;
pub use amd10::Amd10Decoder;
pub use amd17::Amd17Decoder;
pub use energy::{counter_delta, EnergyCounter, EnergySample};
pub use intel::{IntelDecoder, Microarchitecture};

use std::thread;

use tracing::{debug, trace};

use crate::access::{pci_address, RegisterAccess, INVALID_PCI_ADDRESS};
use crate::config::EngineConfig;
use crate::constants::amd;
use crate::sensor::SensorBank;
use crate::topology::{Processor, ThreadIdentity};

/// Everything a decoder may touch while building or updating
pub struct DecodeContext<'a> {
    pub access: &'a dyn RegisterAccess,
    pub processor: &'a Processor,
    /// Position of the processor in discovery order
    pub processor_index: usize,
    /// Current time-stamp counter rate in MHz
    pub tsc_frequency: f64,
    pub config: &'a EngineConfig,
    pub sensors: &'a mut SensorBank,
}

impl DecodeContext<'_> {
    pub fn primary(&self) -> &ThreadIdentity {
        self.processor.primary()
    }

    /// Read `index` on the first thread of every core, pausing between cores.
    pub fn read_each_core(&self, index: u32) -> Vec<Option<(u32, u32)>> {
        let spacing = self.config.clock_read_spacing();
        self.processor
            .cores()
            .iter()
            .map(|core| {
                if !spacing.is_zero() {
                    thread::sleep(spacing);
                }
                self.access.read_msr_on(index, core.primary().affinity_mask())
            })
            .collect()
    }

    /// Current monotonic time and its rate
    pub fn now(&self) -> (i64, i64) {
        (self.access.monotonic_timestamp(), self.access.monotonic_frequency())
    }
}

pub enum Decoder {
    Generic,
    Intel(IntelDecoder),
    Amd0f(Amd0fDecoder),
    Amd10(Amd10Decoder),
    Amd17(Amd17Decoder),
}

impl Decoder {
    pub fn name(&self) -> &'static str {
        match self {
            Decoder::Generic => GENERIC.name,
            Decoder::Intel(_) => "intel",
            Decoder::Amd0f(_) => "amd0f",
            Decoder::Amd10(_) => "amd10",
            Decoder::Amd17(_) => "amd17",
        }
    }

    pub fn update(&mut self, ctx: &mut DecodeContext<'_>) {
        match self {
            Decoder::Generic => {}
            Decoder::Intel(d) => d.update(ctx),
            Decoder::Amd0f(d) => d.update(ctx),
            Decoder::Amd10(d) => d.update(ctx),
            Decoder::Amd17(d) => d.update(ctx),
        }
    }
}

/// One entry of the decoder registry
pub struct DecoderDescriptor {
    pub name: &'static str,
    /// Prefix of the hardware identifier, e.g. `intelcpu`
    pub hardware_kind: &'static str,
    pub matches: fn(&ThreadIdentity) -> bool,
    pub build: fn(&mut DecodeContext<'_>) -> Decoder,
}

static DESCRIPTORS: [DecoderDescriptor; 4] = [
    DecoderDescriptor {
        name: "intel",
        hardware_kind: "intelcpu",
        matches: IntelDecoder::matches,
        build: build_intel,
    },
    DecoderDescriptor {
        name: "amd0f",
        hardware_kind: "amdcpu",
        matches: Amd0fDecoder::matches,
        build: build_amd0f,
    },
    DecoderDescriptor {
        name: "amd10",
        hardware_kind: "amdcpu",
        matches: Amd10Decoder::matches,
        build: build_amd10,
    },
    DecoderDescriptor {
        name: "amd17",
        hardware_kind: "amdcpu",
        matches: Amd17Decoder::matches,
        build: build_amd17,
    },
];

static GENERIC: DecoderDescriptor = DecoderDescriptor {
    name: "generic",
    hardware_kind: "genericcpu",
    matches: matches_any,
    build: build_generic,
};

fn matches_any(_: &ThreadIdentity) -> bool {
    true
}

fn build_generic(_: &mut DecodeContext<'_>) -> Decoder {
    Decoder::Generic
}

fn build_intel(ctx: &mut DecodeContext<'_>) -> Decoder {
    Decoder::Intel(IntelDecoder::build(ctx))
}

fn build_amd0f(ctx: &mut DecodeContext<'_>) -> Decoder {
    Decoder::Amd0f(Amd0fDecoder::build(ctx))
}

fn build_amd10(ctx: &mut DecodeContext<'_>) -> Decoder {
    Decoder::Amd10(Amd10Decoder::build(ctx))
}

fn build_amd17(ctx: &mut DecodeContext<'_>) -> Decoder {
    Decoder::Amd17(Amd17Decoder::build(ctx))
}

/// Registered decoders in selection order, excluding the generic fallback
pub fn descriptors() -> &'static [DecoderDescriptor] {
    &DESCRIPTORS
}

/// First descriptor accepting `primary`, or the generic fallback
pub fn select(primary: &ThreadIdentity) -> &'static DecoderDescriptor {
    let descriptor = DESCRIPTORS
        .iter()
        .find(|d| (d.matches)(primary))
        .unwrap_or(&GENERIC);
    debug!(
        decoder = descriptor.name,
        family = format_args!("{:#x}", primary.family()),
        model = format_args!("{:#x}", primary.model()),
        "Selected decoder"
    );
    descriptor
}

/// Display name of core `index` (zero based)
pub fn core_label(core_count: usize, index: usize) -> String {
    if core_count > 1 {
        format!("CPU Core #{}", index + 1)
    } else {
        "CPU Core".to_string()
    }
}

/// Locate the northbridge function of processor `processor_index`.
///
/// The device is accepted only if its vendor/device register matches
/// `device_id`, otherwise [`INVALID_PCI_ADDRESS`] is returned.
pub fn amd_pci_address(access: &dyn RegisterAccess, processor_index: usize, function: u32, device_id: u16) -> u32 {
    let address = pci_address(amd::PCI_BUS, amd::PCI_BASE_DEVICE + processor_index as u32, function);
    let expected = (u32::from(device_id) << 16) | amd::PCI_VENDOR_ID;
    match access.read_pci_config(address, amd::DEVICE_VENDOR_ID_REGISTER) {
        Some(id) if id == expected => address,
        other => {
            trace!(address = format_args!("{:#x}", address), found = ?other, "No matching northbridge function");
            INVALID_PCI_ADDRESS
        }
    }
}
