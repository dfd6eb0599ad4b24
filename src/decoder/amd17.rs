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

//! AMD family 17h (Zen)
//!
//! Package values (Tctl, SVI2 rails, package energy) are read once per
//! update through the SMN window on the root complex. Every core then
//! reports its own clock, multiplier, VID and energy from its P-state and
//! energy MSRs, read while pinned to the core's first thread.
//!
//! Cores are grouped by NUMA node, both ordered by id.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::energy::EnergyCounter;
use super::DecodeContext;
use crate::access::{pci_address, read_smn, AffinityGuard, RegisterAccess};
use crate::constants::amd::f17;
use crate::constants::vid;
use crate::sensor::{SensorId, SensorType};
use crate::topology::{ThreadIdentity, Vendor};

/// Brand substrings and the Tctl to Tdie offset they imply, first match wins
const TDIE_OFFSETS: [(&[&str], f32); 3] = [
    (&["1600X", "1700X", "1800X"], -20.0),
    (&["1920X", "1950X"], -27.0),
    (&["1910", "1920"], -10.0),
];

pub fn tdie_offset(brand: &str) -> f32 {
    TDIE_OFFSETS
        .iter()
        .find(|(models, _)| models.iter().any(|m| brand.contains(m)))
        .map(|(_, offset)| *offset)
        .unwrap_or(0.0)
}

/// Voltage for an 8-bit VID code
pub fn vid_to_volts(code: u32) -> f64 {
    vid::BASE_VOLTS - vid::STEP_VOLTS * f64::from(code & 0xFF)
}

/// Decoded hardware P-state status
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PState {
    pub vid: u32,
    pub dfs: u32,
    pub fid: u32,
}

impl PState {
    pub fn from_eax(eax: u32) -> Self {
        Self {
            vid: (eax >> 14) & 0xFF,
            dfs: (eax >> 8) & 0x3F,
            fid: eax & 0xFF,
        }
    }

    /// Core clock in MHz, `None` for a zero divisor
    pub fn clock(&self) -> Option<f64> {
        (self.dfs != 0).then(|| f64::from(self.fid) / f64::from(self.dfs) * f17::FID_REFERENCE_MHZ)
    }

    pub fn multiplier(&self) -> Option<f64> {
        (self.dfs != 0).then(|| f64::from(self.fid) / f64::from(self.dfs) * 2.0)
    }

    pub fn voltage(&self) -> f64 {
        vid_to_volts(self.vid)
    }
}

struct ZenCore {
    mask: u64,
    clock: SensorId,
    multiplier: SensorId,
    power: SensorId,
    voltage: SensorId,
    energy: EnergyCounter,
}

struct ZenNode {
    id: u32,
    cores: Vec<ZenCore>,
}

pub struct Amd17Decoder {
    primary_mask: u64,
    tdie_offset: f32,
    energy_unit: f64,
    package_power: SensorId,
    tctl: SensorId,
    tdie: SensorId,
    core_voltage: SensorId,
    soc_voltage: SensorId,
    package_energy: EnergyCounter,
    nodes: Vec<ZenNode>,
}

/// Joules per count from the power unit register, ESU in bits 12:8
fn energy_unit(eax: u32) -> f64 {
    1.0 / f64::from(1u32 << ((eax >> 8) & 0x1F))
}

impl Amd17Decoder {
    pub fn matches(id: &ThreadIdentity) -> bool {
        id.vendor() == Vendor::Amd && id.has_msr() && id.family() == 0x17
    }

    /// Node ids in ascending order
    pub fn node_ids(&self) -> Vec<u32> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn energy_unit(&self) -> f64 {
        self.energy_unit
    }

    pub fn build(ctx: &mut DecodeContext<'_>) -> Self {
        let primary = ctx.primary().clone();
        let primary_mask = primary.affinity_mask();
        let min_interval = ctx.config.power_min_interval();

        let package_power = ctx.sensors.add("Package Power", SensorType::Power, Vec::new());
        let tctl = ctx.sensors.add("Core (Tctl)", SensorType::Temperature, Vec::new());
        let tdie = ctx.sensors.add("Core (Tdie)", SensorType::Temperature, Vec::new());
        let core_voltage = ctx.sensors.add("Core (SVI2)", SensorType::Voltage, Vec::new());
        let soc_voltage = ctx.sensors.add_inactive("SoC (SVI2)", SensorType::Voltage);

        let (energy_unit, package_count) = {
            let _pinned = AffinityGuard::pin(ctx.access, primary_mask);
            let unit = ctx
                .access
                .read_msr(f17::MSR_PWR_UNIT)
                .map(|(eax, _)| energy_unit(eax))
                .unwrap_or(0.0);
            let count = ctx.access.read_msr(f17::MSR_PKG_ENERGY_STAT).map(|(eax, _)| eax);
            (unit, count)
        };
        let mut package_energy = EnergyCounter::new(energy_unit, min_interval);
        if let Some(count) = package_count {
            package_energy.prime(count, ctx.access.monotonic_timestamp());
        }

        // node → core → first thread mask
        let mut tree: BTreeMap<u32, BTreeMap<u32, u64>> = BTreeMap::new();
        for thread in ctx.processor.threads() {
            tree.entry(thread.node_id())
                .or_default()
                .entry(thread.core_id())
                .or_insert_with(|| thread.affinity_mask());
        }

        let mut ordinal = 0;
        let mut nodes = Vec::with_capacity(tree.len());
        for (id, cores) in tree {
            let mut node = ZenNode { id, cores: Vec::with_capacity(cores.len()) };
            for (_, mask) in cores {
                ordinal += 1;
                let label = format!("Core #{}", ordinal);
                let mut energy = EnergyCounter::new(energy_unit, min_interval);
                if let Some((count, _)) = ctx.access.read_msr_on(f17::MSR_CORE_ENERGY_STAT, mask) {
                    energy.prime(count, ctx.access.monotonic_timestamp());
                }
                node.cores.push(ZenCore {
                    mask,
                    clock: ctx.sensors.add(label.clone(), SensorType::Clock, Vec::new()),
                    multiplier: ctx.sensors.add(label.clone(), SensorType::Factor, Vec::new()),
                    power: ctx.sensors.add(format!("{} (SMU)", label), SensorType::Power, Vec::new()),
                    voltage: ctx.sensors.add(format!("{} VID", label), SensorType::Voltage, Vec::new()),
                    energy,
                });
            }
            nodes.push(node);
        }
        debug!(nodes = nodes.len(), cores = ordinal, energy_unit, "Zen topology");

        Self {
            primary_mask,
            tdie_offset: tdie_offset(primary.brand()),
            energy_unit,
            package_power,
            tctl,
            tdie,
            core_voltage,
            soc_voltage,
            package_energy,
            nodes,
        }
    }

    fn smn(access: &dyn RegisterAccess, register: u32) -> Option<u32> {
        read_smn(access, pci_address(0, 0, 0), f17::SMN_INDEX_REGISTER, register)
    }

    fn update_package(&mut self, ctx: &mut DecodeContext<'_>) {
        let (energy, temperature, tfn, plane0, plane1) = {
            let _pinned = AffinityGuard::pin(ctx.access, self.primary_mask);
            (
                ctx.access.read_msr(f17::MSR_PKG_ENERGY_STAT).map(|(eax, _)| eax),
                Self::smn(ctx.access, f17::THM_TCON_CUR_TMP),
                Self::smn(ctx.access, f17::SVI_TFN),
                Self::smn(ctx.access, f17::SVI_PLANE0),
                Self::smn(ctx.access, f17::SVI_PLANE1),
            )
        };

        let (time, rate) = ctx.now();
        self.package_energy
            .sample(energy, time, rate)
            .publish(ctx.sensors, self.package_power);

        let tctl = temperature.map(|t| ((t >> 21) * 125) as f32 * 0.001);
        ctx.sensors.set(self.tctl, tctl);
        ctx.sensors.set(self.tdie, tctl.map(|t| t + self.tdie_offset));

        // a set TFN bit disables the plane
        let core = match (tfn, plane0) {
            (Some(tfn), Some(plane)) if tfn & 0x01 == 0 => Some(vid_to_volts(plane >> 16) as f32),
            _ => None,
        };
        ctx.sensors.set(self.core_voltage, core);

        match (tfn, plane1) {
            (Some(tfn), Some(plane)) if tfn & 0x02 == 0 => {
                ctx.sensors.set_and_activate(self.soc_voltage, Some(vid_to_volts(plane >> 16) as f32));
            }
            _ => ctx.sensors.set(self.soc_voltage, None),
        }
    }

    fn update_core(core: &mut ZenCore, ctx: &mut DecodeContext<'_>) {
        let (energy, pstate) = {
            let _pinned = AffinityGuard::pin(ctx.access, core.mask);
            (
                ctx.access.read_msr(f17::MSR_CORE_ENERGY_STAT).map(|(eax, _)| eax),
                ctx.access
                    .read_msr(f17::MSR_HARDWARE_PSTATE_STATUS)
                    .map(|(eax, _)| PState::from_eax(eax)),
            )
        };
        trace!(mask = format_args!("{:#x}", core.mask), ?pstate, "Zen core");

        ctx.sensors.set(core.clock, pstate.and_then(|p| p.clock()).map(|c| c as f32));
        ctx.sensors.set(core.multiplier, pstate.and_then(|p| p.multiplier()).map(|m| m as f32));
        ctx.sensors.set(core.voltage, pstate.map(|p| p.voltage() as f32));

        let (time, rate) = ctx.now();
        core.energy.sample(energy, time, rate).publish(ctx.sensors, core.power);
    }

    pub fn update(&mut self, ctx: &mut DecodeContext<'_>) {
        self.update_package(ctx);

        let spacing = ctx.config.clock_read_spacing();
        for node in &mut self.nodes {
            for core in &mut node.cores {
                if !spacing.is_zero() {
                    std::thread::sleep(spacing);
                }
                Self::update_core(core, ctx);
            }
        }
    }
}
