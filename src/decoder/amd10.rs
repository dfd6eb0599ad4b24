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

//! AMD families 10h to 16h
//!
//! These parts expose a single reported temperature for the whole package.
//! Core clocks come from COFVID_STATUS scaled by a time-stamp counter
//! multiplier that is measured once at construction: the "clocks not halted"
//! performance counter is timed over short windows with boost disabled.

use std::time::Duration;

use serde_json::json;
use tracing::{info, trace, warn};

use super::{amd_pci_address, core_label, DecodeContext};
use crate::access::{pci_address, read_smn, AffinityGuard, RegisterAccess, INVALID_PCI_ADDRESS};
use crate::calibration::timed_window;
use crate::constants::amd::{self, f10};
use crate::logger;
use crate::sensor::{Parameter, SensorId, SensorType};
use crate::topology::{ThreadIdentity, Vendor};

/// Windows used for the multiplier median
const MULTIPLIER_WINDOWS: usize = 3;

/// Device id of the miscellaneous control function, if the family has one
pub fn misc_control_device_id(family: u32, model: u32) -> Option<u16> {
    match (family, model & 0xF0) {
        (0x10, _) => Some(f10::FAMILY_10H_MISC_CONTROL_DEVICE_ID),
        (0x11, _) => Some(f10::FAMILY_11H_MISC_CONTROL_DEVICE_ID),
        (0x12, _) => Some(f10::FAMILY_12H_MISC_CONTROL_DEVICE_ID),
        (0x14, _) => Some(f10::FAMILY_14H_MISC_CONTROL_DEVICE_ID),
        (0x15, 0x00) => Some(f10::FAMILY_15H_MODEL_00_MISC_CONTROL_DEVICE_ID),
        (0x15, 0x10) => Some(f10::FAMILY_15H_MODEL_10_MISC_CONTROL_DEVICE_ID),
        (0x15, 0x30) => Some(f10::FAMILY_15H_MODEL_30_MISC_CONTROL_DEVICE_ID),
        (0x15, 0x60) => Some(f10::FAMILY_15H_MODEL_60_MISC_CONTROL_DEVICE_ID),
        (0x16, 0x00) => Some(f10::FAMILY_16H_MODEL_00_MISC_CONTROL_DEVICE_ID),
        (0x16, 0x30) => Some(f10::FAMILY_16H_MODEL_30_MISC_CONTROL_DEVICE_ID),
        _ => None,
    }
}

/// Temperature from the reported temperature control register
pub fn reported_temperature(family: u32, model: u32, value: u32, offset: f32) -> f32 {
    let range_select = value & 0x30000 == 0x30000;
    let mask = if family == 0x15 && range_select && model & 0xF0 == 0x00 {
        0x7FC
    } else {
        0x7FF
    };
    let raw = ((value >> 21) & mask) as f32 / 8.0 + offset;
    let shifted = match family {
        0x15 => range_select,
        0x16 => range_select || value & 0x80000 == 0x80000,
        _ => false,
    };
    if shifted {
        raw - 49.0
    } else {
        raw
    }
}

/// Divisor for a family 12h divisor id
fn family_12h_divisor(did: u32) -> f64 {
    match did {
        1 => 1.5,
        2 => 2.0,
        3 => 3.0,
        4 => 4.0,
        5 => 6.0,
        6 => 8.0,
        7 => 12.0,
        8 => 16.0,
        _ => 1.0,
    }
}

/// Core multiplier from COFVID_STATUS EAX.
///
/// Family 14h keeps the frequency id in the northbridge, read through
/// `frequency_id`; `None` if that read fails.
pub fn core_multiplier(family: u32, eax: u32, frequency_id: impl FnOnce() -> Option<u32>) -> Option<f64> {
    match family {
        0x10 | 0x11 | 0x15 | 0x16 => {
            let did = (eax >> 6) & 7;
            let fid = eax & 0x1F;
            Some(0.5 * f64::from(fid + 0x10) / f64::from(1u32 << did))
        }
        0x12 => {
            let fid = (eax >> 4) & 0x1F;
            Some(f64::from(fid + 0x10) / family_12h_divisor(eax & 0xF))
        }
        0x14 => {
            let msd = (eax >> 4) & 0x1F;
            let lsd = eax & 0xF;
            let fid = frequency_id()? & 0x1F;
            Some(f64::from(fid + 0x10) / (f64::from(msd) + f64::from(lsd) * 0.25 + 1.0))
        }
        _ => Some(1.0),
    }
}

pub struct Amd10Decoder {
    family: u32,
    model: u32,
    misc_device_id: Option<u16>,
    misc_address: u32,
    tsc_multiplier: f64,
    temperature: SensorId,
    bus_clock: SensorId,
    core_clocks: Vec<SensorId>,
}

impl Amd10Decoder {
    pub fn matches(id: &ThreadIdentity) -> bool {
        id.vendor() == Vendor::Amd && id.has_msr() && matches!(id.family(), 0x10..=0x16)
    }

    pub fn tsc_multiplier(&self) -> f64 {
        self.tsc_multiplier
    }

    pub fn build(ctx: &mut DecodeContext<'_>) -> Self {
        let primary = ctx.primary().clone();
        let core_count = ctx.processor.core_count();
        let (family, model) = (primary.family(), primary.model());

        let name = if core_count > 1 {
            format!("Core #1 - #{}", core_count)
        } else {
            "Core".to_string()
        };
        let temperature = ctx.sensors.add(
            name,
            SensorType::Temperature,
            vec![Parameter::new("Offset [°C]", "Temperature offset.", 0.0)],
        );

        let misc_device_id = misc_control_device_id(family, model);
        let misc_address = match misc_device_id {
            Some(id) => amd_pci_address(ctx.access, ctx.processor_index, amd::MISCELLANEOUS_CONTROL_FUNCTION, id),
            None => INVALID_PCI_ADDRESS,
        };

        let bus_clock = ctx.sensors.add("Bus Speed", SensorType::Clock, Vec::new());
        let core_clocks = (0..core_count)
            .map(|i| ctx.sensors.add(core_label(core_count, i), SensorType::Clock, Vec::new()))
            .collect();

        let mut decoder = Self {
            family,
            model,
            misc_device_id,
            misc_address,
            tsc_multiplier: 0.0,
            temperature,
            bus_clock,
            core_clocks,
        };
        decoder.tsc_multiplier = decoder.estimate_tsc_multiplier(ctx.access, &primary, ctx.tsc_frequency, ctx.config.calibration.window());
        decoder
    }

    fn multiplier(&self, access: &dyn RegisterAccess, eax: u32) -> Option<f64> {
        core_multiplier(self.family, eax, || {
            access.read_pci_config(self.misc_address, f10::CLOCK_POWER_TIMING_CONTROL_0_REGISTER)
        })
    }

    /// One timed window over the "clocks not halted" counter
    fn multiplier_window(&self, access: &dyn RegisterAccess, tsc_frequency: f64, window: Duration) -> Option<f64> {
        access.write_msr(amd::PERF_CTL_0, amd::PERF_CTL_CLOCKS_NOT_HALTED, 0);
        access.write_msr(amd::PERF_CTR_0, 0, 0);

        let sample = timed_window(access, window, || {
            access
                .read_msr(amd::PERF_CTR_0)
                .map(|(lo, hi)| (u64::from(hi) << 32) | u64::from(lo))
        })?;
        let (eax, _) = access.read_msr(amd::COFVID_STATUS)?;
        let core_multiplier = self.multiplier(access, eax)?;

        let bus = sample.frequency / core_multiplier;
        if !(bus > 0.0) {
            return None;
        }
        let estimate = 0.25 * (4.0 * tsc_frequency / bus).round();
        estimate.is_finite().then_some(estimate)
    }

    /// Median of a few windows after a discarded warm-up, with boost disabled.
    /// Every touched register and the thread affinity are restored.
    fn estimate_tsc_multiplier(
        &self,
        access: &dyn RegisterAccess,
        primary: &ThreadIdentity,
        tsc_frequency: f64,
        window: Duration,
    ) -> f64 {
        let _pinned = AffinityGuard::pin(access, primary.affinity_mask());

        let boost = primary.has_core_performance_boost();
        let hwcr = access.read_msr(amd::HWCR);
        if let (true, Some((lo, hi))) = (boost, hwcr) {
            access.write_msr(amd::HWCR, lo | amd::HWCR_CPB_DISABLE, hi);
        }
        let ctl = access.read_msr(amd::PERF_CTL_0);
        let ctr = access.read_msr(amd::PERF_CTR_0);

        let _ = self.multiplier_window(access, tsc_frequency, window);
        let mut estimates: Vec<f64> = (0..MULTIPLIER_WINDOWS)
            .filter_map(|_| self.multiplier_window(access, tsc_frequency, window))
            .collect();

        if let Some((lo, hi)) = ctl {
            access.write_msr(amd::PERF_CTL_0, lo, hi);
        }
        if let Some((lo, hi)) = ctr {
            access.write_msr(amd::PERF_CTR_0, lo, hi);
        }
        if let (true, Some((lo, hi))) = (boost, hwcr) {
            access.write_msr(amd::HWCR, lo, hi);
        }

        estimates.sort_by(|a, b| a.total_cmp(b));
        let multiplier = estimates.get(estimates.len() / 2).copied().unwrap_or(0.0);
        if multiplier > 0.0 {
            info!("Estimated TSC multiplier {:.2}", multiplier);
        } else {
            warn!("TSC multiplier estimation failed, core clocks fall back to the TSC rate");
        }
        logger::log_event(
            "tsc_multiplier",
            json!({ "family": self.family, "windows": estimates.len(), "multiplier": multiplier }),
        );
        multiplier
    }

    fn read_temperature(&self, access: &dyn RegisterAccess, offset: f32) -> Option<f32> {
        if self.misc_address == INVALID_PCI_ADDRESS {
            return None;
        }
        if self.misc_device_id == Some(f10::FAMILY_15H_MODEL_60_MISC_CONTROL_DEVICE_ID) {
            let value = read_smn(
                access,
                pci_address(0, 0, 0),
                f10::F15H_M60H_SMN_INDEX_REGISTER,
                f10::F15H_M60H_REPORTED_TEMP_CTRL_OFFSET,
            )?;
            return Some(((value >> 21) & 0x7FF) as f32 * 0.125 + offset);
        }
        let value = access.read_pci_config(self.misc_address, f10::REPORTED_TEMPERATURE_CONTROL_REGISTER)?;
        Some(reported_temperature(self.family, self.model, value, offset))
    }

    pub fn update(&mut self, ctx: &mut DecodeContext<'_>) {
        let offset = ctx.sensors.parameter(self.temperature, 0, 0.0);
        let temperature = self.read_temperature(ctx.access, offset);
        ctx.sensors.set(self.temperature, temperature);

        if !ctx.primary().has_tsc() {
            return;
        }
        let readings = ctx.read_each_core(amd::COFVID_STATUS);
        let mut bus = None;
        for (reading, &sensor) in readings.iter().zip(&self.core_clocks) {
            let multiplier = match reading {
                Some((eax, _)) if self.tsc_multiplier > 0.0 => self.multiplier(ctx.access, *eax),
                _ => None,
            };
            let clock = match multiplier {
                Some(m) => {
                    bus = Some(ctx.tsc_frequency / self.tsc_multiplier);
                    m * ctx.tsc_frequency / self.tsc_multiplier
                }
                None => ctx.tsc_frequency,
            };
            ctx.sensors.set(sensor, Some(clock as f32));
        }
        if let Some(bus) = bus.filter(|b| *b > 0.0) {
            ctx.sensors.set(self.bus_clock, Some(bus as f32));
        }
        trace!(family = self.family, tsc_multiplier = self.tsc_multiplier, "K10 update");
    }
}
