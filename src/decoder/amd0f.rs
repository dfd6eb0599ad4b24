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

//! AMD family 0Fh (K8)
//!
//! Temperatures come from the northbridge thermtrip register, which reports
//! the core selected by the value last written to it.

use tracing::debug;

use super::{amd_pci_address, core_label, DecodeContext};
use crate::access::INVALID_PCI_ADDRESS;
use crate::constants::amd::{self, f0f};
use crate::sensor::{Parameter, SensorId, SensorType};
use crate::topology::{ThreadIdentity, Vendor};

/// Temperature offset for a model, in °C
pub fn temperature_offset(model: u32) -> f32 {
    let mut offset = -49.0;
    // AM2+ 65nm and later, except a few mobile parts
    if model >= 0x69 && !matches!(model, 0x6C | 0x7C | 0xC1) {
        offset += 21.0;
    }
    offset
}

/// Thermtrip select values for the first and second core
pub fn core_selectors(model: u32) -> [u32; 2] {
    if model < 40 {
        [0x0, 0x4]
    } else {
        [0x4, 0x0]
    }
}

/// `(core multiplier, maximum multiplier)` from FIDVID_STATUS EAX
pub fn fid_multipliers(eax: u32) -> (f64, f64) {
    let current = 0.5 * f64::from((eax & 0x3F) + 8);
    let maximum = 0.5 * f64::from(((eax >> 16) & 0x3F) + 8);
    (current, maximum)
}

pub struct Amd0fDecoder {
    misc_address: u32,
    selectors: [u32; 2],
    core_temperatures: Vec<SensorId>,
    bus_clock: SensorId,
    core_clocks: Vec<SensorId>,
}

impl Amd0fDecoder {
    pub fn matches(id: &ThreadIdentity) -> bool {
        id.vendor() == Vendor::Amd && id.has_msr() && id.family() == 0x0F
    }

    pub fn build(ctx: &mut DecodeContext<'_>) -> Self {
        let primary = ctx.primary().clone();
        let core_count = ctx.processor.core_count();
        let offset = temperature_offset(primary.model());

        let mut core_temperatures = Vec::new();
        if primary.has_thermal_trip() {
            for i in 0..core_count {
                core_temperatures.push(ctx.sensors.add(
                    format!("Core #{}", i + 1),
                    SensorType::Temperature,
                    vec![Parameter::new(
                        "Offset [°C]",
                        "Temperature offset of the thermal sensor.\nTemperature = Value + Offset.",
                        offset,
                    )],
                ));
            }
        }

        let misc_address = amd_pci_address(
            ctx.access,
            ctx.processor_index,
            amd::MISCELLANEOUS_CONTROL_FUNCTION,
            f0f::MISCELLANEOUS_CONTROL_DEVICE_ID,
        );
        debug!(misc_address = format_args!("{:#x}", misc_address), "K8 northbridge");

        let bus_clock = ctx.sensors.add("Bus Speed", SensorType::Clock, Vec::new());
        let core_clocks = (0..core_count)
            .map(|i| ctx.sensors.add(core_label(core_count, i), SensorType::Clock, Vec::new()))
            .collect();

        Self {
            misc_address,
            selectors: core_selectors(primary.model()),
            core_temperatures,
            bus_clock,
            core_clocks,
        }
    }

    fn read_temperature(&self, ctx: &DecodeContext<'_>, core: usize) -> Option<f32> {
        if self.misc_address == INVALID_PCI_ADDRESS {
            return None;
        }
        let selector = self.selectors[usize::from(core > 0)];
        if !ctx
            .access
            .write_pci_config(self.misc_address, f0f::THERMTRIP_STATUS_REGISTER, selector)
        {
            return None;
        }
        let value = ctx
            .access
            .read_pci_config(self.misc_address, f0f::THERMTRIP_STATUS_REGISTER)?;
        Some(((value >> 16) & 0xFF) as f32)
    }

    pub fn update(&mut self, ctx: &mut DecodeContext<'_>) {
        for (i, &sensor) in self.core_temperatures.iter().enumerate() {
            let offset = ctx.sensors.parameter(sensor, 0, 0.0);
            let value = self.read_temperature(ctx, i).map(|t| t + offset);
            ctx.sensors.set(sensor, value);
        }

        if ctx.primary().has_tsc() {
            let readings = ctx.read_each_core(amd::FIDVID_STATUS);
            let mut bus = None;
            for (reading, &sensor) in readings.iter().zip(&self.core_clocks) {
                let clock = match reading {
                    Some((eax, _)) => {
                        let (current, maximum) = fid_multipliers(*eax);
                        bus = Some(ctx.tsc_frequency / maximum);
                        current * ctx.tsc_frequency / maximum
                    }
                    None => ctx.tsc_frequency,
                };
                ctx.sensors.set(sensor, Some(clock as f32));
            }
            if let Some(bus) = bus {
                ctx.sensors.set(self.bus_clock, Some(bus as f32));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::pci_address;
    use crate::config::EngineConfig;
    use crate::sensor::SensorBank;
    use crate::test_utils::test_utils::{amd_identity, fast_config, FakeAccess};
    use crate::topology::{group_by_processor, Processor};

    fn processor(model: u32) -> Processor {
        let brand = "AMD Athlon(tm) 64 X2 Dual Core Processor 4800+";
        let threads = vec![
            amd_identity(0, 0x0F, model, 0, 2, brand),
            amd_identity(1, 0x0F, model, 1, 2, brand),
        ];
        group_by_processor(threads).remove(0)
    }

    fn context<'a>(
        access: &'a FakeAccess,
        processor: &'a Processor,
        config: &'a EngineConfig,
        sensors: &'a mut SensorBank,
    ) -> DecodeContext<'a> {
        DecodeContext {
            access,
            processor,
            processor_index: 0,
            tsc_frequency: 2400.0,
            config,
            sensors,
        }
    }

    fn value(sensors: &SensorBank, sensor_type: SensorType, name: &str) -> Option<f32> {
        sensors
            .iter()
            .find(|s| s.sensor_type() == sensor_type && s.name() == name)
            .and_then(|s| s.value())
    }

    #[test]
    fn test_temperature_offset_by_model() {
        assert_eq!(temperature_offset(0x43), -49.0);
        assert_eq!(temperature_offset(0x6B), -28.0);
        assert_eq!(temperature_offset(0x6C), -49.0);
        assert_eq!(temperature_offset(0xC1), -49.0);
    }

    #[test]
    fn test_core_selectors_swap_on_later_models() {
        assert_eq!(core_selectors(0x23), [0x0, 0x4]);
        assert_eq!(core_selectors(0x43), [0x4, 0x0]);
    }

    #[test]
    fn test_fid_multipliers() {
        // current fid 14, max fid 16
        let (current, maximum) = fid_multipliers((16 << 16) | 14);
        assert_eq!(current, 11.0);
        assert_eq!(maximum, 12.0);
    }

    #[test]
    fn test_temperatures_and_clocks() {
        let access = FakeAccess::new();
        let processor = processor(0x43);
        assert_eq!(processor.core_count(), 2);
        let config = fast_config();
        let mut sensors = SensorBank::new("/amdcpu/0", &config.history);

        let misc = pci_address(0, 0x18, 3);
        access.set_pci(misc, 0, (0x1103 << 16) | 0x1022);
        // model 0x43 selects core 0 with 0x4 and core 1 with 0x0
        access.set_pci_selected(misc, 0xE4, 0x4, 90 << 16);
        access.set_pci_selected(misc, 0xE4, 0x0, 95 << 16);
        access.set_msr_on(0, amd::FIDVID_STATUS, (16 << 16) | 14, 0);
        access.set_msr_on(1, amd::FIDVID_STATUS, (16 << 16) | 2, 0);

        let mut decoder = Amd0fDecoder::build(&mut context(&access, &processor, &config, &mut sensors));
        decoder.update(&mut context(&access, &processor, &config, &mut sensors));

        assert_eq!(value(&sensors, SensorType::Temperature, "Core #1"), Some(41.0));
        assert_eq!(value(&sensors, SensorType::Temperature, "Core #2"), Some(46.0));
        assert_eq!(value(&sensors, SensorType::Clock, "Bus Speed"), Some(200.0));
        assert_eq!(value(&sensors, SensorType::Clock, "CPU Core #1"), Some(2200.0));
        assert_eq!(value(&sensors, SensorType::Clock, "CPU Core #2"), Some(1000.0));
    }

    #[test]
    fn test_missing_northbridge_leaves_temperatures_absent() {
        let access = FakeAccess::new();
        let processor = processor(0x43);
        let config = fast_config();
        let mut sensors = SensorBank::new("/amdcpu/0", &config.history);

        let mut decoder = Amd0fDecoder::build(&mut context(&access, &processor, &config, &mut sensors));
        decoder.update(&mut context(&access, &processor, &config, &mut sensors));

        assert_eq!(sensors.of_type(SensorType::Temperature).len(), 2);
        assert_eq!(value(&sensors, SensorType::Temperature, "Core #1"), None);
        assert!(access.pci_writes.lock().is_empty());
        // FIDVID unreadable: counter rate
        assert_eq!(value(&sensors, SensorType::Clock, "CPU Core #1"), Some(2400.0));
        assert_eq!(value(&sensors, SensorType::Clock, "Bus Speed"), None);
    }
}
