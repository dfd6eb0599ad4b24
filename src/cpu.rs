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

//! One physical processor package and the sensors it publishes

use std::sync::Arc;

use tracing::{debug, info};

use crate::access::RegisterAccess;
use crate::calibration::{CalibrationResult, FrequencyCalibrator, TscTracker};
use crate::config::EngineConfig;
use crate::decoder::{self, core_label, DecodeContext, Decoder};
use crate::load::{CpuLoad, ProcessorTimes};
use crate::sensor::{Sensor, SensorBank, SensorId, SensorType};
use crate::topology::{Processor, Vendor};

pub struct Cpu {
    index: usize,
    name: String,
    processor: Processor,
    access: Arc<dyn RegisterAccess>,
    times: Arc<dyn ProcessorTimes>,
    config: EngineConfig,
    calibration: Option<CalibrationResult>,
    tsc: TscTracker,
    load: CpuLoad,
    total_load: Option<SensorId>,
    core_loads: Vec<SensorId>,
    decoder: Decoder,
    sensors: SensorBank,
}

impl Cpu {
    /// Build the device for `processor`, the `index`-th in discovery order.
    ///
    /// Calibrates the time-stamp counter (when present) and selects the
    /// decoder once; neither is revisited for the lifetime of the device.
    pub fn new(
        index: usize,
        processor: Processor,
        access: Arc<dyn RegisterAccess>,
        times: Arc<dyn ProcessorTimes>,
        config: &EngineConfig,
    ) -> Self {
        let primary = processor.primary().clone();
        let descriptor = decoder::select(&primary);
        let mut sensors = SensorBank::new(format!("/{}/{}", descriptor.hardware_kind, index), &config.history);

        let name = if primary.name().is_empty() {
            format!("{} CPU", primary.vendor().as_str())
        } else {
            primary.name().to_string()
        };

        let core_count = processor.core_count();
        let total_load = (core_count > 1).then(|| sensors.add("CPU Total", SensorType::Load, Vec::new()));
        let core_loads = (0..core_count)
            .map(|i| sensors.add(core_label(core_count, i), SensorType::Load, Vec::new()))
            .collect();
        let load = CpuLoad::new(&processor, times.as_ref());

        let calibration = primary
            .has_tsc()
            .then(|| FrequencyCalibrator::new(&config.calibration).estimate(access.as_ref(), primary.affinity_mask()));
        let tsc = TscTracker::new(calibration.map(|c| c.frequency).unwrap_or(0.0), &config.tsc_correction);

        let decoder = {
            let mut ctx = DecodeContext {
                access: access.as_ref(),
                processor: &processor,
                processor_index: index,
                tsc_frequency: tsc.frequency(),
                config,
                sensors: &mut sensors,
            };
            (descriptor.build)(&mut ctx)
        };

        info!(
            "CPU {}: {} ({} cores, {} threads, decoder {})",
            index,
            name,
            core_count,
            processor.thread_count(),
            decoder.name()
        );

        Self {
            index,
            name,
            processor,
            access,
            times,
            config: config.clone(),
            calibration,
            tsc,
            load,
            total_load,
            core_loads,
            decoder,
            sensors,
        }
    }

    /// Refresh every sensor of this device. Failed reads leave only the
    /// dependent sensors empty.
    pub fn update(&mut self) {
        let primary = self.processor.primary();
        if primary.has_tsc() && primary.has_invariant_tsc() {
            self.tsc.update(self.access.as_ref(), primary.affinity_mask());
        }

        if self.load.update(self.times.as_ref()) {
            for (i, &sensor) in self.core_loads.iter().enumerate() {
                self.sensors.set(sensor, self.load.core_load(i));
            }
            if let Some(sensor) = self.total_load {
                self.sensors.set(sensor, self.load.total_load());
            }
        }

        let mut ctx = DecodeContext {
            access: self.access.as_ref(),
            processor: &self.processor,
            processor_index: self.index,
            tsc_frequency: self.tsc.frequency(),
            config: &self.config,
            sensors: &mut self.sensors,
        };
        self.decoder.update(&mut ctx);
        debug!(cpu = self.index, tsc_mhz = self.tsc.frequency(), "CPU updated");
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> &str {
        self.sensors.hardware_identifier()
    }

    pub fn vendor(&self) -> Vendor {
        self.processor.primary().vendor()
    }

    pub fn family(&self) -> u32 {
        self.processor.primary().family()
    }

    pub fn model(&self) -> u32 {
        self.processor.primary().model()
    }

    pub fn stepping(&self) -> u32 {
        self.processor.primary().stepping()
    }

    pub fn core_count(&self) -> usize {
        self.processor.core_count()
    }

    pub fn thread_count(&self) -> usize {
        self.processor.thread_count()
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn has_msr(&self) -> bool {
        self.processor.primary().has_msr()
    }

    pub fn has_tsc(&self) -> bool {
        self.processor.primary().has_tsc()
    }

    pub fn has_invariant_tsc(&self) -> bool {
        self.processor.primary().has_invariant_tsc()
    }

    /// Current time-stamp counter rate in MHz, 0 without a counter
    pub fn tsc_frequency(&self) -> f64 {
        self.tsc.frequency()
    }

    /// Result of the construction-time calibration
    pub fn calibration(&self) -> Option<CalibrationResult> {
        self.calibration
    }

    pub fn decoder_name(&self) -> &'static str {
        self.decoder.name()
    }

    pub fn sensors(&self) -> &SensorBank {
        &self.sensors
    }

    pub fn sensors_mut(&mut self) -> &mut SensorBank {
        &mut self.sensors
    }

    pub fn loads(&self) -> Vec<&Sensor> {
        self.sensors.of_type(SensorType::Load)
    }

    pub fn clocks(&self) -> Vec<&Sensor> {
        self.sensors.of_type(SensorType::Clock)
    }

    pub fn temperatures(&self) -> Vec<&Sensor> {
        self.sensors.of_type(SensorType::Temperature)
    }

    pub fn powers(&self) -> Vec<&Sensor> {
        self.sensors.of_type(SensorType::Power)
    }

    pub fn voltages(&self) -> Vec<&Sensor> {
        self.sensors.of_type(SensorType::Voltage)
    }

    pub fn factors(&self) -> Vec<&Sensor> {
        self.sensors.of_type(SensorType::Factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{amd, intel};
    use crate::load::{MockProcessorTimes, ThreadTimes};
    use crate::test_utils::test_utils::{amd_identity, fast_config, intel_identity, FakeAccess};
    use crate::topology::group_by_processor;
    use std::collections::BTreeMap;

    fn idle_times(threads: u32) -> MockProcessorTimes {
        let mut times = MockProcessorTimes::new();
        let mut tick = 0u64;
        times.expect_times().returning(move || {
            tick += 100;
            Ok((0..threads)
                .map(|i| (i, ThreadTimes { idle: tick / 2, total: tick }))
                .collect::<BTreeMap<_, _>>())
        });
        times
    }

    #[test]
    fn test_intel_cpu_end_to_end() {
        let access = Arc::new(FakeAccess::new());
        access.set_msr(intel::IA32_TEMPERATURE_TARGET, 100 << 16, 0);
        access.set_msr(intel::MSR_PLATFORM_INFO, 30 << 8, 0);
        access.set_msr(intel::IA32_THERM_STATUS, 0x8000_0000 | (50 << 16), 0);
        access.set_msr(intel::IA32_PERF_STATUS, 30 << 8, 0);

        let threads = vec![
            intel_identity(0, 6, 0x9E, 0, "Intel(R) Core(TM) i5-7600 CPU @ 3.50GHz"),
            intel_identity(1, 6, 0x9E, 2, "Intel(R) Core(TM) i5-7600 CPU @ 3.50GHz"),
        ];
        let processor = group_by_processor(threads).remove(0);
        let times: Arc<dyn ProcessorTimes> = Arc::new(idle_times(2));

        let mut cpu = Cpu::new(0, processor, access.clone(), times, &fast_config());
        assert_eq!(cpu.identifier(), "/intelcpu/0");
        assert_eq!(cpu.name(), "Intel Core i5-7600");
        assert_eq!(cpu.decoder_name(), "intel");
        assert_eq!(cpu.vendor(), Vendor::Intel);
        assert!(cpu.has_tsc());
        assert!((cpu.tsc_frequency() - 3000.0).abs() < 10.0);

        cpu.update();
        assert_eq!(cpu.loads().len(), 3);
        assert_eq!(cpu.loads()[0].name(), "CPU Total");
        assert_eq!(cpu.loads()[0].value(), Some(50.0));
        assert_eq!(cpu.temperatures()[0].value(), Some(50.0));
        assert!(cpu.clocks().iter().all(|c| c.value().is_some()));
    }

    #[test]
    fn test_single_core_has_no_total_load() {
        let access = Arc::new(FakeAccess::new());
        access.set_msr(amd::COFVID_STATUS, 14, 0);
        let processor = group_by_processor(vec![amd_identity(0, 0x10, 0x04, 0, 1, "AMD Athlon(tm) II 160u Processor")]).remove(0);
        let times: Arc<dyn ProcessorTimes> = Arc::new(idle_times(1));

        let mut cpu = Cpu::new(3, processor, access, times, &fast_config());
        assert_eq!(cpu.identifier(), "/amdcpu/3");
        cpu.update();
        let loads = cpu.loads();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].name(), "CPU Core");
        assert_eq!(loads[0].value(), Some(50.0));
    }
}
