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

//! Intel digital thermal sensors, core clocks and RAPL energy

use tracing::{debug, trace};

use super::energy::{EnergyCounter, EnergySample};
use super::{core_label, DecodeContext};
use crate::constants::intel::*;
use crate::sensor::{Parameter, SensorId, SensorType};
use crate::topology::{ThreadIdentity, Vendor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Microarchitecture {
    Unknown,
    NetBurst,
    Core,
    Atom,
    Nehalem,
    SandyBridge,
    IvyBridge,
    Haswell,
    Broadwell,
    Silvermont,
    Skylake,
    Airmont,
    KabyLake,
    ApolloLake,
    CoffeeLake,
}

/// Where the junction temperature limit comes from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TjMax {
    Fixed(f32),
    /// Read per core from IA32_TEMPERATURE_TARGET
    Register,
}

impl Microarchitecture {
    /// Classify a family/model/stepping signature.
    pub fn classify(family: u32, model: u32, stepping: u32) -> (Self, TjMax) {
        use Microarchitecture::*;
        match family {
            0x06 => match model {
                // Core 2 65nm: B2, G0, M0
                0x0F => (
                    Core,
                    TjMax::Fixed(match stepping {
                        0x06 => 90.0,
                        0x0B => 100.0,
                        _ => 95.0,
                    }),
                ),
                // Core 2 45nm
                0x17 => (Core, TjMax::Fixed(100.0)),
                // Atom 45nm: C0, A0
                0x1C => (
                    Atom,
                    TjMax::Fixed(match stepping {
                        0x0A => 100.0,
                        _ => 90.0,
                    }),
                ),
                0x1A | 0x1E | 0x1F | 0x25 | 0x2C | 0x2E | 0x2F => (Nehalem, TjMax::Register),
                0x2A | 0x2D => (SandyBridge, TjMax::Register),
                0x3A | 0x3E => (IvyBridge, TjMax::Register),
                0x3C | 0x3F | 0x45 | 0x46 => (Haswell, TjMax::Register),
                0x3D | 0x47 | 0x4F | 0x56 => (Broadwell, TjMax::Register),
                0x36 => (Atom, TjMax::Register),
                0x37 | 0x4A | 0x4D | 0x5A | 0x5D => (Silvermont, TjMax::Register),
                0x4E | 0x5E | 0x55 => (Skylake, TjMax::Register),
                0x4C => (Airmont, TjMax::Register),
                0x8E | 0x9E => (KabyLake, TjMax::Register),
                0x5C => (ApolloLake, TjMax::Register),
                0xAE => (CoffeeLake, TjMax::Register),
                _ => (Unknown, TjMax::Fixed(DEFAULT_TJMAX)),
            },
            0x0F => match model {
                0x00..=0x04 | 0x06 => (NetBurst, TjMax::Fixed(DEFAULT_TJMAX)),
                _ => (Unknown, TjMax::Fixed(DEFAULT_TJMAX)),
            },
            _ => (Unknown, TjMax::Fixed(DEFAULT_TJMAX)),
        }
    }

    /// Time-stamp counter multiplier from the architecture's ratio register
    fn tsc_multiplier(self, read: impl Fn(u32) -> Option<(u32, u32)>) -> f64 {
        use Microarchitecture::*;
        match self {
            NetBurst | Atom | Core => read(IA32_PERF_STATUS)
                .map(|(_, edx)| f64::from((edx >> 8) & 0x1F) + 0.5 * f64::from((edx >> 14) & 1))
                .unwrap_or(0.0),
            Nehalem | SandyBridge | IvyBridge | Haswell | Broadwell | Silvermont | Skylake | Airmont
            | KabyLake | ApolloLake | CoffeeLake => read(MSR_PLATFORM_INFO)
                .map(|(eax, _)| f64::from((eax >> 8) & 0xFF))
                .unwrap_or(0.0),
            Unknown => 0.0,
        }
    }

    /// Current core multiplier from IA32_PERF_STATUS
    pub fn core_multiplier(self, eax: u32) -> f64 {
        use Microarchitecture::*;
        match self {
            Nehalem => f64::from(eax & 0xFF),
            SandyBridge | IvyBridge | Haswell | Broadwell | Silvermont | Skylake | ApolloLake
            | KabyLake | CoffeeLake => f64::from((eax >> 8) & 0xFF),
            _ => f64::from((eax >> 8) & 0x1F) + 0.5 * f64::from((eax >> 14) & 1),
        }
    }

    fn has_rapl(self) -> bool {
        use Microarchitecture::*;
        matches!(
            self,
            SandyBridge | IvyBridge | Haswell | Broadwell | Skylake | Silvermont | Airmont | KabyLake | ApolloLake
        )
    }

    /// Joules per energy count from MSR_RAPL_POWER_UNIT EAX
    fn energy_unit(self, eax: u32) -> f64 {
        let bits = (eax >> 8) & 0x1F;
        match self {
            Microarchitecture::Silvermont | Microarchitecture::Airmont => 1.0e-6 * f64::from(1u32 << bits),
            _ => 1.0 / f64::from(1u32 << bits),
        }
    }
}

/// Energy status registers and their sensor names
const RAPL_DOMAINS: [(u32, &str); 4] = [
    (MSR_PKG_ENERGY_STATUS, "CPU Package"),
    (MSR_PP0_ENERGY_STATUS, "CPU Cores"),
    (MSR_PP1_ENERGY_STATUS, "CPU Graphics"),
    (MSR_DRAM_ENERGY_STATUS, "CPU DRAM"),
];

struct PowerDomain {
    register: u32,
    sensor: SensorId,
    counter: EnergyCounter,
}

pub struct IntelDecoder {
    microarchitecture: Microarchitecture,
    tsc_multiplier: f64,
    core_temperatures: Vec<SensorId>,
    package_temperature: Option<SensorId>,
    bus_clock: SensorId,
    core_clocks: Vec<SensorId>,
    powers: Vec<PowerDomain>,
}

fn thermal_parameters(tjmax: f32) -> Vec<Parameter> {
    vec![
        Parameter::new("TjMax [°C]", "TjMax temperature of the core sensor.\nTemperature = TjMax - TSlope * Value.", tjmax),
        Parameter::new("TSlope [°C]", "Temperature slope of the digital thermal sensor.\nTemperature = TjMax - TSlope * Value.", 1.0),
    ]
}

/// Temperature from a thermal status register, `None` if the reading is not valid
pub fn dts_temperature(eax: u32, tjmax: f32, slope: f32) -> Option<f32> {
    if eax & THERM_READING_VALID == 0 {
        return None;
    }
    let delta = ((eax & 0x007F_0000) >> 16) as f32;
    Some(tjmax - slope * delta)
}

impl IntelDecoder {
    pub fn matches(id: &ThreadIdentity) -> bool {
        id.vendor() == Vendor::Intel && id.has_msr()
    }

    pub fn microarchitecture(&self) -> Microarchitecture {
        self.microarchitecture
    }

    pub fn tsc_multiplier(&self) -> f64 {
        self.tsc_multiplier
    }

    pub fn build(ctx: &mut DecodeContext<'_>) -> Self {
        let primary = ctx.primary().clone();
        let (arch, tjmax) = Microarchitecture::classify(primary.family(), primary.model(), primary.stepping());
        let core_count = ctx.processor.core_count();

        let tjmax_per_core: Vec<f32> = ctx
            .processor
            .cores()
            .iter()
            .map(|core| match tjmax {
                TjMax::Fixed(t) => t,
                TjMax::Register => ctx
                    .access
                    .read_msr_on(IA32_TEMPERATURE_TARGET, core.primary().affinity_mask())
                    .map(|(eax, _)| ((eax >> 16) & 0xFF) as f32)
                    .unwrap_or(DEFAULT_TJMAX),
            })
            .collect();

        let mask = primary.affinity_mask();
        let tsc_multiplier = arch.tsc_multiplier(|index| ctx.access.read_msr_on(index, mask));
        debug!(?arch, tsc_multiplier, "Intel microarchitecture");

        let mut core_temperatures = Vec::new();
        if primary.has_core_dts() && arch != Microarchitecture::Unknown {
            for (i, tjmax) in tjmax_per_core.iter().enumerate() {
                core_temperatures.push(ctx.sensors.add(
                    core_label(core_count, i),
                    SensorType::Temperature,
                    thermal_parameters(*tjmax),
                ));
            }
        }

        let package_temperature = (primary.has_package_dts() && arch != Microarchitecture::Unknown).then(|| {
            ctx.sensors.add(
                "CPU Package",
                SensorType::Temperature,
                thermal_parameters(tjmax_per_core.first().copied().unwrap_or(DEFAULT_TJMAX)),
            )
        });

        let bus_clock = ctx.sensors.add("Bus Speed", SensorType::Clock, Vec::new());
        let core_clocks = (0..core_count)
            .map(|i| ctx.sensors.add(core_label(core_count, i), SensorType::Clock, Vec::new()))
            .collect();

        let mut powers = Vec::new();
        if arch.has_rapl() {
            let unit = ctx
                .access
                .read_msr_on(MSR_RAPL_POWER_UNIT, mask)
                .map(|(eax, _)| arch.energy_unit(eax))
                .unwrap_or(0.0);
            if unit > 0.0 {
                for (register, label) in RAPL_DOMAINS {
                    // domains the processor does not implement fail to read
                    let Some((count, _)) = ctx.access.read_msr_on(register, mask) else {
                        trace!(register = format_args!("{:#x}", register), "RAPL domain absent");
                        continue;
                    };
                    let mut counter = EnergyCounter::new(unit, ctx.config.power_min_interval());
                    counter.prime(count, ctx.access.monotonic_timestamp());
                    powers.push(PowerDomain {
                        register,
                        sensor: ctx.sensors.add(label, SensorType::Power, Vec::new()),
                        counter,
                    });
                }
            }
        }

        Self {
            microarchitecture: arch,
            tsc_multiplier,
            core_temperatures,
            package_temperature,
            bus_clock,
            core_clocks,
            powers,
        }
    }

    pub fn update(&mut self, ctx: &mut DecodeContext<'_>) {
        for (core, &sensor) in ctx.processor.cores().iter().zip(&self.core_temperatures) {
            let tjmax = ctx.sensors.parameter(sensor, 0, DEFAULT_TJMAX);
            let slope = ctx.sensors.parameter(sensor, 1, 1.0);
            let value = ctx
                .access
                .read_msr_on(IA32_THERM_STATUS, core.primary().affinity_mask())
                .and_then(|(eax, _)| dts_temperature(eax, tjmax, slope));
            ctx.sensors.set(sensor, value);
        }

        if let Some(sensor) = self.package_temperature {
            let tjmax = ctx.sensors.parameter(sensor, 0, DEFAULT_TJMAX);
            let slope = ctx.sensors.parameter(sensor, 1, 1.0);
            let value = ctx
                .access
                .read_msr_on(IA32_PACKAGE_THERM_STATUS, ctx.primary().affinity_mask())
                .and_then(|(eax, _)| dts_temperature(eax, tjmax, slope));
            ctx.sensors.set(sensor, value);
        }

        if ctx.primary().has_tsc() && self.tsc_multiplier > 0.0 {
            let readings = ctx.read_each_core(IA32_PERF_STATUS);
            let bus = ctx.tsc_frequency / self.tsc_multiplier;
            for (reading, &sensor) in readings.iter().zip(&self.core_clocks) {
                let clock = match reading {
                    Some((eax, _)) => self.microarchitecture.core_multiplier(*eax) * bus,
                    None => ctx.tsc_frequency,
                };
                ctx.sensors.set(sensor, Some(clock as f32));
            }
            if bus > 0.0 {
                ctx.sensors.set(self.bus_clock, Some(bus as f32));
            }
        }

        let mask = ctx.primary().affinity_mask();
        for domain in &mut self.powers {
            let reading = ctx.access.read_msr_on(domain.register, mask).map(|(eax, _)| eax);
            let (time, rate) = ctx.now();
            let sample: EnergySample = domain.counter.sample(reading, time, rate);
            sample.publish(ctx.sensors, domain.sensor);
        }
    }
}
