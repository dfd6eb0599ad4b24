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

//! Hwprobe - CPU topology discovery and register decoding for Linux
//!
//! This library enumerates logical processors, groups them into packages and
//! cores, calibrates the time-stamp counter, and decodes model-specific and
//! PCI configuration registers into live clock, temperature, power, voltage,
//! load and factor sensors with a bounded history.
//!
//! ```no_run
//! use hwprobe::DeviceCollection;
//!
//! let mut devices = DeviceCollection::discover()?;
//! devices.update();
//! for cpu in devices.cpus() {
//!     for sensor in cpu.temperatures() {
//!         println!("{} {}: {:?}", cpu.name(), sensor.name(), sensor.value());
//!     }
//! }
//! devices.close();
//! # Ok::<(), hwprobe::HwprobeError>(())
//! ```

pub mod access;
pub mod calibration;
pub mod collection;
pub mod config;
pub mod constants;
pub mod control;
pub mod cpu;
pub mod decoder;
pub mod load;
pub mod logger;
pub mod sensor;
pub mod topology;

#[cfg(test)]
pub mod test_utils;

pub use collection::DeviceCollection;
pub use config::EngineConfig;
pub use control::{Control, ControlMode};
pub use cpu::Cpu;
pub use hp_error::{HwprobeError, Result};
pub use sensor::{Sensor, SensorType};
