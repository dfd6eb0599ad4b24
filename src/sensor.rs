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

//! Sensors: current value, running min/max, tunable parameters and a
//! decimated, time-bounded history.
//!
//! A value of `None` means the underlying register could not be read this tick.
//! It is never replaced by zero.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::HistoryConfig;
use crate::control::Control;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Voltage,
    Clock,
    Temperature,
    Load,
    Fan,
    Control,
    Level,
    Factor,
    Power,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Voltage => "voltage",
            SensorType::Clock => "clock",
            SensorType::Temperature => "temperature",
            SensorType::Load => "load",
            SensorType::Fan => "fan",
            SensorType::Control => "control",
            SensorType::Level => "level",
            SensorType::Factor => "factor",
            SensorType::Power => "power",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Voltage => "V",
            SensorType::Clock => "MHz",
            SensorType::Temperature => "°C",
            SensorType::Load | SensorType::Control | SensorType::Level => "%",
            SensorType::Fan => "RPM",
            SensorType::Factor => "x",
            SensorType::Power => "W",
        }
    }
}

/// User-adjustable coefficient of a sensor formula (offset, TjMax, slope)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    name: String,
    description: String,
    default_value: f32,
    value: f32,
}

impl Parameter {
    pub fn new(name: impl Into<String>, description: impl Into<String>, default_value: f32) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default_value,
            value: default_value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn default_value(&self) -> f32 {
        self.default_value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn set_value(&mut self, value: f32) {
        self.value = value;
    }

    pub fn reset(&mut self) {
        self.value = self.default_value;
    }

    pub fn is_default(&self) -> bool {
        self.value == self.default_value
    }
}

/// One averaged history entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSample {
    pub value: f32,
    pub time: SystemTime,
}

/// Read-only view of a sensor for report layers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub identifier: String,
    pub name: String,
    pub sensor_type: SensorType,
    pub value: Option<f32>,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub parameters: Vec<(String, f32)>,
}

#[derive(Debug)]
pub struct Sensor {
    identifier: String,
    name: String,
    index: usize,
    sensor_type: SensorType,
    active: bool,
    parameters: Vec<Parameter>,
    value: Option<f32>,
    min: Option<f32>,
    max: Option<f32>,
    history: VecDeque<SensorSample>,
    pending_sum: f32,
    pending_count: usize,
    retention: Duration,
    samples_per_entry: usize,
    control: Option<Control>,
}

impl Sensor {
    pub fn new(
        hardware_identifier: &str,
        name: impl Into<String>,
        index: usize,
        sensor_type: SensorType,
        parameters: Vec<Parameter>,
        history: &HistoryConfig,
    ) -> Self {
        Self {
            identifier: format!("{}/{}/{}", hardware_identifier, sensor_type.as_str(), index),
            name: name.into(),
            index,
            sensor_type,
            active: true,
            parameters,
            value: None,
            min: None,
            max: None,
            history: VecDeque::new(),
            pending_sum: 0.0,
            pending_count: 0,
            retention: history.retention(),
            samples_per_entry: history.samples_per_entry.max(1),
            control: None,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    /// Whether the sensor is currently published by its hardware
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.parameters
    }

    /// Current value of the parameter at `index`, or `fallback` if absent
    pub fn parameter_value(&self, index: usize, fallback: f32) -> f32 {
        self.parameters.get(index).map(Parameter::value).unwrap_or(fallback)
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    pub fn min(&self) -> Option<f32> {
        self.min
    }

    pub fn max(&self) -> Option<f32> {
        self.max
    }

    pub fn reset_min(&mut self) {
        self.min = None;
    }

    pub fn reset_max(&mut self) {
        self.max = None;
    }

    pub fn set_value(&mut self, value: Option<f32>) {
        self.set_value_at(value, SystemTime::now());
    }

    /// Record a reading taken at `now`.
    ///
    /// Non-finite readings are stored as absent.
    pub fn set_value_at(&mut self, value: Option<f32>, now: SystemTime) {
        let value = value.filter(|v| v.is_finite());
        self.prune_history(now);

        self.value = value;
        let Some(v) = value else { return };

        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));

        self.pending_sum += v;
        self.pending_count += 1;
        if self.pending_count >= self.samples_per_entry {
            let mean = self.pending_sum / self.pending_count as f32;
            self.pending_sum = 0.0;
            self.pending_count = 0;
            self.append_history(mean, now);
        }
    }

    /// Append a bucket mean. A flat run keeps a single entry whose timestamp
    /// follows the run, so the time the run started is not kept.
    fn append_history(&mut self, value: f32, time: SystemTime) {
        if let Some(last) = self.history.back_mut() {
            if last.value == value {
                last.time = time;
                return;
            }
        }
        self.history.push_back(SensorSample { value, time });
    }

    fn prune_history(&mut self, now: SystemTime) {
        while let Some(front) = self.history.front() {
            match now.duration_since(front.time) {
                Ok(age) if age > self.retention => {
                    self.history.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Averaged samples, oldest first
    pub fn history(&self) -> impl Iterator<Item = &SensorSample> + '_ {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.pending_sum = 0.0;
        self.pending_count = 0;
    }

    pub fn control(&self) -> Option<&Control> {
        self.control.as_ref()
    }

    pub fn control_mut(&mut self) -> Option<&mut Control> {
        self.control.as_mut()
    }

    /// Attach an actuator control to this sensor and return it.
    pub fn attach_control(&mut self, min_software_value: f32, max_software_value: f32) -> &mut Control {
        let identifier = format!("{}/control", self.identifier);
        self.control
            .insert(Control::new(identifier, min_software_value, max_software_value))
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            identifier: self.identifier.clone(),
            name: self.name.clone(),
            sensor_type: self.sensor_type,
            value: self.value,
            min: self.min,
            max: self.max,
            parameters: self
                .parameters
                .iter()
                .map(|p| (p.name().to_string(), p.value()))
                .collect(),
        }
    }
}

/// Handle to a sensor inside a [`SensorBank`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorId(usize);

/// The sensors published by one piece of hardware.
///
/// Indices inside identifiers are assigned per sensor type in insertion order.
#[derive(Debug)]
pub struct SensorBank {
    hardware_identifier: String,
    history: HistoryConfig,
    sensors: Vec<Sensor>,
}

impl SensorBank {
    pub fn new(hardware_identifier: impl Into<String>, history: &HistoryConfig) -> Self {
        Self {
            hardware_identifier: hardware_identifier.into(),
            history: history.clone(),
            sensors: Vec::new(),
        }
    }

    pub fn hardware_identifier(&self) -> &str {
        &self.hardware_identifier
    }

    pub fn add(&mut self, name: impl Into<String>, sensor_type: SensorType, parameters: Vec<Parameter>) -> SensorId {
        let index = self.sensors.iter().filter(|s| s.sensor_type() == sensor_type).count();
        let sensor = Sensor::new(&self.hardware_identifier, name, index, sensor_type, parameters, &self.history);
        self.sensors.push(sensor);
        SensorId(self.sensors.len() - 1)
    }

    /// Add a sensor that stays hidden until it first produces a value
    pub fn add_inactive(&mut self, name: impl Into<String>, sensor_type: SensorType) -> SensorId {
        let id = self.add(name, sensor_type, Vec::new());
        self.sensors[id.0].deactivate();
        id
    }

    pub fn get(&self, id: SensorId) -> &Sensor {
        &self.sensors[id.0]
    }

    pub fn get_mut(&mut self, id: SensorId) -> &mut Sensor {
        &mut self.sensors[id.0]
    }

    pub fn set(&mut self, id: SensorId, value: Option<f32>) {
        self.sensors[id.0].set_value(value);
    }

    /// Set a value and publish the sensor if it was hidden
    pub fn set_and_activate(&mut self, id: SensorId, value: Option<f32>) {
        let sensor = &mut self.sensors[id.0];
        sensor.set_value(value);
        if value.is_some() {
            sensor.activate();
        }
    }

    pub fn parameter(&self, id: SensorId, index: usize, fallback: f32) -> f32 {
        self.sensors[id.0].parameter_value(index, fallback)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sensor> + '_ {
        self.sensors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Sensor> + '_ {
        self.sensors.iter_mut()
    }

    /// Active sensors of one type, in insertion order
    pub fn of_type(&self, sensor_type: SensorType) -> Vec<&Sensor> {
        self.sensors
            .iter()
            .filter(|s| s.is_active() && s.sensor_type() == sensor_type)
            .collect()
    }

    pub fn find(&self, identifier: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.identifier() == identifier)
    }

    pub fn find_mut(&mut self, identifier: &str) -> Option<&mut Sensor> {
        self.sensors.iter_mut().find(|s| s.identifier() == identifier)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
