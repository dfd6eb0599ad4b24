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

//! Power from 32-bit energy accumulators

use std::time::Duration;

use crate::sensor::{SensorBank, SensorId};

/// Counts accumulated between two reads of a wrapping 32-bit counter
pub fn counter_delta(previous: u32, current: u32) -> u32 {
    if current >= previous {
        current - previous
    } else {
        u32::MAX - previous + current
    }
}

/// Outcome of one energy sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnergySample {
    /// Average power in watts since the previous accepted sample
    Power(f32),
    /// Not enough time has passed, or this primed the counter
    Pending,
    /// The counter or its unit could not be read
    Unavailable,
}

impl EnergySample {
    /// Apply to a sensor. `Pending` leaves the previous value in place.
    pub fn publish(self, sensors: &mut SensorBank, id: SensorId) {
        match self {
            EnergySample::Power(watts) => sensors.set(id, Some(watts)),
            EnergySample::Unavailable => sensors.set(id, None),
            EnergySample::Pending => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnergyCounter {
    /// Joules per count, 0 if unknown
    unit: f64,
    min_interval: f64,
    last: Option<(u32, i64)>,
}

impl EnergyCounter {
    pub fn new(unit: f64, min_interval: Duration) -> Self {
        Self {
            unit,
            min_interval: min_interval.as_secs_f64(),
            last: None,
        }
    }

    /// Seed the counter with a reading taken at `time`
    pub fn prime(&mut self, count: u32, time: i64) {
        self.last = Some((count, time));
    }

    pub fn unit(&self) -> f64 {
        self.unit
    }

    /// Feed a counter reading taken at `time` on a clock ticking `ticks_per_sec`.
    pub fn sample(&mut self, reading: Option<u32>, time: i64, ticks_per_sec: i64) -> EnergySample {
        let Some(count) = reading else {
            return EnergySample::Unavailable;
        };
        if self.unit <= 0.0 || ticks_per_sec <= 0 {
            return EnergySample::Unavailable;
        }
        let Some((last_count, last_time)) = self.last else {
            self.last = Some((count, time));
            return EnergySample::Pending;
        };

        let elapsed = (time - last_time) as f64 / ticks_per_sec as f64;
        if elapsed < self.min_interval || elapsed <= 0.0 {
            return EnergySample::Pending;
        }
        self.last = Some((count, time));
        let joules = self.unit * f64::from(counter_delta(last_count, count));
        EnergySample::Power((joules / elapsed) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: i64 = 1_000_000_000;

    fn counter(unit: f64) -> EnergyCounter {
        EnergyCounter::new(unit, Duration::from_millis(10))
    }

    #[test]
    fn test_counter_delta_wraparound() {
        let previous = 0xFFFF_FFF0;
        let current = 0x0000_0005;
        assert_eq!(counter_delta(previous, current), 0xFFFF_FFFF - previous + current);
        assert_eq!(counter_delta(previous, current), 20);
    }

    #[test]
    fn test_counter_delta_forward() {
        assert_eq!(counter_delta(100, 350), 250);
        assert_eq!(counter_delta(7, 7), 0);
    }

    #[test]
    fn test_first_sample_primes() {
        let mut c = counter(1.0 / 65536.0);
        assert_eq!(c.sample(Some(1000), NS, NS), EnergySample::Pending);
    }

    #[test]
    fn test_power_from_delta() {
        // 1/16 J per count, 160 counts over half a second
        let mut c = counter(1.0 / 16.0);
        c.prime(1000, 0);
        assert_eq!(c.sample(Some(1160), NS / 2, NS), EnergySample::Power(20.0));
    }

    #[test]
    fn test_power_across_wraparound() {
        let mut c = counter(1.0);
        c.prime(0xFFFF_FFF0, 0);
        assert_eq!(c.sample(Some(5), NS, NS), EnergySample::Power(20.0));
    }

    #[test]
    fn test_short_interval_is_skipped_and_keeps_baseline() {
        let mut c = counter(1.0);
        c.prime(0, 0);
        assert_eq!(c.sample(Some(10), 5_000_000, NS), EnergySample::Pending);
        // baseline still at t=0
        assert_eq!(c.sample(Some(100), NS, NS), EnergySample::Power(100.0));
    }

    #[test]
    fn test_failed_read_is_unavailable() {
        let mut c = counter(1.0);
        c.prime(0, 0);
        assert_eq!(c.sample(None, NS, NS), EnergySample::Unavailable);
        assert_eq!(c.sample(Some(50), NS, NS), EnergySample::Power(50.0));
    }

    #[test]
    fn test_unknown_unit_is_unavailable() {
        let mut c = counter(0.0);
        assert_eq!(c.sample(Some(50), NS, NS), EnergySample::Unavailable);
    }
}
