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

//! Time-stamp counter frequency estimation
//!
//! # Timed windows
//!
//! A window busy-waits on the monotonic clock and reads a counter at both
//! edges. The overshoot past each planned edge, relative to the window
//! length, is the window's error. Any preemption inside the window shows up
//! as a large error.
//!
//! # Continuous correction
//!
//! After calibration, [`TscTracker`] refines the estimate from one
//! (timestamp, counter) pair per update when the counter is invariant.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::access::{AffinityGuard, RegisterAccess};
use crate::config::{CalibrationConfig, TscCorrectionConfig};
use crate::logger;

/// Result of one timed window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSample {
    /// Counter rate in MHz
    pub frequency: f64,
    /// Combined edge overshoot relative to the window length
    pub error: f64,
}

/// Outcome of a full calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationResult {
    /// Estimated counter rate in MHz, 0 if no window succeeded
    pub frequency: f64,
    pub error: f64,
}

fn spin_until<A: RegisterAccess + ?Sized>(access: &A, target: i64) {
    while access.monotonic_timestamp() < target {
        std::hint::spin_loop();
    }
}

/// Measure the rate of `counter` over one busy-waited window.
///
/// Returns `None` if the clock is unusable or either counter read fails.
pub fn timed_window<A, F>(access: &A, window: Duration, mut counter: F) -> Option<WindowSample>
where
    A: RegisterAccess + ?Sized,
    F: FnMut() -> Option<u64>,
{
    let frequency = access.monotonic_frequency();
    let ticks = (window.as_secs_f64() * frequency as f64) as i64;
    if frequency <= 0 || ticks <= 0 {
        return None;
    }

    let begin = access.monotonic_timestamp() + (0.001 * ticks as f64).ceil() as i64;
    let end = begin + ticks;

    spin_until(access, begin);
    let count_begin = counter()?;
    let after_begin = access.monotonic_timestamp();

    spin_until(access, end);
    let count_end = counter()?;
    let after_end = access.monotonic_timestamp();

    let delta = ticks as f64;
    let cycles = count_end.wrapping_sub(count_begin) as f64;
    Some(WindowSample {
        frequency: 1e-6 * cycles * frequency as f64 / delta,
        error: ((after_begin - begin) + (after_end - end)) as f64 / delta,
    })
}

pub struct FrequencyCalibrator {
    window: Duration,
    windows: u32,
    error_threshold: f64,
}

impl FrequencyCalibrator {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            window: config.window(),
            windows: config.windows.max(3),
            error_threshold: config.error_threshold,
        }
    }

    /// Estimate the cycle counter rate while pinned to `mask`.
    ///
    /// The lowest-error window wins; sampling stops early once a window is
    /// below the error threshold. The previous affinity is restored on return.
    pub fn estimate<A: RegisterAccess + ?Sized>(&self, access: &A, mask: u64) -> CalibrationResult {
        let _pinned = AffinityGuard::pin(access, mask);

        // warm-up, discarded
        let _ = timed_window(access, self.window, || Some(access.read_cycle_counter()));

        let mut best = CalibrationResult {
            frequency: 0.0,
            error: f64::INFINITY,
        };
        for i in 0..self.windows {
            let Some(sample) = timed_window(access, self.window, || Some(access.read_cycle_counter())) else {
                continue;
            };
            debug!(window = i, frequency = sample.frequency, error = sample.error, "calibration window");
            if sample.error < best.error {
                best = CalibrationResult {
                    frequency: sample.frequency,
                    error: sample.error,
                };
            }
            if best.error < self.error_threshold {
                break;
            }
        }

        if best.frequency > 0.0 {
            info!("Estimated TSC frequency {:.2} MHz (error {:.2e})", best.frequency, best.error);
        } else {
            warn!("TSC calibration produced no usable window");
        }
        logger::log_event(
            "calibration",
            json!({ "mask": mask, "frequency_mhz": best.frequency, "error": best.error }),
        );
        best
    }
}

/// Tracks the counter rate across updates
#[derive(Debug, Clone)]
pub struct TscTracker {
    frequency: f64,
    last_time: i64,
    last_count: u64,
    config: TscCorrectionConfig,
}

impl TscTracker {
    pub fn new(initial_frequency: f64, config: &TscCorrectionConfig) -> Self {
        Self {
            frequency: initial_frequency,
            last_time: 0,
            last_count: 0,
            config: config.clone(),
        }
    }

    /// Current estimate in MHz
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Take one sample on `mask` and accept it if it is accurate and the
    /// interval since the last accepted sample is within bounds.
    pub fn update<A: RegisterAccess + ?Sized>(&mut self, access: &A, mask: u64) -> f64 {
        let (first, count, time) = {
            let _pinned = AffinityGuard::pin(access, mask);
            let first = access.monotonic_timestamp();
            let count = access.read_cycle_counter();
            let time = access.monotonic_timestamp();
            (first, count, time)
        };

        let ticks_per_sec = access.monotonic_frequency() as f64;
        if ticks_per_sec <= 0.0 {
            return self.frequency;
        }
        let error = (time - first) as f64 / ticks_per_sec;
        if error >= self.config.max_measurement_error_secs {
            return self.frequency;
        }

        let delta = (time - self.last_time) as f64 / ticks_per_sec;
        if self.last_time != 0
            && delta >= self.config.min_interval_secs
            && delta <= self.config.max_interval_secs
        {
            let estimate = count.wrapping_sub(self.last_count) as f64 / (1e6 * delta);
            if estimate.is_finite() && estimate > 0.0 {
                self.frequency = estimate;
            }
        }
        self.last_count = count;
        self.last_time = time;
        self.frequency
    }
}
