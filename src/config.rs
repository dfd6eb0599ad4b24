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

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hp_error::{HwprobeError, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{defaults, paths};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationConfig {
    /// Length of one timed sampling window
    pub window_ms: u64,
    /// Number of timed windows, at least 3
    pub windows: u32,
    /// Stop sampling once a window reports an error below this
    pub error_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window_ms: defaults::CALIBRATION_WINDOW_MS,
            windows: defaults::CALIBRATION_WINDOWS,
            error_threshold: defaults::CALIBRATION_ERROR_THRESHOLD,
        }
    }
}

impl CalibrationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TscCorrectionConfig {
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
    /// Largest tolerated gap between the timestamps taken around a counter read
    pub max_measurement_error_secs: f64,
}

impl Default for TscCorrectionConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: defaults::TSC_CORRECTION_MIN_INTERVAL_SECS,
            max_interval_secs: defaults::TSC_CORRECTION_MAX_INTERVAL_SECS,
            max_measurement_error_secs: defaults::TSC_CORRECTION_MAX_ERROR_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    pub retention_secs: u64,
    /// Present values averaged into one history entry
    pub samples_per_entry: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_secs: defaults::HISTORY_RETENTION_SECS,
            samples_per_entry: defaults::HISTORY_SAMPLES_PER_ENTRY,
        }
    }
}

impl HistoryConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Tunables for discovery, calibration and decoding.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub max_logical_processors: u32,
    pub calibration: CalibrationConfig,
    pub tsc_correction: TscCorrectionConfig,
    /// Pause between per-core clock register reads
    pub clock_read_spacing_ms: u64,
    /// Energy samples closer together than this are skipped
    pub power_min_interval_ms: u64,
    pub history: HistoryConfig,
    /// Optional JSON event journal
    pub event_log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_logical_processors: defaults::MAX_LOGICAL_PROCESSORS,
            calibration: CalibrationConfig::default(),
            tsc_correction: TscCorrectionConfig::default(),
            clock_read_spacing_ms: defaults::CLOCK_READ_SPACING_MS,
            power_min_interval_ms: defaults::POWER_MIN_INTERVAL_MS,
            history: HistoryConfig::default(),
            event_log: None,
        }
    }
}

impl EngineConfig {
    pub fn clock_read_spacing(&self) -> Duration {
        Duration::from_millis(self.clock_read_spacing_ms)
    }

    pub fn power_min_interval(&self) -> Duration {
        Duration::from_millis(self.power_min_interval_ms)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(explicit) = env::var("HWPROBE_CONFIG") {
        return PathBuf::from(explicit);
    }
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return Path::new(&xdg).join("hwprobe").join("config.json");
    }
    if let Ok(home) = env::var("HOME") {
        return Path::new(&home)
            .join(".config")
            .join("hwprobe")
            .join("config.json");
    }
    PathBuf::from(paths::SYSTEM_CONFIG)
}

pub fn validate_config(cfg: &EngineConfig) -> Result<()> {
    if cfg.max_logical_processors == 0 || cfg.max_logical_processors > 64 {
        // affinity masks are 64 bits wide
        return Err(HwprobeError::invalid_config(
            "max_logical_processors",
            "must be between 1 and 64",
        ));
    }
    if cfg.calibration.windows < 3 {
        return Err(HwprobeError::invalid_config("calibration.windows", "must be at least 3"));
    }
    if cfg.calibration.window_ms == 0 || cfg.calibration.window_ms > 1000 {
        return Err(HwprobeError::invalid_config(
            "calibration.window_ms",
            "must be between 1 and 1000",
        ));
    }
    if !(cfg.calibration.error_threshold > 0.0) {
        return Err(HwprobeError::invalid_config(
            "calibration.error_threshold",
            "must be positive",
        ));
    }
    let tsc = &cfg.tsc_correction;
    if !(tsc.min_interval_secs >= 0.0 && tsc.min_interval_secs < tsc.max_interval_secs) {
        return Err(HwprobeError::invalid_config(
            "tsc_correction",
            "min_interval_secs must be non-negative and below max_interval_secs",
        ));
    }
    if !(tsc.max_measurement_error_secs > 0.0) {
        return Err(HwprobeError::invalid_config(
            "tsc_correction.max_measurement_error_secs",
            "must be positive",
        ));
    }
    if cfg.history.samples_per_entry == 0 {
        return Err(HwprobeError::invalid_config(
            "history.samples_per_entry",
            "must be at least 1",
        ));
    }
    if cfg.history.retention_secs == 0 {
        return Err(HwprobeError::invalid_config("history.retention_secs", "must be positive"));
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let data = fs::read_to_string(path).map_err(|source| HwprobeError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: EngineConfig = serde_json::from_str(&data)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Load the config at [`config_path`], or defaults if there is none.
pub fn load_or_default() -> Result<EngineConfig> {
    let path = config_path();
    match load_config(&path) {
        Err(HwprobeError::FileRead { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            Ok(EngineConfig::default())
        }
        other => other,
    }
}
