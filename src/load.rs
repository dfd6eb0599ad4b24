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

//! Processor load from OS busy/idle accounting
//!
//! Load needs no privileged access, so it is available on every processor,
//! including those handled by the generic decoder.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, trace};

use crate::constants::paths;
use crate::topology::Processor;

/// Minimum busy+idle advance, in ticks, for a thread to count as sampled
const MIN_TOTAL_DELTA: u64 = 1;

#[derive(Error, Debug)]
pub enum StatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed stat line: {0}")]
    Parse(String),
}

/// Cumulative tick counters of one logical processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadTimes {
    pub idle: u64,
    pub total: u64,
}

/// Source of per-logical-processor idle and total time counters
#[cfg_attr(test, mockall::automock)]
pub trait ProcessorTimes: Send + Sync {
    /// Counters keyed by logical processor index
    fn times(&self) -> Result<BTreeMap<u32, ThreadTimes>, StatError>;
}

/// Reads `/proc/stat`
#[derive(Debug, Clone)]
pub struct ProcStat {
    path: PathBuf,
}

impl Default for ProcStat {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcStat {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(paths::PROC_STAT),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProcessorTimes for ProcStat {
    fn times(&self) -> Result<BTreeMap<u32, ThreadTimes>, StatError> {
        parse_stat(&fs::read_to_string(&self.path)?)
    }
}

/// Parse the `cpuN` lines of a stat file.
///
/// Idle is `idle + iowait`; total is the sum of the first eight columns
/// (guest time is already part of user time).
pub fn parse_stat(contents: &str) -> Result<BTreeMap<u32, ThreadTimes>, StatError> {
    let mut times = BTreeMap::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else { continue };
        let Some(index) = label.strip_prefix("cpu") else { continue };
        if index.is_empty() {
            continue;
        }
        let index: u32 = index.parse().map_err(|_| StatError::Parse(line.to_string()))?;
        let values = fields
            .take(8)
            .map(|f| f.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StatError::Parse(line.to_string()))?;
        if values.len() < 4 {
            return Err(StatError::Parse(line.to_string()));
        }
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        let total = values.iter().sum();
        times.insert(index, ThreadTimes { idle, total });
    }
    Ok(times)
}

/// Per-core and total load of one processor
#[derive(Debug)]
pub struct CpuLoad {
    cores: Vec<Vec<u32>>,
    previous: Option<BTreeMap<u32, ThreadTimes>>,
    core_loads: Vec<Option<f32>>,
    total_load: Option<f32>,
}

impl CpuLoad {
    /// Take the baseline sample for `processor`.
    pub fn new(processor: &Processor, source: &dyn ProcessorTimes) -> Self {
        let cores: Vec<Vec<u32>> = processor
            .cores()
            .iter()
            .map(|c| c.threads().iter().map(|t| t.index()).collect())
            .collect();
        let previous = match source.times() {
            Ok(t) => Some(t),
            Err(e) => {
                debug!("CPU load unavailable: {}", e);
                None
            }
        };
        Self {
            core_loads: vec![None; cores.len()],
            cores,
            previous,
            total_load: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.previous.is_some()
    }

    pub fn core_load(&self, core: usize) -> Option<f32> {
        self.core_loads.get(core).copied().flatten()
    }

    pub fn total_load(&self) -> Option<f32> {
        self.total_load
    }

    /// Sample again and recompute loads. Returns false when the sample was
    /// skipped and the previous loads are still current.
    pub fn update(&mut self, source: &dyn ProcessorTimes) -> bool {
        let Some(previous) = self.previous.as_ref() else { return false };
        let current = match source.times() {
            Ok(t) => t,
            Err(e) => {
                trace!("CPU load sample failed: {}", e);
                return false;
            }
        };

        let sampled = |index: &u32| -> Option<f32> {
            let (old, new) = (previous.get(index)?, current.get(index)?);
            let total = new.total.checked_sub(old.total)?;
            let idle = new.idle.saturating_sub(old.idle);
            Some(idle as f32 / total as f32)
        };

        // a thread that barely advanced makes every ratio meaningless
        for index in self.cores.iter().flatten() {
            if let (Some(old), Some(new)) = (previous.get(index), current.get(index)) {
                if new.total.saturating_sub(old.total) < MIN_TOTAL_DELTA {
                    return false;
                }
            }
        }

        let mut idle_sum = 0.0f32;
        let mut count = 0usize;
        for (core, threads) in self.cores.iter().enumerate() {
            let fractions: Vec<f32> = threads.iter().filter_map(sampled).collect();
            if fractions.is_empty() {
                self.core_loads[core] = None;
                continue;
            }
            let sum: f32 = fractions.iter().sum();
            idle_sum += sum;
            count += fractions.len();
            let load = (1.0 - sum / fractions.len() as f32).max(0.0);
            self.core_loads[core] = Some(load * 100.0);
        }

        self.total_load = if count > 0 {
            Some((1.0 - idle_sum / count as f32).max(0.0) * 100.0)
        } else {
            None
        };
        self.previous = Some(current);
        true
    }
}
