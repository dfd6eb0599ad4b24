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

//! Register access through the Linux `msr` and `cpuid` character devices
//! and sysfs PCI configuration space.
//!
//! Requires the `msr` and `cpuid` kernel modules and root (or CAP_SYS_RAWIO).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::mem;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use hp_error::{HwprobeError, Result};

use super::{pci_parts, RegisterAccess};
use crate::constants::paths;

#[derive(Default)]
struct Devices {
    open: bool,
    msr: HashMap<u32, File>,
    cpuid: HashMap<u32, File>,
}

/// Returned as the previous mask when the previous affinity includes
/// processors beyond the first 64; passing it back restores that set.
const WIDE_AFFINITY: u64 = u64::MAX;

pub struct LinuxAccess {
    devices: Mutex<Devices>,
    wide_affinity: Mutex<Vec<libc::cpu_set_t>>,
}

impl Default for LinuxAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxAccess {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Devices::default()),
            wide_affinity: Mutex::new(Vec::new()),
        }
    }

    /// Set to apply for `mask`: the saved wide set for [`WIDE_AFFINITY`],
    /// otherwise the processors named by the mask bits.
    fn affinity_target(&self, mask: u64) -> libc::cpu_set_t {
        if mask == WIDE_AFFINITY {
            if let Some(saved) = self.wide_affinity.lock().pop() {
                return saved;
            }
        }
        cpu_set_from_mask(mask)
    }

    fn with_msr<T>(&self, cpu: u32, op: impl FnOnce(&File) -> Option<T>) -> Option<T> {
        let mut devices = self.devices.lock();
        if !devices.open {
            return None;
        }
        if !devices.msr.contains_key(&cpu) {
            let path = paths::msr_device(cpu);
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(f) => {
                    devices.msr.insert(cpu, f);
                }
                Err(e) => {
                    trace!("Cannot open {}: {}", path, e);
                    return None;
                }
            }
        }
        devices.msr.get(&cpu).and_then(op)
    }

    fn read_msr_from(&self, cpu: u32, index: u32) -> Option<(u32, u32)> {
        self.with_msr(cpu, |f| {
            let mut buf = [0u8; 8];
            f.read_exact_at(&mut buf, u64::from(index)).ok()?;
            let value = u64::from_le_bytes(buf);
            Some((value as u32, (value >> 32) as u32))
        })
    }

    fn pci_config_path(address: u32) -> PathBuf {
        let (bus, device, function) = pci_parts(address);
        Path::new(paths::PCI_DEVICES)
            .join(format!("0000:{:02x}:{:02x}.{:x}", bus, device, function))
            .join("config")
    }
}

fn cpu_set_from_mask(mask: u64) -> libc::cpu_set_t {
    // SAFETY: cpu_set_t is plain data, the all-zero value is the empty set
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    for cpu in 0..64 {
        if mask & (1 << cpu) != 0 {
            // SAFETY: cpu is below CPU_SETSIZE
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
    }
    set
}

/// Low 64 processors of `set` as a mask, and whether any higher one is set
fn mask_from_cpu_set(set: &libc::cpu_set_t) -> (u64, bool) {
    let mut mask = 0u64;
    let mut wide = false;
    for cpu in 0..libc::CPU_SETSIZE as usize {
        // SAFETY: cpu is below CPU_SETSIZE
        if unsafe { libc::CPU_ISSET(cpu, set) } {
            if cpu < 64 {
                mask |= 1 << cpu;
            } else {
                wide = true;
            }
        }
    }
    (mask, wide)
}

fn current_cpu() -> Option<u32> {
    // SAFETY: sched_getcpu has no preconditions
    let cpu = unsafe { libc::sched_getcpu() };
    u32::try_from(cpu).ok()
}

impl RegisterAccess for LinuxAccess {
    fn open(&self) -> Result<()> {
        if !cfg!(target_arch = "x86_64") {
            return Err(HwprobeError::not_supported(
                "model-specific register access outside x86_64",
            ));
        }
        let mut devices = self.devices.lock();
        if devices.open {
            return Ok(());
        }
        let path = paths::msr_device(0);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| HwprobeError::from_device_io(&path, e))?;
        devices.msr.insert(0, file);
        devices.open = true;
        info!("Opened register access channel via {}", path);
        Ok(())
    }

    fn close(&self) {
        let mut devices = self.devices.lock();
        if devices.open {
            debug!("Closing register access channel");
        }
        devices.msr.clear();
        devices.cpuid.clear();
        devices.open = false;
    }

    fn read_msr(&self, index: u32) -> Option<(u32, u32)> {
        self.read_msr_from(current_cpu()?, index)
    }

    fn write_msr(&self, index: u32, low: u32, high: u32) -> bool {
        let Some(cpu) = current_cpu() else { return false };
        let value = (u64::from(high) << 32) | u64::from(low);
        self.with_msr(cpu, |f| f.write_all_at(&value.to_le_bytes(), u64::from(index)).ok())
            .is_some()
    }

    fn read_msr_on(&self, index: u32, mask: u64) -> Option<(u32, u32)> {
        // each device node already targets one processor, no pinning needed
        if mask == 0 {
            return self.read_msr(index);
        }
        self.read_msr_from(mask.trailing_zeros(), index)
    }

    fn read_pci_config(&self, address: u32, offset: u32) -> Option<u32> {
        if address == super::INVALID_PCI_ADDRESS || offset & 3 != 0 {
            return None;
        }
        let file = File::open(Self::pci_config_path(address)).ok()?;
        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, u64::from(offset)).ok()?;
        Some(u32::from_le_bytes(buf))
    }

    fn write_pci_config(&self, address: u32, offset: u32, value: u32) -> bool {
        if address == super::INVALID_PCI_ADDRESS || offset & 3 != 0 {
            return false;
        }
        let path = Self::pci_config_path(address);
        match OpenOptions::new().write(true).open(&path) {
            Ok(f) => f.write_all_at(&value.to_le_bytes(), u64::from(offset)).is_ok(),
            Err(e) => {
                warn!("Cannot write PCI config {:?}: {}", path, e);
                false
            }
        }
    }

    fn set_thread_affinity(&self, mask: u64) -> u64 {
        // SAFETY: cpu_set_t is plain data, the all-zero value is the empty set
        let mut current: libc::cpu_set_t = unsafe { mem::zeroed() };
        // SAFETY: current is a valid out pointer of the given size
        if unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut current) } != 0 {
            return 0;
        }

        let wanted = self.affinity_target(mask);
        // SAFETY: wanted is a valid cpu_set_t of the given size
        if unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &wanted) } != 0 {
            debug!("sched_setaffinity({:#x}) failed", mask);
            return 0;
        }

        match mask_from_cpu_set(&current) {
            (_, true) => {
                self.wide_affinity.lock().push(current);
                WIDE_AFFINITY
            }
            (previous, false) => previous,
        }
    }

    fn read_cycle_counter(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: rdtsc is available on every x86_64 processor
            unsafe { core::arch::x86_64::_rdtsc() }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            0
        }
    }

    fn monotonic_timestamp(&self) -> i64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: ts is a valid out pointer
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
        if rc != 0 {
            return 0;
        }
        ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
    }

    fn monotonic_frequency(&self) -> i64 {
        1_000_000_000
    }

    fn cpuid(&self, thread: u32, leaf: u32, subleaf: u32) -> Option<[u32; 4]> {
        let mut devices = self.devices.lock();
        if !devices.cpuid.contains_key(&thread) {
            let path = paths::cpuid_device(thread);
            let f = File::open(&path).ok()?;
            devices.cpuid.insert(thread, f);
        }
        let f = devices.cpuid.get(&thread)?;
        let mut buf = [0u8; 16];
        let offset = (u64::from(subleaf) << 32) | u64::from(leaf);
        f.read_exact_at(&mut buf, offset).ok()?;
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some([word(0), word(4), word(8), word(12)])
    }
}
