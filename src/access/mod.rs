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

//! Privileged register access
//!
//! The engine never touches hardware directly. Everything goes through a
//! [`RegisterAccess`] implementation supplied by the host:
//!
//! - **MSR**: model-specific registers, read on the current or a given core
//! - **PCI**: configuration space dwords addressed by bus/device/function
//! - **CPUID**: identification leaves of a given logical processor
//! - **Timing**: raw cycle counter and a monotonic high-resolution clock
//!
//! Reads return `Option` and writes return `bool`. A miss is an ordinary
//! outcome, never an error.

mod linux;

pub use linux::LinuxAccess;

use lazy_static::lazy_static;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::trace;

use hp_error::Result;

/// Returned by PCI lookups that found no matching device
pub const INVALID_PCI_ADDRESS: u32 = 0xFFFF_FFFF;

/// Pack a bus/device/function triple into a configuration address
pub fn pci_address(bus: u32, device: u32, function: u32) -> u32 {
    ((bus & 0xFF) << 8) | ((device & 0x1F) << 3) | (function & 7)
}

/// Split a configuration address back into bus/device/function
pub fn pci_parts(address: u32) -> (u32, u32, u32) {
    ((address >> 8) & 0xFF, (address >> 3) & 0x1F, address & 7)
}

#[cfg_attr(test, mockall::automock)]
pub trait RegisterAccess: Send + Sync {
    /// Open the privileged channel. Calling it again on an open channel is a no-op.
    fn open(&self) -> Result<()>;

    /// Release the channel. Idempotent.
    fn close(&self);

    fn read_msr(&self, index: u32) -> Option<(u32, u32)>;

    fn write_msr(&self, index: u32, low: u32, high: u32) -> bool;

    /// Read an MSR on the logical processors selected by `mask`.
    fn read_msr_on(&self, index: u32, mask: u64) -> Option<(u32, u32)> {
        let _pinned = AffinityGuard::pin(self, mask);
        self.read_msr(index)
    }

    fn read_pci_config(&self, address: u32, offset: u32) -> Option<u32>;

    fn write_pci_config(&self, address: u32, offset: u32, value: u32) -> bool;

    /// Restrict the calling thread to `mask` and return the previous mask,
    /// or 0 if the mask could not be changed.
    ///
    /// Backends whose previous affinity does not fit in 64 bits return an
    /// opaque non-zero token that restores it when passed back.
    fn set_thread_affinity(&self, mask: u64) -> u64;

    fn read_cycle_counter(&self) -> u64;

    fn monotonic_timestamp(&self) -> i64;

    /// Ticks per second of [`RegisterAccess::monotonic_timestamp`]
    fn monotonic_frequency(&self) -> i64;

    /// Raw `[eax, ebx, ecx, edx]` of a CPUID leaf executed on logical processor `thread`
    fn cpuid(&self, thread: u32, leaf: u32, subleaf: u32) -> Option<[u32; 4]>;
}

lazy_static! {
    static ref AFFINITY_LOCK: ReentrantMutex<()> = ReentrantMutex::new(());
}

/// Pins the calling thread for its lifetime and restores the previous
/// affinity when dropped.
///
/// Guards serialise on a process-wide lock; nesting on one thread is allowed.
pub struct AffinityGuard<'a, A: RegisterAccess + ?Sized> {
    access: &'a A,
    previous: u64,
    _lock: ReentrantMutexGuard<'static, ()>,
}

impl<'a, A: RegisterAccess + ?Sized> AffinityGuard<'a, A> {
    /// Pin to `mask`. A zero mask leaves the affinity untouched.
    pub fn pin(access: &'a A, mask: u64) -> Self {
        let lock = AFFINITY_LOCK.lock();
        let previous = if mask == 0 {
            0
        } else {
            access.set_thread_affinity(mask)
        };
        trace!(mask = format_args!("{:#x}", mask), previous = format_args!("{:#x}", previous), "pinned");
        Self {
            access,
            previous,
            _lock: lock,
        }
    }

    /// Whether the requested mask was applied
    pub fn is_pinned(&self) -> bool {
        self.previous != 0
    }
}

impl<A: RegisterAccess + ?Sized> Drop for AffinityGuard<'_, A> {
    fn drop(&mut self) {
        if self.previous != 0 {
            self.access.set_thread_affinity(self.previous);
        }
    }
}

/// Read a dword from the system management network through an index/data
/// register pair of `address`. The data register follows the index register.
pub fn read_smn<A: RegisterAccess + ?Sized>(access: &A, address: u32, index_register: u32, register: u32) -> Option<u32> {
    let _lock = AFFINITY_LOCK.lock();
    if !access.write_pci_config(address, index_register, register) {
        return None;
    }
    access.read_pci_config(address, index_register + 4)
}

/// Affinity mask selecting one logical processor
pub fn thread_mask(index: u32) -> u64 {
    if index < 64 {
        1u64 << index
    } else {
        0
    }
}
