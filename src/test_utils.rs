/*
 * Test utilities and fake hardware for Hwprobe
 *
 * This module provides an in-memory register backend and identity builders
 * shared by the unit tests of the topology, calibration and decoder modules.
 */

#[cfg(test)]
pub mod test_utils {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::access::RegisterAccess;
    use crate::config::EngineConfig;
    use crate::constants::cpuid as leaves;
    use crate::topology::ThreadIdentity;
    use hp_error::Result;

    /// In-memory register file.
    ///
    /// The clock advances by `tick` nanoseconds on every timestamp read and the
    /// cycle counter returns `timestamp * cycles_per_ns`, so TSC frequency is
    /// `1000 * cycles_per_ns` MHz.
    pub struct FakeAccess {
        pub msr: Mutex<HashMap<u32, (u32, u32)>>,
        pub msr_per_cpu: Mutex<HashMap<(u32, u32), (u32, u32)>>,
        pub msr_writes: Mutex<Vec<(u32, u32, u32)>>,
        pub msr_counters: Mutex<HashMap<u32, u64>>,
        pub pci: Mutex<HashMap<(u32, u32), u32>>,
        pub pci_writes: Mutex<Vec<(u32, u32, u32)>>,
        pub pci_selected: Mutex<HashMap<(u32, u32, u32), u32>>,
        pub smn: Mutex<HashMap<u32, u32>>,
        pub cpuid: Mutex<HashMap<(u32, u32, u32), [u32; 4]>>,
        pub affinity: AtomicU64,
        pub affinity_log: Mutex<Vec<u64>>,
        pub now: AtomicI64,
        pub tick: AtomicI64,
        pub cycles_per_ns: AtomicU64,
        pub cycle_reads: AtomicUsize,
        pub cycle_stalls: Mutex<HashMap<usize, i64>>,
    }

    impl Default for FakeAccess {
        fn default() -> Self {
            Self {
                msr: Mutex::new(HashMap::new()),
                msr_per_cpu: Mutex::new(HashMap::new()),
                msr_writes: Mutex::new(Vec::new()),
                msr_counters: Mutex::new(HashMap::new()),
                pci: Mutex::new(HashMap::new()),
                pci_writes: Mutex::new(Vec::new()),
                pci_selected: Mutex::new(HashMap::new()),
                smn: Mutex::new(HashMap::new()),
                cpuid: Mutex::new(HashMap::new()),
                affinity: AtomicU64::new(u64::MAX),
                affinity_log: Mutex::new(Vec::new()),
                now: AtomicI64::new(1_000_000_000),
                tick: AtomicI64::new(1_000),
                cycles_per_ns: AtomicU64::new(3),
                cycle_reads: AtomicUsize::new(0),
                cycle_stalls: Mutex::new(HashMap::new()),
            }
        }
    }

    impl FakeAccess {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_msr(&self, index: u32, low: u32, high: u32) {
            self.msr.lock().insert(index, (low, high));
        }

        pub fn remove_msr(&self, index: u32) {
            self.msr.lock().remove(&index);
        }

        pub fn set_msr_on(&self, cpu: u32, index: u32, low: u32, high: u32) {
            self.msr_per_cpu.lock().insert((cpu, index), (low, high));
        }

        /// Make `index` a free-running counter ticking `per_ns` times per nanosecond
        pub fn set_msr_counter(&self, index: u32, per_ns: u64) {
            self.msr_counters.lock().insert(index, per_ns);
        }

        pub fn set_pci(&self, address: u32, offset: u32, value: u32) {
            self.pci.lock().insert((address, offset), value);
        }

        /// Value read back from `offset` after `select` was written to it
        pub fn set_pci_selected(&self, address: u32, offset: u32, select: u32, value: u32) {
            self.pci_selected.lock().insert((address, offset, select), value);
        }

        pub fn set_smn(&self, register: u32, value: u32) {
            self.smn.lock().insert(register, value);
        }

        pub fn set_cpuid(&self, thread: u32, leaf: u32, value: [u32; 4]) {
            self.cpuid.lock().insert((thread, leaf, 0), value);
        }

        /// Stall the clock by `nanos` just before the `read`-th cycle counter read
        pub fn stall_cycle_read(&self, read: usize, nanos: i64) {
            self.cycle_stalls.lock().insert(read, nanos);
        }

        pub fn advance(&self, nanos: i64) {
            self.now.fetch_add(nanos, Ordering::SeqCst);
        }

        pub fn current_cpu(&self) -> u32 {
            let mask = self.affinity.load(Ordering::SeqCst);
            if mask == u64::MAX {
                0
            } else {
                mask.trailing_zeros()
            }
        }

        /// Install raw identity tables for logical processor `thread`
        pub fn install_identity(&self, thread: u32, id: &ThreadIdentity) {
            for (leaf, regs) in id.standard_leaves().iter().enumerate() {
                self.set_cpuid(thread, leaf as u32, *regs);
            }
            for (leaf, regs) in id.extended_leaves().iter().enumerate() {
                self.set_cpuid(thread, leaves::EXTENDED_BASE + leaf as u32, *regs);
            }
        }
    }

    impl RegisterAccess for FakeAccess {
        fn open(&self) -> Result<()> {
            Ok(())
        }

        fn close(&self) {}

        fn read_msr(&self, index: u32) -> Option<(u32, u32)> {
            if let Some(per_ns) = self.msr_counters.lock().get(&index) {
                let count = self.now.load(Ordering::SeqCst) as u64 * per_ns;
                return Some((count as u32, (count >> 32) as u32));
            }
            let cpu = self.current_cpu();
            if let Some(v) = self.msr_per_cpu.lock().get(&(cpu, index)) {
                return Some(*v);
            }
            self.msr.lock().get(&index).copied()
        }

        fn write_msr(&self, index: u32, low: u32, high: u32) -> bool {
            self.msr_writes.lock().push((index, low, high));
            self.msr.lock().insert(index, (low, high));
            true
        }

        fn read_pci_config(&self, address: u32, offset: u32) -> Option<u32> {
            let written = self.pci.lock().get(&(address, offset)).copied();
            if let Some(v) = written.and_then(|w| self.pci_selected.lock().get(&(address, offset, w)).copied()) {
                return Some(v);
            }
            if offset >= 4 {
                let index = self.pci.lock().get(&(address, offset - 4)).copied();
                if let Some(v) = index.and_then(|i| self.smn.lock().get(&i).copied()) {
                    return Some(v);
                }
            }
            self.pci.lock().get(&(address, offset)).copied()
        }

        fn write_pci_config(&self, address: u32, offset: u32, value: u32) -> bool {
            self.pci_writes.lock().push((address, offset, value));
            self.pci.lock().insert((address, offset), value);
            true
        }

        fn set_thread_affinity(&self, mask: u64) -> u64 {
            self.affinity_log.lock().push(mask);
            self.affinity.swap(mask, Ordering::SeqCst)
        }

        fn read_cycle_counter(&self) -> u64 {
            let read = self.cycle_reads.fetch_add(1, Ordering::SeqCst);
            if let Some(stall) = self.cycle_stalls.lock().get(&read) {
                self.advance(*stall);
            }
            let now = self.now.load(Ordering::SeqCst) as u64;
            now * self.cycles_per_ns.load(Ordering::SeqCst)
        }

        fn monotonic_timestamp(&self) -> i64 {
            self.now.fetch_add(self.tick.load(Ordering::SeqCst), Ordering::SeqCst)
        }

        fn monotonic_frequency(&self) -> i64 {
            1_000_000_000
        }

        fn cpuid(&self, thread: u32, leaf: u32, subleaf: u32) -> Option<[u32; 4]> {
            self.cpuid.lock().get(&(thread, leaf, subleaf)).copied()
        }
    }

    /// Leaf 0 registers for a vendor string
    pub fn vendor_leaf(max_leaf: u32, vendor: &str) -> [u32; 4] {
        let b = vendor.as_bytes();
        let word = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        [max_leaf, word(0), word(8), word(4)]
    }

    /// Leaf 1 EAX for a family/model/stepping triple
    pub fn signature(family: u32, model: u32, stepping: u32) -> u32 {
        let (base_family, ext_family) = if family >= 0xF { (0xF, family - 0xF) } else { (family, 0) };
        (ext_family << 20) | ((model >> 4) << 16) | (base_family << 8) | ((model & 0xF) << 4) | stepping
    }

    /// Brand string spread over extended leaves 2..=4
    pub fn brand_leaves(brand: &str) -> [[u32; 4]; 3] {
        let mut bytes = [0u8; 48];
        for (i, b) in brand.bytes().take(47).enumerate() {
            bytes[i] = b;
        }
        let mut out = [[0u32; 4]; 3];
        for (i, chunk) in bytes.chunks(4).enumerate() {
            out[i / 4][i % 4] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        out
    }

    /// Intel identity: `apic` id, one core per `threads_per_core` threads
    pub fn intel_identity(index: u32, family: u32, model: u32, apic: u32, brand: &str) -> ThreadIdentity {
        let mut std = vec![[0u32; 4]; 7];
        std[0] = vendor_leaf(6, "GenuineIntel");
        std[1] = [
            signature(family, model, 3),
            (apic << 24) | (16 << 16),
            0,
            leaves::FEATURE_TSC | leaves::FEATURE_MSR,
        ];
        // eight cores, two threads each
        std[4] = [7 << 26, 0, 0, 0];
        std[6] = [leaves::THERMAL_CORE_DTS | leaves::THERMAL_PACKAGE_DTS, 0, 0, 0];
        let mut ext = vec![[0u32; 4]; 8];
        ext[0] = [leaves::EXTENDED_BASE + 7, 0, 0, 0];
        ext[2..5].copy_from_slice(&brand_leaves(brand));
        ext[7] = [0, 0, 0, leaves::POWER_INVARIANT_TSC];
        ThreadIdentity::from_tables(index, std, ext)
    }

    /// AMD identity for pre-Zen families: `apic` id, `cores` cores per package
    pub fn amd_identity(index: u32, family: u32, model: u32, apic: u32, cores: u32, brand: &str) -> ThreadIdentity {
        let mut std = vec![[0u32; 4]; 2];
        std[0] = vendor_leaf(1, "AuthenticAMD");
        std[1] = [
            signature(family, model, 2),
            (apic << 24) | (cores << 16),
            0,
            leaves::FEATURE_TSC | leaves::FEATURE_MSR,
        ];
        let mut ext = vec![[0u32; 4]; 9];
        ext[0] = [leaves::EXTENDED_BASE + 8, 0, 0, 0];
        ext[2..5].copy_from_slice(&brand_leaves(brand));
        ext[7] = [0, 0, 0, leaves::POWER_THERMAL_TRIP | leaves::POWER_INVARIANT_TSC];
        ext[8] = [0, 0, cores - 1, 0];
        ThreadIdentity::from_tables(index, std, ext)
    }

    /// Zen identity with node and core ids from leaf 0x8000001E
    pub fn zen_identity(index: u32, apic: u32, node: u32, core: u32, brand: &str) -> ThreadIdentity {
        let mut std = vec![[0u32; 4]; 2];
        std[0] = vendor_leaf(1, "AuthenticAMD");
        std[1] = [
            signature(0x17, 0x01, 1),
            (apic << 24) | (16 << 16),
            0,
            leaves::FEATURE_TSC | leaves::FEATURE_MSR,
        ];
        let mut ext = vec![[0u32; 4]; 0x1F];
        ext[0] = [leaves::EXTENDED_BASE + 0x1E, 0, 0, 0];
        ext[2..5].copy_from_slice(&brand_leaves(brand));
        ext[7] = [0, 0, 0, leaves::POWER_INVARIANT_TSC];
        ext[8] = [0, 0, 7, 0];
        // two threads per core
        ext[0x1E] = [apic, (1 << 8) | core, node, 0];
        ThreadIdentity::from_tables(index, std, ext)
    }

    pub fn fast_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.clock_read_spacing_ms = 0;
        cfg.calibration.window_ms = 1;
        cfg
    }
}
