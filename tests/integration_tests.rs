/*
 * Integration tests for Hwprobe
 *
 * These tests drive the public API end to end against a synthetic register
 * backend and a stat file on disk.
 */

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use hwprobe::access::RegisterAccess;
use hwprobe::config::EngineConfig;
use hwprobe::constants::cpuid;
use hwprobe::control::{ControlEvent, ControlMode};
use hwprobe::load::ProcStat;
use hwprobe::sensor::SensorType;
use hwprobe::topology::Vendor;
use hwprobe::DeviceCollection;
use parking_lot::Mutex;
use tempfile::TempDir;

/// Identity leaves only: no MSR, no PCI. The clock advances 1 µs per read and
/// the cycle counter runs at 3 cycles per nanosecond.
struct SyntheticAccess {
    leaves: Mutex<HashMap<(u32, u32), [u32; 4]>>,
    now: AtomicI64,
    closed: AtomicBool,
}

impl SyntheticAccess {
    fn new() -> Self {
        Self {
            leaves: Mutex::new(HashMap::new()),
            now: AtomicI64::new(1_000_000_000),
            closed: AtomicBool::new(false),
        }
    }

    /// Add a logical processor of an unrecognised vendor
    fn add_thread(&self, index: u32, apic: u32, features: u32) {
        let vendor = b"SyntheticCPU";
        let word = |i: usize| u32::from_le_bytes([vendor[i], vendor[i + 1], vendor[i + 2], vendor[i + 3]]);
        let mut leaves = self.leaves.lock();
        leaves.insert((index, 0), [1, word(0), word(8), word(4)]);
        leaves.insert((index, 1), [0x0006_0F10, apic << 24, 0, features]);
    }
}

impl RegisterAccess for SyntheticAccess {
    fn open(&self) -> hwprobe::Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn read_msr(&self, _index: u32) -> Option<(u32, u32)> {
        None
    }

    fn write_msr(&self, _index: u32, _low: u32, _high: u32) -> bool {
        false
    }

    fn read_pci_config(&self, _address: u32, _offset: u32) -> Option<u32> {
        None
    }

    fn write_pci_config(&self, _address: u32, _offset: u32, _value: u32) -> bool {
        false
    }

    fn set_thread_affinity(&self, _mask: u64) -> u64 {
        u64::MAX
    }

    fn read_cycle_counter(&self) -> u64 {
        self.now.load(Ordering::SeqCst) as u64 * 3
    }

    fn monotonic_timestamp(&self) -> i64 {
        self.now.fetch_add(1_000, Ordering::SeqCst)
    }

    fn monotonic_frequency(&self) -> i64 {
        1_000_000_000
    }

    fn cpuid(&self, thread: u32, leaf: u32, subleaf: u32) -> Option<[u32; 4]> {
        if subleaf != 0 {
            return None;
        }
        self.leaves.lock().get(&(thread, leaf)).copied()
    }
}

fn write_stat(path: &Path, lines: &[&str]) {
    let mut contents = String::from("cpu  0 0 0 0 0 0 0 0\n");
    for line in lines {
        contents.push_str(line);
        contents.push('\n');
    }
    contents.push_str("intr 0\nctxt 0\n");
    fs::write(path, contents).unwrap();
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.calibration.window_ms = 1;
    config.clock_read_spacing_ms = 0;
    config
}

#[test]
fn test_generic_two_core_processor_reports_load() {
    let dir = TempDir::new().unwrap();
    let stat = dir.path().join("stat");
    write_stat(&stat, &["cpu0 100 0 100 800 0 0 0 0", "cpu1 100 0 100 800 0 0 0 0"]);

    let access = Arc::new(SyntheticAccess::new());
    access.add_thread(0, 0, 0);
    access.add_thread(1, 1, 0);

    let mut devices =
        DeviceCollection::discover_with(access.clone(), Arc::new(ProcStat::with_path(&stat)), fast_config()).unwrap();
    assert_eq!(devices.cpus().len(), 1);

    let cpu = &devices.cpus()[0];
    assert_eq!(cpu.identifier(), "/genericcpu/0");
    assert_eq!(cpu.vendor(), Vendor::Unknown);
    assert_eq!(cpu.name(), "Unknown CPU");
    assert_eq!(cpu.decoder_name(), "generic");
    assert_eq!(cpu.core_count(), 2);
    assert!(!cpu.has_tsc());
    assert_eq!(cpu.tsc_frequency(), 0.0);
    assert!(cpu.temperatures().is_empty());

    write_stat(&stat, &["cpu0 200 0 200 1600 0 0 0 0", "cpu1 500 0 100 1400 0 0 0 0"]);
    devices.update();

    let loads = devices.cpus()[0].loads();
    assert_eq!(loads.len(), 3);
    assert_eq!(loads[0].name(), "CPU Total");
    assert_eq!(loads[0].identifier(), "/genericcpu/0/load/0");
    let total = loads[0].value().unwrap();
    assert!((0.0..=100.0).contains(&total));
    assert!((total - 30.0).abs() < 0.01);
    assert!((loads[1].value().unwrap() - 20.0).abs() < 0.01);
    assert!((loads[2].value().unwrap() - 40.0).abs() < 0.01);
    assert_eq!(loads[2].name(), "CPU Core #2");

    devices.close();
    assert!(access.closed.load(Ordering::SeqCst));
}

#[test]
fn test_stalled_stat_keeps_previous_load() {
    let dir = TempDir::new().unwrap();
    let stat = dir.path().join("stat");
    write_stat(&stat, &["cpu0 0 0 0 100 0 0 0 0", "cpu1 0 0 0 100 0 0 0 0"]);

    let access = Arc::new(SyntheticAccess::new());
    access.add_thread(0, 0, 0);
    access.add_thread(1, 1, 0);
    let mut devices =
        DeviceCollection::discover_with(access, Arc::new(ProcStat::with_path(&stat)), fast_config()).unwrap();

    write_stat(&stat, &["cpu0 100 0 0 200 0 0 0 0", "cpu1 100 0 0 200 0 0 0 0"]);
    devices.update();
    assert!((devices.cpus()[0].loads()[0].value().unwrap() - 50.0).abs() < 0.01);

    // no ticks elapsed
    devices.update();
    assert!((devices.cpus()[0].loads()[0].value().unwrap() - 50.0).abs() < 0.01);
}

#[test]
fn test_time_stamp_counter_is_calibrated() {
    let dir = TempDir::new().unwrap();
    let stat = dir.path().join("stat");
    write_stat(&stat, &["cpu0 0 0 0 0 0 0 0 0"]);

    let access = Arc::new(SyntheticAccess::new());
    access.add_thread(0, 0, cpuid::FEATURE_TSC);

    let devices =
        DeviceCollection::discover_with(access, Arc::new(ProcStat::with_path(&stat)), fast_config()).unwrap();
    let cpu = &devices.cpus()[0];
    assert!(cpu.has_tsc());
    assert!((cpu.tsc_frequency() - 3000.0).abs() < 10.0);
    assert!(cpu.calibration().is_some());

    // single core: no total
    assert!(cpu.clocks().is_empty());
    assert_eq!(cpu.loads().len(), 1);
    assert_eq!(cpu.loads()[0].name(), "CPU Core");
}

#[test]
fn test_unknown_vendor_threads_are_separate_cores() {
    let dir = TempDir::new().unwrap();
    let stat = dir.path().join("stat");
    write_stat(&stat, &[]);

    // unknown vendors carry no core width: every apic id is its own core
    let access = Arc::new(SyntheticAccess::new());
    for index in 0..4 {
        access.add_thread(index, index, 0);
    }
    let devices =
        DeviceCollection::discover_with(access, Arc::new(ProcStat::with_path(&stat)), fast_config()).unwrap();
    assert_eq!(devices.cpus().len(), 1);
    assert_eq!(devices.cpus()[0].core_count(), 4);
    assert_eq!(devices.cpus()[0].thread_count(), 4);
}

#[test]
fn test_control_state_machine_on_a_sensor() {
    let dir = TempDir::new().unwrap();
    let stat = dir.path().join("stat");
    write_stat(&stat, &["cpu0 0 0 0 0 0 0 0 0"]);

    let access = Arc::new(SyntheticAccess::new());
    access.add_thread(0, 0, 0);
    let mut devices =
        DeviceCollection::discover_with(access, Arc::new(ProcStat::with_path(&stat)), fast_config()).unwrap();

    let sensor = devices.cpus_mut()[0]
        .sensors_mut()
        .iter_mut()
        .find(|s| s.sensor_type() == SensorType::Load)
        .unwrap();
    let control = sensor.attach_control(0.0, 100.0);
    assert_eq!(control.identifier(), "/genericcpu/0/load/0/control");
    assert_eq!(control.mode(), ControlMode::Undefined);

    let events = control.subscribe();
    control.set_software(150.0);
    assert_eq!(control.mode(), ControlMode::Software);
    assert_eq!(control.software_value(), 100.0);

    control.set_software(100.0);
    control.set_default();
    assert_eq!(control.mode(), ControlMode::Default);

    let received: Vec<ControlEvent> = events.try_iter().collect();
    assert_eq!(
        received,
        vec![
            ControlEvent::ModeChanged {
                identifier: "/genericcpu/0/load/0/control".to_string(),
                mode: ControlMode::Software,
            },
            ControlEvent::SoftwareValueChanged {
                identifier: "/genericcpu/0/load/0/control".to_string(),
                value: 100.0,
            },
            ControlEvent::ModeChanged {
                identifier: "/genericcpu/0/load/0/control".to_string(),
                mode: ControlMode::Default,
            },
        ]
    );
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = EngineConfig::default();
    config.max_logical_processors = 0;
    let result = DeviceCollection::discover_with(
        Arc::new(SyntheticAccess::new()),
        Arc::new(ProcStat::with_path("/nonexistent/stat")),
        config,
    );
    assert!(matches!(result, Err(hwprobe::HwprobeError::InvalidConfig { .. })));
}
