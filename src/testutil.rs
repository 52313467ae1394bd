//! Shared fixtures for unit tests

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::fmt;

use parking_lot::{Condvar, Mutex};

use crate::array::ArrayRegistry;
use crate::config::Config;
use crate::device::{DeviceId, DeviceTable, MemDevice, MemDisk};
use crate::error::Result;
use crate::personality::{ArrayContext, Level, Personality, PersonalityFactory};
use crate::rdev::{MemberInfo, Rdev};
use crate::superblock::MetadataFormat;

/// A table with one whole-disk `MemDisk` per minor, major 8
pub fn mem_table(minors: &[u32], sectors: u64) -> Arc<DeviceTable> {
    mem_devices(minors, sectors).0
}

/// Like `mem_table`, also handing back the devices for fault injection
pub fn mem_devices(minors: &[u32], sectors: u64) -> (Arc<DeviceTable>, Vec<Arc<MemDevice>>) {
    let table = DeviceTable::new();
    let mut devices = Vec::new();
    for &minor in minors {
        let name = format!("sd{}", (b'a' + (minor / 16) as u8) as char);
        let device = MemDisk::new(DeviceId::new(8, minor), &name, sectors);
        table.register(device.clone()).unwrap();
        devices.push(device);
    }
    (table, devices)
}

/// Import every minor for `md0`
pub fn import_all(table: &Arc<DeviceTable>, minors: &[u32], format: Option<MetadataFormat>) -> Vec<Rdev> {
    minors
        .iter()
        .map(|&minor| Rdev::import(table, DeviceId::new(8, minor), "md0", format).unwrap())
        .collect()
}

/// A registry with fast timings for tests
pub fn registry(table: Arc<DeviceTable>) -> Arc<ArrayRegistry> {
    let mut config = Config::default();
    config.resync.throttle_sleep_ms = 10;
    config.supervisor.safemode_delay_ms = 20;
    config.supervisor.interval_ms = 20;
    ArrayRegistry::new(table, &config)
}

/// Observable knobs shared between a test and its mock personality
#[derive(Default)]
pub struct MockState {
    /// Sectors reported per `sync_request`; 0 or negative fails the pass
    pub step: AtomicI64,
    /// Fail once the position reaches this sector
    pub fail_at: AtomicI64,
    /// Calls to `sync_request`
    pub calls: AtomicUsize,
    /// Spares accepted by `hot_add_disk`
    pub accept_spares: AtomicUsize,
    /// Slots handed to `hot_remove_disk`
    pub removed: Mutex<Vec<u32>>,
    /// Members seen by `hot_add_disk`
    pub offered: Mutex<Vec<String>>,
    /// (array, position) of every `sync_request`, recorded before blocking
    pub positions: Mutex<Vec<(String, u64)>>,
    gate: Mutex<Option<u64>>,
    gate_cond: Condvar,
}

impl MockState {
    pub fn new(step: i64) -> Arc<Self> {
        let state = MockState {
            step: AtomicI64::new(step),
            fail_at: AtomicI64::new(-1),
            accept_spares: AtomicUsize::new(usize::MAX),
            ..Default::default()
        };
        Arc::new(state)
    }

    /// Block `sync_request` at positions >= `position` until released
    pub fn hold_at(&self, position: u64) {
        *self.gate.lock() = Some(position);
    }

    /// Let held `sync_request` calls proceed
    pub fn release(&self) {
        *self.gate.lock() = None;
        self.gate_cond.notify_all();
    }

    /// Positions seen for one array
    pub fn positions_of(&self, array: &str) -> Vec<u64> {
        self.positions
            .lock()
            .iter()
            .filter(|(name, _)| name == array)
            .map(|(_, pos)| *pos)
            .collect()
    }

    fn wait_gate(&self, position: u64) {
        let mut gate = self.gate.lock();
        while matches!(*gate, Some(limit) if position >= limit) {
            self.gate_cond.wait_for(&mut gate, std::time::Duration::from_millis(5));
        }
    }
}

/// Personality that only counts; slot choice is the first vacant one
pub struct MockPersonality {
    state: Arc<MockState>,
}

impl Personality for MockPersonality {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn run(&self, _array: &ArrayContext) -> Result<()> {
        Ok(())
    }

    fn stop(&self, _array: &ArrayContext) {}

    fn sync_request(&self, array: &ArrayContext, position: u64, _slow: bool) -> i64 {
        self.state.positions.lock().push((array.name.clone(), position));
        self.state.wait_gate(position);
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let fail_at = self.state.fail_at.load(Ordering::SeqCst);
        if fail_at >= 0 && position >= fail_at as u64 {
            return -5;
        }
        self.state.step.load(Ordering::SeqCst)
    }

    fn error_handler(&self, _array: &ArrayContext, _member: &MemberInfo) {}

    fn hot_add_disk(&self, array: &ArrayContext, member: &MemberInfo) -> Option<u32> {
        self.state.offered.lock().push(member.name.clone());
        let left = self.state.accept_spares.load(Ordering::SeqCst);
        if left == 0 {
            return None;
        }
        let slot = (0..array.raid_disks).find(|slot| array.member_in_slot(*slot).is_none())?;
        self.state.accept_spares.store(left.saturating_sub(1), Ordering::SeqCst);
        Some(slot)
    }

    fn hot_remove_disk(&self, _array: &ArrayContext, slot: u32) -> Result<()> {
        self.state.removed.lock().push(slot);
        Ok(())
    }

    fn spare_active(&self, array: &ArrayContext) -> Vec<u32> {
        array
            .members
            .iter()
            .filter(|m| !m.faulty && !m.in_sync)
            .filter_map(|m| m.raid_disk)
            .collect()
    }

    fn status(&self, out: &mut dyn fmt::Write, array: &ArrayContext) -> fmt::Result {
        write!(out, " mock {} disks", array.raid_disks)
    }
}

/// Factory registering `MockPersonality` for a level
pub struct MockFactory {
    pub level: Level,
    pub state: Arc<MockState>,
}

impl PersonalityFactory for MockFactory {
    fn level(&self) -> Level {
        self.level
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    fn create(&self) -> Arc<dyn Personality> {
        Arc::new(MockPersonality {
            state: Arc::clone(&self.state),
        })
    }
}
