//! Process-wide registry of arrays
//!
//! Arrays are created on first open and dropped from the registry once
//! the last handle goes away and nothing (members, personality) keeps
//! them alive.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::Array;
use crate::config::Config;
use crate::device::DeviceTable;
use crate::personality::{PersonalityRegistry, Raid1Factory};
use crate::resync::ResyncGate;
use crate::superblock::MetadataFormat;
use crate::supervisor::RecoverySupervisor;

/// Global resync speed limits in KiB/s, adjustable at runtime
#[derive(Debug)]
pub struct Tunables {
    speed_limit_min: AtomicU64,
    speed_limit_max: AtomicU64,
}

impl Tunables {
    fn new(min: u64, max: u64) -> Self {
        Tunables {
            speed_limit_min: AtomicU64::new(min),
            speed_limit_max: AtomicU64::new(max),
        }
    }

    pub fn speed_limit_min(&self) -> u64 {
        self.speed_limit_min.load(Ordering::Relaxed)
    }

    pub fn speed_limit_max(&self) -> u64 {
        self.speed_limit_max.load(Ordering::Relaxed)
    }

    pub fn set_speed_limit_min(&self, kib: u64) {
        self.speed_limit_min.store(kib, Ordering::Relaxed);
    }

    pub fn set_speed_limit_max(&self, kib: u64) {
        self.speed_limit_max.store(kib, Ordering::Relaxed);
    }
}

/// State every array of a registry shares
pub(crate) struct RegistryShared {
    pub(crate) devices: Arc<DeviceTable>,
    pub(crate) personalities: PersonalityRegistry,
    pub(crate) gate: ResyncGate,
    pub(crate) wake: Notify,
    pub(crate) tunables: Tunables,
    pub(crate) throttle_sleep: Duration,
    pub(crate) safemode_delay: Duration,
    pub(crate) default_format: MetadataFormat,
}

/// All arrays known to this process
pub struct ArrayRegistry {
    arrays: Mutex<BTreeMap<u32, Arc<Array>>>,
    next_seq: AtomicU64,
    supervisor_interval: Duration,
    shared: Arc<RegistryShared>,
}

impl ArrayRegistry {
    /// Create a registry over `devices` with the built-in personalities
    pub fn new(devices: Arc<DeviceTable>, config: &Config) -> Arc<Self> {
        let personalities = PersonalityRegistry::new();
        personalities.register(Arc::new(Raid1Factory));

        Arc::new(ArrayRegistry {
            arrays: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(1),
            supervisor_interval: config.supervisor.interval(),
            shared: Arc::new(RegistryShared {
                devices,
                personalities,
                gate: ResyncGate::new(),
                wake: Notify::new(),
                tunables: Tunables::new(config.resync.speed_limit_min, config.resync.speed_limit_max),
                throttle_sleep: config.resync.throttle_sleep(),
                safemode_delay: config.supervisor.safemode_delay(),
                default_format: config.metadata.format,
            }),
        })
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.shared.devices
    }

    pub fn personalities(&self) -> &PersonalityRegistry {
        &self.shared.personalities
    }

    pub fn tunables(&self) -> &Tunables {
        &self.shared.tunables
    }

    /// Open array `unit`, creating an empty one if needed
    pub fn open(self: &Arc<Self>, unit: u32) -> ArrayHandle {
        let mut arrays = self.arrays.lock();
        let array = arrays
            .entry(unit)
            .or_insert_with(|| {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                debug!("md: allocated md{} (seq {})", unit, seq);
                Arc::new(Array::new(unit, seq, Arc::clone(&self.shared)))
            })
            .clone();
        array.openers.fetch_add(1, Ordering::SeqCst);
        ArrayHandle {
            array,
            registry: Arc::clone(self),
        }
    }

    /// Look up an existing array
    pub fn get(&self, unit: u32) -> Option<Arc<Array>> {
        self.arrays.lock().get(&unit).cloned()
    }

    /// All arrays, by unit
    pub fn arrays(&self) -> Vec<Arc<Array>> {
        self.arrays.lock().values().cloned().collect()
    }

    /// Lowest unit with no array, at or above `from`
    pub fn free_unit(&self, from: u32) -> u32 {
        let arrays = self.arrays.lock();
        (from..).find(|unit| !arrays.contains_key(unit)).unwrap_or(from)
    }

    /// Nudge the recovery supervisor
    pub fn wake_supervisor(&self) {
        self.shared.wake.notify_one();
    }

    /// Supervisor driving recovery for every array of this registry
    pub fn supervisor(self: &Arc<Self>) -> RecoverySupervisor {
        RecoverySupervisor::new(Arc::clone(self), self.supervisor_interval)
    }

    pub(crate) fn shared(&self) -> &RegistryShared {
        &self.shared
    }

    fn release(&self, array: &Arc<Array>) {
        let mut arrays = self.arrays.lock();
        if array.openers.load(Ordering::SeqCst) != 0 || !array.is_disposable() {
            return;
        }
        let unit = array.unit();
        if arrays.get(&unit).is_some_and(|a| Arc::ptr_eq(a, array)) {
            arrays.remove(&unit);
            debug!("md: freed {}", array.name());
        }
    }
}

/// An open reference to an array
///
/// Dropping the last handle of an empty, inactive array removes it from
/// the registry.
pub struct ArrayHandle {
    array: Arc<Array>,
    registry: Arc<ArrayRegistry>,
}

impl ArrayHandle {
    pub fn array(&self) -> &Arc<Array> {
        &self.array
    }

    /// Number of open handles on this array
    pub fn openers(&self) -> usize {
        self.array.openers.load(Ordering::SeqCst)
    }
}

impl Deref for ArrayHandle {
    type Target = Array;

    fn deref(&self) -> &Array {
        &self.array
    }
}

impl Drop for ArrayHandle {
    fn drop(&mut self) {
        if self.array.openers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.registry.release(&self.array);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{mem_table, registry};

    #[test]
    fn test_open_returns_same_array() {
        let registry = registry(mem_table(&[], 0));
        let a = registry.open(0);
        let b = registry.open(0);
        assert!(Arc::ptr_eq(a.array(), b.array()));
        assert_eq!(a.openers(), 2);
        assert_eq!(a.name(), "md0");
    }

    #[test]
    fn test_empty_array_freed_on_last_close() {
        let registry = registry(mem_table(&[], 0));
        let seq = {
            let handle = registry.open(3);
            handle.seq()
        };
        assert!(registry.get(3).is_none());

        let handle = registry.open(3);
        assert!(handle.seq() > seq);
        assert_eq!(registry.free_unit(0), 0);
        assert_eq!(registry.free_unit(3), 4);
    }

    #[test]
    fn test_builtin_personalities() {
        let registry = registry(mem_table(&[], 0));
        assert_eq!(registry.personalities().names(), vec!["raid1"]);
    }

    #[test]
    fn test_tunables_reach_arrays() {
        let registry = registry(mem_table(&[], 0));
        let handle = registry.open(0);
        assert_eq!(handle.speed_limits(), (1000, 200_000));

        registry.tunables().set_speed_limit_min(50);
        handle.set_speed_limits(None, Some(100));
        assert_eq!(handle.speed_limits(), (50, 100));
    }
}
