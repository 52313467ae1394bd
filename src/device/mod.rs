//! Block devices that can become array members
//!
//! Device discovery is not our business: whoever owns the process
//! registers devices in a [`DeviceTable`], and members are created by
//! claiming a device out of that table. A claim is exclusive across the
//! whole process, which is what keeps two arrays from sharing a member.

mod file;
mod memory;

pub use file::FileDevice;
pub use memory::{MemDevice, MemDisk};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Size of a sector in bytes
pub const SECTOR_SIZE: u64 = 512;

/// Identity of a block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    /// Major number
    pub major: u32,
    /// Minor number
    pub minor: u32,
}

impl DeviceId {
    /// Create a device id
    pub const fn new(major: u32, minor: u32) -> Self {
        DeviceId { major, minor }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// I/O activity counters for one physical disk
///
/// Resync I/O is counted separately so that the resync engine can tell
/// its own traffic apart from everybody else's.
#[derive(Debug, Default)]
pub struct IoStats {
    sectors_read: AtomicU64,
    sectors_written: AtomicU64,
    sync_sectors: AtomicU64,
}

impl IoStats {
    /// Record a read
    pub fn record_read(&self, sectors: u64) {
        self.sectors_read.fetch_add(sectors, Ordering::Relaxed);
    }

    /// Record a write
    pub fn record_write(&self, sectors: u64) {
        self.sectors_written.fetch_add(sectors, Ordering::Relaxed);
    }

    /// Record sectors moved on behalf of a resync
    pub fn record_sync_io(&self, sectors: u64) {
        self.sync_sectors.fetch_add(sectors, Ordering::Relaxed);
    }

    /// Total sectors transferred, excluding resync traffic
    pub fn foreign_sectors(&self) -> u64 {
        let total = self.sectors_read.load(Ordering::Relaxed)
            + self.sectors_written.load(Ordering::Relaxed);
        total.wrapping_sub(self.sync_sectors.load(Ordering::Relaxed))
    }

    /// Total sectors read
    pub fn sectors_read(&self) -> u64 {
        self.sectors_read.load(Ordering::Relaxed)
    }

    /// Total sectors written
    pub fn sectors_written(&self) -> u64 {
        self.sectors_written.load(Ordering::Relaxed)
    }
}

/// A block device addressed in bytes, sized in sectors
pub trait BlockDevice: Send + Sync {
    /// Identity of this device
    fn id(&self) -> DeviceId;

    /// Identity of the physical disk containing this device
    ///
    /// Partitions of one disk report the same value.
    fn whole_disk(&self) -> DeviceId;

    /// Human readable name, used in logs
    fn name(&self) -> &str;

    /// Capacity in 512-byte sectors
    fn size_sectors(&self) -> u64;

    /// Read exactly `buf.len()` bytes at byte `offset`
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` at byte `offset`
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Make previous writes durable
    fn flush(&self) -> io::Result<()>;

    /// Activity counters of the containing disk
    fn stats(&self) -> &IoStats;
}

/// Registered devices and who has claimed them
#[derive(Default)]
pub struct DeviceTable {
    devices: RwLock<HashMap<DeviceId, Arc<dyn BlockDevice>>>,
    claims: Mutex<HashMap<DeviceId, String>>,
}

impl DeviceTable {
    /// Create an empty table
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a device available for import
    pub fn register(&self, device: Arc<dyn BlockDevice>) -> Result<()> {
        let id = device.id();
        let mut devices = self.devices.write();
        if devices.contains_key(&id) {
            return Err(Error::Internal(format!("device {} registered twice", id)));
        }
        debug!("registered device {} ({})", device.name(), id);
        devices.insert(id, device);
        Ok(())
    }

    /// Forget a device, e.g. because it vanished
    ///
    /// A claimed device stays registered until its claim is released.
    pub fn unregister(&self, id: DeviceId) -> Result<()> {
        if let Some(holder) = self.claims.lock().get(&id) {
            return Err(Error::DeviceBusy {
                device: id.to_string(),
                holder: holder.clone(),
            });
        }
        self.devices
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::DeviceNotFound(id))
    }

    /// Look up a registered device
    pub fn lookup(&self, id: DeviceId) -> Option<Arc<dyn BlockDevice>> {
        self.devices.read().get(&id).cloned()
    }

    /// Current holder of a device, if any
    pub fn holder(&self, id: DeviceId) -> Option<String> {
        self.claims.lock().get(&id).cloned()
    }

    /// All registered device ids, sorted
    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.devices.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Claim a device exclusively for `holder`
    ///
    /// Fails with [`Error::DeviceBusy`] if anybody already holds it.
    pub fn claim(self: &Arc<Self>, id: DeviceId, holder: &str) -> Result<DeviceClaim> {
        let device = self.lookup(id).ok_or(Error::DeviceNotFound(id))?;

        let mut claims = self.claims.lock();
        if let Some(current) = claims.get(&id) {
            return Err(Error::DeviceBusy {
                device: device.name().to_string(),
                holder: current.clone(),
            });
        }
        claims.insert(id, holder.to_string());
        drop(claims);

        Ok(DeviceClaim {
            table: Arc::clone(self),
            device,
        })
    }

    /// Change the recorded holder of a claimed device
    pub fn relabel(&self, id: DeviceId, holder: &str) {
        if let Some(current) = self.claims.lock().get_mut(&id) {
            if current != holder {
                *current = holder.to_string();
            }
        }
    }

    fn release(&self, id: DeviceId) {
        self.claims.lock().remove(&id);
    }
}

/// Exclusive hold on a device, released on drop
pub struct DeviceClaim {
    table: Arc<DeviceTable>,
    device: Arc<dyn BlockDevice>,
}

impl DeviceClaim {
    /// The claimed device
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.table.release(self.device.id());
    }
}

impl fmt::Debug for DeviceClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClaim")
            .field("device", &self.device.name())
            .field("id", &self.device.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(ids: &[u32]) -> Arc<DeviceTable> {
        let table = DeviceTable::new();
        for &minor in ids {
            let disk = MemDisk::new(DeviceId::new(8, minor), &format!("sd{}", minor), 2048);
            table.register(disk).unwrap();
        }
        table
    }

    #[test]
    fn test_claim_is_exclusive() {
        let table = table_with(&[0]);
        let id = DeviceId::new(8, 0);

        let claim = table.claim(id, "md0").unwrap();
        let err = table.claim(id, "md1").unwrap_err();
        match err {
            Error::DeviceBusy { holder, .. } => assert_eq!(holder, "md0"),
            other => panic!("unexpected error: {}", other),
        }

        drop(claim);
        assert!(table.claim(id, "md1").is_ok());
    }

    #[test]
    fn test_relabel_only_touches_claimed() {
        let table = table_with(&[0, 16]);
        let _claim = table.claim(DeviceId::new(8, 0), "autorun").unwrap();
        table.relabel(DeviceId::new(8, 0), "md3");
        table.relabel(DeviceId::new(8, 16), "md3");
        assert_eq!(table.holder(DeviceId::new(8, 0)).as_deref(), Some("md3"));
        assert!(table.holder(DeviceId::new(8, 16)).is_none());
    }

    #[test]
    fn test_claim_unknown_device() {
        let table = table_with(&[]);
        assert!(matches!(
            table.claim(DeviceId::new(8, 9), "md0"),
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_unregister_claimed_device_fails() {
        let table = table_with(&[1]);
        let id = DeviceId::new(8, 1);
        let claim = table.claim(id, "md0").unwrap();
        assert!(table.unregister(id).is_err());
        drop(claim);
        table.unregister(id).unwrap();
        assert!(table.lookup(id).is_none());
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let table = table_with(&[2]);
        let id = DeviceId::new(8, 2);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.claim(id, &format!("md{}", i)).ok())
            })
            .collect();
        let claims: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(claims.iter().filter(|c| c.is_some()).count(), 1);
    }

    #[test]
    fn test_io_stats_exclude_sync_traffic() {
        let stats = IoStats::default();
        stats.record_read(100);
        stats.record_write(50);
        stats.record_sync_io(120);
        assert_eq!(stats.foreign_sectors(), 30);
    }
}
