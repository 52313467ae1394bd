//! In-memory block devices
//!
//! A `MemDisk` models a physical spindle; `MemDevice`s carved out of it
//! as partitions share its storage and its activity counters.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{BlockDevice, DeviceId, IoStats, SECTOR_SIZE};

/// A physical in-memory disk
pub struct MemDisk {
    id: DeviceId,
    data: RwLock<Vec<u8>>,
    stats: IoStats,
}

impl MemDisk {
    /// Create a disk exposed as a single whole-disk device
    pub fn new(id: DeviceId, name: &str, sectors: u64) -> Arc<MemDevice> {
        let disk = Self::raw(id, sectors);
        Arc::new(MemDevice {
            id,
            name: name.to_string(),
            disk,
            start: 0,
            sectors,
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Create a disk with no device on top of it, for partitioning
    pub fn raw(id: DeviceId, sectors: u64) -> Arc<MemDisk> {
        Arc::new(MemDisk {
            id,
            data: RwLock::new(vec![0u8; (sectors * SECTOR_SIZE) as usize]),
            stats: IoStats::default(),
        })
    }

    /// Carve a partition out of this disk
    pub fn partition(self: &Arc<Self>, id: DeviceId, name: &str, start: u64, sectors: u64) -> Arc<MemDevice> {
        Arc::new(MemDevice {
            id,
            name: name.to_string(),
            disk: Arc::clone(self),
            start,
            sectors,
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Activity counters of this disk
    pub fn stats(&self) -> &IoStats {
        &self.stats
    }
}

/// A device backed by (part of) a `MemDisk`
pub struct MemDevice {
    id: DeviceId,
    name: String,
    disk: Arc<MemDisk>,
    start: u64,
    sectors: u64,
    fail_writes: AtomicBool,
}

impl MemDevice {
    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let size = self.sectors * SECTOR_SIZE;
        let end = offset
            .checked_add(len as u64)
            .filter(|end| *end <= size)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{}: access beyond end of device", self.name),
                )
            })?;
        let base = self.start * SECTOR_SIZE;
        Ok((base + offset) as usize..(base + end) as usize)
    }

    /// Make every following write fail, as a dying disk would
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The disk this device lives on
    pub fn disk(&self) -> &Arc<MemDisk> {
        &self.disk
    }
}

impl BlockDevice for MemDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn whole_disk(&self) -> DeviceId {
        self.disk.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size_sectors(&self) -> u64 {
        self.sectors
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.disk.data.read()[range]);
        self.disk.stats.record_read(buf.len() as u64 / SECTOR_SIZE);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: write error", self.name),
            ));
        }
        let range = self.range(offset, buf.len())?;
        self.disk.data.write()[range].copy_from_slice(buf);
        self.disk.stats.record_write(buf.len() as u64 / SECTOR_SIZE);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn stats(&self) -> &IoStats {
        &self.disk.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let dev = MemDisk::new(DeviceId::new(8, 0), "sda", 16);
        dev.write_at(&[7u8; 512], 1024).unwrap();

        let mut buf = [0u8; 512];
        dev.read_at(&mut buf, 1024).unwrap();
        assert_eq!(buf, [7u8; 512]);
        assert_eq!(dev.stats().sectors_written(), 1);
        assert_eq!(dev.stats().sectors_read(), 1);
    }

    #[test]
    fn test_out_of_range_access() {
        let dev = MemDisk::new(DeviceId::new(8, 0), "sda", 2);
        let mut buf = [0u8; 512];
        assert!(dev.read_at(&mut buf, 1024).is_err());
        assert!(dev.write_at(&buf, 600).is_err());
    }

    #[test]
    fn test_injected_write_failure() {
        let dev = MemDisk::new(DeviceId::new(8, 0), "sda", 4);
        dev.set_fail_writes(true);
        assert!(dev.write_at(&[0u8; 512], 0).is_err());
        dev.set_fail_writes(false);
        dev.write_at(&[0u8; 512], 0).unwrap();
    }

    #[test]
    fn test_partitions_share_disk() {
        let disk = MemDisk::raw(DeviceId::new(8, 0), 64);
        let p1 = disk.partition(DeviceId::new(8, 1), "sda1", 0, 32);
        let p2 = disk.partition(DeviceId::new(8, 2), "sda2", 32, 32);

        p2.write_at(&[1u8; 512], 0).unwrap();
        let mut buf = [0u8; 512];
        p1.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [0u8; 512]);

        assert_eq!(p1.whole_disk(), p2.whole_disk());
        assert_eq!(p1.stats().sectors_written(), 1);
    }
}
