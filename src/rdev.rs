//! Member devices
//!
//! An [`Rdev`] is a claimed block device together with everything the
//! array layer knows about it: where its superblock lives, which
//! descriptor slot and raid slot it occupies, and whether it is faulty,
//! in sync, or a spare. Dropping an `Rdev` exports the device and makes
//! it available to other arrays again.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::device::{BlockDevice, DeviceClaim, DeviceId, DeviceTable, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::superblock::{MetadataFormat, Superblock};

/// A member device of an array
pub struct Rdev {
    claim: DeviceClaim,
    /// Index in the superblock's descriptor table
    pub(crate) desc_nr: Option<u32>,
    /// Raid slot served, `None` for spares
    pub(crate) raid_disk: Option<u32>,
    /// Usable data size in sectors
    pub(crate) sectors: u64,
    /// Superblock location in sectors
    pub(crate) sb_start: u64,
    /// Start of data in sectors
    pub(crate) data_offset: u64,
    pub(crate) faulty: bool,
    pub(crate) in_sync: bool,
    pub(crate) write_mostly: bool,
    /// Sectors already recovered on a member that is not yet in sync
    pub(crate) recovery_offset: u64,
    /// Last superblock loaded or generated
    pub(crate) sb: Option<Superblock>,
    /// Event count of the loaded superblock
    pub(crate) sb_events: u64,
    /// Minor the array wants to be assembled at (0.90 only)
    pub(crate) preferred_minor: Option<u32>,
    pub(crate) device_uuid: Uuid,
    /// Why the superblock could not be loaded
    pub(crate) import_error: Option<String>,
    pub(crate) last_events: u64,
    pending: Arc<AtomicU32>,
}

impl Rdev {
    /// Claim a device for `holder` and optionally load its superblock
    ///
    /// A superblock that fails to load does not fail the import: the
    /// member comes back marked faulty with the reason recorded, so the
    /// caller can decide what to do with it. Claim failures are errors.
    pub fn import(
        table: &Arc<DeviceTable>,
        id: DeviceId,
        holder: &str,
        format: Option<MetadataFormat>,
    ) -> Result<Rdev> {
        let claim = table.claim(id, holder)?;
        let mut rdev = Rdev::from_claim(claim);

        let size = rdev.device().size_sectors();
        if size == 0 {
            return Err(Error::DeviceTooSmall {
                device: rdev.name().to_string(),
                have: 0,
                need: 1,
            });
        }

        if let Some(format) = format {
            if let Err(e) = format.super_type().load(&mut rdev, None) {
                warn!("md: {} does not have a valid v{} superblock, not importing: {}", rdev.name(), format, e);
                rdev.faulty = true;
                rdev.import_error = Some(e.to_string());
            }
        }
        Ok(rdev)
    }

    pub(crate) fn from_claim(claim: DeviceClaim) -> Rdev {
        let sectors = claim.device().size_sectors();
        Rdev {
            claim,
            desc_nr: None,
            raid_disk: None,
            sectors,
            sb_start: 0,
            data_offset: 0,
            faulty: false,
            in_sync: false,
            write_mostly: false,
            recovery_offset: 0,
            sb: None,
            sb_events: 0,
            preferred_minor: None,
            device_uuid: Uuid::new_v4(),
            import_error: None,
            last_events: 0,
            pending: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The underlying block device
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        self.claim.device()
    }

    /// Device identity
    pub fn id(&self) -> DeviceId {
        self.device().id()
    }

    /// Device name
    pub fn name(&self) -> &str {
        self.claim.device().name()
    }

    pub fn desc_nr(&self) -> Option<u32> {
        self.desc_nr
    }

    pub fn raid_disk(&self) -> Option<u32> {
        self.raid_disk
    }

    pub fn is_faulty(&self) -> bool {
        self.faulty
    }

    pub fn is_in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn is_write_mostly(&self) -> bool {
        self.write_mostly
    }

    /// Usable data size in sectors
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn recovery_offset(&self) -> u64 {
        self.recovery_offset
    }

    /// Superblock last loaded from or generated for this device
    pub fn superblock(&self) -> Option<&Superblock> {
        self.sb.as_ref()
    }

    /// Event count of the loaded superblock
    pub fn events(&self) -> u64 {
        self.sb_events
    }

    pub fn import_error(&self) -> Option<&str> {
        self.import_error.as_deref()
    }

    /// Spare: not faulty and not assigned to a raid slot
    pub fn is_spare(&self) -> bool {
        !self.faulty && self.raid_disk.is_none()
    }

    /// Occupies a slot but still needs recovery
    pub fn is_recovering(&self) -> bool {
        !self.faulty && self.raid_disk.is_some() && !self.in_sync
    }

    /// Outstanding I/O pinned on this member
    pub fn pending_io(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Pin the member for the duration of an I/O
    pub fn pin(&self) -> PendingIo {
        self.pending.fetch_add(1, Ordering::AcqRel);
        PendingIo {
            count: Arc::clone(&self.pending),
        }
    }

    /// Write an encoded superblock image at this member's superblock location
    pub(crate) fn write_sb(&self, image: &[u8]) -> Result<()> {
        let device = self.device();
        device
            .write_at(image, self.sb_start * SECTOR_SIZE)
            .and_then(|_| device.flush())
            .map_err(|source| Error::DeviceIo {
                device: self.name().to_string(),
                source,
            })
    }

    /// Snapshot for personalities
    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            id: self.id(),
            name: self.name().to_string(),
            desc_nr: self.desc_nr,
            raid_disk: self.raid_disk,
            in_sync: self.in_sync,
            faulty: self.faulty,
            write_mostly: self.write_mostly,
            recovery_offset: self.recovery_offset,
            data_offset: self.data_offset,
            sectors: self.sectors,
            device: Arc::clone(self.device()),
        }
    }

    /// Copy of everything assembly may change
    pub(crate) fn save_state(&self) -> RdevState {
        RdevState {
            desc_nr: self.desc_nr,
            raid_disk: self.raid_disk,
            sectors: self.sectors,
            sb_start: self.sb_start,
            data_offset: self.data_offset,
            faulty: self.faulty,
            in_sync: self.in_sync,
            write_mostly: self.write_mostly,
            recovery_offset: self.recovery_offset,
            sb: self.sb.clone(),
            sb_events: self.sb_events,
            preferred_minor: self.preferred_minor,
            device_uuid: self.device_uuid,
            import_error: self.import_error.clone(),
            last_events: self.last_events,
        }
    }

    pub(crate) fn restore_state(&mut self, state: RdevState) {
        self.desc_nr = state.desc_nr;
        self.raid_disk = state.raid_disk;
        self.sectors = state.sectors;
        self.sb_start = state.sb_start;
        self.data_offset = state.data_offset;
        self.faulty = state.faulty;
        self.in_sync = state.in_sync;
        self.write_mostly = state.write_mostly;
        self.recovery_offset = state.recovery_offset;
        self.sb = state.sb;
        self.sb_events = state.sb_events;
        self.preferred_minor = state.preferred_minor;
        self.device_uuid = state.device_uuid;
        self.import_error = state.import_error;
        self.last_events = state.last_events;
    }
}

/// Saved member fields, restored when a start fails
#[derive(Debug, Clone)]
pub(crate) struct RdevState {
    desc_nr: Option<u32>,
    raid_disk: Option<u32>,
    sectors: u64,
    sb_start: u64,
    data_offset: u64,
    faulty: bool,
    in_sync: bool,
    write_mostly: bool,
    recovery_offset: u64,
    sb: Option<Superblock>,
    sb_events: u64,
    preferred_minor: Option<u32>,
    device_uuid: Uuid,
    import_error: Option<String>,
    last_events: u64,
}

impl Drop for Rdev {
    fn drop(&mut self) {
        info!("md: export_rdev({})", self.name());
    }
}

impl fmt::Debug for Rdev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rdev")
            .field("device", &self.name())
            .field("desc_nr", &self.desc_nr)
            .field("raid_disk", &self.raid_disk)
            .field("faulty", &self.faulty)
            .field("in_sync", &self.in_sync)
            .field("events", &self.sb_events)
            .finish()
    }
}

/// Keeps a member's pending I/O count raised while alive
#[derive(Debug)]
pub struct PendingIo {
    count: Arc<AtomicU32>,
}

impl Drop for PendingIo {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of a member, handed to personalities
#[derive(Clone)]
pub struct MemberInfo {
    pub id: DeviceId,
    pub name: String,
    pub desc_nr: Option<u32>,
    pub raid_disk: Option<u32>,
    pub in_sync: bool,
    pub faulty: bool,
    pub write_mostly: bool,
    pub recovery_offset: u64,
    pub data_offset: u64,
    pub sectors: u64,
    pub device: Arc<dyn BlockDevice>,
}

impl MemberInfo {
    /// Byte offset of data sector `sector` on this member
    pub fn data_byte_offset(&self, sector: u64) -> u64 {
        (self.data_offset + sector) * SECTOR_SIZE
    }
}

impl fmt::Debug for MemberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberInfo")
            .field("name", &self.name)
            .field("desc_nr", &self.desc_nr)
            .field("raid_disk", &self.raid_disk)
            .field("in_sync", &self.in_sync)
            .field("faulty", &self.faulty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    fn table() -> Arc<DeviceTable> {
        let table = DeviceTable::new();
        table.register(MemDisk::new(DeviceId::new(8, 16), "sdb", 4096)).unwrap();
        table
    }

    #[test]
    fn test_import_without_superblock() {
        let table = table();
        let rdev = Rdev::import(&table, DeviceId::new(8, 16), "md0", None).unwrap();
        assert!(!rdev.is_faulty());
        assert!(rdev.is_spare());
        assert_eq!(rdev.sectors(), 4096);
        assert_eq!(table.holder(DeviceId::new(8, 16)).as_deref(), Some("md0"));
    }

    #[test]
    fn test_import_blank_device_marks_faulty() {
        let table = table();
        let rdev = Rdev::import(&table, DeviceId::new(8, 16), "md0", Some(MetadataFormat::V090)).unwrap();
        assert!(rdev.is_faulty());
        assert!(rdev.import_error().unwrap().contains("magic"));
    }

    #[test]
    fn test_double_import_is_busy() {
        let table = table();
        let _first = Rdev::import(&table, DeviceId::new(8, 16), "md0", None).unwrap();
        let second = Rdev::import(&table, DeviceId::new(8, 16), "md1", None);
        assert!(matches!(second, Err(Error::DeviceBusy { .. })));
    }

    #[test]
    fn test_drop_releases_claim() {
        let table = table();
        let rdev = Rdev::import(&table, DeviceId::new(8, 16), "md0", None).unwrap();
        drop(rdev);
        assert!(table.holder(DeviceId::new(8, 16)).is_none());
    }

    #[test]
    fn test_pending_io_pin() {
        let table = table();
        let rdev = Rdev::import(&table, DeviceId::new(8, 16), "md0", None).unwrap();
        let a = rdev.pin();
        let b = rdev.pin();
        assert_eq!(rdev.pending_io(), 2);
        drop(a);
        drop(b);
        assert_eq!(rdev.pending_io(), 0);
    }
}
