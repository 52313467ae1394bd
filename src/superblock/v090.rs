//! Version 0.90 superblocks
//!
//! A 4 KiB record stored in the last 64 KiB aligned block of the device.
//! The record is addressed in 32-bit little-endian words: a generic
//! constant section (words 0-31), a generic state section (32-63), a
//! personality section (64-127), 27 disk descriptors of 32 words each,
//! and the descriptor of the device carrying the record at word 992.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use super::{checksum, read_image, DiskRole, LoadOutcome, MetadataFormat, SuperType, Superblock, MAX_SECTOR};
use crate::array::ArrayMeta;
use crate::device::BlockDevice;
use crate::error::{Error, Result, SuperblockFault};
use crate::personality::Level;
use crate::rdev::Rdev;

pub(crate) const MD_SB_MAGIC: u32 = 0xa92b_4efc;
/// Descriptor slots in the record
pub(crate) const MD_SB_DISKS: u32 = 27;
/// Size of the record in bytes
pub(crate) const MD_SB_BYTES: usize = 4096;
/// Sectors reserved at the end of the device
const MD_RESERVED_SECTORS: u64 = 128;

const MD_SB_GENERIC_STATE_OFFSET: usize = 32;
const MD_SB_PERSONALITY_OFFSET: usize = 64;
const MD_SB_DISKS_OFFSET: usize = 128;
const MD_SB_DESCRIPTOR_WORDS: usize = 32;
const MD_SB_THIS_DISK_OFFSET: usize = 992;
/// Byte offset of sb_csum (word 38)
const MD_SB_CSUM_BYTE: usize = 38 * 4;

const MD_SB_CLEAN: u32 = 1 << 0;

bitflags! {
    /// State bits of a disk descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DiskState: u32 {
        const FAULTY = 1 << 0;
        const ACTIVE = 1 << 1;
        const SYNC = 1 << 2;
        const REMOVED = 1 << 3;
        const WRITEMOSTLY = 1 << 9;
    }
}

/// One entry of the descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskDescriptor {
    pub number: u32,
    pub major: u32,
    pub minor: u32,
    pub raid_disk: u32,
    pub state: DiskState,
}

impl DiskDescriptor {
    fn decode(mut b: &[u8]) -> Self {
        DiskDescriptor {
            number: b.get_u32_le(),
            major: b.get_u32_le(),
            minor: b.get_u32_le(),
            raid_disk: b.get_u32_le(),
            state: DiskState::from_bits_retain(b.get_u32_le()),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32_le(self.number);
        buf.put_u32_le(self.major);
        buf.put_u32_le(self.minor);
        buf.put_u32_le(self.raid_disk);
        buf.put_u32_le(self.state.bits());
        pad_to(buf, start + MD_SB_DESCRIPTOR_WORDS * 4);
    }

    fn is_blank(&self) -> bool {
        *self == DiskDescriptor::default()
    }
}

/// Decoded 0.90 superblock
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SuperblockV090 {
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
    pub gvalid_words: u32,
    /// uuid0 followed by uuid1..uuid3, in on-disk byte order
    pub set_uuid: [u8; 16],
    pub ctime: u32,
    pub level: i32,
    /// Per-device size in KiB
    pub size: u32,
    pub nr_disks: u32,
    pub raid_disks: u32,
    pub md_minor: u32,
    pub not_persistent: u32,

    pub utime: u32,
    pub state: u32,
    pub active_disks: u32,
    pub working_disks: u32,
    pub failed_disks: u32,
    pub spare_disks: u32,
    pub sb_csum: u32,
    pub events: u64,
    pub cp_events: u64,
    pub recovery_cp: u32,

    pub layout: u32,
    /// Chunk size in bytes
    pub chunk_size: u32,

    pub disks: [DiskDescriptor; MD_SB_DISKS as usize],
    pub this_disk: DiskDescriptor,
}

fn pad_to(buf: &mut BytesMut, len: usize) {
    buf.put_bytes(0, len - buf.len());
}

/// Superblock location for a device of `size` sectors
fn sb_offset(size: u64) -> Option<u64> {
    if size < 2 * MD_RESERVED_SECTORS {
        return None;
    }
    Some((size & !(MD_RESERVED_SECTORS - 1)) - MD_RESERVED_SECTORS)
}

impl SuperblockV090 {
    /// Parse a 4 KiB image
    pub fn decode(raw: &[u8]) -> std::result::Result<Self, SuperblockFault> {
        if raw.len() < MD_SB_BYTES {
            return Err(SuperblockFault::BadLayout("short 0.90 superblock".into()));
        }
        let raw = &raw[..MD_SB_BYTES];
        let mut sb = SuperblockV090::default();

        let mut b = raw;
        let magic = b.get_u32_le();
        if magic != MD_SB_MAGIC {
            return Err(SuperblockFault::BadMagic(magic));
        }
        sb.major_version = b.get_u32_le();
        sb.minor_version = b.get_u32_le();
        if sb.major_version != 0 || !(sb.minor_version == 90 || sb.minor_version == 91) {
            return Err(SuperblockFault::UnsupportedVersion {
                major: sb.major_version,
                minor: sb.minor_version,
            });
        }
        sb.patch_version = b.get_u32_le();
        sb.gvalid_words = b.get_u32_le();
        b.copy_to_slice(&mut sb.set_uuid[0..4]);
        sb.ctime = b.get_u32_le();
        sb.level = b.get_i32_le();
        sb.size = b.get_u32_le();
        sb.nr_disks = b.get_u32_le();
        sb.raid_disks = b.get_u32_le();
        sb.md_minor = b.get_u32_le();
        sb.not_persistent = b.get_u32_le();
        b.copy_to_slice(&mut sb.set_uuid[4..16]);

        if sb.raid_disks as i32 <= 0 {
            return Err(SuperblockFault::NoRaidDisks);
        }

        let mut b = &raw[MD_SB_GENERIC_STATE_OFFSET * 4..];
        sb.utime = b.get_u32_le();
        sb.state = b.get_u32_le();
        sb.active_disks = b.get_u32_le();
        sb.working_disks = b.get_u32_le();
        sb.failed_disks = b.get_u32_le();
        sb.spare_disks = b.get_u32_le();
        sb.sb_csum = b.get_u32_le();
        let events_lo = b.get_u32_le();
        let events_hi = b.get_u32_le();
        sb.events = u64::from(events_hi) << 32 | u64::from(events_lo);
        let cp_lo = b.get_u32_le();
        let cp_hi = b.get_u32_le();
        sb.cp_events = u64::from(cp_hi) << 32 | u64::from(cp_lo);
        sb.recovery_cp = b.get_u32_le();

        let computed = checksum(raw, MD_SB_CSUM_BYTE);
        if computed != sb.sb_csum {
            return Err(SuperblockFault::BadChecksum {
                stored: sb.sb_csum,
                computed,
            });
        }

        let mut b = &raw[MD_SB_PERSONALITY_OFFSET * 4..];
        sb.layout = b.get_u32_le();
        sb.chunk_size = b.get_u32_le();

        for (i, desc) in sb.disks.iter_mut().enumerate() {
            let at = (MD_SB_DISKS_OFFSET + i * MD_SB_DESCRIPTOR_WORDS) * 4;
            *desc = DiskDescriptor::decode(&raw[at..]);
        }
        sb.this_disk = DiskDescriptor::decode(&raw[MD_SB_THIS_DISK_OFFSET * 4..]);

        Ok(sb)
    }

    /// Encode into a 4 KiB image with a fresh checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MD_SB_BYTES);

        buf.put_u32_le(MD_SB_MAGIC);
        buf.put_u32_le(self.major_version);
        buf.put_u32_le(self.minor_version);
        buf.put_u32_le(self.patch_version);
        buf.put_u32_le(self.gvalid_words);
        buf.put_slice(&self.set_uuid[0..4]);
        buf.put_u32_le(self.ctime);
        buf.put_i32_le(self.level);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.nr_disks);
        buf.put_u32_le(self.raid_disks);
        buf.put_u32_le(self.md_minor);
        buf.put_u32_le(self.not_persistent);
        buf.put_slice(&self.set_uuid[4..16]);
        pad_to(&mut buf, MD_SB_GENERIC_STATE_OFFSET * 4);

        buf.put_u32_le(self.utime);
        buf.put_u32_le(self.state);
        buf.put_u32_le(self.active_disks);
        buf.put_u32_le(self.working_disks);
        buf.put_u32_le(self.failed_disks);
        buf.put_u32_le(self.spare_disks);
        buf.put_u32_le(0);
        buf.put_u32_le(self.events as u32);
        buf.put_u32_le((self.events >> 32) as u32);
        buf.put_u32_le(self.cp_events as u32);
        buf.put_u32_le((self.cp_events >> 32) as u32);
        buf.put_u32_le(self.recovery_cp);
        pad_to(&mut buf, MD_SB_PERSONALITY_OFFSET * 4);

        buf.put_u32_le(self.layout);
        buf.put_u32_le(self.chunk_size);
        pad_to(&mut buf, MD_SB_DISKS_OFFSET * 4);

        for desc in &self.disks {
            desc.encode(&mut buf);
        }
        self.this_disk.encode(&mut buf);

        let csum = checksum(&buf, MD_SB_CSUM_BYTE);
        buf[MD_SB_CSUM_BYTE..MD_SB_CSUM_BYTE + 4].copy_from_slice(&csum.to_le_bytes());
        buf.to_vec()
    }

    /// Read and decode the superblock of `device`
    pub fn read(device: &dyn BlockDevice) -> Result<Self> {
        let sb_start = sb_offset(device.size_sectors()).ok_or_else(|| {
            Error::superblock(
                device.name(),
                SuperblockFault::BadLayout("device too small for a 0.90 superblock".into()),
            )
        })?;
        let raw = read_image(device, sb_start, MD_SB_BYTES)?;
        Self::decode(&raw).map_err(|fault| Error::superblock(device.name(), fault))
    }

    /// Resync checkpoint as the array sees it
    ///
    /// A clean record is fully in sync; a dirty record's checkpoint is
    /// only trusted if it was written together with the last event.
    pub fn checkpoint(&self) -> u64 {
        if self.state & MD_SB_CLEAN != 0 {
            MAX_SECTOR
        } else if self.events == self.cp_events {
            if self.recovery_cp == u32::MAX {
                MAX_SECTOR
            } else {
                u64::from(self.recovery_cp)
            }
        } else {
            0
        }
    }

    pub fn is_clean(&self) -> bool {
        self.state & MD_SB_CLEAN != 0
    }

    /// Role of a descriptor slot
    pub fn role(&self, desc_nr: u32) -> DiskRole {
        let Some(desc) = self.disks.get(desc_nr as usize) else {
            return DiskRole::Removed;
        };
        if desc.state.contains(DiskState::REMOVED) || desc.is_blank() {
            DiskRole::Removed
        } else if desc.state.contains(DiskState::FAULTY) {
            DiskRole::Faulty
        } else if desc.state.contains(DiskState::ACTIVE) {
            DiskRole::Active {
                slot: desc.raid_disk,
                in_sync: desc.state.contains(DiskState::SYNC),
            }
        } else {
            DiskRole::Spare
        }
    }

    /// Whole constant section equal, ignoring nr_disks
    fn same_array(&self, other: &SuperblockV090) -> bool {
        self.major_version == other.major_version
            && self.minor_version == other.minor_version
            && self.patch_version == other.patch_version
            && self.gvalid_words == other.gvalid_words
            && self.set_uuid == other.set_uuid
            && self.ctime == other.ctime
            && self.level == other.level
            && self.size == other.size
            && self.raid_disks == other.raid_disks
            && self.md_minor == other.md_minor
            && self.not_persistent == other.not_persistent
    }
}

/// 0.90 superblock handler
#[derive(Debug, Clone, Copy)]
pub struct V090;

impl SuperType for V090 {
    fn format(&self) -> MetadataFormat {
        MetadataFormat::V090
    }

    fn load(&self, rdev: &mut Rdev, reference: Option<&Superblock>) -> Result<LoadOutcome> {
        let sb = SuperblockV090::read(rdev.device().as_ref())?;
        let size = rdev.device().size_sectors();
        let sb_start = sb_offset(size).unwrap_or_default();
        let fault = |fault| Error::superblock(rdev.name(), fault);

        if sb.this_disk.number >= MD_SB_DISKS {
            return Err(fault(SuperblockFault::BadLayout(format!(
                "descriptor number {} out of range",
                sb.this_disk.number
            ))));
        }

        let outcome = match reference {
            None => LoadOutcome::Fresher,
            Some(reference) => {
                let refsb = reference
                    .as_v090()
                    .ok_or_else(|| fault(SuperblockFault::StructureMismatch))?;
                if sb.set_uuid != refsb.set_uuid {
                    return Err(fault(SuperblockFault::UuidMismatch));
                }
                if !sb.same_array(refsb) {
                    return Err(fault(SuperblockFault::StructureMismatch));
                }
                if sb.events > refsb.events {
                    LoadOutcome::Fresher
                } else {
                    LoadOutcome::Same
                }
            }
        };

        if sb.level >= 1 && u64::from(sb.size) * 2 > sb_start {
            return Err(fault(SuperblockFault::BadLayout(format!(
                "device has {} sectors, superblock records {}",
                sb_start,
                u64::from(sb.size) * 2
            ))));
        }

        rdev.sb_start = sb_start;
        rdev.data_offset = 0;
        rdev.sectors = sb_start;
        rdev.preferred_minor = Some(sb.md_minor);
        rdev.desc_nr = if sb.level == Level::Multipath.raw() {
            None
        } else {
            Some(sb.this_disk.number)
        };
        rdev.sb_events = sb.events;
        rdev.sb = Some(Superblock::V090(Box::new(sb)));
        debug!("md: {} has 0.90 superblock at sector {}", rdev.name(), sb_start);
        Ok(outcome)
    }

    fn validate(&self, meta: &mut ArrayMeta, rdev: &mut Rdev, running: bool) -> Result<()> {
        let sb = match rdev.sb.as_ref().and_then(Superblock::as_v090) {
            Some(sb) => sb.clone(),
            None => {
                return Err(Error::superblock(
                    rdev.name(),
                    SuperblockFault::BadLayout("no 0.90 superblock loaded".into()),
                ))
            }
        };
        rdev.raid_disk = None;
        rdev.faulty = false;
        rdev.in_sync = false;
        rdev.write_mostly = false;
        let events = sb.events;

        if meta.raid_disks == 0 {
            let level = Level::from_raw(sb.level).ok_or_else(|| {
                Error::superblock(
                    rdev.name(),
                    SuperblockFault::BadLayout(format!("unknown level {}", sb.level)),
                )
            })?;
            meta.format = MetadataFormat::V090;
            meta.persistent = sb.not_persistent == 0;
            meta.uuid = uuid::Uuid::from_bytes(sb.set_uuid);
            meta.name.clear();
            meta.ctime = u64::from(sb.ctime);
            meta.utime = u64::from(sb.utime);
            meta.level = level;
            meta.layout = sb.layout;
            meta.chunk_sectors = sb.chunk_size >> 9;
            meta.raid_disks = sb.raid_disks;
            meta.dev_sectors = u64::from(sb.size) * 2;
            meta.events = events;
            meta.recovery_cp = sb.checkpoint();
            meta.preferred_minor = sb.md_minor;
            meta.max_disks = MD_SB_DISKS;
        } else if !running {
            let desc = rdev.desc_nr.and_then(|nr| sb.disks.get(nr as usize));
            let active = desc
                .map(|d| d.state.intersects(DiskState::SYNC | DiskState::ACTIVE))
                .unwrap_or(false);
            if active && events.saturating_add(1) < meta.events {
                return Err(Error::StaleDevice {
                    array: format!("md{}", meta.preferred_minor),
                    device: rdev.name().to_string(),
                    device_events: events,
                    array_events: meta.events,
                });
            }
        } else if events < meta.events {
            // Added with an old superblock: stays a spare
            return Ok(());
        }

        if meta.level == Level::Multipath {
            rdev.raid_disk = rdev.desc_nr;
            rdev.in_sync = true;
            return Ok(());
        }

        let Some(desc) = rdev.desc_nr.and_then(|nr| sb.disks.get(nr as usize)) else {
            return Ok(());
        };
        if desc.state.contains(DiskState::FAULTY) {
            rdev.faulty = true;
        } else if desc.state.contains(DiskState::SYNC) {
            rdev.in_sync = true;
            rdev.raid_disk = Some(desc.raid_disk);
        }
        if desc.state.contains(DiskState::WRITEMOSTLY) {
            rdev.write_mostly = true;
        }
        Ok(())
    }

    fn sync(&self, meta: &ArrayMeta, members: &mut [Rdev], index: usize) -> Result<()> {
        let mut sb = SuperblockV090 {
            major_version: 0,
            minor_version: 90,
            patch_version: 0,
            gvalid_words: 0,
            set_uuid: *meta.uuid.as_bytes(),
            ctime: meta.ctime as u32,
            level: meta.level.raw(),
            size: (meta.dev_sectors / 2) as u32,
            raid_disks: meta.raid_disks,
            md_minor: meta.preferred_minor,
            not_persistent: u32::from(!meta.persistent),
            utime: meta.utime as u32,
            events: meta.events,
            layout: meta.layout,
            chunk_size: meta.chunk_sectors << 9,
            ..Default::default()
        };

        if meta.in_sync {
            sb.cp_events = meta.events;
            sb.recovery_cp = u32::try_from(meta.recovery_cp).unwrap_or(u32::MAX);
            if meta.recovery_cp == MAX_SECTOR {
                sb.state |= MD_SB_CLEAN;
            }
        }

        let mut occupied = [false; MD_SB_DISKS as usize];
        let mut next_spare = meta.raid_disks;
        for member in members.iter_mut() {
            let active = !member.faulty && member.in_sync && member.raid_disk.is_some();
            let desc_nr = match member.raid_disk {
                Some(slot) if active => slot,
                _ => {
                    let nr = next_spare;
                    next_spare += 1;
                    nr
                }
            };
            if desc_nr >= MD_SB_DISKS {
                return Err(Error::state(
                    &format!("md{}", meta.preferred_minor),
                    format!("{} does not fit in a 0.90 superblock", member.name()),
                ));
            }
            member.desc_nr = Some(desc_nr);
            occupied[desc_nr as usize] = true;

            let id = member.id();
            let desc = &mut sb.disks[desc_nr as usize];
            desc.number = desc_nr;
            desc.major = id.major;
            desc.minor = id.minor;
            desc.raid_disk = if active { member.raid_disk.unwrap_or(desc_nr) } else { desc_nr };
            desc.state = if member.faulty {
                sb.failed_disks += 1;
                DiskState::FAULTY
            } else if active {
                sb.active_disks += 1;
                sb.working_disks += 1;
                DiskState::ACTIVE | DiskState::SYNC
            } else {
                sb.spare_disks += 1;
                sb.working_disks += 1;
                DiskState::empty()
            };
            if member.write_mostly {
                desc.state |= DiskState::WRITEMOSTLY;
            }
            sb.nr_disks += 1;
        }

        for slot in 0..meta.raid_disks.min(MD_SB_DISKS) {
            if !occupied[slot as usize] {
                let desc = &mut sb.disks[slot as usize];
                desc.number = slot;
                desc.raid_disk = slot;
                desc.state = DiskState::REMOVED | DiskState::FAULTY;
                sb.failed_disks += 1;
            }
        }

        let member = &mut members[index];
        let desc_nr = member.desc_nr.unwrap_or_default();
        sb.this_disk = sb.disks[desc_nr as usize];
        member.sb_events = meta.events;
        member.sb = Some(Superblock::V090(Box::new(sb)));
        Ok(())
    }

    fn prepare(&self, rdev: &mut Rdev) -> Result<()> {
        let size = rdev.device().size_sectors();
        let sb_start = sb_offset(size).ok_or_else(|| Error::DeviceTooSmall {
            device: rdev.name().to_string(),
            have: size,
            need: 2 * MD_RESERVED_SECTORS,
        })?;
        rdev.sb_start = sb_start;
        rdev.data_offset = 0;
        rdev.sectors = sb_start;
        Ok(())
    }
}
