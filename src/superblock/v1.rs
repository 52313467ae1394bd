//! Version 1 superblocks
//!
//! A 256 byte header followed by one 16-bit role per descriptor slot.
//! The minor version only selects where the record lives: 1.0 near the
//! end of the device, 1.1 at sector 0, 1.2 at sector 8. Data offset and
//! size are recorded per device.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;
use uuid::Uuid;

use super::{checksum, read_image, DiskRole, LoadOutcome, MetadataFormat, SuperType, Superblock};
use crate::array::ArrayMeta;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{Error, Result, SuperblockFault};
use crate::personality::Level;
use crate::rdev::Rdev;

const MD_SB_MAGIC: u32 = 0xa92b_4efc;
const HEADER_BYTES: usize = 256;
/// Bytes read when probing for a record
const READ_BYTES: usize = 4096;
/// Largest role table a record can carry
pub(crate) const MAX_DEV: u32 = 1920;
/// ctime and utime keep seconds in the low 40 bits
pub(crate) const TIME_MASK: u64 = 0xff_ffff_ffff;
/// Byte offset of sb_csum
const CSUM_BYTE: usize = 216;
/// Sectors reserved for the record at the front of 1.1/1.2 devices
const RESERVED_SECTORS: u64 = (READ_BYTES as u64) / SECTOR_SIZE;

const ROLE_SPARE: u16 = 0xffff;
const ROLE_FAULTY: u16 = 0xfffe;
const ROLE_JOURNAL: u16 = 0xfffd;

bitflags! {
    /// feature_map bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeatureMap: u32 {
        const BITMAP_OFFSET = 1 << 0;
        const RECOVERY_OFFSET = 1 << 1;
        const RESHAPE_ACTIVE = 1 << 2;
    }
}

bitflags! {
    /// Per-device flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DevFlags: u8 {
        const WRITE_MOSTLY = 1 << 0;
    }
}

/// Decoded version 1 superblock
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SuperblockV1 {
    /// Location variant the record was read from or written for
    pub minor: u8,
    pub feature_map: FeatureMap,
    pub set_uuid: [u8; 16],
    pub set_name: [u8; 32],
    pub ctime: u64,
    pub level: i32,
    pub layout: u32,
    /// Per-device size used by the array, in sectors
    pub size: u64,
    /// Chunk size in sectors
    pub chunksize: u32,
    pub raid_disks: u32,
    pub bitmap_offset: u32,
    pub new_level: u32,
    pub reshape_position: u64,
    pub delta_disks: u32,
    pub new_layout: u32,
    pub new_chunk: u32,
    pub new_offset: u32,

    pub data_offset: u64,
    pub data_size: u64,
    pub super_offset: u64,
    pub recovery_offset: u64,
    pub dev_number: u32,
    pub cnt_corrected_read: u32,
    pub device_uuid: [u8; 16],
    pub devflags: DevFlags,
    pub bblog_shift: u8,
    pub bblog_size: u16,
    pub bblog_offset: u32,

    pub utime: u64,
    pub events: u64,
    pub resync_offset: u64,
    pub sb_csum: u32,
    pub max_dev: u32,
    pub dev_roles: Vec<u16>,
}

/// Superblock location for `minor` on a device of `size` sectors
fn sb_location(minor: u8, size: u64) -> Option<u64> {
    let start = match minor {
        0 => size.checked_sub(16)? & !7,
        1 => 0,
        2 => 8,
        _ => return None,
    };
    (start + RESERVED_SECTORS <= size).then_some(start)
}

impl SuperblockV1 {
    /// Parse an image read at the location of `minor`
    pub fn decode(raw: &[u8], minor: u8) -> std::result::Result<Self, SuperblockFault> {
        if raw.len() < HEADER_BYTES {
            return Err(SuperblockFault::BadLayout("short v1 superblock".into()));
        }
        let mut sb = SuperblockV1 {
            minor,
            ..Default::default()
        };

        let mut b = raw;
        let magic = b.get_u32_le();
        if magic != MD_SB_MAGIC {
            return Err(SuperblockFault::BadMagic(magic));
        }
        let major = b.get_u32_le();
        if major != 1 {
            return Err(SuperblockFault::UnsupportedVersion {
                major,
                minor: u32::from(minor),
            });
        }
        sb.feature_map = FeatureMap::from_bits_retain(b.get_u32_le());
        b.advance(4);
        b.copy_to_slice(&mut sb.set_uuid);
        b.copy_to_slice(&mut sb.set_name);
        sb.ctime = b.get_u64_le();
        sb.level = b.get_i32_le();
        sb.layout = b.get_u32_le();
        sb.size = b.get_u64_le();
        sb.chunksize = b.get_u32_le();
        sb.raid_disks = b.get_u32_le();
        sb.bitmap_offset = b.get_u32_le();
        sb.new_level = b.get_u32_le();
        sb.reshape_position = b.get_u64_le();
        sb.delta_disks = b.get_u32_le();
        sb.new_layout = b.get_u32_le();
        sb.new_chunk = b.get_u32_le();
        sb.new_offset = b.get_u32_le();

        sb.data_offset = b.get_u64_le();
        sb.data_size = b.get_u64_le();
        sb.super_offset = b.get_u64_le();
        sb.recovery_offset = b.get_u64_le();
        sb.dev_number = b.get_u32_le();
        sb.cnt_corrected_read = b.get_u32_le();
        b.copy_to_slice(&mut sb.device_uuid);
        sb.devflags = DevFlags::from_bits_retain(b.get_u8());
        sb.bblog_shift = b.get_u8();
        sb.bblog_size = b.get_u16_le();
        sb.bblog_offset = b.get_u32_le();

        sb.utime = b.get_u64_le();
        sb.events = b.get_u64_le();
        sb.resync_offset = b.get_u64_le();
        sb.sb_csum = b.get_u32_le();
        sb.max_dev = b.get_u32_le();

        if sb.max_dev > MAX_DEV {
            return Err(SuperblockFault::BadLayout(format!("max_dev {} too large", sb.max_dev)));
        }
        let csum_len = HEADER_BYTES + 2 * sb.max_dev as usize;
        if raw.len() < csum_len {
            return Err(SuperblockFault::BadLayout("role table beyond end of read".into()));
        }

        let computed = checksum(&raw[..csum_len], CSUM_BYTE);
        if computed != sb.sb_csum {
            return Err(SuperblockFault::BadChecksum {
                stored: sb.sb_csum,
                computed,
            });
        }

        let unsupported = sb.feature_map.bits() & !FeatureMap::RECOVERY_OFFSET.bits();
        if unsupported != 0 {
            return Err(SuperblockFault::UnsupportedFeatures(unsupported));
        }
        if sb.raid_disks as i32 <= 0 {
            return Err(SuperblockFault::NoRaidDisks);
        }
        if sb.data_size < 10 {
            return Err(SuperblockFault::BadLayout(format!("data_size {} too small", sb.data_size)));
        }

        let mut roles = &raw[HEADER_BYTES..csum_len];
        sb.dev_roles = (0..sb.max_dev).map(|_| roles.get_u16_le()).collect();
        Ok(sb)
    }

    /// Encoded length, rounded up to whole sectors
    pub fn sb_bytes(&self) -> usize {
        let len = HEADER_BYTES + 2 * self.max_dev as usize;
        (len + SECTOR_SIZE as usize - 1) & !(SECTOR_SIZE as usize - 1)
    }

    /// Encode with a fresh checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.sb_bytes());

        buf.put_u32_le(MD_SB_MAGIC);
        buf.put_u32_le(1);
        buf.put_u32_le(self.feature_map.bits());
        buf.put_u32_le(0);
        buf.put_slice(&self.set_uuid);
        buf.put_slice(&self.set_name);
        buf.put_u64_le(self.ctime);
        buf.put_i32_le(self.level);
        buf.put_u32_le(self.layout);
        buf.put_u64_le(self.size);
        buf.put_u32_le(self.chunksize);
        buf.put_u32_le(self.raid_disks);
        buf.put_u32_le(self.bitmap_offset);
        buf.put_u32_le(self.new_level);
        buf.put_u64_le(self.reshape_position);
        buf.put_u32_le(self.delta_disks);
        buf.put_u32_le(self.new_layout);
        buf.put_u32_le(self.new_chunk);
        buf.put_u32_le(self.new_offset);

        buf.put_u64_le(self.data_offset);
        buf.put_u64_le(self.data_size);
        buf.put_u64_le(self.super_offset);
        buf.put_u64_le(self.recovery_offset);
        buf.put_u32_le(self.dev_number);
        buf.put_u32_le(self.cnt_corrected_read);
        buf.put_slice(&self.device_uuid);
        buf.put_u8(self.devflags.bits());
        buf.put_u8(self.bblog_shift);
        buf.put_u16_le(self.bblog_size);
        buf.put_u32_le(self.bblog_offset);

        buf.put_u64_le(self.utime);
        buf.put_u64_le(self.events);
        buf.put_u64_le(self.resync_offset);
        buf.put_u32_le(0);
        buf.put_u32_le(self.max_dev);
        buf.put_bytes(0, HEADER_BYTES - buf.len());

        for role in self.dev_roles.iter().take(self.max_dev as usize) {
            buf.put_u16_le(*role);
        }
        let csum_len = HEADER_BYTES + 2 * self.max_dev as usize;
        buf.put_bytes(0, csum_len - buf.len());

        let csum = checksum(&buf, CSUM_BYTE);
        buf[CSUM_BYTE..CSUM_BYTE + 4].copy_from_slice(&csum.to_le_bytes());
        buf.put_bytes(0, self.sb_bytes() - buf.len());
        buf.to_vec()
    }

    /// Read and decode the `minor` superblock of `device`
    pub fn read(device: &dyn BlockDevice, minor: u8) -> Result<Self> {
        let fault = |fault| Error::superblock(device.name(), fault);
        let sb_start = sb_location(minor, device.size_sectors()).ok_or_else(|| {
            fault(SuperblockFault::BadLayout(format!(
                "device too small for a 1.{} superblock",
                minor
            )))
        })?;
        let raw = read_image(device, sb_start, READ_BYTES)?;
        let sb = Self::decode(&raw, minor).map_err(fault)?;
        if sb.super_offset != sb_start {
            return Err(fault(SuperblockFault::BadLayout(format!(
                "superblock offset {} does not match location {}",
                sb.super_offset, sb_start
            ))));
        }
        Ok(sb)
    }

    /// Array name up to the first NUL
    pub fn name(&self) -> String {
        let end = self.set_name.iter().position(|b| *b == 0).unwrap_or(self.set_name.len());
        String::from_utf8_lossy(&self.set_name[..end]).into_owned()
    }

    fn raw_role(&self, desc_nr: u32) -> u16 {
        self.dev_roles
            .get(desc_nr as usize)
            .copied()
            .unwrap_or(ROLE_SPARE)
    }

    /// Role of a descriptor slot
    pub fn role(&self, desc_nr: u32) -> DiskRole {
        match self.raw_role(desc_nr) {
            ROLE_SPARE => DiskRole::Spare,
            role if role >= ROLE_JOURNAL => DiskRole::Faulty,
            slot => DiskRole::Active {
                slot: u32::from(slot),
                in_sync: !(desc_nr == self.dev_number
                    && self.feature_map.contains(FeatureMap::RECOVERY_OFFSET)),
            },
        }
    }
}

fn set_name_bytes(name: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let len = name.len().min(out.len());
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

/// Version 1 superblock handler for one minor version
#[derive(Debug, Clone, Copy)]
pub struct V1 {
    minor: u8,
}

pub(super) static V1_0: V1 = V1 { minor: 0 };
pub(super) static V1_1: V1 = V1 { minor: 1 };
pub(super) static V1_2: V1 = V1 { minor: 2 };

impl SuperType for V1 {
    fn format(&self) -> MetadataFormat {
        MetadataFormat::V1 { minor: self.minor }
    }

    fn load(&self, rdev: &mut Rdev, reference: Option<&Superblock>) -> Result<LoadOutcome> {
        let sb = SuperblockV1::read(rdev.device().as_ref(), self.minor)?;
        let size = rdev.device().size_sectors();
        let fault = |fault| Error::superblock(rdev.name(), fault);
        let layout = |reason: String| fault(SuperblockFault::BadLayout(reason));

        let sb_start = sb.super_offset;
        let sb_sectors = sb.sb_bytes() as u64 / SECTOR_SIZE;
        if self.minor != 0 && sb.data_offset < sb_start + sb_sectors {
            return Err(layout("data overlaps the superblock".into()));
        }
        if self.minor == 0 && sb.data_offset.saturating_add(sb.data_size) > sb_start {
            return Err(layout("data overlaps the superblock".into()));
        }

        let outcome = match reference {
            None => LoadOutcome::Fresher,
            Some(reference) => {
                let refsb = reference
                    .as_v1()
                    .ok_or_else(|| fault(SuperblockFault::StructureMismatch))?;
                if sb.set_uuid != refsb.set_uuid {
                    return Err(fault(SuperblockFault::UuidMismatch));
                }
                if sb.level != refsb.level
                    || sb.layout != refsb.layout
                    || sb.chunksize != refsb.chunksize
                {
                    return Err(fault(SuperblockFault::StructureMismatch));
                }
                if sb.events > refsb.events {
                    LoadOutcome::Fresher
                } else {
                    LoadOutcome::Same
                }
            }
        };

        let available = if self.minor == 0 {
            sb_start
        } else {
            size.checked_sub(sb.data_offset)
                .ok_or_else(|| layout(format!("data offset {} beyond end of device", sb.data_offset)))?
        };
        if available < sb.data_size {
            return Err(layout(format!(
                "device has {} data sectors, superblock records {}",
                available, sb.data_size
            )));
        }
        if sb.size > sb.data_size {
            return Err(layout(format!(
                "array size {} larger than data size {}",
                sb.size, sb.data_size
            )));
        }

        rdev.sb_start = sb_start;
        rdev.data_offset = sb.data_offset;
        rdev.sectors = sb.data_size;
        rdev.device_uuid = Uuid::from_bytes(sb.device_uuid);
        rdev.desc_nr = if sb.level == Level::Multipath.raw() {
            None
        } else {
            Some(sb.dev_number)
        };
        rdev.sb_events = sb.events;
        debug!(
            "md: {} has 1.{} superblock at sector {}, data at {}",
            rdev.name(),
            self.minor,
            sb_start,
            sb.data_offset
        );
        rdev.sb = Some(Superblock::V1(Box::new(sb)));
        Ok(outcome)
    }

    fn validate(&self, meta: &mut ArrayMeta, rdev: &mut Rdev, running: bool) -> Result<()> {
        let sb = match rdev.sb.as_ref().and_then(Superblock::as_v1) {
            Some(sb) => sb.clone(),
            None => {
                return Err(Error::superblock(
                    rdev.name(),
                    SuperblockFault::BadLayout("no v1 superblock loaded".into()),
                ))
            }
        };
        rdev.raid_disk = None;
        rdev.faulty = false;
        rdev.in_sync = false;
        rdev.recovery_offset = 0;
        rdev.write_mostly = sb.devflags.contains(DevFlags::WRITE_MOSTLY);
        let events = sb.events;
        let role = rdev.desc_nr.map(|nr| sb.raw_role(nr)).unwrap_or(ROLE_SPARE);

        if meta.raid_disks == 0 {
            let level = Level::from_raw(sb.level).ok_or_else(|| {
                Error::superblock(
                    rdev.name(),
                    SuperblockFault::BadLayout(format!("unknown level {}", sb.level)),
                )
            })?;
            meta.format = MetadataFormat::V1 { minor: self.minor };
            meta.persistent = true;
            meta.uuid = Uuid::from_bytes(sb.set_uuid);
            meta.name = sb.name();
            meta.ctime = sb.ctime & TIME_MASK;
            meta.utime = sb.utime & TIME_MASK;
            meta.level = level;
            meta.layout = sb.layout;
            meta.chunk_sectors = sb.chunksize;
            meta.raid_disks = sb.raid_disks;
            meta.dev_sectors = sb.size;
            meta.events = events;
            meta.recovery_cp = sb.resync_offset;
            meta.max_disks = MAX_DEV;
        } else if !running {
            if role < ROLE_JOURNAL && events.saturating_add(1) < meta.events {
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

        match role {
            ROLE_SPARE => {}
            role if role >= ROLE_JOURNAL => rdev.faulty = true,
            slot => {
                rdev.raid_disk = Some(u32::from(slot));
                if sb.feature_map.contains(FeatureMap::RECOVERY_OFFSET) {
                    rdev.recovery_offset = sb.recovery_offset;
                } else {
                    rdev.in_sync = true;
                }
            }
        }
        Ok(())
    }

    fn sync(&self, meta: &ArrayMeta, members: &mut [Rdev], index: usize) -> Result<()> {
        let previous = members[index]
            .sb
            .as_ref()
            .and_then(Superblock::as_v1)
            .map(|sb| sb.max_dev)
            .unwrap_or(0);
        let needed = members
            .iter()
            .filter_map(|m| m.desc_nr)
            .max()
            .map_or(0, |nr| nr + 1);
        let max_dev = previous.max(needed);
        if max_dev > MAX_DEV {
            return Err(Error::state(
                &format!("md{}", meta.preferred_minor),
                format!("descriptor slot {} does not fit in a v1 superblock", max_dev - 1),
            ));
        }

        let mut roles = vec![ROLE_FAULTY; max_dev as usize];
        for member in members.iter() {
            let Some(nr) = member.desc_nr else { continue };
            roles[nr as usize] = match member.raid_disk {
                _ if member.faulty => ROLE_FAULTY,
                Some(slot) => slot as u16,
                None => ROLE_SPARE,
            };
        }

        let member = &mut members[index];
        let dev_number = member.desc_nr.ok_or_else(|| {
            Error::Internal(format!("{} has no descriptor slot", member.name()))
        })?;
        let mut feature_map = FeatureMap::empty();
        let mut recovery_offset = 0;
        if member.is_recovering() {
            feature_map |= FeatureMap::RECOVERY_OFFSET;
            recovery_offset = member.recovery_offset;
        }
        let mut devflags = DevFlags::empty();
        if member.write_mostly {
            devflags |= DevFlags::WRITE_MOSTLY;
        }

        let sb = SuperblockV1 {
            minor: self.minor,
            feature_map,
            set_uuid: *meta.uuid.as_bytes(),
            set_name: set_name_bytes(&meta.name),
            ctime: meta.ctime & TIME_MASK,
            level: meta.level.raw(),
            layout: meta.layout,
            size: meta.dev_sectors,
            chunksize: meta.chunk_sectors,
            raid_disks: meta.raid_disks,
            data_offset: member.data_offset,
            data_size: member.sectors,
            super_offset: member.sb_start,
            recovery_offset,
            dev_number,
            device_uuid: *member.device_uuid.as_bytes(),
            devflags,
            utime: meta.utime & TIME_MASK,
            events: meta.events,
            resync_offset: if meta.in_sync { meta.recovery_cp } else { 0 },
            max_dev,
            dev_roles: roles,
            ..Default::default()
        };
        member.sb_events = meta.events;
        member.sb = Some(Superblock::V1(Box::new(sb)));
        Ok(())
    }

    fn prepare(&self, rdev: &mut Rdev) -> Result<()> {
        let size = rdev.device().size_sectors();
        let too_small = || Error::DeviceTooSmall {
            device: rdev.name().to_string(),
            have: size,
            need: 2 * RESERVED_SECTORS + 10,
        };
        let sb_start = sb_location(self.minor, size).ok_or_else(too_small)?;
        let (data_offset, sectors) = if self.minor == 0 {
            (0, sb_start)
        } else {
            let data_offset = sb_start + RESERVED_SECTORS;
            (data_offset, size.checked_sub(data_offset).ok_or_else(too_small)?)
        };
        if sectors < 10 {
            return Err(too_small());
        }
        rdev.sb_start = sb_start;
        rdev.data_offset = data_offset;
        rdev.sectors = sectors;
        Ok(())
    }
}
