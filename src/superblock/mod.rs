//! On-disk array metadata
//!
//! Two superblock families are supported: the legacy v0.90 record at the
//! end of each device, and the v1 record whose minor version selects its
//! location (1.0 at the end, 1.1 at the start, 1.2 4 KiB from the start).
//! Each family implements [`SuperType`], the load/validate/sync protocol
//! the array layer drives without knowing which format it is talking to.

mod v090;
mod v1;

pub use v090::{DiskDescriptor, DiskState, SuperblockV090, V090};
pub use v1::{SuperblockV1, V1};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::array::ArrayMeta;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::personality::Level;
use crate::rdev::Rdev;

/// Checkpoint value meaning "fully in sync"
pub const MAX_SECTOR: u64 = u64::MAX;

/// Superblock format and version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetadataFormat {
    /// Legacy 0.90 format
    V090,
    /// Version 1 format with its minor version (0, 1 or 2)
    V1 { minor: u8 },
}

impl MetadataFormat {
    /// All formats, in probing order
    pub const ALL: [MetadataFormat; 4] = [
        MetadataFormat::V1 { minor: 2 },
        MetadataFormat::V1 { minor: 1 },
        MetadataFormat::V1 { minor: 0 },
        MetadataFormat::V090,
    ];

    /// Handler implementing the load/validate/sync protocol
    pub fn super_type(self) -> &'static dyn SuperType {
        match self {
            MetadataFormat::V090 => &V090,
            MetadataFormat::V1 { minor: 0 } => &v1::V1_0,
            MetadataFormat::V1 { minor: 1 } => &v1::V1_1,
            MetadataFormat::V1 { .. } => &v1::V1_2,
        }
    }

    /// Largest number of descriptor slots the format can record
    pub fn max_disks(self) -> u32 {
        match self {
            MetadataFormat::V090 => v090::MD_SB_DISKS,
            MetadataFormat::V1 { .. } => v1::MAX_DEV,
        }
    }

    /// Find the format of whatever superblock `device` carries
    pub fn detect(device: &dyn BlockDevice) -> Option<(MetadataFormat, Superblock)> {
        Self::ALL.into_iter().find_map(|format| {
            let sb = match format {
                MetadataFormat::V090 => SuperblockV090::read(device).map(|sb| Superblock::V090(Box::new(sb))),
                MetadataFormat::V1 { minor } => {
                    SuperblockV1::read(device, minor).map(|sb| Superblock::V1(Box::new(sb)))
                }
            };
            sb.ok().map(|sb| (format, sb))
        })
    }
}

impl Default for MetadataFormat {
    fn default() -> Self {
        MetadataFormat::V1 { minor: 2 }
    }
}

impl fmt::Display for MetadataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataFormat::V090 => write!(f, "0.90"),
            MetadataFormat::V1 { minor } => write!(f, "1.{}", minor),
        }
    }
}

impl FromStr for MetadataFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0.90" | "0.9" | "0" => Ok(MetadataFormat::V090),
            "1" | "1.2" => Ok(MetadataFormat::V1 { minor: 2 }),
            "1.1" => Ok(MetadataFormat::V1 { minor: 1 }),
            "1.0" => Ok(MetadataFormat::V1 { minor: 0 }),
            other => Err(Error::InvalidConfig(format!("unknown metadata format '{}'", other))),
        }
    }
}

impl TryFrom<String> for MetadataFormat {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MetadataFormat> for String {
    fn from(format: MetadataFormat) -> String {
        format.to_string()
    }
}

/// Result of loading a superblock against a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Strictly more recent than the reference (or no reference given)
    Fresher,
    /// Same array, not more recent
    Same,
}

/// Role recorded for a descriptor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskRole {
    /// Serving a raid slot
    Active { slot: u32, in_sync: bool },
    /// Not assigned to a slot
    Spare,
    Faulty,
    Removed,
}

/// A decoded superblock of either family
#[derive(Debug, Clone, PartialEq)]
pub enum Superblock {
    V090(Box<SuperblockV090>),
    V1(Box<SuperblockV1>),
}

impl Superblock {
    pub fn format(&self) -> MetadataFormat {
        match self {
            Superblock::V090(_) => MetadataFormat::V090,
            Superblock::V1(sb) => MetadataFormat::V1 { minor: sb.minor },
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Superblock::V090(sb) => Uuid::from_bytes(sb.set_uuid),
            Superblock::V1(sb) => Uuid::from_bytes(sb.set_uuid),
        }
    }

    pub fn events(&self) -> u64 {
        match self {
            Superblock::V090(sb) => sb.events,
            Superblock::V1(sb) => sb.events,
        }
    }

    /// Raw level number
    pub fn level_raw(&self) -> i32 {
        match self {
            Superblock::V090(sb) => sb.level,
            Superblock::V1(sb) => sb.level,
        }
    }

    pub fn level(&self) -> Option<Level> {
        Level::from_raw(self.level_raw())
    }

    pub fn layout(&self) -> u32 {
        match self {
            Superblock::V090(sb) => sb.layout,
            Superblock::V1(sb) => sb.layout,
        }
    }

    pub fn chunk_sectors(&self) -> u32 {
        match self {
            Superblock::V090(sb) => sb.chunk_size >> 9,
            Superblock::V1(sb) => sb.chunksize,
        }
    }

    pub fn raid_disks(&self) -> u32 {
        match self {
            Superblock::V090(sb) => sb.raid_disks,
            Superblock::V1(sb) => sb.raid_disks,
        }
    }

    /// Per-device size in sectors
    pub fn dev_sectors(&self) -> u64 {
        match self {
            Superblock::V090(sb) => u64::from(sb.size) * 2,
            Superblock::V1(sb) => sb.size,
        }
    }

    /// Resync checkpoint, `MAX_SECTOR` when clean
    pub fn recovery_cp(&self) -> u64 {
        match self {
            Superblock::V090(sb) => sb.checkpoint(),
            Superblock::V1(sb) => sb.resync_offset,
        }
    }

    /// Creation time, seconds since the epoch
    pub fn ctime(&self) -> u64 {
        match self {
            Superblock::V090(sb) => u64::from(sb.ctime),
            Superblock::V1(sb) => sb.ctime & v1::TIME_MASK,
        }
    }

    /// Update time, seconds since the epoch
    pub fn utime(&self) -> u64 {
        match self {
            Superblock::V090(sb) => u64::from(sb.utime),
            Superblock::V1(sb) => sb.utime & v1::TIME_MASK,
        }
    }

    /// Array name (v1 only)
    pub fn name(&self) -> String {
        match self {
            Superblock::V090(_) => String::new(),
            Superblock::V1(sb) => sb.name(),
        }
    }

    /// Descriptor slot of the device carrying this superblock
    pub fn this_desc(&self) -> u32 {
        match self {
            Superblock::V090(sb) => sb.this_disk.number,
            Superblock::V1(sb) => sb.dev_number,
        }
    }

    /// Role recorded for a descriptor slot
    pub fn role(&self, desc_nr: u32) -> DiskRole {
        match self {
            Superblock::V090(sb) => sb.role(desc_nr),
            Superblock::V1(sb) => sb.role(desc_nr),
        }
    }

    /// Roles of every recorded descriptor slot
    pub fn roles(&self) -> Vec<(u32, DiskRole)> {
        let slots = match self {
            Superblock::V090(_) => v090::MD_SB_DISKS,
            Superblock::V1(sb) => sb.max_dev,
        };
        (0..slots)
            .map(|nr| (nr, self.role(nr)))
            .filter(|(_, role)| *role != DiskRole::Removed)
            .collect()
    }

    /// Whether the array was shut down clean
    pub fn is_clean(&self) -> bool {
        self.recovery_cp() == MAX_SECTOR
    }

    /// Encoded image with a fresh checksum
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Superblock::V090(sb) => sb.encode(),
            Superblock::V1(sb) => sb.encode(),
        }
    }

    pub(crate) fn as_v090(&self) -> Option<&SuperblockV090> {
        match self {
            Superblock::V090(sb) => Some(sb),
            Superblock::V1(_) => None,
        }
    }

    pub(crate) fn as_v1(&self) -> Option<&SuperblockV1> {
        match self {
            Superblock::V1(sb) => Some(sb),
            Superblock::V090(_) => None,
        }
    }
}

/// Version-specific superblock handling
///
/// `load` reads and checks one device's superblock, `validate` merges it
/// into the array geometry and sets the member's role, and `sync`
/// regenerates a member's superblock from live array state.
pub trait SuperType: Send + Sync {
    /// Format handled
    fn format(&self) -> MetadataFormat;

    /// Read and check the superblock of `rdev`
    ///
    /// With a reference superblock the device must belong to the same
    /// array; it is [`LoadOutcome::Fresher`] only if its event counter is
    /// strictly greater.
    fn load(&self, rdev: &mut Rdev, reference: Option<&Superblock>) -> Result<LoadOutcome>;

    /// Merge a loaded superblock into the array geometry
    ///
    /// With empty geometry (`raid_disks == 0`) the geometry is copied
    /// from the superblock. Otherwise the member's role is derived from
    /// its own role table entry; on an assembling array a member that
    /// missed updates is rejected.
    fn validate(&self, meta: &mut ArrayMeta, rdev: &mut Rdev, running: bool) -> Result<()>;

    /// Regenerate the superblock of `members[index]`
    fn sync(&self, meta: &ArrayMeta, members: &mut [Rdev], index: usize) -> Result<()>;

    /// Place superblock and data on a device that has no superblock yet
    fn prepare(&self, rdev: &mut Rdev) -> Result<()>;
}

/// Read `len` bytes of superblock area at sector `sb_start`
pub(crate) fn read_image(device: &dyn BlockDevice, sb_start: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    device
        .read_at(&mut buf, sb_start * SECTOR_SIZE)
        .map_err(|source| Error::DeviceIo {
            device: device.name().to_string(),
            source,
        })?;
    Ok(buf)
}

/// Fold a 64-bit word sum into 32 bits
fn fold(sum: u64) -> u32 {
    ((sum & 0xffff_ffff) + (sum >> 32)) as u32
}

/// Sum little-endian u32 words, with a trailing u16 if the length is odd
/// in half-words, skipping the 4 bytes at `hole`
pub(crate) fn checksum(buf: &[u8], hole: usize) -> u32 {
    let mut sum = 0u64;
    let mut words = buf.chunks_exact(4);
    for (i, word) in words.by_ref().enumerate() {
        if i * 4 == hole {
            continue;
        }
        sum += u64::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
    }
    let rest = words.remainder();
    if rest.len() >= 2 {
        sum += u64::from(u16::from_le_bytes([rest[0], rest[1]]));
    }
    fold(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse_and_display() {
        assert_eq!("0.90".parse::<MetadataFormat>().unwrap(), MetadataFormat::V090);
        assert_eq!("1".parse::<MetadataFormat>().unwrap(), MetadataFormat::V1 { minor: 2 });
        assert_eq!("1.0".parse::<MetadataFormat>().unwrap(), MetadataFormat::V1 { minor: 0 });
        assert!("2.0".parse::<MetadataFormat>().is_err());

        assert_eq!(MetadataFormat::V1 { minor: 1 }.to_string(), "1.1");
        assert_eq!(MetadataFormat::V090.to_string(), "0.90");
    }

    #[test]
    fn test_format_serde_as_string() {
        let json = serde_json::to_string(&MetadataFormat::V1 { minor: 0 }).unwrap();
        assert_eq!(json, "\"1.0\"");
        let back: MetadataFormat = serde_json::from_str("\"0.90\"").unwrap();
        assert_eq!(back, MetadataFormat::V090);
        assert!(serde_json::from_str::<MetadataFormat>("\"9\"").is_err());
    }

    #[test]
    fn test_checksum_skips_hole_and_folds() {
        let mut buf = vec![0u8; 16];
        buf[0..4].copy_from_slice(&0xffff_ffffu32.to_le_bytes());
        buf[4..8].copy_from_slice(&2u32.to_le_bytes());
        buf[8..12].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        // 0xffffffff + 2 = 0x1_0000_0001, folded to 2
        assert_eq!(checksum(&buf, 8), 2);
    }

    #[test]
    fn test_checksum_trailing_half_word() {
        let mut buf = vec![0u8; 6];
        buf[0..4].copy_from_slice(&1u32.to_le_bytes());
        buf[4..6].copy_from_slice(&7u16.to_le_bytes());
        assert_eq!(checksum(&buf, usize::MAX), 8);
    }
}
