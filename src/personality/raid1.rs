//! Mirroring
//!
//! Every member holds a full copy. Resync copies from the first
//! in-sync member onto the others, recovery copies onto members still
//! being rebuilt, and a check only compares.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ArrayContext, Level, Personality, PersonalityFactory};
use crate::device::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::rdev::MemberInfo;
use crate::resync::SyncKind;

/// Sectors handled per sync request (64 KiB)
const RESYNC_SECTORS: u64 = 128;

/// `-EIO`, returned when a sync request cannot be served
const SYNC_EIO: i64 = -5;

/// Registers [`Raid1`] for level 1
#[derive(Debug, Default, Clone, Copy)]
pub struct Raid1Factory;

impl PersonalityFactory for Raid1Factory {
    fn level(&self) -> Level {
        Level::Raid1
    }

    fn name(&self) -> &'static str {
        "raid1"
    }

    fn create(&self) -> Arc<dyn Personality> {
        Arc::new(Raid1::default())
    }
}

/// Mirror personality for one array
#[derive(Debug, Default)]
pub struct Raid1 {
    /// Sectors found different by check passes
    mismatches: AtomicU64,
}

impl Raid1 {
    pub fn mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    fn source<'a>(array: &'a ArrayContext) -> Option<&'a MemberInfo> {
        array
            .working_members()
            .find(|m| matches!(m.raid_disk, Some(slot) if slot < array.raid_disks))
    }

    fn targets<'a>(array: &'a ArrayContext, source: &MemberInfo, position: u64) -> Vec<&'a MemberInfo> {
        let kind = array.sync_kind.unwrap_or(SyncKind::Resync);
        array
            .members
            .iter()
            .filter(|m| !m.faulty && m.id != source.id && m.raid_disk.is_some())
            .filter(|m| match kind {
                SyncKind::Recovery => !m.in_sync && m.recovery_offset <= position,
                _ => m.in_sync,
            })
            .collect()
    }

    fn copy_unit(&self, array: &ArrayContext, position: u64, sectors: u64) -> std::io::Result<()> {
        let Some(source) = Self::source(array) else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no in-sync mirror left"));
        };
        let kind = array.sync_kind.unwrap_or(SyncKind::Resync);

        let mut data = vec![0u8; (sectors * SECTOR_SIZE) as usize];
        source.device.read_at(&mut data, source.data_byte_offset(position))?;
        source.device.stats().record_sync_io(sectors);

        let mut scratch = Vec::new();
        for target in Self::targets(array, source, position) {
            if kind == SyncKind::Check {
                scratch.resize(data.len(), 0);
                target.device.read_at(&mut scratch, target.data_byte_offset(position))?;
                target.device.stats().record_sync_io(sectors);
                if scratch != data {
                    self.mismatches.fetch_add(sectors, Ordering::Relaxed);
                    debug!("raid1: {}: mismatch on {} at sector {}", array.name, target.name, position);
                }
                continue;
            }
            target.device.write_at(&data, target.data_byte_offset(position))?;
            target.device.stats().record_sync_io(sectors);
        }
        Ok(())
    }
}

impl Personality for Raid1 {
    fn name(&self) -> &'static str {
        "raid1"
    }

    fn run(&self, array: &ArrayContext) -> Result<()> {
        if Self::source(array).is_none() {
            return Err(Error::Personality {
                array: array.name.clone(),
                reason: "no operational mirrors".to_string(),
            });
        }
        let working = array.raid_disks - array.degraded();
        info!(
            "raid1: raid set {} active with {} out of {} mirrors",
            array.name, working, array.raid_disks
        );
        self.mismatches.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&self, array: &ArrayContext) {
        debug!("raid1: {} stopped", array.name);
    }

    fn sync_request(&self, array: &ArrayContext, position: u64, _slow: bool) -> i64 {
        let sectors = RESYNC_SECTORS.min(array.dev_sectors.saturating_sub(position));
        if sectors == 0 {
            return SYNC_EIO;
        }
        match self.copy_unit(array, position, sectors) {
            Ok(()) => sectors as i64,
            Err(e) => {
                warn!("raid1: {}: sync failed at sector {}: {}", array.name, position, e);
                SYNC_EIO
            }
        }
    }

    fn error_handler(&self, array: &ArrayContext, member: &MemberInfo) {
        let left = array.working_members().filter(|m| m.id != member.id).count();
        warn!(
            "raid1: Disk failure on {}, disabling device. Operation continuing on {} devices.",
            member.name, left
        );
    }

    fn hot_add_disk(&self, array: &ArrayContext, member: &MemberInfo) -> Option<u32> {
        let slot = (0..array.raid_disks).find(|slot| array.member_in_slot(*slot).is_none())?;
        info!("raid1: {}: adding {} as mirror {}", array.name, member.name, slot);
        Some(slot)
    }

    fn hot_remove_disk(&self, array: &ArrayContext, slot: u32) -> Result<()> {
        match array.member_in_slot(slot) {
            Some(member) if member.in_sync && !member.faulty => Err(Error::Personality {
                array: array.name.clone(),
                reason: format!("mirror {} ({}) is still in use", slot, member.name),
            }),
            _ => Ok(()),
        }
    }

    fn spare_active(&self, array: &ArrayContext) -> Vec<u32> {
        array
            .members
            .iter()
            .filter(|m| !m.faulty && !m.in_sync && m.recovery_offset >= array.dev_sectors)
            .filter_map(|m| m.raid_disk)
            .collect()
    }

    fn resize(&self, _array: &ArrayContext, _new_sectors: u64) -> Result<()> {
        Ok(())
    }

    fn reshape(&self, array: &ArrayContext, new_raid_disks: u32) -> Result<()> {
        let busy = array
            .members
            .iter()
            .filter_map(|m| m.raid_disk)
            .filter(|slot| *slot >= new_raid_disks)
            .count();
        if new_raid_disks == 0 || busy > 0 {
            return Err(Error::Personality {
                array: array.name.clone(),
                reason: format!("cannot reshape to {} mirrors while {} slots above it are in use", new_raid_disks, busy),
            });
        }
        Ok(())
    }

    fn status(&self, out: &mut dyn fmt::Write, array: &ArrayContext) -> fmt::Result {
        write!(out, " [{}/{}] [", array.raid_disks, array.raid_disks - array.degraded())?;
        for slot in 0..array.raid_disks {
            let up = array.member_in_slot(slot).is_some_and(|m| m.in_sync && !m.faulty);
            out.write_char(if up { 'U' } else { '_' })?;
        }
        out.write_char(']')
    }
}
