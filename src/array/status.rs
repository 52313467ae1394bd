//! Status snapshots and mdstat rendering

use std::fmt::Write;

use serde::Serialize;
use uuid::Uuid;

use super::{Array, ArrayInner, ArrayRegistry, ArrayState};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::personality::Level;
use crate::rdev::Rdev;
use crate::resync::{RecoveryFlags, ResyncPhase, SyncKind};
use crate::superblock::MAX_SECTOR;

/// Role of a member as shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Active,
    Recovering,
    Spare,
    Faulty,
}

impl MemberState {
    fn of(rdev: &Rdev) -> Self {
        if rdev.is_faulty() {
            MemberState::Faulty
        } else if rdev.is_recovering() {
            MemberState::Recovering
        } else if rdev.raid_disk().is_some() {
            MemberState::Active
        } else {
            MemberState::Spare
        }
    }
}

/// One member
#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub id: DeviceId,
    pub desc_nr: Option<u32>,
    pub raid_disk: Option<u32>,
    pub state: MemberState,
    pub write_mostly: bool,
    pub events: u64,
    pub recovery_offset: Option<u64>,
    pub data_offset: u64,
    pub sectors: u64,
}

impl DiskInfo {
    fn of(rdev: &Rdev) -> Self {
        DiskInfo {
            name: rdev.name().to_string(),
            id: rdev.id(),
            desc_nr: rdev.desc_nr(),
            raid_disk: rdev.raid_disk(),
            state: MemberState::of(rdev),
            write_mostly: rdev.is_write_mostly(),
            events: rdev.events(),
            recovery_offset: rdev.is_recovering().then(|| rdev.recovery_offset()),
            data_offset: rdev.data_offset(),
            sectors: rdev.sectors(),
        }
    }
}

/// Whole-array snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ArrayInfo {
    pub name: String,
    pub state: ArrayState,
    pub metadata: String,
    pub uuid: Uuid,
    pub set_name: String,
    pub level: Option<Level>,
    pub layout: u32,
    pub chunk_sectors: u32,
    pub raid_disks: u32,
    pub dev_sectors: u64,
    pub events: u64,
    /// Resync checkpoint, `None` when fully in sync
    pub resync_checkpoint: Option<u64>,
    pub clean: bool,
    pub ctime: u64,
    pub utime: u64,
    pub active_disks: u32,
    pub working_disks: u32,
    pub spare_disks: u32,
    pub failed_disks: u32,
    pub degraded: u32,
    pub sync_action: Option<SyncKind>,
    pub sync_phase: ResyncPhase,
    pub sync_position: Option<u64>,
    pub disks: Vec<DiskInfo>,
}

impl Array {
    /// Snapshot of geometry, counters and members
    pub fn info(&self) -> ArrayInfo {
        let state = self.state();
        let inner = self.inner.lock();
        let meta = &inner.meta;
        let disks: Vec<DiskInfo> = inner.members.iter().map(DiskInfo::of).collect();
        let count = |state: MemberState| disks.iter().filter(|d| d.state == state).count() as u32;
        let active = count(MemberState::Active);
        let running = self.recovery_flags().contains(RecoveryFlags::RUNNING);

        ArrayInfo {
            name: self.name().to_string(),
            state,
            metadata: meta.format.to_string(),
            uuid: meta.uuid,
            set_name: meta.name.clone(),
            level: (meta.raid_disks != 0).then_some(meta.level),
            layout: meta.layout,
            chunk_sectors: meta.chunk_sectors,
            raid_disks: meta.raid_disks,
            dev_sectors: meta.dev_sectors,
            events: meta.events,
            resync_checkpoint: (meta.recovery_cp != MAX_SECTOR).then_some(meta.recovery_cp),
            clean: meta.in_sync && meta.recovery_cp == MAX_SECTOR,
            ctime: meta.ctime,
            utime: meta.utime,
            active_disks: active,
            working_disks: disks.iter().filter(|d| d.state != MemberState::Faulty).count() as u32,
            spare_disks: count(MemberState::Spare) + count(MemberState::Recovering),
            failed_disks: count(MemberState::Faulty),
            degraded: meta.raid_disks.saturating_sub(active),
            sync_action: if running { inner.sync_kind } else { None },
            sync_phase: self.phase(),
            sync_position: running.then(|| self.curr_resync()),
            disks,
        }
    }

    /// Snapshot of one member
    pub fn disk_info(&self, id: DeviceId) -> Result<DiskInfo> {
        let inner = self.inner.lock();
        Self::find_member(&inner, id)
            .map(|index| DiskInfo::of(&inner.members[index]))
            .ok_or(Error::DeviceNotFound(id))
    }

    /// This array's block of mdstat
    pub fn status(&self) -> String {
        let state = self.state();
        let inner = self.inner.lock();
        let mut out = String::new();
        if inner.members.is_empty() && state == ArrayState::Inactive {
            return out;
        }
        let _ = self.render_status(&inner, state, &mut out);
        out
    }

    fn render_status(&self, inner: &ArrayInner, state: ArrayState, out: &mut String) -> std::fmt::Result {
        write!(out, "{} : {}", self.name(), state)?;
        if let Some(personality) = &inner.personality {
            write!(out, " {}", personality.name())?;
        }
        for member in &inner.members {
            write!(out, " {}[{}]", member.name(), member.desc_nr().unwrap_or_default())?;
            if member.is_write_mostly() {
                out.push_str("(W)");
            }
            if member.is_faulty() {
                out.push_str("(F)");
            } else if member.raid_disk().is_none() {
                out.push_str("(S)");
            }
        }
        out.push('\n');

        let Some(personality) = &inner.personality else {
            return Ok(());
        };
        write!(out, "      {} blocks super {}", inner.meta.dev_sectors / 2, inner.meta.format)?;
        let ctx = self.context_locked(inner, None);
        personality.status(out, &ctx)?;
        out.push('\n');

        if let (true, Some(kind)) = (
            self.recovery_flags().contains(RecoveryFlags::RUNNING),
            inner.sync_kind,
        ) {
            let max = inner.meta.dev_sectors.max(1);
            let curr = self.curr_resync().min(max);
            if self.phase() == ResyncPhase::Checking {
                writeln!(out, "      \tresync=DELAYED")?;
            } else {
                let permille = curr.saturating_mul(1000) / max;
                let filled = (permille / 50) as usize;
                writeln!(
                    out,
                    "      [{}>{}]  {} = {}.{}% ({}/{})",
                    "=".repeat(filled),
                    ".".repeat(19usize.saturating_sub(filled)),
                    kind.action(),
                    permille / 10,
                    permille % 10,
                    curr / 2,
                    max / 2
                )?;
            }
        }
        out.push('\n');
        Ok(())
    }
}

impl ArrayRegistry {
    /// mdstat-style overview of every array
    pub fn mdstat(&self) -> String {
        let mut out = String::from("Personalities :");
        for name in self.personalities().names() {
            out.push_str(&format!(" [{}]", name));
        }
        out.push('\n');
        for array in self.arrays() {
            out.push_str(&array.status());
        }
        out.push_str("unused devices: <none>\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayGeometry, DiskSpec};
    use crate::superblock::MetadataFormat;
    use crate::testutil::{mem_table, registry};

    #[tokio::test]
    async fn test_info_and_mdstat() {
        let registry = registry(mem_table(&[0, 16, 32], 4096));
        let handle = registry.open(0);
        let mut geometry = ArrayGeometry::new(Level::Raid1, 2);
        geometry.clean = true;
        geometry.format = Some(MetadataFormat::V1 { minor: 2 });
        handle.create(geometry).await.unwrap();
        handle.add_device(DiskSpec::new(DeviceId::new(8, 0)).slot(0)).await.unwrap();
        handle.add_device(DiskSpec::new(DeviceId::new(8, 16)).slot(1)).await.unwrap();
        handle.run().await.unwrap();
        handle.add_device(DiskSpec::new(DeviceId::new(8, 32))).await.unwrap();

        let info = handle.info();
        assert_eq!(info.state, ArrayState::Running);
        assert_eq!(info.level, Some(Level::Raid1));
        assert_eq!(info.active_disks, 2);
        assert_eq!(info.spare_disks, 1);
        assert_eq!(info.degraded, 0);
        assert!(info.clean);
        assert_eq!(info.resync_checkpoint, None);
        assert_eq!(info.disks[2].state, MemberState::Spare);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["disks"][0]["state"], "active");

        let mdstat = registry.mdstat();
        assert!(mdstat.starts_with("Personalities : [raid1]\n"));
        assert!(mdstat.contains("md0 : active raid1 sda[0] sdb[1] sdc[2](S)"));
        assert!(mdstat.contains("2040 blocks super 1.2 [2/2] [UU]"));
        assert!(mdstat.ends_with("unused devices: <none>\n"));
    }

    #[tokio::test]
    async fn test_disk_info_unknown_device() {
        let registry = registry(mem_table(&[0], 4096));
        let handle = registry.open(0);
        assert!(matches!(
            handle.disk_info(DeviceId::new(8, 0)),
            Err(Error::DeviceNotFound(_))
        ));
        assert!(handle.status().is_empty());
    }
}
