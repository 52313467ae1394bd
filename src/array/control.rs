//! Control operations on arrays
//!
//! Every structural change takes the reconfiguration lock first. The
//! array state mutex is only held for the synchronous part of each
//! operation, never across an await.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{chunk_align, Array, ArrayHandle, ArrayInner, ArrayMeta};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::personality::Level;
use crate::rdev::{Rdev, RdevState};
use crate::resync::{RecoveryFlags, ResyncPhase};
use crate::superblock::{LoadOutcome, MetadataFormat, MAX_SECTOR};

/// Largest chunk accepted: 4 MiB
const MAX_CHUNK_BYTES: u64 = 4 * 1024 * 1024;

/// Smallest chunk accepted: one page
const MIN_CHUNK_BYTES: u64 = 4096;

/// Geometry of a new array
#[derive(Debug, Clone)]
pub struct ArrayGeometry {
    pub level: Level,
    pub layout: u32,
    /// Chunk size in sectors, 0 for levels without chunks
    pub chunk_sectors: u32,
    pub raid_disks: u32,
    /// Used size per member in sectors; 0 means the smallest member
    pub dev_sectors: u64,
    /// Superblock format; `None` keeps the array's current one
    pub format: Option<MetadataFormat>,
    /// Set name (v1 only); empty means the unit number
    pub name: String,
    /// Start without an initial resync
    pub clean: bool,
}

impl ArrayGeometry {
    pub fn new(level: Level, raid_disks: u32) -> Self {
        ArrayGeometry {
            level,
            layout: 0,
            chunk_sectors: 0,
            raid_disks,
            dev_sectors: 0,
            format: None,
            name: String::new(),
            clean: false,
        }
    }
}

/// A device to add to an array
#[derive(Debug, Clone)]
pub struct DiskSpec {
    pub id: DeviceId,
    /// Descriptor slot to pin, for arrays being created
    pub desc_nr: Option<u32>,
    /// Raid slot to pin, for arrays being created
    pub raid_disk: Option<u32>,
    pub in_sync: bool,
    pub write_mostly: bool,
}

impl DiskSpec {
    /// A device with no pinned role
    pub fn new(id: DeviceId) -> Self {
        DiskSpec {
            id,
            desc_nr: None,
            raid_disk: None,
            in_sync: false,
            write_mostly: false,
        }
    }

    /// Pin descriptor and raid slot `slot`, in sync
    pub fn slot(mut self, slot: u32) -> Self {
        self.desc_nr = Some(slot);
        self.raid_disk = Some(slot);
        self.in_sync = true;
        self
    }

    /// Occupy `slot` but rebuild it from the other members
    pub fn rebuilding(mut self, slot: u32) -> Self {
        self.desc_nr = Some(slot);
        self.raid_disk = Some(slot);
        self.in_sync = false;
        self
    }
}

/// How far `stop` takes an array down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Keep the array assembled but refuse writes
    ReadOnly,
    /// Detach the personality and release every member
    Full,
}

/// Operator request for the resync machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Interrupt the running pass
    Idle,
    /// Interrupt and keep new passes from starting
    Frozen,
    /// Allow passes again
    Thaw,
    /// Resume a pending resync
    Resync,
    /// Compare redundancy
    Check,
    /// Compare and rewrite redundancy
    Repair,
}

impl FromStr for SyncAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "idle" => Ok(SyncAction::Idle),
            "frozen" => Ok(SyncAction::Frozen),
            "thaw" => Ok(SyncAction::Thaw),
            "resync" => Ok(SyncAction::Resync),
            "check" => Ok(SyncAction::Check),
            "repair" => Ok(SyncAction::Repair),
            other => Err(Error::InvalidConfig(format!("unknown sync action '{}'", other))),
        }
    }
}

impl Array {
    /// Establish the geometry of a new array
    pub async fn create(&self, geometry: ArrayGeometry) -> Result<()> {
        let _guard = self.lock().await;
        let mut inner = self.inner.lock();
        if inner.personality.is_some() || inner.meta.raid_disks != 0 || !inner.members.is_empty() {
            return Err(Error::state(self.name(), "array is already configured"));
        }

        let format = geometry.format.unwrap_or(inner.meta.format);
        if geometry.raid_disks == 0 || geometry.raid_disks > format.max_disks() {
            return Err(Error::state(
                self.name(),
                format!(
                    "{} raid devices not supported by metadata {}",
                    geometry.raid_disks, format
                ),
            ));
        }
        if geometry.level.requires_chunk() {
            check_chunk(self.name(), geometry.chunk_sectors)?;
        }

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let mut meta = ArrayMeta::new(format);
        meta.uuid = Uuid::new_v4();
        meta.name = if geometry.name.is_empty() {
            self.unit().to_string()
        } else {
            geometry.name
        };
        meta.level = geometry.level;
        meta.layout = geometry.layout;
        meta.chunk_sectors = geometry.chunk_sectors;
        meta.raid_disks = geometry.raid_disks;
        meta.dev_sectors = geometry.dev_sectors;
        meta.ctime = now;
        meta.utime = now;
        meta.recovery_cp = if geometry.clean { MAX_SECTOR } else { 0 };
        meta.preferred_minor = self.unit();

        info!(
            "md: {}: new {} array, {} devices, metadata {}",
            self.name(),
            meta.level,
            meta.raid_disks,
            meta.format
        );
        inner.meta = meta;
        inner.sb_dirty = true;
        Ok(())
    }

    /// Choose the superblock format used to assemble this array
    pub async fn set_format(&self, format: MetadataFormat) -> Result<()> {
        let _guard = self.lock().await;
        let mut inner = self.inner.lock();
        if inner.personality.is_some() || inner.meta.raid_disks != 0 || !inner.members.is_empty() {
            return Err(Error::state(self.name(), "cannot change metadata of a configured array"));
        }
        let mut meta = ArrayMeta::new(format);
        meta.preferred_minor = self.unit();
        inner.meta = meta;
        Ok(())
    }

    /// Add a device
    ///
    /// What this means depends on the array: a member to assemble from
    /// its superblock, a member of an array being created, or a spare
    /// for a running array.
    pub async fn add_device(&self, spec: DiskSpec) -> Result<()> {
        let _guard = self.lock().await;
        let mut inner = self.inner.lock();
        if inner.personality.is_some() {
            self.hot_add_locked(&mut inner, spec)
        } else if inner.meta.raid_disks == 0 {
            self.add_assembling_locked(&mut inner, spec)
        } else {
            self.add_creating_locked(&mut inner, spec)
        }
    }

    fn add_assembling_locked(&self, inner: &mut ArrayInner, spec: DiskSpec) -> Result<()> {
        let handler = inner.meta.format.super_type();
        let mut rdev = Rdev::import(&self.shared.devices, spec.id, self.name(), None)?;
        let reference = inner
            .members
            .iter()
            .find(|m| !m.is_faulty())
            .and_then(|m| m.superblock().cloned());

        if let Err(e) = handler.load(&mut rdev, reference.as_ref()) {
            warn!("md: {}: cannot add {}: {}", self.name(), rdev.name(), e);
            return Err(e);
        }
        self.bind_locked(inner, rdev)
    }

    fn add_creating_locked(&self, inner: &mut ArrayInner, spec: DiskSpec) -> Result<()> {
        let raid_disks = inner.meta.raid_disks;
        if let Some(slot) = spec.raid_disk {
            if slot >= raid_disks {
                return Err(Error::state(
                    self.name(),
                    format!("raid slot {} beyond {} raid devices", slot, raid_disks),
                ));
            }
            if inner.members.iter().any(|m| m.raid_disk == Some(slot)) {
                return Err(Error::state(self.name(), format!("raid slot {} is already taken", slot)));
            }
        }

        let mut rdev = Rdev::import(&self.shared.devices, spec.id, self.name(), None)?;
        if inner.meta.persistent {
            inner.meta.format.super_type().prepare(&mut rdev)?;
        }
        rdev.sectors = chunk_align(rdev.sectors, inner.meta.chunk_sectors);
        if inner.meta.dev_sectors != 0 && rdev.sectors < inner.meta.dev_sectors {
            return Err(Error::DeviceTooSmall {
                device: rdev.name().to_string(),
                have: rdev.sectors,
                need: inner.meta.dev_sectors,
            });
        }

        rdev.desc_nr = spec.desc_nr;
        rdev.raid_disk = spec.raid_disk;
        rdev.in_sync = spec.in_sync && spec.raid_disk.is_some();
        rdev.write_mostly = spec.write_mostly;
        self.bind_locked(inner, rdev)?;
        inner.sb_dirty = true;
        Ok(())
    }

    fn hot_add_locked(&self, inner: &mut ArrayInner, spec: DiskSpec) -> Result<()> {
        if inner.read_only {
            return Err(Error::ReadOnly(self.name().to_string()));
        }
        if !inner.meta.persistent {
            return Err(Error::state(self.name(), "cannot hot-add to an array without superblocks"));
        }
        let Some(personality) = inner.personality.clone() else {
            return Err(Error::state(self.name(), "array is not running"));
        };
        if !personality.supports_hot_disks() {
            return Err(Error::Personality {
                array: self.name().to_string(),
                reason: format!("{} does not support adding disks", personality.name()),
            });
        }

        let mut rdev = Rdev::import(&self.shared.devices, spec.id, self.name(), None)?;
        if rdev.is_faulty() {
            return Err(Error::state(self.name(), format!("{} is faulty", rdev.name())));
        }
        inner.meta.format.super_type().prepare(&mut rdev)?;
        rdev.sectors = chunk_align(rdev.sectors, inner.meta.chunk_sectors);
        if rdev.sectors < inner.meta.dev_sectors {
            warn!("md: {}: disk size {} sectors < array size {}", rdev.name(), rdev.sectors, inner.meta.dev_sectors);
            return Err(Error::DeviceTooSmall {
                device: rdev.name().to_string(),
                have: rdev.sectors,
                need: inner.meta.dev_sectors,
            });
        }

        rdev.desc_nr = None;
        rdev.raid_disk = None;
        rdev.in_sync = false;
        rdev.write_mostly = spec.write_mostly;
        self.bind_locked(inner, rdev)?;

        inner.sb_dirty = true;
        self.commit_locked(inner)?;
        self.set_recovery(RecoveryFlags::NEEDED);
        self.wake();
        Ok(())
    }

    /// Start the array
    ///
    /// A failed start leaves members, device claims and geometry as they
    /// were before the call.
    pub async fn run(&self) -> Result<()> {
        let _guard = self.lock().await;
        let mut inner = self.inner.lock();
        if inner.personality.is_some() {
            return Err(Error::state(self.name(), "array is already running"));
        }
        if inner.members.is_empty() {
            return Err(Error::state(self.name(), "no member devices"));
        }

        let saved_meta = inner.meta.clone();
        let saved_dirty = inner.sb_dirty;
        let saved: Vec<RdevState> = inner.members.iter().map(Rdev::save_state).collect();
        let mut kicked = Vec::new();
        let personality = match self.start_locked(&mut inner, &mut kicked) {
            Ok(personality) => personality,
            Err(e) => {
                for (index, rdev) in kicked.into_iter().rev() {
                    inner.members.insert(index, rdev);
                }
                for (member, state) in inner.members.iter_mut().zip(saved) {
                    member.restore_state(state);
                }
                inner.meta = saved_meta;
                inner.sb_dirty = saved_dirty;
                return Err(e);
            }
        };
        drop(kicked);

        let ctx = self.context_locked(&inner, None);
        let working = ctx.raid_disks - ctx.degraded();
        info!(
            "md: {}: {} array running with {} out of {} devices",
            self.name(),
            personality.name(),
            working,
            ctx.raid_disks
        );
        self.set_phase(ResyncPhase::Idle);
        self.store_recovery(RecoveryFlags::NEEDED);
        self.wake();
        Ok(())
    }

    /// Assemble, validate and start the personality
    ///
    /// Members dropped during assembly are moved to `kicked` with the
    /// index they were removed from, so the caller can put them back.
    fn start_locked(
        &self,
        inner: &mut ArrayInner,
        kicked: &mut Vec<(usize, Rdev)>,
    ) -> Result<Arc<dyn crate::personality::Personality>> {
        if inner.meta.raid_disks == 0 {
            self.analyze_locked(inner, kicked)?;
        }

        let raid_disks = inner.meta.raid_disks;
        for member in inner.members.iter_mut() {
            if member.raid_disk.is_some_and(|slot| slot >= raid_disks) {
                member.raid_disk = None;
                member.in_sync = false;
            }
        }

        let chunk = inner.meta.chunk_sectors;
        if inner.meta.level.requires_chunk() || chunk != 0 {
            check_chunk(self.name(), chunk)?;
            if let Some(small) = inner.members.iter().find(|m| !m.faulty && m.sectors < u64::from(chunk)) {
                return Err(Error::DeviceTooSmall {
                    device: small.name().to_string(),
                    have: small.sectors,
                    need: u64::from(chunk),
                });
            }
        }

        for member in inner.members.iter().filter(|m| !m.faulty) {
            check_overlap(member)?;
        }

        for member in inner.members.iter_mut() {
            member.sectors = chunk_align(member.sectors, chunk);
        }
        let smallest = inner
            .members
            .iter()
            .filter(|m| !m.faulty)
            .map(|m| m.sectors)
            .min()
            .unwrap_or(0);
        if inner.meta.dev_sectors == 0 {
            let mut size = smallest;
            if inner.meta.format == MetadataFormat::V090 {
                size &= !1;
            }
            inner.meta.dev_sectors = size;
        } else if let Some(small) = inner
            .members
            .iter()
            .find(|m| !m.faulty && m.raid_disk.is_some() && m.sectors < inner.meta.dev_sectors)
        {
            return Err(Error::DeviceTooSmall {
                device: small.name().to_string(),
                have: small.sectors,
                need: inner.meta.dev_sectors,
            });
        }
        if inner.meta.dev_sectors == 0 {
            return Err(Error::state(self.name(), "no usable space on member devices"));
        }

        let level = inner.meta.level;
        let factory = self
            .shared
            .personalities
            .find(level)
            .ok_or_else(|| Error::NoPersonality {
                array: self.name().to_string(),
                level: level.to_string(),
            })?;
        let personality = factory.create();
        personality.run(&self.context_locked(inner, None))?;

        inner.personality = Some(Arc::clone(&personality));
        inner.read_only = false;
        inner.meta.in_sync = true;
        if inner.sb_dirty {
            if let Err(e) = self.commit_locked(inner) {
                personality.stop(&self.context_locked(inner, None));
                inner.personality = None;
                return Err(e);
            }
        }
        Ok(personality)
    }

    /// Pick the freshest superblock and validate every member against it
    ///
    /// Members that fail to load or validate are kicked out.
    fn analyze_locked(&self, inner: &mut ArrayInner, kicked_out: &mut Vec<(usize, Rdev)>) -> Result<()> {
        let handler = inner.meta.format.super_type();

        let mut freshest: Option<DeviceId> = None;
        let mut kicked = Vec::new();
        for index in 0..inner.members.len() {
            if inner.members[index].faulty {
                continue;
            }
            let reference = freshest
                .and_then(|id| Self::find_member(inner, id))
                .and_then(|f| inner.members[f].superblock().cloned());
            let member = &mut inner.members[index];
            match handler.load(member, reference.as_ref()) {
                Ok(LoadOutcome::Fresher) => freshest = Some(member.id()),
                Ok(LoadOutcome::Same) => {}
                Err(e) => {
                    warn!(
                        "md: fatal superblock inconsistency in {} -- removing from array: {}",
                        member.name(),
                        e
                    );
                    kicked.push(member.id());
                }
            }
        }
        self.kick_locked(inner, &kicked, kicked_out);

        let freshest = freshest
            .and_then(|id| Self::find_member(inner, id))
            .ok_or_else(|| Error::state(self.name(), "no member with a valid superblock"))?;

        let mut meta = ArrayMeta::new(inner.meta.format);
        meta.preferred_minor = self.unit();
        handler.validate(&mut meta, &mut inner.members[freshest], false)?;
        debug!(
            "md: {}: freshest superblock on {}, events {}",
            self.name(),
            inner.members[freshest].name(),
            meta.events
        );

        let mut kicked = Vec::new();
        for index in 0..inner.members.len() {
            if index == freshest || inner.members[index].faulty {
                continue;
            }
            let member = &mut inner.members[index];
            if let Err(e) = handler.validate(&mut meta, member, false) {
                warn!("md: kicking non-fresh {} from array: {}", member.name(), e);
                kicked.push(member.id());
            }
        }
        self.kick_locked(inner, &kicked, kicked_out);

        if meta.recovery_cp != MAX_SECTOR {
            warn!(
                "md: {}: array is not clean -- starting background reconstruction",
                self.name()
            );
        }
        inner.meta = meta;
        Ok(())
    }

    fn kick_locked(&self, inner: &mut ArrayInner, ids: &[DeviceId], kicked: &mut Vec<(usize, Rdev)>) {
        for id in ids {
            if let Some(index) = Self::find_member(inner, *id) {
                kicked.push((index, self.unbind_locked(inner, index)));
            }
        }
    }

    /// Switch a read-only array back to read-write
    pub async fn set_read_write(&self) -> Result<()> {
        let _guard = self.lock().await;
        let mut inner = self.inner.lock();
        if inner.personality.is_none() {
            return Err(Error::state(self.name(), "array is not running"));
        }
        if !inner.read_only {
            return Err(Error::state(self.name(), "array is already read-write"));
        }
        inner.read_only = false;
        info!("md: {} switched to read-write mode.", self.name());
        self.set_recovery(RecoveryFlags::NEEDED);
        self.wake();
        Ok(())
    }

    /// Remove a member that no longer serves a raid slot
    pub async fn remove_device(&self, id: DeviceId) -> Result<()> {
        let _guard = self.lock().await;
        let mut inner = self.inner.lock();
        let index = Self::find_member(&inner, id).ok_or(Error::DeviceNotFound(id))?;
        let running = inner.personality.is_some();

        let member = &inner.members[index];
        if running && member.raid_disk.is_some() {
            return Err(Error::DeviceBusy {
                device: member.name().to_string(),
                holder: format!("{} raid slot {}", self.name(), member.raid_disk.unwrap_or_default()),
            });
        }
        if member.pending_io() > 0 {
            return Err(Error::DeviceBusy {
                device: member.name().to_string(),
                holder: format!("{} ({} pending I/O)", self.name(), member.pending_io()),
            });
        }

        drop(self.unbind_locked(&mut inner, index));
        if running {
            inner.sb_dirty = true;
            self.commit_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Declare a member failed
    pub async fn set_faulty(&self, id: DeviceId) -> Result<()> {
        let _guard = self.lock().await;
        let mut inner = self.inner.lock();
        let index = Self::find_member(&inner, id).ok_or(Error::DeviceNotFound(id))?;
        if inner.personality.is_none() {
            return Err(Error::state(self.name(), "array is not running"));
        }
        self.fail_member_locked(&mut inner, index);
        Ok(())
    }

    /// Change the used size of every member
    pub async fn resize(&self, sectors: u64) -> Result<()> {
        let _guard = self.lock().await;
        let mut inner = self.inner.lock();
        let personality = self.writable_personality(&inner)?;

        let sectors = chunk_align(sectors, inner.meta.chunk_sectors);
        if sectors == 0 {
            return Err(Error::state(self.name(), "size must be at least one chunk"));
        }
        if let Some(small) = inner
            .members
            .iter()
            .find(|m| !m.faulty && m.raid_disk.is_some() && m.sectors < sectors)
        {
            return Err(Error::DeviceTooSmall {
                device: small.name().to_string(),
                have: small.sectors,
                need: sectors,
            });
        }

        personality.resize(&self.context_locked(&inner, None), sectors)?;
        let old = inner.meta.dev_sectors;
        inner.meta.dev_sectors = sectors;
        if sectors > old && inner.meta.recovery_cp > old {
            inner.meta.recovery_cp = old;
        }
        info!("md: {}: size changed from {} to {} sectors", self.name(), old, sectors);

        inner.sb_dirty = true;
        self.commit_locked(&mut inner)?;
        self.set_recovery(RecoveryFlags::NEEDED);
        self.wake();
        Ok(())
    }

    /// Change the number of raid slots
    pub async fn reshape(&self, raid_disks: u32) -> Result<()> {
        let _guard = self.lock().await;
        let mut inner = self.inner.lock();
        let personality = self.writable_personality(&inner)?;
        if raid_disks == 0 || raid_disks > inner.meta.max_disks {
            return Err(Error::state(
                self.name(),
                format!("{} raid devices not supported by metadata {}", raid_disks, inner.meta.format),
            ));
        }

        personality.reshape(&self.context_locked(&inner, None), raid_disks)?;
        info!(
            "md: {}: raid devices changed from {} to {}",
            self.name(),
            inner.meta.raid_disks,
            raid_disks
        );
        inner.meta.raid_disks = raid_disks;
        inner.sb_dirty = true;
        self.commit_locked(&mut inner)?;
        self.set_recovery(RecoveryFlags::NEEDED);
        self.wake();
        Ok(())
    }

    fn check_writable(&self, inner: &ArrayInner) -> Result<()> {
        self.writable_personality(inner).map(drop)
    }

    fn writable_personality(&self, inner: &ArrayInner) -> Result<Arc<dyn crate::personality::Personality>> {
        let personality = inner
            .personality
            .clone()
            .ok_or_else(|| Error::state(self.name(), "array is not running"))?;
        if inner.read_only {
            return Err(Error::ReadOnly(self.name().to_string()));
        }
        Ok(personality)
    }

    /// Ask the resync machinery to do something
    pub async fn request_sync(&self, action: SyncAction) -> Result<()> {
        let _guard = self.lock().await;
        match action {
            SyncAction::Idle => {
                self.interrupt_resync();
                self.clear_recovery(RecoveryFlags::FROZEN);
            }
            SyncAction::Frozen => {
                self.set_recovery(RecoveryFlags::FROZEN);
                self.interrupt_resync();
            }
            SyncAction::Thaw => self.clear_recovery(RecoveryFlags::FROZEN),
            SyncAction::Resync | SyncAction::Check | SyncAction::Repair => {
                self.check_writable(&self.inner.lock())?;
                if self.recovery_flags().contains(RecoveryFlags::RUNNING) {
                    return Err(Error::ArrayBusy(self.name().to_string()));
                }
                self.clear_recovery(RecoveryFlags::FROZEN);
                match action {
                    SyncAction::Check => self.set_recovery(
                        RecoveryFlags::CHECK | RecoveryFlags::REQUESTED | RecoveryFlags::SYNC,
                    ),
                    SyncAction::Repair => {
                        self.clear_recovery(RecoveryFlags::CHECK);
                        self.set_recovery(RecoveryFlags::REQUESTED | RecoveryFlags::SYNC);
                    }
                    _ => {}
                }
            }
        }
        debug!("md: {}: sync action {:?}", self.name(), action);
        self.set_recovery(RecoveryFlags::NEEDED);
        self.wake();
        Ok(())
    }

    /// Announce a write
    ///
    /// The first write on a clean array marks it dirty and waits until
    /// that has reached the superblocks.
    pub async fn write_start(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.personality.is_none() {
                return Err(Error::state(self.name(), "array is not running"));
            }
            if inner.read_only {
                return Err(Error::ReadOnly(self.name().to_string()));
            }
            inner.writes_pending += 1;
            if inner.meta.in_sync {
                inner.meta.in_sync = false;
                inner.sb_dirty = true;
                self.wake();
            }
        }
        self.wait_committed().await;
        Ok(())
    }

    /// Retire a write started with [`Array::write_start`]
    pub fn write_end(&self) {
        let mut inner = self.inner.lock();
        inner.writes_pending = inner.writes_pending.saturating_sub(1);
        if inner.writes_pending == 0 {
            inner.last_write = Some(std::time::Instant::now());
        }
    }

    /// Interrupt and reap the worker, clearing its flags
    async fn join_worker(&self) {
        let handle = self.inner.lock().sync_thread.take();
        if let Some(handle) = handle {
            self.interrupt_resync();
            match handle.await {
                Ok(outcome) => debug!("md: {}: worker ended: {:?}", self.name(), outcome),
                Err(e) => warn!("md: {}: resync worker failed: {}", self.name(), e),
            }
        }
        self.inner.lock().sync_kind = None;
        let frozen = self.recovery_flags() & RecoveryFlags::FROZEN;
        self.store_recovery(frozen);
    }

    async fn stop_locked(&self, mode: StopMode) -> Result<()> {
        {
            let inner = self.inner.lock();
            match mode {
                StopMode::ReadOnly if inner.personality.is_none() => {
                    return Err(Error::state(self.name(), "array is not running"));
                }
                StopMode::ReadOnly if inner.read_only => {
                    return Err(Error::state(self.name(), "array is already read-only"));
                }
                _ => {}
            }
        }

        self.join_worker().await;

        let mut inner = self.inner.lock();
        if inner.personality.is_some() && !inner.read_only && (!inner.meta.in_sync || inner.sb_dirty) {
            let was_in_sync = inner.meta.in_sync;
            if inner.writes_pending == 0 {
                inner.meta.in_sync = true;
            }
            inner.sb_dirty = false;
            if let Err(e) = self.commit_locked(&mut inner) {
                warn!("md: {}: final superblock update failed: {}", self.name(), e);
                // stays read-write and dirty
                if mode == StopMode::ReadOnly {
                    inner.meta.in_sync = was_in_sync;
                    inner.sb_dirty = true;
                    drop(inner);
                    self.set_recovery(RecoveryFlags::NEEDED);
                    self.wake();
                    return Err(e);
                }
            }
        }

        if mode == StopMode::ReadOnly {
            inner.read_only = true;
            info!("md: {} switched to read-only mode.", self.name());
            return Ok(());
        }

        if let Some(personality) = inner.personality.take() {
            personality.stop(&self.context_locked(&inner, None));
        }
        let members = std::mem::take(&mut inner.members);
        for member in &members {
            info!("md: unbind<{}> from {}", member.name(), self.name());
        }
        drop(members);

        let mut meta = ArrayMeta::new(self.shared.default_format);
        meta.preferred_minor = self.unit();
        inner.meta = meta;
        inner.read_only = false;
        inner.sb_dirty = false;
        inner.writes_pending = 0;
        inner.last_write = None;
        drop(inner);

        self.store_recovery(RecoveryFlags::empty());
        self.set_phase(ResyncPhase::Idle);
        self.set_curr_resync(0);
        info!("md: {} stopped.", self.name());
        Ok(())
    }
}

impl ArrayHandle {
    /// Stop the array; fails if anybody else holds it open
    pub async fn stop(&self, mode: StopMode) -> Result<()> {
        let _guard = self.lock().await;
        if self.openers() > 1 {
            return Err(Error::ArrayBusy(self.name().to_string()));
        }
        self.array().stop_locked(mode).await
    }
}

fn check_chunk(array: &str, chunk_sectors: u32) -> Result<()> {
    let bytes = u64::from(chunk_sectors) * 512;
    if !bytes.is_power_of_two() || !(MIN_CHUNK_BYTES..=MAX_CHUNK_BYTES).contains(&bytes) {
        return Err(Error::state(array, format!("invalid chunk size {} bytes", bytes)));
    }
    Ok(())
}

/// Data area and superblock must not share sectors
fn check_overlap(member: &Rdev) -> Result<()> {
    let Some(sb) = member.superblock() else {
        return Ok(());
    };
    let sb_sectors = (sb.encode().len() as u64).div_ceil(512);
    let data_end = member.data_offset.saturating_add(member.sectors);
    let sb_end = member.sb_start.saturating_add(sb_sectors);
    let overlap = member.data_offset < sb_end && member.sb_start < data_end;
    if overlap {
        return Err(Error::superblock(
            member.name(),
            crate::error::SuperblockFault::BadLayout(format!(
                "data {}+{} overlaps superblock at {}",
                member.data_offset, member.sectors, member.sb_start
            )),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayRegistry, ArrayState};
    use crate::testutil::{mem_devices, mem_table, registry, MockFactory, MockState};
    use std::sync::atomic::Ordering;

    fn id(minor: u32) -> DeviceId {
        DeviceId::new(8, minor)
    }

    async fn create_raid1(handle: &Array, minors: &[u32], format: MetadataFormat, clean: bool) {
        let mut geometry = ArrayGeometry::new(Level::Raid1, minors.len() as u32);
        geometry.format = Some(format);
        geometry.clean = clean;
        handle.create(geometry).await.unwrap();
        for (slot, minor) in minors.iter().enumerate() {
            handle.add_device(DiskSpec::new(id(*minor)).slot(slot as u32)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_and_run() {
        let table = mem_table(&[0, 16], 4096);
        let registry = registry(table);
        let handle = registry.open(0);
        create_raid1(&handle, &[0, 16], MetadataFormat::V1 { minor: 2 }, true).await;

        handle.run().await.unwrap();
        assert_eq!(handle.state(), ArrayState::Running);
        let meta = handle.meta();
        assert_eq!(meta.events, 1);
        assert_eq!(meta.recovery_cp, MAX_SECTOR);
        // 1.2 keeps the first 16 sectors for the superblock area
        assert_eq!(meta.dev_sectors, 4080);
        assert!(handle.recovery_flags().contains(RecoveryFlags::NEEDED));
        assert!(matches!(handle.run().await, Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_geometry() {
        let registry = registry(mem_table(&[0], 4096));
        let handle = registry.open(0);

        let mut geometry = ArrayGeometry::new(Level::Raid5, 3);
        geometry.chunk_sectors = 3;
        assert!(handle.create(geometry).await.is_err());

        let mut geometry = ArrayGeometry::new(Level::Raid1, 28);
        geometry.format = Some(MetadataFormat::V090);
        assert!(handle.create(geometry).await.is_err());

        handle.create(ArrayGeometry::new(Level::Raid1, 2)).await.unwrap();
        assert!(handle.create(ArrayGeometry::new(Level::Raid1, 2)).await.is_err());
    }

    #[tokio::test]
    async fn test_run_without_personality() {
        let registry = registry(mem_table(&[0, 16], 4096));
        let handle = registry.open(0);
        let mut geometry = ArrayGeometry::new(Level::Raid5, 2);
        geometry.chunk_sectors = 128;
        handle.create(geometry).await.unwrap();
        handle.add_device(DiskSpec::new(id(0)).slot(0)).await.unwrap();
        handle.add_device(DiskSpec::new(id(16)).slot(1)).await.unwrap();

        let err = handle.run().await.unwrap_err();
        assert!(matches!(err, Error::NoPersonality { .. }));
        assert_eq!(handle.state(), ArrayState::Inactive);
    }

    #[tokio::test]
    async fn test_creating_rejects_taken_slot() {
        let registry = registry(mem_table(&[0, 16], 4096));
        let handle = registry.open(0);
        handle.create(ArrayGeometry::new(Level::Raid1, 2)).await.unwrap();
        handle.add_device(DiskSpec::new(id(0)).slot(0)).await.unwrap();
        assert!(handle.add_device(DiskSpec::new(id(16)).slot(0)).await.is_err());
        assert!(handle.add_device(DiskSpec::new(id(16)).slot(2)).await.is_err());
        // the failed attempts released the device again
        assert!(registry.devices().holder(id(16)).is_none());
    }

    #[tokio::test]
    async fn test_stop_and_reassemble() {
        let table = mem_table(&[0, 16], 4096);
        let registry = registry(table);
        {
            let handle = registry.open(0);
            create_raid1(&handle, &[0, 16], MetadataFormat::V090, true).await;
            handle.run().await.unwrap();
            handle.stop(StopMode::Full).await.unwrap();
            assert_eq!(handle.state(), ArrayState::Inactive);
            assert_eq!(handle.member_count(), 0);
        }
        assert!(registry.get(0).is_none());
        assert!(registry.devices().holder(id(0)).is_none());

        let handle = registry.open(1);
        handle.set_format(MetadataFormat::V090).await.unwrap();
        handle.add_device(DiskSpec::new(id(16))).await.unwrap();
        handle.add_device(DiskSpec::new(id(0))).await.unwrap();
        handle.run().await.unwrap();

        let meta = handle.meta();
        assert_eq!(meta.raid_disks, 2);
        assert_eq!(meta.preferred_minor, 0);
        assert!(meta.events >= 1);
        let inner = handle.inner.lock();
        assert!(inner.members.iter().all(|m| m.is_in_sync()));
    }

    #[tokio::test]
    async fn test_stop_busy_with_other_openers() {
        let registry = registry(mem_table(&[0, 16], 4096));
        let handle = registry.open(0);
        create_raid1(&handle, &[0, 16], MetadataFormat::V1 { minor: 2 }, true).await;
        handle.run().await.unwrap();

        let other = registry.open(0);
        assert!(matches!(handle.stop(StopMode::Full).await, Err(Error::ArrayBusy(_))));
        drop(other);

        handle.stop(StopMode::ReadOnly).await.unwrap();
        assert_eq!(handle.state(), ArrayState::ReadOnly);
        assert!(handle.stop(StopMode::ReadOnly).await.is_err());
        assert!(matches!(handle.write_start().await, Err(Error::ReadOnly(_))));

        handle.set_read_write().await.unwrap();
        assert_eq!(handle.state(), ArrayState::Running);
    }

    #[tokio::test]
    async fn test_read_only_switch_reports_failed_commit() {
        let registry = registry(mem_table(&[0, 16], 4096));
        let handle = registry.open(0);
        create_raid1(&handle, &[0, 16], MetadataFormat::V1 { minor: 2 }, true).await;
        handle.run().await.unwrap();
        {
            let mut inner = handle.inner.lock();
            inner.meta.in_sync = false;
            inner.meta.events = u64::MAX;
        }

        let err = handle.stop(StopMode::ReadOnly).await.unwrap_err();
        assert!(matches!(err, Error::EventOverflow(_)));
        assert_eq!(handle.state(), ArrayState::Running);
        assert!(!handle.meta().in_sync);
        assert!(handle.inner.lock().sb_dirty);
    }

    #[tokio::test]
    async fn test_assembly_rejects_foreign_member() {
        let registry = registry(mem_table(&[0, 16, 32, 48], 4096));
        for (unit, minors) in [(0u32, [0u32, 16]), (1, [32, 48])] {
            let handle = registry.open(unit);
            create_raid1(&handle, &minors, MetadataFormat::V1 { minor: 2 }, true).await;
            handle.run().await.unwrap();
            handle.stop(StopMode::Full).await.unwrap();
        }

        let handle = registry.open(5);
        handle.add_device(DiskSpec::new(id(0))).await.unwrap();
        let err = handle.add_device(DiskSpec::new(id(32))).await.unwrap_err();
        assert!(err.is_metadata());
        assert!(registry.devices().holder(id(32)).is_none());
    }

    /// Leave a stopped v0.90 raid1 on sda, sdb, sdc where sdc missed
    /// two updates
    async fn leave_stale_sdc(registry: &Arc<ArrayRegistry>) {
        let handle = registry.open(0);
        create_raid1(&handle, &[0, 16, 32], MetadataFormat::V090, true).await;
        handle.run().await.unwrap();

        {
            let mut inner = handle.inner.lock();
            inner.sb_dirty = true;
            handle.commit_locked(&mut inner).unwrap();
            let stale = inner.members.iter().position(|m| m.id() == id(32)).unwrap();
            inner.members[stale].faulty = true;
            inner.sb_dirty = true;
            handle.commit_locked(&mut inner).unwrap();
            handle.commit_locked(&mut inner).unwrap();
            inner.members[stale].faulty = false;
        }
        assert_eq!(handle.events(), 4);

        // drop everything without another commit
        let mut inner = handle.inner.lock();
        inner.personality = None;
        inner.members.clear();
        inner.meta = ArrayMeta::new(MetadataFormat::V090);
    }

    async fn add_all(handle: &Array, minors: &[u32]) {
        handle.set_format(MetadataFormat::V090).await.unwrap();
        for minor in minors {
            handle.add_device(DiskSpec::new(id(*minor))).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stale_member_kicked_on_assembly() {
        let registry = registry(mem_table(&[0, 16, 32], 4096));
        leave_stale_sdc(&registry).await;

        let handle = registry.open(1);
        add_all(&handle, &[32, 0, 16]).await;
        handle.run().await.unwrap();
        assert_eq!(handle.member_count(), 2);
        assert_eq!(handle.events(), 4);
        assert!(registry.devices().holder(id(32)).is_none());
    }

    #[tokio::test]
    async fn test_failed_run_leaves_members_untouched() {
        let registry = registry(mem_table(&[0, 16, 32], 4096));
        leave_stale_sdc(&registry).await;
        assert!(registry.personalities().unregister(Level::Raid1));

        let handle = registry.open(1);
        add_all(&handle, &[32, 0, 16]).await;
        fn roles(handle: &Array) -> Vec<(DeviceId, Option<u32>, Option<u32>, bool)> {
            let inner = handle.inner.lock();
            inner.members.iter().map(|m| (m.id(), m.desc_nr(), m.raid_disk(), m.is_in_sync())).collect()
        }
        let before = roles(&handle);

        let err = handle.run().await.unwrap_err();
        assert!(matches!(err, Error::NoPersonality { .. }));
        assert_eq!(handle.state(), ArrayState::Inactive);
        assert_eq!(handle.member_count(), 3);
        assert_eq!(handle.meta().raid_disks, 0);
        assert_eq!(registry.devices().holder(id(32)).as_deref(), Some("md1"));
        assert_eq!(roles(&handle), before);
        assert_eq!(before[0].0, id(32));

        // the same members start once the level is available again
        registry.personalities().register(Arc::new(crate::personality::Raid1Factory));
        handle.run().await.unwrap();
        assert_eq!(handle.member_count(), 2);
        assert_eq!(handle.events(), 4);
        assert!(registry.devices().holder(id(32)).is_none());
    }

    #[tokio::test]
    async fn test_hot_add_requires_running_rw_and_size() {
        let (table, _devices) = mem_devices(&[0, 16, 32], 4096);
        let small = crate::device::MemDisk::new(id(48), "sdd", 64);
        table.register(small).unwrap();
        let registry = registry(table);

        let handle = registry.open(0);
        create_raid1(&handle, &[0, 16], MetadataFormat::V1 { minor: 2 }, true).await;
        handle.run().await.unwrap();
        let before = handle.events();

        handle.add_device(DiskSpec::new(id(32))).await.unwrap();
        assert_eq!(handle.events(), before + 1);
        let info = handle.disk_info(id(32)).unwrap();
        assert_eq!(info.raid_disk, None);
        assert_eq!(info.desc_nr, Some(2));

        let err = handle.add_device(DiskSpec::new(id(48))).await.unwrap_err();
        assert!(matches!(err, Error::DeviceTooSmall { .. }));
        assert!(registry.devices().holder(id(48)).is_none());
    }

    #[tokio::test]
    async fn test_remove_device_rules() {
        let registry = registry(mem_table(&[0, 16, 32], 4096));
        let handle = registry.open(0);
        create_raid1(&handle, &[0, 16], MetadataFormat::V1 { minor: 2 }, true).await;
        handle.run().await.unwrap();
        handle.add_device(DiskSpec::new(id(32))).await.unwrap();

        assert!(matches!(handle.remove_device(id(0)).await, Err(Error::DeviceBusy { .. })));

        let pin = {
            let inner = handle.inner.lock();
            inner.members.iter().find(|m| m.id() == id(32)).unwrap().pin()
        };
        assert!(matches!(handle.remove_device(id(32)).await, Err(Error::DeviceBusy { .. })));
        drop(pin);

        let before = handle.events();
        handle.remove_device(id(32)).await.unwrap();
        assert_eq!(handle.events(), before + 1);
        assert!(registry.devices().holder(id(32)).is_none());
        assert!(matches!(handle.remove_device(id(32)).await, Err(Error::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_set_faulty_flags_recovery() {
        let registry = registry(mem_table(&[0, 16], 4096));
        let state = MockState::new(64);
        registry.personalities().register(Arc::new(MockFactory {
            level: Level::Raid1,
            state: Arc::clone(&state),
        }));
        let handle = registry.open(0);
        create_raid1(&handle, &[0, 16], MetadataFormat::V1 { minor: 2 }, true).await;
        handle.run().await.unwrap();
        handle.store_recovery(RecoveryFlags::empty());

        handle.set_faulty(id(16)).await.unwrap();
        let flags = handle.recovery_flags();
        assert!(flags.contains(RecoveryFlags::NEEDED));
        assert!(flags.contains(RecoveryFlags::INTR));
        assert!(handle.disk_info(id(16)).unwrap().state == crate::array::MemberState::Faulty);
        assert!(handle.inner.lock().sb_dirty);
        assert_eq!(state.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resize_rewinds_checkpoint() {
        let registry = registry(mem_table(&[0, 16], 8192));
        let handle = registry.open(0);
        let mut geometry = ArrayGeometry::new(Level::Raid1, 2);
        geometry.dev_sectors = 4096;
        geometry.clean = true;
        handle.create(geometry).await.unwrap();
        handle.add_device(DiskSpec::new(id(0)).slot(0)).await.unwrap();
        handle.add_device(DiskSpec::new(id(16)).slot(1)).await.unwrap();
        handle.run().await.unwrap();

        handle.resize(6000).await.unwrap();
        let meta = handle.meta();
        assert_eq!(meta.dev_sectors, 6000);
        assert_eq!(meta.recovery_cp, 4096);

        assert!(matches!(handle.resize(100_000).await, Err(Error::DeviceTooSmall { .. })));
        assert!(handle.reshape(1).await.is_err());
        handle.reshape(3).await.unwrap();
        assert_eq!(handle.meta().raid_disks, 3);
    }

    #[tokio::test]
    async fn test_request_sync_flags() {
        let registry = registry(mem_table(&[0, 16], 4096));
        let handle = registry.open(0);
        assert!(handle.request_sync(SyncAction::Check).await.is_err());

        create_raid1(&handle, &[0, 16], MetadataFormat::V1 { minor: 2 }, true).await;
        handle.run().await.unwrap();

        handle.request_sync(SyncAction::Frozen).await.unwrap();
        assert!(handle.recovery_flags().contains(RecoveryFlags::FROZEN));
        handle.request_sync(SyncAction::Check).await.unwrap();
        let flags = handle.recovery_flags();
        assert!(!flags.contains(RecoveryFlags::FROZEN));
        assert!(flags.contains(RecoveryFlags::CHECK | RecoveryFlags::REQUESTED | RecoveryFlags::NEEDED));

        handle.request_sync(SyncAction::Repair).await.unwrap();
        assert!(!handle.recovery_flags().contains(RecoveryFlags::CHECK));
        assert_eq!("thaw".parse::<SyncAction>().unwrap(), SyncAction::Thaw);
        assert!("sideways".parse::<SyncAction>().is_err());
    }

    #[tokio::test]
    async fn test_request_sync_waits_for_reconfiguration() {
        let registry = registry(mem_table(&[0, 16], 4096));
        let handle = registry.open(0);
        create_raid1(&handle, &[0, 16], MetadataFormat::V1 { minor: 2 }, true).await;
        handle.run().await.unwrap();

        let guard = handle.lock().await;
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            handle.request_sync(SyncAction::Frozen),
        )
        .await;
        assert!(pending.is_err());
        assert!(!handle.recovery_flags().contains(RecoveryFlags::FROZEN));
        drop(guard);

        handle.request_sync(SyncAction::Frozen).await.unwrap();
        assert!(handle.recovery_flags().contains(RecoveryFlags::FROZEN));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let registry = registry(mem_table(&[], 0));
        let handle = registry.open(0);
        let guard = handle.lock().await;
        assert!(matches!(handle.try_lock(), Err(Error::ArrayBusy(_))));
        drop(guard);
        assert!(handle.try_lock().is_ok());
    }
}
