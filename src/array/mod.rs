//! Arrays and their lifecycle
//!
//! An [`Array`] owns its member devices, its geometry and the
//! personality serving it. Structural changes are serialized by the
//! reconfiguration lock; the short critical sections touching array
//! state use an inner mutex that is never held across an await point.

mod autorun;
mod control;
mod registry;
mod status;

pub use autorun::{autorun, AutorunReport};
pub use control::{ArrayGeometry, DiskSpec, StopMode, SyncAction};
pub use registry::{ArrayHandle, ArrayRegistry, Tunables};
pub use status::{ArrayInfo, DiskInfo, MemberState};

pub(crate) use registry::RegistryShared;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::personality::{ArrayContext, Level, Personality};
use crate::rdev::Rdev;
use crate::resync::{
    checkpoint_after, start_position, PassSnapshot, RecoveryFlags, ResyncControl, ResyncGate, ResyncPhase,
    SyncKind, SyncOutcome,
};
use crate::superblock::{MetadataFormat, MAX_SECTOR};

/// Geometry and metadata state of an array
///
/// `raid_disks == 0` means the geometry has not been established yet;
/// the other fields are meaningless until it is.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMeta {
    pub format: MetadataFormat,
    /// Whether superblocks are written at all
    pub persistent: bool,
    pub uuid: Uuid,
    /// Set name (v1 only)
    pub name: String,
    pub level: Level,
    pub layout: u32,
    pub chunk_sectors: u32,
    pub raid_disks: u32,
    /// Used size of each member in sectors
    pub dev_sectors: u64,
    pub ctime: u64,
    pub utime: u64,
    pub events: u64,
    /// Resync checkpoint; `MAX_SECTOR` when in sync
    pub recovery_cp: u64,
    pub preferred_minor: u32,
    pub max_disks: u32,
    /// Clean flag: no writes in flight since the last commit
    pub in_sync: bool,
}

impl ArrayMeta {
    /// Empty geometry for the given format
    pub fn new(format: MetadataFormat) -> Self {
        ArrayMeta {
            format,
            persistent: true,
            uuid: Uuid::nil(),
            name: String::new(),
            level: Level::Linear,
            layout: 0,
            chunk_sectors: 0,
            raid_disks: 0,
            dev_sectors: 0,
            ctime: 0,
            utime: 0,
            events: 0,
            recovery_cp: 0,
            preferred_minor: 0,
            max_disks: format.max_disks(),
            in_sync: false,
        }
    }
}

/// Externally visible state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayState {
    Inactive,
    Running,
    ReadOnly,
}

impl fmt::Display for ArrayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayState::Inactive => write!(f, "inactive"),
            ArrayState::Running => write!(f, "active"),
            ArrayState::ReadOnly => write!(f, "active (read-only)"),
        }
    }
}

pub(crate) struct ArrayInner {
    pub(crate) meta: ArrayMeta,
    pub(crate) members: Vec<Rdev>,
    pub(crate) personality: Option<Arc<dyn Personality>>,
    pub(crate) read_only: bool,
    pub(crate) sb_dirty: bool,
    pub(crate) writes_pending: u32,
    pub(crate) last_write: Option<Instant>,
    pub(crate) sync_thread: Option<JoinHandle<SyncOutcome>>,
    pub(crate) sync_kind: Option<SyncKind>,
}

/// Held while changing the structure of an array
pub struct ReconfigGuard<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

/// One logical array
pub struct Array {
    unit: u32,
    name: String,
    seq: u64,
    reconfig: tokio::sync::Mutex<()>,
    pub(crate) inner: Mutex<ArrayInner>,
    recovery: AtomicU32,
    phase: AtomicU8,
    curr_resync: AtomicU64,
    speed_min: AtomicU64,
    speed_max: AtomicU64,
    control: ResyncControl,
    pub(crate) openers: AtomicUsize,
    sb_wait: Notify,
    pub(crate) shared: Arc<RegistryShared>,
}

impl Array {
    pub(crate) fn new(unit: u32, seq: u64, shared: Arc<RegistryShared>) -> Self {
        let mut meta = ArrayMeta::new(shared.default_format);
        meta.preferred_minor = unit;
        Array {
            unit,
            name: format!("md{}", unit),
            seq,
            reconfig: tokio::sync::Mutex::new(()),
            inner: Mutex::new(ArrayInner {
                meta,
                members: Vec::new(),
                personality: None,
                read_only: false,
                sb_dirty: false,
                writes_pending: 0,
                last_write: None,
                sync_thread: None,
                sync_kind: None,
            }),
            recovery: AtomicU32::new(0),
            phase: AtomicU8::new(ResyncPhase::Idle as u8),
            curr_resync: AtomicU64::new(0),
            speed_min: AtomicU64::new(0),
            speed_max: AtomicU64::new(0),
            control: ResyncControl::new(),
            openers: AtomicUsize::new(0),
            sb_wait: Notify::new(),
            shared,
        }
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    /// Name, e.g. `md0`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Take the reconfiguration lock, waiting for it
    pub async fn lock(&self) -> ReconfigGuard<'_> {
        ReconfigGuard {
            _guard: self.reconfig.lock().await,
        }
    }

    /// Take the reconfiguration lock or fail with [`Error::ArrayBusy`]
    pub fn try_lock(&self) -> Result<ReconfigGuard<'_>> {
        self.reconfig
            .try_lock()
            .map(|guard| ReconfigGuard { _guard: guard })
            .map_err(|_| Error::ArrayBusy(self.name.clone()))
    }

    pub fn state(&self) -> ArrayState {
        let inner = self.inner.lock();
        match (&inner.personality, inner.read_only) {
            (None, _) => ArrayState::Inactive,
            (Some(_), true) => ArrayState::ReadOnly,
            (Some(_), false) => ArrayState::Running,
        }
    }

    /// Copy of the current geometry
    pub fn meta(&self) -> ArrayMeta {
        self.inner.lock().meta.clone()
    }

    /// Current event counter
    pub fn events(&self) -> u64 {
        self.inner.lock().meta.events
    }

    /// Current resync checkpoint
    pub fn recovery_cp(&self) -> u64 {
        self.inner.lock().meta.recovery_cp
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn recovery_flags(&self) -> RecoveryFlags {
        RecoveryFlags::from_bits_truncate(self.recovery.load(Ordering::SeqCst))
    }

    pub(crate) fn set_recovery(&self, flags: RecoveryFlags) {
        self.recovery.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_recovery(&self, flags: RecoveryFlags) {
        self.recovery.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn store_recovery(&self, flags: RecoveryFlags) {
        self.recovery.store(flags.bits(), Ordering::SeqCst);
    }

    pub fn phase(&self) -> ResyncPhase {
        ResyncPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn set_phase(&self, phase: ResyncPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Position of the running pass
    pub fn curr_resync(&self) -> u64 {
        self.curr_resync.load(Ordering::SeqCst)
    }

    pub(crate) fn set_curr_resync(&self, position: u64) {
        self.curr_resync.store(position, Ordering::SeqCst);
    }

    pub(crate) fn control(&self) -> &ResyncControl {
        &self.control
    }

    pub(crate) fn gate(&self) -> &ResyncGate {
        &self.shared.gate
    }

    pub(crate) fn throttle_sleep(&self) -> Duration {
        self.shared.throttle_sleep
    }

    /// Override the global speed limits for this array; `None` reverts
    pub fn set_speed_limits(&self, min: Option<u64>, max: Option<u64>) {
        self.speed_min.store(min.unwrap_or(0), Ordering::Relaxed);
        self.speed_max.store(max.unwrap_or(0), Ordering::Relaxed);
    }

    /// Effective (min, max) speed limits in KiB/s
    pub fn speed_limits(&self) -> (u64, u64) {
        let pick = |local: &AtomicU64, global: u64| match local.load(Ordering::Relaxed) {
            0 => global,
            value => value,
        };
        (
            pick(&self.speed_min, self.shared.tunables.speed_limit_min()),
            pick(&self.speed_max, self.shared.tunables.speed_limit_max()),
        )
    }

    /// Nudge the recovery supervisor
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// Ask a running pass to stop at its next yield point
    pub fn interrupt_resync(&self) {
        self.set_recovery(RecoveryFlags::INTR);
        self.control.interrupt();
    }

    /// Nothing left that keeps the array alive
    pub(crate) fn is_disposable(&self) -> bool {
        let inner = self.inner.lock();
        inner.members.is_empty() && inner.personality.is_none()
    }

    /// Snapshot handed to personalities
    pub(crate) fn context_locked(&self, inner: &ArrayInner, kind: Option<SyncKind>) -> ArrayContext {
        ArrayContext {
            name: self.name.clone(),
            level: inner.meta.level,
            layout: inner.meta.layout,
            chunk_sectors: inner.meta.chunk_sectors,
            raid_disks: inner.meta.raid_disks,
            dev_sectors: inner.meta.dev_sectors,
            members: inner.members.iter().map(Rdev::info).collect(),
            sync_kind: kind,
        }
    }

    pub(crate) fn find_member(inner: &ArrayInner, id: DeviceId) -> Option<usize> {
        inner.members.iter().position(|m| m.id() == id)
    }

    /// Attach an imported device
    ///
    /// Assigns the lowest free descriptor slot unless the device already
    /// has one; a slot already taken is a conflict.
    pub(crate) fn bind_locked(&self, inner: &mut ArrayInner, mut rdev: Rdev) -> Result<()> {
        if Self::find_member(inner, rdev.id()).is_some() {
            return Err(Error::DeviceBusy {
                device: rdev.name().to_string(),
                holder: self.name.clone(),
            });
        }

        let taken = |nr: u32| inner.members.iter().any(|m| m.desc_nr == Some(nr));
        let desc_nr = match rdev.desc_nr {
            Some(nr) if taken(nr) => {
                return Err(Error::DeviceBusy {
                    device: rdev.name().to_string(),
                    holder: format!("{} slot {}", self.name, nr),
                })
            }
            Some(nr) => nr,
            None => {
                let mut choice = if inner.personality.is_some() {
                    inner.meta.raid_disks
                } else {
                    0
                };
                while taken(choice) {
                    choice += 1;
                }
                choice
            }
        };

        let max_disks = match inner.meta.max_disks {
            0 => inner.meta.format.max_disks(),
            max => max,
        };
        if desc_nr >= max_disks {
            return Err(Error::state(
                &self.name,
                format!("descriptor slot {} exceeds the {} slots of the superblock", desc_nr, max_disks),
            ));
        }

        rdev.desc_nr = Some(desc_nr);
        self.shared.devices.relabel(rdev.id(), &self.name);
        info!("md: bind<{}> to {}", rdev.name(), self.name);
        inner.members.push(rdev);
        Ok(())
    }

    /// Detach a member; dropping the returned device exports it
    pub(crate) fn unbind_locked(&self, inner: &mut ArrayInner, index: usize) -> Rdev {
        let rdev = inner.members.remove(index);
        info!("md: unbind<{}> from {}", rdev.name(), self.name);
        rdev
    }

    /// Mark a member faulty and let the personality know
    pub(crate) fn fail_member_locked(&self, inner: &mut ArrayInner, index: usize) {
        let Some(member) = inner.members.get_mut(index) else {
            return;
        };
        if member.faulty {
            return;
        }
        member.faulty = true;
        warn!("md: {}: disk failure on {}, disabling device", self.name, member.name());

        inner.sb_dirty = true;
        if let Some(personality) = inner.personality.clone() {
            let ctx = self.context_locked(inner, None);
            let info = inner.members[index].info();
            personality.error_handler(&ctx, &info);
        }
        self.set_recovery(RecoveryFlags::NEEDED);
        self.interrupt_resync();
        self.wake();
    }

    /// Write superblocks to every working member
    ///
    /// Each commit bumps the event counter by one. A member whose write
    /// fails is failed and the commit is repeated for the survivors.
    pub(crate) fn commit_locked(&self, inner: &mut ArrayInner) -> Result<()> {
        if !inner.meta.persistent {
            inner.sb_dirty = false;
            self.sb_wait.notify_waiters();
            return Ok(());
        }

        loop {
            let events = inner
                .meta
                .events
                .checked_add(1)
                .ok_or_else(|| Error::EventOverflow(self.name.clone()))?;
            inner.sb_dirty = false;
            inner.meta.events = events;
            inner.meta.utime = chrono::Utc::now().timestamp().max(0) as u64;

            let handler = inner.meta.format.super_type();
            for index in 0..inner.members.len() {
                handler.sync(&inner.meta, &mut inner.members, index)?;
            }

            let members = &inner.members;
            let failed = blocking_io(|| {
                let mut failed = Vec::new();
                for (index, member) in members.iter().enumerate() {
                    if member.faulty {
                        continue;
                    }
                    let Some(sb) = member.superblock() else { continue };
                    if let Err(e) = member.write_sb(&sb.encode()) {
                        warn!("md: {}: superblock write failed: {}", self.name, e);
                        failed.push(index);
                    }
                }
                failed
            });
            for index in &failed {
                self.fail_member_locked(inner, *index);
            }

            if failed.is_empty() && !inner.sb_dirty {
                break;
            }
        }

        tracing::debug!("md: {}: superblocks written, events {}", self.name, inner.meta.events);
        self.sb_wait.notify_waiters();
        Ok(())
    }

    /// Everything the worker needs to start a pass
    pub(crate) fn sync_snapshot(&self, kind: SyncKind) -> Option<PassSnapshot> {
        let inner = self.inner.lock();
        let personality = inner.personality.clone()?;
        let ctx = self.context_locked(&inner, Some(kind));
        let start = start_position(
            kind,
            inner.meta.recovery_cp,
            inner
                .members
                .iter()
                .filter(|m| m.is_recovering())
                .map(|m| m.recovery_offset),
        );
        Some(PassSnapshot {
            ctx,
            personality,
            start,
            max_sectors: inner.meta.dev_sectors,
        })
    }

    /// Persist progress of a running pass
    pub(crate) fn record_progress(&self, kind: SyncKind, position: u64) {
        let mut inner = self.inner.lock();
        let mut changed = false;
        if kind.moves_checkpoint() && position > inner.meta.recovery_cp {
            inner.meta.recovery_cp = position;
            changed = true;
        }
        if kind == SyncKind::Recovery {
            for member in inner.members.iter_mut().filter(|m| m.is_recovering()) {
                if member.recovery_offset < position {
                    member.recovery_offset = position;
                    changed = true;
                }
            }
        }
        if changed {
            inner.sb_dirty = true;
            drop(inner);
            info!("md: {}: {} checkpoint at sector {}", self.name, kind, position);
            self.wake();
        }
    }

    /// Apply the result of a pass and raise `DONE`
    pub(crate) fn finish_sync(&self, kind: SyncKind, outcome: SyncOutcome, reached: u64) {
        {
            let mut inner = self.inner.lock();
            let cp = checkpoint_after(kind, outcome, inner.meta.recovery_cp, reached);
            if cp != inner.meta.recovery_cp {
                inner.meta.recovery_cp = cp;
                inner.sb_dirty = true;
            }
            if kind == SyncKind::Recovery && outcome != SyncOutcome::Failed {
                let offset = if outcome == SyncOutcome::Completed {
                    MAX_SECTOR
                } else {
                    reached
                };
                let mut changed = false;
                for member in inner.members.iter_mut().filter(|m| m.is_recovering()) {
                    if member.recovery_offset < offset {
                        member.recovery_offset = offset;
                        changed = true;
                    }
                }
                inner.sb_dirty |= changed;
            }
        }

        let (phase, flags) = match outcome {
            SyncOutcome::Completed => {
                info!("md: {}: {} done.", self.name, kind);
                (ResyncPhase::Done, RecoveryFlags::DONE)
            }
            SyncOutcome::Interrupted => {
                info!("md: {}: {} interrupted at sector {}", self.name, kind, reached);
                (ResyncPhase::Interrupted, RecoveryFlags::DONE | RecoveryFlags::INTR)
            }
            SyncOutcome::Failed => {
                warn!("md: {}: {} aborted at sector {}", self.name, kind, reached);
                (ResyncPhase::Error, RecoveryFlags::DONE | RecoveryFlags::ERR)
            }
        };
        self.set_phase(phase);
        self.set_recovery(flags);
        self.wake();
    }

    /// Wait until no superblock update is pending
    pub(crate) async fn wait_committed(&self) {
        loop {
            let notified = self.sb_wait.notified();
            if !self.inner.lock().sb_dirty {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("name", &self.name)
            .field("seq", &self.seq)
            .field("state", &self.state())
            .field("recovery", &self.recovery_flags())
            .finish()
    }
}

/// Round a member size down to whole chunks
pub(crate) fn chunk_align(sectors: u64, chunk_sectors: u32) -> u64 {
    if chunk_sectors == 0 {
        sectors
    } else {
        sectors & !(u64::from(chunk_sectors) - 1)
    }
}

/// Run device I/O from async context without stalling a runtime worker
///
/// On a multi-threaded runtime the worker hands its other tasks off
/// first; elsewhere `io` simply runs in place.
fn blocking_io<T>(io: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(io),
        _ => io(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{import_all, mem_table, registry};

    #[test]
    fn test_chunk_align() {
        assert_eq!(chunk_align(1000, 0), 1000);
        assert_eq!(chunk_align(1000, 128), 896);
        assert_eq!(chunk_align(1024, 128), 1024);
    }

    #[tokio::test]
    async fn test_bind_assigns_lowest_free_slot() {
        let table = mem_table(&[0, 16, 32], 4096);
        let registry = registry(Arc::clone(&table));
        let handle = registry.open(0);

        let mut members = import_all(&table, &[0, 16, 32], None);
        members[0].desc_nr = Some(1);
        let mut inner = handle.inner.lock();
        for rdev in members.drain(..) {
            handle.bind_locked(&mut inner, rdev).unwrap();
        }
        let slots: Vec<_> = inner.members.iter().map(|m| m.desc_nr()).collect();
        assert_eq!(slots, vec![Some(1), Some(0), Some(2)]);
        assert_eq!(table.holder(DeviceId::new(8, 0)).as_deref(), Some("md0"));
    }

    #[tokio::test]
    async fn test_bind_rejects_pinned_duplicate_and_oversized_slot() {
        let table = mem_table(&[0, 16, 32], 4096);
        let registry = registry(Arc::clone(&table));
        let handle = registry.open(0);

        let mut members = import_all(&table, &[0, 16, 32], None);
        members[0].desc_nr = Some(3);
        members[1].desc_nr = Some(3);
        members[2].desc_nr = Some(5000);

        let mut inner = handle.inner.lock();
        let mut drain = members.drain(..);
        handle.bind_locked(&mut inner, drain.next().unwrap()).unwrap();
        let err = handle.bind_locked(&mut inner, drain.next().unwrap()).unwrap_err();
        assert!(matches!(err, Error::DeviceBusy { .. }));
        let err = handle.bind_locked(&mut inner, drain.next().unwrap()).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(inner.members.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_bumps_events_once_per_commit() {
        let table = mem_table(&[0, 16], 4096);
        let registry = registry(Arc::clone(&table));
        let handle = registry.open(0);

        let mut inner = handle.inner.lock();
        inner.meta = ArrayMeta::new(MetadataFormat::V1 { minor: 2 });
        inner.meta.level = Level::Raid1;
        inner.meta.raid_disks = 2;
        inner.meta.dev_sectors = 1024;
        inner.meta.uuid = Uuid::new_v4();
        for (i, mut rdev) in import_all(&table, &[0, 16], None).into_iter().enumerate() {
            inner.meta.format.super_type().prepare(&mut rdev).unwrap();
            rdev.raid_disk = Some(i as u32);
            rdev.in_sync = true;
            handle.bind_locked(&mut inner, rdev).unwrap();
        }

        for n in 1..=5u64 {
            handle.commit_locked(&mut inner).unwrap();
            assert_eq!(inner.meta.events, n);
            assert!(inner.members.iter().all(|m| m.events() == n));
        }

        inner.meta.events = u64::MAX;
        let err = handle.commit_locked(&mut inner).unwrap_err();
        assert!(matches!(err, Error::EventOverflow(_)));
        assert_eq!(inner.meta.events, u64::MAX);
        assert!(inner.members.iter().all(|m| m.events() == 5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commit_on_multi_thread_runtime() {
        let registry = registry(mem_table(&[0, 16], 4096));
        let handle = registry.open(0);
        let mut geometry = control::ArrayGeometry::new(Level::Raid1, 2);
        geometry.clean = true;
        handle.create(geometry).await.unwrap();
        handle.add_device(control::DiskSpec::new(DeviceId::new(8, 0)).slot(0)).await.unwrap();
        handle.add_device(control::DiskSpec::new(DeviceId::new(8, 16)).slot(1)).await.unwrap();
        handle.run().await.unwrap();

        let events = handle.events();
        assert!(events >= 1);
        let inner = handle.inner.lock();
        assert!(inner.members.iter().all(|m| m.events() == events));
    }
}
