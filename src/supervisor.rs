//! Recovery supervisor
//!
//! A single async task that looks at every array on a fixed interval,
//! or sooner when something asks for attention. It commits pending
//! superblock updates, reaps finished workers, moves spares into
//! failed slots and starts resync or recovery passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::array::{Array, ArrayInner, ArrayRegistry};
use crate::resync::{md_do_sync, RecoveryFlags, ResyncPhase, SyncKind};
use crate::superblock::MAX_SECTOR;

/// Drives recovery for all arrays of a registry
pub struct RecoverySupervisor {
    registry: Arc<ArrayRegistry>,
    interval: Duration,
    shutdown: Arc<RwLock<bool>>,
}

/// Stops a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    registry: Arc<ArrayRegistry>,
    shutdown: Arc<RwLock<bool>>,
}

impl SupervisorHandle {
    /// Ask the supervisor loop to exit after the current sweep
    pub async fn stop(&self) {
        info!("Requesting recovery supervisor shutdown");
        *self.shutdown.write().await = true;
        self.registry.wake_supervisor();
    }
}

impl RecoverySupervisor {
    pub(crate) fn new(registry: Arc<ArrayRegistry>, interval: Duration) -> Self {
        RecoverySupervisor {
            registry,
            interval,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Handle to stop the loop started by [`RecoverySupervisor::start`]
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Run until stopped
    ///
    /// Spawn this on the runtime; it returns once the handle's `stop`
    /// has been called.
    pub async fn start(self) {
        info!("Starting recovery supervisor (interval: {:?})", self.interval);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.shutdown.read().await {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.registry.shared().wake.notified() => {}
            }
            if *self.shutdown.read().await {
                break;
            }
            self.sweep().await;
        }
        info!("Recovery supervisor stopped");
    }

    /// Look at every array once
    pub async fn sweep(&self) {
        for array in self.registry.arrays() {
            check_recovery(&array).await;
        }
    }
}

/// Array went idle long enough after its last write to be marked clean
fn safemode_due(inner: &ArrayInner, delay: Duration) -> bool {
    !inner.meta.in_sync
        && inner.writes_pending == 0
        && inner.last_write.map_or(true, |at| at.elapsed() >= delay)
}

/// Bring one array's recovery state forward
///
/// Skips arrays that are not running read-write, have nothing pending,
/// or are locked by a control operation.
pub async fn check_recovery(array: &Arc<Array>) {
    let delay = array.shared.safemode_delay;
    {
        let inner = array.inner.lock();
        if inner.personality.is_none() || inner.read_only {
            return;
        }
        let flags = array.recovery_flags();
        let pending = inner.sb_dirty
            || safemode_due(&inner, delay)
            || flags.intersects(RecoveryFlags::NEEDED | RecoveryFlags::DONE);
        if !pending {
            return;
        }
    }
    let Ok(_guard) = array.try_lock() else {
        debug!("md: {}: busy, skipping recovery check", array.name());
        return;
    };

    {
        let mut inner = array.inner.lock();
        if inner.personality.is_none() || inner.read_only {
            return;
        }
        if safemode_due(&inner, delay) {
            inner.meta.in_sync = true;
            inner.sb_dirty = true;
            debug!("md: {}: marked clean", array.name());
        }
        if inner.sb_dirty {
            if let Err(e) = array.commit_locked(&mut inner) {
                warn!("md: {}: superblock update failed: {}", array.name(), e);
            }
        }
    }

    let flags = array.recovery_flags();
    if flags.contains(RecoveryFlags::RUNNING) {
        if !flags.contains(RecoveryFlags::DONE) {
            array.clear_recovery(RecoveryFlags::NEEDED);
            return;
        }
        reap(array).await;
    }

    let frozen = array.recovery_flags().contains(RecoveryFlags::FROZEN);
    array.clear_recovery(RecoveryFlags::NEEDED | RecoveryFlags::INTR | RecoveryFlags::ERR | RecoveryFlags::DONE);
    if frozen {
        return;
    }

    let mut inner = array.inner.lock();
    let Some(personality) = inner.personality.clone() else {
        return;
    };

    let mut changed = false;
    for index in 0..inner.members.len() {
        let member = &inner.members[index];
        let Some(slot) = member.raid_disk() else { continue };
        if !member.is_faulty() || member.pending_io() > 0 {
            continue;
        }
        let ctx = array.context_locked(&inner, None);
        match personality.hot_remove_disk(&ctx, slot) {
            Ok(()) => {
                let member = &mut inner.members[index];
                info!("md: {}: released slot {} of faulty {}", array.name(), slot, member.name());
                member.raid_disk = None;
                member.in_sync = false;
                changed = true;
            }
            Err(e) => warn!("md: {}: cannot release slot {}: {}", array.name(), slot, e),
        }
    }

    if personality.supports_hot_disks() {
        for index in 0..inner.members.len() {
            if !inner.members[index].is_spare() {
                continue;
            }
            let ctx = array.context_locked(&inner, None);
            if ctx.degraded() == 0 {
                break;
            }
            let info = inner.members[index].info();
            let Some(slot) = personality.hot_add_disk(&ctx, &info) else {
                break;
            };
            let member = &mut inner.members[index];
            info!("md: {}: recovery will use {} for slot {}", array.name(), member.name(), slot);
            member.raid_disk = Some(slot);
            member.in_sync = false;
            member.recovery_offset = 0;
            changed = true;
        }
    }

    if changed {
        inner.sb_dirty = true;
        if let Err(e) = array.commit_locked(&mut inner) {
            warn!("md: {}: superblock update failed: {}", array.name(), e);
        }
    }

    let flags = array.recovery_flags();
    let recovering = inner.members.iter().any(|m| m.is_recovering());
    let kind = if recovering {
        SyncKind::Recovery
    } else if flags.contains(RecoveryFlags::REQUESTED) {
        if flags.contains(RecoveryFlags::CHECK) {
            SyncKind::Check
        } else {
            SyncKind::Repair
        }
    } else if inner.meta.recovery_cp < MAX_SECTOR {
        SyncKind::Resync
    } else {
        return;
    };
    if !personality.supports_resync() {
        debug!("md: {}: {} has no resync support", array.name(), personality.name());
        return;
    }

    let kind_flag = match kind {
        SyncKind::Recovery => RecoveryFlags::RECOVER,
        _ => RecoveryFlags::SYNC,
    };
    array.control().reset();
    array.set_phase(ResyncPhase::Checking);
    array.set_recovery(RecoveryFlags::RUNNING | kind_flag);
    inner.sync_kind = Some(kind);
    let worker = Arc::clone(array);
    inner.sync_thread = Some(tokio::task::spawn_blocking(move || md_do_sync(worker, kind)));
    debug!("md: {}: started {} worker", array.name(), kind);
}

/// Collect a finished worker and activate what it rebuilt
async fn reap(array: &Arc<Array>) {
    let handle = array.inner.lock().sync_thread.take();
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            warn!("md: {}: resync worker failed: {}", array.name(), e);
        }
    }

    let flags = array.recovery_flags();
    let mut inner = array.inner.lock();
    if !flags.intersects(RecoveryFlags::ERR | RecoveryFlags::INTR) {
        if let Some(personality) = inner.personality.clone() {
            let ctx = array.context_locked(&inner, None);
            for slot in personality.spare_active(&ctx) {
                if let Some(member) = inner
                    .members
                    .iter_mut()
                    .find(|m| m.raid_disk == Some(slot) && !m.faulty)
                {
                    member.in_sync = true;
                    member.recovery_offset = MAX_SECTOR;
                    info!("md: {}: {} is now in sync in slot {}", array.name(), member.name(), slot);
                }
                inner.sb_dirty = true;
            }
        }
    }
    inner.sync_kind = None;
    if inner.sb_dirty {
        if let Err(e) = array.commit_locked(&mut inner) {
            warn!("md: {}: superblock update failed: {}", array.name(), e);
        }
    }
    drop(inner);

    let frozen = array.recovery_flags() & RecoveryFlags::FROZEN;
    array.store_recovery(RecoveryFlags::NEEDED | frozen);
}
