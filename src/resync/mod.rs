//! Background resync and recovery
//!
//! One worker per array runs on a blocking task. It walks the array from
//! a start position to the end, asking the personality to synchronize
//! one unit at a time, throttles itself against the configured speed
//! limits and foreign I/O, and records how far it got when it stops.

pub mod gate;
pub mod throttle;

pub use gate::{GatePass, ResyncGate};
pub use throttle::{IdleTracker, SpeedMarks, SYNC_MARKS, SYNC_MARK_STEP, SYNC_WINDOW};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::array::Array;
use crate::superblock::MAX_SECTOR;

/// What a pass does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    /// Make redundancy consistent after an unclean shutdown
    Resync,
    /// Rebuild spares into their slots
    Recovery,
    /// Compare redundancy without correcting it
    Check,
    /// Compare and correct redundancy on request
    Repair,
}

impl SyncKind {
    /// Name used in logs
    pub fn describe(self) -> &'static str {
        match self {
            SyncKind::Resync => "resync",
            SyncKind::Recovery => "recovery",
            SyncKind::Check => "data-check",
            SyncKind::Repair => "requested-resync",
        }
    }

    /// Name used in status output
    pub fn action(self) -> &'static str {
        match self {
            SyncKind::Resync => "resync",
            SyncKind::Recovery => "recovery",
            SyncKind::Check => "check",
            SyncKind::Repair => "repair",
        }
    }

    /// Passes whose progress is the array's resync checkpoint
    pub fn moves_checkpoint(self) -> bool {
        matches!(self, SyncKind::Resync | SyncKind::Repair)
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

bitflags! {
    /// Per-array recovery state shared by control paths, the supervisor
    /// and the worker
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecoveryFlags: u32 {
        /// A worker exists
        const RUNNING = 1 << 0;
        /// Pass is a resync (not a recovery)
        const SYNC = 1 << 1;
        /// Pass is a recovery
        const RECOVER = 1 << 2;
        /// Worker was interrupted
        const INTR = 1 << 3;
        /// Worker finished
        const DONE = 1 << 4;
        /// Supervisor should look at the array
        const NEEDED = 1 << 5;
        /// Resync was asked for explicitly
        const REQUESTED = 1 << 6;
        /// Requested resync only compares
        const CHECK = 1 << 7;
        /// Worker failed
        const ERR = 1 << 8;
        /// No new passes may start
        const FROZEN = 1 << 9;
    }
}

/// Where the worker of an array is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ResyncPhase {
    Idle = 0,
    /// Waiting for a conflicting array to finish
    Checking = 1,
    Active = 2,
    Done = 3,
    Error = 4,
    Interrupted = 5,
}

impl ResyncPhase {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ResyncPhase::Checking,
            2 => ResyncPhase::Active,
            3 => ResyncPhase::Done,
            4 => ResyncPhase::Error,
            5 => ResyncPhase::Interrupted,
            _ => ResyncPhase::Idle,
        }
    }
}

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    Interrupted,
    Failed,
}

/// Cancellation token observed by the worker at every yield point
#[derive(Debug, Default)]
pub struct ResyncControl {
    interrupted: Mutex<bool>,
    cond: Condvar,
}

impl ResyncControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop at its next yield point
    pub fn interrupt(&self) {
        *self.interrupted.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupted.lock()
    }

    /// Clear a previous interrupt before a new pass
    pub fn reset(&self) {
        *self.interrupted.lock() = false;
    }

    /// Sleep up to `duration`; returns true if interrupted
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut interrupted = self.interrupted.lock();
        if !*interrupted {
            self.cond.wait_for(&mut interrupted, duration);
        }
        *interrupted
    }
}

/// Body of the per-array worker
///
/// Runs one pass of `kind`, applies its result to the array and raises
/// `DONE`. The gate is left before the supervisor is woken.
pub(crate) fn md_do_sync(array: Arc<Array>, kind: SyncKind) -> SyncOutcome {
    let (outcome, reached) = run_pass(&array, kind);
    array.finish_sync(kind, outcome, reached);
    outcome
}

fn run_pass(array: &Array, kind: SyncKind) -> (SyncOutcome, u64) {
    let name = array.name();
    let control = array.control();
    array.set_phase(ResyncPhase::Checking);

    let Some(pass) = array.sync_snapshot(kind) else {
        warn!("md: {}: array stopped before {} could start", name, kind);
        return (SyncOutcome::Failed, 0);
    };
    let disks: HashSet<_> = pass.ctx.members.iter().map(|m| m.device.whole_disk()).collect();

    let _gate = match array.gate().enter(array.seq(), name, disks, control) {
        Ok(gate) => gate,
        Err(_) => return (SyncOutcome::Interrupted, pass.start),
    };
    array.set_phase(ResyncPhase::Active);

    let (speed_min, _) = array.speed_limits();
    info!("md: {} of RAID array {}", kind, name);
    info!("md: minimum _guaranteed_  speed: {} KB/sec/disk.", speed_min);
    info!(
        "md: using {}k window, over a total of {} blocks.",
        SYNC_WINDOW / 2,
        pass.max_sectors / 2
    );
    if pass.start > 0 {
        info!("md: resuming {} of {} from checkpoint {}", kind, name, pass.start);
    }

    let mut ctx = pass.ctx;
    let personality = pass.personality;
    let throttle_sleep = array.throttle_sleep();
    let mut marks = SpeedMarks::new(Instant::now(), pass.start);
    let mut idle = IdleTracker::new(ctx.members.iter().map(|m| Arc::clone(&m.device)));
    let mut curr = pass.start;
    let mut next_check = curr.saturating_add(SYNC_WINDOW);
    array.set_curr_resync(curr);

    while curr < pass.max_sectors {
        if control.is_interrupted() {
            return (SyncOutcome::Interrupted, curr);
        }

        let (speed_min, _) = array.speed_limits();
        let slow = marks.speed_kib(Instant::now(), curr) < speed_min;
        let done = personality.sync_request(&ctx, curr, slow);
        if done <= 0 {
            warn!("md: {}: {} failed at sector {} ({})", name, kind, curr, done);
            return (SyncOutcome::Failed, curr);
        }
        curr = curr.saturating_add(done as u64).min(pass.max_sectors);
        array.set_curr_resync(curr);

        if curr < next_check {
            continue;
        }
        next_check = curr.saturating_add(SYNC_WINDOW);

        let now = Instant::now();
        if marks.step_due(now) {
            marks.step(now, curr);
            array.record_progress(kind, curr);
            if let Some(fresh) = array.sync_snapshot(kind) {
                ctx = fresh.ctx;
            }
            debug!(
                "md: {}: {} at {}/{} ({}K/sec)",
                name,
                kind,
                curr,
                pass.max_sectors,
                marks.speed_kib(now, curr)
            );
        }

        loop {
            let (speed_min, speed_max) = array.speed_limits();
            let speed = marks.speed_kib(Instant::now(), curr);
            if speed <= speed_min {
                break;
            }
            if speed <= speed_max && idle.is_idle() {
                break;
            }
            if control.sleep(throttle_sleep) {
                return (SyncOutcome::Interrupted, curr);
            }
        }
    }

    (SyncOutcome::Completed, curr)
}

/// Where a pass starts and what it sees
pub(crate) struct PassSnapshot {
    pub ctx: crate::personality::ArrayContext,
    pub personality: Arc<dyn crate::personality::Personality>,
    pub start: u64,
    pub max_sectors: u64,
}

/// Start position of a pass
///
/// An unrequested resync resumes from the checkpoint, a recovery from
/// the least recovered member, everything else starts over.
pub(crate) fn start_position(kind: SyncKind, recovery_cp: u64, recovery_offsets: impl Iterator<Item = u64>) -> u64 {
    match kind {
        SyncKind::Resync => recovery_cp,
        SyncKind::Recovery => recovery_offsets.min().unwrap_or(0),
        SyncKind::Check | SyncKind::Repair => 0,
    }
}

/// Checkpoint after a pass ends at `reached`
pub(crate) fn checkpoint_after(kind: SyncKind, outcome: SyncOutcome, recovery_cp: u64, reached: u64) -> u64 {
    if !kind.moves_checkpoint() {
        return recovery_cp;
    }
    match outcome {
        SyncOutcome::Completed => MAX_SECTOR,
        SyncOutcome::Interrupted if reached > recovery_cp => reached,
        SyncOutcome::Interrupted | SyncOutcome::Failed => recovery_cp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_positions() {
        assert_eq!(start_position(SyncKind::Resync, 400, [].into_iter()), 400);
        assert_eq!(start_position(SyncKind::Recovery, 400, [90, 30, 70].into_iter()), 30);
        assert_eq!(start_position(SyncKind::Recovery, 400, [].into_iter()), 0);
        assert_eq!(start_position(SyncKind::Check, 400, [].into_iter()), 0);
        assert_eq!(start_position(SyncKind::Repair, MAX_SECTOR, [].into_iter()), 0);
    }

    #[test]
    fn test_checkpoint_rules() {
        use SyncOutcome::*;
        // errors never move it
        assert_eq!(checkpoint_after(SyncKind::Resync, Failed, 100, 900), 100);
        // interrupts only raise it
        assert_eq!(checkpoint_after(SyncKind::Resync, Interrupted, 100, 900), 900);
        assert_eq!(checkpoint_after(SyncKind::Resync, Interrupted, 500, 300), 500);
        // completion marks the array clean
        assert_eq!(checkpoint_after(SyncKind::Resync, Completed, 100, 1000), MAX_SECTOR);
        assert_eq!(checkpoint_after(SyncKind::Repair, Completed, 0, 1000), MAX_SECTOR);
        // check passes and recoveries leave it alone
        assert_eq!(checkpoint_after(SyncKind::Check, Completed, 100, 1000), 100);
        assert_eq!(checkpoint_after(SyncKind::Recovery, Completed, 100, 1000), 100);
    }

    #[test]
    fn test_control_sleep_interrupts() {
        let control = Arc::new(ResyncControl::new());
        assert!(!control.sleep(Duration::from_millis(1)));

        let sleeper = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || {
                let start = Instant::now();
                let interrupted = control.sleep(Duration::from_secs(30));
                (interrupted, start.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        control.interrupt();
        let (interrupted, elapsed) = sleeper.join().unwrap();
        assert!(interrupted);
        assert!(elapsed < Duration::from_secs(30));

        control.reset();
        assert!(!control.is_interrupted());
    }

    #[test]
    fn test_phase_from_u8() {
        for phase in [
            ResyncPhase::Idle,
            ResyncPhase::Checking,
            ResyncPhase::Active,
            ResyncPhase::Done,
            ResyncPhase::Error,
            ResyncPhase::Interrupted,
        ] {
            assert_eq!(ResyncPhase::from_u8(phase as u8), phase);
        }
    }
}
