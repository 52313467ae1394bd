//! Resync speed measurement and idle detection

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::BlockDevice;

/// Number of progress marks kept for speed measurement
pub const SYNC_MARKS: usize = 10;

/// Time between progress marks
pub const SYNC_MARK_STEP: Duration = Duration::from_secs(3);

/// Sectors advanced between throttle checks
pub const SYNC_WINDOW: u64 = 256;

/// Foreign sectors tolerated between samples before disks count as busy
pub const IDLE_THRESHOLD: u64 = 4096;

/// Ring of (time, position) marks giving a trailing resync speed
#[derive(Debug, Clone)]
pub struct SpeedMarks {
    marks: [(Instant, u64); SYNC_MARKS],
    last: usize,
    step: Duration,
}

impl SpeedMarks {
    pub fn new(now: Instant, position: u64) -> Self {
        Self::with_step(now, position, SYNC_MARK_STEP)
    }

    pub fn with_step(now: Instant, position: u64, step: Duration) -> Self {
        SpeedMarks {
            marks: [(now, position); SYNC_MARKS],
            last: 0,
            step,
        }
    }

    /// Whether the newest mark is old enough to be replaced
    pub fn step_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.marks[self.last].0) >= self.step
    }

    /// Record a new mark, overwriting the oldest
    pub fn step(&mut self, now: Instant, position: u64) {
        let next = (self.last + 1) % SYNC_MARKS;
        self.marks[next] = (now, position);
        self.last = next;
    }

    /// Speed in KiB/s since the oldest mark; never zero
    pub fn speed_kib(&self, now: Instant, position: u64) -> u64 {
        let (at, mark) = self.marks[(self.last + 1) % SYNC_MARKS];
        let secs = now.saturating_duration_since(at).as_secs() + 1;
        position.saturating_sub(mark) / 2 / secs + 1
    }
}

/// Detects I/O on member disks that did not come from the resync
pub struct IdleTracker {
    disks: Vec<(Arc<dyn BlockDevice>, u64)>,
}

impl IdleTracker {
    /// Track the physical disks under `devices`, each disk once
    pub fn new(devices: impl IntoIterator<Item = Arc<dyn BlockDevice>>) -> Self {
        let mut seen = HashSet::new();
        let disks = devices
            .into_iter()
            .filter(|dev| seen.insert(dev.whole_disk()))
            .map(|dev| {
                let events = dev.stats().foreign_sectors();
                (dev, events)
            })
            .collect();
        IdleTracker { disks }
    }

    /// True unless some disk saw more than `IDLE_THRESHOLD` foreign
    /// sectors since it was last found busy
    pub fn is_idle(&mut self) -> bool {
        let mut idle = true;
        for (dev, last) in &mut self.disks {
            let curr = dev.stats().foreign_sectors();
            if curr.wrapping_sub(*last) > IDLE_THRESHOLD {
                *last = curr;
                idle = false;
            }
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, MemDisk};

    #[test]
    fn test_speed_over_oldest_mark() {
        let t0 = Instant::now();
        let marks = SpeedMarks::new(t0, 0);
        // 20000 sectors = 10000 KiB in 9 (+1) seconds
        assert_eq!(marks.speed_kib(t0 + Duration::from_secs(9), 20_000), 1001);
        assert_eq!(marks.speed_kib(t0, 0), 1);
    }

    #[test]
    fn test_marks_ring_forgets_old_progress() {
        let t0 = Instant::now();
        let mut marks = SpeedMarks::new(t0, 0);
        assert!(!marks.step_due(t0 + Duration::from_secs(1)));
        for i in 1..=SYNC_MARKS as u64 {
            let now = t0 + SYNC_MARK_STEP * i as u32;
            assert!(marks.step_due(now));
            marks.step(now, i * 6000);
        }
        // oldest surviving mark is the first step at 3 s, position 6000
        let now = t0 + SYNC_MARK_STEP * 10;
        let expected = (60_000 - 6000) / 2 / 28 + 1;
        assert_eq!(marks.speed_kib(now, 60_000), expected);
    }

    #[test]
    fn test_idle_tracker_ignores_sync_io() {
        let disk = MemDisk::raw(DeviceId::new(8, 0), 16);
        let p1 = disk.partition(DeviceId::new(8, 1), "sda1", 0, 8);
        let p2 = disk.partition(DeviceId::new(8, 2), "sda2", 8, 8);
        let mut tracker = IdleTracker::new(vec![p1 as Arc<dyn BlockDevice>, p2 as Arc<dyn BlockDevice>]);
        assert_eq!(tracker.disks.len(), 1);

        disk.stats().record_read(10_000);
        disk.stats().record_sync_io(10_000);
        assert!(tracker.is_idle());

        disk.stats().record_write(5000);
        assert!(!tracker.is_idle());
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_idle_tracker_accumulates_small_activity() {
        let dev = MemDisk::new(DeviceId::new(8, 16), "sdb", 16);
        let mut tracker = IdleTracker::new(vec![dev.clone() as Arc<dyn BlockDevice>]);
        dev.stats().record_read(3000);
        assert!(tracker.is_idle());
        dev.stats().record_read(3000);
        assert!(!tracker.is_idle());
    }
}
