//! Cross-array resync arbitration
//!
//! Arrays whose members share a physical disk must not resync at the
//! same time. Every resync registers here before doing any I/O; it may
//! start only when no conflicting array is active and no conflicting
//! array created earlier is still waiting.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::info;

use super::ResyncControl;
use crate::device::DeviceId;
use crate::error::{Error, Result};

/// How long a waiter sleeps before re-checking for an interrupt
const GATE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Participant {
    name: String,
    disks: HashSet<DeviceId>,
    active: bool,
}

/// Registry of arrays that want to resync or are resyncing
#[derive(Debug, Default)]
pub struct ResyncGate {
    participants: Mutex<HashMap<u64, Participant>>,
    cond: Condvar,
}

impl ResyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the array with creation sequence `seq` may resync
    ///
    /// Returns [`Error::Interrupted`] if `control` is interrupted while
    /// waiting. The returned pass releases the gate when dropped.
    pub fn enter(
        &self,
        seq: u64,
        name: &str,
        disks: HashSet<DeviceId>,
        control: &ResyncControl,
    ) -> Result<GatePass<'_>> {
        let mut participants = self.participants.lock();
        participants.insert(
            seq,
            Participant {
                name: name.to_string(),
                disks,
                active: false,
            },
        );

        let mut announced: Option<String> = None;
        loop {
            let blocker = {
                let me = &participants[&seq];
                participants
                    .iter()
                    .filter(|(other, _)| **other != seq)
                    .find(|(other, p)| (p.active || **other < seq) && !p.disks.is_disjoint(&me.disks))
                    .map(|(_, p)| p.name.clone())
            };

            let Some(blocker) = blocker else {
                if let Some(p) = participants.get_mut(&seq) {
                    p.active = true;
                }
                return Ok(GatePass { gate: self, seq });
            };

            if control.is_interrupted() {
                participants.remove(&seq);
                self.cond.notify_all();
                return Err(Error::Interrupted(name.to_string()));
            }

            if announced.as_deref() != Some(blocker.as_str()) {
                info!(
                    "md: delaying resync of {} until {} has finished (they share one or more physical units)",
                    name, blocker
                );
                announced = Some(blocker);
            }
            self.cond.wait_for(&mut participants, GATE_POLL);
        }
    }

    /// Whether the array with `seq` currently holds the gate
    pub fn is_active(&self, seq: u64) -> bool {
        self.participants
            .lock()
            .get(&seq)
            .map(|p| p.active)
            .unwrap_or(false)
    }

    /// Whether the array with `seq` is registered but not yet active
    pub fn is_waiting(&self, seq: u64) -> bool {
        self.participants
            .lock()
            .get(&seq)
            .map(|p| !p.active)
            .unwrap_or(false)
    }

    fn leave(&self, seq: u64) {
        self.participants.lock().remove(&seq);
        self.cond.notify_all();
    }
}

/// Permission to resync, held for the duration of a pass
#[derive(Debug)]
pub struct GatePass<'a> {
    gate: &'a ResyncGate,
    seq: u64,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.leave(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn disks(ids: &[u32]) -> HashSet<DeviceId> {
        ids.iter().map(|m| DeviceId::new(8, *m)).collect()
    }

    #[test]
    fn test_disjoint_arrays_run_together() {
        let gate = ResyncGate::new();
        let control = ResyncControl::new();
        let a = gate.enter(1, "md0", disks(&[0]), &control).unwrap();
        let b = gate.enter(2, "md1", disks(&[16]), &control).unwrap();
        assert!(gate.is_active(1));
        assert!(gate.is_active(2));
        drop(a);
        drop(b);
        assert!(!gate.is_active(1));
    }

    #[test]
    fn test_conflict_waits_for_active_array() {
        let gate = Arc::new(ResyncGate::new());
        let first = gate.enter(2, "md1", disks(&[0]), &ResyncControl::new()).unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                let control = ResyncControl::new();
                let start = Instant::now();
                let pass = gate.enter(1, "md0", disks(&[0, 16]), &control).unwrap();
                drop(pass);
                start.elapsed()
            })
        };

        while !gate.is_waiting(1) {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(gate.is_waiting(1));
        drop(first);

        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(50));
    }

    #[test]
    fn test_earlier_waiter_wins_tie_break() {
        let gate = ResyncGate::new();
        let control = ResyncControl::new();
        // seq 1 registered as waiting, seq 3 must yield to it
        gate.participants.lock().insert(
            1,
            Participant {
                name: "md0".into(),
                disks: disks(&[0]),
                active: false,
            },
        );

        control.interrupt();
        let err = gate.enter(3, "md2", disks(&[0]), &control).unwrap_err();
        assert!(matches!(err, Error::Interrupted(_)));
        assert!(!gate.is_waiting(3));

        // the earlier waiter itself is not blocked by later ones
        gate.participants.lock().remove(&1);
        let later = ResyncGate::new();
        later.participants.lock().insert(
            5,
            Participant {
                name: "md4".into(),
                disks: disks(&[0]),
                active: false,
            },
        );
        let pass = later.enter(1, "md0", disks(&[0]), &ResyncControl::new()).unwrap();
        assert!(later.is_active(1));
        drop(pass);
    }

    #[test]
    fn test_interrupt_wakes_waiter() {
        let gate = Arc::new(ResyncGate::new());
        let _active = gate.enter(1, "md0", disks(&[0]), &ResyncControl::new()).unwrap();
        let control = Arc::new(ResyncControl::new());

        let waiter = {
            let gate = Arc::clone(&gate);
            let control = Arc::clone(&control);
            std::thread::spawn(move || gate.enter(2, "md1", disks(&[0]), &control).map(|_| ()))
        };
        while !gate.is_waiting(2) {
            std::thread::sleep(Duration::from_millis(1));
        }
        control.interrupt();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted(_))));
    }
}
