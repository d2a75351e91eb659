//! The slot table (§3 `Slot` entity, §4.2 "Slot assignment"/"Slot-table compaction"): a
//! supervisor-local view layered over the IPC region's occupancy bits, plus a local (non-shared)
//! map from slot index to owning worker pid.
//!
//! The pid map is deliberately *not* part of shared memory (§4.3): a worker that inherits a copy
//! of it via `fork()` must clear its own copy rather than trust it, since it reflects the
//! supervisor's bookkeeping at the instant of fork, not the worker's own identity.

use std::collections::HashMap;

use crate::ipc::{IpcRegion, MAX_SLOTS};

/// A reference to one claimed slot, handed to [`crate::app::JobSource`] hooks so they can log or
/// key off the slot index without reaching into supervisor internals.
pub struct SlotHandle {
    index: usize,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// The supervisor's view of the slot table: how many are configured, which are occupied, and
/// which pid owns each occupied one.
pub struct SlotTable {
    max_workers: usize,
    pids: HashMap<usize, libc::pid_t>,
}

impl SlotTable {
    pub fn new(max_workers: usize) -> Self {
        SlotTable {
            // Defense in depth: `SupervisorConfig::set_max_workers` already rejects anything
            // above `MAX_SLOTS` (§4.6), but this clamp keeps every scan over `max_workers` in
            // this table safe to index into the IPC region's fixed-size slot array even if that
            // validation is ever bypassed (e.g. a config built without going through the setter).
            max_workers: max_workers.min(MAX_SLOTS),
            pids: HashMap::new(),
        }
    }

    /// Applies a new `max_workers` ceiling (§4.6 `set_max_workers`, already validated non-zero
    /// and within [`MAX_SLOTS`] by the caller; clamped here too, for the same reason as
    /// [`Self::new`]). Shrinking does not evict occupied slots past the new limit; compaction is
    /// implicit and happens as those workers exit (§4.2).
    pub fn set_max_workers(&mut self, n: usize) {
        self.max_workers = n.min(MAX_SLOTS);
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Scans in index order for the first unoccupied slot within the current `max_workers`
    /// ceiling (itself always `<= MAX_SLOTS`, so this never indexes the IPC region's slot array
    /// out of bounds) and reserves it (IPC bit set, local pid recorded as 0 until fork returns).
    /// Returns `None` if every slot up to the ceiling is occupied (including because
    /// `max_workers` shrank below the number of currently busy slots).
    pub fn assign(&mut self, region: &IpcRegion) -> Option<SlotHandle> {
        for index in 0..self.max_workers {
            if !region.slot_occupied(index) {
                region.set_slot_occupied(index, true);
                self.pids.insert(index, 0);
                return Some(SlotHandle { index });
            }
        }
        None
    }

    /// Records the forked child's pid for an already-assigned slot.
    pub fn record_pid(&mut self, slot: &SlotHandle, pid: libc::pid_t) {
        self.pids.insert(slot.index(), pid);
    }

    /// Releases a slot: clears the IPC occupancy bit and drops the local pid entry. Called both
    /// when `get_next_job` comes back empty (the slot was never forked into) and after a worker
    /// is reaped.
    pub fn release(&mut self, region: &IpcRegion, index: usize) {
        region.set_slot_occupied(index, false);
        self.pids.remove(&index);
        self.compact(region);
    }

    /// Clears every slot this table thinks it owns, without touching the IPC occupancy bits.
    /// Used exactly once, by a freshly forked worker, to drop its copy of the supervisor's
    /// bookkeeping (§4.3) before running `child_run`.
    pub fn clear_local(&mut self) {
        self.pids.clear();
    }

    pub fn pid_for(&self, index: usize) -> Option<libc::pid_t> {
        self.pids.get(&index).copied().filter(|&pid| pid != 0)
    }

    pub fn occupied_pids(&self) -> impl Iterator<Item = libc::pid_t> + '_ {
        self.pids.values().copied().filter(|&pid| pid != 0)
    }

    /// True if any slot, at any index (including past the current `max_workers` ceiling), still
    /// has a forked worker outstanding. Used by the terminal "wait for all workers" phase (§4.2),
    /// which must keep blocking on over-ceiling workers a shrunk cap left draining.
    pub fn any_pids_outstanding(&self) -> bool {
        self.pids.values().any(|&pid| pid != 0)
    }

    /// Finds the slot index, if any, whose locally recorded pid is exactly `pid`. Used by reap
    /// to find which slot a just-exited worker owned; since only the single dispatcher thread
    /// ever touches this map, a found index can't have been concurrently reassigned out from
    /// under the caller (§4.2 reap policy).
    pub fn index_for_pid(&self, pid: libc::pid_t) -> Option<usize> {
        self.pids
            .iter()
            .find(|&(_, &owner)| owner == pid)
            .map(|(&index, _)| index)
    }

    /// Drops the local pid bookkeeping for `index` without touching the IPC occupancy bit. Used
    /// when a reaped worker had already released its own slot before exiting (§4.3 normal exit):
    /// the IPC side is already consistent, only the supervisor's local map is stale.
    pub fn clear_pid(&mut self, index: usize) {
        self.pids.remove(&index);
    }

    /// Trailing unoccupied entries beyond the current ceiling are dropped from the local map;
    /// occupied ones past the ceiling are left alone until their worker exits (§4.2).
    fn compact(&mut self, region: &IpcRegion) {
        self.pids
            .retain(|&index, _| index < self.max_workers || region.slot_occupied(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::DEFAULT_IPC_SIZE;
    use tempfile::tempdir;

    #[test]
    fn assign_picks_lowest_free_index() {
        let dir = tempdir().unwrap();
        let region = IpcRegion::create(&dir.path().join("slots-1.pid"), DEFAULT_IPC_SIZE).unwrap();
        let mut table = SlotTable::new(4);

        let first = table.assign(&region).unwrap();
        assert_eq!(first.index(), 0);
        let second = table.assign(&region).unwrap();
        assert_eq!(second.index(), 1);

        table.release(&region, first.index());
        let third = table.assign(&region).unwrap();
        assert_eq!(third.index(), 0);

        region.destroy();
    }

    #[test]
    fn assign_returns_none_once_ceiling_reached() {
        let dir = tempdir().unwrap();
        let region = IpcRegion::create(&dir.path().join("slots-2.pid"), DEFAULT_IPC_SIZE).unwrap();
        let mut table = SlotTable::new(1);
        assert!(table.assign(&region).is_some());
        assert!(table.assign(&region).is_none());
        region.destroy();
    }

    #[test]
    fn shrinking_ceiling_leaves_occupied_overflow_until_release() {
        let dir = tempdir().unwrap();
        let region = IpcRegion::create(&dir.path().join("slots-3.pid"), DEFAULT_IPC_SIZE).unwrap();
        let mut table = SlotTable::new(2);
        let a = table.assign(&region).unwrap();
        let _b = table.assign(&region).unwrap();

        table.set_max_workers(1);
        // Slot 1 is still occupied and tracked even though it's past the new ceiling.
        assert!(table.pid_for(1).is_none()); // pid not yet recorded (0 sentinel), but entry exists
        assert!(table.assign(&region).is_none());

        table.release(&region, a.index());
        let reassigned = table.assign(&region).unwrap();
        assert_eq!(reassigned.index(), 0);
        region.destroy();
    }

    #[test]
    fn ceiling_is_clamped_to_the_ipc_region_slot_capacity() {
        let dir = tempdir().unwrap();
        let region = IpcRegion::create(&dir.path().join("slots-4.pid"), DEFAULT_IPC_SIZE).unwrap();
        // An out-of-range ceiling (which `SupervisorConfig::set_max_workers` should already have
        // refused) must never make `assign` index the slot array out of bounds.
        let mut table = SlotTable::new(MAX_SLOTS + 1000);
        assert_eq!(table.max_workers(), MAX_SLOTS);
        table.set_max_workers(MAX_SLOTS + 1000);
        assert_eq!(table.max_workers(), MAX_SLOTS);
        region.destroy();
    }
}
