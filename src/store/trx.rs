//! Transaction manager: proc-array snapshots and the CSN counter.
//!
//! A transaction's snapshot is the CSN counter value at begin, published into
//! a fixed proc array so the recycler can compute the oldest snapshot any
//! live transaction might use. The array carries a version counter bumped
//! around every publish; scanners re-read it to detect torn scans.
//!
//! The `trx_info` word in tuple heads and index values is either a committed
//! CSN (`>= MIN_CSN`, top bit set) or a transaction-slot pointer (top bit
//! clear); the two spaces are disjoint by construction.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::Backoff;

use crate::store::constants::*;

/// `v` names a committed CSN.
pub fn trx_info_is_csn(v: u64) -> bool {
    v >= MIN_CSN
}

/// `v` names a transaction slot.
pub fn trx_info_is_slot(v: u64) -> bool {
    v < INVALID_CSN
}

/// `v` is a CSN a committed transaction could carry.
pub fn is_valid_csn(v: u64) -> bool {
    v >= MIN_CSN
}

/// Assemble a transaction-slot pointer.
pub fn make_slot_ptr(segment: u16, slot: u64) -> u64 {
    debug_assert_eq!(slot >> PTR_OFFSET_BITS, 0);
    ((segment as u64) << PTR_OFFSET_BITS) | slot
}

/// Segment id of a slot pointer.
pub fn slot_ptr_segment(ptr: u64) -> u16 {
    (ptr >> PTR_OFFSET_BITS) as u16
}

/// Slot id of a slot pointer.
pub fn slot_ptr_slot(ptr: u64) -> u64 {
    ptr & PTR_OFFSET_MASK
}

/// Visibility arbitration outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmResult {
    /// The version is visible to the snapshot.
    Ok,
    /// Committed after the snapshot.
    Invisible,
    /// Written by the asking transaction itself.
    SelfUpdated,
    /// Another in-progress transaction owns the version.
    BeingModified,
    /// The writing transaction aborted.
    Aborted,
}

/// Snapshot a session with no open transaction publishes.
const IDLE_SNAPSHOT: u64 = u64::MAX;

struct ProcSlot {
    in_use: AtomicBool,
    snapshot: AtomicU64,
}

/// The proc array plus the global CSN counter.
pub struct TrxManager {
    csn: AtomicU64,
    slots: Box<[ProcSlot]>,
    version: AtomicU64,
    reg_lock: AtomicU32,
    next_idx: AtomicU32,
    min_snapshot: AtomicU64,
}

impl TrxManager {
    pub fn new() -> TrxManager {
        TrxManager {
            csn: AtomicU64::new(MIN_CSN),
            slots: (0..PROC_ARRAY_SIZE)
                .map(|_| ProcSlot {
                    in_use: AtomicBool::new(false),
                    snapshot: AtomicU64::new(IDLE_SNAPSHOT),
                })
                .collect(),
            version: AtomicU64::new(0),
            reg_lock: AtomicU32::new(0),
            next_idx: AtomicU32::new(0),
            min_snapshot: AtomicU64::new(MIN_CSN),
        }
    }

    fn lock_registry(&self) {
        let backoff = Backoff::new();
        while self
            .reg_lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }

    fn unlock_registry(&self) {
        self.reg_lock.store(0, Ordering::Release);
    }

    /// Claim a proc-array slot for a session.
    pub fn register(&self) -> usize {
        self.lock_registry();
        let idx = loop {
            let i = self.next_idx.fetch_add(1, Ordering::Relaxed) as usize % PROC_ARRAY_SIZE;
            if !self.slots[i].in_use.load(Ordering::Relaxed) {
                break i;
            }
        };
        self.slots[idx].in_use.store(true, Ordering::Relaxed);
        self.slots[idx]
            .snapshot
            .store(IDLE_SNAPSHOT, Ordering::Relaxed);
        self.unlock_registry();
        idx
    }

    pub fn deregister(&self, idx: usize) {
        self.lock_registry();
        debug_assert!(self.slots[idx].in_use.load(Ordering::Relaxed));
        self.slots[idx].snapshot.store(IDLE_SNAPSHOT, Ordering::Relaxed);
        self.slots[idx].in_use.store(false, Ordering::Relaxed);
        self.unlock_registry();
    }

    /// Publish the current CSN counter as slot `idx`'s snapshot and return it.
    pub fn install_snapshot(&self, idx: usize) -> u64 {
        self.version.fetch_add(1, Ordering::Relaxed);
        let snap = self.csn.load(Ordering::Acquire);
        self.slots[idx].snapshot.store(snap, Ordering::Release);
        self.version.fetch_add(1, Ordering::Release);
        snap
    }

    /// Clear slot `idx`'s published snapshot at commit/abort.
    pub fn uninstall_snapshot(&self, idx: usize) {
        self.version.fetch_add(1, Ordering::Relaxed);
        self.slots[idx]
            .snapshot
            .store(IDLE_SNAPSHOT, Ordering::Release);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// CSN the next committer will take.
    pub fn current_csn(&self) -> u64 {
        self.csn.load(Ordering::Acquire)
    }

    /// Advance the counter after stamping a trx slot; commit order is the
    /// order of these increments.
    pub fn advance_csn(&self) -> u64 {
        self.csn.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Restart: resume the counter past the largest committed CSN found.
    pub fn recover_csn(&self, max_committed: u64) {
        debug_assert!(is_valid_csn(max_committed));
        self.csn.store(max_committed + 1, Ordering::Release);
    }

    /// Last published engine-wide snapshot lower bound.
    pub fn min_snapshot(&self) -> u64 {
        self.min_snapshot.load(Ordering::Acquire)
    }

    /// Scan the proc array for the oldest live snapshot, retrying torn scans
    /// via the version counter. The result is monotonic and republished for
    /// [`Self::min_snapshot`] readers.
    pub fn compute_min_snapshot(&self) -> u64 {
        let mut retries = 0u32;
        loop {
            let v_before = self.version.load(Ordering::Acquire);
            let mut min = self.csn.load(Ordering::Acquire);
            for slot in self.slots.iter() {
                let snap = slot.snapshot.load(Ordering::Relaxed);
                if snap < min {
                    min = snap;
                }
            }
            std::sync::atomic::fence(Ordering::AcqRel);
            let v_after = self.version.load(Ordering::Relaxed);
            if v_before == v_after && v_before % 2 == 0 {
                let prev = self.min_snapshot.load(Ordering::Relaxed);
                debug_assert!(min >= prev);
                if min > prev {
                    self.min_snapshot.store(min, Ordering::Release);
                }
                return min;
            }
            retries += 1;
            if retries % 3 == 0 {
                std::thread::sleep(std::time::Duration::from_micros(100));
            }
        }
    }
}

impl Default for TrxManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trx_info_spaces() {
        assert!(trx_info_is_csn(MIN_CSN));
        assert!(!trx_info_is_csn(INVALID_CSN));
        assert!(trx_info_is_slot(make_slot_ptr(31, 12345)));
        assert!(!trx_info_is_slot(MIN_CSN));
        // INVALID_CSN is neither.
        assert!(!trx_info_is_slot(INVALID_CSN));
    }

    #[test]
    fn test_slot_ptr_roundtrip() {
        let p = make_slot_ptr(7, 0xABC_DEF0);
        assert_eq!(slot_ptr_segment(p), 7);
        assert_eq!(slot_ptr_slot(p), 0xABC_DEF0);
    }

    #[test]
    fn test_csn_counter() {
        let tm = TrxManager::new();
        assert_eq!(tm.current_csn(), MIN_CSN);
        tm.advance_csn();
        assert_eq!(tm.current_csn(), MIN_CSN + 1);
        tm.recover_csn(MIN_CSN + 100);
        assert_eq!(tm.current_csn(), MIN_CSN + 101);
    }

    #[test]
    fn test_min_snapshot_tracks_active_transactions() {
        let tm = TrxManager::new();
        // Nothing active: the horizon is the counter itself.
        assert_eq!(tm.compute_min_snapshot(), MIN_CSN);

        let idx = tm.register();
        let snap = tm.install_snapshot(idx);
        tm.advance_csn();
        tm.advance_csn();
        assert_eq!(tm.compute_min_snapshot(), snap);

        tm.uninstall_snapshot(idx);
        assert_eq!(tm.compute_min_snapshot(), tm.current_csn());
        tm.deregister(idx);
    }

    #[test]
    fn test_register_unique_slots() {
        let tm = TrxManager::new();
        let a = tm.register();
        let b = tm.register();
        assert_ne!(a, b);
        tm.deregister(a);
        tm.deregister(b);
    }
}
