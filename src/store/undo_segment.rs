//! Undo segments: transaction-slot rings and circular undo-record arenas.
//!
//! Each segment is a logical file whose first slice carries a fixed header
//! (arena cursors, slot-ring cursors, the recycle horizon) and the ring of
//! [`UNDO_TRX_SLOTS`] persistent transaction slots. Undo records are appended
//! to the byte arena that follows; a record may span a slice boundary.
//!
//! Slot ids grow without bound; only `slot_id % UNDO_TRX_SLOTS` is physically
//! present. `min_slot_id` is the public lower bound: a reader that resolves a
//! slot pointer re-checks it with acquire ordering, and anything below is a
//! transaction that committed long before any live snapshot. The recycler
//! advances `min_slot_id` strictly before reusing a slot, which makes that
//! check the linearization point of slot retirement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::store::config::DirSet;
use crate::store::constants::*;
use crate::store::logic_file::LogicFile;
use crate::store::trx::{is_valid_csn, make_slot_ptr, slot_ptr_segment, slot_ptr_slot};
use crate::util::mem::{atomic_u32_at, atomic_u64_at};
use crate::StoreError;

/// Persistent transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxStatus {
    Empty = 0,
    InProgress = 1,
    Committed = 2,
    Aborted = 3,
    RolledBack = 4,
}

impl TrxStatus {
    pub fn from_u32(v: u32) -> TrxStatus {
        match v {
            0 => TrxStatus::Empty,
            1 => TrxStatus::InProgress,
            2 => TrxStatus::Committed,
            3 => TrxStatus::Aborted,
            4 => TrxStatus::RolledBack,
            s => panic!("corrupt transaction slot status {}", s),
        }
    }
}

/// Snapshot of a slot's commit state.
#[derive(Debug, Clone, Copy)]
pub struct TrxInfo {
    pub status: TrxStatus,
    pub csn: u64,
}

/// First arena byte: the fixed header plus the slot ring.
const ARENA_START: u64 = (UNDO_HEAD_FIXED + UNDO_TRX_SLOTS * TRX_SLOT_SIZE) as u64;

/// How close the recycle cursor must trail the free cursor before the
/// recycle horizon is persisted as the segment's CSN floor.
const FLOOR_SLOT_MARGIN: u64 = 2;

pub struct UndoSegment {
    id: u16,
    file: LogicFile,
}

impl UndoSegment {
    pub fn new(dir: Arc<DirSet>, id: u16) -> UndoSegment {
        UndoSegment {
            id,
            file: LogicFile::new(dir, &format!("undo{}", id), UNDO_SLICE_LEN, UNDO_MAX_SLICES),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn create(&self) -> Result<(), StoreError> {
        self.file.create()?;
        // A fresh slice is zero-filled: every slot reads Empty. Only the
        // arena cursors need seeding.
        self.head_u64(UH_FREE_BEGIN).store(ARENA_START, Ordering::Relaxed);
        self.head_u64(UH_RECYCLED_BEGIN)
            .store(ARENA_START, Ordering::Relaxed);
        self.file.persist(0, UNDO_HEAD_FIXED);
        Ok(())
    }

    pub fn mount(&self) -> Result<(), StoreError> {
        self.file.mount()?;
        if self.head_u64(UH_FREE_BEGIN).load(Ordering::Relaxed) < ARENA_START {
            return Err(StoreError::Corrupt(format!(
                "undo segment {} header not initialized",
                self.id
            )));
        }
        Ok(())
    }

    pub fn unmount(&self) {
        self.file.unmount();
    }

    // ── Header field access ─────────────────────────────────────────

    fn head_u64(&self, off: usize) -> &AtomicU64 {
        unsafe { atomic_u64_at(self.file.offset_ptr(off as u64)) }
    }

    /// CSN floor left behind when the ring drains completely.
    pub fn min_snapshot_floor(&self) -> u64 {
        self.head_u64(UH_MIN_SNAPSHOT).load(Ordering::Relaxed)
    }

    // ── Slot ring ───────────────────────────────────────────────────

    fn next_free_slot(&self) -> u64 {
        self.head_u64(UH_NEXT_FREE_SLOT).load(Ordering::Relaxed)
    }

    fn next_recycle_slot(&self) -> u64 {
        self.head_u64(UH_NEXT_RECYCLE_SLOT).load(Ordering::Relaxed)
    }

    pub fn ring_full(&self) -> bool {
        self.next_free_slot() == self.next_recycle_slot() + UNDO_TRX_SLOTS as u64
    }

    pub fn ring_empty(&self) -> bool {
        self.next_free_slot() == self.next_recycle_slot()
    }

    fn slot_off(slot_id: u64) -> u64 {
        UNDO_HEAD_FIXED as u64 + (slot_id % UNDO_TRX_SLOTS as u64) * TRX_SLOT_SIZE as u64
    }

    fn slot_u64(&self, slot_id: u64, field: usize) -> &AtomicU64 {
        unsafe { atomic_u64_at(self.file.offset_ptr(Self::slot_off(slot_id) + field as u64)) }
    }

    fn slot_status(&self, slot_id: u64) -> &std::sync::atomic::AtomicU32 {
        unsafe { atomic_u32_at(self.file.offset_ptr(Self::slot_off(slot_id) + TS_STATUS as u64)) }
    }

    fn persist_slot(&self, slot_id: u64) {
        self.file.persist(Self::slot_off(slot_id), TRX_SLOT_SIZE);
    }

    /// Claim the next slot for a transaction. The caller must have checked
    /// `ring_full()`; the slot is stamped `InProgress` before the free cursor
    /// advances so the recycler never sees a half-claimed slot.
    pub fn alloc_slot(&self) -> u64 {
        assert!(!self.ring_full(), "undo segment {} slot ring full", self.id);
        let slot_id = self.next_free_slot();
        self.slot_u64(slot_id, TS_CSN).store(0, Ordering::Relaxed);
        self.slot_u64(slot_id, TS_START).store(0, Ordering::Relaxed);
        self.slot_u64(slot_id, TS_END).store(0, Ordering::Relaxed);
        self.slot_status(slot_id)
            .store(TrxStatus::InProgress as u32, Ordering::Release);
        self.persist_slot(slot_id);
        self.head_u64(UH_NEXT_FREE_SLOT)
            .store(slot_id + 1, Ordering::Release);
        self.file.persist(UH_NEXT_FREE_SLOT as u64, 8);
        slot_id
    }

    /// The slot pointer naming `slot_id` in this segment.
    pub fn slot_ptr(&self, slot_id: u64) -> u64 {
        make_slot_ptr(self.id, slot_id)
    }

    pub fn set_slot_csn(&self, slot_id: u64, csn: u64) {
        self.slot_u64(slot_id, TS_CSN).store(csn, Ordering::Release);
        self.persist_slot(slot_id);
    }

    pub fn set_slot_status(&self, slot_id: u64, status: TrxStatus) {
        self.slot_status(slot_id)
            .store(status as u32, Ordering::Release);
        self.persist_slot(slot_id);
    }

    pub fn slot_start(&self, slot_id: u64) -> u64 {
        self.slot_u64(slot_id, TS_START).load(Ordering::Relaxed)
    }

    pub fn set_slot_start(&self, slot_id: u64, ptr: u64) {
        self.slot_u64(slot_id, TS_START).store(ptr, Ordering::Relaxed);
        self.persist_slot(slot_id);
    }

    pub fn slot_end(&self, slot_id: u64) -> u64 {
        self.slot_u64(slot_id, TS_END).load(Ordering::Relaxed)
    }

    pub fn set_slot_end(&self, slot_id: u64, ptr: u64) {
        self.slot_u64(slot_id, TS_END).store(ptr, Ordering::Relaxed);
        self.persist_slot(slot_id);
    }

    /// Commit state of `slot_id`, or `None` when the slot is recycled (its
    /// transaction committed below every live snapshot).
    pub fn get_trx_info(&self, slot_id: u64) -> Option<TrxInfo> {
        loop {
            let csn = self.slot_u64(slot_id, TS_CSN).load(Ordering::Relaxed);
            let status =
                TrxStatus::from_u32(self.slot_status(slot_id).load(Ordering::Relaxed));
            if slot_id < self.head_u64(UH_MIN_SLOT_ID).load(Ordering::Acquire) {
                return None;
            }
            debug_assert!(status != TrxStatus::Empty, "resolved an empty trx slot");
            if status == TrxStatus::Committed && !is_valid_csn(csn) {
                // Commit in flight: the CSN store trails the status store.
                std::hint::spin_loop();
                continue;
            }
            return Some(TrxInfo { status, csn });
        }
    }

    // ── Record arena ────────────────────────────────────────────────

    fn write_flat(&self, mut off: u64, mut src: &[u8]) {
        while !src.is_empty() {
            let slice_len = self.file.slice_len() as u64;
            let in_slice = (off % slice_len) as usize;
            let chunk = usize::min(src.len(), slice_len as usize - in_slice);
            self.file
                .extend((off / BLCKSZ as u64) as u32)
                .unwrap_or_else(|e| panic!("undo arena extend failed: {}", e));
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), self.file.offset_ptr(off), chunk);
            }
            off += chunk as u64;
            src = &src[chunk..];
        }
    }

    fn read_flat(&self, mut off: u64, mut dst: &mut [u8]) {
        while !dst.is_empty() {
            let slice_len = self.file.slice_len() as u64;
            let in_slice = (off % slice_len) as usize;
            let chunk = usize::min(dst.len(), slice_len as usize - in_slice);
            unsafe {
                std::ptr::copy_nonoverlapping(self.file.offset_ptr(off), dst.as_mut_ptr(), chunk);
            }
            off += chunk as u64;
            dst = &mut dst[chunk..];
        }
    }

    /// Append one staged record and return its in-segment byte offset. Only
    /// the binding session appends, so the free cursor needs no CAS.
    pub fn append_record(&self, rec: &[u8]) -> u64 {
        let off = self.head_u64(UH_FREE_BEGIN).load(Ordering::Relaxed);
        self.write_flat(off, rec);
        self.file.persist(off, rec.len());
        self.head_u64(UH_FREE_BEGIN)
            .store(off + rec.len() as u64, Ordering::Release);
        self.file.persist(UH_FREE_BEGIN as u64, 8);
        off
    }

    /// Copy the record at `off` into `cache` and return the copied prefix.
    pub fn copy_record<'a>(&self, off: u64, cache: &'a mut [u8]) -> &'a [u8] {
        let mut head = [0u8; UNDO_REC_HEAD_SIZE];
        self.read_flat(off, &mut head);
        let payload = u32::from_le_bytes(head[UR_PAYLOAD..UR_PAYLOAD + 4].try_into().unwrap());
        let total = UNDO_REC_HEAD_SIZE + payload as usize;
        assert!(total <= cache.len(), "undo record exceeds staging buffer");
        self.read_flat(off, &mut cache[..total]);
        &cache[..total]
    }

    // ── Recycling ───────────────────────────────────────────────────

    fn slot_recyclable(&self, slot_id: u64, min_snapshot: u64) -> bool {
        match self.get_trx_info(slot_id) {
            None => true,
            Some(info) => match info.status {
                TrxStatus::RolledBack => true,
                TrxStatus::Committed => info.csn < min_snapshot,
                _ => false,
            },
        }
    }

    /// Punch out undo slices wholly covered by slots `[begin, end]`.
    fn recycle_arena(&self, begin_slot: u64, end_slot: u64) {
        let slice_len = self.file.slice_len() as u64;
        let mut start_slice =
            (self.head_u64(UH_RECYCLED_BEGIN).load(Ordering::Relaxed) / slice_len) as u32;
        let mut recycled_end = 0u64;
        let mut end_slice = 0u32;
        for slot in begin_slot..=end_slot {
            let end = self.slot_u64(slot, TS_END).load(Ordering::Relaxed);
            if end == 0 {
                continue;
            }
            recycled_end = slot_ptr_slot(end);
            end_slice = (recycled_end / slice_len) as u32;
        }
        // The first slice holds the header and slot ring; never punch it.
        if start_slice == 0 {
            start_slice = 1;
        }
        if start_slice < end_slice {
            self.head_u64(UH_RECYCLED_BEGIN)
                .store(recycled_end, Ordering::Relaxed);
            self.file.persist(UH_RECYCLED_BEGIN as u64, 8);
            self.file.punch(start_slice, end_slice);
        }
    }

    /// Advance the recycle cursor past every retired prefix slot.
    ///
    /// Runs on the recycler thread while readers resolve slot pointers, so
    /// the order is load-bearing: publish `min_slot_id` first (any reader
    /// from now on treats those slots as long-committed), fence, then wipe
    /// the slots and advance `next_recycle_slot` so they become allocatable.
    pub fn recycle_slots(&self, min_snapshot: u64) {
        let begin_slot = self.next_recycle_slot();
        let max_slot = self.next_free_slot();
        let mut next_slot = begin_slot;
        while next_slot < max_slot && self.slot_recyclable(next_slot, min_snapshot) {
            next_slot += 1;
        }
        if next_slot == begin_slot {
            return;
        }

        if next_slot + FLOOR_SLOT_MARGIN >= max_slot {
            // Ring is (nearly) drained: remember the horizon so recovery can
            // still derive a CSN floor after every slot is gone.
            self.head_u64(UH_MIN_SNAPSHOT)
                .store(min_snapshot, Ordering::Relaxed);
        }

        self.head_u64(UH_MIN_SLOT_ID)
            .store(next_slot, Ordering::Release);
        self.file.persist(UH_MIN_SLOT_ID as u64, 8);
        std::sync::atomic::fence(Ordering::SeqCst);

        self.recycle_arena(begin_slot, next_slot - 1);

        for slot in begin_slot..next_slot {
            self.slot_u64(slot, TS_CSN).store(0, Ordering::Relaxed);
            self.slot_u64(slot, TS_START).store(0, Ordering::Relaxed);
            self.slot_u64(slot, TS_END).store(0, Ordering::Relaxed);
            self.slot_status(slot).store(TrxStatus::Empty as u32, Ordering::Relaxed);
        }
        self.head_u64(UH_NEXT_RECYCLE_SLOT)
            .store(next_slot, Ordering::Release);
        self.file.persist(0, UNDO_HEAD_FIXED);
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Scan the tail of the slot ring after a restart: recover the largest
    /// committed CSN and mark the window whose in-progress transactions the
    /// background pass must roll back.
    pub fn recover(&self, max_committed_csn: &mut u64) {
        if self.ring_empty() {
            let floor = self.min_snapshot_floor();
            if floor > *max_committed_csn {
                *max_committed_csn = floor;
            }
            return;
        }
        let slot_end = self.next_free_slot() - 1;
        let slot_begin = slot_end.saturating_sub(1).max(self.next_recycle_slot());
        for slot in slot_begin..=slot_end {
            let status = TrxStatus::from_u32(self.slot_status(slot).load(Ordering::Relaxed));
            let csn = self.slot_u64(slot, TS_CSN).load(Ordering::Relaxed);
            if status == TrxStatus::Committed && csn > *max_committed_csn {
                *max_committed_csn = csn;
            }
        }
        if self.head_u64(UH_RECOVERY_START).load(Ordering::Relaxed) == 0 {
            // Stored off by one so zero stays the "no window" sentinel.
            // If it is already set, the previous crash happened during
            // recovery and the old window still stands.
            self.head_u64(UH_RECOVERY_START)
                .store(slot_begin + 1, Ordering::Relaxed);
        }
        self.head_u64(UH_RECOVERY_END)
            .store(slot_end, Ordering::Relaxed);
        self.file.persist(0, UNDO_HEAD_FIXED);
    }

    /// The recovery window `[start, end]`, or `None` when nothing is pending.
    pub fn recovery_window(&self) -> Option<(u64, u64)> {
        let start = self.head_u64(UH_RECOVERY_START).load(Ordering::Relaxed);
        if start == 0 {
            return None;
        }
        Some((start - 1, self.head_u64(UH_RECOVERY_END).load(Ordering::Relaxed)))
    }

    pub fn clear_recovery_window(&self) {
        self.head_u64(UH_RECOVERY_START).store(0, Ordering::Relaxed);
        self.file.persist(UH_RECOVERY_START as u64, 8);
    }
}

/// All undo segments plus the session-binding state.
pub struct UndoSpace {
    segments: Vec<Arc<UndoSegment>>,
    alloc: Mutex<AllocState>,
}

struct AllocState {
    bound: Vec<bool>,
    clock: u64,
}

impl UndoSpace {
    fn build(dirs: &Arc<DirSet>) -> UndoSpace {
        let segments = (0..UNDO_SEGMENT_COUNT)
            .map(|i| {
                let dir = Arc::new(DirSet::single(dirs.path(i)));
                Arc::new(UndoSegment::new(dir, i as u16))
            })
            .collect();
        UndoSpace {
            segments,
            alloc: Mutex::new(AllocState {
                bound: vec![false; UNDO_SEGMENT_COUNT],
                clock: 0,
            }),
        }
    }

    pub fn create(dirs: &Arc<DirSet>) -> Result<UndoSpace, StoreError> {
        let us = Self::build(dirs);
        for seg in &us.segments {
            seg.create()?;
        }
        Ok(us)
    }

    /// Mount all segments and return the recovered maximum committed CSN.
    pub fn mount(dirs: &Arc<DirSet>) -> Result<(UndoSpace, u64), StoreError> {
        let us = Self::build(dirs);
        let mut max_csn = MIN_CSN;
        for seg in &us.segments {
            seg.mount()?;
            seg.recover(&mut max_csn);
        }
        Ok((us, max_csn))
    }

    pub fn unmount(&self) {
        for seg in &self.segments {
            seg.unmount();
        }
    }

    pub fn get(&self, id: u16) -> &Arc<UndoSegment> {
        &self.segments[id as usize]
    }

    pub fn segments(&self) -> &[Arc<UndoSegment>] {
        &self.segments
    }

    /// Bind a session to a segment in its directory group with free slots.
    pub fn bind(&self, group: u32, dir_count: u32) -> (usize, Arc<UndoSegment>) {
        let mut st = self.alloc.lock();
        loop {
            st.clock += 1;
            let idx = (st.clock % UNDO_SEGMENT_COUNT as u64) as usize;
            if st.bound[idx] {
                continue;
            }
            if idx as u32 % dir_count != group % dir_count {
                continue;
            }
            if self.segments[idx].ring_full() {
                continue;
            }
            st.bound[idx] = true;
            return (idx, self.segments[idx].clone());
        }
    }

    pub fn release(&self, idx: usize) {
        self.alloc.lock().bound[idx] = false;
    }

    /// Resolve a transaction-slot pointer. `None` means recycled.
    pub fn get_trx_info(&self, slot_ptr: u64) -> Option<TrxInfo> {
        let seg = slot_ptr_segment(slot_ptr);
        self.segments[seg as usize].get_trx_info(slot_ptr_slot(slot_ptr))
    }

    /// Copy the undo record named by pointer `ptr` into `cache`.
    pub fn copy_record<'a>(&self, ptr: u64, cache: &'a mut [u8]) -> &'a [u8] {
        let seg = slot_ptr_segment(ptr);
        self.segments[seg as usize].copy_record(slot_ptr_slot(ptr), cache)
    }

    /// One recycler sweep over every segment.
    pub fn recycle_pass(&self, min_snapshot: u64) {
        for seg in &self.segments {
            seg.recycle_slots(min_snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::undo_record::{UndoKind, UndoRecHead};
    use tempfile::TempDir;

    fn space() -> (TempDir, UndoSpace) {
        let tmp = TempDir::new().unwrap();
        let d = tmp.path().join("d0");
        std::fs::create_dir_all(&d).unwrap();
        let dirs = Arc::new(DirSet::parse(&d.display().to_string()).unwrap());
        let us = UndoSpace::create(&dirs).unwrap();
        (tmp, us)
    }

    fn staged(kind: UndoKind, payload: u32, prev: u64) -> Vec<u8> {
        let head = UndoRecHead {
            kind,
            row_len: 0,
            delta_len: 0,
            seghead: 0,
            row_id: 0,
            payload,
            prev,
        };
        let mut buf = vec![0u8; UNDO_REC_HEAD_SIZE + payload as usize];
        head.write(&mut buf);
        for (i, b) in buf[UNDO_REC_HEAD_SIZE..].iter_mut().enumerate() {
            *b = i as u8;
        }
        buf
    }

    #[test]
    fn test_slot_lifecycle() {
        let (_t, us) = space();
        let seg = us.get(3);
        assert!(seg.ring_empty());
        let slot = seg.alloc_slot();
        assert_eq!(slot, 0);
        assert!(!seg.ring_empty());

        let info = seg.get_trx_info(slot).unwrap();
        assert_eq!(info.status, TrxStatus::InProgress);

        seg.set_slot_csn(slot, MIN_CSN + 9);
        seg.set_slot_status(slot, TrxStatus::Committed);
        let info = seg.get_trx_info(slot).unwrap();
        assert_eq!(info.status, TrxStatus::Committed);
        assert_eq!(info.csn, MIN_CSN + 9);
    }

    #[test]
    fn test_record_append_and_copy() {
        let (_t, us) = space();
        let seg = us.get(0);
        let rec = staged(UndoKind::HeapDelete, 100, 77);
        let off = seg.append_record(&rec);
        let ptr = make_slot_ptr(0, off);

        let mut cache = vec![0u8; UNDO_RECORD_CACHE_SIZE];
        let back = us.copy_record(ptr, &mut cache);
        assert_eq!(back, &rec[..]);
        let head = UndoRecHead::read(back);
        assert_eq!(head.kind, UndoKind::HeapDelete);
        assert_eq!(head.prev, 77);
    }

    #[test]
    fn test_record_spanning_slice_boundary() {
        let (_t, us) = space();
        let seg = us.get(1);
        // Walk the arena cursor close to the end of slice 0.
        let slice_len = UNDO_SLICE_LEN as u64;
        let filler = staged(UndoKind::HeapInsert, 0, 0);
        while seg.head_u64(UH_FREE_BEGIN).load(Ordering::Relaxed) % slice_len
            < slice_len - (UNDO_REC_HEAD_SIZE as u64 + 8)
        {
            seg.append_record(&filler);
        }
        let rec = staged(UndoKind::HeapDelete, 256, 0);
        let off = seg.append_record(&rec);
        let mut cache = vec![0u8; UNDO_RECORD_CACHE_SIZE];
        let back = seg.copy_record(off, &mut cache);
        assert_eq!(back, &rec[..]);
    }

    #[test]
    fn test_recycle_respects_horizon() {
        let (_t, us) = space();
        let seg = us.get(0);
        let s0 = seg.alloc_slot();
        seg.set_slot_csn(s0, MIN_CSN + 1);
        seg.set_slot_status(s0, TrxStatus::Committed);
        let s1 = seg.alloc_slot();
        seg.set_slot_csn(s1, MIN_CSN + 5);
        seg.set_slot_status(s1, TrxStatus::Committed);

        // Horizon below both commits: nothing to do.
        seg.recycle_slots(MIN_CSN + 1);
        assert!(seg.get_trx_info(s0).is_some());

        // Horizon passes the first commit only.
        seg.recycle_slots(MIN_CSN + 2);
        assert!(seg.get_trx_info(s0).is_none(), "slot 0 must be retired");
        assert!(seg.get_trx_info(s1).is_some());

        seg.recycle_slots(MIN_CSN + 6);
        assert!(seg.get_trx_info(s1).is_none());
        assert!(seg.ring_empty());
        assert_eq!(seg.min_snapshot_floor(), MIN_CSN + 6);
    }

    #[test]
    fn test_rolled_back_slot_is_immediately_recyclable() {
        let (_t, us) = space();
        let seg = us.get(0);
        let s = seg.alloc_slot();
        seg.set_slot_status(s, TrxStatus::RolledBack);
        seg.recycle_slots(MIN_CSN);
        assert!(seg.ring_empty());
    }

    #[test]
    fn test_bind_prefers_group_affinity() {
        let (_t, us) = space();
        let (idx, seg) = us.bind(0, 1);
        assert_eq!(seg.id() as usize, idx);
        let (idx2, _seg2) = us.bind(0, 1);
        assert_ne!(idx, idx2, "bound segment must not be handed out twice");
        us.release(idx);
        us.release(idx2);
    }

    #[test]
    fn test_recovery_floor_from_empty_ring() {
        let (_t, us) = space();
        let seg = us.get(2);
        let s = seg.alloc_slot();
        seg.set_slot_csn(s, MIN_CSN + 41);
        seg.set_slot_status(s, TrxStatus::Committed);
        seg.recycle_slots(MIN_CSN + 42);
        let mut max = MIN_CSN;
        seg.recover(&mut max);
        assert_eq!(max, MIN_CSN + 42);
    }
}
