//! Index leaf nodes.
//!
//! A leaf is a [`LEAF_BLOCK_SIZE`]-byte PMEM block: boundary keys (`min`,
//! `max`), the common `prefix` of its range, two permutation arrays, the
//! prev/cur/next block links, a versioned lock, and an append-only KV arena.
//! Keys inside a leaf are stored as *suffix keys* with the prefix stripped;
//! each line point carries the arena offset (in 8-byte granules) and a
//! one-byte fingerprint of the suffix that short-circuits equality probes.
//!
//! Exactly one of the two permutation arrays is authoritative at any visible
//! instant. Writers build the new ordering in the staging array, flush it,
//! and publish by toggling `cur_perm` — readers take an acquire load of the
//! byte and never observe a half-built ordering.
//!
//! The versioned lock carries a generation id in its high 32 bits. The pool
//! bumps the generation on every mount, so lock waiters from before a crash
//! fail their CAS, reread, and adopt the new generation instead of spinning
//! on a stale word.

use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use crate::store::constants::*;
use crate::store::index_key::IndexKey;
use crate::store::index_log::{IndexRuntime, LookupSnapshot, ThreadLog};
use crate::store::trx::{trx_info_is_csn, trx_info_is_slot};
use crate::store::undo_segment::TrxStatus;
use crate::util::mem::{atomic_u64_at, bytes_at_mut};

/// MVCC classification of one stored value against a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MvccVisibility {
    Visible,
    Invisible,
    Removable,
}

/// A leaf in place. Copyable view over the mapped block.
#[derive(Clone, Copy)]
pub struct Leaf {
    base: *mut u8,
    block: u32,
}

unsafe impl Send for Leaf {}
unsafe impl Sync for Leaf {}

const LOCK_FREE_BASE: u64 = 2;

impl Leaf {
    pub fn at(rt: &IndexRuntime, block: u32) -> Leaf {
        Leaf {
            base: rt.pool().leaf_ptr(block),
            block,
        }
    }

    pub fn block(&self) -> u32 {
        self.block
    }

    fn bytes(&self) -> &mut [u8] {
        unsafe { bytes_at_mut(self.base, LEAF_BLOCK_SIZE) }
    }

    // ── Header fields ───────────────────────────────────────────────

    pub fn min(&self) -> IndexKey {
        IndexKey::read(&self.bytes()[LF_MIN..])
    }

    pub fn set_min(&self, k: &IndexKey) {
        k.write(&mut self.bytes()[LF_MIN..LF_MIN + KEYBUF_SIZE]);
    }

    pub fn max(&self) -> IndexKey {
        IndexKey::read(&self.bytes()[LF_MAX..])
    }

    pub fn set_max(&self, k: &IndexKey) {
        k.write(&mut self.bytes()[LF_MAX..LF_MAX + KEYBUF_SIZE]);
    }

    pub fn prefix(&self) -> IndexKey {
        IndexKey::read(&self.bytes()[LF_PREFIX..])
    }

    pub fn set_prefix(&self, k: &IndexKey) {
        k.write(&mut self.bytes()[LF_PREFIX..LF_PREFIX + KEYBUF_SIZE]);
    }

    /// Recompute the prefix as the common prefix of `min` and `max`.
    pub fn make_prefix(&self) {
        let min = self.min();
        let max = self.max();
        let n = min.common_prefix_len(&max);
        self.set_prefix(&IndexKey::from_bytes(&min.as_bytes()[..n]));
    }

    fn next_kv(&self) -> u8 {
        self.bytes()[LF_NEXT_KV]
    }

    fn set_next_kv(&self, v: u8) {
        self.bytes()[LF_NEXT_KV] = v;
    }

    fn cur_perm_idx(&self) -> u8 {
        // Published with a release fence from the writer side.
        unsafe { std::ptr::read_volatile(self.base.add(LF_CUR_PERM)) }
    }

    pub fn deleted(&self) -> bool {
        self.bytes()[LF_DELETED] != 0
    }

    /// Callers flush the containing block after the surrounding relink.
    pub fn set_deleted(&self) {
        self.bytes()[LF_DELETED] = 1;
    }

    pub fn prev(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes()[LF_PREV..])
    }

    pub fn set_prev(&self, b: u32) {
        LittleEndian::write_u32(&mut self.bytes()[LF_PREV..], b);
    }

    pub fn next(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes()[LF_NEXT..])
    }

    pub fn set_next(&self, b: u32) {
        LittleEndian::write_u32(&mut self.bytes()[LF_NEXT..], b);
    }

    pub fn cur(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes()[LF_CUR..])
    }

    pub fn set_cur(&self, b: u32) {
        LittleEndian::write_u32(&mut self.bytes()[LF_CUR..], b);
    }

    /// `min <= key < max`.
    pub fn check_range(&self, key: &IndexKey) -> bool {
        self.min() <= *key && *key < self.max()
    }

    // ── Versioned lock ──────────────────────────────────────────────

    fn version(&self) -> &AtomicU64 {
        unsafe { atomic_u64_at(self.base.add(LF_VERSION)) }
    }

    /// Try to take the write lock under generation `gen`. Returns the locked
    /// version on success.
    pub fn write_lock(&self, gen: u32) -> Option<u64> {
        let ver = self.version().load(Ordering::Acquire);
        let lock_gen = (ver >> 32) as u32;
        if lock_gen != gen {
            // Stale generation from a previous incarnation: adopt the new
            // one, locked.
            let new = ((gen as u64) << 32) + LOCK_FREE_BASE + 1;
            return self
                .version()
                .compare_exchange(ver, new, Ordering::AcqRel, Ordering::Relaxed)
                .ok()
                .map(|_| new);
        }
        if ver & 1 != 0 {
            return None;
        }
        self.version()
            .compare_exchange(ver, ver + 1, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| ver)
    }

    pub fn spin_write_lock(&self, gen: u32) {
        let backoff = crossbeam::utils::Backoff::new();
        while self.write_lock(gen).is_none() {
            backoff.snooze();
        }
    }

    pub fn write_unlock(&self) {
        self.version().fetch_add(1, Ordering::Release);
    }

    /// Optimistic read entry: returns the version to validate against.
    pub fn read_lock(&self, gen: u32) -> Option<u64> {
        let ver = self.version().load(Ordering::Acquire);
        let lock_gen = (ver >> 32) as u32;
        if lock_gen != gen {
            let new = ((gen as u64) << 32) + LOCK_FREE_BASE;
            return self
                .version()
                .compare_exchange(ver, new, Ordering::AcqRel, Ordering::Relaxed)
                .ok()
                .map(|_| new);
        }
        if ver & 1 != 0 {
            return None;
        }
        Some(ver)
    }

    /// Validate an optimistic read.
    pub fn read_unlock(&self, ver: u64) -> bool {
        std::sync::atomic::fence(Ordering::Acquire);
        self.version().load(Ordering::Acquire) == ver
    }

    // ── Permutation arrays ──────────────────────────────────────────

    fn perm_off(idx: u8) -> usize {
        if idx == 0 {
            LF_PERM0
        } else {
            LF_PERM1
        }
    }

    fn perm_count(&self, idx: u8) -> usize {
        self.bytes()[Self::perm_off(idx)] as usize
    }

    fn perm_recyclable(&self, idx: u8) -> usize {
        self.bytes()[Self::perm_off(idx) + 1] as usize
    }

    fn perm_item(&self, idx: u8, i: usize) -> (u8, u8) {
        let off = Self::perm_off(idx) + 2 + 2 * i;
        let b = self.bytes();
        (b[off], b[off + 1])
    }

    fn set_perm_item(&self, idx: u8, i: usize, arena_off: u8, fp: u8) {
        let off = Self::perm_off(idx) + 2 + 2 * i;
        let b = self.bytes();
        b[off] = arena_off;
        b[off + 1] = fp;
    }

    fn set_perm_counts(&self, idx: u8, count: usize, recyclable: usize) {
        let off = Self::perm_off(idx);
        let b = self.bytes();
        b[off] = count as u8;
        b[off + 1] = recyclable.min(255) as u8;
    }

    fn copy_perm(&self, from: u8, to: u8) {
        let (f, t) = (Self::perm_off(from), Self::perm_off(to));
        let b = self.bytes();
        b.copy_within(f..f + PERM_SIZE, t);
    }

    /// Publish the staging perm: flush it, then toggle the index.
    fn publish_perm(&self, rt: &IndexRuntime) {
        let staging = 1 - self.cur_perm_idx();
        rt.pool()
            .persist_leaf(self.block, Self::perm_off(staging), PERM_SIZE);
        std::sync::atomic::fence(Ordering::Release);
        unsafe { std::ptr::write_volatile(self.base.add(LF_CUR_PERM), staging) };
        rt.pool().persist_leaf(self.block, LF_CUR_PERM, 1);
    }

    pub fn entry_count(&self) -> usize {
        self.perm_count(self.cur_perm_idx())
    }

    // ── KV arena ────────────────────────────────────────────────────

    fn kv_value_ptr(&self, arena_off: u8) -> &AtomicU64 {
        unsafe { atomic_u64_at(self.base.add(LF_ARENA + arena_off as usize * KV_ALIGN)) }
    }

    fn kv_key(&self, arena_off: u8) -> IndexKey {
        let start = LF_ARENA + arena_off as usize * KV_ALIGN + 8;
        let b = self.bytes();
        let len = b[start] as usize;
        IndexKey::from_bytes(&b[start + 1..start + 1 + len])
    }

    fn kv_item_size(key_len: usize) -> usize {
        8 + 1 + key_len
    }

    fn kv_item_granules(key_len: usize) -> usize {
        Self::kv_item_size(key_len).div_ceil(KV_ALIGN)
    }

    fn fingerprint(suffix: &IndexKey) -> u8 {
        let mut hash = suffix.len() as u32;
        for &b in suffix.as_bytes() {
            hash = ((hash << 5) ^ (hash >> 27)) ^ b as u32;
        }
        hash as u8
    }

    fn storage_full(&self, size: usize) -> bool {
        let next = self.next_kv();
        next == LEAF_ARENA_FULL || next as usize * KV_ALIGN + size > LEAF_ARENA_SIZE
    }

    fn perm_full(&self) -> bool {
        self.entry_count() == LEAF_MAX_ENTRIES
    }

    /// Index of `suffix` in the current perm, or `None`.
    fn key_index(&self, suffix: &IndexKey, fp: u8) -> Option<usize> {
        let pidx = self.cur_perm_idx();
        for i in 0..self.perm_count(pidx) {
            let (off, item_fp) = self.perm_item(pidx, i);
            if item_fp == fp && self.kv_key(off) == *suffix {
                return Some(i);
            }
        }
        None
    }

    /// First perm position whose key is `>= suffix`.
    fn lower_bound(&self, suffix: &IndexKey) -> usize {
        let pidx = self.cur_perm_idx();
        let mut lo = 0;
        let mut hi = self.perm_count(pidx);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (off, _) = self.perm_item(pidx, mid);
            if *suffix > self.kv_key(off) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Append a KV item to the arena. `None` when the leaf is full.
    fn insert_kv_item(&self, rt: &IndexRuntime, suffix: &IndexKey, value: u64) -> Option<u8> {
        let size = Self::kv_item_size(suffix.len());
        if self.perm_full() || self.storage_full(size) {
            return None;
        }
        let off = self.next_kv();
        let start = LF_ARENA + off as usize * KV_ALIGN;
        {
            let b = self.bytes();
            LittleEndian::write_u64(&mut b[start..], value);
            b[start + 8] = suffix.len() as u8;
            b[start + 9..start + 9 + suffix.len()].copy_from_slice(suffix.as_bytes());
        }
        rt.pool().persist_leaf(self.block, start, size);
        let next = off as usize + Self::kv_item_granules(suffix.len());
        self.set_next_kv(next.min(LEAF_ARENA_FULL as usize) as u8);
        rt.pool().persist_leaf(self.block, LF_NEXT_KV, 1);
        Some(off)
    }

    fn update_permutation(&self, rt: &IndexRuntime, arena_off: u8, fp: u8, suffix: &IndexKey) {
        let pos = self.lower_bound(suffix);
        let cur = self.cur_perm_idx();
        let staging = 1 - cur;
        self.copy_perm(cur, staging);
        let count = self.perm_count(staging);
        debug_assert!(count < LEAF_MAX_ENTRIES);
        let mut i = count;
        while i > pos {
            let (o, f) = self.perm_item(staging, i - 1);
            self.set_perm_item(staging, i, o, f);
            i -= 1;
        }
        self.set_perm_item(staging, pos, arena_off, fp);
        self.set_perm_counts(staging, count + 1, self.perm_recyclable(staging));
        self.publish_perm(rt);
    }

    // ── Insert / lookup ─────────────────────────────────────────────

    /// Insert or overwrite `key` with `value`. The caller holds the write
    /// lock and has verified the range. Returns `true` when an existing
    /// entry's value was overwritten in place.
    pub fn insert(
        &self,
        rt: &IndexRuntime,
        log: &ThreadLog,
        key: &IndexKey,
        value: u64,
        during_split: bool,
    ) -> bool {
        let suffix = key.suffix(self.prefix().len());
        let fp = Self::fingerprint(&suffix);
        if let Some(i) = self.key_index(&suffix, fp) {
            let (off, _) = self.perm_item(self.cur_perm_idx(), i);
            self.kv_value_ptr(off).store(value, Ordering::Release);
            rt.pool()
                .persist_leaf(self.block, LF_ARENA + off as usize * KV_ALIGN, 8);
            return true;
        }
        match self.insert_kv_item(rt, &suffix, value) {
            Some(off) => {
                self.update_permutation(rt, off, fp, &suffix);
                false
            }
            None => {
                assert!(!during_split, "split target leaf overflowed");
                self.split(rt, log, key, value);
                false
            }
        }
    }

    /// Value stored under `key`, if present.
    pub fn lookup(&self, key: &IndexKey) -> Option<u64> {
        let suffix = key.suffix(self.prefix().len());
        let fp = Self::fingerprint(&suffix);
        self.key_index(&suffix, fp).map(|i| {
            let (off, _) = self.perm_item(self.cur_perm_idx(), i);
            self.kv_value_ptr(off).load(Ordering::Acquire)
        })
    }

    // ── MVCC value policy ───────────────────────────────────────────

    /// Classify the value at `arena_off`, backfilling a committed delete's
    /// CSN in place so later readers skip the slot resolution.
    fn check_mvcc(&self, rt: &IndexRuntime, arena_off: u8, snapshot: LookupSnapshot) -> MvccVisibility {
        let vp = self.kv_value_ptr(arena_off);
        let mut v = vp.load(Ordering::Acquire);
        if trx_info_is_slot(v) {
            match rt.undo().get_trx_info(v) {
                None => return MvccVisibility::Removable,
                Some(info) => {
                    debug_assert!(info.status != TrxStatus::Empty);
                    if info.status == TrxStatus::Committed {
                        if info.csn < snapshot.min_csn {
                            return MvccVisibility::Removable;
                        }
                        vp.store(info.csn, Ordering::Release);
                        rt.pool().persist_leaf(
                            self.block,
                            LF_ARENA + arena_off as usize * KV_ALIGN,
                            8,
                        );
                        v = info.csn;
                    }
                    // In progress or rolled back: the tombstone is either
                    // still being written or being undone; the entry stays
                    // visible.
                }
            }
        }
        if trx_info_is_csn(v) {
            if v < snapshot.min_csn {
                return MvccVisibility::Removable;
            }
            if v < snapshot.snapshot {
                return MvccVisibility::Invisible;
            }
        }
        MvccVisibility::Visible
    }

    // ── Scan and prune ──────────────────────────────────────────────

    /// Scan entries in order from `start` (or from the leaf start when
    /// `continue_scan`) up to `end`/`max_range`. Appends visible entries to
    /// `result` with the leaf prefix restored. Returns `(hit_end,
    /// need_prune)`.
    #[allow(clippy::too_many_arguments)]
    pub fn scan_in_order(
        &self,
        rt: &IndexRuntime,
        start: &IndexKey,
        end: &IndexKey,
        max_range: usize,
        snapshot: LookupSnapshot,
        result: &mut Vec<(IndexKey, u64)>,
        continue_scan: bool,
    ) -> (bool, bool) {
        let prefix = self.prefix();
        let max = self.max();
        let end_suffix = if *end >= max {
            max.suffix(prefix.len())
        } else {
            end.suffix(prefix.len())
        };
        let start_index = if continue_scan {
            0
        } else {
            debug_assert!(self.check_range(start));
            self.lower_bound(&start.suffix(prefix.len()))
        };

        let pidx = self.cur_perm_idx();
        let mut hit_end = false;
        let mut scanned = 0usize;
        let mut removable = 0usize;
        for i in start_index..self.perm_count(pidx) {
            if result.len() >= max_range {
                break;
            }
            scanned += 1;
            let (off, _) = self.perm_item(pidx, i);
            let status = self.check_mvcc(rt, off, snapshot);
            let suffix = self.kv_key(off);
            if suffix >= end_suffix {
                hit_end = true;
                break;
            }
            match status {
                MvccVisibility::Visible => {
                    let v = self.kv_value_ptr(off).load(Ordering::Acquire);
                    result.push((suffix.with_prefix(&prefix), v));
                }
                MvccVisibility::Removable => removable += 1,
                MvccVisibility::Invisible => {}
            }
        }
        let need_prune = scanned > 0 && removable >= scanned / 2;
        (hit_end || result.len() >= max_range, need_prune)
    }

    /// Drop every MVCC-retired entry from the published perm; merge with the
    /// previous leaf if nothing remains.
    pub fn prune(&self, rt: &IndexRuntime, log: &ThreadLog, snapshot: LookupSnapshot, gen: u32) {
        let pidx = self.cur_perm_idx();
        let mut kept: Vec<(u8, u8)> = Vec::new();
        let mut removed_granules = 0usize;
        let mut removed = 0usize;
        for i in 0..self.perm_count(pidx) {
            let (off, fp) = self.perm_item(pidx, i);
            if self.check_mvcc(rt, off, snapshot) == MvccVisibility::Removable {
                removed += 1;
                removed_granules += Self::kv_item_granules(self.kv_key(off).len());
            } else {
                kept.push((off, fp));
            }
        }
        if removed == 0 {
            return;
        }
        let staging = 1 - pidx;
        for (i, (off, fp)) in kept.iter().enumerate() {
            self.set_perm_item(staging, i, *off, *fp);
        }
        self.set_perm_counts(
            staging,
            kept.len(),
            self.perm_recyclable(pidx) + removed_granules,
        );
        self.publish_perm(rt);
        // The head sentinel has no predecessor and always stays in place.
        if kept.is_empty() && self.prev() != INVALID_LEAF {
            self.merge_empty_with_prev(rt, log, gen);
        }
    }

    // ── Structural changes ──────────────────────────────────────────

    /// Rebuild the leaf in place after its range narrowed: extend the prefix
    /// to the new (min, max) and re-project every surviving suffix.
    fn shrink(&self, rt: &IndexRuntime) {
        let old_prefix_len = self.prefix().len();
        self.make_prefix();
        let delta = self.prefix().len() - old_prefix_len;

        let pidx = self.cur_perm_idx();
        let count = self.perm_count(pidx);
        let mut arena = vec![0u8; LEAF_ARENA_SIZE];
        let mut items: Vec<(u8, u8)> = Vec::with_capacity(count);
        let mut next: usize = 0;
        for i in 0..count {
            let (off, _) = self.perm_item(pidx, i);
            let value = self.kv_value_ptr(off).load(Ordering::Relaxed);
            let key = self.kv_key(off);
            let key = key.suffix(delta);
            let start = next * KV_ALIGN;
            LittleEndian::write_u64(&mut arena[start..], value);
            arena[start + 8] = key.len() as u8;
            arena[start + 9..start + 9 + key.len()].copy_from_slice(key.as_bytes());
            items.push((next as u8, Self::fingerprint(&key)));
            next += Self::kv_item_granules(key.len());
        }

        self.bytes()[LF_ARENA..LF_ARENA + LEAF_ARENA_SIZE].copy_from_slice(&arena);
        self.set_next_kv(next as u8);
        for (i, (off, fp)) in items.iter().enumerate() {
            self.set_perm_item(pidx, i, *off, *fp);
        }
        self.set_perm_counts(pidx, count, 0);
        rt.pool().persist_leaf(self.block, 0, LEAF_BLOCK_SIZE);
    }

    /// Split this leaf at its median key, inserting `(key, value)` into the
    /// correct half. The caller holds the write lock; the new leaf becomes
    /// reachable only when `self.next` is redirected at the end.
    fn split(&self, rt: &IndexRuntime, log: &ThreadLog, key: &IndexKey, value: u64) {
        let pidx = self.cur_perm_idx();
        let count = self.perm_count(pidx);
        let mid = count / 2;
        let (mid_off, _) = self.perm_item(pidx, mid);
        let new_min = self.kv_key(mid_off).with_prefix(&self.prefix());

        // Stage the structural event with the old image before mutating
        // anything in place; recovery restores the image for unfinished
        // splits.
        let op = rt.begin_split_op(log, &new_min, self.block, self.bytes());

        if self.perm_recyclable(pidx) > LEAF_SHRINK_CREDIT {
            // Enough retired space to avoid a split entirely.
            self.shrink(rt);
            self.insert(rt, log, key, value, true);
            rt.finish_op_in_place(op);
            return;
        }

        let new_block = rt.pool().alloc_leaf();
        rt.record_split_target(op, new_block);
        let new = Leaf::at(rt, new_block);
        new.set_cur(new_block);
        new.set_min(&new_min);
        new.set_max(&self.max());
        new.make_prefix();
        let delta = new.prefix().len() - self.prefix().len();

        let mut next: usize = 0;
        for i in mid..count {
            let (off, _) = self.perm_item(pidx, i);
            let v = self.kv_value_ptr(off).load(Ordering::Relaxed);
            let k = self.kv_key(off).suffix(delta);
            let start = LF_ARENA + next * KV_ALIGN;
            {
                let b = new.bytes();
                LittleEndian::write_u64(&mut b[start..], v);
                b[start + 8] = k.len() as u8;
                b[start + 9..start + 9 + k.len()].copy_from_slice(k.as_bytes());
            }
            new.set_perm_item(0, i - mid, next as u8, Self::fingerprint(&k));
            next += Self::kv_item_granules(k.len());
        }
        new.set_perm_counts(0, count - mid, 0);
        new.set_next_kv(next as u8);

        // Narrow this leaf to the lower half and rebuild it.
        self.set_perm_counts(pidx, mid, self.perm_recyclable(pidx));
        self.set_max(&new_min);
        self.shrink(rt);

        if *key < new_min {
            self.insert(rt, log, key, value, true);
        } else {
            new.insert(rt, log, key, value, true);
        }

        new.set_next(self.next());
        new.set_prev(self.cur());
        rt.pool().persist_leaf(new_block, 0, LEAF_BLOCK_SIZE);

        let old_next = self.next();
        self.set_next(new_block);
        rt.pool().persist_leaf(self.block, 0, LEAF_BLOCK_SIZE);
        rt.mark_split_linked(op);

        if old_next != INVALID_LEAF {
            // Only this split may touch the successor's prev in this window,
            // so no latch is needed on it.
            let nxt = Leaf::at(rt, old_next);
            nxt.set_prev(new_block);
            rt.pool().persist_leaf(old_next, LF_PREV, 4);
        }

        rt.enqueue_op(log, op);
    }

    /// Splice an empty leaf out of the list, growing the previous leaf's
    /// range over it. The caller holds this leaf's write lock.
    fn merge_empty_with_prev(&self, rt: &IndexRuntime, log: &ThreadLog, gen: u32) {
        let old_min = self.min();
        let prev = loop {
            let prev = Leaf::at(rt, self.prev());
            prev.spin_write_lock(gen);
            if prev.block() == self.prev() {
                break prev;
            }
            prev.write_unlock();
        };
        assert_eq!(prev.next(), self.cur(), "merge raced the leaf list");

        let max = self.max();
        // Keys that used to land here now miss `min` and retry via prev.
        self.set_min(&max);
        prev.set_max(&max);
        prev.set_next(self.next());

        let next = Leaf::at(rt, self.next());
        debug_assert!(!next.deleted());
        next.set_prev(self.prev());

        self.set_deleted();
        rt.pool().persist_leaf(self.block, 0, LEAF_BLOCK_SIZE);
        rt.pool().persist_leaf(prev.block(), 0, LEAF_BLOCK_SIZE);
        rt.pool().persist_leaf(next.block(), LF_PREV, 4);
        prev.write_unlock();

        rt.emit_remove_op(log, &old_min, self.block);
    }

    /// Restore this leaf from a split-recovery image.
    pub fn restore_image(&self, rt: &IndexRuntime, image: &[u8]) {
        self.bytes().copy_from_slice(&image[..LEAF_BLOCK_SIZE]);
        rt.pool().persist_leaf(self.block, 0, LEAF_BLOCK_SIZE);
    }
}
