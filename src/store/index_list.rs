//! The index leaf list: sentinel setup, locking walks, and ordered scans.
//!
//! Leaves form a doubly linked list between two sentinels: the head covers
//! `["", max_key)` until the first split, the tail pins `max_key`. A lookup
//! jumps via the caller group's search layer to a candidate leaf, then walks
//! left/right under the versioned-lock protocol until the key's range
//! matches. The search layer is maintained asynchronously, so the walk must
//! tolerate stale jumps and deleted (merged-away) leaves: a deleted leaf has
//! an empty range (`min == max`) and still carries usable prev/next links.

use crate::store::constants::*;
use crate::store::index_key::IndexKey;
use crate::store::index_leaf::Leaf;
use crate::store::index_log::{IndexRuntime, LookupSnapshot, ThreadLog};

/// Create the sentinel leaves. Called once at `Engine::init`.
pub fn init_list(rt: &IndexRuntime) {
    let head_block = rt.pool().alloc_leaf();
    let tail_block = rt.pool().alloc_leaf();
    let head = Leaf::at(rt, head_block);
    let tail = Leaf::at(rt, tail_block);

    let min = IndexKey::empty();
    let max = IndexKey::max_key();

    head.set_cur(head_block);
    head.set_min(&min);
    head.set_max(&max);
    head.set_prev(INVALID_LEAF);
    head.set_next(tail_block);

    tail.set_cur(tail_block);
    tail.set_min(&max);
    tail.set_max(&max);
    tail.set_prev(head_block);
    tail.set_next(INVALID_LEAF);

    rt.pool().persist_leaf(head_block, 0, LEAF_BLOCK_SIZE);
    rt.pool().persist_leaf(tail_block, 0, LEAF_BLOCK_SIZE);
    rt.pool().set_list_roots(head_block, tail_block);
}

pub fn head(rt: &IndexRuntime) -> Leaf {
    Leaf::at(rt, rt.pool().head_leaf())
}

/// Candidate leaf for `key` via the group's search layer, falling back to
/// the list head when the layer has no answer yet.
fn jump(rt: &IndexRuntime, group: u32, key: &IndexKey) -> Leaf {
    match rt.layer(group).lookup(key) {
        Some(block) => Leaf::at(rt, block),
        None => head(rt),
    }
}

/// Walk from `start` to the leaf whose range holds `key` and lock it.
///
/// While holding a deleted neighbor chain, short-circuits the stale links so
/// later walks skip it (the same path compression the search layer cannot do
/// for us because it is maintained asynchronously).
fn search_and_lock(rt: &IndexRuntime, start: Leaf, key: &IndexKey) -> Leaf {
    let gen = rt.gen_id();
    let mut cur = start;
    loop {
        cur.spin_write_lock(gen);
        if cur.min() > *key {
            let mut prev = Leaf::at(rt, cur.prev());
            if cur.deleted() && prev.deleted() {
                while prev.deleted() {
                    prev = Leaf::at(rt, prev.prev());
                }
                cur.set_prev(prev.block());
            }
            cur.write_unlock();
            cur = prev;
            continue;
        }
        if cur.max() <= *key {
            let mut next = Leaf::at(rt, cur.next());
            if cur.deleted() && next.deleted() {
                while next.deleted() {
                    next = Leaf::at(rt, next.next());
                }
                cur.set_next(next.block());
            }
            cur.write_unlock();
            cur = next;
            continue;
        }
        return cur;
    }
}

/// Insert (or overwrite) `key -> value`.
pub fn insert(rt: &IndexRuntime, log: &ThreadLog, key: &IndexKey, value: u64) {
    let cur = search_and_lock(rt, jump(rt, log.group(), key), key);
    cur.insert(rt, log, key, value, false);
    cur.write_unlock();
}

/// Point lookup under the optimistic read protocol.
pub fn lookup(rt: &IndexRuntime, group: u32, key: &IndexKey) -> Option<u64> {
    let gen = rt.gen_id();
    'restart: loop {
        let mut cur = jump(rt, group, key);
        loop {
            if cur.min() > *key {
                cur = Leaf::at(rt, cur.prev());
                continue;
            }
            if !cur.check_range(key) {
                cur = Leaf::at(rt, cur.next());
                continue;
            }
            break;
        }
        let Some(ver) = cur.read_lock(gen) else {
            continue 'restart;
        };
        if !cur.check_range(key) {
            continue 'restart;
        }
        let value = cur.lookup(key);
        if !cur.read_unlock(ver) {
            continue 'restart;
        }
        return value;
    }
}

/// Ordered scan of `[start, end]`, bounded by `max_range` results. Leaves
/// are handed off under their write locks; at least half-retired leaves are
/// pruned on the way through.
pub fn scan(
    rt: &IndexRuntime,
    log: &ThreadLog,
    start: &IndexKey,
    end: &IndexKey,
    max_range: usize,
    snapshot: LookupSnapshot,
) -> Vec<(IndexKey, u64)> {
    let gen = rt.gen_id();
    let mut result = Vec::new();
    let mut cur = search_and_lock(rt, jump(rt, log.group(), start), start);
    let mut continue_scan = false;
    loop {
        let (mut hit_end, need_prune) = cur.scan_in_order(
            rt,
            start,
            end,
            max_range,
            snapshot,
            &mut result,
            continue_scan,
        );
        if need_prune {
            cur.prune(rt, log, snapshot, gen);
        }
        hit_end |= *end < cur.max();
        let next_block = cur.next();
        cur.write_unlock();
        if hit_end {
            break;
        }
        let next = Leaf::at(rt, next_block);
        next.spin_write_lock(gen);
        cur = next;
        continue_scan = true;
    }
    result
}
