//! Per-thread sessions: transaction state, undo binding, and caches.
//!
//! Everything a worker thread needs travels in one explicit [`Session`]
//! rather than hidden thread-locals: the proc-array registration, the
//! directory-group assignment, the bound undo segment, the per-table RowId
//! caches, the undo staging buffers, and the index oplog buffer. A session
//! is the transaction handle: `begin`/`commit`/`abort` plus the visibility
//! arbitration the heap paths consult.

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::store::constants::*;
use crate::store::db::EngineInner;
use crate::store::index_log::{LookupSnapshot, ThreadLog};
use crate::store::trx::{trx_info_is_csn, TmResult};
use crate::store::tuple::{RamTuple, TupleHead};
use crate::store::undo_record::{
    apply_update_to_tuple, rollback_record, UndoKind, UndoRecHead,
};
use crate::store::undo_segment::{TrxStatus, UndoSegment};
use crate::store::vecstore::TableCache;

/// Transaction states as seen by the session owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Empty,
    InProgress,
    WaitAbort,
    Committing,
    Committed,
    Aborted,
}

struct UndoCtx {
    seg: Arc<UndoSegment>,
    slot_id: u64,
    slot_ptr: u64,
}

/// One worker thread's handle onto the engine.
pub struct Session {
    engine: Arc<EngineInner>,
    group: u32,
    proc_idx: usize,
    undo_idx: usize,
    undo_seg: Arc<UndoSegment>,
    thread_log: Arc<ThreadLog>,

    status: TxStatus,
    snapshot: u64,
    min_snapshot: u64,
    csn: u64,
    undo_ctx: Option<UndoCtx>,
    write_set: Vec<(PageNo, RowId)>,

    undo_cache: Box<[u8]>,
    prev_cache: Box<[u8]>,
    table_caches: HashMap<PageNo, TableCache>,
}

impl Session {
    pub(crate) fn new(engine: Arc<EngineInner>) -> Session {
        let group = engine.register_thread();
        let proc_idx = engine.trx().register();
        let (undo_idx, undo_seg) = engine.undo().bind(group, engine.dir_count());
        let thread_log = engine.index_runtime().register_thread_log(group);
        Session {
            engine,
            group,
            proc_idx,
            undo_idx,
            undo_seg,
            thread_log,
            status: TxStatus::Empty,
            snapshot: 0,
            min_snapshot: MIN_CSN,
            csn: 0,
            undo_ctx: None,
            write_set: Vec::new(),
            undo_cache: vec![0u8; UNDO_RECORD_CACHE_SIZE].into_boxed_slice(),
            prev_cache: vec![0u8; UNDO_RECORD_CACHE_SIZE].into_boxed_slice(),
            table_caches: HashMap::new(),
        }
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub(crate) fn thread_log(&self) -> &Arc<ThreadLog> {
        &self.thread_log
    }

    pub(crate) fn table_cache(&mut self, seghead: PageNo) -> &mut TableCache {
        self.table_caches.entry(seghead).or_default()
    }

    // ── Transaction lifecycle ───────────────────────────────────────

    pub fn begin(&mut self) {
        assert!(
            matches!(
                self.status,
                TxStatus::Empty | TxStatus::Committed | TxStatus::Aborted
            ),
            "begin() inside an open transaction"
        );
        debug_assert!(self.write_set.is_empty());
        self.snapshot = self.engine.trx().install_snapshot(self.proc_idx);
        self.min_snapshot = self.engine.trx().min_snapshot();
        self.status = TxStatus::InProgress;
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn in_wait_abort(&self) -> bool {
        self.status == TxStatus::WaitAbort
    }

    /// Mark the transaction doomed; every later operation short-circuits
    /// until `abort` is called.
    pub(crate) fn wait_abort(&mut self) {
        self.status = TxStatus::WaitAbort;
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    /// CSN assigned by the last commit.
    pub fn csn(&self) -> u64 {
        self.csn
    }

    pub fn lookup_snapshot(&self) -> LookupSnapshot {
        LookupSnapshot {
            snapshot: self.snapshot,
            min_csn: self.min_snapshot,
        }
    }

    /// Lazily allocate the persistent transaction slot on first write.
    pub(crate) fn prepare_undo(&mut self) {
        if self.undo_ctx.is_some() {
            return;
        }
        if self.undo_seg.ring_full() {
            // Rotate to a segment with free slots before allocating.
            let (idx, seg) = self.engine.undo().bind(self.group, self.engine.dir_count());
            self.engine.undo().release(self.undo_idx);
            self.undo_idx = idx;
            self.undo_seg = seg;
        }
        let slot_id = self.undo_seg.alloc_slot();
        self.undo_ctx = Some(UndoCtx {
            slot_ptr: self.undo_seg.slot_ptr(slot_id),
            seg: self.undo_seg.clone(),
            slot_id,
        });
    }

    /// The persistent slot pointer; valid after `prepare_undo`.
    pub fn trx_slot_ptr(&self) -> u64 {
        self.undo_ctx
            .as_ref()
            .expect("no transaction slot allocated")
            .slot_ptr
    }

    pub fn commit(&mut self) {
        assert_eq!(self.status, TxStatus::InProgress, "commit() without begin()");
        self.status = TxStatus::Committing;
        if let Some(ctx) = self.undo_ctx.take() {
            // Payload writes land before the CSN via the slot persist; the
            // counter increment afterwards is the commit point.
            self.csn = self.engine.trx().current_csn();
            ctx.seg.set_slot_csn(ctx.slot_id, self.csn);
            ctx.seg.set_slot_status(ctx.slot_id, TrxStatus::Committed);
            self.engine.trx().advance_csn();
            self.write_set.clear();
        }
        self.status = TxStatus::Committed;
        self.engine.trx().uninstall_snapshot(self.proc_idx);
    }

    pub fn abort(&mut self) {
        assert!(
            matches!(self.status, TxStatus::InProgress | TxStatus::WaitAbort),
            "abort() without an open transaction"
        );
        if let Some(ctx) = self.undo_ctx.take() {
            let engine = self.engine.clone();
            let log = self.thread_log.clone();
            let cache = &mut self.prev_cache;
            let mut ptr = ctx.seg.slot_end(ctx.slot_id);
            while ptr != 0 {
                let rec = engine.undo().copy_record(ptr, cache);
                rollback_record(&engine, &log, rec);
                ptr = UndoRecHead::read(rec).prev;
            }
            ctx.seg.set_slot_status(ctx.slot_id, TrxStatus::RolledBack);
            self.write_set.clear();
        }
        self.status = TxStatus::Aborted;
        self.engine.trx().uninstall_snapshot(self.proc_idx);
    }

    pub(crate) fn push_write_set(&mut self, seghead: PageNo, rowid: RowId) {
        self.write_set.push((seghead, rowid));
    }

    // ── Undo staging ────────────────────────────────────────────────

    pub(crate) fn stage_undo_head(&mut self, head: &UndoRecHead) {
        head.write(&mut self.undo_cache);
    }

    pub(crate) fn undo_stage(&mut self) -> &mut [u8] {
        &mut self.undo_cache
    }

    /// Chain and append the staged record; returns its undo pointer.
    pub(crate) fn insert_undo_record(&mut self, total_len: usize) -> u64 {
        assert!(total_len <= UNDO_RECORD_CACHE_SIZE);
        let ctx = self.undo_ctx.as_ref().expect("prepare_undo not called");
        let prev = ctx.seg.slot_end(ctx.slot_id);
        LittleEndian::write_u64(&mut self.undo_cache[UR_PREV..], prev);
        let off = ctx.seg.append_record(&self.undo_cache[..total_len]);
        let ptr = crate::store::trx::make_slot_ptr(ctx.seg.id(), off);
        if ctx.seg.slot_start(ctx.slot_id) == 0 {
            ctx.seg.set_slot_start(ctx.slot_id, ptr);
        }
        debug_assert!(ptr > prev);
        ctx.seg.set_slot_end(ctx.slot_id, ptr);
        ptr
    }

    /// Replace `tuple` with its previous version from the undo arena.
    pub(crate) fn fetch_prev_version(&mut self, tuple: &mut RamTuple) {
        debug_assert!(tuple.has_prev_version());
        let ptr = tuple.head.prev;
        let rec = self.engine.undo().copy_record(ptr, &mut self.prev_cache);
        let head = UndoRecHead::read(rec);
        if head.kind == UndoKind::HeapUpdate {
            apply_update_to_tuple(rec, tuple);
        } else {
            tuple.deserialize(&rec[UNDO_REC_HEAD_SIZE..]);
        }
    }

    // ── Visibility ──────────────────────────────────────────────────

    /// Arbitrate one version head against this session's snapshot.
    ///
    /// A recycled slot reads as committed-long-ago and therefore visible:
    /// the recycler only retires slots whose CSN lies below every live
    /// snapshot, so any reader that can still reach the version must accept
    /// it.
    pub fn version_is_visible(&self, head: &TupleHead) -> TmResult {
        let committed_csn = if trx_info_is_csn(head.trx_info) {
            Some(head.trx_info)
        } else {
            match self.engine.undo().get_trx_info(head.trx_info) {
                None => return TmResult::Ok,
                Some(info) => match info.status {
                    TrxStatus::RolledBack | TrxStatus::Aborted => return TmResult::Aborted,
                    TrxStatus::Committed => Some(info.csn),
                    TrxStatus::InProgress => {
                        let own = self
                            .undo_ctx
                            .as_ref()
                            .is_some_and(|ctx| ctx.slot_ptr == head.trx_info);
                        return if own {
                            TmResult::SelfUpdated
                        } else {
                            TmResult::BeingModified
                        };
                    }
                    TrxStatus::Empty => panic!("version names an empty trx slot"),
                },
            }
        };
        match committed_csn {
            Some(csn) if csn < self.snapshot => TmResult::Ok,
            Some(_) => TmResult::Invisible,
            None => unreachable!(),
        }
    }

    /// Visibility collapsed for writers: anything another live transaction
    /// owns is a conflict, anything settled is updatable.
    pub fn satisfied_update(&self, head: &TupleHead) -> TmResult {
        match self.version_is_visible(head) {
            TmResult::Ok | TmResult::Aborted | TmResult::SelfUpdated => TmResult::Ok,
            TmResult::Invisible | TmResult::BeingModified => TmResult::BeingModified,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if matches!(self.status, TxStatus::InProgress | TxStatus::WaitAbort) {
            self.abort();
        }
        self.engine.undo().release(self.undo_idx);
        self.engine.trx().deregister(self.proc_idx);
        self.engine.unregister_thread(self.group);
    }
}
