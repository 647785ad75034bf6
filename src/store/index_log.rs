//! Index runtime: the persistent oplog, per-thread log buffers, the combiner
//! and per-group worker threads, and the DRAM search (jump) layers.
//!
//! Leaf writers never touch the search layers directly. Structural events
//! (splits, merges) are written to a persistent oplog record, then pushed
//! onto the writer's thread-local buffer. A combiner thread periodically
//! drains every buffer, orders the records, and broadcasts the batch to one
//! worker per directory group; each worker replays the batch into its own
//! search-layer instance and decrements the record's group bitmap, marking
//! the record `done` when the last group finishes. On recovery the oplog is
//! scanned linearly and every non-done record is replayed (or, for a split
//! that never finished linking, the old leaf image is restored).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::store::config::DirSet;
use crate::store::constants::*;
use crate::store::index_key::IndexKey;
use crate::store::index_leaf::Leaf;
use crate::store::index_list;
use crate::store::logic_file::LogicFile;
use crate::store::undo_segment::UndoSpace;
use crate::util::mem::{atomic_u32_at, bytes_at, bytes_at_mut};
use crate::StoreError;

/// Snapshot pair handed to index reads: the transaction snapshot plus the
/// engine-wide recycle horizon.
#[derive(Debug, Clone, Copy)]
pub struct LookupSnapshot {
    pub snapshot: u64,
    pub min_csn: u64,
}

// Oplog record op codes and steps.
pub const OP_DUMMY: u32 = 0;
pub const OP_INSERT: u32 = 1;
pub const OP_REMOVE: u32 = 2;
pub const OP_DONE: u32 = 3;

pub const STEP_INITIAL: u32 = 0;
pub const STEP_DURING_SPLIT: u32 = 1;
pub const STEP_FINISH_SPLIT: u32 = 2;

/// The persistent oplog region.
struct OplogRegion {
    file: LogicFile,
}

impl OplogRegion {
    fn new(dirs: Arc<DirSet>) -> OplogRegion {
        OplogRegion {
            file: LogicFile::new(dirs, "indexlog", INDEX_SLICE_LEN, INDEX_MAX_SLICES),
        }
    }

    fn capacity() -> usize {
        OPLOG_THREAD_CAPACITY * OPLOG_SLOTS_PER_THREAD
    }

    fn slot_off(slot: u32) -> u64 {
        slot as u64 * OP_RECORD_SIZE as u64
    }

    fn ensure(&self, slot: u32) {
        let end = Self::slot_off(slot) + OP_RECORD_SIZE as u64 - 1;
        self.file
            .extend((end / BLCKSZ as u64) as u32)
            .unwrap_or_else(|e| panic!("oplog extend failed: {}", e));
    }

    fn ptr(&self, slot: u32) -> *mut u8 {
        self.file.offset_ptr(Self::slot_off(slot))
    }

    fn persist(&self, slot: u32, off: usize, len: usize) {
        self.file.persist(Self::slot_off(slot) + off as u64, len);
    }
}

/// Per-thread oplog buffer: double-queued so the combiner can drain one side
/// while the owner appends to the other.
pub struct ThreadLog {
    group: u32,
    base_slot: u32,
    next: AtomicUsize,
    active: AtomicUsize,
    queues: [Mutex<Vec<u32>>; 2],
}

impl ThreadLog {
    pub fn group(&self) -> u32 {
        self.group
    }

    fn alloc_slot(&self) -> u32 {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.base_slot + (n % OPLOG_SLOTS_PER_THREAD) as u32
    }

    fn enqueue(&self, slot: u32) {
        let idx = self.active.load(Ordering::Acquire) % 2;
        self.queues[idx].lock().push(slot);
    }

    fn drain(&self) -> Vec<u32> {
        let idx = self.active.load(Ordering::Acquire) % 2;
        let mut q = self.queues[idx].lock();
        self.active.fetch_add(1, Ordering::AcqRel);
        std::mem::take(&mut *q)
    }
}

/// One group's DRAM jump structure: ordered map from a leaf's `min` key to
/// its block number. Lookup finds the leaf whose range may contain the key
/// (greatest entry `<=` key).
pub struct SearchLayer {
    group: u32,
    map: RwLock<std::collections::BTreeMap<IndexKey, u32>>,
}

impl SearchLayer {
    fn new(group: u32) -> SearchLayer {
        SearchLayer {
            group,
            map: RwLock::new(std::collections::BTreeMap::new()),
        }
    }

    pub fn mask(&self) -> u32 {
        1 << self.group
    }

    pub fn insert(&self, key: IndexKey, leaf: u32) {
        self.map.write().insert(key, leaf);
    }

    /// Remove the entry for `key` if it still names `leaf`.
    pub fn remove(&self, key: &IndexKey, leaf: u32) {
        let mut m = self.map.write();
        if m.get(key) == Some(&leaf) {
            m.remove(key);
        }
    }

    pub fn lookup(&self, key: &IndexKey) -> Option<u32> {
        let m = self.map.read();
        m.range(..=*key).next_back().map(|(_, &leaf)| leaf)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

type Batch = Arc<Vec<u32>>;

/// Everything the ordered index shares across sessions.
pub struct IndexRuntime {
    pool: crate::store::index_pool::LeafPool,
    oplog: OplogRegion,
    undo: Arc<UndoSpace>,
    layers: Vec<Arc<SearchLayer>>,
    logs: Mutex<Vec<Arc<ThreadLog>>>,
    next_thread: AtomicUsize,
    seq: AtomicU64,
    gen: AtomicU32,
    group_count: u32,
    senders: Vec<Sender<Batch>>,
    receivers: Mutex<Vec<Option<Receiver<Batch>>>>,
    stop: Arc<AtomicBool>,
}

impl IndexRuntime {
    fn build(dirs: &Arc<DirSet>, undo: Arc<UndoSpace>) -> IndexRuntime {
        let group_count = dirs.count();
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..group_count {
            let (tx, rx) = bounded(OPLOG_QUEUE_CAPACITY);
            senders.push(tx);
            receivers.push(Some(rx));
        }
        IndexRuntime {
            pool: crate::store::index_pool::LeafPool::new(dirs.clone(), "leafpool"),
            oplog: OplogRegion::new(dirs.clone()),
            undo,
            layers: (0..group_count).map(|g| Arc::new(SearchLayer::new(g))).collect(),
            logs: Mutex::new(Vec::new()),
            next_thread: AtomicUsize::new(0),
            seq: AtomicU64::new(1),
            gen: AtomicU32::new(1),
            group_count,
            senders,
            receivers: Mutex::new(receivers),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn create(dirs: &Arc<DirSet>, undo: Arc<UndoSpace>) -> Result<IndexRuntime, StoreError> {
        let rt = Self::build(dirs, undo);
        rt.pool.create()?;
        rt.oplog.file.create()?;
        rt.gen.store(rt.pool.gen_id(), Ordering::Relaxed);
        Ok(rt)
    }

    pub fn mount(dirs: &Arc<DirSet>, undo: Arc<UndoSpace>) -> Result<IndexRuntime, StoreError> {
        let rt = Self::build(dirs, undo);
        rt.pool.mount()?;
        rt.oplog.file.mount()?;
        rt.gen.store(rt.pool.gen_id(), Ordering::Relaxed);
        rt.recover();
        Ok(rt)
    }

    pub fn pool(&self) -> &crate::store::index_pool::LeafPool {
        &self.pool
    }

    pub fn undo(&self) -> &UndoSpace {
        &self.undo
    }

    pub fn gen_id(&self) -> u32 {
        self.gen.load(Ordering::Relaxed)
    }

    pub fn group_count(&self) -> u32 {
        self.group_count
    }

    pub fn layer(&self, group: u32) -> &Arc<SearchLayer> {
        &self.layers[group as usize]
    }

    fn all_groups_mask(&self) -> u32 {
        (1u32 << self.group_count) - 1
    }

    /// Register a worker thread's oplog buffer. The slot range wraps at the
    /// region's thread capacity.
    pub fn register_thread_log(&self, group: u32) -> Arc<ThreadLog> {
        let t = self.next_thread.fetch_add(1, Ordering::Relaxed) % OPLOG_THREAD_CAPACITY;
        let log = Arc::new(ThreadLog {
            group,
            base_slot: (t * OPLOG_SLOTS_PER_THREAD) as u32,
            next: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            queues: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
        });
        self.logs.lock().push(log.clone());
        log
    }

    // ── Oplog record staging (called under the leaf write lock) ─────

    fn record_bytes(&self, slot: u32) -> &mut [u8] {
        unsafe { bytes_at_mut(self.oplog.ptr(slot), OP_RECORD_SIZE) }
    }

    pub(crate) fn op_layers(&self, slot: u32) -> &AtomicU32 {
        unsafe { atomic_u32_at(self.oplog.ptr(slot).add(OPR_LAYERS)) }
    }

    /// Stage a split record: old image first, then the fields, then advance
    /// to the in-progress step.
    pub fn begin_split_op(
        &self,
        log: &ThreadLog,
        key: &IndexKey,
        old_leaf: u32,
        old_image: &[u8],
    ) -> u32 {
        let slot = log.alloc_slot();
        self.oplog.ensure(slot);
        let rec = self.record_bytes(slot);
        rec[OPR_IMAGE..OPR_IMAGE + LEAF_BLOCK_SIZE].copy_from_slice(old_image);
        LittleEndian::write_u32(&mut rec[OPR_OP..], OP_INSERT);
        LittleEndian::write_u32(&mut rec[OPR_STEP..], STEP_INITIAL);
        LittleEndian::write_u32(&mut rec[OPR_LAYERS..], self.all_groups_mask());
        LittleEndian::write_u64(
            &mut rec[OPR_SEQ..],
            self.seq.fetch_add(1, Ordering::Relaxed),
        );
        key.write(&mut rec[OPR_KEY..OPR_KEY + KEYBUF_SIZE]);
        LittleEndian::write_u32(&mut rec[OPR_OLD_LEAF..], old_leaf);
        LittleEndian::write_u32(&mut rec[OPR_NEW_LEAF..], INVALID_LEAF);
        self.oplog.persist(slot, 0, OP_RECORD_SIZE);
        LittleEndian::write_u32(&mut rec[OPR_STEP..], STEP_DURING_SPLIT);
        self.oplog.persist(slot, OPR_STEP, 4);
        slot
    }

    pub fn record_split_target(&self, slot: u32, new_leaf: u32) {
        let rec = self.record_bytes(slot);
        LittleEndian::write_u32(&mut rec[OPR_NEW_LEAF..], new_leaf);
        self.oplog.persist(slot, OPR_NEW_LEAF, 4);
    }

    pub fn mark_split_linked(&self, slot: u32) {
        let rec = self.record_bytes(slot);
        LittleEndian::write_u32(&mut rec[OPR_STEP..], STEP_FINISH_SPLIT);
        self.oplog.persist(slot, OPR_STEP, 4);
    }

    /// The split degenerated into an in-place shrink: no search-layer work.
    pub fn finish_op_in_place(&self, slot: u32) {
        let rec = self.record_bytes(slot);
        LittleEndian::write_u32(&mut rec[OPR_OP..], OP_DONE);
        self.oplog.persist(slot, OPR_OP, 4);
    }

    /// Stage and enqueue a leaf-removal record.
    pub fn emit_remove_op(&self, log: &ThreadLog, key: &IndexKey, old_leaf: u32) {
        let slot = log.alloc_slot();
        self.oplog.ensure(slot);
        let rec = self.record_bytes(slot);
        LittleEndian::write_u32(&mut rec[OPR_OP..], OP_REMOVE);
        LittleEndian::write_u32(&mut rec[OPR_STEP..], STEP_INITIAL);
        LittleEndian::write_u32(&mut rec[OPR_LAYERS..], self.all_groups_mask());
        LittleEndian::write_u64(
            &mut rec[OPR_SEQ..],
            self.seq.fetch_add(1, Ordering::Relaxed),
        );
        key.write(&mut rec[OPR_KEY..OPR_KEY + KEYBUF_SIZE]);
        LittleEndian::write_u32(&mut rec[OPR_OLD_LEAF..], old_leaf);
        self.oplog.persist(slot, 0, OPR_IMAGE);
        log.enqueue(slot);
    }

    pub fn enqueue_op(&self, log: &ThreadLog, slot: u32) {
        log.enqueue(slot);
    }

    // ── Data-plane entry points (delegate to the leaf list) ─────────

    pub fn insert(&self, log: &ThreadLog, key: &IndexKey, value: u64) {
        index_list::insert(self, log, key, value);
    }

    pub fn lookup(&self, log: &ThreadLog, key: &IndexKey) -> Option<u64> {
        index_list::lookup(self, log.group(), key)
    }

    pub fn scan(
        &self,
        log: &ThreadLog,
        start: &IndexKey,
        end: &IndexKey,
        max_range: usize,
        snapshot: LookupSnapshot,
    ) -> Vec<(IndexKey, u64)> {
        index_list::scan(self, log, start, end, max_range, snapshot)
    }

    // ── Background threads ──────────────────────────────────────────

    /// Spawn the combiner and one worker per group. Handles are joined by
    /// the engine at shutdown after [`Self::request_stop`].
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        {
            let mut rxs = self.receivers.lock();
            for group in 0..self.group_count {
                let rx = rxs[group as usize].take().expect("worker already spawned");
                let rt = self.clone();
                handles.push(
                    std::thread::Builder::new()
                        .name(format!("pmstore-idx-w{}", group))
                        .spawn(move || rt.worker_loop(group, rx))
                        .expect("spawn index worker"),
                );
            }
        }
        let rt = self.clone();
        handles.push(
            std::thread::Builder::new()
                .name("pmstore-idx-combine".into())
                .spawn(move || rt.combiner_loop())
                .expect("spawn index combiner"),
        );
        handles
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn combine_once(&self) -> Option<Batch> {
        let logs: Vec<Arc<ThreadLog>> = self.logs.lock().clone();
        let mut merged: Vec<u32> = Vec::new();
        for log in logs {
            merged.extend(log.drain());
        }
        if merged.is_empty() {
            return None;
        }
        merged.sort_by_key(|&slot| {
            LittleEndian::read_u64(unsafe { bytes_at(self.oplog.ptr(slot).add(OPR_SEQ), 8) })
        });
        Some(Arc::new(merged))
    }

    fn combiner_loop(&self) {
        log::debug!("index combiner running");
        loop {
            let stopping = self.stop.load(Ordering::Acquire);
            match self.combine_once() {
                Some(batch) => {
                    for tx in &self.senders {
                        if tx.send(batch.clone()).is_err() {
                            return;
                        }
                    }
                }
                None => {
                    if stopping {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_micros(100));
                }
            }
        }
        log::debug!("index combiner drained");
    }

    fn worker_loop(&self, group: u32, rx: Receiver<Batch>) {
        log::debug!("index worker for group {} running", group);
        let layer = self.layer(group).clone();
        loop {
            match rx.recv_timeout(std::time::Duration::from_millis(10)) {
                Ok(batch) => self.apply_batch(&layer, &batch),
                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::Acquire) && rx.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn apply_batch(&self, layer: &SearchLayer, batch: &[u32]) {
        for &slot in batch {
            let rec = self.record_bytes(slot);
            let op = LittleEndian::read_u32(&rec[OPR_OP..]);
            let key = IndexKey::read(&rec[OPR_KEY..]);
            match op {
                OP_INSERT => {
                    let new_leaf = LittleEndian::read_u32(&rec[OPR_NEW_LEAF..]);
                    layer.insert(key, new_leaf);
                }
                OP_REMOVE => {
                    let old_leaf = LittleEndian::read_u32(&rec[OPR_OLD_LEAF..]);
                    layer.remove(&key, old_leaf);
                }
                _ => continue,
            }
            let prev = self.op_layers(slot).fetch_sub(layer.mask(), Ordering::AcqRel);
            if prev == layer.mask() {
                LittleEndian::write_u32(&mut rec[OPR_OP..], OP_DONE);
                self.oplog.persist(slot, OPR_OP, 8);
            }
        }
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Replay every non-done oplog record into the search layers, restoring
    /// old images for splits that never finished linking. Runs single
    /// threaded before the workers start.
    fn recover(&self) {
        let mapped_slots =
            (self.oplog.file.slice_count() * INDEX_SLICE_LEN) / OP_RECORD_SIZE;
        let mut replayed = 0usize;
        for slot in 0..usize::min(mapped_slots, OplogRegion::capacity()) as u32 {
            let rec = self.record_bytes(slot);
            let op = LittleEndian::read_u32(&rec[OPR_OP..]);
            if op == OP_DUMMY || op == OP_DONE {
                continue;
            }
            replayed += 1;
            let key = IndexKey::read(&rec[OPR_KEY..]);
            match op {
                OP_INSERT => {
                    let step = LittleEndian::read_u32(&rec[OPR_STEP..]);
                    let old_leaf = LittleEndian::read_u32(&rec[OPR_OLD_LEAF..]);
                    let new_leaf = LittleEndian::read_u32(&rec[OPR_NEW_LEAF..]);
                    match step {
                        STEP_INITIAL => {}
                        STEP_DURING_SPLIT => {
                            // The split never linked its new leaf: the insert
                            // failed; put the old node back.
                            let leaf = Leaf::at(self, old_leaf);
                            let image = rec[OPR_IMAGE..OPR_IMAGE + LEAF_BLOCK_SIZE].to_vec();
                            leaf.restore_image(self, &image);
                        }
                        STEP_FINISH_SPLIT => {
                            if new_leaf != INVALID_LEAF && !Leaf::at(self, new_leaf).deleted() {
                                for layer in &self.layers {
                                    layer.insert(key, new_leaf);
                                }
                            }
                        }
                        s => panic!("corrupt oplog step {}", s),
                    }
                }
                OP_REMOVE => {
                    let old_leaf = LittleEndian::read_u32(&rec[OPR_OLD_LEAF..]);
                    for layer in &self.layers {
                        layer.remove(&key, old_leaf);
                    }
                }
                o => panic!("corrupt oplog op {}", o),
            }
            LittleEndian::write_u32(&mut rec[OPR_OP..], OP_DONE);
            self.oplog.persist(slot, OPR_OP, 4);
        }
        if replayed > 0 {
            log::info!("index recovery replayed {} oplog records", replayed);
        }
    }

    pub fn unmount(&self) {
        self.pool.unmount();
        self.oplog.file.unmount();
    }
}
