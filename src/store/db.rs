//! Engine lifecycle: init, bootstrap, recovery, and shutdown.
//!
//! [`Engine::init`] lays out a fresh store under the configured directory
//! set; [`Engine::bootstrap`] mounts an existing one and drives recovery:
//! remount the tablespace, scan every undo segment for the largest committed
//! CSN (resuming the counter past it), replay the index oplog into the
//! search layers, and hand the in-progress transactions found in the
//! recovery window to the recycler thread, which rolls them back before its
//! first sweep.
//!
//! Background threads — the undo recycler, the index combiner, and one index
//! worker per directory group — run against weak references (recycler) or
//! the shared index runtime (combiner/workers), and are stopped and joined
//! when the last engine handle drops.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};

use crate::store::config::DirSet;
use crate::store::constants::*;
use crate::store::index::NvmIndex;
use crate::store::index_key::{IndexColumnDesc, IndexSchema};
use crate::store::index_list;
use crate::store::index_log::IndexRuntime;
use crate::store::rowid_map::RowIdMap;
use crate::store::session::Session;
use crate::store::space::{ExtentSize, Tablespace};
use crate::store::table::Table;
use crate::store::trx::TrxManager;
use crate::store::tuple::TableSchema;
use crate::store::undo_record::rollback_record;
use crate::store::undo_segment::{TrxStatus, UndoSpace};
use crate::StoreError;

/// Name of the heap tablespace file family.
const SPACE_NAME: &str = "space";
/// Exclusive-lock file guarding a directory set against double mounts.
const LOCK_FILE: &str = ".pmstore.lock";

pub(crate) struct ThreadRegistry {
    group_sizes: Vec<u32>,
}

impl ThreadRegistry {
    fn register(&mut self) -> u32 {
        let mut min_group = 0usize;
        for (g, &n) in self.group_sizes.iter().enumerate() {
            if n < self.group_sizes[min_group] {
                min_group = g;
            }
        }
        self.group_sizes[min_group] += 1;
        min_group as u32
    }

    fn unregister(&mut self, group: u32) {
        self.group_sizes[group as usize] -= 1;
    }
}

/// Shared engine state. Public API lives on [`Engine`].
pub(crate) struct EngineInner {
    dirs: Arc<DirSet>,
    space: Arc<Tablespace>,
    undo: Arc<UndoSpace>,
    trx: TrxManager,
    index: Arc<IndexRuntime>,
    rowid_maps: RwLock<HashMap<PageNo, Arc<RowIdMap>>>,
    threads: Mutex<ThreadRegistry>,
}

impl EngineInner {
    pub(crate) fn trx(&self) -> &TrxManager {
        &self.trx
    }

    pub(crate) fn undo(&self) -> &UndoSpace {
        &self.undo
    }

    pub(crate) fn index_runtime(&self) -> &Arc<IndexRuntime> {
        &self.index
    }

    pub(crate) fn dir_count(&self) -> u32 {
        self.dirs.count()
    }

    pub(crate) fn register_thread(&self) -> u32 {
        self.threads.lock().register()
    }

    pub(crate) fn unregister_thread(&self, group: u32) {
        self.threads.lock().unregister(group);
    }

    /// The RowId map for a table segment, created on first use (rollback
    /// paths reach tables no session has opened yet).
    pub(crate) fn rowid_map_for(&self, seghead: PageNo, row_len: u32) -> Arc<RowIdMap> {
        if let Some(m) = self.rowid_maps.read().get(&seghead) {
            debug_assert_eq!(m.row_len(), row_len);
            return m.clone();
        }
        let mut maps = self.rowid_maps.write();
        maps.entry(seghead)
            .or_insert_with(|| Arc::new(RowIdMap::new(self.space.clone(), seghead, row_len)))
            .clone()
    }

    fn schema_path(&self, oid: u32) -> std::path::PathBuf {
        self.dirs.path(0).join(format!("table_{}.schema.json", oid))
    }

    /// Roll back every in-progress transaction left in the undo recovery
    /// windows. Runs on the recycler thread before its first sweep.
    fn run_undo_recovery(self: &Arc<Self>) {
        let log = self.index.register_thread_log(0);
        let mut cache = vec![0u8; UNDO_RECORD_CACHE_SIZE].into_boxed_slice();
        let mut rolled_back = 0usize;
        for seg in self.undo.segments() {
            let Some((start, end)) = seg.recovery_window() else {
                continue;
            };
            for slot in start..=end {
                let Some(info) = seg.get_trx_info(slot) else {
                    continue;
                };
                if info.status != TrxStatus::InProgress {
                    continue;
                }
                let mut ptr = seg.slot_end(slot);
                while ptr != 0 {
                    let rec = self.undo.copy_record(ptr, &mut cache);
                    rollback_record(self, &log, rec);
                    ptr = crate::store::undo_record::UndoRecHead::read(rec).prev;
                }
                seg.set_slot_status(slot, TrxStatus::RolledBack);
                rolled_back += 1;
            }
            seg.clear_recovery_window();
        }
        if rolled_back > 0 {
            log::info!("recovery rolled back {} in-flight transactions", rolled_back);
        }
    }
}

fn recycler_loop(engine: Weak<EngineInner>, stop: Arc<AtomicBool>, recover_first: bool) {
    if recover_first {
        if let Some(e) = engine.upgrade() {
            e.run_undo_recovery();
        }
    }
    log::debug!("undo recycler running");
    let mut horizon = MIN_CSN;
    while !stop.load(Ordering::Acquire) {
        let Some(e) = engine.upgrade() else { break };
        let min = e.trx.compute_min_snapshot();
        if min > horizon {
            horizon = min;
            e.undo.recycle_pass(horizon);
        }
        drop(e);
        std::thread::sleep(std::time::Duration::from_micros(100));
    }
    log::debug!("undo recycler stopped");
}

/// The storage engine handle.
///
/// Dropping the handle stops and joins the background threads, releases the
/// directory lock, and unmounts every slice file.
pub struct Engine {
    inner: Arc<EngineInner>,
    stop: Arc<AtomicBool>,
    bg: Mutex<Vec<JoinHandle<()>>>,
    _lock_file: File,
}

impl Engine {
    fn lock_dir(dirs: &Arc<DirSet>) -> Result<File, StoreError> {
        let path = dirs.path(0).join(LOCK_FILE);
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::Io(format!("cannot open {}: {}", path.display(), e)))?;
        f.try_lock_exclusive().map_err(|_| {
            StoreError::Config(format!(
                "store at {} is already in use",
                dirs.path(0).display()
            ))
        })?;
        Ok(f)
    }

    fn assemble(
        dirs: Arc<DirSet>,
        space: Tablespace,
        undo: Arc<UndoSpace>,
        index: IndexRuntime,
        lock_file: File,
        recover_first: bool,
    ) -> Engine {
        let group_count = dirs.count() as usize;
        let inner = Arc::new(EngineInner {
            dirs,
            space: Arc::new(space),
            undo,
            trx: TrxManager::new(),
            index: Arc::new(index),
            rowid_maps: RwLock::new(HashMap::new()),
            threads: Mutex::new(ThreadRegistry {
                group_sizes: vec![0; group_count],
            }),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let mut bg = inner.index.spawn_workers();
        {
            let weak = Arc::downgrade(&inner);
            let stop = stop.clone();
            bg.push(
                std::thread::Builder::new()
                    .name("pmstore-recycle".into())
                    .spawn(move || recycler_loop(weak, stop, recover_first))
                    .expect("spawn undo recycler"),
            );
        }
        Engine {
            inner,
            stop,
            bg: Mutex::new(bg),
            _lock_file: lock_file,
        }
    }

    /// Create a fresh store under a `;`-separated directory list. Existing
    /// contents of those directories are removed.
    pub fn init(dir_list: &str) -> Result<Engine, StoreError> {
        let dirs = Arc::new(DirSet::parse(dir_list)?);
        dirs.recreate_all()?;
        let lock_file = Self::lock_dir(&dirs)?;

        let space = Tablespace::new(dirs.clone(), SPACE_NAME);
        space.create()?;
        let undo = UndoSpace::create(&dirs)?;
        let undo = Arc::new(undo);
        let index = IndexRuntime::create(&dirs, undo.clone())?;
        index_list::init_list(&index);

        log::info!(
            "initialized store under {} directory shard(s)",
            dirs.count()
        );
        Ok(Self::assemble(dirs, space, undo, index, lock_file, false))
    }

    /// Mount an existing store and recover it.
    pub fn bootstrap(dir_list: &str) -> Result<Engine, StoreError> {
        let dirs = Arc::new(DirSet::parse(dir_list)?);
        dirs.check_all()?;
        let lock_file = Self::lock_dir(&dirs)?;

        let space = Tablespace::new(dirs.clone(), SPACE_NAME);
        space.mount()?;
        let (undo, max_csn) = UndoSpace::mount(&dirs)?;
        let undo = Arc::new(undo);
        let index = IndexRuntime::mount(&dirs, undo.clone())?;

        let engine = Self::assemble(dirs, space, undo, index, lock_file, true);
        engine.inner.trx.recover_csn(max_csn);
        log::info!(
            "bootstrapped store, commit counter resumes at {:#x}",
            engine.inner.trx.current_csn()
        );
        Ok(engine)
    }

    /// Register the calling thread and hand it a session.
    pub fn new_session(&self) -> Session {
        Session::new(self.inner.clone())
    }

    /// Create a table: allocate its segment, record it in the catalog, and
    /// persist the schema document.
    pub fn create_table(&self, oid: u32, schema: Arc<TableSchema>) -> Result<Table, StoreError> {
        if self.inner.space.search_table(oid).is_some() {
            return Err(StoreError::Config(format!("table {} already exists", oid)));
        }
        let seghead = self
            .inner
            .space
            .alloc_extent(ExtentSize::Ext8k, INVALID_PAGENO, 0);
        self.inner.space.create_table(oid, seghead);

        let path = self.inner.schema_path(oid);
        let f = File::create(&path)
            .map_err(|e| StoreError::Io(format!("cannot create {}: {}", path.display(), e)))?;
        serde_json::to_writer_pretty(f, schema.as_ref())
            .map_err(|e| StoreError::Io(format!("cannot persist schema: {}", e)))?;

        let map = self.inner.rowid_map_for(seghead, schema.row_len());
        Ok(Table::new(oid, seghead, schema, map))
    }

    /// Open a previously created table by oid.
    pub fn open_table(&self, oid: u32) -> Result<Table, StoreError> {
        let Some(seghead) = self.inner.space.search_table(oid) else {
            return Err(StoreError::Config(format!("table {} does not exist", oid)));
        };
        let path = self.inner.schema_path(oid);
        let f = File::open(&path)
            .map_err(|e| StoreError::Io(format!("cannot open {}: {}", path.display(), e)))?;
        let schema: TableSchema = serde_json::from_reader(f)
            .map_err(|e| StoreError::Corrupt(format!("schema document: {}", e)))?;
        let schema = Arc::new(schema);
        let map = self.inner.rowid_map_for(seghead, schema.row_len());
        Ok(Table::new(oid, seghead, schema, map))
    }

    /// Drop a table: free its segment and remove catalog and schema records.
    pub fn drop_table(&self, oid: u32) -> Result<(), StoreError> {
        let Some(seghead) = self.inner.space.search_table(oid) else {
            return Err(StoreError::Config(format!("table {} does not exist", oid)));
        };
        self.inner.rowid_maps.write().remove(&seghead);
        self.inner.space.drop_table(oid);
        self.inner.space.free_segment(seghead);
        let path = self.inner.schema_path(oid);
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("cannot remove {}: {}", path.display(), e);
        }
        Ok(())
    }

    /// Create an index handle over a table schema. Index ids partition the
    /// shared key space; reusing an id joins the existing entries.
    pub fn create_index(
        &self,
        index_id: u32,
        table_schema: &Arc<TableSchema>,
        cols: Vec<IndexColumnDesc>,
    ) -> NvmIndex {
        let schema = IndexSchema::new(table_schema.clone(), cols);
        NvmIndex::new(index_id, schema, self.inner.index.clone())
    }

    /// Engine-wide oldest-snapshot bound, as maintained by the recycler.
    pub fn min_snapshot(&self) -> u64 {
        self.inner.trx.min_snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.inner.index.request_stop();
        for h in self.bg.lock().drain(..) {
            let _ = h.join();
        }
        self.inner.index.unmount();
        self.inner.undo.unmount();
        self.inner.space.unmount();
        log::info!("engine shut down");
    }
}
