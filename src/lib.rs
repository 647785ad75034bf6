//! Persistent-memory MVCC row store with a concurrent ordered index.
//!
//! The `pmem-store` crate (library name `pmstore`) implements a transactional
//! storage engine whose rows live in byte-addressable persistent memory.
//! Durability comes from ordered flushes of memory-mapped slice files rather
//! than a redo log; multi-version concurrency control is provided by an undo
//! subsystem and commit sequence numbers (CSNs).
//!
//! # Quick example
//!
//! ```no_run
//! use pmstore::store::db::Engine;
//! use pmstore::store::heap::{heap_insert, heap_read};
//! use pmstore::store::tuple::{ColType, ColumnDesc, RamTuple, TableSchema};
//!
//! let engine = Engine::init("/mnt/pmem0;/mnt/pmem1").unwrap();
//! let schema = TableSchema::new(vec![
//!     ColumnDesc::fixed("id", ColType::Int),
//!     ColumnDesc::fixed("balance", ColType::Long),
//! ]);
//! let table = engine.create_table(1, schema).unwrap();
//!
//! let mut session = engine.new_session();
//! session.begin();
//! let mut row = RamTuple::new(table.schema());
//! row.set_col(0, &1i32.to_le_bytes());
//! row.set_col(1, &100i64.to_le_bytes());
//! let rowid = heap_insert(&mut session, &table, &mut row).unwrap();
//! session.commit();
//!
//! session.begin();
//! let mut out = RamTuple::new(table.schema());
//! heap_read(&mut session, &table, rowid, &mut out).unwrap();
//! session.commit();
//! ```
//!
//! # Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store::logic_file`] | Directory-striped PMEM slice files, page-number to address translation |
//! | [`store::space`] | Tablespace: extents, free lists, high-water marks, table catalog |
//! | [`store::page_list`] | Page-resident doubly-linked page lists |
//! | [`store::bitmap`] | Lock-free bitmap allocator for vector-store leaf groups |
//! | [`store::tuple`] | Column schemas, tuple head/body codec, column-level update deltas |
//! | [`store::vecstore`] | RowId → tuple-slot page table with thread-local RowId ranges |
//! | [`store::rowid_map`] | Per-row latch and DRAM cache fronting the NVM tuple |
//! | [`store::undo_record`] | Undo record codec and rollback routines |
//! | [`store::undo_segment`] | Transaction-slot rings, undo arenas, the background recycler |
//! | [`store::trx`] | Proc-array snapshots and the CSN counter |
//! | [`store::heap`] | Transactional heap insert/read/update/delete |
//! | [`store::index_key`] | Order-preserving index key encoding |
//! | [`store::index_pool`] | PMEM leaf-block pool for the ordered index |
//! | [`store::index_leaf`] | Index leaf nodes: double-perm publication, split, prune |
//! | [`store::index_list`] | The leaf linked list: locking walks, ordered scans |
//! | [`store::index_log`] | Oplog, combiner/worker threads, the jump search layer |
//! | [`store::index`] | Transactional index access and range iterators |
//! | [`store::session`] | Per-thread session state: snapshots, undo binding, caches |
//! | [`store::table`] | Table objects and persisted schemas |
//! | [`store::db`] | Engine lifecycle: init, bootstrap, recovery, shutdown |
//!
//! # Error model
//!
//! Two kinds of failure are kept strictly apart:
//!
//! * [`StoreError`] — lifecycle and configuration failures (bad directory
//!   list, failed map, corrupt catalog) surfaced from `Engine` entry points.
//! * [`HeapError`] — the five non-success outcomes of heap operations that a
//!   transaction is expected to handle by retrying or aborting.
//!
//! Everything else is an engine invariant; a violated invariant panics.

pub mod store;
pub mod util;

use thiserror::Error;

/// Errors returned by engine lifecycle and configuration operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An I/O error (file create, map, lock, or remove failure).
    #[error("I/O error: {0}")]
    Io(String),

    /// Persistent state failed validation (bad catalog, truncated slice).
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// An invalid configuration value (directory list, table definition).
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Non-success outcomes of heap operations.
///
/// These are the only error conditions a caller is expected to handle; they
/// map one-to-one onto the engine's public outcome codes. Success is the `Ok`
/// arm of the surrounding `Result`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The RowId has never been used (or its insert was rolled back).
    #[error("row not used")]
    RowNotUsed,

    /// No version of the row is visible to the caller's snapshot.
    #[error("no visible version")]
    NoVisibleVersion,

    /// Another transaction updated the row first; the caller must abort.
    #[error("update conflict")]
    UpdateConflict,

    /// The visible version of the row is deleted.
    #[error("row deleted")]
    RowDeleted,

    /// The transaction is marked for abort; only `Session::abort` is allowed.
    #[error("transaction must abort")]
    WaitAbort,
}
