//! Transactional index access.
//!
//! The ordered map itself only stores keys and 64-bit values; it cannot judge
//! visibility. This layer encodes keys, writes the undo records that make
//! index mutations transactional, and filters range scans through the MVCC
//! value policy:
//!
//! * insert writes the live marker (`INVALID_CSN`) and logs an
//!   `IndexInsert` undo whose rollback covers the entry with the inserting
//!   transaction's snapshot CSN (never a physical delete);
//! * delete writes the deleting transaction's slot pointer as a tombstone
//!   and logs an `IndexDelete` undo whose rollback re-marks the entry live;
//! * readers resolve tombstone slot pointers to commit CSNs in place and
//!   compare them against their snapshot.
//!
//! The RowId travels in the key's uniquifying suffix, so iterators decode it
//! from the key rather than the value.

use std::sync::Arc;

use crate::store::constants::*;
use crate::store::index_key::{
    decode_rowid, encode_key, IndexKey, IndexSchema, IndexTuple,
};
use crate::store::index_log::IndexRuntime;
use crate::store::session::Session;
use crate::store::undo_record::{prepare_index_delete_undo, prepare_index_insert_undo};

/// One ordered secondary index.
pub struct NvmIndex {
    id: u32,
    schema: IndexSchema,
    rt: Arc<IndexRuntime>,
}

impl NvmIndex {
    pub(crate) fn new(id: u32, schema: IndexSchema, rt: Arc<IndexRuntime>) -> NvmIndex {
        NvmIndex { id, schema, rt }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    /// Encode `(tuple, rowid)` into this index's key space.
    pub fn encode(&self, tuple: &IndexTuple, rowid: RowId) -> IndexKey {
        encode_key(&self.schema, self.id, tuple, rowid)
    }

    /// Raw stored value for an exact `(tuple, rowid)` entry, if any. The
    /// value is the MVCC marker word, not the RowId.
    pub fn lookup(&self, s: &Session, tuple: &IndexTuple, rowid: RowId) -> Option<u64> {
        let key = self.encode(tuple, rowid);
        self.rt.lookup(s.thread_log(), &key)
    }

    /// Range scan `[begin, end]` (both bounds over column values, end
    /// inclusive) at the session's snapshot. `max` of zero means unbounded;
    /// `reverse` scans are not supported.
    pub fn generate_iter(
        &self,
        s: &mut Session,
        begin: &IndexTuple,
        end: &IndexTuple,
        max: usize,
        reverse: bool,
    ) -> IndexIter {
        assert!(!reverse, "reverse index scans are not supported");
        let begin_key = self.encode(begin, 0);
        // RowId::MAX never names a real row, so this bound is inclusive of
        // every entry carrying the end tuple's column values.
        let end_key = self.encode(end, INVALID_ROWID);
        let max_range = if max == 0 { usize::MAX } else { max };
        let snapshot = s.lookup_snapshot();
        let items = self
            .rt
            .scan(s.thread_log(), &begin_key, &end_key, max_range, snapshot)
            .into_iter()
            .map(|(key, _value)| {
                let rowid = decode_rowid(&key);
                (key, rowid)
            })
            .collect();
        IndexIter { items, pos: 0 }
    }
}

/// Insert `(tuple, rowid)` into the index under the session's transaction.
pub fn index_insert(s: &mut Session, index: &NvmIndex, tuple: &IndexTuple, rowid: RowId) {
    s.prepare_undo();
    let key = index.encode(tuple, rowid);
    let cover_csn = s.snapshot();
    prepare_index_insert_undo(s, &key, cover_csn);
    index.rt.insert(s.thread_log(), &key, INVALID_CSN);
}

/// Delete `(tuple, rowid)` from the index under the session's transaction:
/// the entry is tombstoned with the transaction's slot pointer and resolved
/// to the commit CSN by later readers.
pub fn index_delete(s: &mut Session, index: &NvmIndex, tuple: &IndexTuple, rowid: RowId) {
    s.prepare_undo();
    let key = index.encode(tuple, rowid);
    prepare_index_delete_undo(s, &key);
    index.rt.insert(s.thread_log(), &key, s.trx_slot_ptr());
}

/// Materialized result of a range scan.
pub struct IndexIter {
    items: Vec<(IndexKey, RowId)>,
    pos: usize,
}

impl IndexIter {
    /// Whether the cursor stands on an entry.
    pub fn valid(&self) -> bool {
        self.pos < self.items.len()
    }

    /// RowId under the cursor.
    pub fn curr(&self) -> RowId {
        self.items[self.pos].1
    }

    pub fn key(&self) -> &IndexKey {
        &self.items[self.pos].0
    }

    pub fn advance(&mut self) {
        self.pos += 1;
    }
}

impl Iterator for IndexIter {
    type Item = (IndexKey, RowId);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.valid() {
            return None;
        }
        let item = self.items[self.pos];
        self.pos += 1;
        Some(item)
    }
}
