//! Heap access: transactional insert, read, update, and delete.
//!
//! Every operation first short-circuits a doomed transaction, then
//! interlocks the row latch, the undo append, and visibility arbitration:
//!
//! * insert allocates a RowId, logs its undo, then stamps the slot USED
//!   under the latch;
//! * read walks the version chain from the latched DRAM copy backwards
//!   through the undo arena until a visible version appears;
//! * update/delete arbitrate with `satisfied_update`, log the old image (a
//!   column delta for updates, the full body for deletes), and mutate the
//!   NVM tuple in place.
//!
//! Conflicts doom the transaction (`WaitAbort`): the caller's only remaining
//! move is `Session::abort`.

use crate::store::constants::*;
use crate::store::session::Session;
use crate::store::table::Table;
use crate::store::trx::TmResult;
use crate::store::tuple::{RamTuple, TupleHead};
use crate::store::undo_record::{
    prepare_delete_undo, prepare_insert_undo, prepare_update_undo,
};
use crate::HeapError;

/// Upper bound of RowIds the table's allocated leaves can hold; full-table
/// scans probe `0..heap_upper_row_id`.
pub fn heap_upper_row_id(table: &Table) -> RowId {
    table.rowid_map().upper_row_id()
}

/// Insert a new row; returns its RowId.
pub fn heap_insert(
    s: &mut Session,
    table: &Table,
    tuple: &mut RamTuple,
) -> Result<RowId, HeapError> {
    debug_assert_eq!(tuple.row_len(), table.row_len());
    if s.in_wait_abort() {
        return Err(HeapError::WaitAbort);
    }
    s.prepare_undo();

    let map = table.rowid_map();
    let group = s.group();
    let rowid = map.insert_version(s.table_cache(table.seghead()), group);

    prepare_insert_undo(s, table.seghead(), rowid, tuple.row_len() as u16);

    let entry = map.entry(rowid, false).expect("fresh RowId must resolve");
    let guard = entry.lock(map.tuple_len());
    tuple.init_head(s.trx_slot_ptr(), 0, TUPLE_USED);
    tuple.serialize(guard.nvm_bytes());
    map.persist_slot(rowid);
    guard.sync_cache();
    drop(guard);

    s.push_write_set(table.seghead(), rowid);
    Ok(rowid)
}

/// Read the version of `rowid` visible to the session's snapshot into
/// `tuple`.
pub fn heap_read(
    s: &mut Session,
    table: &Table,
    rowid: RowId,
    tuple: &mut RamTuple,
) -> Result<(), HeapError> {
    debug_assert_eq!(tuple.row_len(), table.row_len());
    if s.in_wait_abort() {
        return Err(HeapError::WaitAbort);
    }

    let map = table.rowid_map();
    let Some(entry) = map.entry(rowid, true) else {
        return Err(HeapError::RowNotUsed);
    };
    let guard = entry.lock(map.tuple_len());
    tuple.deserialize(guard.read_cache());
    if !tuple.is_used() {
        return Err(HeapError::RowNotUsed);
    }
    loop {
        match s.version_is_visible(&tuple.head) {
            TmResult::Ok | TmResult::SelfUpdated => {
                return if tuple.is_deleted() {
                    Err(HeapError::RowDeleted)
                } else {
                    Ok(())
                };
            }
            TmResult::Invisible | TmResult::Aborted | TmResult::BeingModified => {
                if tuple.has_prev_version() {
                    s.fetch_prev_version(tuple);
                } else {
                    return Err(HeapError::NoVisibleVersion);
                }
            }
        }
    }
}

/// Update the columns recorded by `RamTuple::update_col` in place.
pub fn heap_update(
    s: &mut Session,
    table: &Table,
    rowid: RowId,
    tuple: &mut RamTuple,
) -> Result<(), HeapError> {
    debug_assert_eq!(tuple.row_len(), table.row_len());
    if s.in_wait_abort() {
        return Err(HeapError::WaitAbort);
    }
    s.prepare_undo();

    let map = table.rowid_map();
    let entry = map.entry(rowid, false).expect("update of unallocated row");
    let guard = entry.lock(map.tuple_len());
    let old_head = TupleHead::read(guard.nvm_bytes());

    match s.satisfied_update(&old_head) {
        TmResult::BeingModified => {
            drop(guard);
            s.wait_abort();
            Err(HeapError::UpdateConflict)
        }
        TmResult::Ok => {
            if old_head.is_deleted() {
                // A visible delete: updating a dead row is a caller error.
                drop(guard);
                s.wait_abort();
                return Err(HeapError::RowDeleted);
            }
            let undo_ptr = {
                let nvm = guard.nvm_bytes();
                let (updated, update_len) = tuple.updated_cols();
                let (updated, update_len) = (updated.to_vec(), update_len);
                prepare_update_undo(
                    s,
                    table.seghead(),
                    rowid,
                    &old_head,
                    &nvm[TUPLE_HEAD_SIZE..],
                    &updated,
                    update_len,
                )
            };
            tuple.init_head(s.trx_slot_ptr(), undo_ptr, old_head.flag1);
            tuple.serialize(guard.nvm_bytes());
            map.persist_slot(rowid);
            guard.sync_cache();
            drop(guard);

            tuple.clear_updates();
            s.push_write_set(table.seghead(), rowid);
            Ok(())
        }
        r => unreachable!("satisfied_update returned {:?}", r),
    }
}

/// Delete the row: the old image goes to undo, the in-place head gains the
/// DELETED flag and points at the deleting transaction.
pub fn heap_delete(s: &mut Session, table: &Table, rowid: RowId) -> Result<(), HeapError> {
    if s.in_wait_abort() {
        return Err(HeapError::WaitAbort);
    }
    s.prepare_undo();

    let map = table.rowid_map();
    let entry = map.entry(rowid, false).expect("delete of unallocated row");
    let guard = entry.lock(map.tuple_len());
    let old_head = TupleHead::read(guard.nvm_bytes());

    match s.satisfied_update(&old_head) {
        TmResult::BeingModified => {
            drop(guard);
            s.wait_abort();
            Err(HeapError::UpdateConflict)
        }
        TmResult::Ok => {
            if old_head.is_deleted() {
                drop(guard);
                s.wait_abort();
                return Err(HeapError::RowDeleted);
            }
            let undo_ptr = {
                let nvm = guard.nvm_bytes();
                prepare_delete_undo(
                    s,
                    table.seghead(),
                    rowid,
                    &old_head,
                    &nvm[TUPLE_HEAD_SIZE..],
                )
            };
            let mut new_head = old_head;
            new_head.flag1 |= TUPLE_DELETED;
            new_head.trx_info = s.trx_slot_ptr();
            new_head.prev = undo_ptr;
            new_head.write(guard.nvm_bytes());
            map.persist_slot(rowid);
            guard.sync_cache_head();
            drop(guard);

            s.push_write_set(table.seghead(), rowid);
            Ok(())
        }
        r => unreachable!("satisfied_update returned {:?}", r),
    }
}
