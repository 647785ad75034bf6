//! Undo subsystem end-to-end: rollback chains across operations and tables,
//! recycler horizon behavior, and write sets spanning many records.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use pmstore::store::db::Engine;
use pmstore::store::heap::{heap_delete, heap_insert, heap_read, heap_update};
use pmstore::store::table::Table;
use pmstore::store::tuple::{ColType, ColumnDesc, RamTuple, TableSchema};
use pmstore::HeapError;

fn schema() -> Arc<TableSchema> {
    TableSchema::new(vec![
        ColumnDesc::fixed("id", ColType::Int),
        ColumnDesc::var("payload", ColType::Char, 64),
    ])
}

fn setup() -> (TempDir, Engine, Table) {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("pm0");
    let engine = Engine::init(&dir.display().to_string()).unwrap();
    let table = engine.create_table(1, schema()).unwrap();
    (tmp, engine, table)
}

fn row(table: &Table, id: i32, fill: u8) -> RamTuple {
    let mut t = RamTuple::new(table.schema());
    t.set_col(0, &id.to_le_bytes());
    t.set_col(1, &[fill; 64]);
    t
}

#[test]
fn test_mixed_rollback_chain() {
    let (_tmp, engine, table) = setup();
    let mut s = engine.new_session();

    s.begin();
    let keep = heap_insert(&mut s, &table, &mut row(&table, 1, 0xAA)).unwrap();
    let doomed = heap_insert(&mut s, &table, &mut row(&table, 2, 0xBB)).unwrap();
    s.commit();

    // One transaction that inserts, updates, and deletes; all three record
    // kinds sit on one undo chain and must unwind in reverse order.
    s.begin();
    let fresh = heap_insert(&mut s, &table, &mut row(&table, 3, 0xCC)).unwrap();
    let mut t = row(&table, 1, 0xAA);
    t.update_col(1, &[0xAD; 64]);
    heap_update(&mut s, &table, keep, &mut t).unwrap();
    heap_delete(&mut s, &table, doomed).unwrap();
    s.abort();

    s.begin();
    let mut out = RamTuple::new(table.schema());
    heap_read(&mut s, &table, keep, &mut out).unwrap();
    assert!(out.col_eq(1, &[0xAA; 64]));
    heap_read(&mut s, &table, doomed, &mut out).unwrap();
    assert!(out.col_eq(1, &[0xBB; 64]));
    assert_eq!(
        heap_read(&mut s, &table, fresh, &mut out),
        Err(HeapError::RowNotUsed)
    );
    s.commit();
}

#[test]
fn test_many_updates_one_transaction() {
    let (_tmp, engine, table) = setup();
    let mut s = engine.new_session();

    s.begin();
    let rowid = heap_insert(&mut s, &table, &mut row(&table, 1, 0)).unwrap();
    s.commit();

    // A long chain through the record arena; the reader must walk it all
    // the way back.
    let mut reader = engine.new_session();
    reader.begin();

    s.begin();
    for i in 1..=100u8 {
        let mut t = row(&table, 1, 0);
        t.update_col(1, &[i; 64]);
        heap_update(&mut s, &table, rowid, &mut t).unwrap();
    }
    s.commit();

    let mut out = RamTuple::new(table.schema());
    heap_read(&mut reader, &table, rowid, &mut out).unwrap();
    assert!(out.col_eq(1, &[0u8; 64]), "old snapshot must see version 0");
    reader.commit();

    reader.begin();
    heap_read(&mut reader, &table, rowid, &mut out).unwrap();
    assert!(out.col_eq(1, &[100u8; 64]));
    reader.commit();
}

#[test]
fn test_recycler_advances_horizon() {
    let (_tmp, engine, table) = setup();
    let mut s = engine.new_session();

    for i in 0..20 {
        s.begin();
        heap_insert(&mut s, &table, &mut row(&table, i, i as u8)).unwrap();
        s.commit();
    }
    let committed = s.csn();

    // With no transaction open, the recycler must push the published
    // horizon past every commit above.
    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.min_snapshot() <= committed {
        assert!(
            Instant::now() < deadline,
            "recycler never advanced the horizon past {:#x}",
            committed
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_open_snapshot_holds_horizon() {
    let (_tmp, engine, table) = setup();
    let mut s = engine.new_session();

    s.begin();
    heap_insert(&mut s, &table, &mut row(&table, 1, 1)).unwrap();
    s.commit();

    let mut reader = engine.new_session();
    reader.begin();
    let pinned = reader.snapshot();

    for i in 2..12 {
        s.begin();
        heap_insert(&mut s, &table, &mut row(&table, i, i as u8)).unwrap();
        s.commit();
    }

    // Give the recycler time to run; the open snapshot must pin the bound.
    std::thread::sleep(Duration::from_millis(50));
    assert!(engine.min_snapshot() <= pinned);
    reader.commit();
}

#[test]
fn test_abort_without_writes_is_a_noop() {
    let (_tmp, engine, table) = setup();
    let mut s = engine.new_session();

    s.begin();
    s.abort();

    s.begin();
    let rowid = heap_insert(&mut s, &table, &mut row(&table, 1, 7)).unwrap();
    s.commit();

    s.begin();
    let mut out = RamTuple::new(table.schema());
    heap_read(&mut s, &table, rowid, &mut out).unwrap();
    assert!(out.col_eq(1, &[7u8; 64]));
    s.commit();
}
