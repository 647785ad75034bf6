//! End-to-end index tests: range visibility, tombstones, rollback covers,
//! and concurrent insert/scan traffic across leaf splits.

use std::sync::Arc;

use tempfile::TempDir;

use pmstore::store::db::Engine;
use pmstore::store::heap::{heap_insert, heap_read};
use pmstore::store::index::{index_delete, index_insert, NvmIndex};
use pmstore::store::index_key::{IndexColumnDesc, IndexTuple};
use pmstore::store::table::Table;
use pmstore::store::tuple::{ColType, ColumnDesc, RamTuple, TableSchema};

fn schema() -> Arc<TableSchema> {
    TableSchema::new(vec![
        ColumnDesc::fixed("k", ColType::Int),
        ColumnDesc::fixed("v", ColType::Int),
    ])
}

fn setup() -> (TempDir, Engine, Table, NvmIndex) {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("pm0");
    let engine = Engine::init(&dir.display().to_string()).unwrap();
    let table = engine.create_table(1, schema()).unwrap();
    let index = engine.create_index(1, table.schema(), vec![IndexColumnDesc { col_id: 0 }]);
    (tmp, engine, table, index)
}

fn key_tuple(index: &NvmIndex, k: i32) -> IndexTuple {
    let mut t = IndexTuple::new(index.schema());
    t.set_col(0, &k.to_le_bytes());
    t
}

fn row(table: &Table, k: i32, v: i32) -> RamTuple {
    let mut t = RamTuple::new(table.schema());
    t.set_col(0, &k.to_le_bytes());
    t.set_col(1, &v.to_le_bytes());
    t
}

/// Collect the RowIds of `[lo, hi]` (end-inclusive) at the session snapshot.
fn scan_rowids(
    s: &mut pmstore::store::session::Session,
    index: &NvmIndex,
    lo: i32,
    hi: i32,
) -> Vec<u32> {
    let begin = key_tuple(index, lo);
    let end = key_tuple(index, hi);
    index
        .generate_iter(s, &begin, &end, 0, false)
        .map(|(_key, rowid)| rowid)
        .collect()
}

#[test]
fn test_range_scan_visibility() {
    let (_tmp, engine, table, index) = setup();
    let mut s = engine.new_session();

    // Insert k0..k9, each indexed under its own RowId.
    let mut rowids = Vec::new();
    s.begin();
    for k in 0..10 {
        let rowid = heap_insert(&mut s, &table, &mut row(&table, k, k)).unwrap();
        index_insert(&mut s, &index, &key_tuple(&index, k), rowid);
        rowids.push(rowid);
    }
    s.commit();

    // Scan [k2, k7) == [k2, k6] yields exactly five entries, in order.
    s.begin();
    let got = scan_rowids(&mut s, &index, 2, 6);
    assert_eq!(got, rowids[2..=6].to_vec());
    s.commit();

    // Reader from before the delete still sees k4.
    let mut old_reader = engine.new_session();
    old_reader.begin();

    s.begin();
    index_delete(&mut s, &index, &key_tuple(&index, 4), rowids[4]);
    s.commit();

    let got = scan_rowids(&mut old_reader, &index, 2, 6);
    assert_eq!(got, rowids[2..=6].to_vec());
    old_reader.commit();

    // Reader from after does not.
    s.begin();
    let got = scan_rowids(&mut s, &index, 2, 6);
    let expect: Vec<u32> = rowids[2..=6]
        .iter()
        .copied()
        .filter(|&r| r != rowids[4])
        .collect();
    assert_eq!(got, expect);
    s.commit();
}

#[test]
fn test_same_transaction_reads_own_insert() {
    let (_tmp, engine, table, index) = setup();
    let mut s = engine.new_session();

    s.begin();
    let rowid = heap_insert(&mut s, &table, &mut row(&table, 77, 0)).unwrap();
    index_insert(&mut s, &index, &key_tuple(&index, 77), rowid);
    let got = scan_rowids(&mut s, &index, 77, 77);
    assert_eq!(got, vec![rowid]);
    s.commit();
}

#[test]
fn test_insert_rollback_hides_entry() {
    let (_tmp, engine, table, index) = setup();
    let mut s = engine.new_session();

    s.begin();
    let rowid = heap_insert(&mut s, &table, &mut row(&table, 5, 5)).unwrap();
    index_insert(&mut s, &index, &key_tuple(&index, 5), rowid);
    s.abort();

    // The rollback writes a cover CSN rather than removing the entry, so
    // readers that could already see the key keep their view; anything the
    // index still surfaces is filtered by the heap, whose row is unused.
    s.begin();
    let visible: Vec<u32> = scan_rowids(&mut s, &index, 5, 5)
        .into_iter()
        .filter(|&r| {
            let mut out = RamTuple::new(table.schema());
            heap_read(&mut s, &table, r, &mut out).is_ok()
        })
        .collect();
    assert!(visible.is_empty());
    s.commit();

    // Once later commits push the snapshot past the cover CSN, the entry
    // disappears from the index itself.
    s.begin();
    let r2 = heap_insert(&mut s, &table, &mut row(&table, 500, 0)).unwrap();
    index_insert(&mut s, &index, &key_tuple(&index, 500), r2);
    s.commit();
    s.begin();
    assert!(scan_rowids(&mut s, &index, 5, 5).is_empty());
    s.commit();
}

#[test]
fn test_delete_rollback_revives_entry() {
    let (_tmp, engine, table, index) = setup();
    let mut s = engine.new_session();

    s.begin();
    let rowid = heap_insert(&mut s, &table, &mut row(&table, 6, 6)).unwrap();
    index_insert(&mut s, &index, &key_tuple(&index, 6), rowid);
    s.commit();

    s.begin();
    index_delete(&mut s, &index, &key_tuple(&index, 6), rowid);
    s.abort();

    s.begin();
    assert_eq!(scan_rowids(&mut s, &index, 6, 6), vec![rowid]);
    s.commit();
}

#[test]
fn test_scan_spans_leaf_splits() {
    let (_tmp, engine, table, index) = setup();
    let mut s = engine.new_session();

    // Far more keys than one leaf holds, inserted out of order.
    let n = 1000;
    let mut rowids = vec![0u32; n as usize];
    s.begin();
    for k in (0..n).rev() {
        let rowid = heap_insert(&mut s, &table, &mut row(&table, k, k)).unwrap();
        index_insert(&mut s, &index, &key_tuple(&index, k), rowid);
        rowids[k as usize] = rowid;
    }
    s.commit();

    s.begin();
    let got = scan_rowids(&mut s, &index, 0, n - 1);
    assert_eq!(got, rowids);
    // Bounded scan returns a prefix.
    let bounded = key_tuple(&index, 0);
    let hi = key_tuple(&index, n - 1);
    let few: Vec<_> = index.generate_iter(&mut s, &bounded, &hi, 10, false).collect();
    assert_eq!(few.len(), 10);
    s.commit();
}

#[test]
fn test_index_joins_heap_reads() {
    let (_tmp, engine, table, index) = setup();
    let mut s = engine.new_session();

    s.begin();
    for k in 0..10 {
        let rowid = heap_insert(&mut s, &table, &mut row(&table, k, k + 1)).unwrap();
        index_insert(&mut s, &index, &key_tuple(&index, k), rowid);
    }
    s.commit();

    s.begin();
    let rowids = scan_rowids(&mut s, &index, 0, 9);
    assert_eq!(rowids.len(), 10);
    for (k, rowid) in rowids.into_iter().enumerate() {
        let mut out = RamTuple::new(table.schema());
        heap_read(&mut s, &table, rowid, &mut out).unwrap();
        assert!(out.col_eq(0, &(k as i32).to_le_bytes()));
        assert!(out.col_eq(1, &(k as i32 + 1).to_le_bytes()));
    }
    s.commit();
}

#[test]
fn test_concurrent_insert_and_scan() {
    let (_tmp, engine, table, index) = setup();
    let engine = Arc::new(engine);
    let table = Arc::new(table);
    let index = Arc::new(index);

    const WORKERS: i32 = 4;
    const PER_WORKER: i32 = 250;

    let mut handles = Vec::new();
    for w in 0..WORKERS {
        let engine = engine.clone();
        let table = table.clone();
        let index = index.clone();
        handles.push(std::thread::spawn(move || {
            use rand::seq::SliceRandom;
            let mut s = engine.new_session();
            let base = w * PER_WORKER;
            let mut keys: Vec<i32> = (base..base + PER_WORKER).collect();
            keys.shuffle(&mut rand::thread_rng());
            for k in keys {
                s.begin();
                let rowid = heap_insert(&mut s, &table, &mut row(&table, k, k)).unwrap();
                index_insert(&mut s, &index, &key_tuple(&index, k), rowid);
                s.commit();
            }
            // Every worker's own range must be fully scannable.
            s.begin();
            let got = scan_rowids(&mut s, &index, base, base + PER_WORKER - 1);
            assert_eq!(got.len(), PER_WORKER as usize);
            s.commit();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut s = engine.new_session();
    s.begin();
    let all = scan_rowids(&mut s, &index, 0, WORKERS * PER_WORKER - 1);
    assert_eq!(all.len(), (WORKERS * PER_WORKER) as usize);
    s.commit();
}
