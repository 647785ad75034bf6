//! Crash and restart: committed data survives, in-flight transactions are
//! rolled back by the bootstrap recovery pass, and the CSN counter resumes
//! past the largest committed CSN.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use pmstore::store::db::Engine;
use pmstore::store::heap::{heap_insert, heap_read};
use pmstore::store::index::{index_insert, NvmIndex};
use pmstore::store::index_key::{IndexColumnDesc, IndexTuple};
use pmstore::store::session::Session;
use pmstore::store::table::Table;
use pmstore::store::tuple::{ColType, ColumnDesc, RamTuple, TableSchema};
use pmstore::HeapError;

fn schema() -> Arc<TableSchema> {
    TableSchema::new(vec![ColumnDesc::fixed("k", ColType::Int)])
}

fn key_tuple(index: &NvmIndex, k: i32) -> IndexTuple {
    let mut t = IndexTuple::new(index.schema());
    t.set_col(0, &k.to_le_bytes());
    t
}

fn row(table: &Table, k: i32) -> RamTuple {
    let mut t = RamTuple::new(table.schema());
    t.set_col(0, &k.to_le_bytes());
    t
}

/// RowIds in `[lo, hi]` whose heap row is visible to the session.
fn visible_rowids(
    s: &mut Session,
    table: &Table,
    index: &NvmIndex,
    lo: i32,
    hi: i32,
) -> Vec<u32> {
    let begin = key_tuple(index, lo);
    let end = key_tuple(index, hi);
    let rowids: Vec<u32> = index
        .generate_iter(s, &begin, &end, 0, false)
        .map(|(_k, rowid)| rowid)
        .collect();
    rowids
        .into_iter()
        .filter(|&r| {
            let mut out = RamTuple::new(table.schema());
            heap_read(s, table, r, &mut out).is_ok()
        })
        .collect()
}

#[test]
fn test_crash_discards_uncommitted_insert() {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("pm0").display().to_string();

    let committed;
    let crashed_rowid;
    {
        let engine = Engine::init(&dir).unwrap();
        let table = engine.create_table(1, schema()).unwrap();
        let index =
            engine.create_index(1, table.schema(), vec![IndexColumnDesc { col_id: 0 }]);

        let mut s = engine.new_session();
        s.begin();
        let mut rowids = Vec::new();
        for k in 0..10 {
            let rowid = heap_insert(&mut s, &table, &mut row(&table, k)).unwrap();
            index_insert(&mut s, &index, &key_tuple(&index, k), rowid);
            rowids.push(rowid);
        }
        s.commit();
        committed = rowids;

        // k10 never commits: simulate a crash by leaking the session so the
        // transaction is neither committed nor rolled back.
        s.begin();
        crashed_rowid = heap_insert(&mut s, &table, &mut row(&table, 10)).unwrap();
        index_insert(&mut s, &index, &key_tuple(&index, 10), crashed_rowid);
        std::mem::forget(s);
        drop(index);
        drop(table);
    }

    let engine = Engine::bootstrap(&dir).unwrap();
    let table = engine.open_table(1).unwrap();
    let index = engine.create_index(1, table.schema(), vec![IndexColumnDesc { col_id: 0 }]);

    // The bootstrap recovery pass runs on the recycler thread; give it a
    // moment to roll the in-flight transaction back.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut s = engine.new_session();
    loop {
        s.begin();
        let mut out = RamTuple::new(table.schema());
        let gone = heap_read(&mut s, &table, crashed_rowid, &mut out)
            == Err(HeapError::RowNotUsed);
        s.commit();
        if gone {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "in-flight transaction was not rolled back"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    // Scan [k0, k10]: exactly the ten committed rows remain.
    s.begin();
    let visible = visible_rowids(&mut s, &table, &index, 0, 10);
    assert_eq!(visible, committed);
    s.commit();
}

#[test]
fn test_csn_counter_resumes_past_committed() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("pm0").display().to_string();

    let commits = 25;
    {
        let engine = Engine::init(&dir).unwrap();
        let table = engine.create_table(1, schema()).unwrap();
        let mut s = engine.new_session();
        for k in 0..commits {
            s.begin();
            heap_insert(&mut s, &table, &mut row(&table, k)).unwrap();
            s.commit();
        }
        let csn_before = s.csn();
        drop(s);
        drop(table);
        drop(engine);

        let engine = Engine::bootstrap(&dir).unwrap();
        let table = engine.open_table(1).unwrap();
        let mut s = engine.new_session();
        s.begin();
        heap_insert(&mut s, &table, &mut row(&table, 999)).unwrap();
        s.commit();
        assert!(
            s.csn() > csn_before,
            "post-restart CSN {:#x} must exceed pre-restart {:#x}",
            s.csn(),
            csn_before
        );
    }
}

#[test]
fn test_double_bootstrap_is_rejected_while_mounted() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("pm0").display().to_string();
    let engine = Engine::init(&dir).unwrap();
    assert!(Engine::bootstrap(&dir).is_err());
    drop(engine);
    assert!(Engine::bootstrap(&dir).is_ok());
}

#[test]
fn test_catalog_and_schema_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("pm0").display().to_string();
    {
        let engine = Engine::init(&dir).unwrap();
        engine.create_table(1, schema()).unwrap();
        engine
            .create_table(
                2,
                TableSchema::new(vec![
                    ColumnDesc::fixed("a", ColType::Long),
                    ColumnDesc::var("name", ColType::Varchar, 24),
                ]),
            )
            .unwrap();
    }
    let engine = Engine::bootstrap(&dir).unwrap();
    let t1 = engine.open_table(1).unwrap();
    let t2 = engine.open_table(2).unwrap();
    assert_eq!(t1.row_len(), 4);
    assert_eq!(t2.row_len(), 32);
    assert_eq!(t2.schema().col(1).len, 24);
    assert!(engine.open_table(3).is_err());
}
