//! Microbenchmarks for the hot paths: heap insert/read and index scans.
//!
//! These run against a throwaway store in a temp directory; debug-profile
//! slice sizes keep the footprint small.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use pmstore::store::db::Engine;
use pmstore::store::heap::{heap_insert, heap_read};
use pmstore::store::index::{index_insert, NvmIndex};
use pmstore::store::index_key::{IndexColumnDesc, IndexTuple};
use pmstore::store::tuple::{ColType, ColumnDesc, RamTuple, TableSchema};

fn schema() -> Arc<TableSchema> {
    TableSchema::new(vec![
        ColumnDesc::fixed("k", ColType::Int),
        ColumnDesc::fixed("v", ColType::Long),
        ColumnDesc::var("pad", ColType::Char, 32),
    ])
}

fn bench_heap(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("pm0").display().to_string();
    let engine = Engine::init(&dir).unwrap();
    let table = engine.create_table(1, schema()).unwrap();
    let mut s = engine.new_session();

    let mut next_key = 0i32;
    c.bench_function("heap_insert_commit", |b| {
        b.iter(|| {
            s.begin();
            let mut t = RamTuple::new(table.schema());
            t.set_col(0, &next_key.to_le_bytes());
            t.set_col(1, &(next_key as i64).to_le_bytes());
            next_key += 1;
            let rowid = heap_insert(&mut s, &table, &mut t).unwrap();
            s.commit();
            rowid
        })
    });

    s.begin();
    let mut probe = RamTuple::new(table.schema());
    probe.set_col(0, &1i32.to_le_bytes());
    let rowid = heap_insert(&mut s, &table, &mut probe).unwrap();
    s.commit();

    c.bench_function("heap_read_hot", |b| {
        b.iter(|| {
            s.begin();
            let mut out = RamTuple::new(table.schema());
            heap_read(&mut s, &table, rowid, &mut out).unwrap();
            s.commit();
        })
    });
}

fn bench_index(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("pm0").display().to_string();
    let engine = Engine::init(&dir).unwrap();
    let table = engine.create_table(1, schema()).unwrap();
    let index: NvmIndex =
        engine.create_index(1, table.schema(), vec![IndexColumnDesc { col_id: 0 }]);
    let mut s = engine.new_session();

    s.begin();
    for k in 0..5_000i32 {
        let mut t = RamTuple::new(table.schema());
        t.set_col(0, &k.to_le_bytes());
        let rowid = heap_insert(&mut s, &table, &mut t).unwrap();
        let mut it = IndexTuple::new(index.schema());
        it.set_col(0, &k.to_le_bytes());
        index_insert(&mut s, &index, &it, rowid);
    }
    s.commit();

    c.bench_function("index_scan_100", |b| {
        b.iter(|| {
            s.begin();
            let mut lo = IndexTuple::new(index.schema());
            lo.set_col(0, &2_000i32.to_le_bytes());
            let mut hi = IndexTuple::new(index.schema());
            hi.set_col(0, &2_099i32.to_le_bytes());
            let n = index.generate_iter(&mut s, &lo, &hi, 0, false).count();
            s.commit();
            n
        })
    });
}

criterion_group!(benches, bench_heap, bench_index);
criterion_main!(benches);
