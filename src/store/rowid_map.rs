//! The RowId map: per-row latches and DRAM caches fronting NVM tuples.
//!
//! A dynamically grown array of entry segments, one entry per RowId. Each
//! entry carries a spin latch (a bit in the flag word, claimed with CAS), the
//! resolved NVM slot address, and an optional DRAM copy of the tuple that
//! serves read-hot paths. The NVM tuple is authoritative; the cache is
//! refreshed under the latch whenever the row changes.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use parking_lot::RwLock;

use crate::store::constants::*;
use crate::store::space::Tablespace;
use crate::store::vecstore::{TableCache, VecStore};
use crate::util::mem::{bytes_at, bytes_at_mut};

/// Latch bit inside the entry flag word.
pub const ROWID_LATCHED: u32 = 0x0100_0000;
/// Entry holds a resolved NVM address.
pub const ROWID_VALID: u32 = 0x0200_0000;

/// Entries per map segment.
const SEGMENT_LEN: usize = 128 * 1024;

/// One row's DRAM-side state. All fields behind the latch bit.
pub struct RowIdMapEntry {
    flag: AtomicU32,
    nvm: UnsafeCell<*mut u8>,
    cache: UnsafeCell<Option<Box<[u8]>>>,
}

// Entries are shared across worker threads; the latch serializes access to
// the UnsafeCell fields.
unsafe impl Send for RowIdMapEntry {}
unsafe impl Sync for RowIdMapEntry {}

impl Default for RowIdMapEntry {
    fn default() -> Self {
        RowIdMapEntry {
            flag: AtomicU32::new(0),
            nvm: UnsafeCell::new(std::ptr::null_mut()),
            cache: UnsafeCell::new(None),
        }
    }
}

impl RowIdMapEntry {
    /// Spin until the latch bit is ours.
    pub fn lock(&self, tuple_len: usize) -> RowLatchGuard<'_> {
        let backoff = Backoff::new();
        loop {
            let old = self.flag.load(Ordering::Relaxed);
            if old & ROWID_LATCHED == 0
                && self
                    .flag
                    .compare_exchange_weak(
                        old,
                        old | ROWID_LATCHED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return RowLatchGuard {
                    entry: self,
                    tuple_len,
                };
            }
            backoff.snooze();
        }
    }

    fn is_valid(&self) -> bool {
        self.flag.load(Ordering::Acquire) & ROWID_VALID != 0
    }
}

/// RAII latch over one row. Exposes the NVM slot and the DRAM cache.
pub struct RowLatchGuard<'a> {
    entry: &'a RowIdMapEntry,
    tuple_len: usize,
}

impl RowLatchGuard<'_> {
    pub fn nvm_ptr(&self) -> *mut u8 {
        unsafe { *self.entry.nvm.get() }
    }

    pub fn nvm_bytes(&self) -> &mut [u8] {
        unsafe { bytes_at_mut(self.nvm_ptr(), self.tuple_len) }
    }

    fn set_nvm(&self, ptr: *mut u8) {
        unsafe { *self.entry.nvm.get() = ptr };
        self.entry.flag.fetch_or(ROWID_VALID, Ordering::Release);
    }

    /// The DRAM copy, populated from NVM on first use.
    pub fn read_cache(&self) -> &[u8] {
        let cache = unsafe { &mut *self.entry.cache.get() };
        if cache.is_none() {
            let mut buf = vec![0u8; self.tuple_len].into_boxed_slice();
            buf.copy_from_slice(unsafe { bytes_at(self.nvm_ptr(), self.tuple_len) });
            *cache = Some(buf);
        }
        cache.as_ref().unwrap()
    }

    /// Refresh the whole DRAM copy from NVM.
    pub fn sync_cache(&self) {
        let cache = unsafe { &mut *self.entry.cache.get() };
        let buf = cache
            .get_or_insert_with(|| vec![0u8; self.tuple_len].into_boxed_slice());
        buf.copy_from_slice(unsafe { bytes_at(self.nvm_ptr(), self.tuple_len) });
    }

    /// After a delete only the head changed; refresh just that.
    pub fn sync_cache_head(&self) {
        let cache = unsafe { &mut *self.entry.cache.get() };
        if let Some(buf) = cache.as_mut() {
            buf[..TUPLE_HEAD_SIZE]
                .copy_from_slice(unsafe { bytes_at(self.nvm_ptr(), TUPLE_HEAD_SIZE) });
        }
    }

    /// Mutable cache head view for rollback mirroring.
    pub fn cache_bytes(&self) -> Option<&mut [u8]> {
        let cache = unsafe { &mut *self.entry.cache.get() };
        cache.as_mut().map(|b| &mut b[..])
    }
}

impl Drop for RowLatchGuard<'_> {
    fn drop(&mut self) {
        self.entry
            .flag
            .fetch_and(!ROWID_LATCHED, Ordering::Release);
    }
}

/// The map itself: entry segments plus the vector store it fronts.
pub struct RowIdMap {
    store: VecStore,
    row_len: u32,
    tuple_len: usize,
    segments: RwLock<Vec<Box<[RowIdMapEntry]>>>,
}

impl RowIdMap {
    pub fn new(space: Arc<Tablespace>, seghead: PageNo, row_len: u32) -> RowIdMap {
        RowIdMap {
            store: VecStore::new(space, seghead, row_len),
            row_len,
            tuple_len: row_len as usize + TUPLE_HEAD_SIZE,
            segments: RwLock::new(Vec::new()),
        }
    }

    pub fn row_len(&self) -> u32 {
        self.row_len
    }

    pub fn tuple_len(&self) -> usize {
        self.tuple_len
    }

    pub fn insert_version(&self, cache: &mut TableCache, group: u32) -> RowId {
        self.store.insert_version(cache, group)
    }

    pub fn upper_row_id(&self) -> RowId {
        self.store.upper_row_id()
    }

    /// Flush the NVM slot of `rowid`.
    pub fn persist_slot(&self, rowid: RowId) {
        self.store.persist_slot(rowid);
    }

    fn entry_ref(&self, rowid: RowId) -> &RowIdMapEntry {
        let seg = rowid as usize / SEGMENT_LEN;
        let off = rowid as usize % SEGMENT_LEN;
        {
            let segs = self.segments.read();
            if seg < segs.len() {
                // Segment storage is never moved or freed once published, so
                // the reference outlives the read guard.
                let p: *const RowIdMapEntry = &segs[seg][off];
                return unsafe { &*p };
            }
        }
        let mut segs = self.segments.write();
        while segs.len() <= seg {
            let mut v = Vec::with_capacity(SEGMENT_LEN);
            v.resize_with(SEGMENT_LEN, RowIdMapEntry::default);
            segs.push(v.into_boxed_slice());
        }
        let p: *const RowIdMapEntry = &segs[seg][off];
        unsafe { &*p }
    }

    /// Entry for `rowid`. `read_only` reports `None` when the row's leaf was
    /// never allocated (a read of a RowId nothing ever touched).
    pub fn entry(&self, rowid: RowId, read_only: bool) -> Option<&RowIdMapEntry> {
        let entry = self.entry_ref(rowid);
        if entry.is_valid() {
            return Some(entry);
        }
        let guard = entry.lock(self.tuple_len);
        if !entry.is_valid() {
            let ptr = if read_only {
                match self.store.version_ptr(rowid) {
                    Some(p) => p,
                    None => return None,
                }
            } else {
                self.store.version_ptr_append(rowid)
            };
            guard.set_nvm(ptr);
        }
        drop(guard);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::config::DirSet;
    use crate::store::space::ExtentSize;
    use tempfile::TempDir;

    fn map(row_len: u32) -> (TempDir, Arc<RowIdMap>) {
        let tmp = TempDir::new().unwrap();
        let d = tmp.path().join("d0");
        std::fs::create_dir_all(&d).unwrap();
        let dirs = Arc::new(DirSet::parse(&d.display().to_string()).unwrap());
        let space = Arc::new(Tablespace::new(dirs, "space"));
        space.create().unwrap();
        let seghead = space.alloc_extent(ExtentSize::Ext8k, INVALID_PAGENO, 0);
        (tmp, Arc::new(RowIdMap::new(space, seghead, row_len)))
    }

    #[test]
    fn test_read_only_entry_for_untouched_row() {
        let (_t, m) = map(64);
        assert!(m.entry(12345, true).is_none());
    }

    #[test]
    fn test_entry_resolves_and_caches() {
        let (_t, m) = map(64);
        let mut cache = TableCache::default();
        let rowid = m.insert_version(&mut cache, 0);
        let entry = m.entry(rowid, false).unwrap();
        let g = entry.lock(m.tuple_len());
        g.nvm_bytes()[TUPLE_HEAD_SIZE] = 0x5A;
        g.sync_cache();
        assert_eq!(g.read_cache()[TUPLE_HEAD_SIZE], 0x5A);
        drop(g);

        // Read-only access now sees the same entry.
        assert!(m.entry(rowid, true).is_some());
    }

    #[test]
    fn test_latch_excludes_writers() {
        let (_t, m) = map(64);
        let mut cache = TableCache::default();
        let rowid = m.insert_version(&mut cache, 0);
        let entry = m.entry(rowid, false).unwrap();

        let g = entry.lock(m.tuple_len());
        let flag = entry.flag.load(Ordering::Relaxed);
        assert!(flag & ROWID_LATCHED != 0);
        drop(g);
        assert!(entry.flag.load(Ordering::Relaxed) & ROWID_LATCHED == 0);
    }

    #[test]
    fn test_concurrent_latch_counter() {
        let (_t, m) = map(64);
        let mut cache = TableCache::default();
        let rowid = m.insert_version(&mut cache, 0);
        m.entry(rowid, false).unwrap();

        let m2 = m.clone();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let m = m2.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let e = m.entry(rowid, false).unwrap();
                        let g = e.lock(m.tuple_len());
                        // Non-atomic increment under the latch.
                        let b = g.nvm_bytes();
                        let v = u32::from_le_bytes(b[TUPLE_HEAD_SIZE..TUPLE_HEAD_SIZE + 4].try_into().unwrap());
                        b[TUPLE_HEAD_SIZE..TUPLE_HEAD_SIZE + 4].copy_from_slice(&(v + 1).to_le_bytes());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let e = m.entry(rowid, false).unwrap();
        let g = e.lock(m.tuple_len());
        let b = g.nvm_bytes();
        let v = u32::from_le_bytes(b[TUPLE_HEAD_SIZE..TUPLE_HEAD_SIZE + 4].try_into().unwrap());
        assert_eq!(v, 4000);
    }
}
