//! The vector store: a two-level page table from RowId to tuple slot.
//!
//! Each table's segment head is a root page whose content area stores
//! `[max_leaf_idx, leaf_page_no[0..N]]`. A RowId splits into
//! `(leaf_idx, offset) = (rowid / tuples_per_leaf, rowid % tuples_per_leaf)`;
//! leaves are 2 MiB extents allocated lazily, striped over directory shards
//! by `leaf_idx % dir_count`.
//!
//! RowId allocation goes through three tiers: the thread's free-RowId cache
//! (ids it deleted earlier), the thread's current contiguous range, and
//! finally the shard-local [`GlobalBitmap`], where one bit buys the whole
//! RowId range of a fresh leaf. After a restart the bitmap is empty, so a
//! candidate slot may turn out to be occupied; allocation re-checks the USED
//! flag and retries until it finds a truly free slot.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::store::bitmap::GlobalBitmap;
use crate::store::constants::*;
use crate::store::space::{ExtentSize, Tablespace};
use crate::store::tuple::TupleHead;
use crate::util::mem::{bytes_at, bytes_at_mut};

/// Heap leaves are 2 MiB extents.
pub const HEAP_EXTENT: ExtentSize = ExtentSize::Ext2m;

/// A contiguous RowId range owned by one thread.
#[derive(Debug, Clone, Copy)]
pub struct VecRange {
    pub start: RowId,
    pub end: RowId,
}

impl Default for VecRange {
    fn default() -> Self {
        VecRange {
            start: INVALID_ROWID,
            end: INVALID_ROWID,
        }
    }
}

impl VecRange {
    pub fn next(&mut self) -> RowId {
        if self.start < self.end {
            let r = self.start;
            self.start += 1;
            r
        } else {
            INVALID_ROWID
        }
    }
}

/// Per-(thread, table) allocation state: deleted-id free list plus the
/// current range.
#[derive(Default)]
pub struct TableCache {
    pub free_ids: Vec<RowId>,
    pub range: VecRange,
}

/// Translates RowIds to NVM tuple slots, allocating leaves on demand.
pub struct RowIdMgr {
    space: Arc<Tablespace>,
    seghead: PageNo,
    tuple_len: u32,
    tuples_per_leaf: u32,
    alloc_latch: Mutex<()>,
}

impl RowIdMgr {
    pub fn new(space: Arc<Tablespace>, seghead: PageNo, tuple_len: u32) -> RowIdMgr {
        let tuples_per_leaf = HEAP_EXTENT.content_len() as u32 / tuple_len;
        RowIdMgr {
            space,
            seghead,
            tuple_len,
            tuples_per_leaf,
            alloc_latch: Mutex::new(()),
        }
    }

    pub fn tuples_per_leaf(&self) -> u32 {
        self.tuples_per_leaf
    }

    /// Leaf-map capacity of the root page.
    fn map_capacity(&self) -> u32 {
        ((ExtentSize::Ext8k.content_len() - 4) / 4) as u32
    }

    fn root_content(&self) -> *mut u8 {
        unsafe { self.space.file().page_ptr(self.seghead).add(PAGE_HEADER_SIZE) }
    }

    fn leaf_page_no(&self, leaf_idx: u32) -> PageNo {
        let map = unsafe {
            bytes_at(
                self.root_content().add(4),
                self.map_capacity() as usize * 4,
            )
        };
        LittleEndian::read_u32(&map[leaf_idx as usize * 4..])
    }

    fn max_leaf_idx(&self) -> u32 {
        let c = unsafe { bytes_at(self.root_content(), 4) };
        LittleEndian::read_u32(c)
    }

    /// Address of the tuple slot for `rowid`. With `append` set, the leaf is
    /// allocated if absent; otherwise absent leaves yield `None`.
    pub fn version_pointer(&self, rowid: RowId, append: bool) -> Option<*mut u8> {
        let leaf_idx = rowid / self.tuples_per_leaf;
        let offset = rowid % self.tuples_per_leaf;
        assert!(
            leaf_idx < self.map_capacity(),
            "table segment {} leaf map overflow",
            self.seghead
        );

        if self.leaf_page_no(leaf_idx) == INVALID_PAGENO {
            if !append {
                return None;
            }
            self.alloc_leaf(leaf_idx);
        }

        let pageno = self.leaf_page_no(leaf_idx);
        debug_assert_ne!(pageno, INVALID_PAGENO);
        let leaf = self.space.file().page_ptr(pageno);
        Some(unsafe {
            leaf.add(PAGE_HEADER_SIZE + offset as usize * self.tuple_len as usize)
        })
    }

    fn alloc_leaf(&self, leaf_idx: u32) {
        let _g = self.alloc_latch.lock();
        if self.leaf_page_no(leaf_idx) != INVALID_PAGENO {
            return;
        }
        let shard = leaf_idx % self.space.dir_count();
        let pageno = self.space.alloc_extent(HEAP_EXTENT, self.seghead, shard);

        let root = unsafe { bytes_at_mut(self.root_content(), (self.map_capacity() as usize + 1) * 4) };
        LittleEndian::write_u32(&mut root[4 + leaf_idx as usize * 4..], pageno);
        if LittleEndian::read_u32(&root[..4]) < leaf_idx {
            LittleEndian::write_u32(&mut root[..4], leaf_idx);
        }
        self.space
            .file()
            .persist(self.seghead as u64 * BLCKSZ as u64, BLCKSZ);
    }

    /// One past the highest RowId any allocated leaf can hold.
    pub fn upper_row_id(&self) -> RowId {
        (self.max_leaf_idx() + 1) * self.tuples_per_leaf
    }

    /// Flush the NVM slot of `rowid` (flush + fence).
    pub fn persist_slot(&self, rowid: RowId) {
        let leaf_idx = rowid / self.tuples_per_leaf;
        let offset = rowid % self.tuples_per_leaf;
        let pageno = self.leaf_page_no(leaf_idx);
        debug_assert_ne!(pageno, INVALID_PAGENO);
        let off = pageno as u64 * BLCKSZ as u64
            + (PAGE_HEADER_SIZE + offset as usize * self.tuple_len as usize) as u64;
        self.space.file().persist(off, self.tuple_len as usize);
    }
}

/// RowId allocation over the page table, bitmap-backed.
pub struct VecStore {
    mgr: RowIdMgr,
    bitmaps: Vec<GlobalBitmap>,
    dir_count: u32,
}

impl VecStore {
    pub fn new(space: Arc<Tablespace>, seghead: PageNo, row_len: u32) -> VecStore {
        let tuple_len = row_len + TUPLE_HEAD_SIZE as u32;
        let mgr = RowIdMgr::new(space.clone(), seghead, tuple_len);
        let dir_count = space.dir_count();
        let bits_per_dir = MAX_ROWID / mgr.tuples_per_leaf() / dir_count;
        let bitmaps = (0..dir_count)
            .map(|_| GlobalBitmap::new(bits_per_dir))
            .collect();
        VecStore {
            mgr,
            bitmaps,
            dir_count,
        }
    }

    pub fn tuples_per_leaf(&self) -> u32 {
        self.mgr.tuples_per_leaf()
    }

    /// Slot address if the leaf exists.
    pub fn version_ptr(&self, rowid: RowId) -> Option<*mut u8> {
        self.mgr.version_pointer(rowid, false)
    }

    /// Slot address, allocating the leaf when needed.
    pub fn version_ptr_append(&self, rowid: RowId) -> *mut u8 {
        self.mgr.version_pointer(rowid, true).unwrap()
    }

    fn try_next_rowid(&self, cache: &mut TableCache, group: u32) -> RowId {
        if let Some(r) = cache.free_ids.pop() {
            return r;
        }
        loop {
            let r = cache.range.next();
            if r != INVALID_ROWID {
                return r;
            }
            let shard = group % self.dir_count;
            let bit = self.bitmaps[shard as usize].acquire();
            let leaf = shard + self.dir_count * bit;
            cache.range = VecRange {
                start: leaf * self.tuples_per_leaf(),
                end: (leaf + 1) * self.tuples_per_leaf(),
            };
        }
    }

    /// Allocate a RowId whose slot is demonstrably unused. Slots that look
    /// used after a restart (the bitmap is not persistent) are skipped.
    pub fn insert_version(&self, cache: &mut TableCache, group: u32) -> RowId {
        loop {
            let rowid = self.try_next_rowid(cache, group);
            let ptr = self.mgr.version_pointer(rowid, true).unwrap();
            let head = TupleHead::read(unsafe { bytes_at(ptr, TUPLE_HEAD_SIZE) });
            if !head.is_used() {
                return rowid;
            }
        }
    }

    pub fn upper_row_id(&self) -> RowId {
        self.mgr.upper_row_id()
    }

    /// Flush the NVM slot of `rowid`.
    pub fn persist_slot(&self, rowid: RowId) {
        self.mgr.persist_slot(rowid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::config::DirSet;
    use tempfile::TempDir;

    fn setup(row_len: u32) -> (TempDir, Arc<Tablespace>, VecStore) {
        let tmp = TempDir::new().unwrap();
        let d = tmp.path().join("d0");
        std::fs::create_dir_all(&d).unwrap();
        let dirs = Arc::new(DirSet::parse(&d.display().to_string()).unwrap());
        let space = Arc::new(Tablespace::new(dirs, "space"));
        space.create().unwrap();
        let seghead = space.alloc_extent(ExtentSize::Ext8k, INVALID_PAGENO, 0);
        let vs = VecStore::new(space.clone(), seghead, row_len);
        (tmp, space, vs)
    }

    #[test]
    fn test_rowids_are_dense_within_leaf() {
        let (_t, _s, vs) = setup(100);
        let mut cache = TableCache::default();
        let a = vs.insert_version(&mut cache, 0);
        let b = vs.insert_version(&mut cache, 0);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_version_ptr_absent_leaf() {
        let (_t, _s, vs) = setup(100);
        // Leaf for a far-away RowId was never allocated.
        assert!(vs.version_ptr(vs.tuples_per_leaf() * 3).is_none());
    }

    #[test]
    fn test_used_slot_is_skipped() {
        let (_t, _s, vs) = setup(100);
        let mut cache = TableCache::default();
        let first = vs.insert_version(&mut cache, 0);

        // Mark the next candidate used behind the allocator's back, as a
        // restart with a cleared bitmap would.
        let next = first + 1;
        let ptr = vs.version_ptr_append(next);
        let mut head = TupleHead::default();
        head.flag1 = TUPLE_USED;
        head.write(unsafe { crate::util::mem::bytes_at_mut(ptr, TUPLE_HEAD_SIZE) });

        let got = vs.insert_version(&mut cache, 0);
        assert_eq!(got, next + 1);
    }

    #[test]
    fn test_free_list_reuse() {
        let (_t, _s, vs) = setup(100);
        let mut cache = TableCache::default();
        let a = vs.insert_version(&mut cache, 0);
        let _b = vs.insert_version(&mut cache, 0);
        cache.free_ids.push(a);
        assert_eq!(vs.insert_version(&mut cache, 0), a);
    }

    #[test]
    fn test_upper_row_id_covers_allocations() {
        let (_t, _s, vs) = setup(100);
        let mut cache = TableCache::default();
        let r = vs.insert_version(&mut cache, 0);
        assert!(vs.upper_row_id() > r);
    }
}
