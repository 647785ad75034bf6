//! The PMEM leaf pool: fixed-size leaf blocks plus the index root record.
//!
//! Leaves are [`LEAF_BLOCK_SIZE`]-byte blocks carved from a dedicated logical
//! file. Block 0 is the pool header: a bump cursor, a free-list head (freed
//! blocks chain through their first four bytes), the persistent references to
//! the head and tail sentinel leaves, and the lock generation id that is
//! bumped on every mount to invalidate stale versioned-lock waiters.
//!
//! A leaf's persistent identity is its block number; prev/cur/next links in
//! leaf headers are non-owning block numbers into this pool.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::store::config::DirSet;
use crate::store::constants::*;
use crate::store::logic_file::LogicFile;
use crate::util::mem::bytes_at_mut;
use crate::StoreError;

// Pool header fields (block 0).
const PH_NEXT_BLOCK: usize = 0;
const PH_FREE_HEAD: usize = 4;
const PH_HEAD_LEAF: usize = 8;
const PH_TAIL_LEAF: usize = 12;
const PH_GEN_ID: usize = 16;
const POOL_HEADER_LEN: usize = 24;

pub struct LeafPool {
    file: LogicFile,
    alloc: Mutex<()>,
}

impl LeafPool {
    pub fn new(dirs: Arc<DirSet>, name: &str) -> LeafPool {
        LeafPool {
            file: LogicFile::new(dirs, name, INDEX_SLICE_LEN, INDEX_MAX_SLICES),
            alloc: Mutex::new(()),
        }
    }

    pub fn create(&self) -> Result<(), StoreError> {
        self.file.create()?;
        let h = self.header();
        LittleEndian::write_u32(&mut h[PH_NEXT_BLOCK..], 1);
        LittleEndian::write_u32(&mut h[PH_FREE_HEAD..], INVALID_LEAF);
        LittleEndian::write_u32(&mut h[PH_HEAD_LEAF..], INVALID_LEAF);
        LittleEndian::write_u32(&mut h[PH_TAIL_LEAF..], INVALID_LEAF);
        LittleEndian::write_u32(&mut h[PH_GEN_ID..], 1);
        self.persist_header();
        Ok(())
    }

    pub fn mount(&self) -> Result<(), StoreError> {
        self.file.mount()?;
        let h = self.header();
        if LittleEndian::read_u32(&h[PH_NEXT_BLOCK..]) == 0 {
            return Err(StoreError::Corrupt("leaf pool header not initialized".into()));
        }
        // Invalidate versioned-lock waiters from the previous incarnation.
        let gen = LittleEndian::read_u32(&h[PH_GEN_ID..]) + 1;
        LittleEndian::write_u32(&mut h[PH_GEN_ID..], gen);
        self.persist_header();
        Ok(())
    }

    pub fn unmount(&self) {
        self.file.unmount();
    }

    fn header(&self) -> &mut [u8] {
        unsafe { bytes_at_mut(self.file.page_ptr(0), POOL_HEADER_LEN) }
    }

    fn persist_header(&self) {
        self.file.persist(0, POOL_HEADER_LEN);
    }

    /// Current lock generation.
    pub fn gen_id(&self) -> u32 {
        LittleEndian::read_u32(&self.header()[PH_GEN_ID..])
    }

    /// Address of a leaf block.
    pub fn leaf_ptr(&self, block: u32) -> *mut u8 {
        debug_assert_ne!(block, INVALID_LEAF);
        self.file
            .offset_ptr(block as u64 * LEAF_BLOCK_SIZE as u64)
    }

    /// Flush a byte range of one leaf block.
    pub fn persist_leaf(&self, block: u32, off: usize, len: usize) {
        self.file
            .persist(block as u64 * LEAF_BLOCK_SIZE as u64 + off as u64, len);
    }

    /// Allocate a zeroed leaf block.
    pub fn alloc_leaf(&self) -> u32 {
        let block = {
            let _g = self.alloc.lock();
            let h = self.header();
            let free = LittleEndian::read_u32(&h[PH_FREE_HEAD..]);
            if free != INVALID_LEAF {
                let next = {
                    let fp = self.leaf_ptr(free);
                    LittleEndian::read_u32(unsafe { crate::util::mem::bytes_at(fp, 4) })
                };
                LittleEndian::write_u32(&mut h[PH_FREE_HEAD..], next);
                self.persist_header();
                free
            } else {
                let block = LittleEndian::read_u32(&h[PH_NEXT_BLOCK..]);
                let end = (block as u64 + 1) * LEAF_BLOCK_SIZE as u64;
                self.file
                    .extend(((end - 1) / BLCKSZ as u64) as u32)
                    .unwrap_or_else(|e| panic!("leaf pool extend failed: {}", e));
                LittleEndian::write_u32(&mut h[PH_NEXT_BLOCK..], block + 1);
                self.persist_header();
                block
            }
        };
        unsafe { bytes_at_mut(self.leaf_ptr(block), LEAF_BLOCK_SIZE) }.fill(0);
        self.persist_leaf(block, 0, LEAF_BLOCK_SIZE);
        block
    }

    /// Push a retired leaf onto the free chain.
    pub fn free_leaf(&self, block: u32) {
        let _g = self.alloc.lock();
        let h = self.header();
        let free = LittleEndian::read_u32(&h[PH_FREE_HEAD..]);
        let fp = self.leaf_ptr(block);
        LittleEndian::write_u32(unsafe { bytes_at_mut(fp, 4) }, free);
        self.persist_leaf(block, 0, 4);
        LittleEndian::write_u32(&mut h[PH_FREE_HEAD..], block);
        self.persist_header();
    }

    /// Persistent reference to the head sentinel leaf.
    pub fn head_leaf(&self) -> u32 {
        LittleEndian::read_u32(&self.header()[PH_HEAD_LEAF..])
    }

    pub fn tail_leaf(&self) -> u32 {
        LittleEndian::read_u32(&self.header()[PH_TAIL_LEAF..])
    }

    pub fn set_list_roots(&self, head: u32, tail: u32) {
        let h = self.header();
        LittleEndian::write_u32(&mut h[PH_HEAD_LEAF..], head);
        LittleEndian::write_u32(&mut h[PH_TAIL_LEAF..], tail);
        self.persist_header();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool() -> (TempDir, LeafPool) {
        let tmp = TempDir::new().unwrap();
        let d = tmp.path().join("d0");
        std::fs::create_dir_all(&d).unwrap();
        let dirs = Arc::new(DirSet::parse(&d.display().to_string()).unwrap());
        let p = LeafPool::new(dirs, "leaf");
        p.create().unwrap();
        (tmp, p)
    }

    #[test]
    fn test_alloc_is_sequential_and_zeroed() {
        let (_t, p) = pool();
        let a = p.alloc_leaf();
        let b = p.alloc_leaf();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        let bytes = unsafe { crate::util::mem::bytes_at(p.leaf_ptr(a), LEAF_BLOCK_SIZE) };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_free_list_reuse_lifo() {
        let (_t, p) = pool();
        let a = p.alloc_leaf();
        let b = p.alloc_leaf();
        p.free_leaf(a);
        p.free_leaf(b);
        assert_eq!(p.alloc_leaf(), b);
        assert_eq!(p.alloc_leaf(), a);
    }

    #[test]
    fn test_gen_bumps_on_mount() {
        let tmp = TempDir::new().unwrap();
        let d = tmp.path().join("d0");
        std::fs::create_dir_all(&d).unwrap();
        let dirs = Arc::new(DirSet::parse(&d.display().to_string()).unwrap());
        let gen0 = {
            let p = LeafPool::new(dirs.clone(), "leaf");
            p.create().unwrap();
            let g = p.gen_id();
            p.unmount();
            g
        };
        let p = LeafPool::new(dirs, "leaf");
        p.mount().unwrap();
        assert_eq!(p.gen_id(), gen0 + 1);
    }

    #[test]
    fn test_list_roots_roundtrip() {
        let (_t, p) = pool();
        let h = p.alloc_leaf();
        let t = p.alloc_leaf();
        p.set_list_roots(h, t);
        assert_eq!(p.head_leaf(), h);
        assert_eq!(p.tail_leaf(), t);
    }
}
