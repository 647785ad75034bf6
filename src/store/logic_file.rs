//! Logical files: directory-striped sequences of fixed-size PMEM slices.
//!
//! A [`LogicFile`] presents a flat page-number space backed by several
//! memory-mapped slice files. Slice `k` of file `name` is
//! `<dir[k mod D]>/<name>.<k>`; each slice has the same length, so a global
//! page number selects a slice and an offset within it. The heap tablespace,
//! the undo segments, and the index pools all sit on this layer.
//!
//! Persistence is `MmapMut::flush_range` over the touched byte range, which
//! on a DAX mount is a flush + fence of the affected cache lines.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::store::config::DirSet;
use crate::store::constants::BLCKSZ;
use crate::StoreError;

/// A logical file split into memory-mapped slices.
pub struct LogicFile {
    name: String,
    dirs: Arc<DirSet>,
    slice_len: usize,
    max_slices: usize,
    pages_per_slice: u32,
    slices: RwLock<Vec<Option<MmapMut>>>,
}

impl LogicFile {
    pub fn new(dirs: Arc<DirSet>, name: &str, slice_len: usize, max_slices: usize) -> Self {
        assert!(slice_len % BLCKSZ == 0, "slice length must be page aligned");
        LogicFile {
            name: name.to_string(),
            dirs,
            slice_len,
            max_slices,
            pages_per_slice: (slice_len / BLCKSZ) as u32,
            slices: RwLock::new(Vec::new()),
        }
    }

    fn filename(&self, sliceno: usize) -> PathBuf {
        self.dirs
            .path(sliceno)
            .join(format!("{}.{}", self.name, sliceno))
    }

    /// Pages per slice.
    pub fn pages_per_slice(&self) -> u32 {
        self.pages_per_slice
    }

    /// Slice length in bytes.
    pub fn slice_len(&self) -> usize {
        self.slice_len
    }

    /// Number of slice positions currently tracked (mapped or punched).
    pub fn slice_count(&self) -> usize {
        self.slices.read().len()
    }

    /// Create the file: maps slice 0, creating it on disk.
    pub fn create(&self) -> Result<(), StoreError> {
        debug_assert_eq!(self.slice_count(), 0);
        self.map_slice(0, true)?;
        Ok(())
    }

    /// Mount an existing file: map consecutive slices until one is missing.
    pub fn mount(&self) -> Result<(), StoreError> {
        for sliceno in 0..self.max_slices {
            if !self.map_slice(sliceno, false)? {
                break;
            }
        }
        if self.slice_count() == 0 {
            return Err(StoreError::Corrupt(format!(
                "logical file {} has no slice 0",
                self.name
            )));
        }
        Ok(())
    }

    /// Release all mappings without deleting the underlying files.
    pub fn unmount(&self) {
        self.slices.write().clear();
    }

    /// Ensure the slice holding `pageno` is mapped, creating it if absent.
    pub fn extend(&self, pageno: u32) -> Result<(), StoreError> {
        self.map_slice((pageno / self.pages_per_slice) as usize, true)?;
        Ok(())
    }

    /// Unmap and unlink slices `[start, end)`. Used by undo recycling.
    pub fn punch(&self, start_slice: u32, end_slice: u32) {
        assert!(start_slice < end_slice);
        let mut slices = self.slices.write();
        for sliceno in start_slice..end_slice {
            let idx = sliceno as usize;
            if idx >= slices.len() || slices[idx].is_none() {
                continue;
            }
            slices[idx] = None;
            let path = self.filename(idx);
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("punch: cannot unlink {}: {}", path.display(), e);
            }
        }
    }

    /// Map one slice. Returns `Ok(false)` if the slice does not exist and
    /// `create` is false (the normal mount termination case).
    fn map_slice(&self, sliceno: usize, create: bool) -> Result<bool, StoreError> {
        if sliceno >= self.max_slices {
            panic!(
                "logical file {}: slice {} exceeds maximum {}",
                self.name, sliceno, self.max_slices
            );
        }
        let mut slices = self.slices.write();
        if sliceno < slices.len() && slices[sliceno].is_some() {
            return Ok(true);
        }

        let path = self.filename(sliceno);
        let file = if create {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| StoreError::Io(format!("cannot create {}: {}", path.display(), e)))?
        } else {
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => {
                    return Err(StoreError::Io(format!(
                        "cannot open {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        };

        let cur_len = file
            .metadata()
            .map_err(|e| StoreError::Io(format!("cannot stat {}: {}", path.display(), e)))?
            .len();
        if create && cur_len < self.slice_len as u64 {
            file.set_len(self.slice_len as u64).map_err(|e| {
                StoreError::Io(format!("cannot size {}: {}", path.display(), e))
            })?;
        } else if !create && cur_len != self.slice_len as u64 {
            return Err(StoreError::Corrupt(format!(
                "{} is {} bytes, expected {}",
                path.display(),
                cur_len,
                self.slice_len
            )));
        }

        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| StoreError::Io(format!("cannot map {}: {}", path.display(), e)))?;

        if slices.len() <= sliceno {
            slices.resize_with(sliceno + 1, || None);
        }
        slices[sliceno] = Some(map);
        Ok(true)
    }

    /// Virtual address of a page. Panics if the slice is not mapped.
    ///
    /// The returned pointer stays valid until `unmount`/`punch`; mappings are
    /// never moved once established.
    pub fn page_ptr(&self, pageno: u32) -> *mut u8 {
        let sliceno = (pageno / self.pages_per_slice) as usize;
        let off = (pageno % self.pages_per_slice) as usize * BLCKSZ;
        let slices = self.slices.read();
        let map = slices
            .get(sliceno)
            .and_then(|s| s.as_ref())
            .unwrap_or_else(|| panic!("logical file {}: slice {} not mapped", self.name, sliceno));
        unsafe { map.as_ptr().add(off) as *mut u8 }
    }

    /// Virtual address of a flat byte offset.
    pub fn offset_ptr(&self, off: u64) -> *mut u8 {
        let pageno = (off / BLCKSZ as u64) as u32;
        unsafe { self.page_ptr(pageno).add((off % BLCKSZ as u64) as usize) }
    }

    /// Persist `[off, off + len)` of the flat space (flush + fence).
    ///
    /// The range may span two slices (undo records cross slice boundaries).
    pub fn persist(&self, off: u64, len: usize) {
        let mut cur = off;
        let end = off + len as u64;
        let slices = self.slices.read();
        while cur < end {
            let sliceno = (cur / self.slice_len as u64) as usize;
            let in_slice = (cur % self.slice_len as u64) as usize;
            let chunk = usize::min((end - cur) as usize, self.slice_len - in_slice);
            if let Some(Some(map)) = slices.get(sliceno) {
                if let Err(e) = map.flush_range(in_slice, chunk) {
                    panic!("logical file {}: flush failed: {}", self.name, e);
                }
            }
            cur += chunk as u64;
        }
    }
}
