//! Doubly-linked lists threaded through page headers.
//!
//! Several structures chain pages together: the extents of one table segment,
//! and the tablespace free lists. The links are page numbers stored at a fixed
//! offset in each page header, so the list costs nothing beyond the header.
//! A list head points at itself when the list has a single element.

use byteorder::{ByteOrder, LittleEndian};

use crate::store::constants::{PageNo, PAGE_HEADER_SIZE, PH_NEXT, PH_PREV};
use crate::store::logic_file::LogicFile;
use crate::util::mem::bytes_at_mut;

fn header<'a>(file: &LogicFile, node: PageNo) -> &'a mut [u8] {
    // Callers hold the tablespace latch, so header access is serialized.
    unsafe { bytes_at_mut(file.page_ptr(node), PAGE_HEADER_SIZE) }
}

fn prev_of(file: &LogicFile, node: PageNo) -> PageNo {
    LittleEndian::read_u32(&header(file, node)[PH_PREV..])
}

fn next_of(file: &LogicFile, node: PageNo) -> PageNo {
    LittleEndian::read_u32(&header(file, node)[PH_NEXT..])
}

fn persist_header(file: &LogicFile, node: PageNo) {
    file.persist(
        node as u64 * crate::store::constants::BLCKSZ as u64,
        PAGE_HEADER_SIZE,
    );
}

fn set_links(file: &LogicFile, node: PageNo, prev: PageNo, next: PageNo) {
    let h = header(file, node);
    LittleEndian::write_u32(&mut h[PH_PREV..], prev);
    LittleEndian::write_u32(&mut h[PH_NEXT..], next);
    persist_header(file, node);
}

/// Initialize `node` as a single-element list: both links point at itself.
pub fn init_head(file: &LogicFile, node: PageNo) {
    set_links(file, node, node, node);
}

/// A node is the only element iff it links to itself.
pub fn is_head(file: &LogicFile, node: PageNo) -> bool {
    let single = prev_of(file, node) == node;
    debug_assert!(!single || next_of(file, node) == node);
    single
}

/// Append `node` at the tail of the list rooted at `head`.
pub fn push_tail(file: &LogicFile, head: PageNo, node: PageNo) {
    let tail = prev_of(file, head);
    set_links(file, node, tail, head);
    let th = header(file, tail);
    LittleEndian::write_u32(&mut th[PH_NEXT..], node);
    persist_header(file, tail);
    let hh = header(file, head);
    LittleEndian::write_u32(&mut hh[PH_PREV..], node);
    persist_header(file, head);
}

/// Remove and return the tail of the list rooted at `head`.
///
/// Must not be called on a single-element list; callers check [`is_head`].
pub fn pop_tail(file: &LogicFile, head: PageNo) -> PageNo {
    let tail = prev_of(file, head);
    debug_assert_ne!(tail, head);
    let tail_prev = prev_of(file, tail);
    let hh = header(file, head);
    LittleEndian::write_u32(&mut hh[PH_PREV..], tail_prev);
    persist_header(file, head);
    let ph = header(file, tail_prev);
    LittleEndian::write_u32(&mut ph[PH_NEXT..], head);
    persist_header(file, tail_prev);
    tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::config::DirSet;
    use crate::store::constants::BLCKSZ;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn file() -> (TempDir, LogicFile) {
        let tmp = TempDir::new().unwrap();
        let d = tmp.path().join("d0");
        std::fs::create_dir_all(&d).unwrap();
        let dirs = Arc::new(DirSet::parse(&d.display().to_string()).unwrap());
        let f = LogicFile::new(dirs, "s", 64 * BLCKSZ, 4);
        f.create().unwrap();
        (tmp, f)
    }

    #[test]
    fn test_single_element_list() {
        let (_t, f) = file();
        init_head(&f, 3);
        assert!(is_head(&f, 3));
    }

    #[test]
    fn test_push_pop_order() {
        let (_t, f) = file();
        init_head(&f, 2);
        push_tail(&f, 2, 5);
        push_tail(&f, 2, 9);
        assert!(!is_head(&f, 2));
        assert_eq!(pop_tail(&f, 2), 9);
        assert_eq!(pop_tail(&f, 2), 5);
        assert!(is_head(&f, 2));
    }
}
