//! Engine-wide constants and persistent layout offsets.
//!
//! Sizes that differ between debug and release builds (slice lengths, slot
//! ring capacities) are selected with `cfg!(debug_assertions)` so tests run
//! against small files while release builds get production geometry.

/// Dense row identifier within one table.
pub type RowId = u32;
/// Global page number within one tablespace.
pub type PageNo = u32;
/// Commit sequence number.
pub type Csn = u64;

/// Sentinel for "no row".
pub const INVALID_ROWID: RowId = 0xFFFF_FFFF;
/// Largest valid RowId.
pub const MAX_ROWID: RowId = INVALID_ROWID - 1;
/// Sentinel for "no page". Page 0 is always space metadata, so 0 is free.
pub const INVALID_PAGENO: PageNo = 0;

/// Smallest CSN a committed transaction can carry.
pub const MIN_CSN: Csn = (1 << 63) + 1;
/// Marker CSN: not a commit, used as the "live entry" index value.
pub const INVALID_CSN: Csn = 1 << 63;

// ── Pages and extents ───────────────────────────────────────────────

/// Fixed page size (8 KiB).
pub const BLCKSZ: usize = 8192;

/// Size of the header at the start of every extent-head page.
pub const PAGE_HEADER_SIZE: usize = 16;
/// Offset of the prev page number in the page header. 4 bytes.
pub const PH_PREV: usize = 0;
/// Offset of the next page number in the page header. 4 bytes.
pub const PH_NEXT: usize = 4;
/// Offset of the page's own number. 4 bytes.
pub const PH_BLKNO: usize = 8;
/// Offset of the extent-size tag. 1 byte (3 bytes reserved).
pub const PH_BLKSZ: usize = 12;

// ── Heap tablespace geometry ────────────────────────────────────────

/// Heap slice length: 1 GiB release, 10 MiB debug.
pub const HEAP_SLICE_LEN: usize = if cfg!(debug_assertions) {
    10 * 1024 * 1024
} else {
    1024 * 1024 * 1024
};
/// Upper bound on heap slices per tablespace.
pub const HEAP_MAX_SLICES: usize = 16 * 1024;
/// Maximum directory shards a tablespace may stripe over.
pub const MAX_DIR_COUNT: usize = 4;

// ── Space metadata (page 0) and catalog (page 1) ────────────────────

/// Per-shard metadata stride in page 0.
pub const SPACE_META_SIZE: usize = 16;
/// Offset of the high-water mark inside one shard's metadata. 4 bytes.
pub const SM_HWM: usize = 0;
/// Offset of the 8 KiB free-list root. 4 bytes.
pub const SM_FREE_8K: usize = 4;
/// Offset of the 2 MiB free-list root. 4 bytes.
pub const SM_FREE_2M: usize = 8;

/// Offset of the table count in the catalog page. 4 bytes.
pub const CAT_COUNT: usize = 0;
/// Start of the catalog entry array.
pub const CAT_ENTRIES: usize = 8;
/// Catalog entry stride: (oid u32, seghead u32).
pub const CAT_ENTRY_SIZE: usize = 8;

// ── Tuples ──────────────────────────────────────────────────────────

/// Hard cap on a serialized tuple body.
pub const MAX_TUPLE_LEN: usize = 8192;
/// Column-count cap per table (bounded by the 64-bit null bitmap).
pub const MAX_COL_COUNT: usize = 64;

/// NVM tuple head size.
pub const TUPLE_HEAD_SIZE: usize = 32;
/// Offset of `trx_info` (CSN or trx-slot pointer). 8 bytes.
pub const TH_TRX_INFO: usize = 0;
/// Offset of the previous-version undo pointer. 8 bytes.
pub const TH_PREV: usize = 8;
/// Offset of flag word 1 (USED/DELETED plus reserved bits). 4 bytes.
pub const TH_FLAG1: usize = 16;
/// Offset of the packed (flag2: u16, len: u16) word. 4 bytes.
pub const TH_FLAG2_LEN: usize = 20;
/// Offset of the null bitmap. 8 bytes.
pub const TH_NULL: usize = 24;

/// Tuple-head flag: slot is occupied.
pub const TUPLE_USED: u32 = 0x0000_0001;
/// Tuple-head flag: row is deleted.
pub const TUPLE_DELETED: u32 = 0x0000_0002;

// ── Undo ────────────────────────────────────────────────────────────

/// Undo slice length: 64 MiB release, 1 MiB debug.
pub const UNDO_SLICE_LEN: usize = if cfg!(debug_assertions) {
    1024 * 1024
} else {
    64 * 1024 * 1024
};
/// Upper bound on slices per undo segment.
pub const UNDO_MAX_SLICES: usize = 64;
/// Number of undo segments (must cover the worker thread count).
pub const UNDO_SEGMENT_COUNT: usize = 32;
/// Transaction slots per segment: 512 Ki release, 8 Ki debug.
pub const UNDO_TRX_SLOTS: usize = if cfg!(debug_assertions) {
    8 * 1024
} else {
    512 * 1024
};

/// Persistent transaction-slot size: csn, start, end, status.
pub const TRX_SLOT_SIZE: usize = 32;
/// Offset of the CSN within a slot. 8 bytes.
pub const TS_CSN: usize = 0;
/// Offset of the first undo record pointer. 8 bytes.
pub const TS_START: usize = 8;
/// Offset of the last undo record pointer. 8 bytes.
pub const TS_END: usize = 16;
/// Offset of the status word. 4 bytes.
pub const TS_STATUS: usize = 24;

/// Fixed segment-head fields before the slot array.
pub const UNDO_HEAD_FIXED: usize = 64;
/// Offset of the recorded recycle horizon (recovery CSN floor). 8 bytes.
pub const UH_MIN_SNAPSHOT: usize = 0;
/// Offset of the next free arena byte. 8 bytes.
pub const UH_FREE_BEGIN: usize = 8;
/// Offset of the first unrecycled arena byte. 8 bytes.
pub const UH_RECYCLED_BEGIN: usize = 16;
/// Offset of the recovery window start slot. 8 bytes.
pub const UH_RECOVERY_START: usize = 24;
/// Offset of the recovery window end slot. 8 bytes.
pub const UH_RECOVERY_END: usize = 32;
/// Offset of the next free slot id. 8 bytes.
pub const UH_NEXT_FREE_SLOT: usize = 40;
/// Offset of the next slot id to recycle. 8 bytes.
pub const UH_NEXT_RECYCLE_SLOT: usize = 48;
/// Offset of the public minimum live slot id. 8 bytes.
pub const UH_MIN_SLOT_ID: usize = 56;

/// Undo record head size.
pub const UNDO_REC_HEAD_SIZE: usize = 32;
/// Offset of the record kind. 2 bytes.
pub const UR_KIND: usize = 0;
/// Offset of the row length. 2 bytes.
pub const UR_ROW_LEN: usize = 2;
/// Offset of the packed delta length. 2 bytes (2 reserved).
pub const UR_DELTA_LEN: usize = 4;
/// Offset of the owning table's segment head. 4 bytes.
pub const UR_SEGHEAD: usize = 8;
/// Offset of the RowId. 4 bytes.
pub const UR_ROWID: usize = 12;
/// Offset of the payload length. 4 bytes (4 reserved).
pub const UR_PAYLOAD: usize = 16;
/// Offset of the previous-record pointer. 8 bytes.
pub const UR_PREV: usize = 24;

/// Staging buffer large enough for any single undo record.
pub const UNDO_RECORD_CACHE_SIZE: usize =
    UNDO_REC_HEAD_SIZE + TUPLE_HEAD_SIZE + MAX_TUPLE_LEN + 64;

/// Bits of a trx-slot / undo-record pointer holding the in-segment part.
pub const PTR_OFFSET_BITS: u32 = 48;
/// Mask extracting the in-segment part of a pointer.
pub const PTR_OFFSET_MASK: u64 = (1 << PTR_OFFSET_BITS) - 1;

// ── Transactions ────────────────────────────────────────────────────

/// Proc-array capacity (concurrent registered sessions).
pub const PROC_ARRAY_SIZE: usize = 1024;

// ── Index ───────────────────────────────────────────────────────────

/// Index slice length (leaf pool and oplog region): 64 MiB release, 1 MiB debug.
pub const INDEX_SLICE_LEN: usize = if cfg!(debug_assertions) {
    1024 * 1024
} else {
    64 * 1024 * 1024
};
/// Upper bound on slices per index file.
pub const INDEX_MAX_SLICES: usize = 4 * 1024;

/// Maximum encoded key length, including index-id prefix and RowId suffix.
pub const KEY_DATA_MAX: usize = 64;
/// On-media key buffer: length byte plus payload.
pub const KEYBUF_SIZE: usize = 1 + KEY_DATA_MAX;

/// Line points per leaf.
pub const LEAF_MAX_ENTRIES: usize = 95;
/// Arena allocation granule.
pub const KV_ALIGN: usize = 8;
/// KV arena bytes per leaf.
pub const LEAF_ARENA_SIZE: usize = 192 * KV_ALIGN;
/// Arena-offset value meaning "arena exhausted".
pub const LEAF_ARENA_FULL: u8 = 0xFF;
/// Staging-perm recyclable credit that triggers in-place shrink over split.
pub const LEAF_SHRINK_CREDIT: usize = 128;

/// Whole leaf block, header plus arena. Divides the slice length so a block
/// is always contiguous in one mapping.
pub const LEAF_BLOCK_SIZE: usize = 4096;
/// Sentinel for "no leaf".
pub const INVALID_LEAF: u32 = 0;

// Leaf header offsets. The version lock must stay 8-byte aligned.
pub const LF_MIN: usize = 0;
pub const LF_MAX: usize = KEYBUF_SIZE;
pub const LF_PREFIX: usize = 2 * KEYBUF_SIZE;
pub const LF_NEXT_KV: usize = 3 * KEYBUF_SIZE; // 195
pub const LF_CUR_PERM: usize = 196;
pub const LF_DELETED: usize = 197;
pub const LF_PERM0: usize = 200;
/// Perm array: count u8, recyclable u8, line points (offset, fingerprint) × entries.
pub const PERM_SIZE: usize = 2 + 2 * LEAF_MAX_ENTRIES; // 192
pub const LF_PERM1: usize = LF_PERM0 + PERM_SIZE; // 392
pub const LF_CUR: usize = 584;
pub const LF_PREV: usize = 588;
pub const LF_NEXT: usize = 592;
pub const LF_VERSION: usize = 600;
pub const LF_ARENA: usize = 608;

/// Oplog slots reserved per registered thread.
pub const OPLOG_SLOTS_PER_THREAD: usize = 128;
/// Threads the oplog region can host: 256 release, 64 debug.
pub const OPLOG_THREAD_CAPACITY: usize = if cfg!(debug_assertions) { 64 } else { 256 };

/// Oplog record size: fixed fields plus an old-leaf image for split
/// recovery. One page, so a record is always contiguous in one mapping.
pub const OP_RECORD_SIZE: usize = BLCKSZ;
// Oplog record offsets.
pub const OPR_OP: usize = 0;
pub const OPR_STEP: usize = 4;
pub const OPR_LAYERS: usize = 8;
pub const OPR_SEQ: usize = 16;
pub const OPR_KEY: usize = 24;
pub const OPR_OLD_LEAF: usize = 92;
pub const OPR_NEW_LEAF: usize = 96;
pub const OPR_IMAGE: usize = 128;

/// Bounded capacity of the combiner → worker channels.
pub const OPLOG_QUEUE_CAPACITY: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_fits() {
        // Leaf header plus arena fits the block, version lock stays aligned.
        assert!(LF_ARENA + LEAF_ARENA_SIZE <= LEAF_BLOCK_SIZE);
        assert_eq!(LF_VERSION % 8, 0);
        assert_eq!(LEAF_BLOCK_SIZE % KV_ALIGN, 0);
        assert!(LF_PERM1 + PERM_SIZE <= LF_CUR);
        // Arena offsets are stored in 8-byte granules in one byte.
        assert!(LEAF_ARENA_SIZE / KV_ALIGN <= LEAF_ARENA_FULL as usize);
        // An oplog record must hold its fixed fields plus a leaf image.
        assert!(OPR_IMAGE + LEAF_BLOCK_SIZE <= OP_RECORD_SIZE);
        // Neither structure may straddle a slice boundary: both sit in one
        // mapping only if their size divides the slice length.
        assert_eq!(INDEX_SLICE_LEN % LEAF_BLOCK_SIZE, 0);
        assert_eq!(INDEX_SLICE_LEN % OP_RECORD_SIZE, 0);
    }

    #[test]
    fn test_undo_head_fits_first_slice() {
        assert!(UNDO_HEAD_FIXED + UNDO_TRX_SLOTS * TRX_SLOT_SIZE <= UNDO_SLICE_LEN);
    }

    #[test]
    fn test_csn_spaces_disjoint() {
        // A trx-slot pointer always has the top bit clear.
        let ptr = ((UNDO_SEGMENT_COUNT as u64 - 1) << PTR_OFFSET_BITS) | PTR_OFFSET_MASK;
        assert!(ptr < INVALID_CSN);
        assert!(MIN_CSN > INVALID_CSN);
    }
}
