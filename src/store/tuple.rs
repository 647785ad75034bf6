//! Tuple representation: schemas, the NVM head codec, and update deltas.
//!
//! A row lives in NVM as a fixed 32-byte head ([`TupleHead`]) followed by the
//! packed column bytes of its body. The head carries the transaction info
//! word (a CSN once the writer committed, otherwise a transaction-slot
//! pointer), the undo pointer to the previous version, two flag words, and a
//! 64-bit null bitmap. [`RamTuple`] is the DRAM-side working copy used by the
//! heap access paths; it additionally tracks which columns an update touched
//! so the undo layer can log a column-level delta instead of the whole body.
//!
//! Schemas serialize with `serde`; the engine persists them as JSON documents
//! next to the tablespace so `open_table` can rebuild column layouts.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::store::constants::*;
use crate::store::trx::trx_info_is_csn;

/// Column types. The fixed-width types carry their own length; `Char` and
/// `Varchar` take it from the column definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColType {
    Int,
    Long,
    ULong,
    Float,
    Double,
    Char,
    Varchar,
}

impl ColType {
    /// Intrinsic byte width, or `None` for length-carrying types.
    pub fn fixed_len(self) -> Option<u32> {
        match self {
            ColType::Int | ColType::Float => Some(4),
            ColType::Long | ColType::ULong | ColType::Double => Some(8),
            ColType::Char | ColType::Varchar => None,
        }
    }
}

/// One column definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub col_type: ColType,
    pub len: u32,
    pub not_null: bool,
    /// Byte offset within the packed body; computed by [`TableSchema::new`].
    pub offset: u32,
}

impl ColumnDesc {
    /// A column of a fixed-width type.
    pub fn fixed(name: &str, col_type: ColType) -> ColumnDesc {
        let len = col_type
            .fixed_len()
            .expect("fixed() requires a fixed-width type");
        ColumnDesc {
            name: name.to_string(),
            col_type,
            len,
            not_null: false,
            offset: 0,
        }
    }

    /// A `Char`/`Varchar` column of the given capacity.
    pub fn var(name: &str, col_type: ColType, len: u32) -> ColumnDesc {
        assert!(col_type.fixed_len().is_none());
        ColumnDesc {
            name: name.to_string(),
            col_type,
            len,
            not_null: false,
            offset: 0,
        }
    }
}

/// A table's column layout.
#[derive(Debug, Serialize, Deserialize)]
pub struct TableSchema {
    cols: Vec<ColumnDesc>,
    row_len: u32,
}

impl TableSchema {
    /// Compute column offsets and the packed row length.
    pub fn new(mut cols: Vec<ColumnDesc>) -> Arc<TableSchema> {
        assert!(!cols.is_empty() && cols.len() <= MAX_COL_COUNT);
        let mut offset = 0u32;
        for c in &mut cols {
            c.offset = offset;
            offset += c.len;
        }
        assert!((offset as usize) <= MAX_TUPLE_LEN);
        Arc::new(TableSchema {
            cols,
            row_len: offset,
        })
    }

    pub fn col(&self, i: usize) -> &ColumnDesc {
        &self.cols[i]
    }

    pub fn col_count(&self) -> usize {
        self.cols.len()
    }

    pub fn row_len(&self) -> u32 {
        self.row_len
    }

    /// Full NVM footprint of one tuple slot.
    pub fn tuple_len(&self) -> usize {
        self.row_len as usize + TUPLE_HEAD_SIZE
    }
}

/// Full NVM footprint for a row of `row_len` body bytes.
pub fn real_tuple_size(row_len: u32) -> usize {
    row_len as usize + TUPLE_HEAD_SIZE
}

/// The fixed NVM tuple head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TupleHead {
    pub trx_info: u64,
    pub prev: u64,
    pub flag1: u32,
    pub flag2: u16,
    pub len: u16,
    pub null_bits: u64,
}

impl TupleHead {
    pub fn read(buf: &[u8]) -> TupleHead {
        TupleHead {
            trx_info: LittleEndian::read_u64(&buf[TH_TRX_INFO..]),
            prev: LittleEndian::read_u64(&buf[TH_PREV..]),
            flag1: LittleEndian::read_u32(&buf[TH_FLAG1..]),
            flag2: LittleEndian::read_u16(&buf[TH_FLAG2_LEN..]),
            len: LittleEndian::read_u16(&buf[TH_FLAG2_LEN + 2..]),
            null_bits: LittleEndian::read_u64(&buf[TH_NULL..]),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[TH_TRX_INFO..], self.trx_info);
        LittleEndian::write_u64(&mut buf[TH_PREV..], self.prev);
        LittleEndian::write_u32(&mut buf[TH_FLAG1..], self.flag1);
        LittleEndian::write_u16(&mut buf[TH_FLAG2_LEN..], self.flag2);
        LittleEndian::write_u16(&mut buf[TH_FLAG2_LEN + 2..], self.len);
        LittleEndian::write_u64(&mut buf[TH_NULL..], self.null_bits);
    }

    pub fn is_used(&self) -> bool {
        self.flag1 & TUPLE_USED != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flag1 & TUPLE_DELETED != 0
    }
}

/// One recorded column update: (body offset, length).
pub type UpdatedCol = (u32, u32);

/// DRAM working copy of a tuple.
pub struct RamTuple {
    pub head: TupleHead,
    schema: Arc<TableSchema>,
    data: Vec<u8>,
    updated: Vec<UpdatedCol>,
    update_len: u32,
}

impl RamTuple {
    pub fn new(schema: &Arc<TableSchema>) -> RamTuple {
        RamTuple {
            head: TupleHead::default(),
            schema: schema.clone(),
            data: vec![0u8; schema.row_len() as usize],
            updated: Vec::new(),
            update_len: 0,
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn row_len(&self) -> u32 {
        self.schema.row_len()
    }

    pub fn body(&self) -> &[u8] {
        &self.data
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn col_range(&self, i: usize) -> std::ops::Range<usize> {
        let c = self.schema.col(i);
        let start = c.offset as usize;
        start..start + c.len as usize
    }

    /// Set a column value without recording an update delta.
    pub fn set_col(&mut self, i: usize, bytes: &[u8]) {
        let r = self.col_range(i);
        assert!(bytes.len() <= r.len());
        self.data[r.start..r.start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn get_col(&self, i: usize) -> &[u8] {
        &self.data[self.col_range(i)]
    }

    pub fn col_eq(&self, i: usize, bytes: &[u8]) -> bool {
        self.get_col(i)[..bytes.len()] == *bytes
    }

    /// Set a column value and record it for the next `heap_update`.
    pub fn update_col(&mut self, i: usize, bytes: &[u8]) {
        let (offset, len) = {
            let c = self.schema.col(i);
            (c.offset, c.len)
        };
        self.set_col(i, bytes);
        self.updated.push((offset, len));
        self.update_len += len;
    }

    /// Columns recorded since the last [`Self::clear_updates`].
    pub fn updated_cols(&self) -> (&[UpdatedCol], u32) {
        (&self.updated, self.update_len)
    }

    pub fn clear_updates(&mut self) {
        self.updated.clear();
        self.update_len = 0;
    }

    pub fn is_null(&self, i: usize) -> bool {
        self.head.null_bits & (1 << i) != 0
    }

    pub fn set_null(&mut self, i: usize, null: bool) {
        if null {
            self.head.null_bits |= 1 << i;
        } else {
            self.head.null_bits &= !(1 << i);
        }
    }

    pub fn copy_row_from(&mut self, other: &RamTuple) {
        debug_assert_eq!(self.data.len(), other.data.len());
        self.data.copy_from_slice(&other.data);
    }

    pub fn row_eq(&self, other: &RamTuple) -> bool {
        self.data == other.data
    }

    /// Stamp the head for an in-place write: `len` tracks the schema row
    /// length and the reserved `flag2` bits stay zero.
    pub fn init_head(&mut self, trx_info: u64, prev: u64, flag1: u32) {
        self.head.trx_info = trx_info;
        self.head.prev = prev;
        self.head.flag1 = flag1;
        self.head.flag2 = 0;
        self.head.len = self.schema.row_len() as u16;
    }

    /// Serialize head + body into an NVM tuple slot.
    pub fn serialize(&self, out: &mut [u8]) {
        assert!(out.len() >= TUPLE_HEAD_SIZE + self.data.len());
        self.head.write(out);
        out[TUPLE_HEAD_SIZE..TUPLE_HEAD_SIZE + self.data.len()].copy_from_slice(&self.data);
    }

    /// Load head + body from an NVM tuple image.
    ///
    /// Panics if the reserved `flag2` bits are nonzero: nothing ever writes
    /// them, so a nonzero value is corruption, not user error.
    pub fn deserialize(&mut self, buf: &[u8]) {
        self.head = TupleHead::read(buf);
        assert_eq!(self.head.flag2, 0, "reserved tuple flag bits set");
        let n = self.data.len();
        self.data.copy_from_slice(&buf[TUPLE_HEAD_SIZE..TUPLE_HEAD_SIZE + n]);
    }

    pub fn is_used(&self) -> bool {
        self.head.is_used()
    }

    pub fn is_deleted(&self) -> bool {
        self.head.is_deleted()
    }

    pub fn trx_info_is_csn(&self) -> bool {
        trx_info_is_csn(self.head.trx_info)
    }

    /// Whether an older version hangs off this one in the undo arena.
    pub fn has_prev_version(&self) -> bool {
        self.head.prev != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<TableSchema> {
        TableSchema::new(vec![
            ColumnDesc::fixed("a", ColType::Int),
            ColumnDesc::fixed("b", ColType::Long),
            ColumnDesc::var("name", ColType::Varchar, 16),
        ])
    }

    #[test]
    fn test_schema_offsets() {
        let s = schema();
        assert_eq!(s.col(0).offset, 0);
        assert_eq!(s.col(1).offset, 4);
        assert_eq!(s.col(2).offset, 12);
        assert_eq!(s.row_len(), 28);
        assert_eq!(s.tuple_len(), 28 + TUPLE_HEAD_SIZE);
    }

    #[test]
    fn test_head_codec_roundtrip() {
        let head = TupleHead {
            trx_info: MIN_CSN + 5,
            prev: 0xABCD,
            flag1: TUPLE_USED | TUPLE_DELETED,
            flag2: 0,
            len: 28,
            null_bits: 0b101,
        };
        let mut buf = [0u8; TUPLE_HEAD_SIZE];
        head.write(&mut buf);
        assert_eq!(TupleHead::read(&buf), head);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let s = schema();
        let mut t = RamTuple::new(&s);
        t.set_col(0, &7i32.to_le_bytes());
        t.set_col(1, &(-9i64).to_le_bytes());
        t.set_col(2, b"pmem");
        t.set_null(1, true);
        t.init_head(MIN_CSN + 1, 0, TUPLE_USED);

        let mut slot = vec![0u8; s.tuple_len()];
        t.serialize(&mut slot);

        let mut back = RamTuple::new(&s);
        back.deserialize(&slot);
        assert!(back.row_eq(&t));
        assert!(back.is_used());
        assert!(back.is_null(1));
        assert!(!back.is_null(0));
        assert!(back.trx_info_is_csn());
    }

    #[test]
    #[should_panic(expected = "reserved tuple flag bits")]
    fn test_nonzero_reserved_flag_rejected() {
        let s = schema();
        let mut slot = vec![0u8; s.tuple_len()];
        LittleEndian::write_u16(&mut slot[TH_FLAG2_LEN..], 1);
        let mut t = RamTuple::new(&s);
        t.deserialize(&slot);
    }

    #[test]
    fn test_update_tracking() {
        let s = schema();
        let mut t = RamTuple::new(&s);
        t.update_col(1, &5i64.to_le_bytes());
        t.update_col(0, &3i32.to_le_bytes());
        let (cols, len) = t.updated_cols();
        assert_eq!(cols, &[(4, 8), (0, 4)]);
        assert_eq!(len, 12);
        t.clear_updates();
        assert_eq!(t.updated_cols().0.len(), 0);
    }
}
