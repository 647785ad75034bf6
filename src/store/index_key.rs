//! Index keys: bounded byte strings with order-preserving column encoding.
//!
//! An encoded key is `[index_id BE] [column values] [RowId BE]`. The leading
//! index id lets several indexes share one ordered map; the trailing RowId
//! makes every key unique so duplicate column values coexist. Column values
//! are encoded so that a bytewise comparison matches the column type's
//! natural order: big-endian with a flipped sign bit for signed integers,
//! big-endian for unsigned, the classic sign-fold for floats, raw padded
//! bytes for fixed-length strings.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::store::constants::{RowId, KEY_DATA_MAX};
use crate::store::tuple::{ColType, TableSchema};

/// A bounded, inline index key.
#[derive(Clone, Copy)]
pub struct IndexKey {
    len: u8,
    data: [u8; KEY_DATA_MAX],
}

impl IndexKey {
    pub fn empty() -> IndexKey {
        IndexKey {
            len: 0,
            data: [0; KEY_DATA_MAX],
        }
    }

    /// The key ordering above every encodable key (the tail sentinel bound).
    pub fn max_key() -> IndexKey {
        IndexKey {
            len: KEY_DATA_MAX as u8,
            data: [0xFF; KEY_DATA_MAX],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> IndexKey {
        assert!(bytes.len() <= KEY_DATA_MAX);
        let mut k = IndexKey::empty();
        k.len = bytes.len() as u8;
        k.data[..bytes.len()].copy_from_slice(bytes);
        k
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let start = self.len as usize;
        assert!(start + bytes.len() <= KEY_DATA_MAX);
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len() as u8;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Serialize into a `KEYBUF_SIZE` on-media buffer (length byte + bytes).
    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.len;
        out[1..1 + self.len as usize].copy_from_slice(self.as_bytes());
    }

    /// Read back from a `KEYBUF_SIZE` on-media buffer.
    pub fn read(buf: &[u8]) -> IndexKey {
        let len = buf[0] as usize;
        assert!(len <= KEY_DATA_MAX, "corrupt key length {}", len);
        IndexKey::from_bytes(&buf[1..1 + len])
    }

    /// The key with this key's prefix of `n` bytes removed.
    pub fn suffix(&self, n: usize) -> IndexKey {
        IndexKey::from_bytes(&self.as_bytes()[n..])
    }

    /// `prefix · self`.
    pub fn with_prefix(&self, prefix: &IndexKey) -> IndexKey {
        let mut k = *prefix;
        k.push(self.as_bytes());
        k
    }

    /// Length of the shared prefix of two keys.
    pub fn common_prefix_len(&self, other: &IndexKey) -> usize {
        self.as_bytes()
            .iter()
            .zip(other.as_bytes())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl std::fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IndexKey(")?;
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl Default for IndexKey {
    fn default() -> Self {
        IndexKey::empty()
    }
}

/// One indexed column, by position in the table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexColumnDesc {
    pub col_id: u32,
}

/// The key layout of one index over a table schema.
pub struct IndexSchema {
    table: Arc<TableSchema>,
    cols: Vec<IndexColumnDesc>,
    key_len: u32,
}

impl IndexSchema {
    pub fn new(table: Arc<TableSchema>, cols: Vec<IndexColumnDesc>) -> IndexSchema {
        let key_len: u32 = cols.iter().map(|c| table.col(c.col_id as usize).len).sum();
        // index id + columns + rowid must fit the key cap.
        assert!(4 + key_len as usize + 4 <= KEY_DATA_MAX, "index key too long");
        IndexSchema {
            table,
            cols,
            key_len,
        }
    }

    pub fn col_count(&self) -> usize {
        self.cols.len()
    }

    pub fn key_len(&self) -> u32 {
        self.key_len
    }
}

/// DRAM staging tuple for index operations: the raw (unencoded) values of the
/// indexed columns, in index column order.
pub struct IndexTuple {
    values: Vec<u8>,
    offsets: Vec<u32>,
}

impl IndexTuple {
    pub fn new(schema: &IndexSchema) -> IndexTuple {
        let mut offsets = Vec::with_capacity(schema.col_count());
        let mut off = 0u32;
        for c in &schema.cols {
            offsets.push(off);
            off += schema.table.col(c.col_id as usize).len;
        }
        IndexTuple {
            values: vec![0u8; off as usize],
            offsets,
        }
    }

    /// Set the `i`-th index column (positional, not table column id).
    pub fn set_col(&mut self, i: usize, bytes: &[u8]) {
        let start = self.offsets[i] as usize;
        self.values[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn col_bytes(&self, schema: &IndexSchema, i: usize) -> &[u8] {
        let start = self.offsets[i] as usize;
        let len = schema.table.col(schema.cols[i].col_id as usize).len as usize;
        &self.values[start..start + len]
    }
}

fn encode_col(out: &mut IndexKey, col_type: ColType, raw: &[u8]) {
    match col_type {
        ColType::Int => {
            let v = i32::from_le_bytes(raw[..4].try_into().unwrap());
            let mut b = [0u8; 4];
            BigEndian::write_u32(&mut b, (v as u32) ^ 0x8000_0000);
            out.push(&b);
        }
        ColType::Long => {
            let v = i64::from_le_bytes(raw[..8].try_into().unwrap());
            let mut b = [0u8; 8];
            BigEndian::write_u64(&mut b, (v as u64) ^ 0x8000_0000_0000_0000);
            out.push(&b);
        }
        ColType::ULong => {
            let v = u64::from_le_bytes(raw[..8].try_into().unwrap());
            let mut b = [0u8; 8];
            BigEndian::write_u64(&mut b, v);
            out.push(&b);
        }
        ColType::Float => {
            let bits = u32::from_le_bytes(raw[..4].try_into().unwrap());
            let folded = if bits & 0x8000_0000 != 0 {
                !bits
            } else {
                bits | 0x8000_0000
            };
            let mut b = [0u8; 4];
            BigEndian::write_u32(&mut b, folded);
            out.push(&b);
        }
        ColType::Double => {
            let bits = u64::from_le_bytes(raw[..8].try_into().unwrap());
            let folded = if bits & 0x8000_0000_0000_0000 != 0 {
                !bits
            } else {
                bits | 0x8000_0000_0000_0000
            };
            let mut b = [0u8; 8];
            BigEndian::write_u64(&mut b, folded);
            out.push(&b);
        }
        ColType::Char | ColType::Varchar => out.push(raw),
    }
}

/// Encode a full key: index id, column values, RowId.
pub fn encode_key(
    schema: &IndexSchema,
    index_id: u32,
    tuple: &IndexTuple,
    rowid: RowId,
) -> IndexKey {
    let mut key = IndexKey::empty();
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, index_id);
    key.push(&b);
    for (i, c) in schema.cols.iter().enumerate() {
        let ct = schema.table.col(c.col_id as usize).col_type;
        encode_col(&mut key, ct, tuple.col_bytes(schema, i));
    }
    BigEndian::write_u32(&mut b, rowid);
    key.push(&b);
    key
}

/// The RowId suffix of an encoded key.
pub fn decode_rowid(key: &IndexKey) -> RowId {
    let b = key.as_bytes();
    BigEndian::read_u32(&b[b.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tuple::ColumnDesc;

    fn schema() -> IndexSchema {
        let table = TableSchema::new(vec![
            ColumnDesc::fixed("a", ColType::Int),
            ColumnDesc::fixed("b", ColType::Long),
            ColumnDesc::var("s", ColType::Char, 8),
        ]);
        IndexSchema::new(
            table,
            vec![
                IndexColumnDesc { col_id: 0 },
                IndexColumnDesc { col_id: 1 },
                IndexColumnDesc { col_id: 2 },
            ],
        )
    }

    fn key_for(a: i32, b: i64, s: &[u8], rowid: RowId) -> IndexKey {
        let sc = schema();
        let mut t = IndexTuple::new(&sc);
        t.set_col(0, &a.to_le_bytes());
        t.set_col(1, &b.to_le_bytes());
        t.set_col(2, s);
        encode_key(&sc, 1, &t, rowid)
    }

    #[test]
    fn test_signed_int_order_preserved() {
        let pairs = [
            (-100, -1),
            (-1, 0),
            (0, 1),
            (1, 100),
            (i32::MIN, i32::MAX),
        ];
        for (lo, hi) in pairs {
            assert!(
                key_for(lo, 0, b"", 0) < key_for(hi, 0, b"", 0),
                "{} !< {}",
                lo,
                hi
            );
        }
    }

    #[test]
    fn test_column_priority() {
        // First column dominates the second.
        assert!(key_for(1, 999, b"", 0) < key_for(2, -999, b"", 0));
        // Equal first column: second decides.
        assert!(key_for(1, -5, b"", 0) < key_for(1, 5, b"", 0));
    }

    #[test]
    fn test_rowid_breaks_ties() {
        let a = key_for(1, 1, b"x", 1);
        let b = key_for(1, 1, b"x", 2);
        assert!(a < b);
        assert_eq!(decode_rowid(&a), 1);
        assert_eq!(decode_rowid(&b), 2);
    }

    #[test]
    fn test_keybuf_roundtrip() {
        let k = key_for(7, -7, b"pmstore!", 42);
        let mut buf = [0u8; crate::store::constants::KEYBUF_SIZE];
        k.write(&mut buf);
        assert_eq!(IndexKey::read(&buf), k);
    }

    #[test]
    fn test_prefix_ops() {
        let a = IndexKey::from_bytes(b"abcdef");
        let b = IndexKey::from_bytes(b"abcxyz");
        assert_eq!(a.common_prefix_len(&b), 3);
        let suf = a.suffix(3);
        assert_eq!(suf.as_bytes(), b"def");
        let p = IndexKey::from_bytes(b"abc");
        assert_eq!(suf.with_prefix(&p), a);
    }

    #[test]
    fn test_max_key_dominates() {
        assert!(key_for(i32::MAX, i64::MAX, b"\xff\xff\xff\xff\xff\xff\xff\xff", u32::MAX - 1) < IndexKey::max_key());
    }
}
