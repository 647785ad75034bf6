//! Undo records: codec, prepare paths, and rollback routines.
//!
//! Every mutation appends one record to the transaction's bound undo segment
//! before touching the row or index entry. A record is a fixed 32-byte head
//! plus a payload whose shape depends on the kind:
//!
//! * `HeapInsert` — no payload; rollback clears the USED flag.
//! * `HeapUpdate` — the old tuple head plus a packed delta of only the
//!   columns the update touched; rollback restores head and delta.
//! * `HeapDelete` — the old tuple head plus the full old body.
//! * `IndexInsert` — the encoded key; the head's `seghead`/`row_id` words are
//!   overloaded to carry the cover CSN written back on rollback (an insert is
//!   never physically removed, so earlier readers keep their view).
//! * `IndexDelete` — the encoded key; rollback re-marks the entry live.
//!
//! Records chain backwards per transaction through `prev`; the slot's `end`
//! pointer is the chain head.

use byteorder::{ByteOrder, LittleEndian};

use crate::store::constants::*;
use crate::store::db::EngineInner;
use crate::store::index_key::IndexKey;
use crate::store::index_log::ThreadLog;
use crate::store::session::Session;
use crate::store::tuple::{RamTuple, TupleHead};

/// Undo record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    HeapInsert = 1,
    HeapUpdate = 2,
    HeapDelete = 3,
    IndexInsert = 4,
    IndexDelete = 5,
}

impl UndoKind {
    pub fn from_u16(v: u16) -> UndoKind {
        match v {
            1 => UndoKind::HeapInsert,
            2 => UndoKind::HeapUpdate,
            3 => UndoKind::HeapDelete,
            4 => UndoKind::IndexInsert,
            5 => UndoKind::IndexDelete,
            k => panic!("corrupt undo record kind {}", k),
        }
    }
}

/// Parsed undo record head.
#[derive(Debug, Clone, Copy)]
pub struct UndoRecHead {
    pub kind: UndoKind,
    pub row_len: u16,
    pub delta_len: u16,
    pub seghead: u32,
    pub row_id: u32,
    pub payload: u32,
    pub prev: u64,
}

impl UndoRecHead {
    pub fn read(buf: &[u8]) -> UndoRecHead {
        UndoRecHead {
            kind: UndoKind::from_u16(LittleEndian::read_u16(&buf[UR_KIND..])),
            row_len: LittleEndian::read_u16(&buf[UR_ROW_LEN..]),
            delta_len: LittleEndian::read_u16(&buf[UR_DELTA_LEN..]),
            seghead: LittleEndian::read_u32(&buf[UR_SEGHEAD..]),
            row_id: LittleEndian::read_u32(&buf[UR_ROWID..]),
            payload: LittleEndian::read_u32(&buf[UR_PAYLOAD..]),
            prev: LittleEndian::read_u64(&buf[UR_PREV..]),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..UNDO_REC_HEAD_SIZE].fill(0);
        LittleEndian::write_u16(&mut buf[UR_KIND..], self.kind as u16);
        LittleEndian::write_u16(&mut buf[UR_ROW_LEN..], self.row_len);
        LittleEndian::write_u16(&mut buf[UR_DELTA_LEN..], self.delta_len);
        LittleEndian::write_u32(&mut buf[UR_SEGHEAD..], self.seghead);
        LittleEndian::write_u32(&mut buf[UR_ROWID..], self.row_id);
        LittleEndian::write_u32(&mut buf[UR_PAYLOAD..], self.payload);
        LittleEndian::write_u64(&mut buf[UR_PREV..], self.prev);
    }

    pub fn total_len(&self) -> usize {
        UNDO_REC_HEAD_SIZE + self.payload as usize
    }
}

/// Delta entry head: (col_offset u32, col_len u32).
const DELTA_HEAD: usize = 8;

/// Bytes a packed delta of the given updates occupies.
pub fn delta_size(updated: &[(u32, u32)], update_len: u32) -> usize {
    updated.len() * DELTA_HEAD + update_len as usize
}

/// Pack `[offset, len, bytes]` triples for the touched columns of `body`.
pub fn pack_delta(body: &[u8], updated: &[(u32, u32)], out: &mut [u8]) {
    let mut pos = 0;
    for &(off, len) in updated {
        LittleEndian::write_u32(&mut out[pos..], off);
        LittleEndian::write_u32(&mut out[pos + 4..], len);
        pos += DELTA_HEAD;
        out[pos..pos + len as usize]
            .copy_from_slice(&body[off as usize..(off + len) as usize]);
        pos += len as usize;
    }
}

/// Apply a packed delta onto a tuple body.
pub fn unpack_delta(body: &mut [u8], mut delta: &[u8]) {
    while !delta.is_empty() {
        let off = LittleEndian::read_u32(delta) as usize;
        let len = LittleEndian::read_u32(&delta[4..]) as usize;
        delta = &delta[DELTA_HEAD..];
        body[off..off + len].copy_from_slice(&delta[..len]);
        delta = &delta[len..];
    }
}

// ── Prepare paths ───────────────────────────────────────────────────
//
// Each builds the record into the session's staging buffer and appends it to
// the bound segment; the session links `prev` to the slot's current chain
// head.

pub fn prepare_insert_undo(s: &mut Session, seghead: PageNo, rowid: RowId, row_len: u16) -> u64 {
    let head = UndoRecHead {
        kind: UndoKind::HeapInsert,
        row_len,
        delta_len: 0,
        seghead,
        row_id: rowid,
        payload: 0,
        prev: 0,
    };
    s.stage_undo_head(&head);
    s.insert_undo_record(head.total_len())
}

pub fn prepare_update_undo(
    s: &mut Session,
    seghead: PageNo,
    rowid: RowId,
    old_head: &TupleHead,
    old_body: &[u8],
    updated: &[(u32, u32)],
    update_len: u32,
) -> u64 {
    let delta_len = delta_size(updated, update_len);
    let head = UndoRecHead {
        kind: UndoKind::HeapUpdate,
        row_len: old_head.len,
        delta_len: delta_len as u16,
        seghead,
        row_id: rowid,
        payload: (TUPLE_HEAD_SIZE + delta_len) as u32,
        prev: 0,
    };
    s.stage_undo_head(&head);
    {
        let buf = s.undo_stage();
        old_head.write(&mut buf[UNDO_REC_HEAD_SIZE..]);
        pack_delta(
            old_body,
            updated,
            &mut buf[UNDO_REC_HEAD_SIZE + TUPLE_HEAD_SIZE..],
        );
    }
    s.insert_undo_record(head.total_len())
}

pub fn prepare_delete_undo(
    s: &mut Session,
    seghead: PageNo,
    rowid: RowId,
    old_head: &TupleHead,
    old_body: &[u8],
) -> u64 {
    let head = UndoRecHead {
        kind: UndoKind::HeapDelete,
        row_len: old_head.len,
        delta_len: 0,
        seghead,
        row_id: rowid,
        payload: (TUPLE_HEAD_SIZE + old_body.len()) as u32,
        prev: 0,
    };
    s.stage_undo_head(&head);
    {
        let buf = s.undo_stage();
        old_head.write(&mut buf[UNDO_REC_HEAD_SIZE..]);
        buf[UNDO_REC_HEAD_SIZE + TUPLE_HEAD_SIZE
            ..UNDO_REC_HEAD_SIZE + TUPLE_HEAD_SIZE + old_body.len()]
            .copy_from_slice(old_body);
    }
    s.insert_undo_record(head.total_len())
}

/// `cover_csn` is the inserter's snapshot; rollback writes it as the entry
/// value so transactions that could already see the key keep seeing it.
pub fn prepare_index_insert_undo(s: &mut Session, key: &IndexKey, cover_csn: u64) -> u64 {
    let head = UndoRecHead {
        kind: UndoKind::IndexInsert,
        row_len: 0,
        delta_len: 0,
        // The heap words are meaningless for index undo; they carry the CSN.
        seghead: (cover_csn >> 32) as u32,
        row_id: cover_csn as u32,
        payload: KEYBUF_SIZE as u32,
        prev: 0,
    };
    s.stage_undo_head(&head);
    {
        let buf = s.undo_stage();
        key.write(&mut buf[UNDO_REC_HEAD_SIZE..]);
    }
    s.insert_undo_record(head.total_len())
}

pub fn prepare_index_delete_undo(s: &mut Session, key: &IndexKey) -> u64 {
    let head = UndoRecHead {
        kind: UndoKind::IndexDelete,
        row_len: 0,
        delta_len: 0,
        seghead: INVALID_PAGENO,
        row_id: INVALID_ROWID,
        payload: KEYBUF_SIZE as u32,
        prev: 0,
    };
    s.stage_undo_head(&head);
    {
        let buf = s.undo_stage();
        key.write(&mut buf[UNDO_REC_HEAD_SIZE..]);
    }
    s.insert_undo_record(head.total_len())
}

// ── Rollback ────────────────────────────────────────────────────────

/// Invert one undo record. `rec` is a copied record image (head + payload);
/// `log` is an index oplog handle for structural maintenance during index
/// rollbacks.
pub fn rollback_record(engine: &EngineInner, log: &ThreadLog, rec: &[u8]) {
    let head = UndoRecHead::read(rec);
    let payload = &rec[UNDO_REC_HEAD_SIZE..head.total_len()];
    match head.kind {
        UndoKind::HeapInsert => {
            let map = engine.rowid_map_for(head.seghead, head.row_len as u32);
            let entry = map.entry(head.row_id, false).expect("insert undo target");
            let g = entry.lock(map.tuple_len());
            let nvm = g.nvm_bytes();
            let mut th = TupleHead::read(nvm);
            th.flag1 &= !TUPLE_USED;
            th.write(nvm);
            map.persist_slot(head.row_id);
            if let Some(cache) = g.cache_bytes() {
                th.write(cache);
            }
        }
        UndoKind::HeapUpdate => {
            let map = engine.rowid_map_for(head.seghead, head.row_len as u32);
            let entry = map.entry(head.row_id, false).expect("update undo target");
            let g = entry.lock(map.tuple_len());
            let nvm = g.nvm_bytes();
            nvm[..TUPLE_HEAD_SIZE].copy_from_slice(&payload[..TUPLE_HEAD_SIZE]);
            unpack_delta(
                &mut nvm[TUPLE_HEAD_SIZE..],
                &payload[TUPLE_HEAD_SIZE..TUPLE_HEAD_SIZE + head.delta_len as usize],
            );
            map.persist_slot(head.row_id);
            g.sync_cache();
        }
        UndoKind::HeapDelete => {
            let map = engine.rowid_map_for(head.seghead, head.row_len as u32);
            let entry = map.entry(head.row_id, false).expect("delete undo target");
            let g = entry.lock(map.tuple_len());
            let nvm = g.nvm_bytes();
            nvm[..head.payload as usize].copy_from_slice(payload);
            map.persist_slot(head.row_id);
            g.sync_cache();
        }
        UndoKind::IndexInsert => {
            let csn = ((head.seghead as u64) << 32) | head.row_id as u64;
            let key = IndexKey::read(payload);
            engine.index_runtime().insert(log, &key, csn);
        }
        UndoKind::IndexDelete => {
            let key = IndexKey::read(payload);
            engine.index_runtime().insert(log, &key, INVALID_CSN);
        }
    }
}

/// Apply an update undo record to a DRAM tuple during a version-chain walk.
pub fn apply_update_to_tuple(rec: &[u8], tuple: &mut RamTuple) {
    let head = UndoRecHead::read(rec);
    debug_assert_eq!(head.kind, UndoKind::HeapUpdate);
    let payload = &rec[UNDO_REC_HEAD_SIZE..head.total_len()];
    tuple.head = TupleHead::read(payload);
    unpack_delta(
        tuple.body_mut(),
        &payload[TUPLE_HEAD_SIZE..TUPLE_HEAD_SIZE + head.delta_len as usize],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_codec_roundtrip() {
        let h = UndoRecHead {
            kind: UndoKind::HeapUpdate,
            row_len: 128,
            delta_len: 24,
            seghead: 7,
            row_id: 42,
            payload: 56,
            prev: 0xDEAD_BEEF,
        };
        let mut buf = [0u8; UNDO_REC_HEAD_SIZE];
        h.write(&mut buf);
        let back = UndoRecHead::read(&buf);
        assert_eq!(back.kind, UndoKind::HeapUpdate);
        assert_eq!(back.row_len, 128);
        assert_eq!(back.delta_len, 24);
        assert_eq!(back.seghead, 7);
        assert_eq!(back.row_id, 42);
        assert_eq!(back.payload, 56);
        assert_eq!(back.prev, 0xDEAD_BEEF);
    }

    #[test]
    fn test_delta_roundtrip_restores_old_bytes() {
        let old = (0u8..32).collect::<Vec<_>>();
        let updated = [(4u32, 4u32), (20u32, 8u32)];
        let mut delta = vec![0u8; delta_size(&updated, 12)];
        pack_delta(&old, &updated, &mut delta);

        // Clobber the columns, then undo them.
        let mut body = old.clone();
        body[4..8].fill(0xFF);
        body[20..28].fill(0xEE);
        unpack_delta(&mut body, &delta);
        assert_eq!(body, old);
    }

    #[test]
    fn test_delta_size() {
        assert_eq!(delta_size(&[], 0), 0);
        assert_eq!(delta_size(&[(0, 4)], 4), 12);
        assert_eq!(delta_size(&[(0, 4), (8, 8)], 12), 28);
    }
}
