//! Table objects: a schema, a segment, and the RowId map fronting it.
//!
//! The binary catalog on tablespace page 1 maps `oid -> seghead`; the column
//! layout itself is persisted as a JSON schema document in directory shard 0
//! (`table_<oid>.schema.json`) and reloaded by `open_table` after a restart.

use std::sync::Arc;

use crate::store::constants::*;
use crate::store::rowid_map::RowIdMap;
use crate::store::tuple::TableSchema;

/// An open table.
pub struct Table {
    oid: u32,
    seghead: PageNo,
    schema: Arc<TableSchema>,
    map: Arc<RowIdMap>,
}

impl Table {
    pub(crate) fn new(
        oid: u32,
        seghead: PageNo,
        schema: Arc<TableSchema>,
        map: Arc<RowIdMap>,
    ) -> Table {
        Table {
            oid,
            seghead,
            schema,
            map,
        }
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    /// Root page of the table's segment; the engine-wide identity of this
    /// table's row store.
    pub fn seghead(&self) -> PageNo {
        self.seghead
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn row_len(&self) -> u32 {
        self.schema.row_len()
    }

    pub fn rowid_map(&self) -> &Arc<RowIdMap> {
        &self.map
    }
}
