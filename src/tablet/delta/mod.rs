// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Delta storage: in-memory delta maps and on-disk REDO/UNDO files
//! keyed by (row id, timestamp).

mod dms;
mod file;
mod tracker;

pub use dms::DeltaMemStore;
pub use file::{DeltaFileIterator, DeltaFileReader, DeltaFileWriter, DeltaStats};
pub use tracker::DeltaTracker;

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};
use crate::schema::{ColumnId, Schema};
use crate::types::{PhysicalType, Timestamp, Value};

/// REDO deltas roll a row forward from its base; UNDO deltas roll it
/// back before the base was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaType {
    Redo,
    Undo,
}

/// Key of one delta record within a rowset.
///
/// File ordering is ascending row id, then timestamp: descending for
/// REDO (newest change first within a row), ascending for UNDO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeltaKey {
    pub row_id: u32,
    pub timestamp: Timestamp,
}

impl DeltaKey {
    pub fn new(row_id: u32, timestamp: Timestamp) -> DeltaKey {
        DeltaKey { row_id, timestamp }
    }

    /// Memcomparable encoding under the delta type's ordering.
    pub fn encode(&self, typ: DeltaType) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.put_u32(self.row_id);
        match typ {
            DeltaType::Redo => out.put_u64(!self.timestamp.0),
            DeltaType::Undo => out.put_u64(self.timestamp.0),
        }
        out
    }

    pub fn decode(mut data: &[u8], typ: DeltaType) -> Result<DeltaKey> {
        if data.remaining() < 12 {
            return Err(Error::corruption("delta key shorter than 12 bytes"));
        }
        let row_id = data.get_u32();
        let raw_ts = data.get_u64();
        let timestamp = match typ {
            DeltaType::Redo => Timestamp(!raw_ts),
            DeltaType::Undo => Timestamp(raw_ts),
        };
        Ok(DeltaKey { row_id, timestamp })
    }

    /// Smallest encoded key of the given row, for range seeks.
    pub fn encode_row_start(row_id: u32, typ: DeltaType) -> Vec<u8> {
        DeltaKey::new(
            row_id,
            match typ {
                DeltaType::Redo => Timestamp::MAX,
                DeltaType::Undo => Timestamp::MIN,
            },
        )
        .encode(typ)
    }
}

/// One column's new value inside an update. `Value::Null` sets the
/// cell to null.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnUpdate {
    pub column_id: ColumnId,
    pub value: Value,
}

/// A row mutation: the decoded form of a row change list.
#[derive(Clone, Debug, PartialEq)]
pub enum RowChange {
    Update(Vec<ColumnUpdate>),
    Delete,
    /// Makes a deleted row live again with the given column values.
    Reinsert(Vec<ColumnUpdate>),
}

const TAG_UPDATE: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_REINSERT: u8 = 3;

impl RowChange {
    pub fn update(updates: Vec<ColumnUpdate>) -> RowChange {
        RowChange::Update(updates)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RowChange::Delete)
    }

    pub fn is_reinsert(&self) -> bool {
        matches!(self, RowChange::Reinsert(_))
    }

    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        match self {
            RowChange::Delete => out.put_u8(TAG_DELETE),
            RowChange::Update(updates) | RowChange::Reinsert(updates) => {
                out.put_u8(if self.is_reinsert() {
                    TAG_REINSERT
                } else {
                    TAG_UPDATE
                });
                out.put_u32_le(updates.len() as u32);
                for u in updates {
                    out.put_u32_le(u.column_id);
                    if u.value.is_null() {
                        out.put_u8(1);
                        out.put_u32_le(0);
                    } else {
                        out.put_u8(0);
                        let mut cell = Vec::new();
                        u.value.put_le(&mut cell);
                        out.put_u32_le(cell.len() as u32);
                        out.extend_from_slice(&cell);
                    }
                }
            }
        }
        Bytes::from(out)
    }

    /// Decodes against the schema that was current when the change was
    /// written; unknown column ids are rejected.
    pub fn decode(mut data: &[u8], schema: &Schema) -> Result<RowChange> {
        if data.remaining() < 1 {
            return Err(Error::corruption("empty row change list"));
        }
        let tag = data.get_u8();
        match tag {
            TAG_DELETE => Ok(RowChange::Delete),
            TAG_UPDATE | TAG_REINSERT => {
                if data.remaining() < 4 {
                    return Err(Error::corruption("truncated row change list"));
                }
                let count = data.get_u32_le() as usize;
                let mut updates = Vec::with_capacity(count);
                for _ in 0..count {
                    if data.remaining() < 9 {
                        return Err(Error::corruption("truncated column update"));
                    }
                    let column_id = data.get_u32_le();
                    let is_null = data.get_u8() != 0;
                    let len = data.get_u32_le() as usize;
                    if data.remaining() < len {
                        return Err(Error::corruption("truncated column update value"));
                    }
                    let col_idx = schema.find_column_by_id(column_id).ok_or_else(|| {
                        Error::corruption(format!("unknown column id {column_id}"))
                    })?;
                    let value = if is_null {
                        Value::Null
                    } else {
                        let physical = schema.column(col_idx).data_type.physical_type();
                        let mut cell = &data[..len];
                        match physical {
                            PhysicalType::Binary => Value::Binary(Bytes::copy_from_slice(cell)),
                            _ => Value::get_le(physical, &mut cell),
                        }
                    };
                    data.advance(len);
                    updates.push(ColumnUpdate { column_id, value });
                }
                if tag == TAG_REINSERT {
                    Ok(RowChange::Reinsert(updates))
                } else {
                    Ok(RowChange::Update(updates))
                }
            }
            other => Err(Error::corruption(format!(
                "unknown row change tag {other}"
            ))),
        }
    }

    /// Applies the change to a row in schema order. `is_live` tracks
    /// deletion state across the history walk.
    pub fn apply_to_row(&self, schema: &Schema, row: &mut [Value], is_live: &mut bool) {
        match self {
            RowChange::Delete => *is_live = false,
            RowChange::Update(updates) => {
                for u in updates {
                    if let Some(idx) = schema.find_column_by_id(u.column_id) {
                        row[idx] = u.value.clone();
                    }
                }
            }
            RowChange::Reinsert(updates) => {
                *is_live = true;
                for u in updates {
                    if let Some(idx) = schema.find_column_by_id(u.column_id) {
                        row[idx] = u.value.clone();
                    }
                }
            }
        }
    }

    /// Builds the change that reverses applying `self` to `row`: the
    /// UNDO produced during flush and major compaction.
    pub fn reverse(&self, schema: &Schema, row_before: &[Value]) -> RowChange {
        match self {
            RowChange::Delete => {
                // Undoing a delete restores the pre-delete values.
                RowChange::Reinsert(snapshot_updates(schema, row_before))
            }
            RowChange::Update(updates) => RowChange::Update(
                updates
                    .iter()
                    .filter_map(|u| {
                        schema.find_column_by_id(u.column_id).map(|idx| ColumnUpdate {
                            column_id: u.column_id,
                            value: row_before[idx].clone(),
                        })
                    })
                    .collect(),
            ),
            RowChange::Reinsert(_) => RowChange::Delete,
        }
    }
}

/// Column updates capturing the full current state of `row`.
pub fn snapshot_updates(schema: &Schema, row: &[Value]) -> Vec<ColumnUpdate> {
    schema
        .columns()
        .iter()
        .enumerate()
        .filter_map(|(idx, col)| {
            col.id.map(|id| ColumnUpdate {
                column_id: id,
                value: row[idx].clone(),
            })
        })
        .collect()
}
