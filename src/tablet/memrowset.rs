// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! The MemRowSet: an ordered in-memory index from encoded primary key
//! to row, with a per-row mutation chain of (timestamp, change).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use super::delta::RowChange;
use crate::error::{Error, Result};
use crate::schema::SchemaRef;
use crate::types::{Timestamp, Value};

pub struct MrsEntry {
    /// The row as inserted; mutations are layered on at read time.
    pub row: Vec<Value>,
    pub insert_timestamp: Timestamp,
    /// Commit order.
    pub mutations: Vec<(Timestamp, RowChange)>,
}

struct MrsInner {
    rows: BTreeMap<Vec<u8>, MrsEntry>,
    min_insert_timestamp: Timestamp,
}

pub struct MemRowSet {
    id: u64,
    schema: SchemaRef,
    inner: RwLock<MrsInner>,
    approx_bytes: AtomicUsize,
    created_at: Instant,
}

impl MemRowSet {
    pub fn new(id: u64, schema: SchemaRef) -> MemRowSet {
        MemRowSet {
            id,
            schema,
            inner: RwLock::new(MrsInner {
                rows: BTreeMap::new(),
                min_insert_timestamp: Timestamp::MAX,
            }),
            approx_bytes: AtomicUsize::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().rows.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.read().rows.len()
    }

    pub fn approx_size_bytes(&self) -> usize {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    pub fn min_insert_timestamp(&self) -> Timestamp {
        self.inner.read().min_insert_timestamp
    }

    fn row_weight(row: &[Value]) -> usize {
        row.iter()
            .map(|v| match v {
                Value::Binary(b) => 16 + b.len(),
                _ => 16,
            })
            .sum()
    }

    /// Inserts a new row. `AlreadyPresent` if a live row holds the
    /// key; reinserting over a deleted row appends to its chain.
    pub fn insert(&self, timestamp: Timestamp, row: Vec<Value>) -> Result<()> {
        let key = self.schema.encode_key(&row);
        let weight = Self::row_weight(&row);
        let mut inner = self.inner.write();
        if let Some(entry) = inner.rows.get_mut(&key) {
            let mut state = entry.row.clone();
            let mut live = true;
            for (_, change) in &entry.mutations {
                change.apply_to_row(&self.schema, &mut state, &mut live);
            }
            if live {
                return Err(Error::already_present("key already present in MemRowSet"));
            }
            let updates = super::delta::snapshot_updates(&self.schema, &row);
            entry.mutations.push((timestamp, RowChange::Reinsert(updates)));
        } else {
            inner.min_insert_timestamp = inner.min_insert_timestamp.min(timestamp);
            inner.rows.insert(
                key,
                MrsEntry {
                    row,
                    insert_timestamp: timestamp,
                    mutations: vec![],
                },
            );
        }
        self.approx_bytes.fetch_add(weight + 48, Ordering::Relaxed);
        Ok(())
    }

    /// Appends a mutation to an existing row's chain. `NotFound` when
    /// the key was never inserted here.
    pub fn mutate(&self, timestamp: Timestamp, key: &[u8], change: RowChange) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .rows
            .get_mut(key)
            .ok_or_else(|| Error::not_found("key not present in MemRowSet"))?;
        self.approx_bytes
            .fetch_add(32 + change.encode().len(), Ordering::Relaxed);
        entry.mutations.push((timestamp, change));
        Ok(())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.inner.read().rows.contains_key(key)
    }

    /// The row's state visible at `snapshot`: `None` when the row was
    /// inserted after the snapshot, otherwise the materialized row and
    /// its liveness.
    pub fn get_at_snapshot(
        &self,
        key: &[u8],
        snapshot: Timestamp,
    ) -> Option<(Vec<Value>, bool)> {
        let inner = self.inner.read();
        let entry = inner.rows.get(key)?;
        if entry.insert_timestamp >= snapshot {
            return None;
        }
        let mut row = entry.row.clone();
        let mut live = true;
        for (ts, change) in &entry.mutations {
            if *ts < snapshot {
                change.apply_to_row(&self.schema, &mut row, &mut live);
            }
        }
        Some((row, live))
    }

    /// Materializes every entry in key order for a flush: the folded
    /// row state, its liveness, and the full history needed to emit
    /// UNDO deltas.
    ///
    /// A row whose history ends in a delete keeps that delete as a
    /// REDO so the flushed base still reads as deleted; everything
    /// before it folds into the base with an UNDO reversal chain.
    pub fn snapshot_for_flush(&self) -> Vec<FlushRow> {
        let inner = self.inner.read();
        inner
            .rows
            .iter()
            .map(|(key, entry)| {
                let mut row = entry.row.clone();
                let mut live = true;
                let mut undo_chain = vec![];
                undo_chain.push((entry.insert_timestamp, RowChange::Delete));
                let mut redo_delete = None;
                for (ts, change) in &entry.mutations {
                    if change.is_delete() {
                        // Tentatively the trailing delete; a later
                        // reinsert folds it back into the chain.
                        redo_delete = Some(*ts);
                        continue;
                    }
                    if let Some(del_ts) = redo_delete.take() {
                        undo_chain.push((del_ts, RowChange::Delete.reverse(&self.schema, &row)));
                        let mut dead = true;
                        RowChange::Delete.apply_to_row(&self.schema, &mut row, &mut dead);
                    }
                    undo_chain.push((*ts, change.reverse(&self.schema, &row)));
                    change.apply_to_row(&self.schema, &mut row, &mut live);
                }
                FlushRow {
                    key: key.clone(),
                    live: redo_delete.is_none(),
                    row,
                    redo_delete,
                    undos: undo_chain,
                }
            })
            .collect()
    }
}

/// One row of a flush snapshot.
pub struct FlushRow {
    pub key: Vec<u8>,
    /// The folded base values; for a deleted row, the values as of
    /// just before the trailing delete.
    pub row: Vec<Value>,
    pub live: bool,
    /// Ascending timestamp; the first entry undoes the insert.
    pub undos: Vec<(Timestamp, RowChange)>,
    /// The trailing delete, kept as a REDO on the flushed rowset.
    pub redo_delete: Option<Timestamp>,
}
