// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Rowset compactions: merging overlapping DiskRowSets into a rolled
//! output, and folding REDO deltas into base data (major delta
//! compaction).

use std::sync::Arc;

use itertools::Itertools;

use super::delta::{
    ColumnUpdate, DeltaFileReader, DeltaFileWriter, DeltaKey, DeltaType, RowChange,
};
use super::diskrowset::{DiskRowSet, RollingDiskRowSetWriter};
use super::metadata::RowSetMetadata;
use crate::error::Result;
use crate::fs::DirManager;
use crate::rowblock::RowBlock;
use crate::schema::{ColumnId, SchemaRef};
use crate::types::{Timestamp, Value};

const COMPACTION_BATCH_ROWS: usize = 128;

/// One input row with its full history, ready to be rewritten.
struct CompactionRow {
    key: Vec<u8>,
    /// Folded base values (pre-delete values for dead rows).
    row: Vec<Value>,
    live: bool,
    undos: Vec<(Timestamp, RowChange)>,
    redo_delete: Option<Timestamp>,
}

/// Yields the rows of a set of overlapping rowsets in ascending key
/// order, histories projected into a fresh UNDO chain plus an optional
/// trailing REDO delete.
pub struct CompactionInput {
    /// Per-input cursor: (rowset, next row id).
    cursors: Vec<(Arc<DiskRowSet>, u32)>,
    heads: Vec<Option<CompactionRow>>,
    schema: SchemaRef,
    /// Fully-ancient ghost rows below this mark are dropped.
    ahm: Timestamp,
}

impl CompactionInput {
    pub fn new(
        inputs: Vec<Arc<DiskRowSet>>,
        schema: SchemaRef,
        ahm: Timestamp,
    ) -> Result<CompactionInput> {
        let mut input = CompactionInput {
            heads: inputs.iter().map(|_| None).collect(),
            cursors: inputs.into_iter().map(|drs| (drs, 0)).collect(),
            schema,
            ahm,
        };
        for i in 0..input.cursors.len() {
            input.advance(i)?;
        }
        Ok(input)
    }

    fn advance(&mut self, i: usize) -> Result<()> {
        loop {
            let (drs, next) = &mut self.cursors[i];
            if (*next as u64) >= drs.count_rows() {
                self.heads[i] = None;
                return Ok(());
            }
            let row_id = *next;
            *next += 1;
            let drs = drs.clone();
            match self.project_row(&drs, row_id)? {
                Some(row) => {
                    self.heads[i] = Some(row);
                    return Ok(());
                }
                // Ancient ghost: fall through to the next row.
                None => continue,
            }
        }
    }

    /// Folds the row's REDOs into its base, keeping the trailing
    /// delete (if any) as a REDO and emitting reversals as UNDOs.
    /// `None` for ghost rows whose whole history is ancient.
    fn project_row(&self, drs: &Arc<DiskRowSet>, row_id: u32) -> Result<Option<CompactionRow>> {
        if drs
            .delta_tracker()
            .is_deleted_and_fully_ancient(row_id, self.ahm)?
        {
            return Ok(None);
        }
        let mut row = drs.base_row(row_id)?;
        let history = drs.delta_tracker().collect_history(row_id)?;
        let mut undos = history.undos.clone();
        let mut live = true;
        let mut redo_delete = None;
        for (ts, change) in &history.redos {
            if change.is_delete() {
                redo_delete = Some(*ts);
                continue;
            }
            if let Some(del_ts) = redo_delete.take() {
                undos.push((del_ts, RowChange::Delete.reverse(&self.schema, &row)));
                let mut dead = true;
                RowChange::Delete.apply_to_row(&self.schema, &mut row, &mut dead);
            }
            undos.push((*ts, change.reverse(&self.schema, &row)));
            change.apply_to_row(&self.schema, &mut row, &mut live);
        }
        let key = self.schema.encode_key(&row);
        Ok(Some(CompactionRow {
            key,
            live: redo_delete.is_none(),
            row,
            undos,
            redo_delete,
        }))
    }

    fn next_row(&mut self) -> Result<Option<CompactionRow>> {
        let best = self
            .heads
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_ref().map(|r| (i, r.key.clone())))
            .min_by(|a, b| a.1.cmp(&b.1))
            .map(|(i, _)| i);
        let Some(i) = best else { return Ok(None) };
        let row = self.heads[i].take().unwrap();
        self.advance(i)?;
        Ok(Some(row))
    }
}

/// Merges `inputs` into a rolled sequence of output rowsets. Returns
/// the new rowset metadata and the next unused rowset id. The caller
/// commits the swap (remove inputs, add outputs) atomically.
pub fn compact_rowsets(
    inputs: Vec<Arc<DiskRowSet>>,
    schema: SchemaRef,
    dir_manager: &DirManager,
    target_rowset_size: u64,
    next_rowset_id: u64,
    ahm: Timestamp,
) -> Result<(Vec<RowSetMetadata>, u64)> {
    let mut input = CompactionInput::new(inputs, schema.clone(), ahm)?;
    let mut writer =
        RollingDiskRowSetWriter::new(schema.clone(), dir_manager, target_rowset_size, next_rowset_id);
    let mut batch: Vec<CompactionRow> = Vec::with_capacity(COMPACTION_BATCH_ROWS);
    loop {
        let row = input.next_row()?;
        let at_end = row.is_none();
        if let Some(row) = row {
            batch.push(row);
        }
        if batch.len() >= COMPACTION_BATCH_ROWS || (at_end && !batch.is_empty()) {
            // Deltas first, then the block: the rolling writer's
            // alignment contract.
            for (idx, row) in batch.iter().enumerate() {
                writer.append_undo_deltas(idx as u32, &row.undos)?;
                if let Some(ts) = row.redo_delete {
                    writer.append_redo_deltas(idx as u32, &[(ts, RowChange::Delete)])?;
                }
            }
            let rows: Vec<Vec<Value>> = batch.iter().map(|r| r.row.clone()).collect();
            // Every output row is live in the base: trailing deletes
            // ride in the REDO file and are counted by its stats.
            let block = RowBlock::from_rows(schema.clone(), &rows);
            writer.append_block(&block, rows.len() as i64)?;
            batch.clear();
        }
        if at_end {
            break;
        }
    }
    writer.finish()
}

/// Major delta compaction: folds UPDATE REDOs older than `frontier`
/// for the selected columns into new base CFiles, writing the
/// reversals as a new UNDO file and the surviving mutations as a
/// single new REDO file. Rows and row ids are preserved, so the
/// rowset's key bounds and bloom stay valid. Returns the updated
/// metadata for the same rowset id.
pub fn major_compact_deltas(
    drs: &Arc<DiskRowSet>,
    columns: &[ColumnId],
    frontier: Timestamp,
    dir_manager: &DirManager,
) -> Result<RowSetMetadata> {
    let schema = drs.schema().clone();
    let mut meta = drs.metadata();

    // New base files for every column plus a fresh key index.
    let mut writer = super::diskrowset::DiskRowSetWriter::new(meta.id, schema.clone(), dir_manager)?;

    let (_, undo_block) = dir_manager.place_block()?;
    let undo_path = dir_manager.resolve_block(&undo_block)?;
    let mut undo_writer = DeltaFileWriter::create(&undo_path, DeltaType::Undo)?;
    let (_, redo_block) = dir_manager.place_block()?;
    let redo_path = dir_manager.resolve_block(&redo_block)?;
    let mut redo_writer = DeltaFileWriter::create(&redo_path, DeltaType::Redo)?;

    let total = drs.count_rows();
    let mut batch_rows: Vec<Vec<Value>> = vec![];
    for row_id in 0..total as u32 {
        let mut row = drs.base_row(row_id)?;
        let history = drs.delta_tracker().collect_history(row_id)?;
        let mut kept_redos: Vec<(Timestamp, RowChange)> = vec![];
        let mut new_undos: Vec<(Timestamp, RowChange)> = vec![];
        let mut live = true;
        for (ts, change) in &history.redos {
            let foldable = *ts < frontier && matches!(change, RowChange::Update(_)) && live;
            if !foldable {
                if change.is_delete() {
                    live = false;
                } else if change.is_reinsert() {
                    live = true;
                }
                kept_redos.push((*ts, change.clone()));
                continue;
            }
            let RowChange::Update(updates) = change else { unreachable!() };
            let (fold, keep): (Vec<ColumnUpdate>, Vec<ColumnUpdate>) = updates
                .iter()
                .cloned()
                .partition(|u| columns.contains(&u.column_id));
            if !fold.is_empty() {
                let folded = RowChange::Update(fold);
                new_undos.push((*ts, folded.reverse(&schema, &row)));
                let mut l = live;
                folded.apply_to_row(&schema, &mut row, &mut l);
            }
            if !keep.is_empty() {
                kept_redos.push((*ts, RowChange::Update(keep)));
            }
        }
        for (ts, change) in &new_undos {
            undo_writer.append(DeltaKey::new(row_id, *ts), change)?;
        }
        // REDO file order: timestamp descending within the row.
        for (ts, change) in kept_redos.iter().sorted_by(|a, b| b.0.cmp(&a.0)) {
            redo_writer.append(DeltaKey::new(row_id, *ts), change)?;
        }
        batch_rows.push(row);
        if batch_rows.len() >= COMPACTION_BATCH_ROWS || row_id as u64 + 1 == total {
            let block = RowBlock::from_rows(schema.clone(), &batch_rows);
            let n = batch_rows.len() as i64;
            writer.append_block(&block, n)?;
            batch_rows.clear();
        }
    }

    let new_base = writer.finish()?;
    let redo_entries = redo_writer.entry_count();
    let undo_entries = undo_writer.entry_count();
    redo_writer.finish()?;
    undo_writer.finish()?;

    let old_redos: Vec<_> = drs.delta_tracker().redo_files();
    // Swap the in-memory stacks.
    if redo_entries > 0 {
        let reader = DeltaFileReader::open(&redo_path, None)?;
        drs.delta_tracker().replace_redos(vec![reader]);
    } else {
        drs.delta_tracker().replace_redos(vec![]);
        let _ = std::fs::remove_file(&redo_path);
    }
    if undo_entries > 0 {
        drs.delta_tracker()
            .append_undo(DeltaFileReader::open(&undo_path, None)?);
    } else {
        let _ = std::fs::remove_file(&undo_path);
    }
    for old in old_redos {
        let _ = std::fs::remove_file(old.path());
    }

    // Old base files are superseded; the caller commits the new
    // metadata before deleting them.
    meta.column_blocks = new_base.column_blocks;
    meta.key_index_block = new_base.key_index_block;
    meta.bloom_block = new_base.bloom_block;
    meta.redo_delta_blocks = if redo_entries > 0 {
        vec![redo_block]
    } else {
        vec![]
    };
    if undo_entries > 0 {
        meta.undo_delta_blocks.push(undo_block);
    }
    // live_row_count is unchanged: deletes and reinserts stay in the
    // REDO stack.
    Ok(meta)
}
