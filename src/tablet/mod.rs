// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! The tablet: an LSM-style set of rowsets with a write path through
//! the MemRowSet, flushes into DiskRowSets, and merge/delta
//! compactions.

pub mod compaction;
pub mod delta;
mod diskrowset;
mod memrowset;
mod metadata;

pub use diskrowset::{DiskRowSet, DiskRowSetIterator, DiskRowSetWriter, RollingDiskRowSetWriter};
pub use memrowset::{FlushRow, MemRowSet};
pub use metadata::{MetaManifest, MetaOperation, RowSetMetadata, TabletMetadata};

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::info;

use self::delta::{snapshot_updates, RowChange};
use crate::cfile::BlockCache;
use crate::error::{Error, Result};
use crate::fs::DirManager;
use crate::rowblock::RowBlock;
use crate::schema::{ColumnId, Schema, SchemaRef};
use crate::types::{OpId, Timestamp, Value};
use crate::util::Semaphore;

const FLUSH_BATCH_ROWS: usize = 128;
const RECENT_OP_WINDOW: usize = 10_000;

#[derive(Clone)]
pub struct TabletOptions {
    pub target_rowset_size_bytes: u64,
    /// Maximum rowsets merged by one compaction.
    pub compaction_budget_rowsets: usize,
    pub fsync_metadata: bool,
}

impl Default for TabletOptions {
    fn default() -> Self {
        TabletOptions {
            target_rowset_size_bytes: 32 * 1024 * 1024,
            compaction_budget_rowsets: 4,
            fsync_metadata: true,
        }
    }
}

/// Which store absorbed a mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationTarget {
    MemRowSet { mrs_id: u64 },
    DiskRowSet { rowset_id: u64 },
}

/// Outcome of one write operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationResult {
    pub target: Option<MutationTarget>,
    /// True when the op id was already applied and the write was
    /// suppressed.
    pub suppressed: bool,
}

struct Components {
    mrs: Arc<MemRowSet>,
    rowsets: Vec<Arc<DiskRowSet>>,
}

struct RecentOps {
    seen: HashSet<OpId>,
    order: VecDeque<OpId>,
}

pub struct Tablet {
    tablet_id: String,
    schema: RwLock<SchemaRef>,
    components: RwLock<Components>,
    /// Serializes flushes, merge compactions, and schema changes.
    /// Maintenance ops try-acquire it in their prepare step and hold
    /// it through perform.
    pub rowsets_flush_sem: Semaphore,
    manifest: MetaManifest,
    meta: Mutex<TabletMetadata>,
    dir_manager: Arc<DirManager>,
    cache: Option<BlockCache>,
    opts: TabletOptions,
    clock: AtomicU64,
    next_mrs_id: AtomicU64,
    recent_ops: Mutex<RecentOps>,
    stopped: AtomicBool,
}

impl Tablet {
    /// Opens (or bootstraps) the tablet: replays the metadata
    /// manifest, opens every rowset, and installs a fresh MemRowSet.
    pub fn open(
        tablet_id: impl Into<String>,
        bootstrap_schema: Schema,
        dir_manager: Arc<DirManager>,
        cache: Option<BlockCache>,
        metadata_root: &Path,
        opts: TabletOptions,
    ) -> Result<Arc<Tablet>> {
        let tablet_id = tablet_id.into();
        if !bootstrap_schema.has_column_ids() {
            return Err(Error::invalid_argument(
                "the tablet schema must carry column ids",
            ));
        }
        let manifest = MetaManifest::open(
            &metadata_root.join(format!("{tablet_id}.meta")),
            opts.fsync_metadata,
        )?;
        let meta = manifest.replay(&tablet_id, &bootstrap_schema)?;
        let schema = Arc::new(meta.schema.clone());
        let mut rowsets = Vec::with_capacity(meta.rowsets.len());
        for rs_meta in &meta.rowsets {
            rowsets.push(DiskRowSet::open(
                rs_meta.clone(),
                schema.clone(),
                &dir_manager,
                cache.clone(),
            )?);
        }
        info!(tablet = %tablet_id, rowsets = rowsets.len(), "opened tablet");
        Ok(Arc::new(Tablet {
            schema: RwLock::new(schema.clone()),
            components: RwLock::new(Components {
                mrs: Arc::new(MemRowSet::new(0, schema)),
                rowsets,
            }),
            rowsets_flush_sem: Semaphore::new(),
            manifest,
            meta: Mutex::new(meta),
            dir_manager,
            cache,
            opts,
            clock: AtomicU64::new(1),
            next_mrs_id: AtomicU64::new(1),
            recent_ops: Mutex::new(RecentOps {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            stopped: AtomicBool::new(false),
            tablet_id,
        }))
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.read().clone()
    }

    /// A strictly-increasing microsecond timestamp.
    pub fn clock_now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut prev = self.clock.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self.clock.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Timestamp(next),
                Err(cur) => prev = cur,
            }
        }
    }

    /// The newest possible read snapshot: everything committed so far.
    pub fn latest_snapshot(&self) -> Timestamp {
        Timestamp(self.clock.load(Ordering::Relaxed) + 1)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn has_been_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_running(&self) -> Result<()> {
        if self.has_been_stopped() {
            return Err(Error::illegal_state(format!(
                "tablet {} has been stopped",
                self.tablet_id
            )));
        }
        Ok(())
    }

    /// Returns false when the op id was already applied.
    fn register_op(&self, op_id: OpId) -> bool {
        let mut recent = self.recent_ops.lock();
        if !recent.seen.insert(op_id) {
            return false;
        }
        recent.order.push_back(op_id);
        if recent.order.len() > RECENT_OP_WINDOW {
            let evicted = recent.order.pop_front().unwrap();
            recent.seen.remove(&evicted);
        }
        true
    }

    /// Inserts a new row. Duplicate keys fail `AlreadyPresent` unless
    /// the existing row is deleted, in which case the insert becomes a
    /// reinsert on the owning store.
    pub fn insert(&self, op_id: OpId, row: Vec<Value>) -> Result<OperationResult> {
        self.check_running()?;
        if !self.register_op(op_id) {
            return Ok(OperationResult {
                target: None,
                suppressed: true,
            });
        }
        let schema = self.schema();
        if row.len() != schema.num_columns() {
            return Err(Error::invalid_argument(format!(
                "row has {} cells, schema has {} columns",
                row.len(),
                schema.num_columns()
            )));
        }
        let ts = self.clock_now();
        let key = schema.encode_key(&row);
        let components = self.components.read();
        // The key can only live in one store; probe the MRS first,
        // then each rowset filtered by its bloom and key range.
        if components.mrs.contains_key(&key) {
            components.mrs.insert(ts, row)?;
            return Ok(OperationResult {
                target: Some(MutationTarget::MemRowSet {
                    mrs_id: components.mrs.id(),
                }),
                suppressed: false,
            });
        }
        for drs in &components.rowsets {
            if let Some(row_id) = drs.lookup_row_id(&key)? {
                if !drs.check_row_deleted(row_id, Timestamp::MAX)? {
                    return Err(Error::already_present("key already present in tablet"));
                }
                drs.mutate(
                    row_id,
                    ts,
                    RowChange::Reinsert(snapshot_updates(&schema, &row)),
                );
                return Ok(OperationResult {
                    target: Some(MutationTarget::DiskRowSet {
                        rowset_id: drs.id(),
                    }),
                    suppressed: false,
                });
            }
        }
        components.mrs.insert(ts, row)?;
        Ok(OperationResult {
            target: Some(MutationTarget::MemRowSet {
                mrs_id: components.mrs.id(),
            }),
            suppressed: false,
        })
    }

    /// Applies an update or delete to an existing row, located by its
    /// primary key.
    pub fn mutate_row(
        &self,
        op_id: OpId,
        key_row: &[Value],
        change: RowChange,
    ) -> Result<OperationResult> {
        self.check_running()?;
        if !self.register_op(op_id) {
            return Ok(OperationResult {
                target: None,
                suppressed: true,
            });
        }
        let schema = self.schema();
        let ts = self.clock_now();
        let key = schema.encode_key(key_row);
        let components = self.components.read();
        if components.mrs.contains_key(&key) {
            if let Some((_, live)) = components.mrs.get_at_snapshot(&key, Timestamp::MAX) {
                if !live {
                    return Err(Error::not_found("row is deleted"));
                }
            }
            components.mrs.mutate(ts, &key, change)?;
            return Ok(OperationResult {
                target: Some(MutationTarget::MemRowSet {
                    mrs_id: components.mrs.id(),
                }),
                suppressed: false,
            });
        }
        for drs in &components.rowsets {
            if let Some(row_id) = drs.lookup_row_id(&key)? {
                if drs.check_row_deleted(row_id, Timestamp::MAX)? {
                    return Err(Error::not_found("row is deleted"));
                }
                drs.mutate(row_id, ts, change);
                return Ok(OperationResult {
                    target: Some(MutationTarget::DiskRowSet {
                        rowset_id: drs.id(),
                    }),
                    suppressed: false,
                });
            }
        }
        Err(Error::not_found("key not found in tablet"))
    }

    pub fn mem_rowset_empty(&self) -> bool {
        self.components.read().mrs.is_empty()
    }

    pub fn mem_rowset_size(&self) -> usize {
        self.components.read().mrs.approx_size_bytes()
    }

    pub fn mem_rowset_age(&self) -> std::time::Duration {
        self.components.read().mrs.created_at().elapsed()
    }

    pub fn delta_mem_stores_empty(&self) -> bool {
        self.components
            .read()
            .rowsets
            .iter()
            .all(|rs| rs.delta_tracker().dms_empty())
    }

    /// (size, age) of the best DMS flush candidate: the largest
    /// non-empty delta memstore.
    pub fn find_best_dms_to_flush(&self) -> Option<(usize, std::time::Duration, u64)> {
        self.components
            .read()
            .rowsets
            .iter()
            .filter(|rs| !rs.delta_tracker().dms_empty())
            .map(|rs| {
                (
                    rs.delta_tracker().dms_size_bytes(),
                    rs.delta_tracker().dms_created_at().elapsed(),
                    rs.id(),
                )
            })
            .max_by_key(|(size, _, _)| *size)
    }

    pub fn rowset_count(&self) -> usize {
        self.components.read().rowsets.len()
    }

    /// The deepest REDO file stack across the rowsets.
    pub fn max_redo_file_count(&self) -> usize {
        self.components
            .read()
            .rowsets
            .iter()
            .map(|rs| rs.delta_tracker().redo_file_count())
            .max()
            .unwrap_or(0)
    }

    /// (total flushed column updates, total base rows), the inputs to
    /// the major-delta-compaction score.
    pub fn update_to_base_ratio_inputs(&self) -> (i64, u64) {
        let components = self.components.read();
        let updates = components
            .rowsets
            .iter()
            .flat_map(|rs| rs.delta_tracker().redo_files())
            .map(|f| f.stats().update_counts.values().sum::<i64>())
            .sum();
        let base_rows = components.rowsets.iter().map(|rs| rs.count_rows()).sum();
        (updates, base_rows)
    }

    /// Rowsets eligible for merge compaction: never-compacted sets
    /// whose key ranges overlap another eligible rowset.
    pub fn overlapping_rowset_count(&self) -> usize {
        self.pick_compaction_inputs().len()
    }

    /// Total rows across base stores plus the MemRowSet, dead or
    /// alive.
    pub fn count_rows(&self) -> u64 {
        let components = self.components.read();
        components.mrs.entry_count() as u64
            + components
                .rowsets
                .iter()
                .map(|rs| rs.count_rows())
                .sum::<u64>()
    }

    pub fn count_live_rows(&self) -> i64 {
        let components = self.components.read();
        let mrs_live = components
            .mrs
            .snapshot_for_flush()
            .iter()
            .filter(|r| r.live)
            .count() as i64;
        mrs_live
            + components
                .rowsets
                .iter()
                .map(|rs| rs.count_live_rows())
                .sum::<i64>()
    }

    /// All live rows visible at `snapshot`, merged across stores in
    /// primary key order.
    pub fn scan_at(&self, snapshot: Timestamp) -> Result<Vec<Vec<Value>>> {
        let components = self.components.read();
        let mut sources: Vec<Vec<(Vec<u8>, Vec<Value>, bool)>> = vec![];
        let mrs_rows: Vec<(Vec<u8>, Vec<Value>, bool)> = {
            let schema = self.schema();
            components
                .mrs
                .snapshot_for_flush()
                .iter()
                .filter_map(|fr| {
                    components
                        .mrs
                        .get_at_snapshot(&fr.key, snapshot)
                        .map(|(row, live)| (schema.encode_key(&row), row, live))
                })
                .collect()
        };
        sources.push(mrs_rows);
        for drs in &components.rowsets {
            let mut iter = drs.new_row_iterator(snapshot);
            let mut rows = vec![];
            loop {
                let batch = iter.next_batch(FLUSH_BATCH_ROWS)?;
                if batch.is_empty() {
                    break;
                }
                rows.extend(batch);
            }
            sources.push(rows);
        }
        drop(components);
        let mut merged: Vec<(Vec<u8>, Vec<Value>)> = sources
            .into_iter()
            .flatten()
            .filter(|(_, _, live)| *live)
            .map(|(key, row, _)| (key, row))
            .collect();
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(merged.into_iter().map(|(_, row)| row).collect())
    }

    pub fn scan(&self) -> Result<Vec<Vec<Value>>> {
        self.scan_at(self.latest_snapshot())
    }

    /// Flushes the MemRowSet into a rolled set of DiskRowSets under
    /// the flush semaphore.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.rowsets_flush_sem.lock_guard();
        self.flush_unlocked()
    }

    /// Flush body; the caller must hold `rowsets_flush_sem`.
    ///
    /// Writers and readers are blocked for the duration: the swap of
    /// MRS for DiskRowSets is atomic with respect to the component
    /// lock.
    pub fn flush_unlocked(&self) -> Result<()> {
        self.check_running()?;
        let mut components = self.components.write();
        if components.mrs.is_empty() {
            return Ok(());
        }
        let schema = self.schema();
        let old_mrs = std::mem::replace(
            &mut components.mrs,
            Arc::new(MemRowSet::new(
                self.next_mrs_id.fetch_add(1, Ordering::Relaxed),
                schema.clone(),
            )),
        );
        let next_rowset_id = self.meta.lock().next_rowset_id;
        let mut writer = RollingDiskRowSetWriter::new(
            schema.clone(),
            &self.dir_manager,
            self.opts.target_rowset_size_bytes,
            next_rowset_id,
        );
        let rows = old_mrs.snapshot_for_flush();
        for batch in rows.chunks(FLUSH_BATCH_ROWS) {
            for (idx, fr) in batch.iter().enumerate() {
                writer.append_undo_deltas(idx as u32, &fr.undos)?;
                if let Some(ts) = fr.redo_delete {
                    writer.append_redo_deltas(idx as u32, &[(ts, RowChange::Delete)])?;
                }
            }
            let row_values: Vec<Vec<Value>> = batch.iter().map(|fr| fr.row.clone()).collect();
            let block = RowBlock::from_rows(schema.clone(), &row_values);
            writer.append_block(&block, row_values.len() as i64)?;
        }
        let (outputs, _) = writer.finish()?;

        let ops: Vec<MetaOperation> = outputs
            .iter()
            .cloned()
            .map(MetaOperation::AddRowSet)
            .collect();
        self.manifest.append(&ops)?;
        {
            let mut meta = self.meta.lock();
            for out in &outputs {
                meta.next_rowset_id = meta.next_rowset_id.max(out.id + 1);
                meta.rowsets.push(out.clone());
            }
        }
        for out in outputs {
            components.rowsets.push(DiskRowSet::open(
                out,
                schema.clone(),
                &self.dir_manager,
                self.cache.clone(),
            )?);
        }
        info!(tablet = %self.tablet_id, mrs = old_mrs.id(), "flushed MemRowSet");
        Ok(())
    }

    /// Flushes the fullest delta memstore to a new REDO file.
    pub fn flush_best_dms(&self) -> Result<bool> {
        self.check_running()?;
        let Some((_, _, rowset_id)) = self.find_best_dms_to_flush() else {
            return Ok(false);
        };
        let components = self.components.read();
        let Some(drs) = components.rowsets.iter().find(|rs| rs.id() == rowset_id) else {
            return Ok(false);
        };
        let Some(updated) = drs.flush_dms(&self.dir_manager)? else {
            return Ok(false);
        };
        drop(components);
        self.commit_rowset_update(updated)?;
        Ok(true)
    }

    /// Merges the REDO stack of the rowset with the most delta files.
    pub fn minor_compact_deltas(&self) -> Result<bool> {
        self.check_running()?;
        let components = self.components.read();
        let Some(drs) = components
            .rowsets
            .iter()
            .max_by_key(|rs| rs.delta_tracker().redo_file_count())
            .cloned()
        else {
            return Ok(false);
        };
        drop(components);
        let Some(updated) = drs.minor_compact_redos(&self.dir_manager)? else {
            return Ok(false);
        };
        self.commit_rowset_update(updated)?;
        Ok(true)
    }

    /// Folds old UPDATE deltas of the most update-heavy rowset into
    /// its base data.
    pub fn major_compact_deltas(&self, columns: &[ColumnId], frontier: Timestamp) -> Result<bool> {
        self.check_running()?;
        let _guard = self.rowsets_flush_sem.lock_guard();
        let components = self.components.read();
        let Some(drs) = components
            .rowsets
            .iter()
            .filter(|rs| rs.delta_tracker().redo_file_count() > 0)
            .max_by_key(|rs| {
                rs.delta_tracker()
                    .redo_files()
                    .iter()
                    .map(|f| f.stats().update_counts.values().sum::<i64>())
                    .sum::<i64>()
            })
            .cloned()
        else {
            return Ok(false);
        };
        drop(components);
        let updated = compaction::major_compact_deltas(&drs, columns, frontier, &self.dir_manager)?;
        // Reopen the rowset over its new base files.
        let reopened = DiskRowSet::open(
            updated.clone(),
            self.schema(),
            &self.dir_manager,
            self.cache.clone(),
        )?;
        self.manifest
            .append(&[MetaOperation::UpdateRowSet(updated.clone())])?;
        {
            let mut meta = self.meta.lock();
            if let Some(slot) = meta.rowsets.iter_mut().find(|r| r.id == updated.id) {
                *slot = updated.clone();
            }
        }
        let mut components = self.components.write();
        if let Some(slot) = components
            .rowsets
            .iter_mut()
            .find(|rs| rs.id() == updated.id)
        {
            *slot = reopened;
        }
        Ok(true)
    }

    fn commit_rowset_update(&self, updated: RowSetMetadata) -> Result<()> {
        self.manifest
            .append(&[MetaOperation::UpdateRowSet(updated.clone())])?;
        let mut meta = self.meta.lock();
        if let Some(slot) = meta.rowsets.iter_mut().find(|r| r.id == updated.id) {
            *slot = updated;
        }
        Ok(())
    }

    /// Picks overlapping, never-compacted rowsets up to the budget.
    fn pick_compaction_inputs(&self) -> Vec<Arc<DiskRowSet>> {
        let components = self.components.read();
        let eligible: Vec<&Arc<DiskRowSet>> = components
            .rowsets
            .iter()
            .filter(|rs| !rs.has_been_compacted())
            .collect();
        let mut picked: Vec<Arc<DiskRowSet>> = vec![];
        for rs in &eligible {
            let overlaps = eligible.iter().any(|other| {
                other.id() != rs.id()
                    && ranges_overlap(
                        &rs.min_encoded_key(),
                        &rs.max_encoded_key(),
                        &other.min_encoded_key(),
                        &other.max_encoded_key(),
                    )
            });
            if overlaps {
                picked.push(Arc::clone(rs));
                if picked.len() >= self.opts.compaction_budget_rowsets {
                    break;
                }
            }
        }
        if picked.len() < 2 {
            vec![]
        } else {
            picked
        }
    }

    /// Merge-compacts a set of overlapping rowsets, committing the
    /// swap atomically in the metadata manifest.
    pub fn compact(&self, ahm: Timestamp) -> Result<bool> {
        let _guard = self.rowsets_flush_sem.lock_guard();
        self.compact_unlocked(ahm)
    }

    /// Compaction body; the caller must hold `rowsets_flush_sem`.
    pub fn compact_unlocked(&self, ahm: Timestamp) -> Result<bool> {
        self.check_running()?;
        let inputs = self.pick_compaction_inputs();
        if inputs.is_empty() {
            return Ok(false);
        }
        let schema = self.schema();
        let next_rowset_id = self.meta.lock().next_rowset_id;
        let input_ids: Vec<u64> = inputs.iter().map(|rs| rs.id()).collect();
        let (outputs, _) = compaction::compact_rowsets(
            inputs.clone(),
            schema.clone(),
            &self.dir_manager,
            self.opts.target_rowset_size_bytes,
            next_rowset_id,
            ahm,
        )?;

        // Commit: mark inputs compacted, drop them, add the outputs.
        let mut ops: Vec<MetaOperation> = inputs
            .iter()
            .map(|rs| MetaOperation::UpdateRowSet(rs.mark_compacted()))
            .collect();
        ops.push(MetaOperation::RemoveRowSets {
            ids: input_ids.clone(),
        });
        ops.extend(outputs.iter().cloned().map(MetaOperation::AddRowSet));
        self.manifest.append(&ops)?;
        {
            let mut meta = self.meta.lock();
            meta.rowsets.retain(|r| !input_ids.contains(&r.id));
            for out in &outputs {
                meta.next_rowset_id = meta.next_rowset_id.max(out.id + 1);
                meta.rowsets.push(out.clone());
            }
        }
        let mut components = self.components.write();
        components
            .rowsets
            .retain(|rs| !input_ids.contains(&rs.id()));
        for out in outputs {
            components.rowsets.push(DiskRowSet::open(
                out,
                schema.clone(),
                &self.dir_manager,
                self.cache.clone(),
            )?);
        }
        info!(tablet = %self.tablet_id, inputs = input_ids.len(), "merged rowsets");
        Ok(true)
    }

    /// Bytes reclaimable by deleting UNDO deltas below the mark,
    /// estimated from file stats.
    pub fn estimate_ancient_undo_bytes(&self, ahm: Timestamp) -> u64 {
        self.components
            .read()
            .rowsets
            .iter()
            .map(|rs| {
                rs.delta_tracker()
                    .estimate_bytes_in_potentially_ancient_undo_deltas(ahm)
            })
            .sum()
    }

    /// Unlinks every UNDO delta below the mark. Returns bytes freed.
    pub fn delete_ancient_undo_deltas(&self, ahm: Timestamp) -> Result<u64> {
        self.check_running()?;
        let rowsets = self.components.read().rowsets.clone();
        let mut freed = 0;
        for drs in &rowsets {
            if let Some((updated, bytes)) =
                drs.delete_ancient_undo_deltas(ahm, &self.dir_manager)?
            {
                self.commit_rowset_update(updated)?;
                freed += bytes;
            }
        }
        Ok(freed)
    }

    /// Installs a new schema version. Serialized with flushes and
    /// compactions via the flush semaphore.
    pub fn alter_schema(&self, new_schema: Schema) -> Result<()> {
        self.check_running()?;
        let _guard = self.rowsets_flush_sem.lock_guard();
        if !new_schema.has_column_ids() {
            return Err(Error::invalid_argument("schemas must carry column ids"));
        }
        let cur = self.schema();
        if new_schema.num_key_columns() != cur.num_key_columns()
            || new_schema.key_columns() != cur.key_columns()
        {
            return Err(Error::invalid_argument(
                "key columns cannot change in a schema alter",
            ));
        }
        let version = self.meta.lock().schema_version + 1;
        self.manifest.append(&[MetaOperation::NewSchema {
            schema: new_schema.clone(),
            version,
        }])?;
        {
            let mut meta = self.meta.lock();
            meta.schema = new_schema.clone();
            meta.schema_version = version;
        }
        *self.schema.write() = Arc::new(new_schema);
        Ok(())
    }
}

fn ranges_overlap(
    min_a: &Option<Vec<u8>>,
    max_a: &Option<Vec<u8>>,
    min_b: &Option<Vec<u8>>,
    max_b: &Option<Vec<u8>>,
) -> bool {
    match (min_a, max_a, min_b, max_b) {
        (Some(min_a), Some(max_a), Some(min_b), Some(max_b)) => {
            min_a <= max_b && min_b <= max_a
        }
        // Unknown bounds are treated as overlapping everything.
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::DirManagerOptions;
    use crate::schema::ColumnSchema;
    use crate::tablet::delta::ColumnUpdate;
    use crate::types::DataType;

    struct Fixture {
        _tmp: tempfile::TempDir,
        tablet: Arc<Tablet>,
    }

    fn schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new("id", DataType::Int32),
                ColumnSchema::new("name", DataType::String).nullable(true),
            ],
            1,
        )
        .unwrap()
        .with_assigned_ids()
    }

    fn open_tablet() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let tablet = open_in(&tmp, TabletOptions::default());
        Fixture { _tmp: tmp, tablet }
    }

    fn open_in(tmp: &tempfile::TempDir, opts: TabletOptions) -> Arc<Tablet> {
        let root = tmp.path().join("r1");
        std::fs::create_dir_all(&root).unwrap();
        let roots = vec![root];
        let _ = DirManager::create(&roots, DirManagerOptions::new("data"));
        let dm = Arc::new(DirManager::open(&roots, DirManagerOptions::new("data")).unwrap());
        Tablet::open(
            "test-tablet",
            schema(),
            dm,
            None,
            &tmp.path().join("meta"),
            opts,
        )
        .unwrap()
    }

    fn op(index: i64) -> OpId {
        OpId { term: 1, index }
    }

    fn row(id: i32, name: &str) -> Vec<Value> {
        vec![Value::I32(id), Value::from_str_slice(name)]
    }

    #[test]
    fn test_insert_scan_returns_key_order() {
        let fx = open_tablet();
        fx.tablet.insert(op(1), row(2, "b")).unwrap();
        fx.tablet.insert(op(2), row(1, "a")).unwrap();
        fx.tablet.insert(op(3), row(3, "c")).unwrap();
        let rows = fx.tablet.scan().unwrap();
        assert_eq!(rows, vec![row(1, "a"), row(2, "b"), row(3, "c")]);
    }

    #[test]
    fn test_duplicate_insert_and_idempotent_ops() {
        let fx = open_tablet();
        fx.tablet.insert(op(1), row(1, "a")).unwrap();
        let err = fx.tablet.insert(op(2), row(1, "again")).unwrap_err();
        assert!(err.is_already_present());
        // Same op id is suppressed, not re-applied.
        let result = fx.tablet.insert(op(1), row(1, "a")).unwrap();
        assert!(result.suppressed);
    }

    #[test]
    fn test_mutate_routes_to_mrs_then_drs() {
        let fx = open_tablet();
        fx.tablet.insert(op(1), row(1, "a")).unwrap();
        let result = fx
            .tablet
            .mutate_row(
                op(2),
                &row(1, ""),
                RowChange::Update(vec![ColumnUpdate {
                    column_id: 1,
                    value: Value::from_str_slice("a2"),
                }]),
            )
            .unwrap();
        assert!(matches!(
            result.target,
            Some(MutationTarget::MemRowSet { .. })
        ));

        fx.tablet.flush().unwrap();
        let result = fx
            .tablet
            .mutate_row(
                op(3),
                &row(1, ""),
                RowChange::Update(vec![ColumnUpdate {
                    column_id: 1,
                    value: Value::from_str_slice("a3"),
                }]),
            )
            .unwrap();
        assert!(matches!(
            result.target,
            Some(MutationTarget::DiskRowSet { .. })
        ));
        let rows = fx.tablet.scan().unwrap();
        assert_eq!(rows, vec![row(1, "a3")]);

        let err = fx
            .tablet
            .mutate_row(op(4), &row(9, ""), RowChange::Delete)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_flush_preserves_contents() {
        let fx = open_tablet();
        for i in 0..100 {
            fx.tablet.insert(op(i), row(i as i32, "v")).unwrap();
        }
        let before = fx.tablet.scan().unwrap();
        fx.tablet.flush().unwrap();
        assert!(fx.tablet.mem_rowset_empty());
        assert_eq!(fx.tablet.rowset_count(), 1);
        assert_eq!(fx.tablet.scan().unwrap(), before);
        assert_eq!(fx.tablet.count_rows(), 100);
        assert_eq!(fx.tablet.count_live_rows(), 100);
    }

    #[test]
    fn test_empty_flush_writes_nothing() {
        let fx = open_tablet();
        fx.tablet.flush().unwrap();
        assert_eq!(fx.tablet.rowset_count(), 0);
        assert_eq!(fx.tablet.count_rows(), 0);
        assert!(fx.tablet.scan().unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_snapshot_reads() {
        let fx = open_tablet();
        fx.tablet.insert(op(1), row(1, "a")).unwrap();
        fx.tablet.insert(op(2), row(2, "b")).unwrap();
        fx.tablet.flush().unwrap();
        let before_delete = fx.tablet.latest_snapshot();
        fx.tablet
            .mutate_row(op(3), &row(1, ""), RowChange::Delete)
            .unwrap();
        let rows = fx.tablet.scan().unwrap();
        assert_eq!(rows, vec![row(2, "b")]);
        assert_eq!(fx.tablet.count_live_rows(), 1);
        // The older snapshot still sees both rows.
        let rows = fx.tablet.scan_at(before_delete).unwrap();
        assert_eq!(rows.len(), 2);
        // Reinsert over the deleted key.
        fx.tablet.insert(op(4), row(1, "a2")).unwrap();
        let rows = fx.tablet.scan().unwrap();
        assert_eq!(rows, vec![row(1, "a2"), row(2, "b")]);
    }

    #[test]
    fn test_dms_flush_and_minor_compaction() {
        let fx = open_tablet();
        for i in 0..10 {
            fx.tablet.insert(op(i), row(i as i32, "v")).unwrap();
        }
        fx.tablet.flush().unwrap();
        assert!(!fx.tablet.flush_best_dms().unwrap());
        for round in 0..2 {
            fx.tablet
                .mutate_row(
                    op(100 + round),
                    &row(1, ""),
                    RowChange::Update(vec![ColumnUpdate {
                        column_id: 1,
                        value: Value::from_str_slice("u"),
                    }]),
                )
                .unwrap();
            assert!(fx.tablet.flush_best_dms().unwrap());
        }
        let before = fx.tablet.scan().unwrap();
        assert!(fx.tablet.minor_compact_deltas().unwrap());
        assert_eq!(fx.tablet.scan().unwrap(), before);
    }

    #[test]
    fn test_merge_compaction_swaps_rowsets() {
        let mut opts = TabletOptions::default();
        opts.compaction_budget_rowsets = 8;
        let tmp = tempfile::tempdir().unwrap();
        let tablet = open_in(&tmp, opts);
        // Two overlapping rowsets.
        tablet.insert(op(1), row(1, "a")).unwrap();
        tablet.insert(op(2), row(5, "e")).unwrap();
        tablet.flush().unwrap();
        tablet.insert(op(3), row(3, "c")).unwrap();
        tablet.insert(op(4), row(7, "g")).unwrap();
        tablet.flush().unwrap();
        assert_eq!(tablet.rowset_count(), 2);
        let before = tablet.scan().unwrap();
        assert!(tablet.compact(Timestamp::MIN).unwrap());
        assert_eq!(tablet.rowset_count(), 1);
        assert_eq!(tablet.scan().unwrap(), before);
        // Nothing left to compact.
        assert!(!tablet.compact(Timestamp::MIN).unwrap());
    }

    #[test]
    fn test_reopen_from_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let tablet = open_in(&tmp, TabletOptions::default());
            for i in 0..20 {
                tablet.insert(op(i), row(i as i32, "persisted")).unwrap();
            }
            tablet.flush().unwrap();
        }
        let tablet = open_in(&tmp, TabletOptions::default());
        let rows = tablet.scan().unwrap();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[7], row(7, "persisted"));
    }

    #[test]
    fn test_stopped_tablet_rejects_writes() {
        let fx = open_tablet();
        fx.tablet.stop();
        assert!(fx.tablet.has_been_stopped());
        let err = fx.tablet.insert(op(1), row(1, "a")).unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        let err = fx.tablet.flush().unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[test]
    fn test_alter_schema_bumps_version() {
        let fx = open_tablet();
        let mut cols: Vec<ColumnSchema> = schema().columns().to_vec();
        cols.push(ColumnSchema::new("extra", DataType::Int64).nullable(true).with_id(2));
        let new_schema = Schema::new(cols, 1).unwrap();
        fx.tablet.alter_schema(new_schema.clone()).unwrap();
        assert_eq!(fx.tablet.schema().num_columns(), 3);
        // Key columns may not change.
        let bad = Schema::new(
            vec![ColumnSchema::new("other", DataType::Int64).with_id(0)],
            1,
        )
        .unwrap();
        assert!(fx.tablet.alter_schema(bad).is_err());
    }
}
