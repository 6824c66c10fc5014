// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! The delta tracker: one rowset's mutable delta state. Routes
//! updates to the DMS, layers UNDO/base/REDO for reads, and runs DMS
//! flush and minor REDO compaction.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use super::{
    DeltaFileReader, DeltaFileWriter, DeltaKey, DeltaMemStore, DeltaStats, DeltaType, RowChange,
};
use crate::cfile::BlockCache;
use crate::error::Result;
use crate::schema::SchemaRef;
use crate::types::{Timestamp, Value};

/// A row's full mutation history, split by direction.
pub struct RowHistory {
    /// Commit order (ascending timestamp).
    pub redos: Vec<(Timestamp, RowChange)>,
    /// Ascending timestamp.
    pub undos: Vec<(Timestamp, RowChange)>,
}

pub struct DeltaTracker {
    schema: SchemaRef,
    dms: RwLock<Arc<DeltaMemStore>>,
    /// Newest first.
    redo_files: RwLock<Vec<Arc<DeltaFileReader>>>,
    /// Oldest first.
    undo_files: RwLock<Vec<Arc<DeltaFileReader>>>,
    next_dms_id: AtomicU64,
    cache: Option<BlockCache>,
}

impl DeltaTracker {
    pub fn new(
        schema: SchemaRef,
        redo_files: Vec<Arc<DeltaFileReader>>,
        undo_files: Vec<Arc<DeltaFileReader>>,
        cache: Option<BlockCache>,
    ) -> DeltaTracker {
        DeltaTracker {
            schema,
            dms: RwLock::new(Arc::new(DeltaMemStore::new(0))),
            redo_files: RwLock::new(redo_files),
            undo_files: RwLock::new(undo_files),
            next_dms_id: AtomicU64::new(1),
            cache,
        }
    }

    pub fn update(&self, row_id: u32, timestamp: Timestamp, change: RowChange) {
        self.dms.read().update(row_id, timestamp, change);
    }

    pub fn dms_empty(&self) -> bool {
        self.dms.read().is_empty()
    }

    pub fn dms_size_bytes(&self) -> usize {
        self.dms.read().approx_size_bytes()
    }

    pub fn dms_created_at(&self) -> Instant {
        self.dms.read().created_at()
    }

    pub fn redo_file_count(&self) -> usize {
        self.redo_files.read().len()
    }

    pub fn undo_file_count(&self) -> usize {
        self.undo_files.read().len()
    }

    pub fn redo_files(&self) -> Vec<Arc<DeltaFileReader>> {
        self.redo_files.read().clone()
    }

    pub fn undo_files(&self) -> Vec<Arc<DeltaFileReader>> {
        self.undo_files.read().clone()
    }

    /// Sum of live-row deltas across every REDO store, the correction
    /// applied to the base row count.
    pub fn live_row_delta(&self) -> i64 {
        let files: i64 = self
            .redo_files
            .read()
            .iter()
            .map(|f| f.stats().live_row_count_delta())
            .sum();
        // The DMS contributes its unflushed deletes and reinserts too.
        let dms = self.dms.read();
        let dms_delta = dms
            .snapshot_for_flush()
            .iter()
            .map(|(_, _, change)| match change {
                RowChange::Delete => -1,
                RowChange::Reinsert(_) => 1,
                RowChange::Update(_) => 0,
            })
            .sum::<i64>();
        files + dms_delta
    }

    /// Consults the DMS, then the REDO stack newest-first,
    /// short-circuiting at the first liveness change.
    pub fn check_row_deleted(&self, row_id: u32, snapshot: Timestamp) -> Result<bool> {
        if let Some(deleted) = self.dms.read().check_row_deleted(row_id, snapshot) {
            return Ok(deleted);
        }
        for file in self.redo_files.read().iter() {
            if let Some(deleted) = file.check_row_deleted(row_id, snapshot, &self.schema)? {
                return Ok(deleted);
            }
        }
        Ok(false)
    }

    /// The row's complete history: REDOs from oldest file through the
    /// DMS in commit order, UNDOs in ascending timestamp order.
    /// Snapshot filtering happens at application time.
    pub fn collect_history(&self, row_id: u32) -> Result<RowHistory> {
        let mut redos = vec![];
        let redo_files = self.redo_files.read().clone();
        for file in redo_files.iter().rev() {
            redos.extend(file.scan_row(row_id, &self.schema)?);
        }
        redos.extend(self.dms.read().collect_for_row(row_id, Timestamp::MAX));
        let mut undos = vec![];
        for file in self.undo_files.read().iter() {
            undos.extend(file.scan_row(row_id, &self.schema)?);
        }
        Ok(RowHistory { redos, undos })
    }

    /// Materializes the row as visible at `snapshot`: UNDOs roll the
    /// base back before the snapshot, then visible REDOs roll it
    /// forward. Returns the row and whether it is live.
    pub fn apply_at_snapshot(
        &self,
        base_row: &[Value],
        row_id: u32,
        snapshot: Timestamp,
    ) -> Result<(Vec<Value>, bool)> {
        let history = self.collect_history(row_id)?;
        let mut row = base_row.to_vec();
        let mut live = true;
        // Undo everything the snapshot must not see, newest first.
        for (ts, change) in history.undos.iter().rev() {
            if *ts >= snapshot {
                change.apply_to_row(&self.schema, &mut row, &mut live);
            }
        }
        for (ts, change) in &history.redos {
            if *ts < snapshot {
                change.apply_to_row(&self.schema, &mut row, &mut live);
            }
        }
        Ok((row, live))
    }

    /// Atomically swaps in a fresh DMS and writes the old one as the
    /// newest REDO file at `path`. Returns `None` when the DMS was
    /// empty. The caller commits `path` to the rowset metadata.
    pub fn flush_dms(&self, path: &Path) -> Result<Option<DeltaStats>> {
        let old = {
            let mut dms = self.dms.write();
            if dms.is_empty() {
                return Ok(None);
            }
            let id = self.next_dms_id.fetch_add(1, Ordering::Relaxed);
            std::mem::replace(&mut *dms, Arc::new(DeltaMemStore::new(id)))
        };
        let mut writer = DeltaFileWriter::create(path, DeltaType::Redo)?;
        for (row_id, ts, change) in old.snapshot_for_flush() {
            writer.append(DeltaKey::new(row_id, ts), &change)?;
        }
        let stats = writer.finish()?;
        let reader = DeltaFileReader::open(path, self.cache.clone())?;
        self.redo_files.write().insert(0, reader);
        Ok(Some(stats))
    }

    /// Merges the whole REDO stack into one file at `path`, preserving
    /// all history. Returns the replaced files, or `None` when the
    /// stack has fewer than two files.
    pub fn minor_compact_redos(
        &self,
        path: &Path,
    ) -> Result<Option<(DeltaStats, Vec<PathBuf>)>> {
        let files = self.redo_files.read().clone();
        if files.len() < 2 {
            return Ok(None);
        }
        // Stream-merge the sorted inputs. Newest-first stack order
        // breaks timestamp ties in favor of the newer store.
        let mut iters = Vec::with_capacity(files.len());
        for f in &files {
            iters.push(f.new_iterator()?);
        }
        let mut heads: Vec<Option<(DeltaKey, bytes::Bytes)>> = Vec::new();
        for it in iters.iter_mut() {
            heads.push(it.next_entry()?);
        }
        let mut writer = DeltaFileWriter::create(path, DeltaType::Redo)?;
        loop {
            let mut best: Option<usize> = None;
            for (i, head) in heads.iter().enumerate() {
                if let Some((key, _)) = head {
                    let better = match best {
                        None => true,
                        Some(b) => {
                            let (bkey, _) = heads[b].as_ref().unwrap();
                            key.encode(DeltaType::Redo) < bkey.encode(DeltaType::Redo)
                        }
                    };
                    if better {
                        best = Some(i);
                    }
                }
            }
            let Some(i) = best else { break };
            let (key, raw) = heads[i].take().unwrap();
            let change = RowChange::decode(&raw, &self.schema)?;
            writer.append(key, &change)?;
            heads[i] = iters[i].next_entry()?;
        }
        let stats = writer.finish()?;
        let reader = DeltaFileReader::open(path, self.cache.clone())?;
        let replaced: Vec<PathBuf> = files.iter().map(|f| f.path().to_path_buf()).collect();
        *self.redo_files.write() = vec![reader];
        Ok(Some((stats, replaced)))
    }

    /// Replaces the REDO stack after a major compaction.
    pub fn replace_redos(&self, files: Vec<Arc<DeltaFileReader>>) {
        *self.redo_files.write() = files;
    }

    /// Appends a new (newest) UNDO file after a major compaction.
    pub fn append_undo(&self, file: Arc<DeltaFileReader>) {
        self.undo_files.write().push(file);
    }

    /// Upper bound on bytes reclaimable by deleting UNDO deltas that
    /// sit entirely below the ancient history mark, from file stats
    /// alone.
    pub fn estimate_bytes_in_potentially_ancient_undo_deltas(&self, ahm: Timestamp) -> u64 {
        self.undo_files
            .read()
            .iter()
            .filter(|f| f.stats().max_timestamp < ahm)
            .map(|f| f.size_bytes())
            .sum()
    }

    /// Opens ancient-UNDO readers until `deadline`, returning the
    /// precise byte total and how many stores were inspected before
    /// the deadline hit.
    pub fn init_undo_deltas(&self, ahm: Timestamp, deadline: Instant) -> (u64, usize) {
        let mut bytes = 0;
        let mut initted = 0;
        for f in self.undo_files.read().iter() {
            if Instant::now() >= deadline {
                break;
            }
            if f.stats().max_timestamp < ahm {
                bytes += f.size_bytes();
            }
            initted += 1;
        }
        (bytes, initted)
    }

    /// Unlinks UNDO files whose newest entry predates the mark.
    /// Returns the deleted paths and byte total; the caller commits
    /// the metadata change.
    pub fn delete_ancient_undo_deltas(&self, ahm: Timestamp) -> Result<(Vec<PathBuf>, u64)> {
        let mut deleted = vec![];
        let mut bytes = 0;
        let mut undos = self.undo_files.write();
        let mut kept = Vec::with_capacity(undos.len());
        for f in undos.drain(..) {
            if f.stats().max_timestamp < ahm {
                bytes += f.size_bytes();
                deleted.push(f.path().to_path_buf());
            } else {
                kept.push(f);
            }
        }
        *undos = kept;
        drop(undos);
        for path in &deleted {
            std::fs::remove_file(path)?;
        }
        Ok((deleted, bytes))
    }

    /// True iff the row is deleted and every delta reaching it sits
    /// below the ancient history mark.
    pub fn is_deleted_and_fully_ancient(&self, row_id: u32, ahm: Timestamp) -> Result<bool> {
        if !self.check_row_deleted(row_id, Timestamp::MAX)? {
            return Ok(false);
        }
        let dms = self.dms.read();
        if !dms.collect_for_row(row_id, Timestamp::MAX).is_empty() && dms.max_timestamp() >= ahm {
            return Ok(false);
        }
        let history = self.collect_history(row_id)?;
        Ok(history
            .redos
            .iter()
            .chain(history.undos.iter())
            .all(|(ts, _)| *ts < ahm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, Schema};
    use crate::tablet::delta::ColumnUpdate;
    use crate::types::DataType;

    fn schema() -> SchemaRef {
        Arc::new(
            Schema::new(
                vec![
                    ColumnSchema::new("id", DataType::Int32),
                    ColumnSchema::new("v", DataType::Int64),
                ],
                1,
            )
            .unwrap()
            .with_assigned_ids(),
        )
    }

    fn update(v: i64) -> RowChange {
        RowChange::Update(vec![ColumnUpdate {
            column_id: 1,
            value: Value::I64(v),
        }])
    }

    fn tracker() -> DeltaTracker {
        DeltaTracker::new(schema(), vec![], vec![], None)
    }

    #[test]
    fn test_update_and_read_at_snapshots() {
        let t = tracker();
        t.update(0, Timestamp(10), update(1));
        t.update(0, Timestamp(20), update(2));
        let base = vec![Value::I32(7), Value::I64(0)];
        let (row, live) = t.apply_at_snapshot(&base, 0, Timestamp(15)).unwrap();
        assert!(live);
        assert_eq!(row[1], Value::I64(1));
        let (row, _) = t.apply_at_snapshot(&base, 0, Timestamp(25)).unwrap();
        assert_eq!(row[1], Value::I64(2));
        let (row, _) = t.apply_at_snapshot(&base, 0, Timestamp(5)).unwrap();
        assert_eq!(row[1], Value::I64(0));
    }

    #[test]
    fn test_flush_dms_pushes_redo_head() {
        let tmp = tempfile::tempdir().unwrap();
        let t = tracker();
        t.update(0, Timestamp(10), update(1));
        t.update(1, Timestamp(11), RowChange::Delete);
        let stats = t.flush_dms(&tmp.path().join("redo-0")).unwrap().unwrap();
        assert_eq!(stats.delete_count, 1);
        assert!(t.dms_empty());
        assert_eq!(t.redo_file_count(), 1);

        // Reads see flushed history.
        assert!(t.check_row_deleted(1, Timestamp::MAX).unwrap());
        let base = vec![Value::I32(0), Value::I64(0)];
        let (row, live) = t.apply_at_snapshot(&base, 0, Timestamp::MAX).unwrap();
        assert!(live);
        assert_eq!(row[1], Value::I64(1));

        // An empty DMS flush is a no-op.
        assert!(t.flush_dms(&tmp.path().join("redo-1")).unwrap().is_none());
    }

    #[test]
    fn test_minor_compaction_preserves_visible_state() {
        let tmp = tempfile::tempdir().unwrap();
        let t = tracker();
        t.update(0, Timestamp(10), update(1));
        t.flush_dms(&tmp.path().join("redo-0")).unwrap();
        t.update(0, Timestamp(20), update(2));
        t.update(1, Timestamp(21), RowChange::Delete);
        t.flush_dms(&tmp.path().join("redo-1")).unwrap();
        assert_eq!(t.redo_file_count(), 2);

        let base = vec![Value::I32(0), Value::I64(0)];
        let snapshots = [Timestamp(5), Timestamp(15), Timestamp(25)];
        let before: Vec<_> = snapshots
            .iter()
            .map(|s| t.apply_at_snapshot(&base, 0, *s).unwrap())
            .collect();

        let (_, replaced) = t
            .minor_compact_redos(&tmp.path().join("redo-merged"))
            .unwrap()
            .unwrap();
        assert_eq!(replaced.len(), 2);
        assert_eq!(t.redo_file_count(), 1);

        let after: Vec<_> = snapshots
            .iter()
            .map(|s| t.apply_at_snapshot(&base, 0, *s).unwrap())
            .collect();
        assert_eq!(before, after);
        assert!(t.check_row_deleted(1, Timestamp::MAX).unwrap());
    }

    #[test]
    fn test_ancient_undo_accounting_and_deletion() {
        let tmp = tempfile::tempdir().unwrap();
        // Build two undo files by hand: one ancient, one current.
        let old_path = tmp.path().join("undo-old");
        let mut w = DeltaFileWriter::create(&old_path, DeltaType::Undo).unwrap();
        w.append(DeltaKey::new(0, Timestamp(5)), &RowChange::Delete).unwrap();
        w.finish().unwrap();
        let new_path = tmp.path().join("undo-new");
        let mut w = DeltaFileWriter::create(&new_path, DeltaType::Undo).unwrap();
        w.append(DeltaKey::new(1, Timestamp(50)), &RowChange::Delete).unwrap();
        w.finish().unwrap();

        let t = DeltaTracker::new(
            schema(),
            vec![],
            vec![
                DeltaFileReader::open(&old_path, None).unwrap(),
                DeltaFileReader::open(&new_path, None).unwrap(),
            ],
            None,
        );
        let ahm = Timestamp(10);
        let estimate = t.estimate_bytes_in_potentially_ancient_undo_deltas(ahm);
        assert!(estimate > 0);
        let (bytes, initted) =
            t.init_undo_deltas(ahm, Instant::now() + std::time::Duration::from_secs(5));
        assert_eq!(bytes, estimate);
        assert_eq!(initted, 2);

        let (deleted, freed) = t.delete_ancient_undo_deltas(ahm).unwrap();
        assert_eq!(deleted, vec![old_path.clone()]);
        assert_eq!(freed, estimate);
        assert_eq!(t.undo_file_count(), 1);
        assert!(!old_path.exists());
    }

    #[test]
    fn test_is_deleted_and_fully_ancient() {
        let tmp = tempfile::tempdir().unwrap();
        let t = tracker();
        t.update(0, Timestamp(5), RowChange::Delete);
        t.flush_dms(&tmp.path().join("redo-0")).unwrap();
        assert!(t.is_deleted_and_fully_ancient(0, Timestamp(10)).unwrap());
        assert!(!t.is_deleted_and_fully_ancient(0, Timestamp(3)).unwrap());
        // A live row is never reported.
        t.update(1, Timestamp(6), update(1));
        assert!(!t.is_deleted_and_fully_ancient(1, Timestamp(10)).unwrap());
    }
}
