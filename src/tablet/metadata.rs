// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Tablet and rowset metadata, persisted as a replayable manifest of
//! JSON operations wrapped in begin/end markers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::fs::BlockId;
use crate::schema::{ColumnId, Schema};

/// Durable description of one DiskRowSet: its base column blocks, the
/// ad-hoc key index, the optional bloom, and both delta stacks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RowSetMetadata {
    pub id: u64,
    pub column_blocks: Vec<(ColumnId, BlockId)>,
    pub key_index_block: BlockId,
    pub bloom_block: Option<BlockId>,
    /// Newest first.
    pub redo_delta_blocks: Vec<BlockId>,
    /// Oldest first.
    pub undo_delta_blocks: Vec<BlockId>,
    pub base_row_count: u64,
    /// `None` on metadata written by deployments that predate live-row
    /// tracking; readers fall back to a stats-based approximation.
    pub live_row_count: Option<i64>,
    pub min_encoded_key: Option<Vec<u8>>,
    pub max_encoded_key: Option<Vec<u8>>,
    /// Once set, the rowset may never participate in another merge
    /// compaction.
    pub has_been_compacted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletMetadata {
    pub tablet_id: String,
    pub schema: Schema,
    pub schema_version: u32,
    pub next_rowset_id: u64,
    pub rowsets: Vec<RowSetMetadata>,
}

impl TabletMetadata {
    pub fn new(tablet_id: impl Into<String>, schema: Schema) -> TabletMetadata {
        TabletMetadata {
            tablet_id: tablet_id.into(),
            schema,
            schema_version: 0,
            next_rowset_id: 0,
            rowsets: vec![],
        }
    }

    pub fn rowset(&self, id: u64) -> Option<&RowSetMetadata> {
        self.rowsets.iter().find(|r| r.id == id)
    }

    fn apply(&mut self, op: MetaOperation) {
        match op {
            MetaOperation::NewSchema { schema, version } => {
                self.schema = schema;
                self.schema_version = version;
            }
            MetaOperation::AddRowSet(meta) => {
                self.next_rowset_id = self.next_rowset_id.max(meta.id + 1);
                self.rowsets.push(meta);
            }
            MetaOperation::RemoveRowSets { ids } => {
                self.rowsets.retain(|r| !ids.contains(&r.id));
            }
            MetaOperation::UpdateRowSet(meta) => {
                if let Some(slot) = self.rowsets.iter_mut().find(|r| r.id == meta.id) {
                    *slot = meta;
                }
            }
            MetaOperation::Begin | MetaOperation::End => {}
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MetaOperation {
    NewSchema { schema: Schema, version: u32 },
    AddRowSet(RowSetMetadata),
    RemoveRowSets { ids: Vec<u64> },
    UpdateRowSet(RowSetMetadata),
    Begin,
    End,
}

/// Append-only manifest of [`MetaOperation`]s. Each commit is wrapped
/// in `Begin`/`End`; replay drops any trailing uncommitted group.
pub struct MetaManifest {
    file: Mutex<File>,
    path: PathBuf,
    enable_fsync: bool,
}

impl MetaManifest {
    pub fn open(path: &Path, enable_fsync: bool) -> Result<MetaManifest> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(MetaManifest {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            enable_fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the manifest into a fresh view, or `None` when it holds
    /// no committed operations.
    pub fn replay(&self, tablet_id: &str, bootstrap_schema: &Schema) -> Result<TabletMetadata> {
        let mut data = String::new();
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(0))?;
            file.read_to_string(&mut data)?;
        }
        let mut meta = TabletMetadata::new(tablet_id, bootstrap_schema.clone());
        let mut buffered: Vec<MetaOperation> = vec![];
        let mut in_txn = false;
        let stream = serde_json::Deserializer::from_str(&data).into_iter::<MetaOperation>();
        for op in stream {
            let op = op?;
            match op {
                MetaOperation::Begin => in_txn = true,
                MetaOperation::End => {
                    for buffered_op in buffered.drain(..) {
                        meta.apply(buffered_op);
                    }
                    in_txn = false;
                }
                op => {
                    if in_txn {
                        buffered.push(op);
                    } else {
                        warn!(manifest = %self.path.display(), "manifest entry outside a commit group");
                    }
                }
            }
        }
        if !buffered.is_empty() {
            warn!(manifest = %self.path.display(), "dropping uncommitted manifest entries");
        }
        Ok(meta)
    }

    /// Appends one commit group.
    pub fn append(&self, ops: &[MetaOperation]) -> Result<()> {
        let mut json = Vec::new();
        serde_json::to_writer(&mut json, &MetaOperation::Begin)?;
        for op in ops {
            serde_json::to_writer(&mut json, op)?;
        }
        serde_json::to_writer(&mut json, &MetaOperation::End)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&json)?;
        if self.enable_fsync {
            file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::types::DataType;

    fn schema() -> Schema {
        Schema::new(
            vec![ColumnSchema::new("id", DataType::Int32)],
            1,
        )
        .unwrap()
        .with_assigned_ids()
    }

    fn rowset_meta(id: u64) -> RowSetMetadata {
        RowSetMetadata {
            id,
            column_blocks: vec![(
                0,
                BlockId {
                    dir_uuid: "u".into(),
                    name: format!("col-{id}"),
                },
            )],
            key_index_block: BlockId {
                dir_uuid: "u".into(),
                name: format!("key-{id}"),
            },
            bloom_block: None,
            redo_delta_blocks: vec![],
            undo_delta_blocks: vec![],
            base_row_count: 10,
            live_row_count: Some(10),
            min_encoded_key: None,
            max_encoded_key: None,
            has_been_compacted: false,
        }
    }

    #[test]
    fn test_replay_applies_committed_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tablet-meta");
        let manifest = MetaManifest::open(&path, false).unwrap();
        manifest
            .append(&[MetaOperation::AddRowSet(rowset_meta(0))])
            .unwrap();
        manifest
            .append(&[
                MetaOperation::AddRowSet(rowset_meta(1)),
                MetaOperation::RemoveRowSets { ids: vec![0] },
            ])
            .unwrap();
        let meta = manifest.replay("t1", &schema()).unwrap();
        assert_eq!(meta.rowsets.len(), 1);
        assert_eq!(meta.rowsets[0].id, 1);
        assert_eq!(meta.next_rowset_id, 2);
    }

    #[test]
    fn test_replay_drops_uncommitted_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tablet-meta");
        let manifest = MetaManifest::open(&path, false).unwrap();
        manifest
            .append(&[MetaOperation::AddRowSet(rowset_meta(0))])
            .unwrap();
        // Simulate a crash after Begin but before End.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            serde_json::to_writer(&mut f, &MetaOperation::Begin).unwrap();
            serde_json::to_writer(&mut f, &MetaOperation::AddRowSet(rowset_meta(9))).unwrap();
        }
        let manifest = MetaManifest::open(&path, false).unwrap();
        let meta = manifest.replay("t1", &schema()).unwrap();
        assert_eq!(meta.rowsets.len(), 1);
        assert_eq!(meta.rowsets[0].id, 0);
    }

    #[test]
    fn test_update_rowset_replaces_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = MetaManifest::open(&tmp.path().join("m"), false).unwrap();
        manifest
            .append(&[MetaOperation::AddRowSet(rowset_meta(3))])
            .unwrap();
        let mut updated = rowset_meta(3);
        updated.has_been_compacted = true;
        manifest
            .append(&[MetaOperation::UpdateRowSet(updated)])
            .unwrap();
        let meta = manifest.replay("t1", &schema()).unwrap();
        assert!(meta.rowsets[0].has_been_compacted);
    }
}
