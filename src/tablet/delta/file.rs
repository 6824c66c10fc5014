// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! On-disk delta files: sorted (delta key, change list) entries in a
//! CFile with per-file statistics in the footer metadata.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;

use super::{DeltaKey, DeltaType, RowChange};
use crate::cfile::{
    BlockCache, CFileIterator, CFileReader, CFileWriter, CFileWriterOptions, ColumnSink,
};
use crate::error::{Error, Result};
use crate::proto::{ColumnUpdateCountPb, DeltaStatsPb};
use crate::schema::{ColumnId, EncodingType, Schema};
use crate::types::{ColumnVec, DataType, PhysicalType, Timestamp, Value};

const METADATA_DELTA_TYPE: &str = "delta.type";
const METADATA_DELTA_STATS: &str = "delta.stats";

/// Aggregate statistics over one delta store.
#[derive(Clone, Debug, PartialEq)]
pub struct DeltaStats {
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub delete_count: i64,
    pub reinsert_count: i64,
    pub update_counts: BTreeMap<ColumnId, i64>,
}

impl Default for DeltaStats {
    fn default() -> Self {
        DeltaStats {
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
            delete_count: 0,
            reinsert_count: 0,
            update_counts: BTreeMap::new(),
        }
    }
}

impl DeltaStats {
    pub fn update(&mut self, timestamp: Timestamp, change: &RowChange) {
        self.min_timestamp = self.min_timestamp.min(timestamp);
        self.max_timestamp = self.max_timestamp.max(timestamp);
        match change {
            RowChange::Delete => self.delete_count += 1,
            RowChange::Reinsert(updates) => {
                self.reinsert_count += 1;
                for u in updates {
                    *self.update_counts.entry(u.column_id).or_default() += 1;
                }
            }
            RowChange::Update(updates) => {
                for u in updates {
                    *self.update_counts.entry(u.column_id).or_default() += 1;
                }
            }
        }
    }

    /// Net change to the rowset's live row count from this store.
    pub fn live_row_count_delta(&self) -> i64 {
        self.reinsert_count - self.delete_count
    }

    pub fn merge(&mut self, other: &DeltaStats) {
        self.min_timestamp = self.min_timestamp.min(other.min_timestamp);
        self.max_timestamp = self.max_timestamp.max(other.max_timestamp);
        self.delete_count += other.delete_count;
        self.reinsert_count += other.reinsert_count;
        for (col, count) in &other.update_counts {
            *self.update_counts.entry(*col).or_default() += count;
        }
    }

    pub fn to_pb(&self) -> DeltaStatsPb {
        DeltaStatsPb {
            min_timestamp: self.min_timestamp.0,
            max_timestamp: self.max_timestamp.0,
            delete_count: self.delete_count,
            reinsert_count: self.reinsert_count,
            update_counts: self
                .update_counts
                .iter()
                .map(|(col, count)| ColumnUpdateCountPb {
                    column_id: *col,
                    count: *count,
                })
                .collect(),
        }
    }

    pub fn from_pb(pb: &DeltaStatsPb) -> DeltaStats {
        DeltaStats {
            min_timestamp: Timestamp(pb.min_timestamp),
            max_timestamp: Timestamp(pb.max_timestamp),
            delete_count: pb.delete_count,
            reinsert_count: pb.reinsert_count,
            update_counts: pb
                .update_counts
                .iter()
                .map(|c| (c.column_id, c.count))
                .collect(),
        }
    }
}

fn delta_type_name(typ: DeltaType) -> &'static [u8] {
    match typ {
        DeltaType::Redo => b"REDO",
        DeltaType::Undo => b"UNDO",
    }
}

/// Writes one delta file. Entries must arrive in key order for the
/// type's sort.
pub struct DeltaFileWriter {
    inner: CFileWriter<BufWriter<File>>,
    typ: DeltaType,
    stats: DeltaStats,
    last_key: Option<Vec<u8>>,
    count: u64,
}

impl DeltaFileWriter {
    pub fn create(path: &Path, typ: DeltaType) -> Result<DeltaFileWriter> {
        let file = File::create(path)?;
        let mut opts = CFileWriterOptions::new(DataType::Binary);
        opts.encoding = EncodingType::Plain;
        opts.write_validx = true;
        let inner = CFileWriter::new(BufWriter::new(file), opts)?;
        Ok(DeltaFileWriter {
            inner,
            typ,
            stats: DeltaStats::default(),
            last_key: None,
            count: 0,
        })
    }

    pub fn append(&mut self, key: DeltaKey, change: &RowChange) -> Result<()> {
        let encoded_key = key.encode(self.typ);
        if let Some(last) = &self.last_key {
            if *last > encoded_key {
                return Err(Error::illegal_state(
                    "delta entries must be appended in sorted order",
                ));
            }
        }
        let mut cell = encoded_key.clone();
        cell.extend_from_slice(&change.encode());
        self.inner
            .append_entries(&ColumnVec::Binary(vec![Bytes::from(cell)]))?;
        self.stats.update(key.timestamp, change);
        self.last_key = Some(encoded_key);
        self.count += 1;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.count
    }

    /// Closes the file, embedding the stats, and fsyncs.
    pub fn finish(mut self) -> Result<DeltaStats> {
        self.inner
            .add_metadata_pair(METADATA_DELTA_TYPE, delta_type_name(self.typ).to_vec());
        self.inner
            .add_metadata_pair(METADATA_DELTA_STATS, self.stats.to_pb().encode_to_vec());
        let (sink, _) = self.inner.finish()?;
        let file = sink
            .into_inner()
            .map_err(|e| Error::io_error(format!("flushing delta file: {e}"), None))?;
        file.sync_all()?;
        Ok(self.stats)
    }
}

/// Reader over one delta file.
pub struct DeltaFileReader {
    reader: Arc<CFileReader>,
    path: PathBuf,
    typ: DeltaType,
    stats: DeltaStats,
    size_bytes: u64,
}

impl DeltaFileReader {
    pub fn open(path: &Path, cache: Option<BlockCache>) -> Result<Arc<DeltaFileReader>> {
        let size_bytes = std::fs::metadata(path)?.len();
        let reader = CFileReader::open(path, cache)?;
        let typ = match reader.metadata_value(METADATA_DELTA_TYPE) {
            Some(b"REDO") => DeltaType::Redo,
            Some(b"UNDO") => DeltaType::Undo,
            _ => return Err(Error::corruption("delta file missing its type metadata")),
        };
        let stats_bytes = reader
            .metadata_value(METADATA_DELTA_STATS)
            .ok_or_else(|| Error::corruption("delta file missing its stats metadata"))?;
        let stats = DeltaStats::from_pb(&DeltaStatsPb::decode(stats_bytes)?);
        Ok(Arc::new(DeltaFileReader {
            reader,
            path: path.to_path_buf(),
            typ,
            stats,
            size_bytes,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn delta_type(&self) -> DeltaType {
        self.typ
    }

    pub fn stats(&self) -> &DeltaStats {
        &self.stats
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn entry_count(&self) -> u64 {
        self.reader.num_values()
    }

    pub fn new_iterator(self: &Arc<Self>) -> Result<DeltaFileIterator> {
        let mut iter = self.reader.new_iterator();
        iter.seek_to_first()?;
        Ok(DeltaFileIterator {
            file: self.clone(),
            iter,
        })
    }

    /// The row's mutations in this file, in commit (ascending
    /// timestamp) order, unfiltered by snapshot.
    pub fn scan_row(&self, row_id: u32, schema: &Schema) -> Result<Vec<(Timestamp, RowChange)>> {
        if self.reader.num_values() == 0 {
            return Ok(vec![]);
        }
        let mut iter = self.reader.new_iterator();
        let start = DeltaKey::encode_row_start(row_id, self.typ);
        let mut exact = false;
        match iter.seek_at_or_after(&start, &mut exact) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(vec![]),
            Err(e) => return Err(e),
        }
        let mut out = vec![];
        loop {
            let mut col = ColumnVec::new(PhysicalType::Binary);
            let copied = {
                let mut sink = ColumnSink::new(&mut col, None);
                iter.copy_next_values(64, &mut sink)?
            };
            if copied == 0 {
                break;
            }
            for i in 0..copied {
                let Value::Binary(cell) = col.get(i) else { unreachable!() };
                let key = DeltaKey::decode(&cell, self.typ)?;
                if key.row_id != row_id {
                    return finish_scan_row(out, self.typ);
                }
                let change = RowChange::decode(&cell[12..], schema)?;
                out.push((key.timestamp, change));
            }
        }
        finish_scan_row(out, self.typ)
    }

    /// Whether the row's newest liveness mutation visible at
    /// `snapshot` is a delete. `None` when this file has no say.
    pub fn check_row_deleted(
        &self,
        row_id: u32,
        snapshot: Timestamp,
        schema: &Schema,
    ) -> Result<Option<bool>> {
        let mutations = self.scan_row(row_id, schema)?;
        for (ts, change) in mutations.iter().rev() {
            if *ts >= snapshot {
                continue;
            }
            match change {
                RowChange::Delete => return Ok(Some(true)),
                RowChange::Reinsert(_) => return Ok(Some(false)),
                RowChange::Update(_) => {}
            }
        }
        Ok(None)
    }
}

fn finish_scan_row(
    mut out: Vec<(Timestamp, RowChange)>,
    typ: DeltaType,
) -> Result<Vec<(Timestamp, RowChange)>> {
    // REDO files store a row's entries newest-first; present them in
    // commit order.
    if typ == DeltaType::Redo {
        out.reverse();
    }
    Ok(out)
}

/// Streams every (key, raw change list) entry of a delta file in file
/// order.
pub struct DeltaFileIterator {
    file: Arc<DeltaFileReader>,
    iter: CFileIterator,
}

impl DeltaFileIterator {
    pub fn next_entry(&mut self) -> Result<Option<(DeltaKey, Bytes)>> {
        let mut col = ColumnVec::new(PhysicalType::Binary);
        let copied = {
            let mut sink = ColumnSink::new(&mut col, None);
            self.iter.copy_next_values(1, &mut sink)?
        };
        if copied == 0 {
            return Ok(None);
        }
        let Value::Binary(cell) = col.get(0) else { unreachable!() };
        let key = DeltaKey::decode(&cell, self.file.delta_type())?;
        Ok(Some((key, cell.slice(12..))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::tablet::delta::ColumnUpdate;

    fn schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new("id", DataType::Int32),
                ColumnSchema::new("v", DataType::Int64),
            ],
            1,
        )
        .unwrap()
        .with_assigned_ids()
    }

    fn update(v: i64) -> RowChange {
        RowChange::Update(vec![ColumnUpdate {
            column_id: 1,
            value: Value::I64(v),
        }])
    }

    #[test]
    fn test_redo_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("redo.delta");
        let mut writer = DeltaFileWriter::create(&path, DeltaType::Redo).unwrap();
        // Row asc, timestamp desc within row.
        writer.append(DeltaKey::new(1, Timestamp(30)), &update(3)).unwrap();
        writer.append(DeltaKey::new(1, Timestamp(10)), &update(1)).unwrap();
        writer.append(DeltaKey::new(2, Timestamp(20)), &RowChange::Delete).unwrap();
        let stats = writer.finish().unwrap();
        assert_eq!(stats.delete_count, 1);
        assert_eq!(stats.min_timestamp, Timestamp(10));
        assert_eq!(stats.max_timestamp, Timestamp(30));
        assert_eq!(stats.live_row_count_delta(), -1);

        let reader = DeltaFileReader::open(&path, None).unwrap();
        assert_eq!(reader.delta_type(), DeltaType::Redo);
        assert_eq!(reader.stats(), &stats);
        let schema = schema();
        let muts = reader.scan_row(1, &schema).unwrap();
        assert_eq!(muts.len(), 2);
        // Commit order.
        assert_eq!(muts[0].0, Timestamp(10));
        assert_eq!(muts[1].0, Timestamp(30));
        assert!(reader.scan_row(3, &schema).unwrap().is_empty());
        assert_eq!(
            reader.check_row_deleted(2, Timestamp::MAX, &schema).unwrap(),
            Some(true)
        );
        assert_eq!(
            reader.check_row_deleted(2, Timestamp(20), &schema).unwrap(),
            None
        );
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("redo.delta");
        let mut writer = DeltaFileWriter::create(&path, DeltaType::Redo).unwrap();
        writer.append(DeltaKey::new(2, Timestamp(5)), &update(1)).unwrap();
        let err = writer
            .append(DeltaKey::new(1, Timestamp(5)), &update(2))
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }

    #[test]
    fn test_iterator_streams_in_file_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("undo.delta");
        let mut writer = DeltaFileWriter::create(&path, DeltaType::Undo).unwrap();
        for row in 0..10u32 {
            writer
                .append(DeltaKey::new(row, Timestamp(row as u64)), &update(row as i64))
                .unwrap();
        }
        writer.finish().unwrap();
        let reader = DeltaFileReader::open(&path, None).unwrap();
        let mut iter = reader.new_iterator().unwrap();
        let mut rows = vec![];
        while let Some((key, _)) = iter.next_entry().unwrap() {
            rows.push(key.row_id);
        }
        assert_eq!(rows, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_stats_roundtrip_through_metadata() {
        let mut stats = DeltaStats::default();
        stats.update(Timestamp(5), &update(1));
        stats.update(Timestamp(9), &RowChange::Delete);
        let pb = stats.to_pb();
        assert_eq!(DeltaStats::from_pb(&pb), stats);
    }
}
