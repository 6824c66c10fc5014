// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! DiskRowSets: immutable base CFiles (one per column, plus an ad-hoc
//! key index and an optional bloom) under a mutable delta tracker.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use bitvec::prelude::*;
use bloomfilter::Bloom;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use super::delta::{
    DeltaFileReader, DeltaFileWriter, DeltaKey, DeltaTracker, DeltaType, RowChange,
};
use super::metadata::RowSetMetadata;
use crate::cfile::{BlockCache, CFileReader, CFileWriter, CFileWriterOptions, ColumnSink};
use crate::error::{Error, Result};
use crate::fs::{BlockId, DirManager};
use crate::rowblock::RowBlock;
use crate::schema::{ColumnSchema, EncodingType, SchemaRef};
use crate::types::{ColumnVec, DataType, PhysicalType, Timestamp, Value};

const BLOOM_FP_RATE: f64 = 0.01;
const BLOOM_EXPECTED_KEYS: usize = 100_000;

fn cfile_opts_for_column(col: &ColumnSchema) -> CFileWriterOptions {
    let mut opts = CFileWriterOptions::new(col.data_type);
    opts.nullable = col.nullable;
    opts.encoding = col.attributes.encoding;
    opts.compression = col.attributes.compression;
    opts.block_size = col.attributes.cfile_block_size;
    opts
}

fn key_index_opts() -> CFileWriterOptions {
    let mut opts = CFileWriterOptions::new(DataType::Binary);
    opts.encoding = EncodingType::Plain;
    opts.write_validx = true;
    opts
}

/// The immutable base of a DiskRowSet: per-column readers, the key
/// index, and the bloom filter over encoded keys.
pub struct CFileSet {
    columns: Vec<Arc<CFileReader>>,
    key_index: Arc<CFileReader>,
    bloom: Option<Bloom<[u8]>>,
}

impl CFileSet {
    fn open(
        meta: &RowSetMetadata,
        schema: &SchemaRef,
        dir_manager: &DirManager,
        cache: Option<BlockCache>,
    ) -> Result<CFileSet> {
        let mut columns = Vec::with_capacity(schema.num_columns());
        for col in schema.columns() {
            let id = col
                .id
                .ok_or_else(|| Error::illegal_state("tablet schema lacks column ids"))?;
            let block = meta
                .column_blocks
                .iter()
                .find(|(cid, _)| *cid == id)
                .map(|(_, b)| b)
                .ok_or_else(|| {
                    Error::corruption(format!("rowset {} has no block for column {id}", meta.id))
                })?;
            let path = dir_manager.resolve_block(block)?;
            columns.push(CFileReader::open(&path, cache.clone())?);
        }
        let key_index =
            CFileReader::open(&dir_manager.resolve_block(&meta.key_index_block)?, cache)?;
        let bloom = match &meta.bloom_block {
            Some(block) => {
                let path = dir_manager.resolve_block(block)?;
                match load_bloom(&path) {
                    Ok(b) => Some(b),
                    Err(e) => {
                        // A bad bloom only costs lookup speed.
                        warn!(path = %path.display(), error = %e, "ignoring unreadable bloom file");
                        None
                    }
                }
            }
            None => None,
        };
        Ok(CFileSet {
            columns,
            key_index,
            bloom,
        })
    }
}

fn load_bloom(path: &std::path::Path) -> Result<Bloom<[u8]>> {
    let data = std::fs::read(path)?;
    if data.len() < 4 {
        return Err(Error::corruption("bloom file too short"));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    if crc32fast::hash(body) != expected {
        return Err(Error::corruption("bloom file checksum mismatch"));
    }
    Bloom::from_slice(body).map_err(|e| Error::corruption(e))
}

fn store_bloom(path: &std::path::Path, bloom: &Bloom<[u8]>) -> Result<()> {
    let body = bloom.as_slice();
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(body);
    out.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    std::fs::write(path, out)?;
    Ok(())
}

pub struct DiskRowSet {
    meta: Mutex<RowSetMetadata>,
    schema: SchemaRef,
    base: CFileSet,
    tracker: DeltaTracker,
}

impl DiskRowSet {
    pub fn open(
        meta: RowSetMetadata,
        schema: SchemaRef,
        dir_manager: &DirManager,
        cache: Option<BlockCache>,
    ) -> Result<Arc<DiskRowSet>> {
        let base = CFileSet::open(&meta, &schema, dir_manager, cache.clone())?;
        let mut redo_files = Vec::with_capacity(meta.redo_delta_blocks.len());
        for block in &meta.redo_delta_blocks {
            redo_files.push(DeltaFileReader::open(
                &dir_manager.resolve_block(block)?,
                cache.clone(),
            )?);
        }
        let mut undo_files = Vec::with_capacity(meta.undo_delta_blocks.len());
        for block in &meta.undo_delta_blocks {
            undo_files.push(DeltaFileReader::open(
                &dir_manager.resolve_block(block)?,
                cache.clone(),
            )?);
        }
        let tracker = DeltaTracker::new(schema.clone(), redo_files, undo_files, cache);
        Ok(Arc::new(DiskRowSet {
            meta: Mutex::new(meta),
            schema,
            base,
            tracker,
        }))
    }

    pub fn id(&self) -> u64 {
        self.meta.lock().id
    }

    pub fn metadata(&self) -> RowSetMetadata {
        self.meta.lock().clone()
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn delta_tracker(&self) -> &DeltaTracker {
        &self.tracker
    }

    /// Rows in the immutable base, dead or alive.
    pub fn count_rows(&self) -> u64 {
        self.meta.lock().base_row_count
    }

    /// Live rows: the tracked base live count corrected by the delta
    /// stats, or an approximation from stats alone for metadata
    /// written before live-row tracking existed.
    pub fn count_live_rows(&self) -> i64 {
        let meta = self.meta.lock();
        let base = meta
            .live_row_count
            .unwrap_or(meta.base_row_count as i64);
        base + self.tracker.live_row_delta()
    }

    pub fn min_encoded_key(&self) -> Option<Vec<u8>> {
        self.meta.lock().min_encoded_key.clone()
    }

    pub fn max_encoded_key(&self) -> Option<Vec<u8>> {
        self.meta.lock().max_encoded_key.clone()
    }

    pub fn has_been_compacted(&self) -> bool {
        self.meta.lock().has_been_compacted
    }

    pub fn mark_compacted(&self) -> RowSetMetadata {
        let mut meta = self.meta.lock();
        meta.has_been_compacted = true;
        meta.clone()
    }

    /// Whether `key` can live in this rowset's key range.
    pub fn may_contain_key(&self, key: &[u8]) -> bool {
        let meta = self.meta.lock();
        if let Some(min) = &meta.min_encoded_key {
            if key < min.as_slice() {
                return false;
            }
        }
        if let Some(max) = &meta.max_encoded_key {
            if key > max.as_slice() {
                return false;
            }
        }
        true
    }

    /// Finds the row id of `key` in the base, filtering through the
    /// bloom first.
    pub fn lookup_row_id(&self, key: &[u8]) -> Result<Option<u32>> {
        if !self.may_contain_key(key) {
            return Ok(None);
        }
        if let Some(bloom) = &self.base.bloom {
            if !bloom.check(key) {
                return Ok(None);
            }
        }
        if self.base.key_index.num_values() == 0 {
            return Ok(None);
        }
        let mut iter = self.base.key_index.new_iterator();
        let mut exact = false;
        match iter.seek_at_or_after(key, &mut exact) {
            Ok(()) => Ok(exact.then(|| iter.ordinal() as u32)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Routes a mutation for an existing base row into the DMS.
    pub fn mutate(&self, row_id: u32, timestamp: Timestamp, change: RowChange) {
        self.tracker.update(row_id, timestamp, change);
    }

    pub fn check_row_deleted(&self, row_id: u32, snapshot: Timestamp) -> Result<bool> {
        self.tracker.check_row_deleted(row_id, snapshot)
    }

    /// The base row's cells, without any deltas applied.
    pub fn base_row(&self, row_id: u32) -> Result<Vec<Value>> {
        let mut row = Vec::with_capacity(self.schema.num_columns());
        for (idx, col) in self.schema.columns().iter().enumerate() {
            let mut iter = self.base.columns[idx].new_iterator();
            iter.seek_to_ordinal(row_id as u64)?;
            let mut data = ColumnVec::new(col.data_type.physical_type());
            let mut bitmap = BitVec::<u8, Lsb0>::new();
            let copied = {
                let mut sink =
                    ColumnSink::new(&mut data, col.nullable.then_some(&mut bitmap));
                iter.copy_next_values(1, &mut sink)?
            };
            if copied != 1 {
                return Err(Error::corruption(format!(
                    "row {row_id} missing from column {}",
                    col.name
                )));
            }
            if col.nullable && !bitmap[0] {
                row.push(Value::Null);
            } else {
                row.push(data.get(0));
            }
        }
        Ok(row)
    }

    /// The row as visible at `snapshot`, with its liveness.
    pub fn row_at_snapshot(
        &self,
        row_id: u32,
        snapshot: Timestamp,
    ) -> Result<(Vec<Value>, bool)> {
        let base = self.base_row(row_id)?;
        self.tracker.apply_at_snapshot(&base, row_id, snapshot)
    }

    pub fn new_row_iterator(self: &Arc<Self>, snapshot: Timestamp) -> DiskRowSetIterator {
        DiskRowSetIterator {
            drs: self.clone(),
            next_row_id: 0,
            snapshot,
        }
    }

    /// Flushes the DMS as the newest REDO file. Returns the updated
    /// metadata for the manifest, or `None` when the DMS was empty.
    pub fn flush_dms(&self, dir_manager: &DirManager) -> Result<Option<RowSetMetadata>> {
        let (_, block) = dir_manager.place_block()?;
        let path = dir_manager.resolve_block(&block)?;
        match self.tracker.flush_dms(&path)? {
            None => Ok(None),
            Some(_stats) => {
                let mut meta = self.meta.lock();
                meta.redo_delta_blocks.insert(0, block);
                Ok(Some(meta.clone()))
            }
        }
    }

    /// Merges the whole REDO stack into one file. Returns the updated
    /// metadata, or `None` when there was nothing to merge.
    pub fn minor_compact_redos(&self, dir_manager: &DirManager) -> Result<Option<RowSetMetadata>> {
        let (_, block) = dir_manager.place_block()?;
        let path = dir_manager.resolve_block(&block)?;
        match self.tracker.minor_compact_redos(&path)? {
            None => {
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
            Some((_stats, replaced)) => {
                let mut meta = self.meta.lock();
                meta.redo_delta_blocks = vec![block];
                drop(meta);
                for old in replaced {
                    if let Err(e) = std::fs::remove_file(&old) {
                        warn!(file = %old.display(), error = %e, "could not remove merged delta file");
                    }
                }
                Ok(Some(self.meta.lock().clone()))
            }
        }
    }

    /// Deletes UNDO files entirely below the ancient history mark and
    /// returns the updated metadata.
    pub fn delete_ancient_undo_deltas(
        &self,
        ahm: Timestamp,
        dir_manager: &DirManager,
    ) -> Result<Option<(RowSetMetadata, u64)>> {
        let (deleted, bytes) = self.tracker.delete_ancient_undo_deltas(ahm)?;
        if deleted.is_empty() {
            return Ok(None);
        }
        let mut meta = self.meta.lock();
        let remaining: Vec<PathBuf> = self
            .tracker
            .undo_files()
            .iter()
            .map(|f| f.path().to_path_buf())
            .collect();
        meta.undo_delta_blocks.retain(|b| {
            dir_manager
                .resolve_block(b)
                .map(|p| remaining.contains(&p))
                .unwrap_or(false)
        });
        Ok(Some((meta.clone(), bytes)))
    }
}

/// Scans the base in row-id order, layering deltas per row.
pub struct DiskRowSetIterator {
    drs: Arc<DiskRowSet>,
    next_row_id: u32,
    snapshot: Timestamp,
}

impl DiskRowSetIterator {
    /// Up to `n` rows of (encoded key, row, live), advancing the
    /// cursor. Empty when exhausted.
    pub fn next_batch(&mut self, n: usize) -> Result<Vec<(Vec<u8>, Vec<Value>, bool)>> {
        let total = self.drs.count_rows();
        let mut out = vec![];
        while out.len() < n && (self.next_row_id as u64) < total {
            let row_id = self.next_row_id;
            self.next_row_id += 1;
            let (row, live) = self.drs.row_at_snapshot(row_id, self.snapshot)?;
            let key = self.drs.schema.encode_key(&row);
            out.push((key, row, live));
        }
        Ok(out)
    }
}

/// Writes one DiskRowSet's base files. Rows must be appended in
/// ascending key order.
pub struct DiskRowSetWriter {
    rowset_id: u64,
    schema: SchemaRef,
    col_writers: Vec<CFileWriter<BufWriter<File>>>,
    col_blocks: Vec<(u32, BlockId)>,
    key_writer: CFileWriter<BufWriter<File>>,
    key_block: BlockId,
    bloom: Bloom<[u8]>,
    bloom_block: BlockId,
    bloom_path: PathBuf,
    written_count: u64,
    live_count: i64,
    min_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl DiskRowSetWriter {
    pub fn new(
        rowset_id: u64,
        schema: SchemaRef,
        dir_manager: &DirManager,
    ) -> Result<DiskRowSetWriter> {
        let mut col_writers = Vec::with_capacity(schema.num_columns());
        let mut col_blocks = Vec::with_capacity(schema.num_columns());
        for col in schema.columns() {
            let id = col
                .id
                .ok_or_else(|| Error::illegal_state("tablet schema lacks column ids"))?;
            let (_, block) = dir_manager.place_block()?;
            let path = dir_manager.resolve_block(&block)?;
            let file = File::create(path)?;
            col_writers.push(CFileWriter::new(
                BufWriter::new(file),
                cfile_opts_for_column(col),
            )?);
            col_blocks.push((id, block));
        }
        let (_, key_block) = dir_manager.place_block()?;
        let key_file = File::create(dir_manager.resolve_block(&key_block)?)?;
        let key_writer = CFileWriter::new(BufWriter::new(key_file), key_index_opts())?;
        let (_, bloom_block) = dir_manager.place_block()?;
        let bloom_path = dir_manager.resolve_block(&bloom_block)?;
        let bloom = Bloom::new_for_fp_rate(BLOOM_EXPECTED_KEYS, BLOOM_FP_RATE)
            .map_err(|e| Error::illegal_state(e))?;
        Ok(DiskRowSetWriter {
            rowset_id,
            schema,
            col_writers,
            col_blocks,
            key_writer,
            key_block,
            bloom,
            bloom_block,
            bloom_path,
            written_count: 0,
            live_count: 0,
            min_key: None,
            last_key: None,
        })
    }

    /// Appends a block of rows to every column writer, the key index,
    /// and the bloom. `live_rows` counts the rows that are live as of
    /// the flush snapshot.
    pub fn append_block(&mut self, block: &RowBlock, live_rows: i64) -> Result<()> {
        let rows = block.to_rows();
        for row in &rows {
            let key = self.schema.encode_key(row);
            if let Some(last) = &self.last_key {
                if *last >= key {
                    return Err(Error::illegal_state(
                        "rows must be appended in ascending key order",
                    ));
                }
            }
            if self.min_key.is_none() {
                self.min_key = Some(key.clone());
            }
            self.bloom.set(&key[..]);
            self.key_writer
                .append_entries(&ColumnVec::Binary(vec![Bytes::from(key.clone())]))?;
            self.last_key = Some(key);
        }
        for (idx, col) in self.schema.columns().iter().enumerate() {
            let mut data = ColumnVec::new(col.data_type.physical_type());
            let mut bitmap = BitVec::<u8, Lsb0>::new();
            for row in &rows {
                match &row[idx] {
                    Value::Null => {
                        bitmap.push(false);
                        push_zero(&mut data);
                    }
                    v => {
                        bitmap.push(true);
                        data.push(v.clone());
                    }
                }
            }
            if col.nullable {
                self.col_writers[idx].append_nullable_entries(&bitmap, &data)?;
            } else {
                self.col_writers[idx].append_entries(&data)?;
            }
        }
        self.written_count += rows.len() as u64;
        self.live_count += live_rows;
        Ok(())
    }

    pub fn written_count(&self) -> u64 {
        self.written_count
    }

    /// Approximate bytes written across the base files so far.
    pub fn written_size(&self) -> u64 {
        self.col_writers
            .iter()
            .map(|w| w.written_size())
            .sum::<u64>()
            + self.key_writer.written_size()
    }

    /// Closes every file. `Aborted` when no rows were written: an
    /// empty flush produces no CFiles.
    pub fn finish(self) -> Result<RowSetMetadata> {
        if self.written_count == 0 {
            return Err(Error::aborted("no rows written"));
        }
        for writer in self.col_writers {
            let (sink, _) = writer.finish()?;
            sync_bufwriter(sink)?;
        }
        let (sink, _) = self.key_writer.finish()?;
        sync_bufwriter(sink)?;
        store_bloom(&self.bloom_path, &self.bloom)?;
        Ok(RowSetMetadata {
            id: self.rowset_id,
            column_blocks: self.col_blocks,
            key_index_block: self.key_block,
            bloom_block: Some(self.bloom_block),
            redo_delta_blocks: vec![],
            undo_delta_blocks: vec![],
            base_row_count: self.written_count,
            live_row_count: Some(self.live_count),
            min_encoded_key: self.min_key,
            max_encoded_key: self.last_key,
            has_been_compacted: false,
        })
    }
}

fn push_zero(data: &mut ColumnVec) {
    match data.physical_type() {
        PhysicalType::I8 => data.push(Value::I8(0)),
        PhysicalType::I16 => data.push(Value::I16(0)),
        PhysicalType::I32 => data.push(Value::I32(0)),
        PhysicalType::I64 => data.push(Value::I64(0)),
        PhysicalType::I128 => data.push(Value::I128(0)),
        PhysicalType::F32 => data.push(Value::F32(0.0)),
        PhysicalType::F64 => data.push(Value::F64(0.0)),
        PhysicalType::Bool => data.push(Value::Bool(false)),
        PhysicalType::Binary => data.push(Value::Binary(Bytes::new())),
    }
}

fn sync_bufwriter(sink: BufWriter<File>) -> Result<()> {
    let file = sink
        .into_inner()
        .map_err(|e| Error::io_error(format!("flushing rowset file: {e}"), None))?;
    file.sync_all()?;
    Ok(())
}

struct RollingOutput {
    writer: DiskRowSetWriter,
    redo_writer: Option<(DeltaFileWriter, BlockId, PathBuf)>,
    undo_writer: Option<(DeltaFileWriter, BlockId, PathBuf)>,
    rows: u32,
}

/// Emits a sequence of DiskRowSets bounded by a target size, keeping
/// base rows and their delta files aligned: a row's deltas must be
/// appended before the block carrying the row, and the writer only
/// rolls at `append_block` boundaries.
pub struct RollingDiskRowSetWriter<'a> {
    schema: SchemaRef,
    dir_manager: &'a DirManager,
    target_size: u64,
    next_rowset_id: u64,
    cur: Option<RollingOutput>,
    outputs: Vec<RowSetMetadata>,
}

impl<'a> RollingDiskRowSetWriter<'a> {
    pub fn new(
        schema: SchemaRef,
        dir_manager: &'a DirManager,
        target_size: u64,
        next_rowset_id: u64,
    ) -> RollingDiskRowSetWriter<'a> {
        RollingDiskRowSetWriter {
            schema,
            dir_manager,
            target_size,
            next_rowset_id,
            cur: None,
            outputs: vec![],
        }
    }

    fn ensure_cur(&mut self) -> Result<&mut RollingOutput> {
        if self.cur.is_none() {
            let writer =
                DiskRowSetWriter::new(self.next_rowset_id, self.schema.clone(), self.dir_manager)?;
            self.next_rowset_id += 1;
            self.cur = Some(RollingOutput {
                writer,
                redo_writer: None,
                undo_writer: None,
                rows: 0,
            });
        }
        Ok(self.cur.as_mut().unwrap())
    }

    /// REDO history for the row about to be appended at
    /// `row_idx_in_block` of the next block. Returns the row's id in
    /// the current output rowset.
    pub fn append_redo_deltas(
        &mut self,
        row_idx_in_block: u32,
        deltas: &[(Timestamp, RowChange)],
    ) -> Result<u32> {
        let dir_manager = self.dir_manager;
        let cur = self.ensure_cur()?;
        let row_id = cur.rows + row_idx_in_block;
        if !deltas.is_empty() {
            if cur.redo_writer.is_none() {
                let (_, block) = dir_manager.place_block()?;
                let path = dir_manager.resolve_block(&block)?;
                cur.redo_writer =
                    Some((DeltaFileWriter::create(&path, DeltaType::Redo)?, block, path));
            }
            let (writer, _, _) = cur.redo_writer.as_mut().unwrap();
            // REDO file order within a row is newest first.
            let mut sorted: Vec<_> = deltas.to_vec();
            sorted.sort_by(|a, b| b.0.cmp(&a.0));
            for (ts, change) in sorted {
                writer.append(DeltaKey::new(row_id, ts), &change)?;
            }
        }
        Ok(row_id)
    }

    /// UNDO history for the row about to be appended, ascending
    /// timestamps.
    pub fn append_undo_deltas(
        &mut self,
        row_idx_in_block: u32,
        deltas: &[(Timestamp, RowChange)],
    ) -> Result<u32> {
        let dir_manager = self.dir_manager;
        let cur = self.ensure_cur()?;
        let row_id = cur.rows + row_idx_in_block;
        if !deltas.is_empty() {
            if cur.undo_writer.is_none() {
                let (_, block) = dir_manager.place_block()?;
                let path = dir_manager.resolve_block(&block)?;
                cur.undo_writer =
                    Some((DeltaFileWriter::create(&path, DeltaType::Undo)?, block, path));
            }
            let (writer, _, _) = cur.undo_writer.as_mut().unwrap();
            let mut sorted: Vec<_> = deltas.to_vec();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            for (ts, change) in sorted {
                writer.append(DeltaKey::new(row_id, ts), &change)?;
            }
        }
        Ok(row_id)
    }

    /// Appends the block whose rows' deltas were just written, then
    /// rolls if the output crossed the target size. This is the only
    /// legal roll point.
    pub fn append_block(&mut self, block: &RowBlock, live_rows: i64) -> Result<()> {
        let nrows = block.selection.count_selected() as u32;
        let cur = self.ensure_cur()?;
        cur.writer.append_block(block, live_rows)?;
        cur.rows += nrows;
        if cur.writer.written_size() >= self.target_size {
            self.roll()?;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        let Some(cur) = self.cur.take() else {
            return Ok(());
        };
        if cur.writer.written_count() == 0 {
            return Ok(());
        }
        let mut meta = cur.writer.finish()?;
        if let Some((writer, block, path)) = cur.redo_writer {
            if writer.entry_count() > 0 {
                writer.finish()?;
                meta.redo_delta_blocks.push(block);
            } else {
                writer.finish()?;
                let _ = std::fs::remove_file(path);
            }
        }
        if let Some((writer, block, path)) = cur.undo_writer {
            if writer.entry_count() > 0 {
                writer.finish()?;
                meta.undo_delta_blocks.push(block);
            } else {
                writer.finish()?;
                let _ = std::fs::remove_file(path);
            }
        }
        self.outputs.push(meta);
        Ok(())
    }

    /// Closes the writer; returns the produced rowset metadata and the
    /// next unused rowset id.
    pub fn finish(mut self) -> Result<(Vec<RowSetMetadata>, u64)> {
        self.roll()?;
        Ok((self.outputs, self.next_rowset_id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::DirManagerOptions;
    use crate::schema::Schema;
    use crate::tablet::delta::ColumnUpdate;

    pub(crate) fn test_schema() -> SchemaRef {
        Arc::new(
            Schema::new(
                vec![
                    ColumnSchema::new("id", DataType::Int32),
                    ColumnSchema::new("name", DataType::String).nullable(true),
                ],
                1,
            )
            .unwrap()
            .with_assigned_ids(),
        )
    }

    pub(crate) fn test_dir_manager(tmp: &tempfile::TempDir) -> DirManager {
        let root = tmp.path().join("r1");
        std::fs::create_dir_all(&root).unwrap();
        let roots = vec![root];
        DirManager::create(&roots, DirManagerOptions::new("data")).unwrap();
        DirManager::open(&roots, DirManagerOptions::new("data")).unwrap()
    }

    fn row(id: i32, name: Option<&str>) -> Vec<Value> {
        vec![
            Value::I32(id),
            name.map(Value::from_str_slice).unwrap_or(Value::Null),
        ]
    }

    pub(crate) fn build_rowset(
        dm: &DirManager,
        schema: &SchemaRef,
        rows: &[Vec<Value>],
    ) -> RowSetMetadata {
        let mut writer = DiskRowSetWriter::new(0, schema.clone(), dm).unwrap();
        let block = RowBlock::from_rows(schema.clone(), rows);
        writer.append_block(&block, rows.len() as i64).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_write_open_and_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = test_dir_manager(&tmp);
        let schema = test_schema();
        let rows = vec![row(1, Some("a")), row(2, None), row(3, Some("c"))];
        let meta = build_rowset(&dm, &schema, &rows);
        assert_eq!(meta.base_row_count, 3);
        assert_eq!(meta.live_row_count, Some(3));

        let drs = DiskRowSet::open(meta, schema.clone(), &dm, None).unwrap();
        assert_eq!(drs.count_rows(), 3);
        assert_eq!(drs.count_live_rows(), 3);
        let mut iter = drs.new_row_iterator(Timestamp::MAX);
        let batch = iter.next_batch(10).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].1, rows[0]);
        assert_eq!(batch[1].1, rows[1]);
        assert!(batch.iter().all(|(_, _, live)| *live));
        assert!(iter.next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_and_mutate() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = test_dir_manager(&tmp);
        let schema = test_schema();
        let rows = vec![row(1, Some("a")), row(5, Some("b")), row(9, Some("c"))];
        let meta = build_rowset(&dm, &schema, &rows);
        let drs = DiskRowSet::open(meta, schema.clone(), &dm, None).unwrap();

        let key = schema.encode_key(&row(5, None));
        assert_eq!(drs.lookup_row_id(&key).unwrap(), Some(1));
        let missing = schema.encode_key(&row(6, None));
        assert_eq!(drs.lookup_row_id(&missing).unwrap(), None);
        let out_of_range = schema.encode_key(&row(100, None));
        assert_eq!(drs.lookup_row_id(&out_of_range).unwrap(), None);

        drs.mutate(
            1,
            Timestamp(50),
            RowChange::Update(vec![ColumnUpdate {
                column_id: 1,
                value: Value::from_str_slice("updated"),
            }]),
        );
        let (r, live) = drs.row_at_snapshot(1, Timestamp::MAX).unwrap();
        assert!(live);
        assert_eq!(r[1], Value::from_str_slice("updated"));
        // Old snapshots still see the base value.
        let (r, _) = drs.row_at_snapshot(1, Timestamp(10)).unwrap();
        assert_eq!(r[1], Value::from_str_slice("b"));
    }

    #[test]
    fn test_dms_flush_updates_metadata_and_live_count() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = test_dir_manager(&tmp);
        let schema = test_schema();
        let rows = vec![row(1, Some("a")), row(2, Some("b"))];
        let meta = build_rowset(&dm, &schema, &rows);
        let drs = DiskRowSet::open(meta, schema.clone(), &dm, None).unwrap();

        drs.mutate(0, Timestamp(10), RowChange::Delete);
        assert_eq!(drs.count_live_rows(), 1);
        let updated = drs.flush_dms(&dm).unwrap().unwrap();
        assert_eq!(updated.redo_delta_blocks.len(), 1);
        // Live count invariant: base + delta stats.
        assert_eq!(drs.count_live_rows(), 1);
        assert!(drs.check_row_deleted(0, Timestamp::MAX).unwrap());
        // No-op when the DMS is empty.
        assert!(drs.flush_dms(&dm).unwrap().is_none());
    }

    #[test]
    fn test_rolling_writer_respects_target_size() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = test_dir_manager(&tmp);
        let schema = test_schema();
        let mut writer = RollingDiskRowSetWriter::new(schema.clone(), &dm, 4096, 0);
        let mut id = 0;
        for _ in 0..40 {
            let rows: Vec<Vec<Value>> = (0..100)
                .map(|_| {
                    id += 1;
                    row(id, Some("payload-payload-payload"))
                })
                .collect();
            let block = RowBlock::from_rows(schema.clone(), &rows);
            writer.append_block(&block, rows.len() as i64).unwrap();
        }
        let (outputs, next_id) = writer.finish().unwrap();
        assert!(outputs.len() > 1, "expected the writer to roll");
        assert_eq!(next_id, outputs.len() as u64);
        let total: u64 = outputs.iter().map(|m| m.base_row_count).sum();
        assert_eq!(total, 4000);
        // Key ranges are disjoint and ordered.
        for pair in outputs.windows(2) {
            assert!(pair[0].max_encoded_key < pair[1].min_encoded_key);
        }
    }

    #[test]
    fn test_rolling_writer_aligns_deltas_with_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = test_dir_manager(&tmp);
        let schema = test_schema();
        let mut writer = RollingDiskRowSetWriter::new(schema.clone(), &dm, u64::MAX, 7);
        let rows = vec![row(1, Some("a")), row(2, Some("b"))];
        // Row 1 carries an undo chain; row 0 carries a redo delete.
        writer
            .append_redo_deltas(0, &[(Timestamp(30), RowChange::Delete)])
            .unwrap();
        let rid = writer
            .append_undo_deltas(1, &[(Timestamp(5), RowChange::Delete)])
            .unwrap();
        assert_eq!(rid, 1);
        let block = RowBlock::from_rows(schema.clone(), &rows);
        writer.append_block(&block, 2).unwrap();
        let (outputs, _) = writer.finish().unwrap();
        assert_eq!(outputs.len(), 1);
        let meta = &outputs[0];
        assert_eq!(meta.id, 7);
        assert_eq!(meta.redo_delta_blocks.len(), 1);
        assert_eq!(meta.undo_delta_blocks.len(), 1);

        let drs = DiskRowSet::open(meta.clone(), schema.clone(), &dm, None).unwrap();
        // Row 0 is deleted by its redo.
        assert!(drs.check_row_deleted(0, Timestamp::MAX).unwrap());
        // Row 1's undo hides it from snapshots before its insert.
        let (_, live) = drs.row_at_snapshot(1, Timestamp(3)).unwrap();
        assert!(!live);
        let (_, live) = drs.row_at_snapshot(1, Timestamp::MAX).unwrap();
        assert!(live);
    }

    #[test]
    fn test_empty_writer_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let dm = test_dir_manager(&tmp);
        let writer = DiskRowSetWriter::new(0, test_schema(), &dm).unwrap();
        let err = writer.finish().unwrap_err();
        assert!(matches!(err, Error::Aborted(_)));
    }
}
