// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! CFile reader: footer parsing, cached block reads, and the iterator
//! with ordinal/value seeks and predicate evaluation.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use prost::Message;

use super::block::{BlockDecoder, BlockDecoderImpl, ColumnSink, NullableBlockDecoder};
use super::bshuf::BShufBlockDecoder;
use super::dict::{BinaryDictBlockDecoder, DictDecoder, DictEncodingMode};
use super::index::IndexBlockReader;
use super::plain::{PlainBinaryBlockDecoder, PlainFixedBlockDecoder};
use super::predicate::ColumnPredicate;
use super::writer::{compression_from_pb, encoding_from_pb, physical_type_from_pb};
use super::{BlockCache, BlockCacheKey, BlockPointer, CFILE_MAGIC, CFILE_MAGIC_LEN};
use crate::error::{Error, Result};
use crate::proto::CFileFooterPb;
use crate::rowblock::SelectionVector;
use crate::schema::{CompressionType, EncodingType};
use crate::types::{ColumnVec, PhysicalType, Value};

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

const FILE_TAIL_SIZE: usize = 4 + CFILE_MAGIC_LEN;

#[derive(Debug)]
pub struct CFileReader {
    file: File,
    footer: CFileFooterPb,
    physical: PhysicalType,
    encoding: EncodingType,
    compression: CompressionType,
    cache: Option<BlockCache>,
    file_id: u64,
    dict: Option<Arc<DictDecoder>>,
}

impl CFileReader {
    pub fn open(path: &Path, cache: Option<BlockCache>) -> Result<Arc<CFileReader>> {
        let file = File::open(path).map_err(|e| Error::from(e).prepend(path.display().to_string()))?;
        Self::open_file(file, cache)
    }

    pub fn open_file(file: File, cache: Option<BlockCache>) -> Result<Arc<CFileReader>> {
        let file_size = file.metadata().map_err(Error::from)?.len();
        if (file_size as usize) < CFILE_MAGIC_LEN + FILE_TAIL_SIZE {
            return Err(Error::corruption(format!(
                "file too short to be a CFile: {file_size} bytes"
            )));
        }
        let mut head = [0u8; CFILE_MAGIC_LEN];
        file.read_exact_at(&mut head, 0).map_err(Error::from)?;
        if &head != CFILE_MAGIC {
            return Err(Error::corruption("bad CFile header magic"));
        }
        let mut tail = [0u8; FILE_TAIL_SIZE];
        file.read_exact_at(&mut tail, file_size - FILE_TAIL_SIZE as u64)
            .map_err(Error::from)?;
        if &tail[4..] != CFILE_MAGIC {
            return Err(Error::corruption("bad CFile trailer magic"));
        }
        let footer_len = (&tail[..4]).get_u32_le() as u64;
        let footer_end = file_size - FILE_TAIL_SIZE as u64;
        if footer_len > footer_end - CFILE_MAGIC_LEN as u64 {
            return Err(Error::corruption(format!(
                "footer length {footer_len} overruns the file"
            )));
        }
        let mut footer_buf = vec![0u8; footer_len as usize];
        file.read_exact_at(&mut footer_buf, footer_end - footer_len)
            .map_err(Error::from)?;
        let footer = CFileFooterPb::decode(&footer_buf[..])?;

        let physical = physical_type_from_pb(footer.data_type)?;
        let encoding = encoding_from_pb(footer.encoding)?;
        let compression = compression_from_pb(footer.compression)?;
        let mut reader = CFileReader {
            file,
            footer,
            physical,
            encoding,
            compression,
            cache,
            file_id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            dict: None,
        };
        if let Some(ptr) = reader.footer.dict_block_ptr {
            let dict_block = reader.read_block(BlockPointer::from_pb(&ptr))?;
            reader.dict = Some(Arc::new(DictDecoder::parse(dict_block)?));
        }
        Ok(Arc::new(reader))
    }

    pub fn num_values(&self) -> u64 {
        self.footer.num_values
    }

    pub fn is_nullable(&self) -> bool {
        self.footer.is_nullable
    }

    pub fn physical_type(&self) -> PhysicalType {
        self.physical
    }

    pub fn encoding(&self) -> EncodingType {
        self.encoding
    }

    pub fn has_validx(&self) -> bool {
        self.footer.validx_root.is_some()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&[u8]> {
        self.footer
            .metadata
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_slice())
    }

    pub fn dictionary(&self) -> Option<&Arc<DictDecoder>> {
        self.dict.as_ref()
    }

    /// Reads, verifies, and decompresses one block, via the shared
    /// cache when configured.
    pub fn read_block(&self, ptr: BlockPointer) -> Result<Bytes> {
        let key = BlockCacheKey {
            file_id: self.file_id,
            offset: ptr.offset,
        };
        if let Some(cache) = &self.cache {
            if let Some(block) = cache.get(&key) {
                return Ok(block);
            }
        }
        let mut raw = vec![0u8; ptr.size as usize];
        self.file
            .read_exact_at(&mut raw, ptr.offset)
            .map_err(Error::from)?;
        if self.footer.checksummed {
            if raw.len() < 4 {
                return Err(Error::corruption("block shorter than its checksum"));
            }
            let payload_len = raw.len() - 4;
            let expected = (&raw[payload_len..]).get_u32_le();
            let actual = crc32fast::hash(&raw[..payload_len]);
            if expected != actual {
                return Err(Error::corruption(format!(
                    "block checksum mismatch at offset {}: expected {expected:#x}, got {actual:#x}",
                    ptr.offset
                )));
            }
            raw.truncate(payload_len);
        }
        let block = match self.compression {
            CompressionType::None => Bytes::from(raw),
            CompressionType::Lz4 => Bytes::from(
                lz4_flex::decompress_size_prepended(&raw)
                    .map_err(|e| Error::corruption(format!("lz4 decompress: {e}")))?,
            ),
        };
        if let Some(cache) = &self.cache {
            cache.insert(key, block.clone());
        }
        Ok(block)
    }

    fn make_decoder(&self, data: Bytes) -> Result<BlockDecoderImpl> {
        let inner = |data: Bytes| -> Result<BlockDecoderImpl> {
            Ok(match self.encoding {
                EncodingType::BitShuffle => {
                    BlockDecoderImpl::BShuf(BShufBlockDecoder::parse(self.physical, data)?)
                }
                EncodingType::Plain => match self.physical {
                    PhysicalType::Binary => {
                        BlockDecoderImpl::PlainBinary(PlainBinaryBlockDecoder::parse(data)?)
                    }
                    _ => BlockDecoderImpl::PlainFixed(PlainFixedBlockDecoder::parse(
                        self.physical,
                        data,
                    )?),
                },
                EncodingType::Dictionary => BlockDecoderImpl::Dict(BinaryDictBlockDecoder::parse(
                    data,
                    self.dict.clone(),
                )?),
                EncodingType::Auto => unreachable!(),
            })
        };
        if self.footer.is_nullable {
            Ok(BlockDecoderImpl::Nullable(NullableBlockDecoder::parse(
                data, inner,
            )?))
        } else {
            inner(data)
        }
    }

    /// Descends an index tree to the leaf entry covering `key`.
    /// Returns the data block pointer and the leaf entry's key.
    fn walk_index(&self, root: BlockPointer, key: &[u8]) -> Result<(BlockPointer, Vec<u8>)> {
        let mut ptr = root;
        loop {
            let reader = IndexBlockReader::parse(self.read_block(ptr)?)?;
            let idx = reader.floor_or_first(key)?;
            let child = reader.child(idx)?;
            if reader.is_leaf() {
                return Ok((child, reader.entries()[idx].key.clone()));
            }
            ptr = child;
        }
    }

    pub fn new_iterator(self: &Arc<Self>) -> CFileIterator {
        CFileIterator {
            reader: self.clone(),
            cur: None,
            exhausted: false,
            codeword_matches: None,
        }
    }
}

struct CurBlock {
    decoder: BlockDecoderImpl,
    first_ordinal: u64,
}

impl CurBlock {
    fn next_ordinal(&self) -> u64 {
        self.first_ordinal + self.decoder.count() as u64
    }
}

pub struct CFileIterator {
    reader: Arc<CFileReader>,
    cur: Option<CurBlock>,
    exhausted: bool,
    /// For each dictionary codeword, whether it satisfies the pushed
    /// predicate. Computed once per (iterator, predicate).
    codeword_matches: Option<(ColumnPredicate, Vec<bool>)>,
}

impl CFileIterator {
    /// Current absolute ordinal, meaningful after a seek.
    pub fn ordinal(&self) -> u64 {
        match &self.cur {
            Some(cur) => cur.first_ordinal + cur.decoder.pos() as u64,
            None => self.reader.num_values(),
        }
    }

    pub fn has_next(&self) -> bool {
        !self.exhausted && self.ordinal() < self.reader.num_values()
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.seek_to_ordinal(0)
    }

    pub fn seek_to_ordinal(&mut self, ordinal: u64) -> Result<()> {
        if ordinal > self.reader.num_values() {
            return Err(Error::invalid_argument(format!(
                "ordinal {ordinal} out of range ({} values)",
                self.reader.num_values()
            )));
        }
        if ordinal == self.reader.num_values() {
            self.cur = None;
            self.exhausted = true;
            return Ok(());
        }
        let root = self
            .reader
            .footer
            .posidx_root
            .ok_or_else(|| Error::corruption("CFile has values but no positional index"))?;
        let (ptr, entry_key) = self
            .reader
            .walk_index(BlockPointer::from_pb(&root), &ordinal.to_be_bytes())?;
        let first_ordinal = u64::from_be_bytes(
            entry_key
                .as_slice()
                .try_into()
                .map_err(|_| Error::corruption("positional index key is not an ordinal"))?,
        );
        let mut decoder = self.reader.make_decoder(self.reader.read_block(ptr)?)?;
        decoder.seek_to_position_in_block((ordinal - first_ordinal) as usize);
        self.cur = Some(CurBlock {
            decoder,
            first_ordinal,
        });
        self.exhausted = false;
        Ok(())
    }

    /// Positions at the first cell `>= value` (an encoded key). Sets
    /// `exact` when the cell equals the value. `NotFound` when every
    /// cell in the file sorts before it.
    pub fn seek_at_or_after(&mut self, value: &[u8], exact: &mut bool) -> Result<()> {
        let root = self
            .reader
            .footer
            .validx_root
            .ok_or_else(|| Error::illegal_state("CFile has no value index"))?;
        let (ptr, _) = self
            .reader
            .walk_index(BlockPointer::from_pb(&root), value)?;
        // The value index has one entry per data block; recover the
        // block's first ordinal from the positional index by probing
        // its own offset through the leaf entries.
        let first_ordinal = self.block_first_ordinal(ptr)?;
        let mut decoder = self.reader.make_decoder(self.reader.read_block(ptr)?)?;
        match decoder.seek_at_or_after_value(value) {
            Ok(ex) => {
                *exact = ex;
                self.cur = Some(CurBlock {
                    decoder,
                    first_ordinal,
                });
                self.exhausted = false;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                // Every cell of the candidate block sorts before the
                // value. By the index's floor property the answer, if
                // any, is the first cell of the next block.
                let next = first_ordinal + decoder.count() as u64;
                if next < self.reader.num_values() {
                    *exact = false;
                    self.seek_to_ordinal(next)
                } else {
                    self.cur = Some(CurBlock {
                        decoder,
                        first_ordinal,
                    });
                    self.exhausted = true;
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// The first ordinal of the data block at `ptr`, found by binary
    /// probing the positional index with the block's covered range.
    fn block_first_ordinal(&self, ptr: BlockPointer) -> Result<u64> {
        let root = self
            .reader
            .footer
            .posidx_root
            .ok_or_else(|| Error::corruption("CFile has values but no positional index"))?;
        let mut lo = 0u64;
        let mut hi = self.reader.num_values().saturating_sub(1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (cand, entry_key) = self
                .reader
                .walk_index(BlockPointer::from_pb(&root), &mid.to_be_bytes())?;
            let cand_first = u64::from_be_bytes(
                entry_key
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corruption("positional index key is not an ordinal"))?,
            );
            if cand == ptr {
                return Ok(cand_first);
            }
            if cand.offset < ptr.offset {
                lo = mid + 1;
            } else {
                hi = cand_first.saturating_sub(1);
            }
        }
        let (cand, entry_key) = self
            .reader
            .walk_index(BlockPointer::from_pb(&root), &lo.to_be_bytes())?;
        if cand != ptr {
            return Err(Error::corruption(
                "value index entry does not match any positional index entry",
            ));
        }
        Ok(u64::from_be_bytes(entry_key.as_slice().try_into().unwrap()))
    }

    fn advance_block(&mut self) -> Result<bool> {
        let next = match &self.cur {
            Some(cur) => cur.next_ordinal(),
            None => return Ok(false),
        };
        if next >= self.reader.num_values() {
            self.cur = None;
            self.exhausted = true;
            return Ok(false);
        }
        self.seek_to_ordinal(next)?;
        Ok(true)
    }

    /// Decodes up to `n` cells into `dst`. Returns the count decoded,
    /// 0 at end of file.
    pub fn copy_next_values(&mut self, n: usize, dst: &mut ColumnSink<'_>) -> Result<usize> {
        let mut copied = 0;
        while copied < n {
            let Some(cur) = self.cur.as_mut() else { break };
            let got = cur.decoder.copy_next_values(n - copied, dst);
            copied += got;
            let block_done = cur.decoder.remaining() == 0;
            if block_done && !self.advance_block()? {
                break;
            }
        }
        Ok(copied)
    }

    fn ensure_codeword_matches(&mut self, pred: &ColumnPredicate) {
        let recompute = match &self.codeword_matches {
            Some((cached_pred, _)) => cached_pred != pred,
            None => true,
        };
        if !recompute {
            return;
        }
        let dict = self.reader.dictionary().cloned();
        let matches = match dict {
            Some(dict) => (0..dict.len())
                .map(|cw| pred.evaluate_cell(&dict.cell_at(cw as u32)))
                .collect(),
            None => vec![],
        };
        self.codeword_matches = Some((pred.clone(), matches));
    }

    /// Decodes up to `n` cells, evaluating `pred` during the decode.
    /// Bit `i` of `sel` corresponds to the `i`-th cell of this call;
    /// non-matching cells get their bit cleared and a placeholder cell
    /// in `dst` so row alignment is preserved.
    ///
    /// On dictionary files in codeword mode the predicate is evaluated
    /// against the dictionary once; matching rows receive zero-copy
    /// slices into the dictionary block. `IsNotNull` decodes every
    /// row. When no codeword matches, whole blocks are skipped without
    /// decoding.
    pub fn copy_next_and_eval(
        &mut self,
        n: usize,
        pred: &ColumnPredicate,
        sel: &mut SelectionVector,
        dst: &mut ColumnSink<'_>,
    ) -> Result<usize> {
        assert!(sel.len() >= n);
        if pred.is_not_null() {
            return self.copy_next_values(n, dst);
        }
        if self.reader.encoding() == EncodingType::Dictionary && !self.reader.is_nullable() {
            self.ensure_codeword_matches(pred);
            return self.copy_next_and_eval_dict(n, sel, dst);
        }
        // Fallback: materialize, then evaluate cell by cell.
        let mut tmp = ColumnVec::new(self.reader.physical_type());
        let mut bitmap: bitvec::vec::BitVec<u8, bitvec::order::Lsb0> = bitvec::vec::BitVec::new();
        let copied = {
            let mut tmp_sink = ColumnSink::new(
                &mut tmp,
                self.reader.is_nullable().then_some(&mut bitmap),
            );
            self.copy_next_values(n, &mut tmp_sink)?
        };
        for i in 0..copied {
            let is_null = self.reader.is_nullable() && !bitmap[i];
            let matched = !is_null
                && match tmp.get(i) {
                    Value::Binary(b) => pred.evaluate_cell(&b),
                    // Non-binary predicates are handled above the
                    // storage layer; keep the row.
                    _ => true,
                };
            if !matched {
                sel.clear_bit(i);
            }
            if is_null {
                dst.push_null();
            } else {
                dst.push(tmp.get(i));
            }
        }
        Ok(copied)
    }

    fn copy_next_and_eval_dict(
        &mut self,
        n: usize,
        sel: &mut SelectionVector,
        dst: &mut ColumnSink<'_>,
    ) -> Result<usize> {
        let (pred, matches) = self.codeword_matches.clone().expect("matches computed");
        let any_match = matches.iter().any(|&m| m);
        let dict = self.reader.dictionary().cloned();
        let mut copied = 0;
        while copied < n {
            let Some(cur) = self.cur.as_mut() else { break };
            let want = n - copied;
            let BlockDecoderImpl::Dict(decoder) = &mut cur.decoder else {
                return Err(Error::illegal_state("dictionary file without dict blocks"));
            };
            match decoder.mode() {
                DictEncodingMode::CodeWord => {
                    let dict = dict
                        .as_ref()
                        .ok_or_else(|| Error::corruption("codeword block without dictionary"))?;
                    if !any_match {
                        // Nothing can match: advance without decoding.
                        let skip = want.min(decoder.remaining());
                        let pos = decoder.pos();
                        decoder.seek_to_position_in_block(pos + skip);
                        for _ in 0..skip {
                            sel.clear_bit(copied);
                            dst.push(Value::Binary(Bytes::new()));
                            copied += 1;
                        }
                    } else {
                        let mut codewords = Vec::with_capacity(want);
                        decoder.copy_next_codewords(want, &mut codewords);
                        for cw in codewords {
                            if sel.is_selected(copied) && matches[cw as usize] {
                                dst.push(Value::Binary(dict.cell_at(cw)));
                            } else {
                                sel.clear_bit(copied);
                                dst.push(Value::Binary(Bytes::new()));
                            }
                            copied += 1;
                        }
                    }
                }
                DictEncodingMode::PlainBinary => {
                    let mut tmp = ColumnVec::new(PhysicalType::Binary);
                    let got = {
                        let mut tmp_sink = ColumnSink::new(&mut tmp, None);
                        decoder.copy_next_values(want, &mut tmp_sink)
                    };
                    for i in 0..got {
                        let cell = match tmp.get(i) {
                            Value::Binary(b) => b,
                            _ => unreachable!(),
                        };
                        if sel.is_selected(copied) && pred.evaluate_cell(&cell) {
                            dst.push(Value::Binary(cell));
                        } else {
                            sel.clear_bit(copied);
                            dst.push(Value::Binary(Bytes::new()));
                        }
                        copied += 1;
                    }
                }
            }
            let Some(cur) = self.cur.as_mut() else { break };
            let block_done = cur.decoder.remaining() == 0;
            if block_done && !self.advance_block()? {
                break;
            }
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bitvec::prelude::*;

    use super::super::writer::{CFileWriter, CFileWriterOptions};
    use super::*;
    use crate::types::DataType;

    fn write_cfile(
        opts: CFileWriterOptions,
        append: impl FnOnce(&mut CFileWriter<Cursor<Vec<u8>>>),
    ) -> Arc<CFileReader> {
        let mut writer = CFileWriter::new(Cursor::new(Vec::new()), opts).unwrap();
        append(&mut writer);
        let (cursor, _) = writer.finish().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        use std::io::Write;
        file.write_all(cursor.get_ref()).unwrap();
        CFileReader::open_file(file, None).unwrap()
    }

    fn read_all_i32(reader: &Arc<CFileReader>) -> Vec<i32> {
        let mut iter = reader.new_iterator();
        iter.seek_to_first().unwrap();
        let mut out = ColumnVec::new(PhysicalType::I32);
        let mut sink = ColumnSink::new(&mut out, None);
        iter.copy_next_values(usize::MAX, &mut sink).unwrap();
        match out {
            ColumnVec::I32(v) => v,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_write_read_roundtrip_preserves_order() {
        let values: Vec<i32> = (0..10_000).map(|i| i * 7 - 1000).collect();
        let mut opts = CFileWriterOptions::new(DataType::Int32);
        opts.block_size = 512;
        let reader = write_cfile(opts, |w| {
            w.append_entries(&ColumnVec::I32(values.clone())).unwrap();
        });
        assert_eq!(reader.num_values(), 10_000);
        assert_eq!(read_all_i32(&reader), values);
    }

    #[test]
    fn test_roundtrip_with_lz4_and_checksums() {
        let values: Vec<i32> = (0..5000).map(|i| i % 17).collect();
        let mut opts = CFileWriterOptions::new(DataType::Int32);
        opts.block_size = 256;
        opts.compression = crate::schema::CompressionType::Lz4;
        let reader = write_cfile(opts, |w| {
            w.append_entries(&ColumnVec::I32(values.clone())).unwrap();
        });
        assert_eq!(read_all_i32(&reader), values);
    }

    #[test]
    fn test_seek_to_ordinal_across_blocks() {
        let values: Vec<i32> = (0..3000).collect();
        let mut opts = CFileWriterOptions::new(DataType::Int32);
        opts.block_size = 128;
        let reader = write_cfile(opts, |w| {
            w.append_entries(&ColumnVec::I32(values.clone())).unwrap();
        });
        let mut iter = reader.new_iterator();
        for &ord in &[0u64, 1, 999, 2500, 2999] {
            iter.seek_to_ordinal(ord).unwrap();
            let mut out = ColumnVec::new(PhysicalType::I32);
            let mut sink = ColumnSink::new(&mut out, None);
            iter.copy_next_values(1, &mut sink).unwrap();
            assert_eq!(out.get(0), Value::I32(ord as i32));
        }
    }

    #[test]
    fn test_value_seek_on_key_column() {
        let values: Vec<i32> = (0..1000).map(|i| i * 2).collect();
        let mut opts = CFileWriterOptions::new(DataType::Int32);
        opts.block_size = 128;
        opts.write_validx = true;
        let reader = write_cfile(opts, |w| {
            w.append_entries(&ColumnVec::I32(values.clone())).unwrap();
        });
        let mut iter = reader.new_iterator();
        let mut key = vec![];
        crate::types::encode_key_part(&Value::I32(500), true, &mut key);
        let mut exact = false;
        iter.seek_at_or_after(&key, &mut exact).unwrap();
        assert!(exact);
        assert_eq!(iter.ordinal(), 250);

        // An odd value falls between cells.
        let mut key = vec![];
        crate::types::encode_key_part(&Value::I32(501), true, &mut key);
        iter.seek_at_or_after(&key, &mut exact).unwrap();
        assert!(!exact);
        assert_eq!(iter.ordinal(), 251);

        // Beyond the last value.
        let mut key = vec![];
        crate::types::encode_key_part(&Value::I32(99999), true, &mut key);
        let err = iter.seek_at_or_after(&key, &mut exact).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_nullable_roundtrip() {
        let values = ColumnVec::I64(vec![1, 0, 3, 0, 5]);
        let bitmap: BitVec<u8, Lsb0> =
            [true, false, true, false, true].into_iter().collect();
        let mut opts = CFileWriterOptions::new(DataType::Int64);
        opts.nullable = true;
        let reader = write_cfile(opts, |w| {
            w.append_nullable_entries(&bitmap, &values).unwrap();
        });
        let mut iter = reader.new_iterator();
        iter.seek_to_first().unwrap();
        let mut out = ColumnVec::new(PhysicalType::I64);
        let mut out_bitmap = BitVec::new();
        let mut sink = ColumnSink::new(&mut out, Some(&mut out_bitmap));
        assert_eq!(iter.copy_next_values(5, &mut sink).unwrap(), 5);
        assert_eq!(out_bitmap, bitmap);
        assert_eq!(out.get(2), Value::I64(3));
    }

    #[test]
    fn test_dict_predicate_pushdown() {
        // Dictionary ["x", "y", "z"], data block codewords
        // [0, 1, 2, 1, 0]; predicate == "y" selects rows 1 and 3.
        let cells = ["x", "y", "z", "y", "x"];
        let values = ColumnVec::Binary(
            cells.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect(),
        );
        let mut opts = CFileWriterOptions::new(DataType::String);
        opts.encoding = crate::schema::EncodingType::Dictionary;
        let reader = write_cfile(opts, |w| {
            w.append_entries(&values).unwrap();
        });
        let mut iter = reader.new_iterator();
        iter.seek_to_first().unwrap();
        let mut out = ColumnVec::new(PhysicalType::Binary);
        let mut sel = SelectionVector::new_all_selected(5);
        let pred = ColumnPredicate::equality("y");
        let copied = {
            let mut sink = ColumnSink::new(&mut out, None);
            iter.copy_next_and_eval(5, &pred, &mut sel, &mut sink).unwrap()
        };
        assert_eq!(copied, 5);
        assert_eq!(sel.as_bools(), vec![false, true, false, true, false]);
        assert_eq!(out.get(1), Value::from_str_slice("y"));
        assert_eq!(out.get(3), Value::from_str_slice("y"));
    }

    #[test]
    fn test_dict_predicate_no_matching_codeword_skips_decoding() {
        let values = ColumnVec::Binary(
            ["a", "b", "a", "b"]
                .iter()
                .map(|s| Bytes::copy_from_slice(s.as_bytes()))
                .collect(),
        );
        let mut opts = CFileWriterOptions::new(DataType::String);
        opts.encoding = crate::schema::EncodingType::Dictionary;
        let reader = write_cfile(opts, |w| {
            w.append_entries(&values).unwrap();
        });
        let mut iter = reader.new_iterator();
        iter.seek_to_first().unwrap();
        let mut out = ColumnVec::new(PhysicalType::Binary);
        let mut sel = SelectionVector::new_all_selected(4);
        let pred = ColumnPredicate::equality("zzz");
        let copied = {
            let mut sink = ColumnSink::new(&mut out, None);
            iter.copy_next_and_eval(4, &pred, &mut sel, &mut sink).unwrap()
        };
        assert_eq!(copied, 4);
        assert!(!sel.any_selected());
        assert_eq!(iter.ordinal(), 4);
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let mut file = tempfile::tempfile().unwrap();
        use std::io::Write;
        file.write_all(b"definitely not a cfile, but long enough to parse")
            .unwrap();
        let err = CFileReader::open_file(file, None).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_corrupt_block_checksum_detected() {
        let values: Vec<i32> = (0..100).collect();
        let opts = CFileWriterOptions::new(DataType::Int32);
        let mut writer = CFileWriter::new(Cursor::new(Vec::new()), opts).unwrap();
        writer.append_entries(&ColumnVec::I32(values)).unwrap();
        let (cursor, _) = writer.finish().unwrap();
        let mut bytes = cursor.into_inner();
        // Flip a bit inside the first data block.
        bytes[CFILE_MAGIC_LEN + 3] ^= 0x40;
        let mut file = tempfile::tempfile().unwrap();
        use std::io::Write;
        file.write_all(&bytes).unwrap();
        let reader = CFileReader::open_file(file, None).unwrap();
        let mut iter = reader.new_iterator();
        let err = iter.seek_to_first().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_empty_file_roundtrip() {
        let opts = CFileWriterOptions::new(DataType::Int32);
        let reader = write_cfile(opts, |_w| {});
        assert_eq!(reader.num_values(), 0);
        let mut iter = reader.new_iterator();
        iter.seek_to_first().unwrap();
        let mut out = ColumnVec::new(PhysicalType::I32);
        let mut sink = ColumnSink::new(&mut out, None);
        assert_eq!(iter.copy_next_values(10, &mut sink).unwrap(), 0);
    }
}
