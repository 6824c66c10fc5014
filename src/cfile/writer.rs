// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! CFile writer: fills data blocks, maintains both index trees, and
//! closes with the footer.

use std::io::Write;

use bitvec::prelude::*;
use bytes::BufMut;
use prost::Message;

use super::block::{BlockBuilder, BlockBuilderImpl, NullableBlockBuilder};
use super::bshuf::BShufBlockBuilder;
use super::dict::BinaryDictBlockBuilder;
use super::index::IndexTreeBuilder;
use super::plain::{PlainBinaryBlockBuilder, PlainFixedBlockBuilder};
use super::{BlockPointer, CFILE_MAGIC};
use crate::error::{Error, Result};
use crate::proto::{CFileFooterPb, FileMetadataPairPb};
use crate::schema::{CompressionType, EncodingType};
use crate::types::{ColumnVec, DataType, PhysicalType};

pub(crate) fn physical_type_to_pb(p: PhysicalType) -> i32 {
    match p {
        PhysicalType::I8 => 0,
        PhysicalType::I16 => 1,
        PhysicalType::I32 => 2,
        PhysicalType::I64 => 3,
        PhysicalType::I128 => 4,
        PhysicalType::F32 => 5,
        PhysicalType::F64 => 6,
        PhysicalType::Bool => 7,
        PhysicalType::Binary => 8,
    }
}

pub(crate) fn physical_type_from_pb(v: i32) -> Result<PhysicalType> {
    Ok(match v {
        0 => PhysicalType::I8,
        1 => PhysicalType::I16,
        2 => PhysicalType::I32,
        3 => PhysicalType::I64,
        4 => PhysicalType::I128,
        5 => PhysicalType::F32,
        6 => PhysicalType::F64,
        7 => PhysicalType::Bool,
        8 => PhysicalType::Binary,
        other => return Err(Error::corruption(format!("unknown physical type {other}"))),
    })
}

pub(crate) fn encoding_to_pb(e: EncodingType) -> i32 {
    match e {
        EncodingType::Plain => 0,
        EncodingType::BitShuffle => 1,
        EncodingType::Dictionary => 2,
        EncodingType::Auto => unreachable!("encoding resolved before writing"),
    }
}

pub(crate) fn encoding_from_pb(v: i32) -> Result<EncodingType> {
    Ok(match v {
        0 => EncodingType::Plain,
        1 => EncodingType::BitShuffle,
        2 => EncodingType::Dictionary,
        other => return Err(Error::corruption(format!("unknown encoding {other}"))),
    })
}

pub(crate) fn compression_to_pb(c: CompressionType) -> i32 {
    match c {
        CompressionType::None => 0,
        CompressionType::Lz4 => 1,
    }
}

pub(crate) fn compression_from_pb(v: i32) -> Result<CompressionType> {
    Ok(match v {
        0 => CompressionType::None,
        1 => CompressionType::Lz4,
        other => return Err(Error::corruption(format!("unknown compression {other}"))),
    })
}

/// Resolves `Auto` to the default encoding of the physical type.
pub fn resolve_encoding(encoding: EncodingType, physical: PhysicalType) -> EncodingType {
    match encoding {
        EncodingType::Auto => match physical {
            PhysicalType::Binary => EncodingType::Plain,
            _ => EncodingType::BitShuffle,
        },
        e => e,
    }
}

#[derive(Clone)]
pub struct CFileWriterOptions {
    pub data_type: DataType,
    pub nullable: bool,
    pub encoding: EncodingType,
    pub compression: CompressionType,
    /// Target encoded size of each data block.
    pub block_size: usize,
    /// Build a value index over the first key of every block.
    pub write_validx: bool,
    pub checksummed: bool,
    pub index_block_entries: usize,
}

impl CFileWriterOptions {
    pub fn new(data_type: DataType) -> CFileWriterOptions {
        CFileWriterOptions {
            data_type,
            nullable: false,
            encoding: EncodingType::Auto,
            compression: CompressionType::None,
            block_size: 32 * 1024,
            write_validx: false,
            checksummed: true,
            index_block_entries: 128,
        }
    }
}

/// Writes one CFile to `sink`. Values are appended in order; closing
/// emits the dictionary block (if any), the index trees, and the
/// footer.
pub struct CFileWriter<W: Write> {
    sink: W,
    off: u64,
    opts: CFileWriterOptions,
    encoding: EncodingType,
    builder: BlockBuilderImpl,
    posidx: IndexTreeBuilder,
    validx: Option<IndexTreeBuilder>,
    metadata: Vec<FileMetadataPairPb>,
    value_count: u64,
    cur_block_first_ordinal: u64,
    finished: bool,
}

impl<W: Write> CFileWriter<W> {
    pub fn new(mut sink: W, opts: CFileWriterOptions) -> Result<CFileWriter<W>> {
        let physical = opts.data_type.physical_type();
        let encoding = resolve_encoding(opts.encoding, physical);
        let inner = match encoding {
            EncodingType::BitShuffle => {
                BlockBuilderImpl::BShuf(BShufBlockBuilder::new(physical, opts.block_size))
            }
            EncodingType::Plain => match physical {
                PhysicalType::Binary => {
                    BlockBuilderImpl::PlainBinary(PlainBinaryBlockBuilder::new(opts.block_size))
                }
                _ => BlockBuilderImpl::PlainFixed(PlainFixedBlockBuilder::new(
                    physical,
                    opts.block_size,
                )),
            },
            EncodingType::Dictionary => {
                if physical != PhysicalType::Binary {
                    return Err(Error::invalid_argument(
                        "dictionary encoding requires a binary column",
                    ));
                }
                BlockBuilderImpl::Dict(BinaryDictBlockBuilder::new(
                    opts.block_size,
                    opts.block_size,
                ))
            }
            EncodingType::Auto => unreachable!(),
        };
        let builder = if opts.nullable {
            BlockBuilderImpl::Nullable(NullableBlockBuilder::new(inner))
        } else {
            inner
        };
        sink.write_all(CFILE_MAGIC)?;
        Ok(CFileWriter {
            sink,
            off: CFILE_MAGIC.len() as u64,
            encoding,
            posidx: IndexTreeBuilder::new(opts.index_block_entries),
            validx: opts
                .write_validx
                .then(|| IndexTreeBuilder::new(opts.index_block_entries)),
            metadata: vec![],
            value_count: 0,
            cur_block_first_ordinal: 0,
            finished: false,
            builder,
            opts,
        })
    }

    /// Adds a key/value metadata pair carried in the footer.
    pub fn add_metadata_pair(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.metadata.push(FileMetadataPairPb {
            key: key.into(),
            value,
        });
    }

    pub fn written_value_count(&self) -> u64 {
        self.value_count + self.builder.count() as u64
    }

    /// Approximate bytes written so far; more follow at `finish()`.
    pub fn written_size(&self) -> u64 {
        self.off
    }

    pub fn append_entries(&mut self, values: &ColumnVec) -> Result<()> {
        let mut from = 0;
        let n = values.len();
        while from < n {
            let added = self.builder.add(values, from, n - from);
            from += added;
            if self.builder.is_block_full() || added == 0 {
                self.finish_cur_data_block()?;
            }
        }
        Ok(())
    }

    /// Appends `values.len()` cells under a validity bitmap; cells at
    /// cleared positions are stored as nulls.
    pub fn append_nullable_entries(
        &mut self,
        bitmap: &BitVec<u8, Lsb0>,
        values: &ColumnVec,
    ) -> Result<()> {
        if !matches!(self.builder, BlockBuilderImpl::Nullable(_)) {
            return Err(Error::illegal_state(
                "append_nullable_entries on a non-nullable writer",
            ));
        }
        let mut from = 0;
        let n = values.len();
        while from < n {
            let added = match &mut self.builder {
                BlockBuilderImpl::Nullable(b) => b.add_nullable(bitmap, values, from, n - from),
                _ => unreachable!(),
            };
            from += added;
            if self.builder.is_block_full() || added == 0 {
                self.finish_cur_data_block()?;
            }
        }
        Ok(())
    }

    fn finish_cur_data_block(&mut self) -> Result<()> {
        let count = self.builder.count();
        if count == 0 {
            // A full-but-empty block means a single cell exceeds the
            // block size; the builders accept oversized singletons, so
            // this is a fall-over artifact (e.g. the dictionary filled)
            // and the next add makes progress.
            return Ok(());
        }
        let first_key = self.builder.first_key();
        let payload = self.builder.finish();
        let ptr = self.write_block(&payload)?;
        self.posidx
            .add_entry(self.cur_block_first_ordinal.to_be_bytes().to_vec(), ptr);
        if let Some(validx) = &mut self.validx {
            let key = first_key.ok_or_else(|| {
                Error::illegal_state("value-indexed writer produced a block with no first key")
            })?;
            validx.add_entry(key, ptr);
        }
        self.value_count += count as u64;
        self.cur_block_first_ordinal = self.value_count;
        Ok(())
    }

    fn write_block(&mut self, payload: &[u8]) -> Result<BlockPointer> {
        let compressed;
        let payload = match self.opts.compression {
            CompressionType::None => payload,
            CompressionType::Lz4 => {
                compressed = lz4_flex::compress_prepend_size(payload);
                &compressed
            }
        };
        let offset = self.off;
        self.sink.write_all(payload)?;
        let mut size = payload.len();
        if self.opts.checksummed {
            let crc = crc32fast::hash(payload);
            self.sink.write_all(&crc.to_le_bytes())?;
            size += 4;
        }
        self.off += size as u64;
        Ok(BlockPointer {
            offset,
            size: size as u32,
        })
    }

    /// Writes the dictionary block, both index trees, and the footer;
    /// returns the sink and the total file size.
    pub fn finish(mut self) -> Result<(W, u64)> {
        assert!(!self.finished);
        self.finish_cur_data_block()?;

        let mut dict_block_ptr = None;
        let dict_payload = self
            .builder
            .dict_builder_mut()
            .map(|b| b.finish_dictionary());
        if let Some(payload) = dict_payload {
            dict_block_ptr = Some(self.write_block(&payload)?);
        }

        let mut posidx = std::mem::replace(&mut self.posidx, IndexTreeBuilder::new(2));
        let posidx_root = posidx.finish(|data| self.write_block(data))?;
        let mut validx_root = None;
        if let Some(mut validx) = self.validx.take() {
            validx_root = validx.finish(|data| self.write_block(data))?;
        }

        let footer = CFileFooterPb {
            data_type: physical_type_to_pb(self.opts.data_type.physical_type()),
            encoding: encoding_to_pb(self.encoding),
            compression: compression_to_pb(self.opts.compression),
            num_values: self.value_count,
            is_nullable: self.opts.nullable,
            checksummed: self.opts.checksummed,
            posidx_root: posidx_root.map(BlockPointer::to_pb),
            validx_root: validx_root.map(BlockPointer::to_pb),
            dict_block_ptr: dict_block_ptr.map(BlockPointer::to_pb),
            metadata: std::mem::take(&mut self.metadata),
        };
        let mut tail = footer.encode_to_vec();
        let footer_len = tail.len() as u32;
        tail.put_u32_le(footer_len);
        tail.extend_from_slice(CFILE_MAGIC);
        self.sink.write_all(&tail)?;
        self.off += tail.len() as u64;
        self.sink.flush()?;
        self.finished = true;
        Ok((self.sink, self.off))
    }
}
