// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Block builder/decoder capability traits and their dispatch enums.

use bitvec::prelude::*;
use bytes::Bytes;

use super::bshuf::{BShufBlockBuilder, BShufBlockDecoder};
use super::dict::{BinaryDictBlockBuilder, BinaryDictBlockDecoder};
use super::plain::{
    PlainBinaryBlockBuilder, PlainBinaryBlockDecoder, PlainFixedBlockBuilder,
    PlainFixedBlockDecoder,
};
use crate::error::Result;
use crate::types::{ColumnVec, Value};

/// Builds one data block at a time; `finish()` emits the encoded block
/// and resets the builder for the next one.
pub trait BlockBuilder {
    /// Appends up to `count` cells starting at `values[from]`, stopping
    /// early if the block fills. Returns the number appended. An empty
    /// builder always accepts at least one cell.
    fn add(&mut self, values: &ColumnVec, from: usize, count: usize) -> usize;

    /// Cells in the current block.
    fn count(&self) -> usize;

    fn is_block_full(&self) -> bool;

    /// Encodes the current block and resets for the next.
    fn finish(&mut self) -> Vec<u8>;

    /// Memcomparable key of the block's first cell, for the value
    /// index.
    fn first_key(&self) -> Option<Vec<u8>>;

    fn last_key(&self) -> Option<Vec<u8>>;
}

/// Decodes one block, preloaded in memory.
pub trait BlockDecoder {
    fn count(&self) -> usize;

    fn pos(&self) -> usize;

    fn remaining(&self) -> usize {
        self.count() - self.pos()
    }

    fn seek_to_position_in_block(&mut self, pos: usize);

    /// Positions at the first cell `>= value`. Returns whether the
    /// match was exact; `NotFound` when every cell sorts before
    /// `value`, leaving the position one past the end.
    fn seek_at_or_after_value(&mut self, value: &[u8]) -> Result<bool>;

    /// Decodes up to `n` cells into `dst`, advancing the position.
    /// Returns the number decoded.
    fn copy_next_values(&mut self, n: usize, dst: &mut ColumnSink<'_>) -> usize;
}

/// Destination of decoded cells: the cell array plus the null bitmap
/// when the column is nullable.
pub struct ColumnSink<'a> {
    pub data: &'a mut ColumnVec,
    pub non_null: Option<&'a mut BitVec<u8, Lsb0>>,
}

impl<'a> ColumnSink<'a> {
    pub fn new(data: &'a mut ColumnVec, non_null: Option<&'a mut BitVec<u8, Lsb0>>) -> Self {
        ColumnSink { data, non_null }
    }

    pub fn push(&mut self, value: Value) {
        self.data.push(value);
        if let Some(bitmap) = self.non_null.as_mut() {
            bitmap.push(true);
        }
    }

    pub fn push_null(&mut self) {
        let zero = match self.data.physical_type() {
            crate::types::PhysicalType::I8 => Value::I8(0),
            crate::types::PhysicalType::I16 => Value::I16(0),
            crate::types::PhysicalType::I32 => Value::I32(0),
            crate::types::PhysicalType::I64 => Value::I64(0),
            crate::types::PhysicalType::I128 => Value::I128(0),
            crate::types::PhysicalType::F32 => Value::F32(0.0),
            crate::types::PhysicalType::F64 => Value::F64(0.0),
            crate::types::PhysicalType::Bool => Value::Bool(false),
            crate::types::PhysicalType::Binary => Value::Binary(Bytes::new()),
        };
        self.data.push(zero);
        let bitmap = self
            .non_null
            .as_mut()
            .expect("null cell decoded into a non-nullable sink");
        bitmap.push(false);
    }
}

pub enum BlockBuilderImpl {
    BShuf(BShufBlockBuilder),
    PlainFixed(PlainFixedBlockBuilder),
    PlainBinary(PlainBinaryBlockBuilder),
    Dict(BinaryDictBlockBuilder),
    Nullable(NullableBlockBuilder),
}

impl BlockBuilderImpl {
    /// The dictionary builder, reaching through a nullable wrapper.
    pub fn dict_builder_mut(&mut self) -> Option<&mut BinaryDictBlockBuilder> {
        match self {
            BlockBuilderImpl::Dict(b) => Some(b),
            BlockBuilderImpl::Nullable(n) => n.inner.dict_builder_mut(),
            _ => None,
        }
    }
}

impl BlockBuilder for BlockBuilderImpl {
    fn add(&mut self, values: &ColumnVec, from: usize, count: usize) -> usize {
        match self {
            BlockBuilderImpl::BShuf(b) => b.add(values, from, count),
            BlockBuilderImpl::PlainFixed(b) => b.add(values, from, count),
            BlockBuilderImpl::PlainBinary(b) => b.add(values, from, count),
            BlockBuilderImpl::Dict(b) => b.add(values, from, count),
            BlockBuilderImpl::Nullable(b) => b.add(values, from, count),
        }
    }

    fn count(&self) -> usize {
        match self {
            BlockBuilderImpl::BShuf(b) => b.count(),
            BlockBuilderImpl::PlainFixed(b) => b.count(),
            BlockBuilderImpl::PlainBinary(b) => b.count(),
            BlockBuilderImpl::Dict(b) => b.count(),
            BlockBuilderImpl::Nullable(b) => b.count(),
        }
    }

    fn is_block_full(&self) -> bool {
        match self {
            BlockBuilderImpl::BShuf(b) => b.is_block_full(),
            BlockBuilderImpl::PlainFixed(b) => b.is_block_full(),
            BlockBuilderImpl::PlainBinary(b) => b.is_block_full(),
            BlockBuilderImpl::Dict(b) => b.is_block_full(),
            BlockBuilderImpl::Nullable(b) => b.is_block_full(),
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        match self {
            BlockBuilderImpl::BShuf(b) => b.finish(),
            BlockBuilderImpl::PlainFixed(b) => b.finish(),
            BlockBuilderImpl::PlainBinary(b) => b.finish(),
            BlockBuilderImpl::Dict(b) => b.finish(),
            BlockBuilderImpl::Nullable(b) => b.finish(),
        }
    }

    fn first_key(&self) -> Option<Vec<u8>> {
        match self {
            BlockBuilderImpl::BShuf(b) => b.first_key(),
            BlockBuilderImpl::PlainFixed(b) => b.first_key(),
            BlockBuilderImpl::PlainBinary(b) => b.first_key(),
            BlockBuilderImpl::Dict(b) => b.first_key(),
            BlockBuilderImpl::Nullable(b) => b.first_key(),
        }
    }

    fn last_key(&self) -> Option<Vec<u8>> {
        match self {
            BlockBuilderImpl::BShuf(b) => b.last_key(),
            BlockBuilderImpl::PlainFixed(b) => b.last_key(),
            BlockBuilderImpl::PlainBinary(b) => b.last_key(),
            BlockBuilderImpl::Dict(b) => b.last_key(),
            BlockBuilderImpl::Nullable(b) => b.last_key(),
        }
    }
}

#[derive(Debug)]
pub enum BlockDecoderImpl {
    BShuf(BShufBlockDecoder),
    PlainFixed(PlainFixedBlockDecoder),
    PlainBinary(PlainBinaryBlockDecoder),
    Dict(BinaryDictBlockDecoder),
    Nullable(NullableBlockDecoder),
}

impl BlockDecoder for BlockDecoderImpl {
    fn count(&self) -> usize {
        match self {
            BlockDecoderImpl::BShuf(d) => d.count(),
            BlockDecoderImpl::PlainFixed(d) => d.count(),
            BlockDecoderImpl::PlainBinary(d) => d.count(),
            BlockDecoderImpl::Dict(d) => d.count(),
            BlockDecoderImpl::Nullable(d) => d.count(),
        }
    }

    fn pos(&self) -> usize {
        match self {
            BlockDecoderImpl::BShuf(d) => d.pos(),
            BlockDecoderImpl::PlainFixed(d) => d.pos(),
            BlockDecoderImpl::PlainBinary(d) => d.pos(),
            BlockDecoderImpl::Dict(d) => d.pos(),
            BlockDecoderImpl::Nullable(d) => d.pos(),
        }
    }

    fn seek_to_position_in_block(&mut self, pos: usize) {
        match self {
            BlockDecoderImpl::BShuf(d) => d.seek_to_position_in_block(pos),
            BlockDecoderImpl::PlainFixed(d) => d.seek_to_position_in_block(pos),
            BlockDecoderImpl::PlainBinary(d) => d.seek_to_position_in_block(pos),
            BlockDecoderImpl::Dict(d) => d.seek_to_position_in_block(pos),
            BlockDecoderImpl::Nullable(d) => d.seek_to_position_in_block(pos),
        }
    }

    fn seek_at_or_after_value(&mut self, value: &[u8]) -> Result<bool> {
        match self {
            BlockDecoderImpl::BShuf(d) => d.seek_at_or_after_value(value),
            BlockDecoderImpl::PlainFixed(d) => d.seek_at_or_after_value(value),
            BlockDecoderImpl::PlainBinary(d) => d.seek_at_or_after_value(value),
            BlockDecoderImpl::Dict(d) => d.seek_at_or_after_value(value),
            BlockDecoderImpl::Nullable(d) => d.seek_at_or_after_value(value),
        }
    }

    fn copy_next_values(&mut self, n: usize, dst: &mut ColumnSink<'_>) -> usize {
        match self {
            BlockDecoderImpl::BShuf(d) => d.copy_next_values(n, dst),
            BlockDecoderImpl::PlainFixed(d) => d.copy_next_values(n, dst),
            BlockDecoderImpl::PlainBinary(d) => d.copy_next_values(n, dst),
            BlockDecoderImpl::Dict(d) => d.copy_next_values(n, dst),
            BlockDecoderImpl::Nullable(d) => d.copy_next_values(n, dst),
        }
    }
}

/// Wraps an inner builder for nullable columns. Layout:
///
/// ```plain
/// | n_total (u32 LE) | non-null bitmap (ceil(n/8)) | inner payload |
/// ```
pub struct NullableBlockBuilder {
    inner: Box<BlockBuilderImpl>,
    bitmap: BitVec<u8, Lsb0>,
}

impl NullableBlockBuilder {
    pub fn new(inner: BlockBuilderImpl) -> NullableBlockBuilder {
        NullableBlockBuilder {
            inner: Box::new(inner),
            bitmap: BitVec::new(),
        }
    }

    /// Appends cells under a validity bitmap: `values[from + i]` is
    /// consulted only where `bitmap[from + i]` is set; the cell arrays
    /// stay dense with placeholder cells at null positions.
    pub fn add_nullable(
        &mut self,
        bitmap: &BitVec<u8, Lsb0>,
        values: &ColumnVec,
        from: usize,
        count: usize,
    ) -> usize {
        let mut added = 0;
        for i in from..from + count {
            if self.is_block_full() && self.count() > 0 {
                break;
            }
            if bitmap[i] {
                if self.inner.add(values, i, 1) == 0 {
                    break;
                }
                self.bitmap.push(true);
            } else {
                self.bitmap.push(false);
            }
            added += 1;
        }
        added
    }
}

impl BlockBuilder for NullableBlockBuilder {
    fn add(&mut self, values: &ColumnVec, from: usize, count: usize) -> usize {
        // All-non-null fast path used when the caller has no bitmap.
        let mut added = 0;
        for i in from..from + count {
            if self.is_block_full() && self.count() > 0 {
                break;
            }
            if self.inner.add(values, i, 1) == 0 {
                break;
            }
            self.bitmap.push(true);
            added += 1;
        }
        added
    }

    fn count(&self) -> usize {
        self.bitmap.len()
    }

    fn is_block_full(&self) -> bool {
        self.inner.is_block_full()
    }

    fn finish(&mut self) -> Vec<u8> {
        use bytes::BufMut;
        let mut out = Vec::new();
        out.put_u32_le(self.bitmap.len() as u32);
        let mut bitmap_bytes = vec![0u8; self.bitmap.len().div_ceil(8)];
        for (i, bit) in self.bitmap.iter().by_vals().enumerate() {
            if bit {
                bitmap_bytes[i / 8] |= 1 << (i % 8);
            }
        }
        out.extend_from_slice(&bitmap_bytes);
        out.extend_from_slice(&self.inner.finish());
        self.bitmap.clear();
        out
    }

    fn first_key(&self) -> Option<Vec<u8>> {
        self.inner.first_key()
    }

    fn last_key(&self) -> Option<Vec<u8>> {
        self.inner.last_key()
    }
}

/// Decoder counterpart of [`NullableBlockBuilder`]. Positions are in
/// total-cell space, nulls included.
#[derive(Debug)]
pub struct NullableBlockDecoder {
    inner: Box<BlockDecoderImpl>,
    bitmap: BitVec<u8, Lsb0>,
    pos: usize,
}

impl NullableBlockDecoder {
    pub fn parse(data: Bytes, make_inner: impl FnOnce(Bytes) -> Result<BlockDecoderImpl>) -> Result<NullableBlockDecoder> {
        use bytes::Buf;
        let mut buf = data.clone();
        if buf.remaining() < 4 {
            return Err(crate::error::Error::corruption(
                "nullable block shorter than its header",
            ));
        }
        let n_total = buf.get_u32_le() as usize;
        let bitmap_len = n_total.div_ceil(8);
        if buf.remaining() < bitmap_len {
            return Err(crate::error::Error::corruption(
                "nullable block bitmap truncated",
            ));
        }
        let mut bitmap = BitVec::with_capacity(n_total);
        let bitmap_bytes = &data[4..4 + bitmap_len];
        for i in 0..n_total {
            bitmap.push(bitmap_bytes[i / 8] & (1 << (i % 8)) != 0);
        }
        let inner = make_inner(data.slice(4 + bitmap_len..))?;
        Ok(NullableBlockDecoder {
            inner: Box::new(inner),
            bitmap,
            pos: 0,
        })
    }

    fn non_nulls_before(&self, pos: usize) -> usize {
        self.bitmap[..pos].count_ones()
    }
}

impl BlockDecoder for NullableBlockDecoder {
    fn count(&self) -> usize {
        self.bitmap.len()
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek_to_position_in_block(&mut self, pos: usize) {
        self.pos = pos.min(self.bitmap.len());
        self.inner
            .seek_to_position_in_block(self.non_nulls_before(self.pos));
    }

    fn seek_at_or_after_value(&mut self, value: &[u8]) -> Result<bool> {
        // Value seeks are only used on key columns, which are
        // non-nullable; delegate on the dense positions.
        let exact = self.inner.seek_at_or_after_value(value)?;
        self.pos = self.inner.pos();
        Ok(exact)
    }

    fn copy_next_values(&mut self, n: usize, dst: &mut ColumnSink<'_>) -> usize {
        let n = n.min(self.count() - self.pos);
        for _ in 0..n {
            if self.bitmap[self.pos] {
                let copied = self.inner.copy_next_values(1, dst);
                debug_assert_eq!(copied, 1);
            } else {
                dst.push_null();
            }
            self.pos += 1;
        }
        n
    }
}
