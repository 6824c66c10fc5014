// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Plain encodings: fixed-width cells back to back, and binary cells
//! behind an offset table.
//!
//! Plain binary layout:
//!
//! ```plain
//! | count (u32 LE) | offsets (u32 LE × count+1) | cell bytes |
//! ```
//!
//! Offsets are relative to the start of the cell byte region; entry
//! `count` closes the last cell.

use bytes::{Buf, BufMut, Bytes};

use super::block::{BlockBuilder, BlockDecoder, ColumnSink};
use crate::error::{Error, Result};
use crate::types::{encode_key_part, ColumnVec, PhysicalType, Value};

pub struct PlainFixedBlockBuilder {
    physical: PhysicalType,
    raw: Vec<u8>,
    count: usize,
    block_size: usize,
    first: Option<Value>,
    last: Option<Value>,
}

impl PlainFixedBlockBuilder {
    pub fn new(physical: PhysicalType, block_size: usize) -> PlainFixedBlockBuilder {
        assert!(physical.width().is_some());
        PlainFixedBlockBuilder {
            physical,
            raw: Vec::new(),
            count: 0,
            block_size,
            first: None,
            last: None,
        }
    }
}

impl BlockBuilder for PlainFixedBlockBuilder {
    fn add(&mut self, values: &ColumnVec, from: usize, count: usize) -> usize {
        let mut added = 0;
        for i in from..from + count {
            if self.is_block_full() && self.count > 0 {
                break;
            }
            let v = values.get(i);
            if self.first.is_none() {
                self.first = Some(v.clone());
            }
            self.last = Some(v.clone());
            v.put_le(&mut self.raw);
            self.count += 1;
            added += 1;
        }
        added
    }

    fn count(&self) -> usize {
        self.count
    }

    fn is_block_full(&self) -> bool {
        self.raw.len() >= self.block_size
    }

    fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.raw.len());
        out.put_u32_le(self.count as u32);
        out.append(&mut self.raw);
        self.count = 0;
        self.first = None;
        self.last = None;
        out
    }

    fn first_key(&self) -> Option<Vec<u8>> {
        self.first.as_ref().map(|v| {
            let mut buf = vec![];
            encode_key_part(v, true, &mut buf);
            buf
        })
    }

    fn last_key(&self) -> Option<Vec<u8>> {
        self.last.as_ref().map(|v| {
            let mut buf = vec![];
            encode_key_part(v, true, &mut buf);
            buf
        })
    }
}

#[derive(Debug)]
pub struct PlainFixedBlockDecoder {
    physical: PhysicalType,
    width: usize,
    data: Bytes,
    count: usize,
    pos: usize,
}

impl PlainFixedBlockDecoder {
    pub fn parse(physical: PhysicalType, data: Bytes) -> Result<PlainFixedBlockDecoder> {
        let width = physical
            .width()
            .ok_or_else(|| Error::corruption("plain-fixed block for a variable-width type"))?;
        let mut buf = &data[..];
        if buf.remaining() < 4 {
            return Err(Error::corruption("plain-fixed block shorter than header"));
        }
        let count = buf.get_u32_le() as usize;
        if buf.remaining() < count * width {
            return Err(Error::corruption("plain-fixed block truncated"));
        }
        Ok(PlainFixedBlockDecoder {
            physical,
            width,
            data: data.slice(4..),
            count,
            pos: 0,
        })
    }

    fn value_at(&self, idx: usize) -> Value {
        let mut slice = &self.data[idx * self.width..(idx + 1) * self.width];
        Value::get_le(self.physical, &mut slice)
    }
}

impl BlockDecoder for PlainFixedBlockDecoder {
    fn count(&self) -> usize {
        self.count
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek_to_position_in_block(&mut self, pos: usize) {
        self.pos = pos.min(self.count);
    }

    fn seek_at_or_after_value(&mut self, value: &[u8]) -> Result<bool> {
        let mut lo = 0;
        let mut hi = self.count;
        let mut key_buf = vec![];
        while lo < hi {
            let mid = (lo + hi) / 2;
            key_buf.clear();
            encode_key_part(&self.value_at(mid), true, &mut key_buf);
            if key_buf.as_slice() < value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.pos = lo;
        if lo == self.count {
            return Err(Error::not_found("value is past the end of the block"));
        }
        key_buf.clear();
        encode_key_part(&self.value_at(lo), true, &mut key_buf);
        Ok(key_buf.as_slice() == value)
    }

    fn copy_next_values(&mut self, n: usize, dst: &mut ColumnSink<'_>) -> usize {
        let n = n.min(self.remaining());
        for _ in 0..n {
            dst.push(self.value_at(self.pos));
            self.pos += 1;
        }
        n
    }
}

pub struct PlainBinaryBlockBuilder {
    offsets: Vec<u32>,
    cells: Vec<u8>,
    block_size: usize,
    first: Option<Bytes>,
    last: Option<Bytes>,
}

impl PlainBinaryBlockBuilder {
    pub fn new(block_size: usize) -> PlainBinaryBlockBuilder {
        PlainBinaryBlockBuilder {
            offsets: vec![0],
            cells: Vec::new(),
            block_size,
            first: None,
            last: None,
        }
    }

    pub fn add_bytes(&mut self, value: &Bytes) -> bool {
        if self.is_block_full() && self.count() > 0 {
            return false;
        }
        if self.first.is_none() {
            self.first = Some(value.clone());
        }
        self.last = Some(value.clone());
        self.cells.extend_from_slice(value);
        self.offsets.push(self.cells.len() as u32);
        true
    }

    pub fn estimated_size(&self) -> usize {
        4 + self.offsets.len() * 4 + self.cells.len()
    }
}

impl BlockBuilder for PlainBinaryBlockBuilder {
    fn add(&mut self, values: &ColumnVec, from: usize, count: usize) -> usize {
        let ColumnVec::Binary(cells) = values else {
            panic!("plain-binary blocks hold binary cells");
        };
        let mut added = 0;
        for cell in &cells[from..from + count] {
            if !self.add_bytes(cell) {
                break;
            }
            added += 1;
        }
        added
    }

    fn count(&self) -> usize {
        self.offsets.len() - 1
    }

    fn is_block_full(&self) -> bool {
        self.estimated_size() >= self.block_size
    }

    fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.estimated_size());
        out.put_u32_le(self.count() as u32);
        for off in &self.offsets {
            out.put_u32_le(*off);
        }
        out.append(&mut self.cells);
        self.offsets.clear();
        self.offsets.push(0);
        self.first = None;
        self.last = None;
        out
    }

    fn first_key(&self) -> Option<Vec<u8>> {
        self.first.as_ref().map(|b| b.to_vec())
    }

    fn last_key(&self) -> Option<Vec<u8>> {
        self.last.as_ref().map(|b| b.to_vec())
    }
}

#[derive(Debug)]
pub struct PlainBinaryBlockDecoder {
    /// Offset table region.
    offsets: Bytes,
    /// Cell byte region. Decoded cells are zero-copy slices of this,
    /// so they retain the underlying block allocation.
    cells: Bytes,
    count: usize,
    pos: usize,
}

impl PlainBinaryBlockDecoder {
    pub fn parse(data: Bytes) -> Result<PlainBinaryBlockDecoder> {
        let mut buf = &data[..];
        if buf.remaining() < 4 {
            return Err(Error::corruption("plain-binary block shorter than header"));
        }
        let count = buf.get_u32_le() as usize;
        let table_len = (count + 1) * 4;
        if buf.remaining() < table_len {
            return Err(Error::corruption("plain-binary offset table truncated"));
        }
        let offsets = data.slice(4..4 + table_len);
        let cells = data.slice(4 + table_len..);
        let last_off = (&offsets[count * 4..]).get_u32_le() as usize;
        if last_off > cells.len() {
            return Err(Error::corruption("plain-binary cell region truncated"));
        }
        Ok(PlainBinaryBlockDecoder {
            offsets,
            cells,
            count,
            pos: 0,
        })
    }

    fn offset(&self, idx: usize) -> usize {
        (&self.offsets[idx * 4..]).get_u32_le() as usize
    }

    pub fn cell_at(&self, idx: usize) -> Bytes {
        self.cells.slice(self.offset(idx)..self.offset(idx + 1))
    }
}

impl BlockDecoder for PlainBinaryBlockDecoder {
    fn count(&self) -> usize {
        self.count
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek_to_position_in_block(&mut self, pos: usize) {
        self.pos = pos.min(self.count);
    }

    fn seek_at_or_after_value(&mut self, value: &[u8]) -> Result<bool> {
        let mut lo = 0;
        let mut hi = self.count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if &self.cell_at(mid)[..] < value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.pos = lo;
        if lo == self.count {
            return Err(Error::not_found("value is past the end of the block"));
        }
        Ok(&self.cell_at(lo)[..] == value)
    }

    fn copy_next_values(&mut self, n: usize, dst: &mut ColumnSink<'_>) -> usize {
        let n = n.min(self.remaining());
        for _ in 0..n {
            dst.push(Value::Binary(self.cell_at(self.pos)));
            self.pos += 1;
        }
        n
    }
}
