// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Dictionary encoding for binary columns.
//!
//! The file accumulates one dictionary of distinct cells. While it has
//! room, data blocks store fixed-width codewords (bit-shuffled u32s);
//! once the dictionary fills, all later data blocks degrade to plain
//! binary, permanently for the file. Every data block leads with its
//! mode:
//!
//! ```plain
//! | mode (u32 LE: 0=codeword, 1=plain) | mode-specific payload |
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};

use super::block::{BlockBuilder, BlockDecoder, BlockDecoderImpl, ColumnSink};
use super::bshuf::{BShufBlockBuilder, BShufBlockDecoder};
use super::plain::{PlainBinaryBlockBuilder, PlainBinaryBlockDecoder};
use crate::error::{Error, Result};
use crate::types::{encode_key_part, ColumnVec, PhysicalType, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DictEncodingMode {
    CodeWord = 0,
    PlainBinary = 1,
}

pub struct BinaryDictBlockBuilder {
    mode: DictEncodingMode,
    dict_builder: PlainBinaryBlockBuilder,
    dictionary: HashMap<Bytes, u32>,
    codeword_builder: BShufBlockBuilder,
    plain_builder: PlainBinaryBlockBuilder,
    first: Option<Bytes>,
    last: Option<Bytes>,
}

impl BinaryDictBlockBuilder {
    /// `block_size` bounds each data block; `dict_size` bounds the
    /// file-level dictionary.
    pub fn new(block_size: usize, dict_size: usize) -> BinaryDictBlockBuilder {
        BinaryDictBlockBuilder {
            mode: DictEncodingMode::CodeWord,
            dict_builder: PlainBinaryBlockBuilder::new(dict_size),
            dictionary: HashMap::new(),
            codeword_builder: BShufBlockBuilder::new(PhysicalType::I32, block_size),
            plain_builder: PlainBinaryBlockBuilder::new(block_size),
            first: None,
            last: None,
        }
    }

    fn codeword_for(&mut self, cell: &Bytes) -> Option<u32> {
        if let Some(cw) = self.dictionary.get(cell) {
            return Some(*cw);
        }
        if !self.dict_builder.add_bytes(cell) {
            return None;
        }
        let cw = self.dictionary.len() as u32;
        self.dictionary.insert(cell.clone(), cw);
        Some(cw)
    }

    fn note_cell(&mut self, cell: &Bytes) {
        if self.first.is_none() {
            self.first = Some(cell.clone());
        }
        self.last = Some(cell.clone());
    }

    /// Encodes the accumulated dictionary; called once when the file
    /// closes.
    pub fn finish_dictionary(&mut self) -> Vec<u8> {
        self.dict_builder.finish()
    }

    pub fn dictionary_len(&self) -> usize {
        self.dictionary.len()
    }
}

impl BlockBuilder for BinaryDictBlockBuilder {
    fn add(&mut self, values: &ColumnVec, from: usize, count: usize) -> usize {
        let ColumnVec::Binary(cells) = values else {
            panic!("dictionary blocks hold binary cells");
        };
        // The fall-over happens between blocks: a block that begins
        // with the dictionary already full is a plain block, and every
        // block after it.
        if self.mode == DictEncodingMode::CodeWord
            && self.count() == 0
            && self.dict_builder.is_block_full()
        {
            self.mode = DictEncodingMode::PlainBinary;
        }
        let mut added = 0;
        for cell in &cells[from..from + count] {
            if self.is_block_full() && self.count() > 0 {
                break;
            }
            match self.mode {
                DictEncodingMode::CodeWord => {
                    let Some(cw) = self.codeword_for(cell) else {
                        break;
                    };
                    self.codeword_builder.add_u32(cw);
                }
                DictEncodingMode::PlainBinary => {
                    if !self.plain_builder.add_bytes(cell) {
                        break;
                    }
                }
            }
            self.note_cell(cell);
            added += 1;
        }
        added
    }

    fn count(&self) -> usize {
        match self.mode {
            DictEncodingMode::CodeWord => self.codeword_builder.count(),
            DictEncodingMode::PlainBinary => self.plain_builder.count(),
        }
    }

    fn is_block_full(&self) -> bool {
        match self.mode {
            DictEncodingMode::CodeWord => {
                self.codeword_builder.is_block_full() || self.dict_builder.is_block_full()
            }
            DictEncodingMode::PlainBinary => self.plain_builder.is_block_full(),
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32_le(self.mode as u32);
        match self.mode {
            DictEncodingMode::CodeWord => out.extend_from_slice(&self.codeword_builder.finish()),
            DictEncodingMode::PlainBinary => out.extend_from_slice(&self.plain_builder.finish()),
        }
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

/// Immutable view of the file-level dictionary, shared by every data
/// block decoder of the file. Decoded cells are [`Bytes`] slices of the
/// dictionary block, so they keep the block alive through the row block
/// that references them.
#[derive(Debug)]
pub struct DictDecoder {
    inner: PlainBinaryBlockDecoder,
}

impl DictDecoder {
    pub fn parse(dict_block: Bytes) -> Result<DictDecoder> {
        Ok(DictDecoder {
            inner: PlainBinaryBlockDecoder::parse(dict_block)?,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell_at(&self, codeword: u32) -> Bytes {
        self.inner.cell_at(codeword as usize)
    }

    /// Index of the first entry `>= value`, with exactness.
    /// `NotFound` when `value` sorts after every entry.
    pub fn lookup_at_or_after(&self, value: &[u8]) -> Result<(u32, bool)> {
        let count = self.inner.count();
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if &self.inner.cell_at(mid)[..] < value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == count {
            return Err(Error::not_found("value is past the largest dictionary key"));
        }
        Ok((lo as u32, &self.inner.cell_at(lo)[..] == value))
    }
}

#[derive(Debug)]
pub struct BinaryDictBlockDecoder {
    mode: DictEncodingMode,
    inner: Box<BlockDecoderImpl>,
    dict: Option<Arc<DictDecoder>>,
}

impl BinaryDictBlockDecoder {
    pub fn parse(data: Bytes, dict: Option<Arc<DictDecoder>>) -> Result<BinaryDictBlockDecoder> {
        let mut buf = &data[..];
        if buf.remaining() < 4 {
            return Err(Error::corruption("dictionary block shorter than its header"));
        }
        let mode = match buf.get_u32_le() {
            0 => DictEncodingMode::CodeWord,
            1 => DictEncodingMode::PlainBinary,
            other => {
                return Err(Error::corruption(format!(
                    "unrecognized dictionary block mode {other}"
                )))
            }
        };
        let body = data.slice(4..);
        let inner = match mode {
            DictEncodingMode::CodeWord => {
                if dict.is_none() {
                    return Err(Error::corruption(
                        "codeword block in a file without a dictionary",
                    ));
                }
                BlockDecoderImpl::BShuf(BShufBlockDecoder::parse(PhysicalType::I32, body)?)
            }
            DictEncodingMode::PlainBinary => {
                BlockDecoderImpl::PlainBinary(PlainBinaryBlockDecoder::parse(body)?)
            }
        };
        Ok(BinaryDictBlockDecoder {
            mode,
            inner: Box::new(inner),
            dict,
        })
    }

    pub fn mode(&self) -> DictEncodingMode {
        self.mode
    }

    /// Reads up to `n` codewords at the current position, advancing it.
    /// Only valid on codeword-mode blocks.
    pub fn copy_next_codewords(&mut self, n: usize, out: &mut Vec<u32>) -> usize {
        match self.inner.as_mut() {
            BlockDecoderImpl::BShuf(d) => d.copy_next_u32s(n, out),
            _ => panic!("codewords requested from a plain-mode block"),
        }
    }

    fn dict(&self) -> &Arc<DictDecoder> {
        self.dict.as_ref().expect("codeword block without dictionary")
    }
}

impl BlockDecoder for BinaryDictBlockDecoder {
    fn count(&self) -> usize {
        self.inner.count()
    }

    fn pos(&self) -> usize {
        self.inner.pos()
    }

    fn seek_to_position_in_block(&mut self, pos: usize) {
        self.inner.seek_to_position_in_block(pos);
    }

    fn seek_at_or_after_value(&mut self, value: &[u8]) -> Result<bool> {
        match self.mode {
            DictEncodingMode::CodeWord => {
                let (codeword, exact) = match self.dict().lookup_at_or_after(value) {
                    Ok(found) => found,
                    Err(e) => {
                        // Impossible for the value to live in this
                        // block: park one past the end.
                        let count = self.inner.count();
                        self.inner.seek_to_position_in_block(count);
                        return Err(e);
                    }
                };
                let mut key = vec![];
                encode_key_part(&Value::I32(codeword as i32), true, &mut key);
                self.inner.seek_at_or_after_value(&key)?;
                Ok(exact)
            }
            DictEncodingMode::PlainBinary => self.inner.seek_at_or_after_value(value),
        }
    }

    fn copy_next_values(&mut self, n: usize, dst: &mut ColumnSink<'_>) -> usize {
        match self.mode {
            DictEncodingMode::CodeWord => {
                let mut codewords = Vec::with_capacity(n);
                let copied = self.copy_next_codewords(n, &mut codewords);
                let dict = self.dict().clone();
                for cw in codewords {
                    dst.push(Value::Binary(dict.cell_at(cw)));
                }
                copied
            }
            DictEncodingMode::PlainBinary => self.inner.copy_next_values(n, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(strs: &[&str]) -> ColumnVec {
        ColumnVec::Binary(strs.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect())
    }

    fn decode_all(encoded: Vec<u8>, dict: Option<Arc<DictDecoder>>) -> Vec<Bytes> {
        let mut decoder = BinaryDictBlockDecoder::parse(Bytes::from(encoded), dict).unwrap();
        let mut out = ColumnVec::new(PhysicalType::Binary);
        let mut sink = ColumnSink::new(&mut out, None);
        let n = decoder.count();
        decoder.copy_next_values(n, &mut sink);
        match out {
            ColumnVec::Binary(v) => v,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_codeword_roundtrip() {
        let values = cells(&["x", "y", "z", "y", "x", "x"]);
        let mut builder = BinaryDictBlockBuilder::new(1 << 16, 1 << 16);
        assert_eq!(builder.add(&values, 0, 6), 6);
        assert_eq!(builder.dictionary_len(), 3);
        let block = builder.finish();
        let dict = Arc::new(DictDecoder::parse(Bytes::from(builder.finish_dictionary())).unwrap());
        let decoded = decode_all(block, Some(dict));
        assert_eq!(
            decoded,
            values_vec(&values),
        );
    }

    fn values_vec(v: &ColumnVec) -> Vec<Bytes> {
        match v {
            ColumnVec::Binary(b) => b.clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_fallover_to_plain_is_permanent() {
        // A tiny dictionary: after it fills, later blocks must be
        // plain even when their cells are already in the dictionary.
        let mut builder = BinaryDictBlockBuilder::new(1 << 16, 24);
        let first = cells(&["aaaa", "bbbb"]);
        assert_eq!(builder.add(&first, 0, 2), 2);
        let b1 = builder.finish();
        assert_eq!(&b1[..4], &0u32.to_le_bytes());

        // The dictionary (4 + 3*4 + 8 = 24 bytes) is now at capacity.
        assert_eq!(builder.add(&cells(&["aaaa", "cccc"]), 0, 2), 2);
        let b2 = builder.finish();
        assert_eq!(&b2[..4], &1u32.to_le_bytes(), "expected plain mode");

        // Still plain on the next block.
        assert_eq!(builder.add(&cells(&["dddd"]), 0, 1), 1);
        let b3 = builder.finish();
        assert_eq!(&b3[..4], &1u32.to_le_bytes());

        let dict = Arc::new(DictDecoder::parse(Bytes::from(builder.finish_dictionary())).unwrap());
        assert_eq!(decode_all(b1, Some(dict.clone())), values_vec(&first));
        assert_eq!(
            decode_all(b2, Some(dict.clone())),
            values_vec(&cells(&["aaaa", "cccc"]))
        );
        assert_eq!(decode_all(b3, Some(dict)), values_vec(&cells(&["dddd"])));
    }

    #[test]
    fn test_unknown_mode_is_corruption() {
        let mut data = vec![];
        data.extend_from_slice(&7u32.to_le_bytes());
        let err = BinaryDictBlockDecoder::parse(Bytes::from(data), None).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_seek_past_dictionary_end_is_not_found() {
        let values = cells(&["a", "b", "c"]);
        let mut builder = BinaryDictBlockBuilder::new(1 << 16, 1 << 16);
        builder.add(&values, 0, 3);
        let block = builder.finish();
        let dict = Arc::new(DictDecoder::parse(Bytes::from(builder.finish_dictionary())).unwrap());
        let mut decoder = BinaryDictBlockDecoder::parse(Bytes::from(block), Some(dict)).unwrap();
        let err = decoder.seek_at_or_after_value(b"zzz").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(decoder.pos(), decoder.count());
    }
}
