// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Bit-shuffle encoding for fixed-width values.
//!
//! The block's cells are laid out little-endian, padded to a multiple
//! of eight, then transposed bit-plane by bit-plane: plane `p` holds
//! bit `p` of every cell. Runs of similar values produce long runs of
//! identical bits, which the optional per-block compressor exploits.
//! The transpose is portable and byte-exact across platforms.
//!
//! Layout:
//!
//! ```plain
//! | count (u32 LE) | elem width (u32 LE) | transposed planes |
//! ```

use bytes::{Buf, BufMut, Bytes};

use super::block::{BlockBuilder, BlockDecoder, ColumnSink};
use crate::error::{Error, Result};
use crate::types::{encode_key_part, ColumnVec, PhysicalType, Value};

const HEADER_SIZE: usize = 8;

fn transpose(raw: &[u8], count: usize, width: usize) -> Vec<u8> {
    let padded = count.next_multiple_of(8);
    let plane_bytes = padded / 8;
    let mut out = vec![0u8; width * 8 * plane_bytes];
    for elem in 0..count {
        for byte in 0..width {
            let b = raw[elem * width + byte];
            for bit in 0..8 {
                if b & (1 << bit) != 0 {
                    let plane = byte * 8 + bit;
                    out[plane * plane_bytes + elem / 8] |= 1 << (elem % 8);
                }
            }
        }
    }
    out
}

fn untranspose(planes: &[u8], count: usize, width: usize) -> Vec<u8> {
    let padded = count.next_multiple_of(8);
    let plane_bytes = padded / 8;
    let mut out = vec![0u8; count * width];
    for plane in 0..width * 8 {
        let byte = plane / 8;
        let bit = plane % 8;
        for elem in 0..count {
            if planes[plane * plane_bytes + elem / 8] & (1 << (elem % 8)) != 0 {
                out[elem * width + byte] |= 1 << bit;
            }
        }
    }
    out
}

pub struct BShufBlockBuilder {
    physical: PhysicalType,
    width: usize,
    raw: Vec<u8>,
    count: usize,
    block_size: usize,
    first: Option<Value>,
    last: Option<Value>,
}

impl BShufBlockBuilder {
    pub fn new(physical: PhysicalType, block_size: usize) -> BShufBlockBuilder {
        let width = physical
            .width()
            .expect("bit-shuffle requires a fixed-width type");
        BShufBlockBuilder {
            physical,
            width,
            raw: Vec::new(),
            count: 0,
            block_size,
            first: None,
            last: None,
        }
    }

    fn push_value(&mut self, value: Value) {
        if self.first.is_none() {
            self.first = Some(value.clone());
        }
        self.last = Some(value.clone());
        value.put_le(&mut self.raw);
        self.count += 1;
    }

    /// Direct append used by the dictionary builder for codewords.
    pub fn add_u32(&mut self, v: u32) {
        debug_assert_eq!(self.physical, PhysicalType::I32);
        self.push_value(Value::I32(v as i32));
    }
}

impl BlockBuilder for BShufBlockBuilder {
    fn add(&mut self, values: &ColumnVec, from: usize, count: usize) -> usize {
        let mut added = 0;
        for i in from..from + count {
            if self.is_block_full() && self.count > 0 {
                break;
            }
            self.push_value(values.get(i));
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
        let mut out = Vec::with_capacity(HEADER_SIZE + self.raw.len());
        out.put_u32_le(self.count as u32);
        out.put_u32_le(self.width as u32);
        let mut raw = std::mem::take(&mut self.raw);
        let padded = self.count.next_multiple_of(8);
        raw.resize(padded * self.width, 0);
        out.extend_from_slice(&transpose(&raw, padded, self.width));
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
pub struct BShufBlockDecoder {
    physical: PhysicalType,
    width: usize,
    /// Un-transposed little-endian cells.
    raw: Vec<u8>,
    count: usize,
    pos: usize,
}

impl BShufBlockDecoder {
    pub fn parse(physical: PhysicalType, data: Bytes) -> Result<BShufBlockDecoder> {
        let mut buf = &data[..];
        if buf.remaining() < HEADER_SIZE {
            return Err(Error::corruption("bit-shuffle block shorter than header"));
        }
        let count = buf.get_u32_le() as usize;
        let width = buf.get_u32_le() as usize;
        let expected_width = physical.width().ok_or_else(|| {
            Error::corruption("bit-shuffle block for a variable-width type")
        })?;
        if width != expected_width {
            return Err(Error::corruption(format!(
                "bit-shuffle width {width} does not match type width {expected_width}"
            )));
        }
        let padded = count.next_multiple_of(8);
        let body = padded * width;
        if buf.remaining() < body {
            return Err(Error::corruption(format!(
                "bit-shuffle block truncated: want {body} bytes, have {}",
                buf.remaining()
            )));
        }
        let mut raw = untranspose(&buf[..body], padded, width);
        raw.truncate(count * width);
        Ok(BShufBlockDecoder {
            physical,
            width,
            raw,
            count,
            pos: 0,
        })
    }

    fn value_at(&self, idx: usize) -> Value {
        let mut slice = &self.raw[idx * self.width..(idx + 1) * self.width];
        Value::get_le(self.physical, &mut slice)
    }

    /// Codeword accessor for the dictionary decoder.
    pub fn u32_at(&self, idx: usize) -> u32 {
        debug_assert_eq!(self.physical, PhysicalType::I32);
        match self.value_at(idx) {
            Value::I32(v) => v as u32,
            _ => unreachable!(),
        }
    }

    /// Reads up to `n` codewords from the current position into `out`,
    /// advancing the position.
    pub fn copy_next_u32s(&mut self, n: usize, out: &mut Vec<u32>) -> usize {
        let n = n.min(self.remaining());
        for _ in 0..n {
            out.push(self.u32_at(self.pos));
            self.pos += 1;
        }
        n
    }
}

impl BlockDecoder for BShufBlockDecoder {
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
        // Cells are in key order on seekable columns: binary search on
        // the memcomparable encoding.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(physical: PhysicalType, values: ColumnVec) {
        let n = values.len();
        let mut builder = BShufBlockBuilder::new(physical, 1 << 20);
        assert_eq!(builder.add(&values, 0, n), n);
        let encoded = builder.finish();
        let mut decoder = BShufBlockDecoder::parse(physical, Bytes::from(encoded)).unwrap();
        assert_eq!(decoder.count(), n);
        let mut out = ColumnVec::new(physical);
        let mut sink = ColumnSink::new(&mut out, None);
        assert_eq!(decoder.copy_next_values(n, &mut sink), n);
        assert_eq!(out, values);
    }

    #[test]
    fn test_roundtrip_i32() {
        roundtrip(
            PhysicalType::I32,
            ColumnVec::I32(vec![0, 1, -1, i32::MAX, i32::MIN, 42, 43, 44, 45]),
        );
    }

    #[test]
    fn test_roundtrip_i64_unaligned_count() {
        roundtrip(
            PhysicalType::I64,
            ColumnVec::I64((0..13).map(|i| i * 1_000_003).collect()),
        );
    }

    #[test]
    fn test_roundtrip_f64() {
        roundtrip(
            PhysicalType::F64,
            ColumnVec::F64(vec![0.0, -1.5, 3.25, f64::MAX]),
        );
    }

    #[test]
    fn test_roundtrip_random_values() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let n = rng.gen_range(1..500);
            roundtrip(
                PhysicalType::I64,
                ColumnVec::I64((0..n).map(|_| rng.gen()).collect()),
            );
        }
    }

    #[test]
    fn test_seek_at_or_after() {
        let values = ColumnVec::I32(vec![10, 20, 30, 40]);
        let mut builder = BShufBlockBuilder::new(PhysicalType::I32, 1 << 20);
        builder.add(&values, 0, 4);
        let mut decoder =
            BShufBlockDecoder::parse(PhysicalType::I32, Bytes::from(builder.finish())).unwrap();

        let mut key = vec![];
        encode_key_part(&Value::I32(20), true, &mut key);
        assert!(decoder.seek_at_or_after_value(&key).unwrap());
        assert_eq!(decoder.pos(), 1);

        let mut key = vec![];
        encode_key_part(&Value::I32(25), true, &mut key);
        assert!(!decoder.seek_at_or_after_value(&key).unwrap());
        assert_eq!(decoder.pos(), 2);

        let mut key = vec![];
        encode_key_part(&Value::I32(99), true, &mut key);
        let err = decoder.seek_at_or_after_value(&key).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(decoder.pos(), 4);
    }

    #[test]
    fn test_truncated_block_is_corruption() {
        let values = ColumnVec::I32(vec![1, 2, 3]);
        let mut builder = BShufBlockBuilder::new(PhysicalType::I32, 1 << 20);
        builder.add(&values, 0, 3);
        let encoded = builder.finish();
        let err =
            BShufBlockDecoder::parse(PhysicalType::I32, Bytes::from(encoded[..10].to_vec()))
                .unwrap_err();
        assert!(err.is_corruption());
    }
}
