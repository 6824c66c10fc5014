// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Multi-level index trees over data blocks.
//!
//! Index blocks are written after the data region, bottom-up: leaves
//! map keys to data blocks, internal levels map separator keys to
//! child index blocks, and the footer records the root. Block layout:
//!
//! ```plain
//! | entries (length-delimited IndexEntryPb) | count (u32 LE)
//! | is_leaf (u8) | magic (u32 LE) |
//! ```

use bytes::{Buf, Bytes};
use prost::Message;

use super::{BlockPointer, INDEX_BLOCK_MAGIC};
use crate::error::{Error, Result};
use crate::proto::IndexEntryPb;

const TRAILER_SIZE: usize = 4 + 1 + 4;

fn encode_block(entries: &[IndexEntryPb], is_leaf: bool) -> Vec<u8> {
    use bytes::BufMut;
    let mut out = Vec::new();
    for entry in entries {
        entry
            .encode_length_delimited(&mut out)
            .expect("vec write cannot fail");
    }
    out.put_u32_le(entries.len() as u32);
    out.put_u8(is_leaf as u8);
    out.put_u32_le(INDEX_BLOCK_MAGIC);
    out
}

pub struct IndexBlockReader {
    entries: Vec<IndexEntryPb>,
    is_leaf: bool,
}

impl IndexBlockReader {
    pub fn parse(data: Bytes) -> Result<IndexBlockReader> {
        if data.len() < TRAILER_SIZE {
            return Err(Error::corruption("index block shorter than its trailer"));
        }
        let mut trailer = &data[data.len() - TRAILER_SIZE..];
        let count = trailer.get_u32_le() as usize;
        let is_leaf = trailer.get_u8() != 0;
        let magic = trailer.get_u32_le();
        if magic != INDEX_BLOCK_MAGIC {
            return Err(Error::corruption(format!(
                "bad index block magic {magic:#x}"
            )));
        }
        let mut body = &data[..data.len() - TRAILER_SIZE];
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(IndexEntryPb::decode_length_delimited(&mut body)?);
        }
        Ok(IndexBlockReader { entries, is_leaf })
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn entries(&self) -> &[IndexEntryPb] {
        &self.entries
    }

    /// Index of the last entry whose key is `<= key`; entry 0 when
    /// every key sorts after `key`.
    pub fn floor_or_first(&self, key: &[u8]) -> Result<usize> {
        if self.entries.is_empty() {
            return Err(Error::corruption("empty index block"));
        }
        let mut lo = 0;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.entries[mid].key.as_slice() <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo.saturating_sub(1))
    }

    pub fn child(&self, idx: usize) -> Result<BlockPointer> {
        let pb = self.entries[idx]
            .block
            .as_ref()
            .ok_or_else(|| Error::corruption("index entry without a block pointer"))?;
        Ok(BlockPointer::from_pb(pb))
    }
}

pub struct IndexTreeBuilder {
    levels: Vec<Vec<IndexEntryPb>>,
    max_entries: usize,
}

impl IndexTreeBuilder {
    pub fn new(max_entries_per_block: usize) -> IndexTreeBuilder {
        assert!(max_entries_per_block >= 2);
        IndexTreeBuilder {
            levels: vec![vec![]],
            max_entries: max_entries_per_block,
        }
    }

    pub fn add_entry(&mut self, key: Vec<u8>, ptr: BlockPointer) {
        self.levels[0].push(IndexEntryPb {
            key,
            block: Some(ptr.to_pb()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    fn push_parent(&mut self, level: usize, key: Vec<u8>, ptr: BlockPointer) {
        if self.levels.len() <= level + 1 {
            self.levels.push(vec![]);
        }
        self.levels[level + 1].push(IndexEntryPb {
            key,
            block: Some(ptr.to_pb()),
        });
    }

    /// Writes out every index block through `write_block` and returns
    /// the root pointer, or `None` when no entries were added.
    pub fn finish<F>(&mut self, mut write_block: F) -> Result<Option<BlockPointer>>
    where
        F: FnMut(&[u8]) -> Result<BlockPointer>,
    {
        if self.is_empty() {
            return Ok(None);
        }
        let mut level = 0;
        loop {
            let entries = std::mem::take(&mut self.levels[level]);
            let is_leaf = level == 0;
            if entries.len() <= self.max_entries {
                let ptr = write_block(&encode_block(&entries, is_leaf))?;
                let parent_has_entries = self
                    .levels
                    .get(level + 1)
                    .map(|l| !l.is_empty())
                    .unwrap_or(false);
                if !parent_has_entries {
                    return Ok(Some(ptr));
                }
                self.push_parent(level, entries[0].key.clone(), ptr);
            } else {
                for chunk in entries.chunks(self.max_entries) {
                    let ptr = write_block(&encode_block(chunk, is_leaf))?;
                    self.push_parent(level, chunk[0].key.clone(), ptr);
                }
            }
            level += 1;
        }
    }
}
