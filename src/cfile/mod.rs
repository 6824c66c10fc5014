// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! CFile: the append-only columnar file format.
//!
//! Layout, bit-exact:
//!
//! ```plain
//! magic(8) || data blocks || optional dict block
//!          || positional index tree || optional value index tree
//!          || footer protobuf || footer length (4, LE) || magic(8)
//! ```
//!
//! Each block is `payload' || crc32c(payload')` where `payload'` is the
//! codec output, optionally lz4-compressed. The positional index maps
//! ordinal row id to data block; the value index, when configured, maps
//! the first encoded key of every data block.

mod block;
mod bshuf;
mod dict;
mod index;
mod plain;
mod predicate;
mod reader;
mod writer;

pub use block::{BlockBuilder, BlockBuilderImpl, BlockDecoder, BlockDecoderImpl, ColumnSink};
pub use bshuf::{BShufBlockBuilder, BShufBlockDecoder};
pub use dict::{BinaryDictBlockBuilder, BinaryDictBlockDecoder, DictDecoder, DictEncodingMode};
pub use index::{IndexBlockReader, IndexTreeBuilder};
pub use plain::{
    PlainBinaryBlockBuilder, PlainBinaryBlockDecoder, PlainFixedBlockBuilder,
    PlainFixedBlockDecoder,
};
pub use predicate::ColumnPredicate;
pub use reader::{CFileIterator, CFileReader};
pub use writer::{CFileWriter, CFileWriterOptions};

use bytes::Bytes;

use crate::proto::BlockPointerPb;

/// Leading and trailing magic of every CFile.
pub const CFILE_MAGIC: &[u8; 8] = b"grncfil1";
pub const CFILE_MAGIC_LEN: usize = 8;

/// Magic closing every index block.
pub const INDEX_BLOCK_MAGIC: u32 = 0x47524e58; // "GRNX"

/// A block's location inside its file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockPointer {
    pub offset: u64,
    pub size: u32,
}

impl BlockPointer {
    pub fn to_pb(self) -> BlockPointerPb {
        BlockPointerPb {
            offset: self.offset,
            size: self.size,
        }
    }

    pub fn from_pb(pb: &BlockPointerPb) -> BlockPointer {
        BlockPointer {
            offset: pb.offset,
            size: pb.size,
        }
    }
}

/// Cache key for decoded-but-still-encoded block bytes: the owning
/// file's process-unique id plus the block offset.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BlockCacheKey {
    pub file_id: u64,
    pub offset: u64,
}

/// Process-wide cache of verified, decompressed block payloads.
pub type BlockCache = moka::sync::Cache<BlockCacheKey, Bytes>;

pub fn new_block_cache(capacity_bytes: u64) -> BlockCache {
    moka::sync::Cache::builder()
        .max_capacity(capacity_bytes)
        .weigher(|_k: &BlockCacheKey, v: &Bytes| v.len().min(u32::MAX as usize) as u32)
        .build()
}
