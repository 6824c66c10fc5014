// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Embedded log-structured key/value store, optionally rooted under
//! each data dir to persist block-container metadata.
//!
//! Writes append to a WAL and apply to an in-memory table; flushing
//! rewrites the snapshot file and truncates the WAL. Shutting down
//! flushes first to bound the next open's replay time.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};
use tracing::warn;

use crate::error::{Error, Result};

pub const KV_DIR_NAME: &str = "rdb";
const WAL_FILE: &str = "wal";
const SNAPSHOT_FILE: &str = "snapshot";

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;

/// Process-wide cache shared by every embedded store, keyed by
/// (store path, key).
pub type KvBlockCache = moka::sync::Cache<(PathBuf, Vec<u8>), Bytes>;

pub fn new_kv_block_cache(capacity_bytes: u64) -> KvBlockCache {
    moka::sync::Cache::builder()
        .max_capacity(capacity_bytes)
        .weigher(|k: &(PathBuf, Vec<u8>), v: &Bytes| {
            (k.1.len() + v.len()).min(u32::MAX as usize) as u32
        })
        .build()
}

#[derive(Clone, Copy, Debug)]
pub struct KvStoreOptions {
    /// Memtable size that triggers a background flush.
    pub memtable_flush_bytes: usize,
    pub fsync: bool,
}

impl Default for KvStoreOptions {
    fn default() -> Self {
        KvStoreOptions {
            memtable_flush_bytes: 8 * 1024 * 1024,
            fsync: true,
        }
    }
}

/// One directory's embedded store.
pub struct KvStore {
    root: PathBuf,
    wal: File,
    memtable: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    memtable_bytes: usize,
    cache: Option<KvBlockCache>,
    opts: KvStoreOptions,
}

fn encode_record(tag: u8, key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let vlen = value.map(|v| v.len()).unwrap_or(0);
    let mut body = Vec::with_capacity(1 + 8 + key.len() + vlen);
    body.push(tag);
    body.extend_from_slice(&(key.len() as u32).to_le_bytes());
    body.extend_from_slice(key);
    body.extend_from_slice(&(vlen as u32).to_le_bytes());
    if let Some(v) = value {
        body.extend_from_slice(v);
    }
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

impl KvStore {
    pub fn open(
        dir: &Path,
        cache: Option<KvBlockCache>,
        opts: KvStoreOptions,
    ) -> Result<KvStore> {
        let root = dir.join(KV_DIR_NAME);
        std::fs::create_dir_all(&root)?;
        let mut memtable = BTreeMap::new();

        let snapshot_path = root.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let data = std::fs::read(&snapshot_path)?;
            replay_records(&data, &mut memtable)
                .map_err(|e| e.prepend(snapshot_path.display().to_string()))?;
        }
        let wal_path = root.join(WAL_FILE);
        if wal_path.exists() {
            let mut data = vec![];
            File::open(&wal_path)?.read_to_end(&mut data)?;
            // A torn tail record is expected after a crash; replay
            // stops there.
            if let Err(e) = replay_records(&data, &mut memtable) {
                warn!(wal = %wal_path.display(), error = %e, "stopping WAL replay at torn record");
            }
        }
        let wal = OpenOptions::new().create(true).append(true).open(&wal_path)?;
        let memtable_bytes = memtable
            .iter()
            .map(|(k, v)| k.len() + v.as_ref().map(|v| v.len()).unwrap_or(0))
            .sum();
        Ok(KvStore {
            root,
            wal,
            memtable,
            memtable_bytes,
            cache,
            opts,
        })
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append_wal(TAG_PUT, key, Some(value))?;
        self.memtable_bytes += key.len() + value.len();
        self.memtable.insert(key.to_vec(), Some(value.to_vec()));
        if let Some(cache) = &self.cache {
            cache.insert(
                (self.root.clone(), key.to_vec()),
                Bytes::copy_from_slice(value),
            );
        }
        if self.memtable_bytes >= self.opts.memtable_flush_bytes {
            self.flush()?;
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.append_wal(TAG_DELETE, key, None)?;
        self.memtable.insert(key.to_vec(), None);
        if let Some(cache) = &self.cache {
            cache.invalidate(&(self.root.clone(), key.to_vec()));
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        if let Some(cache) = &self.cache {
            if let Some(v) = cache.get(&(self.root.clone(), key.to_vec())) {
                return Some(v);
            }
        }
        match self.memtable.get(key) {
            Some(Some(v)) => Some(Bytes::copy_from_slice(v)),
            _ => None,
        }
    }

    /// Keys with the given prefix, in order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Bytes)> {
        self.memtable
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, v)| {
                v.as_ref()
                    .map(|v| (k.clone(), Bytes::copy_from_slice(v)))
            })
            .collect()
    }

    fn append_wal(&mut self, tag: u8, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.wal.write_all(&encode_record(tag, key, value))?;
        if self.opts.fsync {
            self.wal.sync_data()?;
        }
        Ok(())
    }

    /// Rewrites the snapshot from the memtable and truncates the WAL.
    pub fn flush(&mut self) -> Result<()> {
        let snapshot_path = self.root.join(SNAPSHOT_FILE);
        let tmp = snapshot_path.with_extension("tmp.new");
        {
            let mut f = File::create(&tmp)?;
            for (k, v) in &self.memtable {
                match v {
                    Some(v) => f.write_all(&encode_record(TAG_PUT, k, Some(v)))?,
                    None => {}
                }
            }
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &snapshot_path)?;
        // Deleted keys are gone from the snapshot; drop the tombstones.
        self.memtable.retain(|_, v| v.is_some());
        self.wal.set_len(0)?;
        self.memtable_bytes = self
            .memtable
            .iter()
            .map(|(k, v)| k.len() + v.as_ref().map(|v| v.len()).unwrap_or(0))
            .sum();
        Ok(())
    }

    /// Flushes and closes. Errors are logged, not returned: a close
    /// failure costs replay time at the next open, nothing more.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.flush() {
            warn!(store = %self.root.display(), error = %e, "embedded KV flush on shutdown failed");
        }
        if let Err(e) = self.wal.sync_all() {
            warn!(store = %self.root.display(), error = %e, "embedded KV close failed");
        }
    }
}

fn replay_records(
    mut data: &[u8],
    memtable: &mut BTreeMap<Vec<u8>, Option<Vec<u8>>>,
) -> Result<()> {
    while data.remaining() >= 8 {
        let len = data.get_u32_le() as usize;
        let crc = data.get_u32_le();
        if data.remaining() < len {
            return Err(Error::corruption("torn record"));
        }
        let body = &data[..len];
        if crc32fast::hash(body) != crc {
            return Err(Error::corruption("record checksum mismatch"));
        }
        let mut body_buf = body;
        let tag = body_buf.get_u8();
        let klen = body_buf.get_u32_le() as usize;
        let key = body_buf[..klen].to_vec();
        body_buf.advance(klen);
        let vlen = body_buf.get_u32_le() as usize;
        match tag {
            TAG_PUT => {
                memtable.insert(key, Some(body_buf[..vlen].to_vec()));
            }
            TAG_DELETE => {
                memtable.insert(key, None);
            }
            other => return Err(Error::corruption(format!("unknown record tag {other}"))),
        }
        data.advance(len);
    }
    if data.remaining() > 0 {
        return Err(Error::corruption("torn record"));
    }
    Ok(())
}
