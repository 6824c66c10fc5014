// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Filesystem layer: data-root management, instance files, and the
//! optional embedded KV engine.

mod dir_manager;
mod instance;
mod kv_engine;

pub use dir_manager::{
    canonicalize_roots, BlockId, CanonicalizedRoot, Dir, DirManager, DirManagerOptions, FsReport,
    RefreshMode, UpdateInstanceBehavior, TMP_INFIX,
};
pub use instance::{DirInstanceFile, FileLock, INSTANCE_FILE_NAME};
pub use kv_engine::{new_kv_block_cache, KvBlockCache, KvStore, KvStoreOptions, KV_DIR_NAME};
