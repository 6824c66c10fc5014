// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Granite: a per-tablet columnar storage and replication core.
//!
//! The crate provides the storage engine of a tablet server: the
//! CFile columnar format with bit-shuffle, plain, and dictionary
//! encodings ([`cfile`]); the MemRowSet/DiskRowSet tablet engine with
//! REDO/UNDO delta stores and compactions ([`tablet`]); the
//! multi-root directory manager ([`fs`]); the leader-side consensus
//! peer driver ([`consensus`]); and the maintenance scheduler that
//! keeps it all churning ([`maintenance`]).
//!
//! The SQL surface, master/catalog, RPC transport, and write-ahead
//! log are external collaborators reached through narrow traits.

#![deny(unused_must_use)]

pub mod cfile;
pub mod consensus;
pub mod error;
pub mod fs;
pub mod maintenance;
pub mod options;
pub mod proto;
pub mod rowblock;
pub mod schema;
pub mod tablet;
pub mod types;
pub mod util;

pub use error::{Error, Result};
