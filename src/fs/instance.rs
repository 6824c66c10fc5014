// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Per-directory instance files: a UUID, the dir's type tag, and the
//! full set of sibling UUIDs, stored as a checksummed protobuf and
//! held under an advisory `flock`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use bytes::Buf;
use prost::Message;

use crate::error::{Error, Result};
use crate::proto::DirInstancePb;

pub const INSTANCE_FILE_NAME: &str = "instance";

/// Exclusive advisory lock on a file, released on drop.
pub struct FileLock {
    _file: File,
}

impl FileLock {
    pub fn lock_exclusive(path: &Path) -> Result<FileLock> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(Error::io_error(
                format!("could not lock {}: {err}", path.display()),
                err.raw_os_error(),
            ));
        }
        Ok(FileLock { _file: file })
    }
}

/// Serialized container: `| length (u32 LE) | protobuf | crc32 (u32 LE) |`.
fn encode_container(pb: &DirInstancePb) -> Vec<u8> {
    let body = pb.encode_to_vec();
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out
}

fn decode_container(data: &[u8]) -> Result<DirInstancePb> {
    if data.len() < 8 {
        return Err(Error::corruption("instance file too short"));
    }
    let mut buf = data;
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len + 4 {
        return Err(Error::corruption("instance file truncated"));
    }
    let body = &buf[..len];
    let expected = (&buf[len..]).get_u32_le();
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(Error::corruption(format!(
            "instance file checksum mismatch: expected {expected:#x}, got {actual:#x}"
        )));
    }
    Ok(DirInstancePb::decode(body)?)
}

/// One data root's instance file, together with its load/lock health.
///
/// Loading failures do not fail construction; they mark the instance
/// unhealthy so the dir manager can keep the directory out of rotation
/// while the rest of the deployment opens.
pub struct DirInstanceFile {
    path: PathBuf,
    dir: PathBuf,
    dir_type: String,
    /// UUID to use if the file cannot be loaded (a fresh one), or the
    /// loaded UUID.
    uuid: String,
    metadata: Option<DirInstancePb>,
    health: Result<()>,
    lock: Option<FileLock>,
}

impl DirInstanceFile {
    pub fn new(backup_uuid: String, dir_type: String, path: PathBuf) -> DirInstanceFile {
        let dir = path.parent().expect("instance path has a parent").to_path_buf();
        DirInstanceFile {
            path,
            dir,
            dir_type,
            uuid: backup_uuid,
            metadata: None,
            health: Ok(()),
            lock: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn metadata(&self) -> Option<&DirInstancePb> {
        self.metadata.as_ref()
    }

    pub fn healthy(&self) -> bool {
        self.health.is_ok()
    }

    pub fn health_status(&self) -> Result<()> {
        self.health.clone()
    }

    pub fn set_failed(&mut self, err: Error) {
        tracing::warn!(instance = %self.path.display(), error = %err, "instance marked failed");
        self.health = Err(err);
    }

    /// Loads the instance from disk. A missing or unreadable file
    /// marks the instance unhealthy and returns `Ok`; only programmer
    /// errors surface as `Err`.
    pub fn load_from_disk(&mut self) -> Result<()> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                self.health = Err(Error::from(e).prepend(self.path.display().to_string()));
                return Ok(());
            }
        };
        let mut data = vec![];
        if let Err(e) = file.read_to_end(&mut data) {
            self.health = Err(Error::from(e).prepend(self.path.display().to_string()));
            return Ok(());
        }
        match decode_container(&data) {
            Ok(pb) => {
                if pb.dir_type != self.dir_type {
                    self.health = Err(Error::corruption(format!(
                        "instance {} has dir type {:?}, expected {:?}",
                        self.path.display(),
                        pb.dir_type,
                        self.dir_type
                    )));
                    return Ok(());
                }
                self.uuid = pb.uuid.clone();
                self.metadata = Some(pb);
            }
            Err(e) => self.health = Err(e),
        }
        Ok(())
    }

    /// Creates the instance file with this instance's UUID and the
    /// full sibling set. Returns whether the parent dir was created.
    pub fn create(&mut self, all_uuids: &[String]) -> Result<bool> {
        let mut created_dir = false;
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            created_dir = true;
        }
        let pb = DirInstancePb {
            uuid: self.uuid.clone(),
            dir_type: self.dir_type.clone(),
            all_uuids: all_uuids.to_vec(),
        };
        write_instance(&self.path, &pb)?;
        self.metadata = Some(pb);
        self.health = Ok(());
        Ok(created_dir)
    }

    /// Rewrites the instance with a new sibling set, in place.
    pub fn rewrite(&mut self, all_uuids: &[String]) -> Result<()> {
        let mut pb = self
            .metadata
            .clone()
            .ok_or_else(|| Error::illegal_state("rewriting an unloaded instance"))?;
        pb.all_uuids = all_uuids.to_vec();
        write_instance(&self.path, &pb)?;
        self.metadata = Some(pb);
        Ok(())
    }

    /// Takes the advisory lock. Failure to lock is surfaced to the
    /// caller, which decides whether the lock is mandatory.
    pub fn acquire_lock(&mut self) -> Result<()> {
        let lock = FileLock::lock_exclusive(&self.path)?;
        self.lock = Some(lock);
        Ok(())
    }
}

fn write_instance(path: &Path, pb: &DirInstancePb) -> Result<()> {
    let data = encode_container(pb);
    let tmp = path.with_extension("tmp.new");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Fsyncs the parent directory of `path` so a freshly created or
/// renamed file survives a crash.
pub fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::invalid_argument(format!("{} has no parent", path.display())))?;
    let dir = File::open(parent)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data").join(INSTANCE_FILE_NAME);
        let mut inst = DirInstanceFile::new("uuid-a".into(), "data".into(), path.clone());
        assert!(inst.create(&["uuid-a".into(), "uuid-b".into()]).unwrap());

        let mut loaded = DirInstanceFile::new("backup".into(), "data".into(), path);
        loaded.load_from_disk().unwrap();
        assert!(loaded.healthy());
        assert_eq!(loaded.uuid(), "uuid-a");
        assert_eq!(loaded.metadata().unwrap().all_uuids.len(), 2);
    }

    #[test]
    fn test_missing_file_is_unhealthy_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut inst = DirInstanceFile::new(
            "backup".into(),
            "data".into(),
            tmp.path().join(INSTANCE_FILE_NAME),
        );
        inst.load_from_disk().unwrap();
        assert!(!inst.healthy());
        assert!(inst.health_status().unwrap_err().is_not_found());
        // The backup UUID stands in.
        assert_eq!(inst.uuid(), "backup");
    }

    #[test]
    fn test_corrupt_file_is_unhealthy() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(INSTANCE_FILE_NAME);
        std::fs::write(&path, b"garbage that is long enough").unwrap();
        let mut inst = DirInstanceFile::new("backup".into(), "data".into(), path);
        inst.load_from_disk().unwrap();
        assert!(!inst.healthy());
    }

    #[test]
    fn test_wrong_dir_type_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("wal").join(INSTANCE_FILE_NAME);
        let mut inst = DirInstanceFile::new("u".into(), "wal".into(), path.clone());
        inst.create(&["u".into()]).unwrap();
        let mut loaded = DirInstanceFile::new("b".into(), "data".into(), path);
        loaded.load_from_disk().unwrap();
        assert!(!loaded.healthy());
        assert!(loaded.health_status().unwrap_err().is_corruption());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(INSTANCE_FILE_NAME);
        let mut inst = DirInstanceFile::new("u".into(), "data".into(), path.clone());
        inst.create(&["u".into()]).unwrap();
        inst.acquire_lock().unwrap();
        let mut second = DirInstanceFile::new("v".into(), "data".into(), path);
        second.load_from_disk().unwrap();
        assert!(second.acquire_lock().is_err());
    }
}
