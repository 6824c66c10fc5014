// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Multi-root directory manager: canonicalizes data roots, owns the
//! per-dir instance files and worker pools, tracks failed and full
//! dirs, and places new blocks on healthy dirs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};
use uuid::Uuid;

use super::instance::{sync_parent_dir, DirInstanceFile, INSTANCE_FILE_NAME};
use super::kv_engine::{KvBlockCache, KvStore, KvStoreOptions};
use crate::error::{Error, Result};
use crate::util::{ThreadPool, ThreadPoolBuilder};

/// Infix marking temporary files, which are deleted at open.
pub const TMP_INFIX: &str = ".grntmp";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateInstanceBehavior {
    DontUpdate,
    UpdateAndIgnoreFailures,
    UpdateAndErrorOnFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshMode {
    Always,
    ExpiredOnly,
}

#[derive(Clone)]
pub struct DirManagerOptions {
    /// Tag naming the managed subdirectory under each root, e.g.
    /// "data".
    pub dir_type: String,
    pub read_only: bool,
    pub update_instances: UpdateInstanceBehavior,
    /// Instance locks: mandatory for read-write opens, optional for
    /// read-only, disabled entirely when false.
    pub lock_dirs: bool,
    pub num_threads_per_dir: usize,
    /// 0 means unbounded.
    pub max_dirs: usize,
    pub reserved_bytes: u64,
    pub available_space_cache_ttl: Duration,
    pub enable_embedded_kv: bool,
    pub kv_cache: Option<KvBlockCache>,
    pub kv_opts: KvStoreOptions,
}

impl DirManagerOptions {
    pub fn new(dir_type: impl Into<String>) -> DirManagerOptions {
        DirManagerOptions {
            dir_type: dir_type.into(),
            read_only: false,
            update_instances: UpdateInstanceBehavior::UpdateAndIgnoreFailures,
            lock_dirs: true,
            num_threads_per_dir: 2,
            max_dirs: 0,
            reserved_bytes: 0,
            available_space_cache_ttl: Duration::from_secs(10),
            enable_embedded_kv: false,
            kv_cache: None,
            kv_opts: KvStoreOptions::default(),
        }
    }
}

pub struct CanonicalizedRoot {
    pub path: PathBuf,
    pub status: Result<()>,
}

/// Canonicalizes each root, recording per-root failures instead of
/// failing outright: a missing parent behaves like a failed disk.
pub fn canonicalize_roots(roots: &[PathBuf]) -> Vec<CanonicalizedRoot> {
    roots
        .iter()
        .map(|r| match r.parent().map(|p| p.canonicalize()) {
            Some(Ok(parent)) => CanonicalizedRoot {
                path: parent.join(r.file_name().expect("root has a final component")),
                status: Ok(()),
            },
            Some(Err(e)) => CanonicalizedRoot {
                path: r.clone(),
                status: Err(Error::from(e).prepend(format!("canonicalizing {}", r.display()))),
            },
            None => CanonicalizedRoot {
                path: r.clone(),
                status: Err(Error::invalid_argument(format!(
                    "bad root: {}",
                    r.display()
                ))),
            },
        })
        .collect()
}

struct SpaceState {
    is_full: bool,
    available_bytes: u64,
    last_check: Option<Instant>,
}

/// One managed directory: its instance file, worker pool, cached
/// fullness, and (optionally) an embedded KV store.
pub struct Dir {
    dir: PathBuf,
    instance: Mutex<DirInstanceFile>,
    pool: Arc<ThreadPool>,
    space: Mutex<SpaceState>,
    kv: Mutex<Option<KvStore>>,
    reserved_bytes: u64,
    space_cache_ttl: Duration,
    shutdown: Mutex<bool>,
}

fn available_space(path: &Path) -> Result<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::invalid_argument("path contains a NUL byte"))?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut st) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::io_error(
            format!("statvfs {}: {err}", path.display()),
            err.raw_os_error(),
        ));
    }
    Ok(st.f_bavail as u64 * st.f_frsize as u64)
}

impl Dir {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn instance(&self) -> &Mutex<DirInstanceFile> {
        &self.instance
    }

    pub fn uuid(&self) -> String {
        self.instance.lock().uuid().to_owned()
    }

    pub fn is_healthy(&self) -> bool {
        self.instance.lock().healthy()
    }

    /// Runs `task` on the dir's pool, or inline if the pool refuses.
    pub fn exec_closure<F: FnOnce() + Send + 'static>(&self, task: F) {
        if let Err(e) = self.pool.submit(task) {
            warn!(dir = %self.dir.display(), error = %e,
                  "could not submit to dir pool; running synchronously");
        }
    }

    pub fn wait_on_closures(&self) {
        self.pool.wait();
    }

    pub fn kv_store(&self) -> &Mutex<Option<KvStore>> {
        &self.kv
    }

    pub fn shutdown(&self) {
        let mut down = self.shutdown.lock();
        if *down {
            return;
        }
        self.wait_on_closures();
        self.pool.shutdown();
        if let Some(kv) = self.kv.lock().as_mut() {
            kv.shutdown();
        }
        *down = true;
    }

    /// Re-polls free space in `Always` mode, or when the cached check
    /// has outlived the TTL in `ExpiredOnly` mode. ENOSPC marks the
    /// dir full; other IO errors propagate for the caller to classify.
    pub fn refresh_available_space(&self, mode: RefreshMode) -> Result<()> {
        if mode == RefreshMode::ExpiredOnly {
            let space = self.space.lock();
            if let Some(at) = space.last_check {
                if at.elapsed() < self.space_cache_ttl {
                    return Ok(());
                }
            }
        }
        let (is_full, available) = match available_space(&self.dir) {
            Ok(avail) => {
                if avail <= self.reserved_bytes {
                    warn!(dir = %self.dir.display(), available = avail,
                          reserved = self.reserved_bytes,
                          "insufficient disk space; will retry after cache expiry");
                    (true, 0)
                } else {
                    (false, avail - self.reserved_bytes)
                }
            }
            Err(e) if e.is_disk_full() => (true, 0),
            Err(e) => return Err(e.prepend("could not refresh fullness")),
        };
        let mut space = self.space.lock();
        space.is_full = is_full;
        space.available_bytes = available;
        space.last_check = Some(Instant::now());
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.space.lock().is_full
    }

    pub fn available_bytes(&self) -> u64 {
        self.space.lock().available_bytes
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Identifies a block file by its dir's UUID and file name, stable
/// across restarts and root reordering.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlockId {
    pub dir_uuid: String,
    pub name: String,
}

#[derive(Default)]
struct DirMaps {
    failed_dirs: BTreeSet<usize>,
    idx_by_uuid: HashMap<String, usize>,
    uuid_by_idx: HashMap<usize, String>,
    uuid_by_root: HashMap<PathBuf, String>,
    tablets_by_uuid_idx: HashMap<usize, BTreeSet<String>>,
}

/// Summary of directory health, surfaced to operators.
#[derive(Debug, Default, Clone)]
pub struct FsReport {
    pub failed_dirs: Vec<PathBuf>,
    pub full_dirs: Vec<PathBuf>,
}

pub struct DirManager {
    opts: DirManagerOptions,
    roots: Vec<CanonicalizedRoot>,
    dirs: Vec<Arc<Dir>>,
    maps: RwLock<DirMaps>,
}

impl DirManager {
    /// Initializes a fresh deployment: writes one instance per root
    /// with a shared sibling set. Fails with `AlreadyPresent` if any
    /// healthy instance exists.
    pub fn create(roots: &[PathBuf], opts: DirManagerOptions) -> Result<()> {
        assert!(!opts.read_only);
        assert_ne!(opts.update_instances, UpdateInstanceBehavior::DontUpdate);
        let canonical = canonicalize_roots(roots);
        for root in &canonical {
            root.status
                .clone()
                .map_err(|e| e.prepend("could not create directory manager with disks failed"))?;
        }
        let mut instances = load_instances(&canonical, &opts)?;
        if instances.iter().any(DirInstanceFile::healthy) {
            return Err(Error::already_present("instance files already exist"));
        }
        create_new_dirs_and_update_instances(&mut instances, &opts)
            .map_err(|e| e.prepend("could not create new data directories"))
    }

    /// Opens the deployment: loads and locks instances, repairs the
    /// sibling sets, cleans temp files, and initializes fullness.
    pub fn open(roots: &[PathBuf], opts: DirManagerOptions) -> Result<DirManager> {
        let canonical = canonicalize_roots(roots);
        if opts.max_dirs != 0 && canonical.len() > opts.max_dirs {
            return Err(Error::invalid_argument(format!(
                "too many directories provided {}, max is {}",
                canonical.len(),
                opts.max_dirs
            )));
        }
        let mut instances =
            load_instances(&canonical, &opts).map_err(|e| e.prepend("failed to load instance files"))?;
        if !instances.iter().any(DirInstanceFile::healthy) {
            return Err(Error::not_found(
                "could not open directory manager, no healthy directories found",
            ));
        }
        if !opts.read_only && opts.update_instances != UpdateInstanceBehavior::DontUpdate {
            create_new_dirs_and_update_instances(&mut instances, &opts)
                .map_err(|e| e.prepend("could not add new directories"))?;
            // Release the instance locks before re-locking below; flock
            // conflicts with itself across descriptors.
            instances.clear();
            instances = load_instances(&canonical, &opts)
                .map_err(|e| e.prepend("failed to load instance files after updating"))?;
            if !instances.iter().any(DirInstanceFile::healthy) {
                return Err(Error::io_error(
                    "could not open directory manager, no healthy directories found",
                    None,
                ));
            }
        }

        let mut dirs = Vec::with_capacity(instances.len());
        for mut instance in instances {
            let dir_path = instance.dir().to_path_buf();
            let pool = Arc::new(
                ThreadPoolBuilder::new(format!("dir {}", dir_path.display()))
                    .max_threads(opts.num_threads_per_dir)
                    .build(),
            );
            let mut kv = None;
            if opts.enable_embedded_kv && instance.healthy() {
                match KvStore::open(&dir_path, opts.kv_cache.clone(), opts.kv_opts) {
                    Ok(store) => kv = Some(store),
                    Err(e) => {
                        let e = e.prepend(format!("could not initialize {}", dir_path.display()));
                        warn!(error = %e, "embedded KV open failed");
                        instance.set_failed(e);
                    }
                }
            }
            dirs.push(Arc::new(Dir {
                dir: dir_path,
                instance: Mutex::new(instance),
                pool,
                space: Mutex::new(SpaceState {
                    is_full: false,
                    available_bytes: 0,
                    last_check: None,
                }),
                kv: Mutex::new(kv),
                reserved_bytes: opts.reserved_bytes,
                space_cache_ttl: opts.available_space_cache_ttl,
                shutdown: Mutex::new(false),
            }));
        }

        // Clean temp files under each healthy dir in parallel on the
        // per-dir pools.
        for dir in &dirs {
            if dir.is_healthy() {
                let path = dir.dir().to_path_buf();
                dir.exec_closure(move || delete_tmp_files_recursively(&path));
            }
        }
        for dir in &dirs {
            dir.wait_on_closures();
        }

        let mut maps = DirMaps::default();
        for (idx, dir) in dirs.iter().enumerate() {
            let uuid = dir.uuid();
            if !dir.is_healthy() {
                maps.failed_dirs.insert(idx);
            }
            if let Some(root) = dir.dir().parent() {
                maps.uuid_by_root.insert(root.to_path_buf(), uuid.clone());
            }
            maps.uuid_by_idx.insert(idx, uuid.clone());
            maps.idx_by_uuid.insert(uuid, idx);
            maps.tablets_by_uuid_idx.insert(idx, BTreeSet::new());
        }

        let manager = DirManager {
            opts,
            roots: canonical,
            dirs,
            maps: RwLock::new(maps),
        };

        // Initialize fullness; a refresh hitting a failed disk marks
        // the dir failed instead of failing the open.
        for idx in 0..manager.dirs.len() {
            if manager.is_dir_failed(idx) {
                continue;
            }
            let dir = &manager.dirs[idx];
            if let Err(e) = dir.refresh_available_space(RefreshMode::Always) {
                if e.is_disk_failure() {
                    manager.mark_dir_failed(idx, &e.to_string())?;
                } else {
                    return Err(e);
                }
            }
        }
        Ok(manager)
    }

    pub fn dir_type(&self) -> &str {
        &self.opts.dir_type
    }

    pub fn dirs(&self) -> &[Arc<Dir>] {
        &self.dirs
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.iter().map(|r| r.path.clone()).collect()
    }

    pub fn shutdown(&self) {
        for dir in &self.dirs {
            dir.shutdown();
        }
    }

    pub fn wait_on_closures(&self) {
        for dir in &self.dirs {
            dir.wait_on_closures();
        }
    }

    /// Marks the dir failed and out of rotation. Idempotent. Returns
    /// `IOError` when the failure would leave no dir standing.
    pub fn mark_dir_failed(&self, uuid_idx: usize, reason: &str) -> Result<()> {
        assert!(uuid_idx < self.dirs.len());
        let mut maps = self.maps.write();
        if maps.failed_dirs.insert(uuid_idx) {
            if maps.failed_dirs.len() == self.dirs.len() {
                return Err(Error::io_error(
                    format!("all dirs have failed: {reason}"),
                    None,
                ));
            }
            let prefix = if reason.is_empty() {
                String::new()
            } else {
                format!("{reason}: ")
            };
            error!(
                "{prefix}directory {} marked as failed",
                self.dirs[uuid_idx].dir().display()
            );
        }
        Ok(())
    }

    pub fn mark_dir_failed_by_uuid(&self, uuid: &str, reason: &str) {
        let idx = self
            .find_uuid_index_by_uuid(uuid)
            .expect("unknown dir uuid");
        if let Err(e) = self.mark_dir_failed(idx, reason) {
            warn!(error = %e, "failed to handle disk failure");
        }
    }

    pub fn is_dir_failed(&self, uuid_idx: usize) -> bool {
        assert!(uuid_idx < self.dirs.len());
        self.maps.read().failed_dirs.contains(&uuid_idx)
    }

    pub fn get_failed_dirs(&self) -> BTreeSet<usize> {
        self.maps.read().failed_dirs.clone()
    }

    pub fn find_dir_by_uuid_index(&self, uuid_idx: usize) -> Option<Arc<Dir>> {
        self.dirs.get(uuid_idx).cloned()
    }

    pub fn find_uuid_index_by_uuid(&self, uuid: &str) -> Option<usize> {
        self.maps.read().idx_by_uuid.get(uuid).copied()
    }

    pub fn find_uuid_index_by_root(&self, root: &Path) -> Option<usize> {
        let maps = self.maps.read();
        let uuid = maps.uuid_by_root.get(root)?;
        maps.idx_by_uuid.get(uuid).copied()
    }

    pub fn find_uuid_by_root(&self, root: &Path) -> Option<String> {
        self.maps.read().uuid_by_root.get(root).cloned()
    }

    pub fn find_tablets_by_dir_uuid_idx(&self, uuid_idx: usize) -> BTreeSet<String> {
        assert!(uuid_idx < self.dirs.len());
        self.maps
            .read()
            .tablets_by_uuid_idx
            .get(&uuid_idx)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_tablet_to_dir(&self, uuid_idx: usize, tablet_id: &str) {
        let mut maps = self.maps.write();
        maps.tablets_by_uuid_idx
            .entry(uuid_idx)
            .or_default()
            .insert(tablet_id.to_owned());
    }

    pub fn remove_tablet_from_dir(&self, uuid_idx: usize, tablet_id: &str) {
        let mut maps = self.maps.write();
        if let Some(set) = maps.tablets_by_uuid_idx.get_mut(&uuid_idx) {
            set.remove(tablet_id);
        }
    }

    pub fn is_tablet_in_failed_dir(&self, tablet_id: &str) -> bool {
        let maps = self.maps.read();
        maps.failed_dirs.iter().any(|idx| {
            maps.tablets_by_uuid_idx
                .get(idx)
                .map(|set| set.contains(tablet_id))
                .unwrap_or(false)
        })
    }

    pub fn fs_report(&self) -> FsReport {
        let maps = self.maps.read();
        let mut report = FsReport::default();
        for (idx, dir) in self.dirs.iter().enumerate() {
            if maps.failed_dirs.contains(&idx) {
                report.failed_dirs.push(dir.dir().to_path_buf());
            } else if dir.is_full() {
                report.full_dirs.push(dir.dir().to_path_buf());
            }
        }
        report
    }

    /// Picks a healthy, non-full dir (most available space first) and
    /// returns a fresh block id placed on it.
    pub fn place_block(&self) -> Result<(usize, BlockId)> {
        let failed = self.get_failed_dirs();
        let mut best: Option<(usize, u64)> = None;
        for (idx, dir) in self.dirs.iter().enumerate() {
            if failed.contains(&idx) {
                continue;
            }
            if let Err(e) = dir.refresh_available_space(RefreshMode::ExpiredOnly) {
                if e.is_disk_failure() {
                    let _ = self.mark_dir_failed(idx, &e.to_string());
                    continue;
                }
                return Err(e);
            }
            if dir.is_full() {
                continue;
            }
            let avail = dir.available_bytes();
            if best.map(|(_, b)| avail > b).unwrap_or(true) {
                best = Some((idx, avail));
            }
        }
        let (idx, _) = best.ok_or_else(|| {
            Error::io_error("no healthy directory with available space", Some(libc::ENOSPC))
        })?;
        let block = BlockId {
            dir_uuid: self.dirs[idx].uuid(),
            name: Uuid::new_v4().to_string(),
        };
        Ok((idx, block))
    }

    /// Absolute path of a placed block.
    pub fn resolve_block(&self, block: &BlockId) -> Result<PathBuf> {
        let idx = self
            .find_uuid_index_by_uuid(&block.dir_uuid)
            .ok_or_else(|| Error::not_found(format!("no dir with uuid {}", block.dir_uuid)))?;
        Ok(self.dirs[idx].dir().join(&block.name))
    }

    pub fn delete_block(&self, block: &BlockId) -> Result<()> {
        let path = self.resolve_block(block)?;
        std::fs::remove_file(path)?;
        Ok(())
    }
}

impl Drop for DirManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn load_instances(
    roots: &[CanonicalizedRoot],
    opts: &DirManagerOptions,
) -> Result<Vec<DirInstanceFile>> {
    #[derive(PartialEq)]
    enum LockMode {
        None,
        Optional,
        Mandatory,
    }
    let lock_mode = if !opts.lock_dirs {
        LockMode::None
    } else if opts.read_only {
        LockMode::Optional
    } else {
        LockMode::Mandatory
    };
    let mut instances = Vec::with_capacity(roots.len());
    for root in roots {
        let dir = root.path.join(&opts.dir_type);
        let instance_path = dir.join(INSTANCE_FILE_NAME);
        let backup_uuid = Uuid::new_v4().to_string();
        let mut instance =
            DirInstanceFile::new(backup_uuid, opts.dir_type.clone(), instance_path.clone());
        match &root.status {
            Err(e) => instance.set_failed(e.clone()),
            Ok(()) => instance
                .load_from_disk()
                .map_err(|e| e.prepend(format!("could not load {}", instance_path.display())))?,
        }
        if instance.healthy() && lock_mode != LockMode::None {
            if let Err(e) = instance.acquire_lock() {
                match lock_mode {
                    LockMode::Optional => {
                        warn!(error = %e, "proceeding without lock");
                    }
                    _ => return Err(e),
                }
            }
        }
        instances.push(instance);
    }
    Ok(instances)
}

fn create_new_dirs_and_update_instances(
    instances: &mut [DirInstanceFile],
    opts: &DirManagerOptions,
) -> Result<()> {
    assert!(!opts.read_only);
    assert_ne!(opts.update_instances, UpdateInstanceBehavior::DontUpdate);

    let mut created_dirs: Vec<PathBuf> = vec![];
    let mut created_files: Vec<PathBuf> = vec![];
    let mut committed = false;
    let result = (|| -> Result<()> {
        // De-duplicate UUIDs across the instances; duplicates mean an
        // operator copied an instance file between roots.
        let mut all_uuids: Vec<String> = vec![];
        let mut seen = HashSet::new();
        for instance in instances.iter() {
            if seen.insert(instance.uuid().to_owned()) {
                all_uuids.push(instance.uuid().to_owned());
            }
        }
        if all_uuids.len() != instances.len() {
            return Err(Error::invalid_argument(format!(
                "instance files contain duplicate UUIDs: {} directories provided, {} unique \
                 UUIDs found ({})",
                instances.len(),
                all_uuids.len(),
                all_uuids.join(", ")
            )));
        }

        // Create instances that don't exist yet.
        for instance in instances.iter_mut() {
            if instance.healthy() {
                continue;
            }
            if instance.health_status().unwrap_err().is_not_found() {
                let created_dir = instance.create(&all_uuids)?;
                if created_dir {
                    created_dirs.push(instance.dir().to_path_buf());
                }
                created_files.push(instance.path().to_path_buf());
            }
        }

        // Rewrite healthy instances whose sibling set disagrees.
        let expected: BTreeSet<&str> = all_uuids.iter().map(String::as_str).collect();
        let to_update: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|(_, i)| {
                i.healthy()
                    && i.metadata()
                        .map(|m| {
                            let set: BTreeSet<&str> =
                                m.all_uuids.iter().map(String::as_str).collect();
                            set != expected
                        })
                        .unwrap_or(false)
            })
            .map(|(idx, _)| idx)
            .collect();
        if !to_update.is_empty() {
            update_healthy_instances(instances, &to_update, &all_uuids, opts.update_instances)?;
        }

        for f in &created_files {
            if let Err(e) = sync_parent_dir(f) {
                warn!(error = %e, "could not sync newly created data directories");
            }
        }
        Ok(())
    })();
    if result.is_ok() {
        committed = true;
    }
    if !committed {
        for f in &created_files {
            if let Err(e) = std::fs::remove_file(f) {
                warn!(file = %f.display(), error = %e, "could not delete file");
            }
        }
        for d in created_dirs.iter().rev() {
            if let Err(e) = std::fs::remove_dir(d) {
                warn!(dir = %d.display(), error = %e, "could not delete dir");
            }
        }
    }
    result
}

/// Rewrites the given instances with a new sibling set, backing each
/// file up to a `.grntmp` copy first. On full success the backups are
/// deleted; a mid-way failure restores from them. In
/// `UpdateAndErrorOnFailure` mode the first per-instance error
/// surfaces; otherwise failures leave the instance unhealthy and the
/// update continues. Backups that survive a botched run can also be
/// restored by hand.
fn update_healthy_instances(
    instances: &mut [DirInstanceFile],
    to_update: &[usize],
    new_all_uuids: &[String],
    behavior: UpdateInstanceBehavior,
) -> Result<()> {
    let mut copies_to_delete: Vec<PathBuf> = vec![];
    let mut copies_to_restore: Vec<(PathBuf, PathBuf)> = vec![];
    let mut committed = false;

    let result = (|| -> Result<()> {
        // Back up every instance before touching any of them, so a
        // failure while copying leaves nothing to restore.
        for &idx in to_update {
            let instance = &mut instances[idx];
            if !instance.healthy() {
                continue;
            }
            let original = instance.path().to_path_buf();
            let copy = PathBuf::from(format!("{}{}", original.display(), TMP_INFIX));
            match std::fs::copy(&original, &copy) {
                Ok(_) => copies_to_delete.push(copy),
                Err(e) => {
                    let e = Error::from(e).prepend("unable to backup existing instance file");
                    warn!(error = %e, "instance backup failed");
                    instance.set_failed(e);
                }
            }
        }

        for &idx in to_update {
            let instance = &mut instances[idx];
            if !instance.healthy() {
                continue;
            }
            let original = instance.path().to_path_buf();
            let copy = PathBuf::from(format!("{}{}", original.display(), TMP_INFIX));
            copies_to_delete.retain(|c| c != &copy);
            copies_to_restore.push((copy, original.clone()));
            if let Err(e) = instance.rewrite(new_all_uuids) {
                let e = e.prepend("unable to update instance file");
                warn!(instance = %original.display(), error = %e,
                      "unable to overwrite existing instance file");
                instance.set_failed(e);
            }
        }

        if behavior == UpdateInstanceBehavior::UpdateAndErrorOnFailure {
            for &idx in to_update {
                instances[idx]
                    .health_status()
                    .map_err(|e| e.prepend("at least one instance file failed to update"))?;
            }
        }
        Ok(())
    })();

    if result.is_ok() {
        committed = true;
        // Success: only the backups are left to remove.
        for (copy, _) in copies_to_restore.drain(..) {
            copies_to_delete.push(copy);
        }
    }
    for copy in &copies_to_delete {
        if let Err(e) = std::fs::remove_file(copy) {
            warn!(file = %copy.display(), error = %e, "could not delete file");
        }
    }
    if !committed {
        for (copy, original) in &copies_to_restore {
            if let Err(e) = std::fs::rename(copy, original) {
                warn!(from = %copy.display(), to = %original.display(), error = %e,
                      "could not restore instance file from backup");
            }
        }
    }
    result
}

fn delete_tmp_files_recursively(path: &Path) {
    let entries = match std::fs::read_dir(path) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %path.display(), error = %e, "error while deleting temp files");
            return;
        }
    };
    for entry in entries.flatten() {
        let p = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if p.is_dir() {
            delete_tmp_files_recursively(&p);
        } else if name.contains(TMP_INFIX) || name.ends_with(".tmp.new") {
            if let Err(e) = std::fs::remove_file(&p) {
                warn!(file = %p.display(), error = %e, "error while deleting temp files");
            }
        }
    }
}
