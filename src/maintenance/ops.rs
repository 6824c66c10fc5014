// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! The per-tablet maintenance ops: memstore flushes, delta
//! compactions, rowset merges, and log GC.

use std::sync::Arc;

use tracing::{error, warn};

use super::{set_perf_improvement_for_flush, IoUsage, MaintenanceOp, MaintenanceOpStats};
use crate::error::Result;
use crate::options::MaintenanceOptions;
use crate::schema::ColumnId;
use crate::tablet::Tablet;
use crate::types::Timestamp;
use crate::util::Semaphore;

/// Hook into the external write-ahead log service: how many bytes a
/// GC pass could reclaim, and the pass itself.
pub trait LogGcHandle: Send + Sync {
    fn gcable_size(&self) -> Result<u64>;

    /// Returns bytes reclaimed.
    fn run_gc(&self) -> Result<u64>;

    /// Log bytes retained only because memstores have not flushed.
    fn retained_for_memstores(&self) -> u64 {
        0
    }
}

/// The tablet plus its ambient services, shared by the ops.
pub struct TabletReplica {
    pub tablet: Arc<Tablet>,
    pub log: Option<Arc<dyn LogGcHandle>>,
    /// Priority taken from the tablet's configuration; breaks
    /// scheduling ties.
    pub maintenance_priority: i32,
}

impl TabletReplica {
    pub fn new(tablet: Arc<Tablet>) -> Arc<TabletReplica> {
        Arc::new(TabletReplica {
            tablet,
            log: None,
            maintenance_priority: 0,
        })
    }

    fn logs_retained(&self) -> u64 {
        self.log
            .as_ref()
            .map(|l| l.retained_for_memstores())
            .unwrap_or(0)
    }
}

/// A failed op is fatal to the tablet unless the tablet was stopped
/// underneath it.
fn check_op_result(tablet: &Tablet, what: &str, result: Result<impl Sized>) {
    if let Err(e) = result {
        warn!(tablet = %tablet.tablet_id(), error = %e, "failed to {what}");
        if !tablet.has_been_stopped() {
            error!(tablet = %tablet.tablet_id(), error = %e,
                   "unrecoverable {what} failure");
            panic!("unrecoverable {what} failure on tablet {}: {e}", tablet.tablet_id());
        }
    }
}

pub struct FlushMrsOp {
    replica: Arc<TabletReplica>,
    opts: MaintenanceOptions,
}

impl FlushMrsOp {
    pub fn new(replica: Arc<TabletReplica>, opts: MaintenanceOptions) -> FlushMrsOp {
        FlushMrsOp { replica, opts }
    }
}

impl MaintenanceOp for FlushMrsOp {
    fn name(&self) -> String {
        format!("FlushMRSOp({})", self.replica.tablet.tablet_id())
    }

    fn tablet_id(&self) -> String {
        self.replica.tablet.tablet_id().to_owned()
    }

    fn io_usage(&self) -> IoUsage {
        IoUsage::HighIo
    }

    fn priority(&self) -> i32 {
        self.replica.maintenance_priority
    }

    fn update_stats(&self, stats: &mut MaintenanceOpStats) {
        if !self.opts.enable_flush_memrowset {
            stats.runnable = false;
            return;
        }
        let tablet = &self.replica.tablet;
        if tablet.mem_rowset_empty() {
            return;
        }
        stats.runnable = !tablet.rowsets_flush_sem.is_held();
        stats.ram_anchored_bytes = tablet.mem_rowset_size() as u64;
        stats.logs_retained_bytes = self.replica.logs_retained();
        set_perf_improvement_for_flush(
            stats,
            tablet.mem_rowset_age().as_millis() as f64,
            &self.opts,
        );
    }

    fn prepare(&self) -> bool {
        self.replica.tablet.rowsets_flush_sem.try_acquire()
    }

    fn perform(&self) {
        let tablet = &self.replica.tablet;
        assert!(tablet.rowsets_flush_sem.is_held());
        let result = tablet.flush_unlocked();
        tablet.rowsets_flush_sem.release();
        check_op_result(tablet, "flush MRS", result);
    }
}

pub struct FlushDmsOp {
    replica: Arc<TabletReplica>,
    opts: MaintenanceOptions,
}

impl FlushDmsOp {
    pub fn new(replica: Arc<TabletReplica>, opts: MaintenanceOptions) -> FlushDmsOp {
        FlushDmsOp { replica, opts }
    }
}

impl MaintenanceOp for FlushDmsOp {
    fn name(&self) -> String {
        format!("FlushDeltaMemStoresOp({})", self.replica.tablet.tablet_id())
    }

    fn tablet_id(&self) -> String {
        self.replica.tablet.tablet_id().to_owned()
    }

    fn io_usage(&self) -> IoUsage {
        IoUsage::HighIo
    }

    fn priority(&self) -> i32 {
        self.replica.maintenance_priority
    }

    fn update_stats(&self, stats: &mut MaintenanceOpStats) {
        if !self.opts.enable_flush_deltamemstores {
            stats.runnable = false;
            return;
        }
        let tablet = &self.replica.tablet;
        let Some((dms_size, dms_age, _)) = tablet.find_best_dms_to_flush() else {
            return;
        };
        stats.runnable = true;
        stats.ram_anchored_bytes = dms_size as u64;
        stats.logs_retained_bytes = self.replica.logs_retained();
        set_perf_improvement_for_flush(stats, dms_age.as_millis() as f64, &self.opts);
    }

    fn perform(&self) {
        let tablet = &self.replica.tablet;
        let result = tablet.flush_best_dms();
        check_op_result(tablet, "flush DMS", result);
    }
}

pub struct LogGcOp {
    replica: Arc<TabletReplica>,
    opts: MaintenanceOptions,
    sem: Semaphore,
}

impl LogGcOp {
    pub fn new(replica: Arc<TabletReplica>, opts: MaintenanceOptions) -> LogGcOp {
        LogGcOp {
            replica,
            opts,
            sem: Semaphore::new(),
        }
    }
}

impl MaintenanceOp for LogGcOp {
    fn name(&self) -> String {
        format!("LogGCOp({})", self.replica.tablet.tablet_id())
    }

    fn tablet_id(&self) -> String {
        self.replica.tablet.tablet_id().to_owned()
    }

    fn io_usage(&self) -> IoUsage {
        IoUsage::LowIo
    }

    fn priority(&self) -> i32 {
        self.replica.maintenance_priority
    }

    fn update_stats(&self, stats: &mut MaintenanceOpStats) {
        if !self.opts.enable_log_gc {
            stats.runnable = false;
            return;
        }
        let Some(log) = self.replica.log.as_ref() else {
            return;
        };
        let Ok(gcable) = log.gcable_size() else {
            return;
        };
        stats.logs_retained_bytes = gcable;
        stats.runnable = !self.sem.is_held();
    }

    fn prepare(&self) -> bool {
        self.sem.try_acquire()
    }

    fn perform(&self) {
        assert!(self.sem.is_held());
        if let Some(log) = self.replica.log.as_ref() {
            if let Err(e) = log.run_gc() {
                warn!(tablet = %self.replica.tablet.tablet_id(), error = %e, "log GC failed");
            }
        }
        self.sem.release();
    }
}

pub struct MinorDeltaCompactionOp {
    replica: Arc<TabletReplica>,
}

impl MinorDeltaCompactionOp {
    pub fn new(replica: Arc<TabletReplica>) -> MinorDeltaCompactionOp {
        MinorDeltaCompactionOp { replica }
    }
}

impl MaintenanceOp for MinorDeltaCompactionOp {
    fn name(&self) -> String {
        format!(
            "MinorDeltaCompactionOp({})",
            self.replica.tablet.tablet_id()
        )
    }

    fn tablet_id(&self) -> String {
        self.replica.tablet.tablet_id().to_owned()
    }

    fn io_usage(&self) -> IoUsage {
        IoUsage::HighIo
    }

    fn priority(&self) -> i32 {
        self.replica.maintenance_priority
    }

    fn update_stats(&self, stats: &mut MaintenanceOpStats) {
        let count = self.replica.tablet.max_redo_file_count();
        if count >= 2 {
            stats.runnable = true;
            // Merging a deep stack saves a file open and a merge step
            // per read, per extra file.
            stats.perf_improvement = (count - 1) as f64 / 10.0;
        }
    }

    fn perform(&self) {
        let tablet = &self.replica.tablet;
        let result = tablet.minor_compact_deltas();
        check_op_result(tablet, "minor-compact deltas", result);
    }
}

pub struct MajorDeltaCompactionOp {
    replica: Arc<TabletReplica>,
    columns: Vec<ColumnId>,
}

impl MajorDeltaCompactionOp {
    pub fn new(replica: Arc<TabletReplica>) -> MajorDeltaCompactionOp {
        let columns = replica
            .tablet
            .schema()
            .columns()
            .iter()
            .filter_map(|c| c.id)
            .collect();
        MajorDeltaCompactionOp { replica, columns }
    }
}

impl MaintenanceOp for MajorDeltaCompactionOp {
    fn name(&self) -> String {
        format!(
            "MajorDeltaCompactionOp({})",
            self.replica.tablet.tablet_id()
        )
    }

    fn tablet_id(&self) -> String {
        self.replica.tablet.tablet_id().to_owned()
    }

    fn io_usage(&self) -> IoUsage {
        IoUsage::HighIo
    }

    fn priority(&self) -> i32 {
        self.replica.maintenance_priority
    }

    fn update_stats(&self, stats: &mut MaintenanceOpStats) {
        let (updates, base_rows) = self.replica.tablet.update_to_base_ratio_inputs();
        if base_rows == 0 || updates == 0 {
            return;
        }
        stats.runnable = true;
        // Score by how much of the base a scan must patch.
        stats.perf_improvement = (updates as f64 / base_rows as f64).min(1.0);
    }

    fn perform(&self) {
        let tablet = &self.replica.tablet;
        let frontier = tablet.latest_snapshot();
        let result = tablet.major_compact_deltas(&self.columns, frontier);
        check_op_result(tablet, "major-compact deltas", result);
    }
}

pub struct CompactRowSetsOp {
    replica: Arc<TabletReplica>,
    ancient_history_mark: Timestamp,
}

impl CompactRowSetsOp {
    pub fn new(replica: Arc<TabletReplica>, ancient_history_mark: Timestamp) -> CompactRowSetsOp {
        CompactRowSetsOp {
            replica,
            ancient_history_mark,
        }
    }
}

impl MaintenanceOp for CompactRowSetsOp {
    fn name(&self) -> String {
        format!("CompactRowSetsOp({})", self.replica.tablet.tablet_id())
    }

    fn tablet_id(&self) -> String {
        self.replica.tablet.tablet_id().to_owned()
    }

    fn io_usage(&self) -> IoUsage {
        IoUsage::HighIo
    }

    fn priority(&self) -> i32 {
        self.replica.maintenance_priority
    }

    fn update_stats(&self, stats: &mut MaintenanceOpStats) {
        let tablet = &self.replica.tablet;
        let overlapping = tablet.overlapping_rowset_count();
        if overlapping >= 2 && !tablet.rowsets_flush_sem.is_held() {
            stats.runnable = true;
            stats.perf_improvement = (overlapping - 1) as f64 * 0.1;
        }
    }

    fn prepare(&self) -> bool {
        self.replica.tablet.rowsets_flush_sem.try_acquire()
    }

    fn perform(&self) {
        let tablet = &self.replica.tablet;
        assert!(tablet.rowsets_flush_sem.is_held());
        let result = tablet.compact_unlocked(self.ancient_history_mark);
        tablet.rowsets_flush_sem.release();
        check_op_result(tablet, "compact rowsets", result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{DirManager, DirManagerOptions};
    use crate::maintenance::{MaintenanceManager, MaintenanceOp};
    use crate::schema::{ColumnSchema, Schema};
    use crate::tablet::TabletOptions;
    use crate::types::{DataType, OpId, Value};
    use std::time::Duration;

    fn open_tablet(tmp: &tempfile::TempDir) -> Arc<Tablet> {
        let root = tmp.path().join("r1");
        std::fs::create_dir_all(&root).unwrap();
        let roots = vec![root];
        let _ = DirManager::create(&roots, DirManagerOptions::new("data"));
        let dm = Arc::new(DirManager::open(&roots, DirManagerOptions::new("data")).unwrap());
        let schema = Schema::new(
            vec![
                ColumnSchema::new("id", DataType::Int32),
                ColumnSchema::new("payload", DataType::String),
            ],
            1,
        )
        .unwrap()
        .with_assigned_ids();
        Tablet::open(
            "mm-tablet",
            schema,
            dm,
            None,
            &tmp.path().join("meta"),
            TabletOptions::default(),
        )
        .unwrap()
    }

    fn fill_past_one_mib(tablet: &Arc<Tablet>) {
        let payload = "x".repeat(1024);
        let mut i = 0;
        while tablet.mem_rowset_size() < 1024 * 1024 {
            tablet
                .insert(
                    OpId { term: 1, index: i },
                    vec![Value::I32(i as i32), Value::from_str_slice(&payload)],
                )
                .unwrap();
            i += 1;
        }
    }

    #[test]
    fn test_flush_op_scores_above_one_under_pressure() {
        let tmp = tempfile::tempdir().unwrap();
        let tablet = open_tablet(&tmp);
        fill_past_one_mib(&tablet);
        let opts = MaintenanceOptions {
            flush_threshold_mb: 1,
            ..MaintenanceOptions::default()
        };
        let op = FlushMrsOp::new(TabletReplica::new(tablet.clone()), opts);
        let mut stats = MaintenanceOpStats::default();
        op.update_stats(&mut stats);
        assert!(stats.runnable);
        assert!(stats.perf_improvement >= 1.0);
    }

    #[test]
    fn test_scheduler_flushes_under_memory_pressure() {
        let tmp = tempfile::tempdir().unwrap();
        let tablet = open_tablet(&tmp);
        fill_past_one_mib(&tablet);
        let opts = MaintenanceOptions {
            flush_threshold_mb: 1,
            polling_interval: Duration::from_millis(10),
            ..MaintenanceOptions::default()
        };
        let mgr = MaintenanceManager::start(opts.clone());
        mgr.register_op(Arc::new(FlushMrsOp::new(
            TabletReplica::new(tablet.clone()),
            opts,
        )));
        for _ in 0..300 {
            if tablet.rowset_count() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(tablet.rowset_count(), 1, "scheduler did not flush");
        assert!(tablet.mem_rowset_empty());
        mgr.shutdown();
    }

    #[test]
    fn test_flush_op_respects_disable_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let tablet = open_tablet(&tmp);
        fill_past_one_mib(&tablet);
        let opts = MaintenanceOptions {
            enable_flush_memrowset: false,
            ..MaintenanceOptions::default()
        };
        let op = FlushMrsOp::new(TabletReplica::new(tablet), opts);
        let mut stats = MaintenanceOpStats::default();
        op.update_stats(&mut stats);
        assert!(!stats.runnable);
    }

    #[test]
    fn test_flush_op_prepare_conflicts_with_held_semaphore() {
        let tmp = tempfile::tempdir().unwrap();
        let tablet = open_tablet(&tmp);
        fill_past_one_mib(&tablet);
        let op = FlushMrsOp::new(
            TabletReplica::new(tablet.clone()),
            MaintenanceOptions::default(),
        );
        assert!(tablet.rowsets_flush_sem.try_acquire());
        assert!(!op.prepare());
        tablet.rowsets_flush_sem.release();
        assert!(op.prepare());
        op.perform();
        assert!(tablet.mem_rowset_empty());
    }

    struct CountingLog {
        gcable: u64,
    }

    impl LogGcHandle for CountingLog {
        fn gcable_size(&self) -> crate::error::Result<u64> {
            Ok(self.gcable)
        }

        fn run_gc(&self) -> crate::error::Result<u64> {
            Ok(self.gcable)
        }
    }

    #[test]
    fn test_log_gc_op_uses_its_own_semaphore() {
        let tmp = tempfile::tempdir().unwrap();
        let tablet = open_tablet(&tmp);
        let replica = Arc::new(TabletReplica {
            tablet,
            log: Some(Arc::new(CountingLog { gcable: 1 << 30 })),
            maintenance_priority: 0,
        });
        let op = LogGcOp::new(replica, MaintenanceOptions::default());
        let mut stats = MaintenanceOpStats::default();
        op.update_stats(&mut stats);
        assert!(stats.runnable);
        assert_eq!(stats.logs_retained_bytes, 1 << 30);
        assert!(op.prepare());
        // Not runnable while a pass is in flight.
        let mut stats = MaintenanceOpStats::default();
        op.update_stats(&mut stats);
        assert!(!stats.runnable);
        op.perform();
        assert!(op.prepare());
        op.sem.release();
    }
}
