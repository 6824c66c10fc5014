// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Maintenance scheduling: scores flush/compaction/GC ops and runs
//! the best candidate on a bounded pool.

mod ops;

pub use ops::{
    CompactRowSetsOp, FlushDmsOp, FlushMrsOp, LogGcHandle, LogGcOp, MajorDeltaCompactionOp,
    MinorDeltaCompactionOp, TabletReplica,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::options::MaintenanceOptions;
use crate::util::{ThreadPool, ThreadPoolBuilder};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoUsage {
    LowIo,
    HighIo,
}

/// Stats an op reports each scheduling cycle.
#[derive(Clone, Debug, Default)]
pub struct MaintenanceOpStats {
    pub runnable: bool,
    pub ram_anchored_bytes: u64,
    pub logs_retained_bytes: u64,
    pub perf_improvement: f64,
    pub workload_score: f64,
}

/// One schedulable unit of background work against a tablet.
pub trait MaintenanceOp: Send + Sync {
    fn name(&self) -> String;

    /// Tie-break key after priority.
    fn tablet_id(&self) -> String;

    fn io_usage(&self) -> IoUsage;

    /// Taken from the tablet's metadata; higher wins ties.
    fn priority(&self) -> i32 {
        0
    }

    fn update_stats(&self, stats: &mut MaintenanceOpStats);

    /// Acquires the op's locks without blocking. A false return skips
    /// the op for this cycle.
    fn prepare(&self) -> bool {
        true
    }

    /// Runs the op under the locks `prepare` took.
    fn perform(&self);
}

/// The flush scoring policy: over the size threshold, one point per
/// extra MB (at least 1.0); otherwise a time-based score growing
/// toward 1.0 as the memstore ages toward the upper bound.
pub fn set_perf_improvement_for_flush(
    stats: &mut MaintenanceOpStats,
    elapsed_ms: f64,
    opts: &MaintenanceOptions,
) {
    let anchored_mb = stats.ram_anchored_bytes as f64 / (1024.0 * 1024.0);
    let threshold_mb = opts.flush_threshold_mb as f64;
    let upper_bound_ms = opts.flush_upper_bound_ms as f64;
    if anchored_mb >= threshold_mb {
        let extra_mb = anchored_mb - threshold_mb;
        stats.perf_improvement = extra_mb.max(1.0);
    } else if elapsed_ms > opts.flush_threshold_secs as f64 * 1000.0 {
        let perf = (elapsed_ms / upper_bound_ms).max(anchored_mb / threshold_mb);
        stats.perf_improvement = perf.min(1.0);
    }
}

/// Weight turning retained log bytes into score points.
const LOGS_RETAINED_SCORE_PER_GB: f64 = 1.0;

fn effective_score(stats: &MaintenanceOpStats) -> f64 {
    stats.perf_improvement
        + stats.workload_score
        + stats.logs_retained_bytes as f64 / (1024.0 * 1024.0 * 1024.0) * LOGS_RETAINED_SCORE_PER_GB
}

struct ManagerInner {
    ops: Mutex<Vec<Arc<dyn MaintenanceOp>>>,
    pool: Arc<ThreadPool>,
    shutdown: Mutex<bool>,
    cv: Condvar,
    opts: MaintenanceOptions,
    running: AtomicUsize,
}

/// Polls the registered ops, picks the best runnable one, and runs it
/// on a bounded pool.
pub struct MaintenanceManager {
    inner: Arc<ManagerInner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceManager {
    pub fn start(opts: MaintenanceOptions) -> MaintenanceManager {
        let pool = Arc::new(
            ThreadPoolBuilder::new("maintenance")
                .max_threads(opts.num_maintenance_threads.max(1))
                .build(),
        );
        let inner = Arc::new(ManagerInner {
            ops: Mutex::new(vec![]),
            pool,
            shutdown: Mutex::new(false),
            cv: Condvar::new(),
            opts,
            running: AtomicUsize::new(0),
        });
        let loop_inner = inner.clone();
        let scheduler = std::thread::Builder::new()
            .name("maintenance-scheduler".to_owned())
            .spawn(move || scheduler_loop(&loop_inner))
            .expect("failed to spawn maintenance scheduler");
        MaintenanceManager {
            inner,
            scheduler: Mutex::new(Some(scheduler)),
        }
    }

    pub fn register_op(&self, op: Arc<dyn MaintenanceOp>) {
        self.inner.ops.lock().push(op);
    }

    pub fn unregister_op(&self, name: &str) {
        self.inner.ops.lock().retain(|op| op.name() != name);
    }

    pub fn running_ops(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stops the scheduler and waits for in-flight ops.
    pub fn shutdown(&self) {
        {
            let mut down = self.inner.shutdown.lock();
            if *down {
                return;
            }
            *down = true;
            self.inner.cv.notify_all();
        }
        if let Some(handle) = self.scheduler.lock().take() {
            let _ = handle.join();
        }
        self.inner.pool.shutdown();
    }

    /// One scheduling decision, exposed for tests: the best runnable
    /// op's name and score, if any.
    pub fn best_op_for_test(&self) -> Option<(String, f64)> {
        find_best_op(&self.inner).map(|(op, score)| (op.name(), score))
    }
}

impl Drop for MaintenanceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn find_best_op(inner: &ManagerInner) -> Option<(Arc<dyn MaintenanceOp>, f64)> {
    let ops = inner.ops.lock().clone();
    let mut best: Option<(Arc<dyn MaintenanceOp>, f64)> = None;
    for op in ops {
        let mut stats = MaintenanceOpStats::default();
        op.update_stats(&mut stats);
        if !stats.runnable {
            continue;
        }
        let score = effective_score(&stats);
        if score <= 0.0 {
            continue;
        }
        let better = match &best {
            None => true,
            Some((cur, cur_score)) => {
                // Higher score wins; ties go to priority, then to the
                // lexically-smaller tablet id for determinism.
                score > *cur_score
                    || (score == *cur_score
                        && (op.priority() > cur.priority()
                            || (op.priority() == cur.priority()
                                && op.tablet_id() < cur.tablet_id())))
            }
        };
        if better {
            best = Some((op, score));
        }
    }
    best
}

fn scheduler_loop(inner: &Arc<ManagerInner>) {
    loop {
        {
            let mut down = inner.shutdown.lock();
            if *down {
                return;
            }
            let _ = inner
                .cv
                .wait_for(&mut down, inner.opts.polling_interval);
            if *down {
                return;
            }
        }
        let Some((op, score)) = find_best_op(inner) else {
            continue;
        };
        if !op.prepare() {
            // Lock contention: skip this cycle.
            continue;
        }
        debug!(op = %op.name(), score, "scheduling maintenance op");
        inner.running.fetch_add(1, Ordering::SeqCst);
        let run_inner = inner.clone();
        let submitted = inner.pool.submit(move || {
            op.perform();
            run_inner.running.fetch_sub(1, Ordering::SeqCst);
        });
        if let Err(e) = submitted {
            inner.running.fetch_sub(1, Ordering::SeqCst);
            warn!(error = %e, "could not submit maintenance op");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    struct TestOp {
        name: String,
        score: f64,
        priority: i32,
        runnable: AtomicBool,
        performed: Arc<AtomicUsize>,
    }

    impl TestOp {
        fn new(name: &str, score: f64, priority: i32) -> TestOp {
            TestOp {
                name: name.to_owned(),
                score,
                priority,
                runnable: AtomicBool::new(true),
                performed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl MaintenanceOp for TestOp {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn tablet_id(&self) -> String {
            self.name.clone()
        }

        fn io_usage(&self) -> IoUsage {
            IoUsage::LowIo
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn update_stats(&self, stats: &mut MaintenanceOpStats) {
            stats.runnable = self.runnable.load(Ordering::SeqCst);
            stats.perf_improvement = self.score;
        }

        fn perform(&self) {
            self.performed.fetch_add(1, Ordering::SeqCst);
            self.runnable.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_flush_policy_over_threshold() {
        let opts = MaintenanceOptions {
            flush_threshold_mb: 1,
            ..MaintenanceOptions::default()
        };
        let mut stats = MaintenanceOpStats {
            ram_anchored_bytes: 3 * 1024 * 1024,
            ..Default::default()
        };
        set_perf_improvement_for_flush(&mut stats, 0.0, &opts);
        assert!(stats.perf_improvement >= 1.0);
        assert_eq!(stats.perf_improvement, 2.0);
    }

    #[test]
    fn test_flush_policy_time_based() {
        let opts = MaintenanceOptions::default();
        let mut stats = MaintenanceOpStats {
            ram_anchored_bytes: 1024,
            ..Default::default()
        };
        // Young and small: no score at all.
        set_perf_improvement_for_flush(&mut stats, 1000.0, &opts);
        assert_eq!(stats.perf_improvement, 0.0);
        // Old enough: a sub-1.0 score that grows with age.
        set_perf_improvement_for_flush(&mut stats, 130_000.0, &opts);
        assert!(stats.perf_improvement > 0.0);
        assert!(stats.perf_improvement <= 1.0);
        let with_130s = stats.perf_improvement;
        set_perf_improvement_for_flush(&mut stats, 1_000_000.0, &opts);
        assert!(stats.perf_improvement > with_130s);
    }

    #[test]
    fn test_best_op_selection_and_tie_breaks() {
        let mgr = MaintenanceManager::start(MaintenanceOptions {
            polling_interval: Duration::from_secs(3600),
            ..MaintenanceOptions::default()
        });
        mgr.register_op(Arc::new(TestOp::new("b-low", 1.0, 0)));
        mgr.register_op(Arc::new(TestOp::new("a-high", 2.0, 0)));
        assert_eq!(mgr.best_op_for_test().unwrap().0, "a-high");

        // Equal scores: priority breaks the tie.
        let mgr = MaintenanceManager::start(MaintenanceOptions {
            polling_interval: Duration::from_secs(3600),
            ..MaintenanceOptions::default()
        });
        mgr.register_op(Arc::new(TestOp::new("b", 1.0, 5)));
        mgr.register_op(Arc::new(TestOp::new("a", 1.0, 1)));
        assert_eq!(mgr.best_op_for_test().unwrap().0, "b");

        // Equal everything: tablet id decides, deterministically.
        let mgr = MaintenanceManager::start(MaintenanceOptions {
            polling_interval: Duration::from_secs(3600),
            ..MaintenanceOptions::default()
        });
        mgr.register_op(Arc::new(TestOp::new("z", 1.0, 0)));
        mgr.register_op(Arc::new(TestOp::new("m", 1.0, 0)));
        assert_eq!(mgr.best_op_for_test().unwrap().0, "m");
    }

    #[test]
    fn test_scheduler_runs_best_op() {
        let mgr = MaintenanceManager::start(MaintenanceOptions {
            polling_interval: Duration::from_millis(10),
            ..MaintenanceOptions::default()
        });
        let op = Arc::new(TestOp::new("flush", 5.0, 0));
        let performed = op.performed.clone();
        mgr.register_op(op);
        for _ in 0..100 {
            if performed.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(performed.load(Ordering::SeqCst), 1);
        mgr.shutdown();
    }

    #[test]
    fn test_unrunnable_ops_are_skipped() {
        let mgr = MaintenanceManager::start(MaintenanceOptions {
            polling_interval: Duration::from_secs(3600),
            ..MaintenanceOptions::default()
        });
        let op = Arc::new(TestOp::new("idle", 5.0, 0));
        op.runnable.store(false, Ordering::SeqCst);
        mgr.register_op(op);
        assert!(mgr.best_op_for_test().is_none());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mgr = MaintenanceManager::start(MaintenanceOptions::default());
        mgr.shutdown();
        mgr.shutdown();
    }
}
