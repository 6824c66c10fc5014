// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Bounded worker pool with serial/concurrent submission tokens.
//!
//! A [`ThreadPoolToken`] scopes a stream of submissions onto a shared
//! pool. SERIAL tokens run at most one of their tasks at a time, in
//! FIFO order; CONCURRENT tokens share only accounting. Tasks submitted
//! without a token go through the pool's global queue.
//!
//! The optional queue load meter reports sustained queueing so callers
//! can shed work before the queue grows without bound.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenMode {
    /// One task at a time, FIFO per token.
    Serial,
    /// Tasks run in parallel; the token only groups them for wait and
    /// shutdown accounting.
    Concurrent,
}

/// Lifecycle of a token. `Quiesced` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenState {
    Idle,
    Running,
    /// `close()` was called: no new submissions, queued tasks drain.
    GracefulQuiescing,
    /// `shutdown()` was called: queued tasks were dropped, in-flight
    /// tasks are finishing.
    Quiescing,
    Quiesced,
}

struct QueuedTask {
    work: Task,
    submit_time: Instant,
    token_id: Option<u64>,
}

enum Dispatch {
    /// A tokenless or concurrent-token task, runnable directly.
    Task(QueuedTask),
    /// A serial token with at least one queued task at dispatch time.
    SerialToken(u64),
}

struct TokenEntry {
    mode: TokenMode,
    state: TokenState,
    /// Pending tasks of a serial token. Concurrent tokens queue
    /// directly on the run queue.
    queue: VecDeque<QueuedTask>,
    /// Tasks of a concurrent token sitting on the run queue.
    pending: usize,
    active: usize,
    /// True while a serial token sits on the run queue.
    scheduled: bool,
}

impl TokenEntry {
    fn may_submit(&self) -> bool {
        matches!(self.state, TokenState::Idle | TokenState::Running)
    }

    fn quiescing(&self) -> bool {
        matches!(
            self.state,
            TokenState::GracefulQuiescing | TokenState::Quiescing
        )
    }

    fn drained(&self) -> bool {
        self.queue.is_empty() && self.pending == 0 && self.active == 0 && !self.scheduled
    }
}

struct PoolState {
    run_queue: VecDeque<Dispatch>,
    tokens: HashMap<u64, TokenEntry>,
    next_token_id: u64,
    /// Tasks waiting anywhere: run queue plus serial token queues.
    total_queued: usize,
    active_tasks: usize,
    shutdown: bool,
    /// Recent (dequeue time, time spent queued) records for the load
    /// meter.
    queue_time_history: VecDeque<(Instant, Duration)>,
}

const QUEUE_TIME_HISTORY_LEN: usize = 64;
/// Minimum number of recent records before the historical window alone
/// may declare overload.
const QUEUE_TIME_HISTORY_MIN_SAMPLES: usize = 3;

struct PoolInner {
    name: String,
    max_queue_size: usize,
    overload_threshold: Option<Duration>,
    state: Mutex<PoolState>,
    work_cv: Condvar,
    idle_cv: Condvar,
    token_cv: Condvar,
}

/// Fixed-size worker pool. Dropping the pool shuts it down.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

pub struct ThreadPoolBuilder {
    name: String,
    max_threads: usize,
    max_queue_size: usize,
    overload_threshold: Option<Duration>,
}

impl ThreadPoolBuilder {
    pub fn new(name: impl Into<String>) -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            name: name.into(),
            max_threads: 1,
            max_queue_size: usize::MAX,
            overload_threshold: None,
        }
    }

    pub fn max_threads(mut self, n: usize) -> ThreadPoolBuilder {
        assert!(n > 0);
        self.max_threads = n;
        self
    }

    pub fn max_queue_size(mut self, n: usize) -> ThreadPoolBuilder {
        self.max_queue_size = n;
        self
    }

    pub fn queue_overload_threshold(mut self, threshold: Duration) -> ThreadPoolBuilder {
        self.overload_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> ThreadPool {
        let inner = Arc::new(PoolInner {
            name: self.name.clone(),
            max_queue_size: self.max_queue_size,
            overload_threshold: self.overload_threshold,
            state: Mutex::new(PoolState {
                run_queue: VecDeque::new(),
                tokens: HashMap::new(),
                next_token_id: 0,
                total_queued: 0,
                active_tasks: 0,
                shutdown: false,
                queue_time_history: VecDeque::new(),
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            token_cv: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(self.max_threads);
        for i in 0..self.max_threads {
            let inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{} [worker {i}]", self.name))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }
        ThreadPool {
            inner,
            workers: Mutex::new(workers),
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    let mut state = inner.state.lock();
    loop {
        while state.run_queue.is_empty() && !state.shutdown {
            inner.work_cv.wait(&mut state);
        }
        if state.run_queue.is_empty() && state.shutdown {
            return;
        }
        match state.run_queue.pop_front().unwrap() {
            Dispatch::Task(qt) => {
                state.total_queued -= 1;
                state.active_tasks += 1;
                if let Some(id) = qt.token_id {
                    if let Some(entry) = state.tokens.get_mut(&id) {
                        entry.pending -= 1;
                        entry.active += 1;
                        if entry.state == TokenState::Idle {
                            entry.state = TokenState::Running;
                        }
                    }
                }
                record_queue_time(&mut state, qt.submit_time);
                drop(state);
                (qt.work)();
                state = inner.state.lock();
                state.active_tasks -= 1;
                if let Some(id) = qt.token_id {
                    finish_token_task(&mut state, id);
                }
                notify_idle(inner, &state);
                inner.token_cv.notify_all();
            }
            Dispatch::SerialToken(id) => {
                let Some(entry) = state.tokens.get_mut(&id) else {
                    continue;
                };
                let Some(qt) = entry.queue.pop_front() else {
                    // Queue was cleared by shutdown() after dispatch.
                    entry.scheduled = false;
                    if entry.quiescing() && entry.active == 0 {
                        entry.state = TokenState::Quiesced;
                    }
                    inner.token_cv.notify_all();
                    continue;
                };
                entry.active += 1;
                entry.state = TokenState::Running;
                state.total_queued -= 1;
                state.active_tasks += 1;
                record_queue_time(&mut state, qt.submit_time);
                drop(state);
                (qt.work)();
                state = inner.state.lock();
                state.active_tasks -= 1;
                let shutdown = state.shutdown;
                let st = &mut *state;
                if let Some(entry) = st.tokens.get_mut(&id) {
                    entry.active -= 1;
                    let more = !entry.queue.is_empty()
                        && entry.state != TokenState::Quiescing
                        && !shutdown;
                    if more {
                        st.run_queue.push_back(Dispatch::SerialToken(id));
                        inner.work_cv.notify_one();
                    } else {
                        entry.scheduled = false;
                        entry.state = if entry.quiescing() {
                            TokenState::Quiesced
                        } else {
                            TokenState::Idle
                        };
                    }
                }
                notify_idle(inner, &state);
                inner.token_cv.notify_all();
            }
        }
    }
}

fn finish_token_task(state: &mut PoolState, id: u64) {
    if let Some(entry) = state.tokens.get_mut(&id) {
        entry.active -= 1;
        if entry.active == 0 && entry.pending == 0 {
            entry.state = match entry.state {
                TokenState::Running => TokenState::Idle,
                TokenState::GracefulQuiescing | TokenState::Quiescing => TokenState::Quiesced,
                s => s,
            };
        }
    }
}

fn notify_idle(inner: &PoolInner, state: &PoolState) {
    if state.total_queued == 0 && state.active_tasks == 0 {
        inner.idle_cv.notify_all();
    }
}

fn record_queue_time(state: &mut PoolState, submit_time: Instant) {
    let now = Instant::now();
    state
        .queue_time_history
        .push_back((now, now.duration_since(submit_time)));
    if state.queue_time_history.len() > QUEUE_TIME_HISTORY_LEN {
        state.queue_time_history.pop_front();
    }
}

impl ThreadPool {
    /// Submits a task through the pool's global queue.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, f: F) -> Result<()> {
        self.do_submit(Box::new(f), None)
    }

    fn do_submit(&self, work: Task, token_id: Option<u64>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(Error::service_unavailable(format!(
                "pool {} is shut down",
                self.inner.name
            )));
        }
        if state.total_queued >= self.inner.max_queue_size {
            return Err(Error::service_unavailable(format!(
                "pool {} queue is full ({} tasks)",
                self.inner.name, state.total_queued
            )));
        }
        let qt = QueuedTask {
            work,
            submit_time: Instant::now(),
            token_id,
        };
        match token_id {
            None => state.run_queue.push_back(Dispatch::Task(qt)),
            Some(id) => {
                let entry = state.tokens.get_mut(&id).expect("token entry missing");
                if !entry.may_submit() {
                    return Err(Error::service_unavailable("token is shut down"));
                }
                match entry.mode {
                    TokenMode::Concurrent => {
                        entry.pending += 1;
                        state.run_queue.push_back(Dispatch::Task(qt));
                    }
                    TokenMode::Serial => {
                        entry.queue.push_back(qt);
                        if !entry.scheduled && entry.active == 0 {
                            entry.scheduled = true;
                            state.run_queue.push_back(Dispatch::SerialToken(id));
                        }
                    }
                }
            }
        }
        state.total_queued += 1;
        self.inner.work_cv.notify_one();
        Ok(())
    }

    /// Blocks until no tasks are queued or running.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while state.total_queued > 0 || state.active_tasks > 0 {
            self.inner.idle_cv.wait(&mut state);
        }
    }

    /// Stops accepting work, drops queued tasks, and joins the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            // SerialToken dispatch entries carry no task of their own;
            // the tasks they stand for live in the token queues.
            let dropped = state
                .run_queue
                .iter()
                .filter(|d| matches!(d, Dispatch::Task(_)))
                .count();
            state.run_queue.clear();
            let mut token_dropped = 0;
            for entry in state.tokens.values_mut() {
                token_dropped += entry.queue.len();
                entry.queue.clear();
                entry.pending = 0;
                entry.scheduled = false;
                if entry.active == 0 {
                    entry.state = TokenState::Quiesced;
                } else if !entry.quiescing() {
                    entry.state = TokenState::Quiescing;
                }
            }
            state.total_queued = state.total_queued.saturating_sub(dropped + token_dropped);
            self.inner.work_cv.notify_all();
            self.inner.idle_cv.notify_all();
            self.inner.token_cv.notify_all();
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for w in workers {
            if w.join().is_err() {
                warn!(pool = %self.inner.name, "pool worker panicked");
            }
        }
    }

    /// Creates a new submission token in the given mode.
    pub fn new_token(self: &Arc<Self>, mode: TokenMode) -> ThreadPoolToken {
        let mut state = self.inner.state.lock();
        let id = state.next_token_id;
        state.next_token_id += 1;
        state.tokens.insert(
            id,
            TokenEntry {
                mode,
                state: TokenState::Idle,
                queue: VecDeque::new(),
                pending: 0,
                active: 0,
                scheduled: false,
            },
        );
        ThreadPoolToken {
            pool: self.clone(),
            id,
            mode,
        }
    }

    /// True when the pool has been queueing work for longer than the
    /// configured overload threshold.
    ///
    /// The primary signal is the age of the oldest queued task
    /// (including serial token queues). When nothing is visibly queued
    /// but tasks are still in flight, a recent history of long queue
    /// times keeps the meter latched: active serial tasks leave the
    /// visible queue empty.
    pub fn queue_overloaded(&self) -> bool {
        let Some(threshold) = self.inner.overload_threshold else {
            return false;
        };
        let state = self.inner.state.lock();
        let now = Instant::now();
        let mut oldest: Option<Instant> = None;
        let mut consider = |t: Instant| {
            oldest = Some(match oldest {
                Some(cur) if cur <= t => cur,
                _ => t,
            });
        };
        for d in &state.run_queue {
            if let Dispatch::Task(qt) = d {
                consider(qt.submit_time);
            }
        }
        for entry in state.tokens.values() {
            if let Some(qt) = entry.queue.front() {
                consider(qt.submit_time);
            }
        }
        if let Some(t) = oldest {
            if now.duration_since(t) > threshold {
                return true;
            }
        }
        if state.total_queued == 0 && state.active_tasks == 0 {
            return false;
        }
        let window = threshold.saturating_mul(4);
        let recent: Vec<_> = state
            .queue_time_history
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= window)
            .collect();
        recent.len() >= QUEUE_TIME_HISTORY_MIN_SAMPLES
            && recent.iter().all(|(_, queued)| *queued > threshold)
    }

    #[cfg(test)]
    fn queued_and_active(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (state.total_queued, state.active_tasks)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A handle scoping submissions onto a shared [`ThreadPool`].
///
/// Dropping the token shuts it down. The token's bookkeeping lives in
/// the pool, so in-flight tasks may safely outlive the handle.
pub struct ThreadPoolToken {
    pool: Arc<ThreadPool>,
    id: u64,
    mode: TokenMode,
}

impl ThreadPoolToken {
    pub fn mode(&self) -> TokenMode {
        self.mode
    }

    pub fn submit<F: FnOnce() + Send + 'static>(&self, f: F) -> Result<()> {
        self.pool.do_submit(Box::new(f), Some(self.id))
    }

    /// Blocks until all of this token's tasks have finished.
    pub fn wait(&self) {
        let inner = &self.pool.inner;
        let mut state = inner.state.lock();
        loop {
            let Some(entry) = state.tokens.get(&self.id) else {
                return;
            };
            if entry.drained() {
                return;
            }
            inner.token_cv.wait(&mut state);
        }
    }

    /// Refuses new submissions but lets already-queued tasks run to
    /// completion. A no-op when re-invoked or after `shutdown()`.
    pub fn close(&self) {
        let inner = &self.pool.inner;
        let mut state = inner.state.lock();
        let Some(entry) = state.tokens.get_mut(&self.id) else {
            return;
        };
        match entry.state {
            TokenState::Idle if entry.drained() => entry.state = TokenState::Quiesced,
            TokenState::Idle | TokenState::Running => {
                entry.state = TokenState::GracefulQuiescing;
            }
            _ => {}
        }
        inner.token_cv.notify_all();
    }

    /// Drops queued tasks, refuses new submissions, and waits for
    /// in-flight tasks. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.pool.inner;
        let mut state = inner.state.lock();
        let Some(entry) = state.tokens.get_mut(&self.id) else {
            return;
        };
        if entry.state == TokenState::Quiesced {
            return;
        }
        let dropped = entry.queue.len();
        entry.queue.clear();
        if entry.mode == TokenMode::Concurrent {
            let id = self.id;
            let before = state.run_queue.len();
            state
                .run_queue
                .retain(|d| !matches!(d, Dispatch::Task(qt) if qt.token_id == Some(id)));
            let removed = before - state.run_queue.len();
            state.total_queued -= removed;
            let entry = state.tokens.get_mut(&self.id).unwrap();
            entry.pending -= removed;
        }
        state.total_queued -= dropped;
        let entry = state.tokens.get_mut(&self.id).unwrap();
        entry.state = if entry.drained() {
            TokenState::Quiesced
        } else {
            TokenState::Quiescing
        };
        loop {
            let entry = state.tokens.get(&self.id).unwrap();
            if entry.state == TokenState::Quiesced {
                return;
            }
            if entry.drained() {
                state.tokens.get_mut(&self.id).unwrap().state = TokenState::Quiesced;
                inner.token_cv.notify_all();
                return;
            }
            inner.token_cv.wait(&mut state);
        }
    }

    #[cfg(test)]
    fn state(&self) -> TokenState {
        let state = self.pool.inner.state.lock();
        state.tokens.get(&self.id).map(|e| e.state).unwrap()
    }
}

impl Drop for ThreadPoolToken {
    fn drop(&mut self) {
        // The pool may already be shut down; shutdown() handles that.
        self.shutdown();
        let mut state = self.pool.inner.state.lock();
        state.tokens.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    fn pool(threads: usize) -> Arc<ThreadPool> {
        Arc::new(ThreadPoolBuilder::new("test").max_threads(threads).build())
    }

    #[test]
    fn test_tokenless_tasks_run() {
        let p = pool(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let c = counter.clone();
            p.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        p.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert_eq!(p.queued_and_active(), (0, 0));
    }

    #[test]
    fn test_serial_token_preserves_fifo_order() {
        let p = pool(4);
        let token = p.new_token(TokenMode::Serial);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..64 {
            let order = order.clone();
            token
                .submit(move || {
                    order.lock().push(i);
                })
                .unwrap();
        }
        token.wait();
        assert_eq!(*order.lock(), (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_token_runs_in_parallel() {
        let p = pool(3);
        let token = p.new_token(TokenMode::Concurrent);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let running = running.clone();
            let peak = peak.clone();
            token
                .submit(move || {
                    let cur = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(cur, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        token.wait();
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_submit_after_shutdown_is_service_unavailable() {
        let p = pool(1);
        let token = p.new_token(TokenMode::Serial);
        token.shutdown();
        let err = token.submit(|| {}).unwrap_err();
        assert!(err.is_service_unavailable());
        // Re-shutdown is a no-op.
        token.shutdown();
        assert_eq!(token.state(), TokenState::Quiesced);
    }

    #[test]
    fn test_close_drains_queued_tasks() {
        let p = pool(1);
        let token = p.new_token(TokenMode::Serial);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            token
                .submit(move || {
                    std::thread::sleep(Duration::from_millis(10));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        token.close();
        assert!(token.submit(|| {}).is_err());
        // Re-close is a no-op.
        token.close();
        token.wait();
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(token.state(), TokenState::Quiesced);
    }

    #[test]
    fn test_token_shutdown_drops_queued_tasks() {
        let p = pool(1);
        let token = p.new_token(TokenMode::Serial);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let done = done.clone();
            token
                .submit(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        // Give the first task a chance to start, then drop the rest.
        std::thread::sleep(Duration::from_millis(5));
        token.shutdown();
        assert!(done.load(Ordering::SeqCst) < 8);
    }

    #[test]
    fn test_queue_overload_meter() {
        let p = Arc::new(
            ThreadPoolBuilder::new("meter")
                .max_threads(3)
                .queue_overload_threshold(Duration::from_millis(100))
                .build(),
        );
        assert!(!p.queue_overloaded());
        for _ in 0..6 {
            p.submit(|| std::thread::sleep(Duration::from_millis(200)))
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(150));
        assert!(p.queue_overloaded());
        p.wait();
        assert!(!p.queue_overloaded());
    }

    #[test]
    fn test_pool_shutdown_rejects_new_work() {
        let p = pool(2);
        p.shutdown();
        assert!(p.submit(|| {}).is_err());
        // Idempotent.
        p.shutdown();
    }
}
