// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! A snoozable periodic timer, used for peer heartbeats.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct TimerState {
    next_fire: Instant,
    stopped: bool,
}

struct TimerInner {
    period: Duration,
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Fires a callback every `period` unless snoozed. `snooze()` pushes
/// the next firing a full period out, so a caller that is making
/// progress on its own can suppress redundant ticks.
pub struct PeriodicTimer {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTimer {
    pub fn start<F>(period: Duration, callback: F) -> PeriodicTimer
    where
        F: Fn() + Send + 'static,
    {
        let inner = Arc::new(TimerInner {
            period,
            state: Mutex::new(TimerState {
                next_fire: Instant::now() + period,
                stopped: false,
            }),
            cv: Condvar::new(),
        });
        let thread_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("periodic-timer".to_owned())
            .spawn(move || {
                let inner = thread_inner;
                loop {
                    {
                        let mut state = inner.state.lock();
                        loop {
                            if state.stopped {
                                return;
                            }
                            let now = Instant::now();
                            if now >= state.next_fire {
                                state.next_fire = now + inner.period;
                                break;
                            }
                            let deadline = state.next_fire;
                            let _ = inner.cv.wait_until(&mut state, deadline);
                        }
                    }
                    // Fire without holding the lock: the callback may
                    // snooze or stop the timer.
                    callback();
                }
            })
            .expect("failed to spawn timer thread");
        PeriodicTimer {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Delays the next firing by a full period from now.
    pub fn snooze(&self) {
        let mut state = self.inner.state.lock();
        state.next_fire = Instant::now() + self.inner.period;
        self.inner.cv.notify_one();
    }

    /// Stops the timer and joins its thread. Idempotent. When invoked
    /// from inside the callback (the timer thread itself), the join is
    /// skipped; the thread exits on its own.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            self.inner.cv.notify_one();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_fires_periodically() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = PeriodicTimer::start(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        timer.stop();
        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 2, "only fired {count} times");
    }

    #[test]
    fn test_snooze_delays_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = PeriodicTimer::start(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        // Keep snoozing faster than the period: the callback must not
        // fire at all.
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(10));
            timer.snooze();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.stop();
    }

    #[test]
    fn test_restop_is_noop() {
        let timer = PeriodicTimer::start(Duration::from_millis(5), || {});
        timer.stop();
        timer.stop();
    }
}
