// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! A binary semaphore whose acquisition can outlive a stack frame,
//! for locks handed from a maintenance op's prepare step to its
//! perform step.

use parking_lot::{Condvar, Mutex};

pub struct Semaphore {
    held: Mutex<bool>,
    cv: Condvar,
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new()
    }
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut held = self.held.lock();
        if *held {
            return false;
        }
        *held = true;
        true
    }

    pub fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.cv.wait(&mut held);
        }
        *held = true;
    }

    pub fn release(&self) {
        let mut held = self.held.lock();
        assert!(*held, "releasing an unheld semaphore");
        *held = false;
        self.cv.notify_one();
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }

    /// RAII acquisition for in-process callers.
    pub fn lock_guard(&self) -> SemaphoreGuard<'_> {
        self.acquire();
        SemaphoreGuard { sem: self }
    }
}

pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}
