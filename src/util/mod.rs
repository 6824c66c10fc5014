// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Process-wide utilities: worker pools with tokens, periodic timers.

mod periodic;
mod semaphore;
mod threadpool;

pub use periodic::PeriodicTimer;
pub use semaphore::{Semaphore, SemaphoreGuard};
pub use threadpool::{ThreadPool, ThreadPoolBuilder, ThreadPoolToken, TokenMode, TokenState};
