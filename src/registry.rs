// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The process-wide default [`WorkerPool`].

use crate::core::is_worker_thread;
use crate::macros::{log_debug, log_warn};
use crate::pool::{MapOptions, Mapped, WorkerCount, WorkerPool, WorkerPoolBuilder};
use crate::{Error, MapError};
use std::cell::Cell;
use std::iter::Map;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

/// Handle to a pool shared across threads.
pub type SharedPool = Arc<Mutex<WorkerPool>>;

/// Slot holding the default pool, lazily initialized to a single worker.
static DEFAULT_POOL: Mutex<Option<SharedPool>> = Mutex::new(None);

fn lock_slot() -> MutexGuard<'static, Option<SharedPool>> {
    DEFAULT_POOL.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_pool(pool: &SharedPool) -> MutexGuard<'_, WorkerPool> {
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the current default pool.
///
/// Until [`configure_default()`] is called, this is a single-worker pool.
pub fn default_pool() -> SharedPool {
    lock_slot()
        .get_or_insert_with(|| Arc::new(Mutex::new(WorkerPool::serial())))
        .clone()
}

/// Replaces the default pool by a new pool with the given number of workers.
///
/// A count of `0` configures a single-worker pool.
///
/// ```
/// # use ezpool::{configure_default, default_pool};
/// configure_default(2)?;
/// assert_eq!(default_pool().lock().unwrap().worker_count().get(), 2);
/// # Ok::<(), ezpool::Error>(())
/// ```
pub fn configure_default(worker_count: impl Into<WorkerCount>) -> Result<(), Error> {
    configure_default_with(&WorkerPoolBuilder {
        worker_count: worker_count.into(),
        ..Default::default()
    })
}

/// Replaces the default pool by a new pool built from the given builder.
///
/// The previous default pool is shut down once the last handle to it is
/// dropped. Handles obtained earlier via [`default_pool()`] remain usable.
/// On failure, the default pool is left unchanged.
pub fn configure_default_with(builder: &WorkerPoolBuilder) -> Result<(), Error> {
    let pool = builder.build()?;
    log_debug!("Configuring default pool({})", pool.worker_count());

    let previous = lock_slot().replace(Arc::new(Mutex::new(pool)));
    // Shutting down the previous pool joins its threads, so release the slot
    // first.
    drop(previous);
    Ok(())
}

/// Runs `f` on the given pool if any, or otherwise on the default pool.
///
/// When the default pool has a single worker, `f` runs on a fresh
/// single-worker pool without locking the default pool, so nested calls are
/// fine. Otherwise, the default pool stays locked while `f` runs: concurrent
/// calls from other threads are serialized, and a call made from within `f`
/// (or from a worker thread) while the default pool is locked fails with
/// [`Error::Busy`] instead of blocking forever.
///
/// ```
/// # use ezpool::{resolve_pool, MapOptions, WorkerPool};
/// let mut pool = WorkerPool::new(3)?;
/// let worker_count = resolve_pool(Some(&mut pool), |pool| pool.worker_count().get())?;
/// assert_eq!(worker_count, 3);
/// # Ok::<(), ezpool::Error>(())
/// ```
pub fn resolve_pool<R>(
    pool: Option<&mut WorkerPool>,
    f: impl FnOnce(&mut WorkerPool) -> R,
) -> Result<R, Error> {
    if let Some(pool) = pool {
        log_debug!("Using provided pool({})", pool.worker_count());
        return Ok(f(pool));
    }

    let shared = default_pool();
    let mut pool = if HOLDS_DEFAULT_POOL.with(Cell::get) || is_worker_thread() {
        try_lock_nested(&shared)?
    } else {
        lock_pool(&shared)
    };
    log_debug!("Using default pool({})", pool.worker_count());

    if pool.worker_count().get() == 1 {
        // A single-worker pool has no state, so the lock can be released.
        drop(pool);
        return Ok(f(&mut WorkerPool::serial()));
    }

    let _running = RunningDefaultPool::enter(&shared);
    Ok(f(&mut pool))
}

/// Locks the given default pool from a thread that may be running inside a
/// call on that same pool. Fails instead of blocking if the pool is locked by
/// a call that is running a function.
fn try_lock_nested(shared: &SharedPool) -> Result<MutexGuard<'_, WorkerPool>, Error> {
    loop {
        match shared.try_lock() {
            Ok(pool) => return Ok(pool),
            Err(TryLockError::Poisoned(e)) => return Ok(e.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if RUNNING_POOL.load(Ordering::SeqCst) == Arc::as_ptr(shared) as usize {
                    log_warn!("The default pool is busy with an enclosing call");
                    return Err(Error::Busy);
                }
                // Locked only briefly by another thread.
                std::thread::yield_now();
            }
        }
    }
}

/// Address of the default pool currently running a function, or 0.
static RUNNING_POOL: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Set while the current thread holds the lock of the default pool.
    static HOLDS_DEFAULT_POOL: Cell<bool> = const { Cell::new(false) };
}

/// Marks a default pool as running a function on the current thread, until
/// dropped.
struct RunningDefaultPool {
    previous_holds: bool,
}

impl RunningDefaultPool {
    /// Must be called with the lock of `shared` held.
    fn enter(shared: &SharedPool) -> Self {
        RUNNING_POOL.store(Arc::as_ptr(shared) as usize, Ordering::SeqCst);
        Self {
            previous_holds: HOLDS_DEFAULT_POOL.with(|holds| holds.replace(true)),
        }
    }
}

impl Drop for RunningDefaultPool {
    fn drop(&mut self) {
        RUNNING_POOL.store(0, Ordering::SeqCst);
        HOLDS_DEFAULT_POOL.with(|holds| holds.set(self.previous_holds));
    }
}

/// Applies `func` to every item of `iterable` on the default pool.
///
/// See [`WorkerPool::map()`] for the evaluation strategy. The default pool is
/// only locked during this call: a lazy result is evaluated on the calling
/// thread as it is pulled.
///
/// ```
/// # use ezpool::MapOptions;
/// let squares: Vec<u64> = ezpool::map(|x| x * x, 1..=5, MapOptions::default())?.collect();
/// assert_eq!(squares, [1, 4, 9, 16, 25]);
/// # Ok::<(), ezpool::Error>(())
/// ```
pub fn map<I, U, F>(
    func: F,
    iterable: I,
    options: MapOptions,
) -> Result<Mapped<Map<I::IntoIter, F>>, Error>
where
    I: IntoIterator,
    I::Item: Send,
    U: Send,
    F: Fn(I::Item) -> U + Sync,
{
    resolve_pool(None, |pool| pool.map(func, iterable, options))?
}

/// Applies a fallible `func` to every item of `iterable` on the default pool.
///
/// See [`WorkerPool::try_map()`] for the evaluation strategy and the error
/// reporting.
#[allow(clippy::type_complexity)]
pub fn try_map<I, U, E, F>(
    func: F,
    iterable: I,
    options: MapOptions,
) -> Result<Mapped<Map<I::IntoIter, F>>, MapError<E>>
where
    I: IntoIterator,
    I::Item: Send,
    U: Send,
    E: Send,
    F: Fn(I::Item) -> Result<U, E> + Sync,
{
    resolve_pool(None, |pool| pool.try_map(func, iterable, options))?
}
