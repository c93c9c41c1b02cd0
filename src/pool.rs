// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The [`WorkerPool`] and its configuration.

use crate::core::{CpuPinningPolicy, Initializer, ThreadPoolImpl, WorkerSettings};
use crate::macros::log_debug;
use crate::{Error, MapError};
use std::convert::Infallible;
use std::iter::Map;
use std::num::NonZeroUsize;

/// Number of workers in a [`WorkerPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Use the given number of workers.
    Count(NonZeroUsize),
}

impl WorkerCount {
    /// Resolves the number of workers.
    pub fn count(self) -> Result<NonZeroUsize, Error> {
        match self {
            WorkerCount::AvailableParallelism => {
                std::thread::available_parallelism().map_err(Error::AvailableParallelism)
            }
            WorkerCount::Count(count) => Ok(count),
        }
    }
}

impl Default for WorkerCount {
    /// A single worker.
    fn default() -> Self {
        WorkerCount::Count(NonZeroUsize::MIN)
    }
}

impl From<NonZeroUsize> for WorkerCount {
    fn from(count: NonZeroUsize) -> Self {
        WorkerCount::Count(count)
    }
}

impl From<usize> for WorkerCount {
    /// Converts a requested number of workers, where `0` means a single
    /// worker.
    fn from(count: usize) -> Self {
        WorkerCount::Count(NonZeroUsize::new(count).unwrap_or(NonZeroUsize::MIN))
    }
}

/// A builder for [`WorkerPool`].
#[derive(Clone, Default)]
pub struct WorkerPoolBuilder {
    /// Number of workers in the pool.
    pub worker_count: WorkerCount,
    /// Function run once by each worker thread before it accepts tasks. Never
    /// run by a single-worker pool.
    pub initializer: Option<Initializer>,
    /// Number of tasks (chunks) after which a worker thread exits and is
    /// replaced by a new one. Ignored by a single-worker pool.
    pub max_tasks_per_worker: Option<NonZeroUsize>,
    /// Policy to pin worker threads to CPUs. Ignored by a single-worker pool.
    pub cpu_pinning: CpuPinningPolicy,
}

impl WorkerPoolBuilder {
    /// Builds a worker pool. With more than one worker, this spawns the
    /// worker threads and waits until they have all run the initializer.
    ///
    /// ```
    /// # use ezpool::{MapOptions, WorkerPoolBuilder};
    /// # use std::sync::atomic::{AtomicUsize, Ordering};
    /// # use std::sync::Arc;
    /// let started = Arc::new(AtomicUsize::new(0));
    /// let mut pool = WorkerPoolBuilder {
    ///     worker_count: 4.into(),
    ///     initializer: Some(Arc::new({
    ///         let started = started.clone();
    ///         move || {
    ///             started.fetch_add(1, Ordering::SeqCst);
    ///         }
    ///     })),
    ///     ..Default::default()
    /// }
    /// .build()?;
    /// assert_eq!(started.load(Ordering::SeqCst), 4);
    ///
    /// let squares: Vec<u64> = pool
    ///     .map(|x| x * x, 1..=5, MapOptions::default())?
    ///     .collect();
    /// assert_eq!(squares, [1, 4, 9, 16, 25]);
    /// # Ok::<(), ezpool::Error>(())
    /// ```
    pub fn build(&self) -> Result<WorkerPool, Error> {
        let worker_count = self.worker_count.count()?;
        let backend = if worker_count.get() == 1 {
            Backend::Inline
        } else {
            Backend::Threads(ThreadPoolImpl::new(
                worker_count,
                WorkerSettings {
                    initializer: self.initializer.clone(),
                    max_tasks_per_worker: self.max_tasks_per_worker,
                    cpu_pinning: self.cpu_pinning,
                },
            )?)
        };
        Ok(WorkerPool::with_backend(worker_count, backend))
    }

    /// Builds a worker pool, runs `f` on it and shuts the pool down before
    /// returning, including when `f` panics.
    ///
    /// ```
    /// # use ezpool::{MapOptions, WorkerPoolBuilder};
    /// let total = WorkerPoolBuilder {
    ///     worker_count: 2.into(),
    ///     ..Default::default()
    /// }
    /// .scope(|pool| -> Result<u64, ezpool::Error> {
    ///     Ok(pool.map(|x: u64| x + 1, 0..10, MapOptions::default())?.sum())
    /// })??;
    /// assert_eq!(total, 55);
    /// # Ok::<(), ezpool::Error>(())
    /// ```
    pub fn scope<R>(&self, f: impl FnOnce(&mut WorkerPool) -> R) -> Result<R, Error> {
        let mut pool = self.build()?;
        let result = f(&mut pool);
        pool.shutdown();
        Ok(result)
    }
}

/// Options of a [`map()`](WorkerPool::map) call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapOptions {
    /// Number of contiguous items sent to a worker thread at once. Only used
    /// with more than one worker.
    pub chunk_size: NonZeroUsize,
    /// Whether to evaluate all the items before returning. Only used with a
    /// single worker: with more workers, evaluation is always eager.
    pub force: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            chunk_size: NonZeroUsize::MIN,
            force: false,
        }
    }
}

impl MapOptions {
    /// Options that force eager evaluation.
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    /// Sets the chunk size.
    pub fn with_chunk_size(self, chunk_size: NonZeroUsize) -> Self {
        Self { chunk_size, ..self }
    }
}

/// Outputs of a [`map()`](WorkerPool::map) call, in input order.
pub enum Mapped<L: Iterator> {
    /// Outputs computed on demand on the calling thread, as they are pulled.
    Lazy(L),
    /// Outputs that have all been computed already.
    Eager(std::vec::IntoIter<L::Item>),
}

impl<L: Iterator> Mapped<L> {
    /// Returns `true` if the outputs are computed on demand.
    pub fn is_lazy(&self) -> bool {
        matches!(self, Mapped::Lazy(_))
    }

    /// Collects the remaining outputs, evaluating them if needed.
    pub fn into_vec(self) -> Vec<L::Item> {
        match self {
            Mapped::Lazy(lazy) => lazy.collect(),
            Mapped::Eager(eager) => eager.collect(),
        }
    }
}

impl<L: Iterator> Iterator for Mapped<L> {
    type Item = L::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Mapped::Lazy(lazy) => lazy.next(),
            Mapped::Eager(eager) => eager.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Mapped::Lazy(lazy) => lazy.size_hint(),
            Mapped::Eager(eager) => eager.size_hint(),
        }
    }
}

/// Execution strategy of a [`WorkerPool`].
enum Backend {
    /// A single worker: functions run on the calling thread.
    Inline,
    /// Several worker threads.
    Threads(ThreadPoolImpl),
    /// The worker threads were shut down.
    Closed,
}

/// A pool of workers to map functions over sequences.
///
/// With a single worker, no thread is spawned and [`map()`](Self::map)
/// evaluates lazily on the calling thread (unless forced). With more
/// workers, the pool owns as many long-lived threads and
/// [`map()`](Self::map) evaluates eagerly in parallel, preserving the input
/// order.
///
/// The worker threads are joined by [`shutdown()`](Self::shutdown), or when
/// the pool is dropped.
pub struct WorkerPool {
    worker_count: NonZeroUsize,
    backend: Backend,
}

impl WorkerPool {
    /// Creates a pool with the given number of workers and default settings.
    /// A count of `0` creates a single-worker pool.
    ///
    /// ```
    /// # use ezpool::WorkerPool;
    /// let pool = WorkerPool::new(0)?;
    /// assert_eq!(pool.worker_count().get(), 1);
    /// assert!(!pool.has_threads());
    /// # Ok::<(), ezpool::Error>(())
    /// ```
    pub fn new(worker_count: impl Into<WorkerCount>) -> Result<Self, Error> {
        WorkerPoolBuilder {
            worker_count: worker_count.into(),
            ..Default::default()
        }
        .build()
    }

    /// Creates a single-worker pool. This never fails since no thread is
    /// spawned.
    pub fn serial() -> Self {
        Self::with_backend(NonZeroUsize::MIN, Backend::Inline)
    }

    fn with_backend(worker_count: NonZeroUsize, backend: Backend) -> Self {
        log_debug!("Created WorkerPool({worker_count})");
        Self {
            worker_count,
            backend,
        }
    }

    /// Returns the number of workers requested for this pool.
    pub fn worker_count(&self) -> NonZeroUsize {
        self.worker_count
    }

    /// Returns `true` if this pool currently owns worker threads.
    pub fn has_threads(&self) -> bool {
        matches!(self.backend, Backend::Threads(_))
    }

    /// Applies `func` to every item of `iterable`, returning the outputs in
    /// input order.
    ///
    /// - With a single worker and `options.force == false`, this returns a
    ///   [`Mapped::Lazy`] iterator that calls `func` on each item as it is
    ///   pulled. A panic in `func` surfaces at that point.
    /// - With a single worker and `options.force == true`, all the items are
    ///   evaluated on the calling thread before returning.
    /// - With more workers, the items are collected, split into chunks of
    ///   `options.chunk_size` and processed in parallel. This blocks until all
    ///   items are processed. If `func` panics on a worker thread, this fails
    ///   with [`Error::WorkerPanic`].
    ///
    /// ```
    /// # use ezpool::{MapOptions, WorkerPool};
    /// let mut pool = WorkerPool::new(1)?;
    /// let mut squares = pool.map(|x: u64| x * x, 1..=5, MapOptions::default())?;
    /// assert!(squares.is_lazy());
    /// assert_eq!(squares.next(), Some(1));
    /// assert_eq!(squares.collect::<Vec<_>>(), [4, 9, 16, 25]);
    /// # Ok::<(), ezpool::Error>(())
    /// ```
    pub fn map<I, U, F>(
        &mut self,
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
        log_debug!("Mapping using {} worker(s)", self.worker_count);
        match &mut self.backend {
            Backend::Inline => {
                let lazy = iterable.into_iter().map(func);
                if options.force {
                    Ok(Mapped::Eager(lazy.collect::<Vec<_>>().into_iter()))
                } else {
                    Ok(Mapped::Lazy(lazy))
                }
            }
            Backend::Threads(threads) => {
                let items: Vec<I::Item> = iterable.into_iter().collect();
                let outputs = threads
                    .map_chunks(items, options.chunk_size, &|item| {
                        Ok::<U, Infallible>(func(item))
                    })
                    .map_err(|e| match e {
                        MapError::Task(never) => match never {},
                        MapError::Pool(e) => e,
                    })?;
                Ok(Mapped::Eager(outputs.into_iter()))
            }
            Backend::Closed => Err(Error::ShutDown),
        }
    }

    /// Applies a fallible `func` to every item of `iterable`, returning the
    /// outputs in input order.
    ///
    /// This follows the same evaluation strategy as [`map()`](Self::map).
    /// When evaluation is lazy, each item is a [`Result`] and an error
    /// surfaces when the failing item is pulled. Otherwise, a failure is
    /// returned as [`MapError::Task`] with the error of the first failing
    /// item in input order, and no partial output is returned.
    ///
    /// ```
    /// # use ezpool::{MapError, MapOptions, WorkerPool};
    /// let parse = |s: &str| s.parse::<u32>();
    ///
    /// let mut pool = WorkerPool::new(3).unwrap();
    /// let result = pool.try_map(parse, ["1", "2", "x", "4"], MapOptions::default());
    /// assert!(matches!(result, Err(MapError::Task(_))));
    ///
    /// let mut pool = WorkerPool::new(1).unwrap();
    /// let mut lazy = pool
    ///     .try_map(parse, ["1", "2", "x", "4"], MapOptions::default())
    ///     .unwrap();
    /// assert_eq!(lazy.next().unwrap(), Ok(1));
    /// assert_eq!(lazy.next().unwrap(), Ok(2));
    /// assert!(lazy.next().unwrap().is_err());
    /// ```
    #[allow(clippy::type_complexity)]
    pub fn try_map<I, U, E, F>(
        &mut self,
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
        log_debug!("Mapping using {} worker(s)", self.worker_count);
        match &mut self.backend {
            Backend::Inline => {
                let lazy = iterable.into_iter().map(func);
                if options.force {
                    let mut outputs = Vec::new();
                    for output in lazy {
                        outputs.push(Ok(output.map_err(MapError::Task)?));
                    }
                    Ok(Mapped::Eager(outputs.into_iter()))
                } else {
                    Ok(Mapped::Lazy(lazy))
                }
            }
            Backend::Threads(threads) => {
                let items: Vec<I::Item> = iterable.into_iter().collect();
                let outputs = threads.map_chunks(items, options.chunk_size, &func)?;
                Ok(Mapped::Eager(
                    outputs.into_iter().map(Ok).collect::<Vec<_>>().into_iter(),
                ))
            }
            Backend::Closed => Err(Error::ShutDown.into()),
        }
    }

    /// Joins the worker threads of this pool. Further calls to
    /// [`map()`](Self::map) on a pool that had worker threads fail with
    /// [`Error::ShutDown`].
    ///
    /// This is a no-op on a single-worker pool, and calling it again has no
    /// effect.
    pub fn shutdown(&mut self) {
        if let Backend::Threads(_) = self.backend {
            log_debug!("Shutting down WorkerPool({})", self.worker_count);
            // Dropping the thread pool joins the worker threads.
            self.backend = Backend::Closed;
        }
    }
}
