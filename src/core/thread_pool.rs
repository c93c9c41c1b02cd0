// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size pool of worker threads that map functions over chunks of
//! items.

use super::pipeline::{MapPipeline, Pipeline, TaskBudget};
use super::sync::{Borrower, Lender, WorkerState};
use super::util::{LifetimeParameterized, Status};
#[cfg(feature = "log_parallelism")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error, log_warn};
use crate::{Error, MapError};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::cell::Cell;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;

thread_local! {
    /// Set on the worker threads of every pool.
    static IS_WORKER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` if the current thread is a worker thread of some pool.
pub fn is_worker_thread() -> bool {
    IS_WORKER_THREAD.with(Cell::get)
}

/// Function run once by each worker thread when it starts, before it accepts
/// any task. Arguments to the initializer are captured by the closure.
pub type Initializer = Arc<dyn Fn() + Send + Sync>;

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    #[default]
    No,
    /// Pin worker thread `#i` to CPU `#i`, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin worker thread `#i` to CPU `#i`. Building a pool fails if CPU
    /// pinning isn't supported on this platform (or not implemented), or if
    /// a worker thread cannot be pinned.
    Always,
}

/// Settings shared by all the worker threads of a pool, including the ones
/// spawned to replace retired workers.
#[derive(Clone)]
pub struct WorkerSettings {
    /// Function to run when a worker thread starts.
    pub initializer: Option<Initializer>,
    /// Number of tasks after which a worker thread is replaced.
    pub max_tasks_per_worker: Option<NonZeroUsize>,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

/// Underlying thread pool of a [`WorkerPool`](crate::WorkerPool) with more
/// than one worker.
pub struct ThreadPoolImpl {
    /// Handles to the worker threads, indexed by worker id. A slot is empty
    /// between the exit of a worker thread and the spawn of its replacement.
    threads: Vec<Option<WorkerThreadHandle>>,
    /// Lender of pipelines to the worker threads.
    lender: Lender<DynLifetimeSyncPipeline>,
    /// Settings to spawn worker threads.
    settings: WorkerSettings,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

/// Progress of a batch of worker threads running their initializer.
struct Startup {
    /// Number of worker threads that haven't finished starting yet.
    pending: usize,
    /// Indices of the worker threads that panicked while starting.
    failed: Vec<usize>,
}

impl ThreadPoolImpl {
    /// Spawns `num_threads` worker threads and waits until all of them have
    /// run their initializer.
    pub fn new(num_threads: NonZeroUsize, settings: WorkerSettings) -> Result<Self, Error> {
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match settings.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => return Err(Error::CpuPinningUnsupported),
        }

        let num_threads = num_threads.get();
        let mut thread_pool = Self {
            threads: (0..num_threads).map(|_| None).collect(),
            lender: Lender::new(num_threads),
            settings,
        };
        thread_pool.spawn_missing_workers()?;
        Ok(thread_pool)
    }

    /// Returns the number of worker threads in this pool.
    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Applies `func` to all the items, processing chunks of `chunk_size`
    /// items in parallel, and returns the outputs in input order.
    ///
    /// Fails with the error of the first failing item in input order, or if
    /// `func` panicked on any worker thread.
    pub fn map_chunks<T: Send, U: Send, E: Send>(
        &mut self,
        items: Vec<T>,
        chunk_size: NonZeroUsize,
        func: &(impl Fn(T) -> Result<U, E> + Sync),
    ) -> Result<Vec<U>, MapError<E>> {
        self.spawn_missing_workers()?;

        let pipeline = MapPipeline::new(items, chunk_size, func);
        log_debug!(
            "[main thread] Mapping {} chunk(s) of up to {chunk_size} item(s) on {} worker threads",
            pipeline.num_chunks(),
            self.num_threads()
        );

        #[cfg(feature = "log_parallelism")]
        let (mut num_rounds, mut num_replaced) = (0usize, 0usize);

        while !pipeline.is_exhausted() {
            let report = self.lender.lend(&pipeline);
            #[cfg(feature = "log_parallelism")]
            {
                num_rounds += 1;
                num_replaced += report.exited.len();
            }

            self.join_exited(&report.exited);
            if report.num_panicked != 0 {
                // Replace the panicked workers so that the pool stays usable.
                if let Err(_e) = self.spawn_missing_workers() {
                    log_warn!("[main thread] Failed to replace panicked worker threads: {_e}");
                }
                return Err(Error::WorkerPanic {
                    count: report.num_panicked,
                }
                .into());
            }
            self.spawn_missing_workers()?;
        }

        #[cfg(feature = "log_parallelism")]
        log_info!(
            "Mapped {} chunk(s) in {num_rounds} round(s), replacing {num_replaced} worker thread(s)",
            pipeline.num_chunks()
        );

        pipeline.into_outputs().map_err(MapError::Task)
    }

    /// Joins the worker threads that left the lending group.
    fn join_exited(&mut self, exited: &[usize]) {
        for &id in exited {
            if let Some(thread) = self.threads[id].take() {
                let result = thread.handle.join();
                match result {
                    Ok(_) => log_debug!("[main thread] Exited thread {id} joined with result: {result:?}"),
                    Err(_) => log_error!("[main thread] Exited thread {id} joined with result: {result:?}"),
                }
            }
        }
    }

    /// Spawns a worker thread in each empty slot, and waits until all the new
    /// threads have run their initializer.
    fn spawn_missing_workers(&mut self) -> Result<(), Error> {
        let missing: Vec<usize> = (0..self.num_threads())
            .filter(|&id| self.threads[id].is_none())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let startup = Arc::new(Status::new(Startup {
            pending: 0,
            failed: Vec::new(),
        }));
        let mut spawn_error = None;
        for id in missing {
            startup.update_all(|startup| startup.pending += 1);
            match self.spawn_worker(id, startup.clone()) {
                Ok(thread) => self.threads[id] = Some(thread),
                Err(e) => {
                    startup.update_all(|startup| startup.pending -= 1);
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let failed = std::mem::take(&mut startup.wait_while(|startup| startup.pending != 0).failed);
        self.join_exited(&failed);

        if let Some(e) = spawn_error {
            log_error!("[main thread] {e}");
            return Err(e);
        }
        if !failed.is_empty() {
            log_error!(
                "[main thread] {} worker thread(s) failed to start",
                failed.len()
            );
            return Err(Error::WorkerStartup {
                count: failed.len(),
            });
        }
        log_debug!("[main thread] Spawned threads");
        Ok(())
    }

    /// Spawns the worker thread with the given index.
    fn spawn_worker(
        &self,
        id: usize,
        startup: Arc<Status<Startup>>,
    ) -> Result<WorkerThreadHandle, Error> {
        let context = ThreadContext {
            id,
            budget: TaskBudget::new(self.settings.max_tasks_per_worker),
            pipeline: self.lender.borrower(id),
        };
        let initializer = self.settings.initializer.clone();
        let cpu_pinning = self.settings.cpu_pinning;

        let handle = std::thread::Builder::new()
            .name(format!("ezpool-worker-{id}"))
            .spawn(move || {
                IS_WORKER_THREAD.with(|is_worker| is_worker.set(true));
                let startup_notifier = StartupNotifier { id, startup };
                pin_to_cpu(id, cpu_pinning);
                if let Some(initializer) = initializer {
                    initializer();
                }
                drop(startup_notifier);
                context.run()
            })
            .map_err(|source| Error::Spawn { id, source })?;
        Ok(WorkerThreadHandle { handle })
    }
}

impl Drop for ThreadPoolImpl {
    /// Joins all the threads in the pool.
    #[allow(clippy::single_match, clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        self.lender.finish_workers();

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.iter_mut().enumerate() {
            if let Some(t) = t.take() {
                let result = t.handle.join();
                match result {
                    Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                    Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
                }
            }
        }
        log_debug!("[main thread] Joined threads.");
    }
}

/// Pins the current thread to the CPU with the given index, according to the
/// policy.
#[allow(unused_variables)]
fn pin_to_cpu(id: usize, cpu_pinning: CpuPinningPolicy) {
    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(_e) = cpu_set.set(id) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(id) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
    }
}

/// Object whose destructor reports a worker thread as started, or as failed
/// if the thread is panicking.
struct StartupNotifier {
    /// Worker thread index.
    id: usize,
    /// Startup progress of the batch this thread belongs to.
    startup: Arc<Status<Startup>>,
}

impl Drop for StartupNotifier {
    fn drop(&mut self) {
        let panicking = std::thread::panicking();
        if panicking {
            log_error!(
                "[thread {}] Panicked while starting, notifying the main thread",
                self.id
            );
        }
        self.startup.update_all(|startup| {
            startup.pending -= 1;
            if panicking {
                startup.failed.push(self.id);
            }
        });
    }
}

/// An intermediate struct representing a `dyn Pipeline + Sync` with variable
/// lifetime, see [`LifetimeParameterized`].
struct DynLifetimeSyncPipeline;

impl LifetimeParameterized for DynLifetimeSyncPipeline {
    type T<'a> = dyn Pipeline + Sync + 'a;
}

/// Context object owned by a worker thread.
struct ThreadContext {
    /// Thread index.
    id: usize,
    /// Remaining number of tasks before this thread retires.
    budget: TaskBudget,
    /// Pipelines lent by the main thread.
    pipeline: Borrower<DynLifetimeSyncPipeline>,
}

impl ThreadContext {
    /// Main function run by this thread.
    fn run(mut self) {
        loop {
            let state = self.pipeline.borrow(|pipeline| {
                pipeline.run(self.id, &mut self.budget);
                if self.budget.is_exhausted() {
                    WorkerState::Retiring
                } else {
                    WorkerState::Ready
                }
            });
            match state {
                WorkerState::Ready => continue,
                WorkerState::Retiring => {
                    log_debug!(
                        "[thread {}] Retiring after {} task(s)",
                        self.id,
                        self.budget.completed()
                    );
                    break;
                }
                WorkerState::Finished => break,
            }
        }
    }
}
