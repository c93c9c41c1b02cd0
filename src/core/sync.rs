// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Round-based lending of a value from the main thread to worker threads.
//!
//! The main thread lends a value with [`Lender::lend()`], which blocks until
//! every worker thread has called [`Borrower::borrow()`] on it and returned.
//! A worker may leave the group during a round (by retiring or panicking);
//! the main thread learns about it from the returned [`RoundReport`] and must
//! hand a fresh [`Borrower`] to a replacement thread before the next round.

use super::util::{ErasedRef, LifetimeParameterized, Status};
use crate::macros::{log_debug, log_error};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// What a worker thread should do after a call to [`Borrower::borrow()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Wait for the next round.
    Ready,
    /// Exit: the worker has done its share of work and will be replaced.
    Retiring,
    /// Exit: the pool is shutting down.
    Finished,
}

/// Status of the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainStatus {
    /// The main thread is waiting for the worker threads to finish a round.
    Waiting,
    /// All the worker threads are done with the current round.
    Ready,
}

/// Status sent to the worker threads.
#[derive(Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    /// The worker threads need to process a round of the given color.
    Round(RoundColor),
    /// The worker threads must exit.
    Finished,
}

/// A 2-element enumeration to distinguish successive rounds. The "colors" are
/// only illustrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundColor {
    Blue,
    Red,
}

impl RoundColor {
    /// Flips to the other color.
    fn toggle(&mut self) {
        *self = match self {
            RoundColor::Blue => RoundColor::Red,
            RoundColor::Red => RoundColor::Blue,
        }
    }
}

/// Outcome of a round, as observed by the main thread.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Indices of the worker threads that left the group during the round,
    /// in no particular order.
    pub exited: Vec<usize>,
    /// Number of worker threads that panicked during the round. These are
    /// also listed in `exited`.
    pub num_panicked: usize,
}

/// Context shared between the main thread and the worker threads.
struct SharedContext<T: LifetimeParameterized> {
    /// Number of worker threads still busy with the current round.
    num_active_threads: CachePadded<AtomicUsize>,
    /// Number of worker threads that panicked in the current round.
    num_panicking_threads: CachePadded<AtomicUsize>,
    /// Indices of the worker threads that exited in the current round.
    exited: Mutex<Vec<usize>>,
    /// Status of the worker threads.
    worker_status: Status<WorkerStatus>,
    /// Status of the main thread.
    main_status: Status<MainStatus>,
    /// Value lent to the worker threads.
    value: RwLock<ErasedRef<T>>,
}

/// Main-thread side of a lending group.
pub struct Lender<T: LifetimeParameterized> {
    /// Number of worker threads taking part in each round.
    num_threads: usize,
    /// Color of the last round.
    round: RoundColor,
    /// Context shared with the worker threads.
    shared_context: Arc<SharedContext<T>>,
}

impl<T: LifetimeParameterized> Lender<T> {
    /// Creates a lender for a group of `num_threads` worker threads. Each of
    /// them must obtain its [`Borrower`] via [`borrower()`](Self::borrower).
    pub fn new(num_threads: usize) -> Self {
        let round = RoundColor::Blue;
        Self {
            num_threads,
            round,
            shared_context: Arc::new(SharedContext {
                num_active_threads: CachePadded::new(AtomicUsize::new(0)),
                num_panicking_threads: CachePadded::new(AtomicUsize::new(0)),
                exited: Mutex::new(Vec::new()),
                worker_status: Status::new(WorkerStatus::Round(round)),
                main_status: Status::new(MainStatus::Waiting),
                value: RwLock::new(ErasedRef::empty()),
            }),
        }
    }

    /// Creates the borrower for worker thread `id`, joining the group at the
    /// next round.
    ///
    /// This must be called between rounds, and the number of live borrowers
    /// must equal the group size whenever [`lend()`](Self::lend) is called.
    pub fn borrower(&self, id: usize) -> Borrower<T> {
        debug_assert!(id < self.num_threads);
        Borrower {
            id,
            round: self.round,
            shared_context: self.shared_context.clone(),
        }
    }

    /// Lends the given value to all the worker threads and waits until each
    /// of them is done with it.
    pub fn lend(&mut self, value: &T::T<'_>) -> RoundReport {
        debug_assert!(!self.shared_context.value.read().unwrap().is_set());
        self.shared_context
            .num_active_threads
            .store(self.num_threads, Ordering::SeqCst);
        self.shared_context
            .num_panicking_threads
            .store(0, Ordering::SeqCst);

        self.round.toggle();
        let round = self.round;

        // Safety note: The reference set here is cleared at the end of this function,
        // after all the worker threads are done reading it (as synchronized with
        // `main_status`).
        self.shared_context.value.write().unwrap().set(value);
        log_debug!("[main thread, round {round:?}] Lending a pipeline to the worker threads.");

        self.shared_context
            .worker_status
            .notify_all(WorkerStatus::Round(round));

        let mut guard = self
            .shared_context
            .main_status
            .wait_while(|status| *status == MainStatus::Waiting);
        assert_eq!(*guard, MainStatus::Ready);
        *guard = MainStatus::Waiting;
        drop(guard);

        log_debug!("[main thread, round {round:?}] All worker threads are done with this round.");
        self.shared_context.value.write().unwrap().clear();

        let num_panicked = self
            .shared_context
            .num_panicking_threads
            .load(Ordering::SeqCst);
        if num_panicked != 0 {
            log_error!("[main thread, round {round:?}] {num_panicked} worker thread(s) panicked!");
        }
        let exited = std::mem::take(
            &mut *self
                .shared_context
                .exited
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        RoundReport {
            exited,
            num_panicked,
        }
    }

    /// Notifies the worker threads to exit.
    pub fn finish_workers(&mut self) {
        log_debug!("[main thread] Notifying worker threads to finish...");
        self.shared_context
            .worker_status
            .notify_all(WorkerStatus::Finished);
    }
}

/// Worker-thread side of a lending group.
pub struct Borrower<T: LifetimeParameterized> {
    /// Worker thread index.
    id: usize,
    /// Color of the last round this worker took part in.
    round: RoundColor,
    /// Context shared with the main thread.
    shared_context: Arc<SharedContext<T>>,
}

impl<T: LifetimeParameterized> Borrower<T> {
    /// Waits for the main thread to lend a value and runs `f` on it.
    ///
    /// Returns the [`WorkerState`] produced by `f` (which must be either
    /// [`WorkerState::Ready`] or [`WorkerState::Retiring`]), or
    /// [`WorkerState::Finished`] without running `f` if the main thread
    /// called [`Lender::finish_workers()`].
    pub fn borrow(&mut self, f: impl FnOnce(&T::T<'_>) -> WorkerState) -> WorkerState {
        self.round.toggle();
        let round = self.round;

        log_debug!("[thread {}, round {round:?}] Waiting for start signal", self.id);

        let worker_status: WorkerStatus =
            *self
                .shared_context
                .worker_status
                .wait_while(|status| match status {
                    WorkerStatus::Finished => false,
                    WorkerStatus::Round(r) => *r != round,
                });
        match worker_status {
            WorkerStatus::Finished => {
                log_debug!("[thread {}, round {round:?}] Received finish signal", self.id);
                WorkerState::Finished
            }
            WorkerStatus::Round(r) => {
                assert_eq!(round, r);

                // The notifier reports this thread as done when dropped, either at the end
                // of this scope or while a panic in `f` unwinds.
                let mut notifier = Notifier {
                    id: self.id,
                    #[cfg(feature = "log")]
                    round,
                    retiring: false,
                    shared_context: &self.shared_context,
                };

                let state = {
                    let guard = self.shared_context.value.read().unwrap();
                    // SAFETY:
                    // - The main thread doesn't return from `lend()` (and therefore keeps the
                    //   value alive) until the notifiers of all the worker threads are dropped.
                    // - Only shared references to the value exist during this round.
                    let value = unsafe { guard.get().unwrap() };
                    f(value)
                };
                debug_assert_ne!(state, WorkerState::Finished);

                notifier.retiring = state == WorkerState::Retiring;
                drop(notifier);

                state
            }
        }
    }
}

/// Object whose destructor tells the main thread that a worker thread is done
/// with the current round.
struct Notifier<'a, T: LifetimeParameterized> {
    /// Worker thread index.
    id: usize,
    /// Color of the current round.
    #[cfg(feature = "log")]
    round: RoundColor,
    /// Whether the worker thread leaves the group after this round.
    retiring: bool,
    /// Context shared with the main thread.
    shared_context: &'a SharedContext<T>,
}

impl<T: LifetimeParameterized> Drop for Notifier<'_, T> {
    fn drop(&mut self) {
        #[cfg(feature = "log")]
        let round = self.round;

        let panicking = std::thread::panicking();
        if panicking {
            log_error!(
                "[thread {}] Detected panic in this thread, notifying the main thread",
                self.id
            );
            self.shared_context
                .num_panicking_threads
                .fetch_add(1, Ordering::SeqCst);
        }
        if panicking || self.retiring {
            // Recorded before decrementing the counter, so that the main thread sees it
            // once it wakes up.
            self.shared_context
                .exited
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.id);
        }

        let thread_count = self
            .shared_context
            .num_active_threads
            .fetch_sub(1, Ordering::SeqCst);
        assert!(thread_count > 0);

        if thread_count == 1 {
            log_debug!(
                "[thread {}, round {round:?}] We're the last thread. Waking up the main thread.",
                self.id
            );
            if let Err(e) = self
                .shared_context
                .main_status
                .try_notify_one(MainStatus::Ready)
            {
                log_error!(
                    "[thread {}] Failed to notify the main thread, the mutex was poisoned: {e:?}",
                    self.id
                );
                panic!("Failed to notify the main thread, the mutex was poisoned: {e:?}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread::JoinHandle;

    struct DynTask;

    impl LifetimeParameterized for DynTask {
        type T<'a> = dyn Fn(usize) -> WorkerState + Sync + 'a;
    }

    fn spawn_worker(mut borrower: Borrower<DynTask>, id: usize) -> JoinHandle<usize> {
        std::thread::spawn(move || {
            let mut rounds = 0;
            loop {
                match borrower.borrow(|task| task(id)) {
                    WorkerState::Ready => rounds += 1,
                    WorkerState::Retiring => return rounds + 1,
                    WorkerState::Finished => return rounds,
                }
            }
        })
    }

    #[test]
    fn test_lend_to_all_workers() {
        const NUM_THREADS: usize = 4;
        let mut lender = Lender::<DynTask>::new(NUM_THREADS);
        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|id| spawn_worker(lender.borrower(id), id))
            .collect();

        let seen = Mutex::new(Vec::new());
        for _ in 0..3 {
            let report = lender.lend(&|id| {
                seen.lock().unwrap().push(id);
                WorkerState::Ready
            });
            assert_eq!(report, RoundReport::default());
        }

        lender.finish_workers();
        for t in threads {
            assert_eq!(t.join().unwrap(), 3);
        }
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, [0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn test_retire_and_replace() {
        const NUM_THREADS: usize = 2;
        let mut lender = Lender::<DynTask>::new(NUM_THREADS);
        let mut threads: Vec<_> = (0..NUM_THREADS)
            .map(|id| Some(spawn_worker(lender.borrower(id), id)))
            .collect();

        let retire_one = |id: usize| {
            if id == 1 {
                WorkerState::Retiring
            } else {
                WorkerState::Ready
            }
        };
        let report = lender.lend(&retire_one);
        assert_eq!(report.exited, [1]);
        assert_eq!(report.num_panicked, 0);
        assert_eq!(threads[1].take().unwrap().join().unwrap(), 1);

        // The replacement joins the group at the next round.
        threads[1] = Some(spawn_worker(lender.borrower(1), 1));
        let report = lender.lend(&|_| WorkerState::Ready);
        assert_eq!(report, RoundReport::default());

        lender.finish_workers();
        let rounds: Vec<_> = threads
            .into_iter()
            .map(|t| t.unwrap().join().unwrap())
            .collect();
        assert_eq!(rounds, [2, 1]);
    }

    #[test]
    fn test_panicking_worker_is_reported() {
        const NUM_THREADS: usize = 3;
        let mut lender = Lender::<DynTask>::new(NUM_THREADS);
        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|id| spawn_worker(lender.borrower(id), id))
            .collect();

        let report = lender.lend(&|id| {
            if id == 2 {
                panic!("worker #2 failed");
            }
            WorkerState::Ready
        });
        assert_eq!(report.exited, [2]);
        assert_eq!(report.num_panicked, 1);

        lender.finish_workers();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().is_ok()).collect();
        assert_eq!(results, [true, true, false]);
    }
}
