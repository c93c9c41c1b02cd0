// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pipelines to execute on worker threads.

use crossbeam_utils::CachePadded;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// A pipeline is the work lent to all the worker threads for one round.
pub trait Pipeline {
    /// Runs this pipeline on the given worker thread, spending at most the
    /// remaining task budget of that worker.
    fn run(&self, worker_id: usize, budget: &mut TaskBudget);
}

/// Number of tasks a worker thread may still complete before retiring.
#[derive(Debug)]
pub struct TaskBudget {
    /// Maximum number of tasks, or [`None`] for no limit.
    max_tasks: Option<NonZeroUsize>,
    /// Number of tasks completed so far.
    completed: usize,
}

impl TaskBudget {
    /// Creates a fresh budget.
    pub fn new(max_tasks: Option<NonZeroUsize>) -> Self {
        Self {
            max_tasks,
            completed: 0,
        }
    }

    /// Returns `true` once the worker thread must retire.
    pub fn is_exhausted(&self) -> bool {
        match self.max_tasks {
            Some(max_tasks) => self.completed >= max_tasks.get(),
            None => false,
        }
    }

    /// Records a completed task.
    pub fn record_task(&mut self) {
        self.completed += 1;
    }

    /// Returns the number of tasks completed so far.
    pub fn completed(&self) -> usize {
        self.completed
    }
}

/// A pipeline that applies a function to chunks of items. Worker threads
/// claim chunks in increasing order from a shared cursor, and each chunk's
/// outputs are stored in a dedicated slot so that the input order can be
/// restored.
///
/// The same pipeline can be lent for several rounds, until all the chunks
/// are claimed (see [`is_exhausted()`](Self::is_exhausted)).
pub struct MapPipeline<'a, T, U, E, F> {
    /// Index of the next chunk to claim.
    next_chunk: CachePadded<AtomicUsize>,
    /// Set once a task failed or panicked. No new chunk is claimed after that.
    aborted: CachePadded<AtomicBool>,
    /// Input chunks, taken by the worker thread that claims them.
    inputs: Box<[Mutex<Option<Vec<T>>>]>,
    /// Output chunks, filled by the worker thread that processed them.
    outputs: Box<[Mutex<Option<Vec<U>>>]>,
    /// First failure in input order, as the chunk index and the error.
    failure: Mutex<Option<(usize, E)>>,
    /// Function to apply to each item.
    func: &'a F,
}

impl<'a, T, U, E, F> MapPipeline<'a, T, U, E, F>
where
    F: Fn(T) -> Result<U, E>,
{
    /// Splits the given items into chunks of `chunk_size` contiguous items.
    pub fn new(items: Vec<T>, chunk_size: NonZeroUsize, func: &'a F) -> Self {
        let chunk_size = chunk_size.get();
        let num_chunks = items.len().div_ceil(chunk_size);

        let mut inputs = Vec::with_capacity(num_chunks);
        let mut items = items.into_iter();
        for _ in 0..num_chunks {
            let chunk: Vec<T> = items.by_ref().take(chunk_size).collect();
            inputs.push(Mutex::new(Some(chunk)));
        }

        Self {
            next_chunk: CachePadded::new(AtomicUsize::new(0)),
            aborted: CachePadded::new(AtomicBool::new(false)),
            inputs: inputs.into_boxed_slice(),
            outputs: (0..num_chunks).map(|_| Mutex::new(None)).collect(),
            failure: Mutex::new(None),
            func,
        }
    }

    /// Returns the number of chunks.
    pub fn num_chunks(&self) -> usize {
        self.inputs.len()
    }

    /// Returns `true` once no more chunk can be claimed, either because all of
    /// them were claimed or because the pipeline was aborted.
    pub fn is_exhausted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
            || self.next_chunk.load(Ordering::SeqCst) >= self.inputs.len()
    }

    /// Collects the outputs in input order, or returns the first failure.
    ///
    /// Must only be called once no worker thread runs this pipeline anymore.
    pub fn into_outputs(self) -> Result<Vec<U>, E> {
        if let Some((_, error)) = self
            .failure
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(error);
        }

        let mut outputs = Vec::new();
        for output in self.outputs.into_vec() {
            let chunk = output
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .expect("a chunk was left unprocessed");
            outputs.extend(chunk);
        }
        Ok(outputs)
    }

    /// Processes the chunk at the given index.
    fn process_chunk(&self, index: usize) {
        let chunk = self.inputs[index]
            .lock()
            .unwrap()
            .take()
            .expect("a chunk was claimed twice");

        // Abort the pipeline if the function panics, so that the other worker
        // threads stop claiming chunks.
        let abort_on_panic = AbortOnPanic {
            aborted: &self.aborted,
        };
        let mut outputs = Vec::with_capacity(chunk.len());
        let mut failed = None;
        for item in chunk {
            match (self.func)(item) {
                Ok(output) => outputs.push(output),
                Err(error) => {
                    failed = Some(error);
                    break;
                }
            }
        }
        std::mem::forget(abort_on_panic);

        match failed {
            None => *self.outputs[index].lock().unwrap() = Some(outputs),
            Some(error) => {
                self.aborted.store(true, Ordering::SeqCst);
                let mut failure = self.failure.lock().unwrap();
                match &*failure {
                    Some((first, _)) if *first < index => (),
                    _ => *failure = Some((index, error)),
                }
            }
        }
    }
}

impl<T, U, E, F> Pipeline for MapPipeline<'_, T, U, E, F>
where
    F: Fn(T) -> Result<U, E>,
{
    fn run(&self, _worker_id: usize, budget: &mut TaskBudget) {
        while !budget.is_exhausted() && !self.aborted.load(Ordering::Relaxed) {
            let index = self.next_chunk.fetch_add(1, Ordering::Relaxed);
            if index >= self.inputs.len() {
                break;
            }
            self.process_chunk(index);
            budget.record_task();
        }
    }
}

/// Object whose destructor aborts a [`MapPipeline`].
///
/// Create it before a section that may panic, and [`std::mem::forget()`] it
/// at the end of the section: the destructor only runs if the section
/// unwinds.
struct AbortOnPanic<'a> {
    aborted: &'a AtomicBool,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::Infallible;

    fn square(x: u64) -> Result<u64, Infallible> {
        Ok(x * x)
    }

    #[test]
    fn test_task_budget() {
        let mut unlimited = TaskBudget::new(None);
        for _ in 0..1000 {
            unlimited.record_task();
        }
        assert!(!unlimited.is_exhausted());

        let mut budget = TaskBudget::new(NonZeroUsize::new(2));
        assert!(!budget.is_exhausted());
        budget.record_task();
        assert!(!budget.is_exhausted());
        budget.record_task();
        assert!(budget.is_exhausted());
        assert_eq!(budget.completed(), 2);
    }

    #[test]
    fn test_chunking() {
        let chunk_size = NonZeroUsize::new(3).unwrap();
        let pipeline = MapPipeline::new((0..10).collect(), chunk_size, &square);
        assert_eq!(pipeline.num_chunks(), 4);

        let pipeline = MapPipeline::new(Vec::new(), chunk_size, &square);
        assert_eq!(pipeline.num_chunks(), 0);
        assert!(pipeline.is_exhausted());
        assert_eq!(pipeline.into_outputs().unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_run_on_one_worker() {
        let chunk_size = NonZeroUsize::new(4).unwrap();
        let pipeline = MapPipeline::new((0..10).collect(), chunk_size, &square);

        let mut budget = TaskBudget::new(None);
        pipeline.run(0, &mut budget);
        assert_eq!(budget.completed(), 3);
        assert!(pipeline.is_exhausted());
        assert_eq!(
            pipeline.into_outputs().unwrap(),
            [0, 1, 4, 9, 16, 25, 36, 49, 64, 81]
        );
    }

    #[test]
    fn test_run_stops_at_budget() {
        let chunk_size = NonZeroUsize::new(2).unwrap();
        let pipeline = MapPipeline::new((0..10).collect(), chunk_size, &square);

        let mut first = TaskBudget::new(NonZeroUsize::new(2));
        pipeline.run(0, &mut first);
        assert!(first.is_exhausted());
        assert!(!pipeline.is_exhausted());

        let mut second = TaskBudget::new(None);
        pipeline.run(1, &mut second);
        assert_eq!(second.completed(), 3);
        assert_eq!(
            pipeline.into_outputs().unwrap(),
            [0, 1, 4, 9, 16, 25, 36, 49, 64, 81]
        );
    }

    #[test]
    fn test_failure_aborts() {
        let fail_on_seven = |x: u64| if x == 7 { Err(x) } else { Ok(x + 1) };
        let chunk_size = NonZeroUsize::new(2).unwrap();
        let pipeline = MapPipeline::new((0..10).collect(), chunk_size, &fail_on_seven);

        let mut budget = TaskBudget::new(None);
        pipeline.run(0, &mut budget);
        // Chunks [0, 1], [2, 3], [4, 5] and [6, 7] were processed.
        assert_eq!(budget.completed(), 4);
        assert!(pipeline.is_exhausted());
        assert_eq!(pipeline.into_outputs(), Err(7));
    }
}
