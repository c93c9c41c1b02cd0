// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types.

use std::io;

/// Failure of a [`WorkerPool`](crate::WorkerPool) or of its worker threads.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Resolving [`WorkerCount::AvailableParallelism`](crate::WorkerCount)
    /// failed.
    #[error("failed to query the available parallelism")]
    AvailableParallelism(#[source] io::Error),
    /// [`CpuPinningPolicy::Always`](crate::CpuPinningPolicy) was requested on
    /// a platform where pinning isn't implemented.
    #[error("pinning threads to CPUs is not implemented on this platform")]
    CpuPinningUnsupported,
    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn worker thread #{id}")]
    Spawn {
        /// Index of the worker thread.
        id: usize,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Some worker threads panicked before accepting tasks, either in the
    /// initializer or while pinning themselves to a CPU.
    #[error("{count} worker thread(s) failed to start")]
    WorkerStartup {
        /// Number of worker threads that failed.
        count: usize,
    },
    /// The mapped function panicked on some worker threads.
    #[error("{count} worker thread(s) panicked")]
    WorkerPanic {
        /// Number of worker threads that panicked.
        count: usize,
    },
    /// The pool was used after [`shutdown()`](crate::WorkerPool::shutdown).
    #[error("the worker pool has been shut down")]
    ShutDown,
    /// The default pool was requested from a function it is already running,
    /// for example a nested call to [`map()`](crate::map).
    #[error("the default worker pool is busy with an enclosing call")]
    Busy,
}

/// Failure of a [`try_map()`](crate::WorkerPool::try_map) call.
#[derive(Debug, thiserror::Error)]
pub enum MapError<E> {
    /// The mapped function returned an error. When several elements failed,
    /// this is the error of the first one in input order among those that
    /// were evaluated.
    #[error("task function failed: {0}")]
    Task(E),
    /// The pool itself failed.
    #[error(transparent)]
    Pool(#[from] Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::WorkerPanic { count: 2 }.to_string(),
            "2 worker thread(s) panicked"
        );
        assert_eq!(
            MapError::<String>::Task("bad input".to_owned()).to_string(),
            "task function failed: bad input"
        );
        assert_eq!(
            MapError::<String>::from(Error::ShutDown).to_string(),
            "the worker pool has been shut down"
        );
    }

    #[test]
    fn test_source_chain() {
        let error = Error::Spawn {
            id: 3,
            source: io::Error::new(io::ErrorKind::OutOfMemory, "no more threads"),
        };
        let source = std::error::Error::source(&error).unwrap();
        assert_eq!(source.to_string(), "no more threads");
    }
}
