// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: worker threads, chunked map pipelines and synchronization
//! primitives.

mod pipeline;
mod sync;
mod thread_pool;
mod util;

pub use thread_pool::{CpuPinningPolicy, Initializer};
pub(crate) use thread_pool::{is_worker_thread, ThreadPoolImpl, WorkerSettings};
