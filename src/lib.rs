// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]

mod core;
mod error;
mod macros;
mod pool;
mod registry;

pub use crate::core::{CpuPinningPolicy, Initializer};
pub use error::{Error, MapError};
pub use pool::{MapOptions, Mapped, WorkerCount, WorkerPool, WorkerPoolBuilder};
pub use registry::{
    configure_default, configure_default_with, default_pool, map, resolve_pool, try_map,
    SharedPool,
};
