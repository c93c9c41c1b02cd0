// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to map a function over a range of numbers with a worker pool.

use clap::{Parser, ValueEnum};
use ezpool::{CpuPinningPolicy, MapOptions, WorkerCount, WorkerPoolBuilder};
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let builder = WorkerPoolBuilder {
        worker_count: match cli.workers {
            Some(workers) => WorkerCount::from(workers),
            None => WorkerCount::AvailableParallelism,
        },
        initializer: Some(Arc::new(|| {
            let thread = std::thread::current();
            eprintln!("initialized {}", thread.name().unwrap_or("<unnamed>"));
        })),
        max_tasks_per_worker: cli.max_tasks_per_worker,
        cpu_pinning: match cli.cpu_pinning {
            CpuPinningCli::No => CpuPinningPolicy::No,
            CpuPinningCli::IfSupported => CpuPinningPolicy::IfSupported,
            CpuPinningCli::Always => CpuPinningPolicy::Always,
        },
    };
    let options = MapOptions {
        chunk_size: cli.chunk_size,
        force: cli.force,
    };

    let result = builder.scope(|pool| {
        let start = Instant::now();
        let outputs = pool.map(collatz_steps, 1..=cli.input_size, options)?;
        let lazy = outputs.is_lazy();
        let max = black_box(outputs).enumerate().max_by_key(|&(_, steps)| steps);
        println!(
            "{} worker(s), lazy = {lazy}, elapsed = {:?}",
            pool.worker_count(),
            start.elapsed()
        );
        if let Some((index, steps)) = max {
            println!("longest Collatz sequence: {} ({steps} steps)", index + 1);
        }
        Ok::<(), ezpool::Error>(())
    });

    match result.and_then(|inner| inner) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Number of steps for the Collatz sequence starting at `n` to reach 1.
fn collatz_steps(mut n: u64) -> u32 {
    let mut steps = 0;
    while n > 1 {
        n = if n % 2 == 0 { n / 2 } else { 3 * n + 1 };
        steps += 1;
    }
    steps
}

/// CLI tool to map a function over a range of numbers with a worker pool.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of workers. Default to the available parallelism. A value of 0
    /// means a single worker.
    #[arg(long)]
    workers: Option<usize>,

    /// Number of contiguous items sent to a worker thread at once.
    #[arg(long, default_value = "1000")]
    chunk_size: NonZeroUsize,

    /// Number of chunks after which a worker thread is replaced.
    #[arg(long)]
    max_tasks_per_worker: Option<NonZeroUsize>,

    /// Policy to pin worker threads to CPUs.
    #[arg(long, value_enum, default_value_t = CpuPinningCli::No)]
    cpu_pinning: CpuPinningCli,

    /// Number of items in the input.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: u64,

    /// Whether to evaluate eagerly with a single worker.
    #[arg(long, default_value_t = false)]
    force: bool,
}

/// Policy to pin worker threads to CPUs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CpuPinningCli {
    /// Don't pin worker threads.
    No,
    /// Pin worker threads if the platform supports it.
    IfSupported,
    /// Pin worker threads, failing if the platform doesn't support it.
    Always,
}
