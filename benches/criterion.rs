// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::mem::size_of;

const NUM_WORKERS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[10_000, 100_000, 1_000_000];
const CHUNK_SIZES: &[usize] = &[1, 1_000];

/// Function mapped over the inputs. Cheap enough that the overhead of the
/// pool shows up for small chunks.
fn work(x: u64) -> u64 {
    x.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(17) ^ x
}

fn map(c: &mut Criterion) {
    let mut group = c.benchmark_group("map");
    for len in LENGTHS {
        group.throughput(Throughput::Bytes((len * size_of::<u64>()) as u64));
        group.bench_with_input(BenchmarkId::new("serial", len), len, serial::map);
        for &num_workers in NUM_WORKERS {
            group.bench_with_input(
                BenchmarkId::new(format!("rayon@{num_workers}"), len),
                len,
                |bencher, len| rayon::map(bencher, num_workers, len),
            );
            for &chunk_size in CHUNK_SIZES {
                group.bench_with_input(
                    BenchmarkId::new(format!("ezpool_chunk{chunk_size}@{num_workers}"), len),
                    len,
                    |bencher, len| ezpool::map(bencher, num_workers, chunk_size, len),
                );
            }
        }
    }
    group.finish();
}

fn map_recycled(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_recycled");
    let len = 100_000;
    group.throughput(Throughput::Bytes((len * size_of::<u64>()) as u64));
    for &num_workers in &NUM_WORKERS[1..] {
        for max_tasks in [1, 10, 100] {
            group.bench_with_input(
                BenchmarkId::new(format!("max_tasks{max_tasks}"), num_workers),
                &num_workers,
                |bencher, &num_workers| ezpool::map_recycled(bencher, num_workers, max_tasks, len),
            );
        }
    }
    group.finish();
}

/// Baseline benchmarks using serial iterators (without any multi-threading
/// involved).
mod serial {
    use criterion::{black_box, Bencher};

    pub fn map(bencher: &mut Bencher, len: &usize) {
        let input = (0..*len as u64).collect::<Vec<u64>>();
        bencher.iter(|| {
            black_box(input.as_slice())
                .iter()
                .map(|&x| super::work(x))
                .collect::<Vec<u64>>()
        });
    }
}

/// Benchmarks using Rayon.
mod rayon {
    use criterion::{black_box, Bencher};
    use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

    pub fn map(bencher: &mut Bencher, num_workers: usize, len: &usize) {
        let input = (0..*len as u64).collect::<Vec<u64>>();
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .build()
            .unwrap();
        thread_pool.install(|| {
            bencher.iter(|| {
                black_box(input.as_slice())
                    .par_iter()
                    .map(|&x| super::work(x))
                    .collect::<Vec<u64>>()
            })
        });
    }
}

/// Benchmarks using ezpool.
mod ezpool {
    use criterion::{black_box, Bencher};
    use ezpool::{CpuPinningPolicy, MapOptions, WorkerPoolBuilder};
    use std::num::NonZeroUsize;

    pub fn map(bencher: &mut Bencher, num_workers: usize, chunk_size: usize, len: &usize) {
        let input = (0..*len as u64).collect::<Vec<u64>>();
        let mut pool = WorkerPoolBuilder {
            worker_count: num_workers.into(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
            ..Default::default()
        }
        .build()
        .unwrap();
        let options = MapOptions {
            chunk_size: NonZeroUsize::new(chunk_size).unwrap(),
            force: true,
        };

        bencher.iter(|| {
            pool.map(|&x: &u64| super::work(x), black_box(input.as_slice()), options)
                .unwrap()
                .into_vec()
        });
    }

    pub fn map_recycled(bencher: &mut Bencher, num_workers: usize, max_tasks: usize, len: usize) {
        let input = (0..len as u64).collect::<Vec<u64>>();
        let mut pool = WorkerPoolBuilder {
            worker_count: num_workers.into(),
            max_tasks_per_worker: NonZeroUsize::new(max_tasks),
            ..Default::default()
        }
        .build()
        .unwrap();
        let options = MapOptions {
            chunk_size: NonZeroUsize::new(1_000).unwrap(),
            force: true,
        };

        bencher.iter(|| {
            pool.map(|&x: &u64| super::work(x), black_box(input.as_slice()), options)
                .unwrap()
                .into_vec()
        });
    }
}

criterion_group!(benches, map, map_recycled);
criterion_main!(benches);
