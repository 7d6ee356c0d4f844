// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::mem::size_of;

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[1_000, 10_000, 100_000];
const ROW_COUNTS: &[usize] = &[64, 256];
const ROW_WIDTH: usize = 1024;

fn squares(c: &mut Criterion) {
    let mut group = c.benchmark_group("squares");
    for len in LENGTHS {
        group.throughput(Throughput::Bytes((len * size_of::<u64>()) as u64));
        group.bench_with_input(BenchmarkId::new("serial", len), len, serial::squares);
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("rayon@{num_threads}"), len),
                len,
                |bencher, len| rayon::squares(bencher, num_threads, len),
            );
            for chunk_size in [1, 64] {
                group.bench_with_input(
                    BenchmarkId::new(format!("parastream_chunk{chunk_size}@{num_threads}"), len),
                    len,
                    |bencher, len| parastream::squares(bencher, num_threads, chunk_size, len),
                );
            }
        }
    }
    group.finish();
}

fn rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("rows");
    for len in ROW_COUNTS {
        group.throughput(Throughput::Bytes((len * ROW_WIDTH) as u64));
        group.bench_with_input(BenchmarkId::new("serial", len), len, serial::rows);
        for &num_threads in NUM_THREADS {
            group.bench_with_input(
                BenchmarkId::new(format!("rayon@{num_threads}"), len),
                len,
                |bencher, len| rayon::rows(bencher, num_threads, len),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("parastream_stream@{num_threads}"), len),
                len,
                |bencher, len| parastream::rows(bencher, num_threads, len),
            );
        }
    }
    group.finish();
}

/// A row of escape times, expensive enough to make parallelism worthwhile.
fn render_row(y: usize, height: usize) -> Vec<u8> {
    let ci = (y as f64 / height as f64) * 2.4 - 1.2;
    (0..ROW_WIDTH)
        .map(|x| {
            let cr = (x as f64 / ROW_WIDTH as f64) * 3.5 - 2.5;
            let (mut zr, mut zi) = (0.0f64, 0.0f64);
            let mut n = 0u8;
            while n < u8::MAX && zr * zr + zi * zi <= 4.0 {
                (zr, zi) = (zr * zr - zi * zi + cr, 2.0 * zr * zi + ci);
                n += 1;
            }
            n
        })
        .collect()
}

/// Baseline benchmarks computing the results one after the other.
mod serial {
    use super::render_row;
    use criterion::{black_box, Bencher};

    pub fn squares(bencher: &mut Bencher, len: &usize) {
        bencher.iter(|| {
            (0..black_box(*len) as u64)
                .map(|i| i * i)
                .collect::<Vec<u64>>()
        });
    }

    pub fn rows(bencher: &mut Bencher, len: &usize) {
        let height = *len;
        bencher.iter(|| {
            (0..black_box(height))
                .map(|y| render_row(y, height))
                .map(|row| row.iter().map(|&x| x as u64).sum::<u64>())
                .sum::<u64>()
        });
    }
}

/// Benchmarks using Rayon.
mod rayon {
    use super::render_row;
    use criterion::{black_box, Bencher};
    use rayon::iter::{IntoParallelIterator, ParallelIterator};

    pub fn squares(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();
        thread_pool.install(|| {
            bencher.iter(|| {
                (0..black_box(*len) as u64)
                    .into_par_iter()
                    .map(|i| i * i)
                    .collect::<Vec<u64>>()
            })
        });
    }

    pub fn rows(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let height = *len;
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap();
        thread_pool.install(|| {
            bencher.iter(|| {
                // Rayon has no ordered streaming, so the rows are collected
                // before being consumed in order.
                (0..black_box(height))
                    .into_par_iter()
                    .map(|y| render_row(y, height))
                    .collect::<Vec<_>>()
                    .iter()
                    .map(|row| row.iter().map(|&x| x as u64).sum::<u64>())
                    .sum::<u64>()
            })
        });
    }
}

/// Benchmarks using Parastream.
mod parastream {
    use super::render_row;
    use criterion::{black_box, Bencher};
    use parastream::{CpuPinningPolicy, RunOptions, ThreadCount, ThreadPoolBuilder};
    use std::num::NonZeroUsize;

    pub fn squares(bencher: &mut Bencher, num_threads: usize, chunk_size: usize, len: &usize) {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();
        let options = RunOptions {
            chunk_size: NonZeroUsize::new(chunk_size).unwrap(),
            buffer_cap: None,
        };

        bencher.iter(|| {
            thread_pool
                .range(black_box(*len))
                .with_options(options)
                .map(|i| (i as u64) * (i as u64))
                .collect()
                .unwrap()
        });
    }

    pub fn rows(bencher: &mut Bencher, num_threads: usize, len: &usize) {
        let height = *len;
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();
        let options = RunOptions {
            chunk_size: NonZeroUsize::MIN,
            buffer_cap: NonZeroUsize::new(2 * num_threads),
        };

        bencher.iter(|| {
            let mut rows = thread_pool
                .range(black_box(height))
                .with_options(options)
                .map(move |y| render_row(y, height))
                .stream()
                .unwrap();
            let checksum = rows
                .by_ref()
                .map(|row| row.value.iter().map(|&x| x as u64).sum::<u64>())
                .sum::<u64>();
            rows.finish().unwrap();
            checksum
        });
    }
}

criterion_group!(benches, squares, rows);
criterion_main!(benches);
