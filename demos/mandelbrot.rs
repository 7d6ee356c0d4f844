// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Renders the Mandelbrot set one row per index, streaming the rows in order
//! to a PGM image (or just checksumming them) while later rows are still
//! being computed.

use clap::Parser;
use parastream::{CpuPinningPolicy, RunOptions, ThreadCount, ThreadPoolBuilder};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let thread_pool = ThreadPoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: if cli.pin_cpus {
            CpuPinningPolicy::IfSupported
        } else {
            CpuPinningPolicy::No
        },
    }
    .build();

    let mut output = match &cli.output {
        Some(path) => {
            let mut file = BufWriter::new(File::create(path)?);
            write!(file, "P5\n{} {}\n255\n", cli.width, cli.height)?;
            Some(file)
        }
        None => None,
    };

    let width = cli.width;
    let height = cli.height;
    let max_iterations = cli.max_iterations;
    let start = Instant::now();

    let mut rows = thread_pool
        .range(height)
        .with_options(RunOptions {
            chunk_size: cli.chunk_size,
            buffer_cap: cli.buffer_cap,
        })
        .map(move |y| render_row(y, width, height, max_iterations))
        .stream()?;

    let mut checksum = 0u64;
    for row in rows.by_ref() {
        checksum = row
            .value
            .iter()
            .fold(checksum, |acc, &x| acc.wrapping_mul(31).wrapping_add(x as u64));
        if let Some(file) = &mut output {
            file.write_all(&row.value)?;
        }
    }
    let num_rows = rows.finish()?;
    if let Some(mut file) = output {
        file.flush()?;
    }

    println!(
        "rendered {num_rows} rows of {width} pixels on {} thread(s) in {:?}, checksum = {checksum:#018x}",
        thread_pool.num_threads(),
        start.elapsed()
    );
    Ok(())
}

/// Computes the escape time of each pixel of a row, scaled to 8 bits.
fn render_row(y: usize, width: usize, height: usize, max_iterations: u32) -> Vec<u8> {
    let ci = (y as f64 / height as f64) * 2.4 - 1.2;
    (0..width)
        .map(|x| {
            let cr = (x as f64 / width as f64) * 3.5 - 2.5;
            let (mut zr, mut zi) = (0.0f64, 0.0f64);
            let mut n = 0;
            while n < max_iterations && zr * zr + zi * zi <= 4.0 {
                (zr, zi) = (zr * zr - zi * zi + cr, 2.0 * zr * zi + ci);
                n += 1;
            }
            (n as u64 * 255 / max_iterations as u64) as u8
        })
        .collect()
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of worker threads. Defaults to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,
    /// Pin the worker threads to CPUs, where supported.
    #[arg(long)]
    pin_cpus: bool,
    /// Image width, in pixels.
    #[arg(long, default_value_t = 2000)]
    width: usize,
    /// Image height, in pixels. Each row is one index of the range.
    #[arg(long, default_value_t = 2000)]
    height: usize,
    /// Maximal number of iterations per pixel.
    #[arg(long, default_value_t = 255, value_parser = clap::value_parser!(u32).range(1..))]
    max_iterations: u32,
    /// Number of consecutive rows that a worker thread takes at once.
    #[arg(long, default_value_t = NonZeroUsize::MIN)]
    chunk_size: NonZeroUsize,
    /// Maximal number of rows computed ahead of the output.
    #[arg(long)]
    buffer_cap: Option<NonZeroUsize>,
    /// Path of a PGM file to write the image to.
    #[arg(long)]
    output: Option<PathBuf>,
}
