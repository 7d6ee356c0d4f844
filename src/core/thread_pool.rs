// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size thread pool executing range-map pipelines.

use super::pipeline::Pipeline;
use crate::error::InvalidRangeError;
use crate::macros::{log_debug, log_error, log_warn};
use crossbeam_channel::{Receiver, Sender};
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
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    #[default]
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    ///
    /// If the available parallelism can't be determined, this falls back to a
    /// single thread.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().unwrap_or_else(|_e| {
                    log_warn!("Getting the available parallelism failed, using 1 thread: {_e}");
                    NonZeroUsize::MIN
                })
            }
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = InvalidRangeError;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count =
            NonZeroUsize::try_from(thread_count).map_err(|_| InvalidRangeError::ZeroConcurrency)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    #[default]
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool, i.e. the maximal number
    /// of computations running concurrently.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use parastream::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// let pool_builder = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// };
    /// let thread_pool = pool_builder.build();
    ///
    /// let squares = thread_pool.range(5).map(|i| i * i).collect().unwrap();
    /// assert_eq!(squares, [0, 1, 4, 9, 16]);
    /// ```
    pub fn build(&self) -> ThreadPool {
        ThreadPool::new(self)
    }
}

/// A job sent to the worker threads.
type Job = Arc<dyn Pipeline>;

/// A thread pool that can execute range-map pipelines.
///
/// The worker threads are spawned once, and reused by all the pipelines
/// created from this pool (see [`range()`](Self::range)). Each pipeline gets
/// fresh state of its own.
///
/// Dropping the pool waits for the pipelines that were already started to
/// finish, then joins the worker threads. The handles returned by
/// [`MappedRange::subscribe()`](crate::MappedRange::subscribe) and
/// [`MappedRange::stream()`](crate::MappedRange::stream) borrow the pool, so
/// they can't outlive it.
pub struct ThreadPool {
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
    /// Channel to send jobs to the worker threads. This is only [`None`] while
    /// dropping the pool.
    jobs: Option<Sender<Job>>,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> Self {
        let num_threads: usize = builder.num_threads.count().into();
        let cpu_pinning = builder.cpu_pinning;
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let threads = (0..num_threads)
            .map(|id| {
                let context = ThreadContext {
                    id,
                    jobs: receiver.clone(),
                };
                WorkerThreadHandle {
                    handle: std::thread::Builder::new()
                        .name(format!("parastream-worker-{id}"))
                        .spawn(move || {
                            pin_current_thread(id, cpu_pinning);
                            context.run()
                        })
                        .unwrap_or_else(|e| panic!("Failed to spawn worker thread #{id}: {e}")),
                }
            })
            .collect();
        log_debug!("[main thread] Spawned {num_threads} threads");

        Self {
            threads,
            jobs: Some(sender),
        }
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.threads.len()).unwrap_or(NonZeroUsize::MIN)
    }

    /// Hands the given pipeline to the given number of worker threads.
    pub(crate) fn submit(&self, pipeline: Job, num_lanes: usize) {
        let Some(jobs) = &self.jobs else {
            unreachable!("the job channel is only closed when dropping the pool");
        };
        for _ in 0..num_lanes {
            if jobs.send(pipeline.clone()).is_err() {
                log_error!("[main thread] All the worker threads are gone, abandoning the run");
                pipeline.abandon();
                return;
            }
        }
    }
}

impl Drop for ThreadPool {
    /// Joins all the threads in the pool.
    #[allow(clippy::single_match, clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!("[main thread] Notifying threads to finish...");
        // Disconnecting the channel lets the worker threads exit once they have
        // processed all the jobs already sent.
        drop(self.jobs.take());

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");
    }
}

/// Pins the current thread to the CPU of the given index, according to the
/// given policy.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: usize, cpu_pinning: CpuPinningPolicy) {
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

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_id: usize, _cpu_pinning: CpuPinningPolicy) {}

/// Context object owned by a worker thread.
struct ThreadContext {
    /// Thread index.
    id: usize,
    /// Channel to receive jobs from.
    jobs: Receiver<Job>,
}

impl ThreadContext {
    /// Main function run by this thread.
    fn run(&self) {
        log_debug!("[thread {}] Waiting for jobs", self.id);
        for job in self.jobs.iter() {
            log_debug!("[thread {}] Received a job. Processing...", self.id);
            job.run(self.id);
        }
        log_debug!("[thread {}] Job channel closed, exiting", self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_thread_count_try_from_usize() {
        assert_eq!(
            ThreadCount::try_from(0),
            Err(InvalidRangeError::ZeroConcurrency)
        );
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_build_thread_pool_available_parallelism() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();

        let sum = thread_pool
            .range(11)
            .map(|i| i)
            .collect()
            .unwrap()
            .into_iter()
            .sum::<usize>();
        assert_eq!(sum, 5 * 11);
    }

    #[test]
    fn test_build_thread_pool_fixed_thread_count() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(4).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();

        let sum = thread_pool
            .range(11)
            .map(|i| i)
            .collect()
            .unwrap()
            .into_iter()
            .sum::<usize>();
        assert_eq!(sum, 5 * 11);
    }

    #[test]
    fn test_build_thread_pool_cpu_pinning_if_supported() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();

        let sum = thread_pool
            .range(11)
            .map(|i| i)
            .collect()
            .unwrap()
            .into_iter()
            .sum::<usize>();
        assert_eq!(sum, 5 * 11);
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    #[should_panic = "Pinning threads to CPUs is not implemented on this platform."]
    fn test_build_thread_pool_cpu_pinning_always_not_supported() {
        ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .build();
    }

    #[test]
    fn test_num_threads() {
        let thread_pool = ThreadPoolBuilder::default().build();
        assert_eq!(
            thread_pool.num_threads(),
            std::thread::available_parallelism().unwrap()
        );

        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(4).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();
        assert_eq!(
            thread_pool.num_threads(),
            NonZeroUsize::try_from(4).unwrap()
        );
    }

    #[test]
    fn test_drop_waits_for_started_runs() {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();

        let (sender, receiver) = std::sync::mpsc::channel();
        thread_pool
            .range(20)
            .map(|i| {
                std::thread::sleep(std::time::Duration::from_millis(1));
                i
            })
            .subscribe(|_, _, _| ())
            .unwrap()
            .then(move |outcome| sender.send(outcome).unwrap());
        drop(thread_pool);

        assert_eq!(receiver.recv().unwrap().unwrap().len(), 20);
    }
}
