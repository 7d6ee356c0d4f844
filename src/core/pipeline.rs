// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pipelines to execute on worker threads.

use super::queue::UnitQueue;
use super::sequencer::{Event, Sequencer, SequencerState};
use super::unit::{Completion, WorkUnit};
#[cfg(feature = "log_parallelism")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error};
use crate::pipeline::{PipelineState, SharedState};
use crossbeam_channel::Sender;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Function computing the result at an index.
pub type ComputeFn<T, E> = dyn Fn(usize) -> Result<T, E> + Send + Sync;

/// A pipeline is a task to run on worker threads. Each worker thread that
/// receives it processes units of work until the pipeline is exhausted.
pub trait Pipeline: Send + Sync {
    /// Runs this pipeline on the given worker thread.
    fn run(&self, worker_id: usize);

    /// Terminates this pipeline with a failure, because it won't receive the
    /// worker threads it expects.
    fn abandon(&self);
}

/// The state of one range-map run, shared by all the worker threads that
/// process it.
pub struct RangeMapPipelineImpl<T, E> {
    /// Units of work left to process.
    queue: UnitQueue,
    /// Function to apply on each index.
    compute: Arc<ComputeFn<T, E>>,
    /// Reorder buffer for the completions.
    sequencer: Mutex<Sequencer<T, E>>,
    /// Channel of ordered events, towards the consumer.
    events: Sender<Event<T, E>>,
    /// State observable by the user.
    state: Arc<SharedState>,
    /// Number of worker threads that haven't finished with this pipeline yet.
    active_lanes: CachePadded<AtomicUsize>,
    /// Dispatch statistics.
    #[cfg(feature = "log_parallelism")]
    stats: RunStats,
}

#[cfg(feature = "log_parallelism")]
#[derive(Default)]
struct RunStats {
    /// Number of units handed out to worker threads.
    units: AtomicUsize,
    /// Number of indices computed.
    computed: AtomicUsize,
}

impl<T: Send, E: Send> RangeMapPipelineImpl<T, E> {
    /// Creates a pipeline to be processed by the given number of worker
    /// threads.
    pub fn new(
        queue: UnitQueue,
        compute: Arc<ComputeFn<T, E>>,
        events: Sender<Event<T, E>>,
        state: Arc<SharedState>,
        num_lanes: usize,
        total: usize,
    ) -> Self {
        Self {
            queue,
            compute,
            sequencer: Mutex::new(Sequencer::new(total)),
            events,
            state,
            active_lanes: CachePadded::new(AtomicUsize::new(num_lanes)),
            #[cfg(feature = "log_parallelism")]
            stats: RunStats::default(),
        }
    }

    /// Resolves the pipeline right away if there is nothing to compute.
    pub fn start(&self) {
        let mut sequencer = self.lock_sequencer();
        sequencer.start(|event| self.send(event));
    }

    fn lock_sequencer(&self) -> MutexGuard<'_, Sequencer<T, E>> {
        // The sequencer doesn't call user code, so a poisoned lock can only come
        // from a panic that didn't interrupt an update.
        self.sequencer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Passes a completion to the sequencer, forwarding the resulting events to
    /// the consumer.
    fn sequence(&self, completion: Completion<T, E>) {
        let mut sequencer = self.lock_sequencer();
        // Events are sent while holding the lock, so that the channel order is
        // the index order.
        let state = sequencer.accept(completion, |event| self.send(event));
        if state == SequencerState::Sequencing {
            self.queue.release(sequencer.next_expected());
        }
    }

    /// Sends an event to the consumer.
    ///
    /// The consumer settles the user-visible state once it has received the
    /// terminal event. If it is gone, the state is settled here instead.
    fn send(&self, event: Event<T, E>) {
        let terminal = match &event {
            Event::Emit(_) => None,
            Event::Completed => Some(PipelineState::Completed),
            Event::Failed(_failure) => {
                log_debug!("Run failed at index {}", _failure.index);
                self.queue.stop();
                Some(PipelineState::Failed)
            }
        };
        if self.events.send(event).is_err() {
            log_debug!("The consumer is gone, stopping the run");
            self.queue.stop();
            if let Some(terminal) = terminal {
                self.state.settle(terminal);
            }
        }
    }

    /// Hook called when a worker thread is done with this pipeline.
    fn finish_lane(&self, _worker_id: usize) {
        let lane_count = self.active_lanes.fetch_sub(1, Ordering::SeqCst);
        assert!(lane_count > 0);
        log_debug!(
            "[thread {_worker_id}] Done with this run, {} thread(s) remaining.",
            lane_count - 1
        );
        if lane_count != 1 {
            return;
        }

        // We're the last thread: every index that needed computing has been
        // sequenced by now.
        let mut sequencer = self.lock_sequencer();
        if sequencer.state() == SequencerState::Sequencing {
            log_error!(
                "[thread {_worker_id}] All threads drained but index {} was never sequenced",
                sequencer.next_expected()
            );
            sequencer.abandon(|event| self.send(event));
        }
        debug_assert_eq!(sequencer.num_pending(), 0);
        log_debug!(
            "[thread {_worker_id}] Run drained: {} completion(s) discarded.",
            sequencer.num_discarded()
        );
        #[cfg(feature = "log_parallelism")]
        self.print_statistics();
    }

    #[cfg(feature = "log_parallelism")]
    fn print_statistics(&self) {
        log_info!("Run statistics:");
        log_info!("- units: {}", self.stats.units.load(Ordering::Relaxed));
        log_info!("- computed: {}", self.stats.computed.load(Ordering::Relaxed));
    }
}

impl<T: Send, E: Send> Pipeline for RangeMapPipelineImpl<T, E> {
    fn run(&self, worker_id: usize) {
        // Regardless of the outcome (success or panic), the pipeline must learn
        // that this thread has finished working on it. This happens when the
        // notifier is dropped (whether at the end of this scope or when a panic
        // is unwound).
        let notifier = LaneNotifier {
            worker_id,
            pipeline: self,
        };

        while let Some(indices) = self.queue.next_unit() {
            #[cfg(feature = "log_parallelism")]
            self.stats.units.fetch_add(1, Ordering::Relaxed);

            let unit = WorkUnit::new(indices, &*self.compute);
            for index in unit.indices() {
                if !self.queue.is_dispatchable(index) {
                    break;
                }
                let completion = unit.execute(index);
                #[cfg(feature = "log_parallelism")]
                self.stats.computed.fetch_add(1, Ordering::Relaxed);
                if completion.outcome.is_err() {
                    // Everything below this index has been dispatched already,
                    // so nothing above it is needed anymore.
                    self.queue.halt_after(index);
                }
                self.sequence(completion);
            }
        }

        // Explicit drop for clarity.
        drop(notifier);
    }

    fn abandon(&self) {
        self.queue.stop();
        let mut sequencer = self.lock_sequencer();
        sequencer.abandon(|event| self.send(event));
    }
}

/// Object whose destructor notifies the pipeline that a worker thread has
/// finished processing it (or has panicked).
struct LaneNotifier<'a, T: Send, E: Send> {
    /// Thread index.
    worker_id: usize,
    /// Pipeline that the thread was processing.
    pipeline: &'a RangeMapPipelineImpl<T, E>,
}

impl<T: Send, E: Send> Drop for LaneNotifier<'_, T, E> {
    fn drop(&mut self) {
        // User computations are already guarded against panics, so a panic here
        // means that the run can't make progress anymore.
        if std::thread::panicking() {
            log_error!(
                "[thread {}] Detected panic in this thread, abandoning the run",
                self.worker_id
            );
            self.pipeline.abandon();
        }
        self.pipeline.finish_lane(self.worker_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{ComputeError, SequenceFailure};
    use crate::pipeline::Emission;
    use std::num::NonZeroUsize;

    fn make_pipeline<T: Send, E: Send>(
        len: usize,
        compute: impl Fn(usize) -> Result<T, E> + Send + Sync + 'static,
        num_lanes: usize,
    ) -> (
        RangeMapPipelineImpl<T, E>,
        crossbeam_channel::Receiver<Event<T, E>>,
        Arc<SharedState>,
    ) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let state = Arc::new(SharedState::new(PipelineState::Running));
        let pipeline = RangeMapPipelineImpl::new(
            UnitQueue::new(len, NonZeroUsize::new(2).unwrap(), None),
            Arc::new(compute),
            sender,
            state.clone(),
            num_lanes,
            len,
        );
        (pipeline, receiver, state)
    }

    #[test]
    fn single_lane_run() {
        let (pipeline, receiver, state) = make_pipeline(3, |i| Ok::<_, ()>(i + 1), 1);
        pipeline.run(0);

        let events = receiver.try_iter().collect::<Vec<_>>();
        assert_eq!(
            events,
            vec![
                Event::Emit(Emission {
                    index: 0,
                    total: 3,
                    value: 1
                }),
                Event::Emit(Emission {
                    index: 1,
                    total: 3,
                    value: 2
                }),
                Event::Emit(Emission {
                    index: 2,
                    total: 3,
                    value: 3
                }),
                Event::Completed,
            ]
        );
        // Settling is up to the consumer.
        assert_eq!(state.get(), PipelineState::Running);
    }

    #[test]
    fn failure_stops_the_lane() {
        let (pipeline, receiver, state) = make_pipeline(
            100,
            |i| if i == 1 { Err("boom") } else { Ok(i) },
            1,
        );
        pipeline.run(0);

        let events = receiver.try_iter().collect::<Vec<_>>();
        assert_eq!(
            events,
            vec![
                Event::Emit(Emission {
                    index: 0,
                    total: 100,
                    value: 0
                }),
                Event::Failed(SequenceFailure {
                    index: 1,
                    error: ComputeError::Failed("boom"),
                }),
            ]
        );
        assert_eq!(state.get(), PipelineState::Running);
        assert!(!pipeline.queue.is_dispatchable(2));
    }

    #[test]
    fn abandon_before_any_lane() {
        let (pipeline, receiver, state) = make_pipeline(4, |i| Ok::<_, ()>(i), 2);
        pipeline.abandon();

        let events = receiver.try_iter().collect::<Vec<_>>();
        assert_eq!(
            events,
            vec![Event::Failed(SequenceFailure {
                index: 0,
                error: ComputeError::Abandoned,
            })]
        );
        assert_eq!(state.get(), PipelineState::Running);
    }

    #[test]
    fn dropped_consumer_stops_the_run() {
        let (pipeline, receiver, state) = make_pipeline(1000, |i| Ok::<_, ()>(i), 1);
        drop(receiver);
        pipeline.run(0);
        // The first send fails and stops the queue after the first unit.
        assert!(!pipeline.queue.is_dispatchable(0));
        // The last lane abandons the run, with nobody left to settle it.
        assert_eq!(state.get(), PipelineState::Failed);
    }

    #[test]
    fn dropped_consumer_settles_completion() {
        let (pipeline, receiver, state) = make_pipeline(0, |i| Ok::<_, ()>(i), 1);
        drop(receiver);
        pipeline.start();
        assert_eq!(state.get(), PipelineState::Completed);
    }
}
