// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Range-map pipelines: building, running and consuming them.

use crate::core::pipeline::{ComputeFn, RangeMapPipelineImpl};
use crate::core::queue::UnitQueue;
use crate::core::sequencer::Event;
use crate::core::util::{panic_message, Status};
use crate::core::ThreadPool;
use crate::error::{ComputeError, InvalidRangeError, InvalidStateError, SequenceFailure};
use crate::macros::{log_debug, log_error};
use crossbeam_channel::Receiver;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Final outcome of a run: all the results in index order, or the first
/// failure in index order.
pub type Outcome<T, E> = Result<Vec<T>, SequenceFailure<E>>;

/// Lifecycle of a pipeline.
///
/// ```text
/// Idle ──subscribe──► Running ──┬──► Completed
///                               └──► Failed
/// ```
///
/// Both terminal states are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    /// Nothing has been dispatched yet.
    Idle = 0,
    /// Results are being computed or delivered.
    Running = 1,
    /// All the results have been delivered to the consumer.
    Completed = 2,
    /// The run failed, was cancelled, or its consumer panicked.
    Failed = 3,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Idle,
            1 => PipelineState::Running,
            2 => PipelineState::Completed,
            3 => PipelineState::Failed,
            _ => unreachable!("invalid pipeline state {value}"),
        }
    }
}

/// A [`PipelineState`] that can be shared between threads.
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn new(state: PipelineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Transitions from [`PipelineState::Idle`] to
    /// [`PipelineState::Running`], or returns the current state if the
    /// pipeline isn't idle.
    fn begin(&self) -> Result<(), PipelineState> {
        self.0
            .compare_exchange(
                PipelineState::Idle as u8,
                PipelineState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(PipelineState::from_u8)
    }

    /// Transitions from [`PipelineState::Running`] to the given terminal
    /// state. This has no effect if a terminal state was already reached: the
    /// first side to settle (consumer or worker threads) wins.
    pub(crate) fn settle(&self, terminal: PipelineState) {
        debug_assert!(matches!(
            terminal,
            PipelineState::Completed | PipelineState::Failed
        ));
        if let Err(_state) = self.0.compare_exchange(
            PipelineState::Running as u8,
            terminal as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            log_debug!(
                "Ignoring transition to {terminal:?} from {:?}",
                PipelineState::from_u8(_state)
            );
        }
    }
}

/// A successful result, delivered in index order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Emission<T> {
    /// Index of this result.
    pub index: usize,
    /// Total number of indices in the range.
    pub total: usize,
    /// Result of the computation at this index.
    pub value: T,
}

/// Options for a single run of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOptions {
    /// Number of consecutive indices that a worker thread takes at once.
    pub chunk_size: NonZeroUsize,
    /// Maximal distance between the next index to deliver and the indices
    /// that worker threads may start computing. With [`None`], workers never
    /// wait for the results to be consumed.
    ///
    /// This also caps the number of ordered results waiting for the consumer,
    /// which bounds the memory used by a run whose consumer is slower than
    /// the computation.
    pub buffer_cap: Option<NonZeroUsize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            chunk_size: NonZeroUsize::MIN,
            buffer_cap: None,
        }
    }
}

/// Error of [`MappedRange::collect()`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError<E> {
    /// The pipeline had already been started.
    #[error("{0}")]
    InvalidState(InvalidStateError),
    /// The run failed.
    #[error("{0}")]
    Failed(SequenceFailure<E>),
}

impl<E> From<InvalidStateError> for RunError<E> {
    fn from(e: InvalidStateError) -> Self {
        RunError::InvalidState(e)
    }
}

impl<E> From<SequenceFailure<E>> for RunError<E> {
    fn from(e: SequenceFailure<E>) -> Self {
        RunError::Failed(e)
    }
}

impl ThreadPool {
    /// Starts building a pipeline over the indices `0..len`.
    ///
    /// ```
    /// # use parastream::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # let thread_pool = ThreadPoolBuilder {
    /// #     num_threads: ThreadCount::try_from(4).unwrap(),
    /// #     cpu_pinning: CpuPinningPolicy::No,
    /// # }
    /// # .build();
    /// let rows = thread_pool.range(3).map(|y| vec![y; 4]).collect().unwrap();
    /// assert_eq!(rows, [[0; 4], [1; 4], [2; 4]]);
    /// ```
    pub fn range(&self, len: usize) -> RangeBuilder<'_> {
        RangeBuilder {
            thread_pool: self,
            len,
            options: RunOptions::default(),
        }
    }

    /// Starts building a pipeline over the indices `0..len`, validating a
    /// signed length.
    ///
    /// ```
    /// # use parastream::{InvalidRangeError, ThreadPoolBuilder};
    /// # let thread_pool = ThreadPoolBuilder::default().build();
    /// assert_eq!(
    ///     thread_pool.range_checked(-1).err(),
    ///     Some(InvalidRangeError::NegativeLength(-1))
    /// );
    /// assert_eq!(thread_pool.range_checked(10).unwrap().len(), 10);
    /// ```
    pub fn range_checked(&self, len: i64) -> Result<RangeBuilder<'_>, InvalidRangeError> {
        if len < 0 {
            return Err(InvalidRangeError::NegativeLength(len));
        }
        let len = usize::try_from(len).map_err(|_| InvalidRangeError::TooLong(len))?;
        Ok(self.range(len))
    }
}

/// A range of indices waiting for a function to map them with.
#[must_use = "pipelines are lazy"]
pub struct RangeBuilder<'pool> {
    thread_pool: &'pool ThreadPool,
    len: usize,
    options: RunOptions,
}

impl<'pool> RangeBuilder<'pool> {
    /// Number of indices in this range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the options for running this range.
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Attaches an infallible function computing the result at each index.
    ///
    /// The function may still panic, which fails the run at the panicking
    /// index.
    pub fn map<T, F>(self, f: F) -> MappedRange<'pool, T, Infallible>
    where
        T: Send + 'static,
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        self.try_map(move |i| Ok(f(i)))
    }

    /// Attaches a fallible function computing the result at each index.
    ///
    /// ```
    /// # use parastream::{ComputeError, SequenceFailure, ThreadPoolBuilder};
    /// # let thread_pool = ThreadPoolBuilder::default().build();
    /// let failure = thread_pool
    ///     .range(100)
    ///     .try_map(|i| if i % 10 == 7 { Err(i) } else { Ok(i) })
    ///     .subscribe(|_, _, _| ())
    ///     .unwrap()
    ///     .wait()
    ///     .unwrap_err();
    /// assert_eq!(
    ///     failure,
    ///     SequenceFailure {
    ///         index: 7,
    ///         error: ComputeError::Failed(7)
    ///     }
    /// );
    /// ```
    pub fn try_map<T, E, F>(self, f: F) -> MappedRange<'pool, T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Fn(usize) -> Result<T, E> + Send + Sync + 'static,
    {
        MappedRange {
            thread_pool: self.thread_pool,
            len: self.len,
            options: self.options,
            compute: Arc::new(f),
            state: Arc::new(SharedState::new(PipelineState::Idle)),
        }
    }
}

/// A pipeline ready to run: a range of indices and the function to compute at
/// each of them.
///
/// A pipeline runs at most once, either via [`subscribe()`](Self::subscribe)
/// or via [`stream()`](Self::stream).
#[must_use = "pipelines are lazy"]
pub struct MappedRange<'pool, T, E> {
    thread_pool: &'pool ThreadPool,
    len: usize,
    options: RunOptions,
    compute: Arc<ComputeFn<T, E>>,
    state: Arc<SharedState>,
}

impl<'pool, T: Send + 'static, E: Send + 'static> MappedRange<'pool, T, E> {
    /// Current state of this pipeline.
    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Starts the run on the thread pool, returning the channel of ordered
    /// events.
    fn start(&self, operation: &'static str) -> Result<Receiver<Event<T, E>>, InvalidStateError> {
        self.state
            .begin()
            .map_err(|state| InvalidStateError { state, operation })?;

        let (sender, receiver) = match self.options.buffer_cap {
            Some(cap) => crossbeam_channel::bounded(cap.get()),
            None => crossbeam_channel::unbounded(),
        };
        let queue = UnitQueue::new(self.len, self.options.chunk_size, self.options.buffer_cap);
        let num_lanes = std::cmp::min(self.thread_pool.num_threads().get(), queue.num_units());
        log_debug!(
            "[main thread] Starting a run over {} indices on {num_lanes} thread(s) with {:?}",
            self.len,
            self.options
        );

        let pipeline = Arc::new(RangeMapPipelineImpl::new(
            queue,
            self.compute.clone(),
            sender,
            self.state.clone(),
            num_lanes,
            self.len,
        ));
        pipeline.start();
        if num_lanes != 0 {
            self.thread_pool.submit(pipeline, num_lanes);
        }
        Ok(receiver)
    }

    /// Starts the run, calling `on_emit(&result, index, total)` for each
    /// successful result, strictly in index order.
    ///
    /// The callback runs on a dedicated delivery thread, so a slow callback
    /// doesn't hold back the worker threads (unless a
    /// [`buffer_cap`](RunOptions::buffer_cap) is set). It isn't called past
    /// the first failing index. If it panics, the run is cancelled and fails
    /// with [`ComputeError::Panicked`] at the index being delivered.
    ///
    /// The pipeline only reaches a terminal [state](Self::state) once the
    /// callback has been called for every result it receives.
    ///
    /// Fails if this pipeline has already been started.
    ///
    /// ```
    /// # use parastream::ThreadPoolBuilder;
    /// # use std::sync::mpsc::channel;
    /// # let thread_pool = ThreadPoolBuilder::default().build();
    /// let (sender, receiver) = channel();
    /// let pipeline = thread_pool.range(5).map(|i| i * i);
    /// let subscription = pipeline
    ///     .subscribe(|square, index, total| println!("{index}/{total}: {square}"))
    ///     .unwrap();
    /// subscription.then(move |outcome| sender.send(outcome).unwrap());
    /// assert_eq!(receiver.recv().unwrap(), Ok(vec![0, 1, 4, 9, 16]));
    ///
    /// // A pipeline only runs once.
    /// assert!(pipeline.subscribe(|_, _, _| ()).is_err());
    /// ```
    pub fn subscribe(
        &self,
        on_emit: impl FnMut(&T, usize, usize) + Send + 'static,
    ) -> Result<Subscription<'pool, T, E>, InvalidStateError> {
        let receiver = self.start("subscribe to")?;
        let settlement = Arc::new(Settlement::new());
        std::thread::Builder::new()
            .name("parastream-delivery".to_owned())
            .spawn({
                let settlement = settlement.clone();
                let state = self.state.clone();
                let total = self.len;
                move || {
                    let outcome = deliver(receiver, on_emit, total);
                    state.settle(if outcome.is_ok() {
                        PipelineState::Completed
                    } else {
                        PipelineState::Failed
                    });
                    settlement.settle(outcome);
                }
            })
            .unwrap_or_else(|e| panic!("Failed to spawn the delivery thread: {e}"));

        Ok(Subscription {
            settlement,
            state: self.state.clone(),
            len: self.len,
            _pool: PhantomData,
        })
    }

    /// Starts the run, returning an iterator over the successful results in
    /// index order, consumed on the calling thread.
    ///
    /// Results are handed over without being retained, so that a large output
    /// can be processed piece by piece. Dropping the iterator early cancels
    /// the rest of the run.
    ///
    /// Fails if this pipeline has already been started.
    ///
    /// ```
    /// # use parastream::{RunOptions, ThreadPoolBuilder};
    /// # use std::num::NonZeroUsize;
    /// # let thread_pool = ThreadPoolBuilder::default().build();
    /// let mut rows = thread_pool
    ///     .range(1000)
    ///     .with_options(RunOptions {
    ///         buffer_cap: NonZeroUsize::new(16),
    ///         ..Default::default()
    ///     })
    ///     .map(|y| vec![y as u8; 1000])
    ///     .stream()
    ///     .unwrap();
    ///
    /// let mut checksum = 0u64;
    /// for row in rows.by_ref() {
    ///     checksum += row.value.iter().map(|&x| x as u64).sum::<u64>();
    /// }
    /// assert_eq!(rows.finish(), Ok(1000));
    /// assert_eq!(checksum, (0..1000u64).map(|y| (y % 256) * 1000).sum::<u64>());
    /// ```
    pub fn stream(&self) -> Result<Emissions<'pool, T, E>, InvalidStateError> {
        let receiver = self.start("stream")?;
        Ok(Emissions {
            receiver,
            state: self.state.clone(),
            len: self.len,
            emitted: 0,
            outcome: None,
            _pool: PhantomData,
        })
    }

    /// Runs this pipeline and collects all the results in index order.
    pub fn collect(&self) -> Result<Vec<T>, RunError<E>> {
        let mut emissions = self.stream()?;
        let values = emissions.by_ref().map(|e| e.value).collect();
        emissions.finish()?;
        Ok(values)
    }
}

/// Drains the ordered events of a run on the delivery thread, passing each
/// result to the subscriber and assembling the aggregate.
///
/// Returning drops the receiver, which stops the worker threads if the run
/// isn't over yet.
fn deliver<T, E>(
    receiver: Receiver<Event<T, E>>,
    mut on_emit: impl FnMut(&T, usize, usize),
    total: usize,
) -> Outcome<T, E> {
    let mut aggregate = Vec::with_capacity(total);
    while let Ok(event) = receiver.recv() {
        match event {
            Event::Emit(Emission {
                index,
                total,
                value,
            }) => {
                let delivered = catch_unwind(AssertUnwindSafe(|| on_emit(&value, index, total)));
                if let Err(payload) = delivered {
                    log_error!("The subscriber panicked at index {index}, cancelling the run");
                    return Err(SequenceFailure {
                        index,
                        error: ComputeError::Panicked(panic_message(&*payload)),
                    });
                }
                aggregate.push(value);
            }
            Event::Completed => return Ok(aggregate),
            Event::Failed(failure) => return Err(failure),
        }
    }
    log_error!("The run was disconnected before reaching a terminal state");
    Err(SequenceFailure {
        index: aggregate.len(),
        error: ComputeError::Abandoned,
    })
}

/// Continuation registered on a [`Settlement`].
type Continuation<T, E> = Box<dyn FnOnce(Outcome<T, E>) + Send>;

/// Slot of a [`Settlement`].
enum Slot<T, E> {
    /// Neither an outcome nor a continuation is there yet.
    Pending,
    /// A continuation is waiting for the outcome.
    Registered(Continuation<T, E>),
    /// The outcome is waiting for a consumer.
    Settled(Outcome<T, E>),
    /// The outcome has been consumed.
    Done,
}

/// A single-assignment outcome, that can either be waited for or handed to a
/// continuation.
struct Settlement<T, E> {
    slot: Status<Slot<T, E>>,
}

impl<T, E> Settlement<T, E> {
    fn new() -> Self {
        Self {
            slot: Status::new(Slot::Pending),
        }
    }

    /// Sets the outcome, running the registered continuation if any.
    fn settle(&self, outcome: Outcome<T, E>) {
        let continuation = self.slot.update_all(|slot| {
            match std::mem::replace(slot, Slot::Done) {
                Slot::Pending => {
                    *slot = Slot::Settled(outcome);
                    None
                }
                Slot::Registered(continuation) => Some((continuation, outcome)),
                Slot::Settled(_) | Slot::Done => unreachable!("a run settles only once"),
            }
        });
        // The continuation runs without holding the lock.
        if let Some((continuation, outcome)) = continuation {
            continuation(outcome);
        }
    }

    /// Registers a continuation, running it right away on this thread if the
    /// outcome is already there.
    fn then(&self, continuation: Continuation<T, E>) {
        let mut continuation = Some(continuation);
        let outcome = self.slot.update_all(|slot| {
            match std::mem::replace(slot, Slot::Done) {
                Slot::Pending => {
                    *slot = continuation.take().map_or(Slot::Pending, Slot::Registered);
                    None
                }
                Slot::Settled(outcome) => Some(outcome),
                Slot::Registered(_) | Slot::Done => {
                    unreachable!("a subscription is consumed only once")
                }
            }
        });
        if let (Some(outcome), Some(continuation)) = (outcome, continuation) {
            continuation(outcome);
        }
    }

    /// Blocks until the outcome is set.
    fn wait(&self) -> Outcome<T, E> {
        let mut slot = self.slot.wait_while(|slot| matches!(slot, Slot::Pending));
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Settled(outcome) => outcome,
            Slot::Pending | Slot::Registered(_) | Slot::Done => {
                unreachable!("a subscription is consumed only once")
            }
        }
    }
}

/// Handle to a running pipeline, obtained via
/// [`MappedRange::subscribe()`].
///
/// Dropping the handle doesn't cancel the run: the subscriber keeps receiving
/// the results, and the outcome is discarded. The handle borrows the thread
/// pool running the pipeline.
pub struct Subscription<'pool, T, E> {
    settlement: Arc<Settlement<T, E>>,
    state: Arc<SharedState>,
    len: usize,
    _pool: PhantomData<&'pool ThreadPool>,
}

impl<T, E> Subscription<'_, T, E> {
    /// Current state of the pipeline.
    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Number of indices in the range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Registers a continuation for the outcome of the run. This doesn't
    /// block: the continuation runs once all the results have been delivered
    /// to the subscriber (or the first failure was reached), on the delivery
    /// thread, or right away on this thread if that already happened.
    pub fn then(self, on_settled: impl FnOnce(Outcome<T, E>) + Send + 'static) {
        self.settlement.then(Box::new(on_settled));
    }

    /// Blocks until the run has finished, and returns its outcome.
    pub fn wait(self) -> Outcome<T, E> {
        self.settlement.wait()
    }
}

/// Iterator over the successful results of a run, in index order, obtained
/// via [`MappedRange::stream()`].
///
/// The iterator stops at the end of the range or at the first failing index,
/// whose failure is available via [`finish()`](Self::finish). Dropping it
/// before that cancels the run, which then ends in [`PipelineState::Failed`].
///
/// The iterator borrows the thread pool, as the worker threads may be waiting
/// for it to make room for more results. The pool can therefore only be
/// dropped after the iterator:
///
/// ```compile_fail
/// # use parastream::{RunOptions, ThreadPoolBuilder};
/// # use std::num::NonZeroUsize;
/// let thread_pool = ThreadPoolBuilder::default().build();
/// let emissions = thread_pool
///     .range(100)
///     .with_options(RunOptions {
///         buffer_cap: NonZeroUsize::new(2),
///         ..Default::default()
///     })
///     .map(|i| i)
///     .stream()
///     .unwrap();
/// drop(thread_pool);
/// drop(emissions);
/// ```
pub struct Emissions<'pool, T, E> {
    receiver: Receiver<Event<T, E>>,
    state: Arc<SharedState>,
    len: usize,
    emitted: usize,
    outcome: Option<Result<usize, SequenceFailure<E>>>,
    _pool: PhantomData<&'pool ThreadPool>,
}

impl<T, E> Emissions<'_, T, E> {
    /// Current state of the pipeline.
    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Number of indices in the range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consumes the remaining results, and returns the total number of
    /// results emitted or the first failure in index order.
    pub fn finish(mut self) -> Result<usize, SequenceFailure<E>> {
        loop {
            if let Some(outcome) = self.outcome.take() {
                return outcome;
            }
            self.next();
        }
    }
}

impl<T, E> Iterator for Emissions<'_, T, E> {
    type Item = Emission<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.outcome.is_some() {
            return None;
        }
        match self.receiver.recv() {
            Ok(Event::Emit(emission)) => {
                self.emitted += 1;
                Some(emission)
            }
            Ok(Event::Completed) => {
                self.state.settle(PipelineState::Completed);
                self.outcome = Some(Ok(self.emitted));
                None
            }
            Ok(Event::Failed(failure)) => {
                self.state.settle(PipelineState::Failed);
                self.outcome = Some(Err(failure));
                None
            }
            Err(_) => {
                log_error!("The run was disconnected before reaching a terminal state");
                self.state.settle(PipelineState::Failed);
                self.outcome = Some(Err(SequenceFailure {
                    index: self.emitted,
                    error: ComputeError::Abandoned,
                }));
                None
            }
        }
    }
}

impl<T, E> Drop for Emissions<'_, T, E> {
    fn drop(&mut self) {
        if self.state.get() != PipelineState::Running {
            return;
        }
        // Only the terminal event may be left unread for the run to count as
        // completed.
        let terminal = match self.receiver.try_recv() {
            Ok(Event::Completed) => PipelineState::Completed,
            _ => {
                log_debug!(
                    "Results dropped after {} emission(s), cancelling the run",
                    self.emitted
                );
                PipelineState::Failed
            }
        };
        self.state.settle(terminal);
    }
}
