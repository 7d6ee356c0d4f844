// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reordering of completions into index order.

use super::unit::Completion;
use crate::error::{ComputeError, SequenceFailure};
use crate::macros::{log_debug, log_error, log_trace};
use crate::pipeline::Emission;
use std::collections::HashMap;

/// Event produced by a [`Sequencer`], in index order.
#[derive(Debug, PartialEq, Eq)]
pub enum Event<T, E> {
    /// A successful result, whose turn has come.
    Emit(Emission<T>),
    /// All the indices have been emitted.
    Completed,
    /// The first failure in index order. No event follows.
    Failed(SequenceFailure<E>),
}

/// State of a [`Sequencer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerState {
    /// Waiting for more completions.
    Sequencing,
    /// All the indices have been emitted.
    Completed,
    /// A failure was emitted. Subsequent completions are discarded.
    Failed,
}

/// Reorders completions arriving in any order, and emits them strictly in
/// increasing index order, without gaps.
///
/// Invariant: all the indices below `next_expected` have been emitted exactly
/// once, and no other index has been emitted.
pub struct Sequencer<T, E> {
    /// Total number of indices.
    total: usize,
    /// Next index to emit.
    next_expected: usize,
    /// Completions that arrived before their turn.
    pending: HashMap<usize, Result<T, ComputeError<E>>>,
    /// Current state.
    state: SequencerState,
    /// Number of completions received after reaching a terminal state.
    discarded: usize,
}

impl<T, E> Sequencer<T, E> {
    /// Creates a sequencer expecting the indices `0..total`.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            next_expected: 0,
            pending: HashMap::new(),
            state: SequencerState::Sequencing,
            discarded: 0,
        }
    }

    /// Next index to emit.
    pub fn next_expected(&self) -> usize {
        self.next_expected
    }

    /// Current state.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Number of completions buffered until their turn comes.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of completions discarded after reaching a terminal state.
    pub fn num_discarded(&self) -> usize {
        self.discarded
    }

    /// Emits [`Event::Completed`] if there is nothing to sequence at all.
    pub fn start(&mut self, sink: impl FnOnce(Event<T, E>)) -> SequencerState {
        if self.state == SequencerState::Sequencing && self.total == 0 {
            self.state = SequencerState::Completed;
            sink(Event::Completed);
        }
        self.state
    }

    /// Forces a failure at the next expected index, unless a terminal state
    /// was already reached.
    pub fn abandon(&mut self, sink: impl FnOnce(Event<T, E>)) -> SequencerState {
        if self.state == SequencerState::Sequencing {
            log_error!(
                "Abandoning sequencing at index {} of {}",
                self.next_expected,
                self.total
            );
            self.fail(self.next_expected, ComputeError::Abandoned, sink);
        }
        self.state
    }

    /// Accepts a completion, and forwards to the sink every event that
    /// became ready as a result.
    pub fn accept(
        &mut self,
        completion: Completion<T, E>,
        mut sink: impl FnMut(Event<T, E>),
    ) -> SequencerState {
        let Completion { index, outcome } = completion;
        if self.state != SequencerState::Sequencing {
            log_trace!("Discarding completion #{index} in state {:?}", self.state);
            self.discarded += 1;
            return self.state;
        }
        if index >= self.total || index < self.next_expected || self.pending.contains_key(&index)
        {
            log_error!(
                "Ignoring completion #{index}: out of range or already received (total = {}, next expected = {})",
                self.total,
                self.next_expected
            );
            return self.state;
        }

        log_trace!(
            "Received completion #{index}, next expected = {}",
            self.next_expected
        );
        self.pending.insert(index, outcome);

        while let Some(outcome) = self.pending.remove(&self.next_expected) {
            let index = self.next_expected;
            self.next_expected += 1;
            match outcome {
                Ok(value) => sink(Event::Emit(Emission {
                    index,
                    total: self.total,
                    value,
                })),
                Err(error) => {
                    self.fail(index, error, sink);
                    return self.state;
                }
            }
        }

        if self.next_expected == self.total {
            log_debug!("Sequenced all {} indices", self.total);
            self.state = SequencerState::Completed;
            sink(Event::Completed);
        }
        self.state
    }

    fn fail(&mut self, index: usize, error: ComputeError<E>, sink: impl FnOnce(Event<T, E>)) {
        log_debug!(
            "Failure at index {index}, dropping {} pending completion(s)",
            self.pending.len()
        );
        self.state = SequencerState::Failed;
        self.pending = HashMap::new();
        sink(Event::Failed(SequenceFailure { index, error }));
    }
}
