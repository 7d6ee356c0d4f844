// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared queue handing out units of work to the worker threads.

use super::util::Status;
use crate::macros::log_debug;
use crossbeam_utils::CachePadded;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A queue of contiguous ranges partitioning `0..len`, handed out greedily in
/// index order.
///
/// Because dispatch is in index order, all the indices below any dispatched
/// index have been dispatched as well. This is what makes it correct to stop
/// dispatching everything above a failing index: the first failure in index
/// order is necessarily at or below it.
pub struct UnitQueue {
    /// Total number of indices.
    len: usize,
    /// Number of indices in each unit (the last unit may be shorter).
    chunk_size: usize,
    /// Start of the next unit to hand out.
    cursor: CachePadded<AtomicUsize>,
    /// Dynamic upper bound (inclusive) of indices to process. This can only
    /// decrease.
    bound: CachePadded<AtomicUsize>,
    /// Whether the queue has been stopped altogether.
    stopped: AtomicBool,
    /// Credit window, if the number of indices processed ahead of the
    /// sequencer is capped.
    credit: Option<Credit>,
}

/// Flow control between the queue and the sequencer: a unit is only handed out
/// once its start index is within `cap` of the next index to sequence.
struct Credit {
    cap: usize,
    /// Next index that the sequencer expects.
    sequenced: Status<usize>,
}

impl UnitQueue {
    /// Creates a queue over `0..len`.
    pub fn new(len: usize, chunk_size: NonZeroUsize, buffer_cap: Option<NonZeroUsize>) -> Self {
        Self {
            len,
            chunk_size: chunk_size.get(),
            cursor: CachePadded::new(AtomicUsize::new(0)),
            bound: CachePadded::new(AtomicUsize::new(usize::MAX)),
            stopped: AtomicBool::new(false),
            credit: buffer_cap.map(|cap| Credit {
                cap: cap.get(),
                sequenced: Status::new(0),
            }),
        }
    }

    /// Number of units that this queue hands out when nothing is halted.
    pub fn num_units(&self) -> usize {
        self.len.div_ceil(self.chunk_size)
    }

    /// Takes the next unit of work, or returns [`None`] if the queue is
    /// exhausted or stopped.
    ///
    /// With a credit window, this blocks until the sequencer has caught up
    /// close enough to the returned unit.
    pub fn next_unit(&self) -> Option<std::ops::Range<usize>> {
        if self.stopped.load(Ordering::Relaxed) {
            return None;
        }
        // The cursor only overshoots `len` by at most one chunk per worker
        // thread, as each worker stops pulling after the first miss.
        let start = self.cursor.fetch_add(self.chunk_size, Ordering::Relaxed);
        if start >= self.len || !self.is_dispatchable(start) {
            return None;
        }

        if let Some(credit) = &self.credit {
            let guard = credit.sequenced.wait_while(|sequenced| {
                start >= sequenced.saturating_add(credit.cap) && self.is_dispatchable(start)
            });
            drop(guard);
            if !self.is_dispatchable(start) {
                return None;
            }
        }

        Some(start..std::cmp::min(start + self.chunk_size, self.len))
    }

    /// Whether the given index still needs to be computed.
    #[inline(always)]
    pub fn is_dispatchable(&self, index: usize) -> bool {
        index <= self.bound.load(Ordering::Relaxed) && !self.stopped.load(Ordering::Relaxed)
    }

    /// Stops handing out indices larger than the given one.
    pub fn halt_after(&self, index: usize) {
        let previous = self.bound.fetch_min(index, Ordering::Relaxed);
        if index < previous {
            log_debug!("Halting dispatch after index {index}");
            self.wake_up();
        }
    }

    /// Stops handing out any unit.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::Relaxed) {
            log_debug!("Stopping dispatch");
            self.wake_up();
        }
    }

    /// Records that the sequencer now expects the given index, opening the
    /// credit window accordingly.
    pub fn release(&self, sequenced: usize) {
        if let Some(credit) = &self.credit {
            credit
                .sequenced
                .update_all(|s| *s = std::cmp::max(*s, sequenced));
        }
    }

    /// Wakes up the threads waiting for credit, so that they re-check whether
    /// their unit still needs processing.
    fn wake_up(&self) {
        if let Some(credit) = &self.credit {
            // Taking the lock orders this wake-up after the bound update, so
            // that no waiter can miss it.
            credit.sequenced.update_all(|_| ());
        }
    }
}
