// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Work units and their completions.

use super::util::panic_message;
use crate::error::ComputeError;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A contiguous range of indices to compute with the given function.
pub struct WorkUnit<'a, F: ?Sized> {
    /// Indices covered by this unit.
    indices: std::ops::Range<usize>,
    /// Function to apply on each index.
    compute: &'a F,
}

impl<'a, F: ?Sized> WorkUnit<'a, F> {
    /// Creates a unit covering the given indices.
    pub fn new(indices: std::ops::Range<usize>, compute: &'a F) -> Self {
        Self { indices, compute }
    }

    /// First index of this unit, which identifies it.
    pub fn start(&self) -> usize {
        self.indices.start
    }

    /// Indices covered by this unit.
    pub fn indices(&self) -> std::ops::Range<usize> {
        self.indices.clone()
    }

    /// Runs the computation on the given index, capturing both returned errors
    /// and panics into the completion.
    pub fn execute<T, E>(&self, index: usize) -> Completion<T, E>
    where
        F: Fn(usize) -> Result<T, E>,
    {
        debug_assert!(self.indices.contains(&index));
        let outcome = match catch_unwind(AssertUnwindSafe(|| (self.compute)(index))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ComputeError::Failed(e)),
            Err(payload) => Err(ComputeError::Panicked(panic_message(&*payload))),
        };
        Completion { index, outcome }
    }
}

impl<F: ?Sized> PartialEq for WorkUnit<'_, F> {
    fn eq(&self, other: &Self) -> bool {
        self.start() == other.start()
    }
}

impl<F: ?Sized> Eq for WorkUnit<'_, F> {}

/// The outcome of computing one index.
#[derive(Debug, PartialEq, Eq)]
pub struct Completion<T, E> {
    /// Index that was computed.
    pub index: usize,
    /// Result of the computation.
    pub outcome: Result<T, ComputeError<E>>,
}
