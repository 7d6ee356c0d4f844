// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types reported by the thread pool and by range-map pipelines.

use crate::pipeline::PipelineState;
use thiserror::Error;

/// Invalid parameters, rejected synchronously before anything is dispatched to
/// the worker threads.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRangeError {
    /// The requested range length is negative.
    #[error("range length must be non-negative, got {0}")]
    NegativeLength(i64),
    /// The requested range length doesn't fit in the address space.
    #[error("range length {0} exceeds the addressable size")]
    TooLong(i64),
    /// The requested number of worker threads is zero.
    #[error("concurrency must be at least 1 worker thread")]
    ZeroConcurrency,
}

/// Failure of the user computation for a single index.
///
/// Both failure channels of a computation end up here: returning an error, and
/// panicking.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComputeError<E> {
    /// The computation returned an error.
    #[error("computation failed: {0}")]
    Failed(E),
    /// The computation panicked with the given message.
    #[error("computation panicked: {0}")]
    Panicked(String),
    /// The worker thread running the computation terminated before reporting
    /// a result.
    #[error("worker thread terminated before reporting a result")]
    Abandoned,
}

/// The first failing index of a run, in index order.
///
/// This is what a run rejects with, even if computations at larger indices
/// failed earlier in wall-clock time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("index {index}: {error}")]
pub struct SequenceFailure<E> {
    /// Index at which the computation failed.
    pub index: usize,
    /// Failure of the computation at this index.
    pub error: ComputeError<E>,
}

/// An operation was invoked on a pipeline that isn't in a state accepting it,
/// for example subscribing twice to the same pipeline.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot {operation} a pipeline in state {state:?}")]
pub struct InvalidStateError {
    /// State of the pipeline when the operation was attempted.
    pub state: PipelineState,
    /// Name of the rejected operation.
    pub operation: &'static str,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            InvalidRangeError::NegativeLength(-3).to_string(),
            "range length must be non-negative, got -3"
        );
        assert_eq!(
            SequenceFailure {
                index: 2,
                error: ComputeError::Failed("boom"),
            }
            .to_string(),
            "index 2: computation failed: boom"
        );
        assert_eq!(
            InvalidStateError {
                state: PipelineState::Completed,
                operation: "subscribe to",
            }
            .to_string(),
            "cannot subscribe to a pipeline in state Completed"
        );
    }
}
