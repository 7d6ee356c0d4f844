// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod core;
mod error;
mod macros;
mod pipeline;

pub use crate::core::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};
pub use error::{ComputeError, InvalidRangeError, InvalidStateError, SequenceFailure};
pub use pipeline::{
    Emission, Emissions, MappedRange, Outcome, PipelineState, RangeBuilder, RunError, RunOptions,
    Subscription,
};
