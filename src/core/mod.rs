// Copyright 2026 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: thread pool, dispatch queue, sequencing and synchronization
//! primitives.

pub(crate) mod pipeline;
pub(crate) mod queue;
pub(crate) mod sequencer;
mod thread_pool;
pub(crate) mod unit;
pub(crate) mod util;

pub use thread_pool::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};
