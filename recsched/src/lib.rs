/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The task scheduler of a ptrace-based recorder.
//!
//! A single controller registers every traced thread with a [`Scheduler`], then asks it at
//! each recording step which task may run next. See [`scheduler`] for the algorithm and
//! [`backend`] for the OS collaborators it drives.

#![deny(clippy::all)]
#![deny(missing_docs)]
#![allow(clippy::uninlined_format_args)]

pub mod backend;
pub mod detlog;
mod error;
pub mod scheduler;
pub mod task;
pub mod testing;
pub mod types;

pub use backend::Backend;
pub use backend::LinuxBackend;
pub use error::Error;
pub use error::Result;
pub use recsched_model::config::Config;
pub use scheduler::ring::TaskHandle;
pub use scheduler::SchedStats;
pub use scheduler::Scheduler;
pub use scheduler::Selection;
pub use task::Task;
