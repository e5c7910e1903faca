/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The OS collaborators the scheduler drives.
//!
//! The scheduler owns no OS logic of its own: waiting on tasks, programming counters and
//! acquiring or releasing per-task handles all go through these traits. [`LinuxBackend`]
//! implements them for real tracees; [`crate::testing::ScriptedBackend`] implements them
//! from a script for tests.

mod linux;
mod perf;

use std::os::unix::io::RawFd;

pub use linux::LinuxBackend;
use nix::errno::Errno;
use nix::sys::signal::Signal;
pub use perf::is_perf_supported;
pub use perf::TIME_SLICE_SIGNAL;

use crate::task::Task;
use crate::types::Tid;

/// Result of one blocking wait on all traced tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingWait {
    /// `tid` changed state; `status` is the raw wait status.
    Changed(Tid, i32),
    /// The wait was interrupted before anything changed. Retry.
    Interrupted,
}

/// Process-status polling.
pub trait WaitBackend {
    /// Check whether `tid` changed state, without blocking. `None` means no change yet.
    fn poll_nonblocking(&mut self, tid: Tid) -> Result<Option<i32>, Errno>;

    /// Block until any traced task changes state.
    fn wait_blocking(&mut self) -> Result<BlockingWait, Errno>;
}

/// Hardware performance counters, one set per task.
pub trait CounterBackend {
    /// Create the task's counters, stopped. Stores the handle in `task.hpc`.
    fn init(&mut self, task: &mut Task) -> Result<(), Errno>;

    /// Arm the task's counters to interrupt it after `threshold` events.
    fn start(&mut self, task: &mut Task, threshold: u64) -> Result<(), Errno>;

    /// Stop and free the task's counters, if it has any. Must tolerate a task whose
    /// counters were never initialized.
    fn stop_and_release(&mut self, task: &mut Task);
}

/// Per-task OS handles and ptrace plumbing.
pub trait ResourceBackend {
    /// Open a handle through which the task's memory can be read and written.
    fn open_memory_handle(&mut self, tid: Tid) -> Result<RawFd, Errno>;

    /// Close a handle previously handed out for some task.
    fn close(&mut self, fd: RawFd) -> Result<(), Errno>;

    /// Complete the attach handshake with a newly traced task.
    fn ptrace_setup(&mut self, tid: Tid) -> Result<(), Errno>;

    /// Stop tracing `tid`.
    fn detach(&mut self, tid: Tid) -> Result<(), Errno>;

    /// Deliver `sig` to `tid`.
    fn send_signal(&mut self, tid: Tid, sig: Signal) -> Result<(), Errno>;
}

/// Everything the scheduler needs from its environment.
pub trait Backend: WaitBackend + CounterBackend + ResourceBackend {}

impl<T: WaitBackend + CounterBackend + ResourceBackend> Backend for T {}
