/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-task state kept by the scheduler for every traced thread.

use std::fmt;
use std::os::unix::io::RawFd;

use nix::sys::wait::WaitStatus;

use crate::types::ExecState;
use crate::types::Tid;

/// Address range occupied by the syscall-buffering library inside the tracee. Children
/// inherit the range of their parent, since they share (or copy) its address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallbufRegion {
    /// First byte of the library mapping, 0 if not yet known.
    pub start: usize,
    /// One past the last byte of the library mapping.
    pub end: usize,
}

impl SyscallbufRegion {
    /// Has the library been located yet?
    pub fn is_mapped(&self) -> bool {
        self.start < self.end
    }
}

/// An armed hardware performance counter.
#[derive(Debug, PartialEq, Eq)]
pub struct CounterHandle {
    /// The counter file descriptor. `None` when counters are disabled and the handle only
    /// records that the task was armed.
    pub fd: Option<RawFd>,
    /// Programmed overflow threshold, set once the counter has been started.
    pub threshold: Option<u64>,
}

/// One ptrace-stopped OS thread under supervision.
///
/// Records are owned by the [`Scheduler`](crate::Scheduler); everyone else refers to them
/// through a [`TaskHandle`](crate::TaskHandle).
#[derive(Debug)]
pub struct Task {
    /// The OS thread id. Unique among live tasks.
    pub tid: Tid,
    /// The thread id this task had in the recording. Starts out equal to `tid`.
    pub rec_tid: Tid,
    /// Where the task is relative to its current syscall.
    pub exec_state: ExecState,
    /// Raw status from the most recent wait notification.
    pub status: i32,
    /// False while the task must not be preempted, e.g. inside a syscall-buffer flush.
    pub switchable: bool,
    /// Remaining selections before the task is forced to yield. Negative means "must yield".
    pub switch_budget: i64,
    /// Handle on `/proc/<tid>/mem`.
    pub mem_fd: Option<RawFd>,
    /// Our end of the descheduling notifier.
    pub desched_fd: Option<RawFd>,
    /// The tracee's fd number for the descheduling notifier. Lives in the tracee's table.
    pub desched_fd_child: Option<RawFd>,
    /// See [`SyscallbufRegion`].
    pub syscallbuf: SyscallbufRegion,
    /// Performance counter, present between registration and deregistration.
    pub hpc: Option<CounterHandle>,
}

impl Task {
    /// A fresh, runnable record holding no OS resources yet.
    pub fn new(tid: Tid) -> Self {
        Task {
            tid,
            rec_tid: tid,
            exec_state: ExecState::Runnable,
            status: 0,
            switchable: true,
            switch_budget: 0,
            mem_fd: None,
            // These will be initialized when the syscall buffer is.
            desched_fd: None,
            desched_fd_child: None,
            syscallbuf: SyscallbufRegion::default(),
            hpc: None,
        }
    }

    /// Decode [`Task::status`].
    pub fn wait_status(&self) -> nix::Result<WaitStatus> {
        WaitStatus::from_raw(self.tid.as_pid(), self.status)
    }

    /// Does the task currently hold any OS resource that must be released?
    pub fn holds_resources(&self) -> bool {
        self.mem_fd.is_some() || self.desched_fd.is_some() || self.hpc.is_some()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tid {} (rec {}), {}, budget {}{}",
            self.tid,
            self.rec_tid,
            self.exec_state,
            self.switch_budget,
            if self.switchable { "" } else { ", unswitchable" }
        )
    }
}
