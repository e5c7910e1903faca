/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Execution states of a traced task, as seen by the scheduler.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Where a traced task is, relative to the syscall it may be executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExecState {
    /// Stopped under ptrace and ready to be resumed.
    #[default]
    Runnable,
    /// Stopped at a syscall entry, before the recorder lets the syscall run.
    EnteringSyscall,
    /// Resumed into a syscall that may block. The only state the scheduler has to poll
    /// before it can pick the task again.
    ProcessingSyscall,
}

impl ExecState {
    /// Could this task be waiting on the kernel right now?
    pub fn is_blocked(&self) -> bool {
        matches!(self, ExecState::ProcessingSyscall)
    }
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ExecState::Runnable => "runnable",
            ExecState::EnteringSyscall => "entering-syscall",
            ExecState::ProcessingSyscall => "processing-syscall",
        };
        f.write_str(s)
    }
}
