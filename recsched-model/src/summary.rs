/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Counters describing what the scheduler did over a run.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Statistics accumulated by the scheduler.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Completed calls to `select_next`, including short-circuited ones.
    pub selections: u64,
    /// Selections that picked the task that was already running.
    pub same_task_reselections: u64,
    /// Times a task had exhausted its budget and the cursor was moved past it.
    pub budget_preemptions: u64,
    /// Selections that returned an unswitchable task unchanged.
    pub nonswitchable_returns: u64,
    /// Non-blocking status polls issued.
    pub nonblocking_polls: u64,
    /// Blocking waits that returned a task.
    pub blocking_waits: u64,
    /// Blocking waits that were interrupted and retried.
    pub interrupted_waits: u64,
    /// Tasks registered.
    pub registered: u64,
    /// Tasks deregistered.
    pub deregistered: u64,
}

/// A human-readable, multi-line summary.
impl fmt::Display for SchedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let SchedStats {
            selections,
            same_task_reselections,
            budget_preemptions,
            nonswitchable_returns,
            nonblocking_polls,
            blocking_waits,
            interrupted_waits,
            registered,
            deregistered,
        } = self;
        writeln!(
            f,
            "Scheduled {} times ({} reselections, {} budget preemptions, {} unswitchable).",
            selections, same_task_reselections, budget_preemptions, nonswitchable_returns
        )?;
        writeln!(
            f,
            "Issued {} status polls and {} blocking waits ({} interrupted).",
            nonblocking_polls, blocking_waits, interrupted_waits
        )?;
        writeln!(
            f,
            "Registered {} task(s), deregistered {}.",
            registered, deregistered
        )
    }
}
