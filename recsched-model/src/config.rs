/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Scheduler configuration.

use clap::Parser;
use nix::sys::signal::Signal;
use serde::Deserialize;
use serde::Serialize;

use crate::pid::PID_MAX_LIMIT;
use crate::SigWrapper;

/// Configuration options for the record scheduler.
#[derive(Debug, Serialize, Deserialize, Clone, Parser)]
pub struct Config {
    /// How many consecutive selections a task may win before it is forced to yield to the
    /// next task in the ring. A freshly scheduled task starts with this allowance.
    #[clap(long, default_value = "10", value_name = "int")]
    pub max_events: i64,

    /// Retired-branch threshold programmed into each task's performance counter.
    #[clap(long, default_value = "500", value_name = "uint64")]
    pub max_rbc: u64,

    /// Exclusive upper bound on thread ids that may be registered.
    #[clap(long, default_value_t = PID_MAX_LIMIT, value_name = "int")]
    pub max_tid: i32,

    /// Signal broadcast to every remaining task when the supervisor shuts down.
    #[clap(long, default_value = "SIGINT", value_name = "SIG")]
    pub terminate_signal: SigWrapper,

    /// Disable hardware performance counters. Scheduling still works, but tasks are no
    /// longer interrupted after `--max-rbc` retired branches.
    #[clap(long = "no-hpc", parse(from_flag = std::ops::Not::not))]
    pub hpc: bool,
}

impl Config {
    /// Sanity check the flags.
    pub fn validate(&self) {
        assert!(
            self.max_events > 0,
            "--max-events must be positive, got {}",
            self.max_events
        );
        assert!(self.max_rbc > 0, "--max-rbc must be positive");
        assert!(
            self.max_tid > 1 && self.max_tid <= PID_MAX_LIMIT,
            "--max-tid must be in (1, {}], got {}",
            PID_MAX_LIMIT,
            self.max_tid
        );
    }

    /// The signal sent by `terminate_all`.
    pub fn terminate_signal(&self) -> Signal {
        self.terminate_signal.0
    }
}

/// N.B. we don't want to specify two different notions of "default", so we use the
/// `Clap` instance above.
impl Default for Config {
    fn default() -> Self {
        let v: Vec<String> = vec!["recsched".to_string()];
        Config::parse_from(v.iter())
    }
}
