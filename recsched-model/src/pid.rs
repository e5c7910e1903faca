/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::str::FromStr;

use nix::unistd;
use serde::Deserialize;
use serde::Serialize;

/// Largest thread id Linux will ever hand out on a 64-bit kernel (`PID_MAX_LIMIT`).
pub const PID_MAX_LIMIT: i32 = 4 * 1024 * 1024;

/// An OS thread id of a traced task.
#[derive(
    PartialEq, // Silly protection from rustfmt disagreements.
    Debug,
    Eq,
    Clone,
    Copy,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default
)]
pub struct Tid(i32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<unistd::Pid> for Tid {
    fn from(p: unistd::Pid) -> Self {
        Tid(p.into())
    }
}

// implementing From<Tid> for unistd::Pid would violate foreign trait rules
#[allow(clippy::from_over_into)]
impl Into<unistd::Pid> for Tid {
    fn into(self) -> unistd::Pid {
        unistd::Pid::from_raw(self.0)
    }
}

impl Tid {
    /// Create a Tid from a raw thread id.
    pub const fn from_raw(tid: i32) -> Tid {
        Tid(tid)
    }

    /// Convert to a raw integer.
    pub fn as_raw(&self) -> i32 {
        self.0
    }

    /// The same id as a `nix` pid, for handing to syscalls.
    pub fn as_pid(&self) -> unistd::Pid {
        unistd::Pid::from_raw(self.0)
    }

    /// Is this a usable thread id, given an exclusive upper bound?
    pub fn in_range(&self, max_tid: i32) -> bool {
        self.0 > 0 && self.0 < max_tid
    }
}

impl FromStr for Tid {
    type Err = <i32 as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_raw(s.parse::<i32>()?))
    }
}
