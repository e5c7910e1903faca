/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Recoverable scheduler failures.
//!
//! Bookkeeping bugs (duplicate tids, stale handles, unknown wait results) are not errors:
//! they panic, because nothing downstream can be trusted afterwards. What remains here
//! are failures of the OS collaborators, which a host may want to escalate on its own
//! terms.

use nix::errno::Errno;
use thiserror::Error;

use crate::types::Tid;

/// Convenience alias.
pub type Result<T> = std::result::Result<T, Error>;

/// A failure reported by one of the scheduler's backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The blocking wait on all tasks failed for a reason other than interruption. The
    /// scheduler cannot make progress.
    #[error("waiting for any traced task failed")]
    Wait {
        /// Reported by the wait primitive.
        #[source]
        source: Errno,
    },

    /// The non-blocking status poll of one task failed.
    #[error("polling status of tid {tid} failed")]
    Poll {
        /// The task that was polled.
        tid: Tid,
        /// Reported by the wait primitive.
        #[source]
        source: Errno,
    },

    /// Acquiring or programming a per-task resource failed during registration.
    #[error("{op} failed for tid {tid}")]
    Backend {
        /// What was being attempted.
        op: &'static str,
        /// The task being registered.
        tid: Tid,
        /// The underlying error.
        #[source]
        source: Errno,
    },
}

impl Error {
    /// The errno behind this failure.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Wait { source } => *source,
            Error::Poll { source, .. } => *source,
            Error::Backend { source, .. } => *source,
        }
    }
}
