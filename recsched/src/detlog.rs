/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Macros for logging scheduling decisions that must be identical between two runs:
//! [`detlog!`](crate::detlog) at INFO and [`detlog_debug!`](crate::detlog_debug) at DEBUG.
//!
//! Filtering a log for the `DETLOG` prefix yields the interleaving the scheduler chose, so
//! two recordings of the same program can be diffed line by line.

/// Log should-be-deterministic information at the INFO level.
#[macro_export]
macro_rules! detlog {
    ($($arg:tt)+) => {{
        tracing::info!("DETLOG {}", format!($($arg)+));
    }};
}

/// Log should-be-deterministic information at the DEBUG level.
#[macro_export]
macro_rules! detlog_debug {
    ($($arg:tt)+) => {{
        tracing::debug!("DETLOG {}", format!($($arg)+));
    }};
}
