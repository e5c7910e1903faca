/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lookup from OS thread id to the task's place in the ring.

use std::collections::BTreeMap;

use super::ring::TaskHandle;
use crate::types::Tid;

/// Maps every live task's tid to its ring handle, so that wait notifications (which only
/// carry a tid) can be resolved back to a record.
///
/// NB: BTreeMap over HashMap for deterministic printing.
#[derive(Debug)]
pub struct TaskIndex {
    map: BTreeMap<Tid, TaskHandle>,
    /// Exclusive upper bound on acceptable tids.
    max_tid: i32,
}

impl TaskIndex {
    /// An empty index accepting tids in `(0, max_tid)`.
    pub fn new(max_tid: i32) -> Self {
        TaskIndex {
            map: BTreeMap::new(),
            max_tid,
        }
    }

    /// Exclusive upper bound on acceptable tids.
    pub fn max_tid(&self) -> i32 {
        self.max_tid
    }

    /// Add a mapping. Panics on an out-of-range or already-present tid.
    pub fn insert(&mut self, tid: Tid, h: TaskHandle) {
        if !tid.in_range(self.max_tid) {
            panic!(
                "Invariant violation! tid {} outside of (0, {})",
                tid, self.max_tid
            );
        }
        if let Some(old) = self.map.insert(tid, h) {
            panic!(
                "Invariant violation! tid {} already indexed at {}",
                tid, old
            );
        }
    }

    /// Find the handle for `tid`, if it is live.
    pub fn get(&self, tid: Tid) -> Option<TaskHandle> {
        self.map.get(&tid).copied()
    }

    /// Is `tid` live?
    pub fn contains(&self, tid: Tid) -> bool {
        self.map.contains_key(&tid)
    }

    /// Drop the mapping for `tid`, returning the handle it had.
    pub fn remove(&mut self, tid: Tid) -> Option<TaskHandle> {
        self.map.remove(&tid)
    }

    /// Number of indexed tids.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All live tids, ascending.
    pub fn tids(&self) -> impl Iterator<Item = Tid> + '_ {
        self.map.keys().copied()
    }
}
