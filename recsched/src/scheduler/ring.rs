/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The cyclic ring of live tasks.
//!
//! Tasks are visited in insertion order, wrapping from the tail back to the head, which is
//! what gives the scheduler its round-robin fairness. The ring is an arena of slots: each
//! occupied slot holds a [`Task`] plus the slot numbers of its neighbours, so insertion,
//! removal and "next after X" are all O(1) and nothing is ever moved.
//!
//! Slots are recycled. Every slot carries a generation that is bumped on removal, and a
//! [`TaskHandle`] remembers the generation it was issued under, so a handle to a removed
//! task never resolves to whoever reuses its slot.

use std::fmt;

use crate::task::Task;

/// A stable, non-owning reference to a task in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle {
    slot: u32,
    generation: u32,
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
struct Entry {
    task: Task,
    prev: u32,
    next: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Ordered cyclic collection of tasks. See the module docs.
#[derive(Debug, Default)]
pub struct TaskRing {
    slots: Vec<Slot>,
    /// Vacant slots, reused most-recently-freed first.
    free: Vec<u32>,
    /// Invariant: `None` exactly when the ring is empty.
    head: Option<u32>,
    len: usize,
}

/// A multi-line print of the ring, head first.
impl fmt::Display for TaskRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Task ring, size={}:", self.len)?;
        for (h, task) in self.iter() {
            writeln!(f, "    {} {}", h, task)?;
        }
        Ok(())
    }
}

impl TaskRing {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks in the ring.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if there are no tasks.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The oldest task, if any.
    pub fn head(&self) -> Option<TaskHandle> {
        self.head.map(|slot| self.handle_of(slot))
    }

    /// Does `h` still refer to a live task?
    pub fn contains(&self, h: TaskHandle) -> bool {
        self.entry(h).is_some()
    }

    /// Borrow the task behind `h`, if it is still live.
    pub fn get(&self, h: TaskHandle) -> Option<&Task> {
        self.entry(h).map(|e| &e.task)
    }

    /// Mutably borrow the task behind `h`, if it is still live.
    pub fn get_mut(&mut self, h: TaskHandle) -> Option<&mut Task> {
        let slot = self.slots.get_mut(h.slot as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.entry.as_mut().map(|e| &mut e.task)
    }

    /// Append `task` at the tail, i.e. just before the head in ring order.
    pub fn insert_tail(&mut self, task: Task) -> TaskHandle {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(self.slots.len()).expect("task ring overflow");
                self.slots.push(Slot::default());
                slot
            }
        };

        let (prev, next) = match self.head {
            None => {
                self.head = Some(slot);
                (slot, slot)
            }
            Some(head) => {
                let tail = self.live(head).prev;
                self.live_mut(tail).next = slot;
                self.live_mut(head).prev = slot;
                (tail, head)
            }
        };

        let s = &mut self.slots[slot as usize];
        debug_assert!(s.entry.is_none(), "free list pointed to an occupied slot");
        s.entry = Some(Entry { task, prev, next });
        self.len += 1;
        TaskHandle {
            slot,
            generation: s.generation,
        }
    }

    /// Unlink and return the task behind `h`.
    ///
    /// Panics if `h` is stale: removing a task twice is a bookkeeping bug.
    pub fn remove(&mut self, h: TaskHandle) -> Task {
        let (prev, next) = match self.entry(h) {
            Some(e) => (e.prev, e.next),
            None => panic!("Invariant violation! Removing {} which is not in the ring", h),
        };

        if next == h.slot {
            debug_assert_eq!(self.len, 1);
            self.head = None;
        } else {
            self.live_mut(prev).next = next;
            self.live_mut(next).prev = prev;
            if self.head == Some(h.slot) {
                self.head = Some(next);
            }
        }

        let s = &mut self.slots[h.slot as usize];
        let entry = s.entry.take().expect("checked above");
        s.generation = s.generation.wrapping_add(1);
        self.free.push(h.slot);
        self.len -= 1;
        entry.task
    }

    /// The cyclic successor of `h`. A lone task is its own successor.
    ///
    /// Panics if `h` is stale.
    pub fn next_after(&self, h: TaskHandle) -> TaskHandle {
        let entry = self
            .entry(h)
            .unwrap_or_else(|| panic!("Invariant violation! {} is not in the ring", h));
        self.handle_of(entry.next)
    }

    /// Iterate over the ring once, starting at the head.
    pub fn iter(&self) -> impl Iterator<Item = (TaskHandle, &Task)> + '_ {
        let mut cursor = self.head;
        let mut remaining = self.len;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            let slot = cursor?;
            let entry = self.live(slot);
            cursor = Some(entry.next);
            Some((self.handle_of(slot), &entry.task))
        })
    }

    fn entry(&self, h: TaskHandle) -> Option<&Entry> {
        let slot = self.slots.get(h.slot as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn handle_of(&self, slot: u32) -> TaskHandle {
        TaskHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    fn live(&self, slot: u32) -> &Entry {
        self.slots[slot as usize]
            .entry
            .as_ref()
            .expect("ring link points at a vacant slot")
    }

    fn live_mut(&mut self, slot: u32) -> &mut Entry {
        self.slots[slot as usize]
            .entry
            .as_mut()
            .expect("ring link points at a vacant slot")
    }
}
