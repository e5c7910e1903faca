/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Round-robin scheduling of traced tasks during recording.
//!
//! The recorder calls [`Scheduler::select_next`] once per step. Selection walks the ring
//! of live tasks starting at the cursor, takes the first one that is not inside a
//! possibly-blocking syscall, and polls the ones that are. If a whole revolution finds
//! nothing, it blocks until the kernel reports some task changed state. Each task gets a
//! budget of consecutive selections; once that runs out the cursor moves past it, so no
//! runnable task can starve the others.
//!
//! Given the same task states and the same answers from the backend, selection makes the
//! same choices, which is what makes the recorded interleaving reproducible.

pub mod index;
pub mod ring;

use std::fmt::Write;

use index::TaskIndex;
use nix::errno::Errno;
use nix::sys::signal::Signal;
pub use recsched_model::summary::SchedStats;
use ring::TaskHandle;
use ring::TaskRing;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::backend::Backend;
use crate::backend::BlockingWait;
use crate::Config;
use crate::detlog;
use crate::detlog_debug;
use crate::error::Error;
use crate::error::Result;
use crate::task::Task;
use crate::types::ExecState;
use crate::types::Tid;

/// The outcome of one [`Scheduler::select_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// The task that may run next.
    pub task: TaskHandle,
    /// True if the task was picked because a wait reported a new status for it. The new
    /// status is in [`Task::status`].
    pub by_waitpid: bool,
}

/// The state for the record scheduler.
///
/// Exactly one controller thread owns this; there is no internal locking.
#[derive(Debug)]
pub struct Scheduler<B> {
    /// Every live task, in round-robin order.
    ring: TaskRing,

    /// tid -> ring handle.
    /// INVARIANT: holds exactly the tids of the tasks in `ring`.
    index: TaskIndex,

    /// The most recently selected task. Non-owning: `deregister` moves it off a task
    /// before destroying it. `None` before the first selection and after the last task
    /// leaves.
    cursor: Option<TaskHandle>,

    /// The OS collaborators.
    backend: B,

    /// Sent to every remaining task by `terminate_all`.
    terminate_signal: Signal,

    stats: SchedStats,
}

impl<B: Backend> Scheduler<B> {
    /// Create an empty scheduler based on the configuration.
    pub fn new(cfg: &Config, backend: B) -> Self {
        cfg.validate();
        Scheduler {
            ring: TaskRing::new(),
            index: TaskIndex::new(cfg.max_tid),
            cursor: None,
            backend,
            terminate_signal: cfg.terminate_signal(),
            stats: SchedStats::default(),
        }
    }

    /// Pick the task that runs next, in round-robin fashion.
    ///
    /// `current` is the task that ran the last step, if any. Its budget decides whether it
    /// may keep running; if it is unswitchable it is returned unchanged.
    ///
    /// Must not be called with no live tasks. Fails only if waiting on the tasks fails.
    pub fn select_next(
        &mut self,
        current: Option<TaskHandle>,
        max_events: i64,
    ) -> Result<Selection> {
        debug!("Scheduling next task");

        let mut entry = match self.cursor {
            Some(c) => c,
            None => {
                let head = self
                    .ring
                    .head()
                    .expect("select_next called with no registered tasks");
                self.cursor = Some(head);
                head
            }
        };

        if let Some(cur) = current {
            let task = self.live_mut(cur);
            if !task.switchable {
                debug!("  ({} is un-switchable)", task.tid);
                // If the task is blocked in a syscall the caller will spin on it until it
                // becomes switchable again; that is the caller's responsibility.
                self.stats.selections += 1;
                self.stats.nonswitchable_returns += 1;
                return Ok(Selection {
                    task: cur,
                    by_waitpid: false,
                });
            }

            // Prefer switching to the next task if the current one exceeded its event limit.
            if task.switch_budget < 0 {
                debug!("  previous task {} exceeded event limit, preferring next", task.tid);
                task.switch_budget = max_events;
                self.stats.budget_preemptions += 1;
                entry = self.ring.next_after(entry);
                self.cursor = Some(entry);
            }
        }

        let (chosen, by_waitpid) = match self.scan_ring(entry)? {
            Some(found) => found,
            None => (self.wait_for_any()?, true),
        };

        self.cursor = Some(chosen);
        self.note_switch(current, chosen, max_events);
        self.stats.selections += 1;

        let task = self.live(chosen);
        detlog!(
            "SCHED: selected tid {} (by_waitpid {}, budget {})",
            task.tid,
            by_waitpid,
            task.switch_budget
        );
        Ok(Selection {
            task: chosen,
            by_waitpid,
        })
    }

    /// Go around the ring exactly once, starting at `start`, looking for a task that can
    /// run. Returns the task and whether a poll was what made it runnable.
    fn scan_ring(&mut self, start: TaskHandle) -> Result<Option<(TaskHandle, bool)>> {
        let mut entry = start;
        loop {
            let task = self.live(entry);
            let tid = task.tid;
            if !task.exec_state.is_blocked() {
                trace!("  {} isn't blocked, done", tid);
                return Ok(Some((entry, false)));
            }

            trace!("  {} is blocked, checking status ...", tid);
            self.stats.nonblocking_polls += 1;
            let polled = self
                .backend
                .poll_nonblocking(tid)
                .map_err(|source| Error::Poll { tid, source })?;
            if let Some(status) = polled {
                trace!("  ready! status {:#x}", status);
                self.live_mut(entry).status = status;
                return Ok(Some((entry, true)));
            }
            trace!("  still blocked");

            entry = self.ring.next_after(entry);
            if entry == start {
                return Ok(None);
            }
        }
    }

    /// All the tasks are blocked. Wait for the next one to change state.
    fn wait_for_any(&mut self) -> Result<TaskHandle> {
        debug!(
            "  all tasks blocked, waiting for runnable ({} total)",
            self.active_count()
        );
        let (tid, status) = loop {
            match self.backend.wait_blocking() {
                Ok(BlockingWait::Changed(tid, status)) => break (tid, status),
                Ok(BlockingWait::Interrupted) => {
                    debug!("  wait interrupted, retrying");
                    self.stats.interrupted_waits += 1;
                }
                Err(source) => return Err(Error::Wait { source }),
            }
        };
        self.stats.blocking_waits += 1;
        debug!("  {} changed state", tid);

        let h = self.index.get(tid).unwrap_or_else(|| {
            panic!(
                "Invariant violation! wait reported tid {} (status {:#x}) which is not registered:\n{}",
                tid,
                status,
                self.full_summary()
            )
        });
        self.live_mut(h).status = status;
        Ok(h)
    }

    /// Charge the selected task for its turn: one unit if it keeps running, a full budget
    /// if it is newly switched in.
    fn note_switch(&mut self, prev: Option<TaskHandle>, next: TaskHandle, max_events: i64) {
        let task = self.live_mut(next);
        if prev == Some(next) {
            task.switch_budget -= 1;
            self.stats.same_task_reselections += 1;
        } else {
            task.switch_budget = max_events;
        }
    }

    /// Start tracking `child`, a new task spawned by `parent` (or the initial task if
    /// `parent` is `None`). Acquires the task's memory handle, completes the ptrace
    /// handshake and starts its counters with `max_rbc` as the threshold.
    ///
    /// Panics if `child` is out of range or already registered. If acquiring a resource
    /// fails, whatever was acquired is released again and the task is not registered.
    pub fn register(&mut self, parent: Option<Tid>, child: Tid, max_rbc: u64) -> Result<TaskHandle> {
        assert!(
            child.in_range(self.index.max_tid()),
            "Invariant violation! tid {} outside of (0, {})",
            child,
            self.index.max_tid()
        );
        assert!(
            !self.index.contains(child),
            "Invariant violation! tid {} registered twice",
            child
        );

        let mut task = Task::new(child);
        if let Some(parent) = parent {
            match self.index.get(parent) {
                Some(ph) => task.syscallbuf = self.live(ph).syscallbuf,
                None => warn!(
                    "register: parent {} of tid {} is not registered, nothing to inherit",
                    parent, child
                ),
            }
        }

        if let Err(e) = self.acquire(&mut task, max_rbc) {
            self.release(&mut task);
            return Err(e);
        }

        let h = self.ring.insert_tail(task);
        self.index.insert(child, h);
        self.stats.registered += 1;
        self.check_counts();
        detlog_debug!(
            "SCHED: registered tid {} (parent {:?}), {} active",
            child,
            parent.map(|p| p.as_raw()),
            self.active_count()
        );
        Ok(h)
    }

    fn acquire(&mut self, task: &mut Task, max_rbc: u64) -> Result<()> {
        let tid = task.tid;
        task.mem_fd = Some(
            self.backend
                .open_memory_handle(tid)
                .map_err(backend_err("opening child memory", tid))?,
        );
        self.backend
            .ptrace_setup(tid)
            .map_err(backend_err("ptrace setup", tid))?;
        if let Err(e) = self.arm_counters(task, max_rbc) {
            // Attached but never tracked: nobody would be left to wait on it.
            if let Err(de) = self.backend.detach(tid) {
                warn!("detaching from unregistered tid {}: {}", tid, de);
            }
            return Err(e);
        }
        Ok(())
    }

    fn arm_counters(&mut self, task: &mut Task, max_rbc: u64) -> Result<()> {
        let tid = task.tid;
        self.backend
            .init(task)
            .map_err(backend_err("initializing counters", tid))?;
        self.backend
            .start(task, max_rbc)
            .map_err(backend_err("starting counters", tid))
    }

    /// Give back every OS resource `task` still holds. Failures are logged: the task is
    /// going away regardless.
    fn release(&mut self, task: &mut Task) {
        self.backend.stop_and_release(task);
        for fd in [task.mem_fd.take(), task.desched_fd.take()].into_iter().flatten() {
            if let Err(e) = self.backend.close(fd) {
                warn!("closing fd {} of tid {}: {}", fd, task.tid, e);
            }
        }
        // The child's end of the notifier is a number in the tracee's fd table; there is
        // nothing to close on our side.
        task.desched_fd_child = None;
        debug_assert!(!task.holds_resources(), "tid {} leaked a handle", task.tid);
    }

    /// Stop tracking `tid` and free everything it holds. Call exactly once, when the task is
    /// observed to have exited (or is being torn down).
    ///
    /// Panics if `tid` is not registered.
    pub fn deregister(&mut self, tid: Tid) {
        let h = self.index.get(tid).unwrap_or_else(|| {
            panic!("Invariant violation! deregistering unknown tid {}", tid)
        });

        // The cursor must never outlive the record it points to.
        if self.cursor == Some(h) {
            let next = self.ring.next_after(h);
            self.cursor = if next == h {
                assert_eq!(
                    self.active_count(),
                    1,
                    "Invariant violation! ring is its own successor with other tasks live"
                );
                None
            } else {
                Some(next)
            };
        }

        self.index.remove(tid);
        let mut task = self.ring.remove(h);
        self.stats.deregistered += 1;
        self.check_counts();

        self.release(&mut task);
        if let Err(e) = self.backend.detach(tid) {
            warn!("detaching from tid {}: {}", tid, e);
        }
        detlog_debug!(
            "SCHED: deregistered tid {}, {} active",
            tid,
            self.active_count()
        );
    }

    /// Signal every remaining task with the configured terminate signal and deregister it,
    /// oldest first. Leaves the scheduler empty.
    pub fn terminate_all(&mut self) {
        while let Some(h) = self.ring.head() {
            let tid = self.live(h).tid;
            debug!("terminating tid {} with {}", tid, self.terminate_signal);
            if let Err(e) = self.backend.send_signal(tid, self.terminate_signal) {
                warn!("signalling tid {}: {}", tid, e);
            }
            self.deregister(tid);
        }
        debug_assert!(self.cursor.is_none());
    }

    /// Number of live tasks. The recording is complete when this reaches zero.
    pub fn active_count(&self) -> usize {
        self.ring.len()
    }

    /// Borrow a live task.
    pub fn task(&self, h: TaskHandle) -> Option<&Task> {
        self.ring.get(h)
    }

    /// Mutably borrow a live task, e.g. to update its `exec_state` after a step.
    pub fn task_mut(&mut self, h: TaskHandle) -> Option<&mut Task> {
        self.ring.get_mut(h)
    }

    /// Resolve a tid to its task.
    pub fn lookup(&self, tid: Tid) -> Option<TaskHandle> {
        self.index.get(tid)
    }

    /// The task the cursor is on, i.e. the most recent selection if it is still live.
    pub fn current(&self) -> Option<TaskHandle> {
        self.cursor
    }

    /// Live tasks in ring order, starting from the oldest.
    pub fn tasks(&self) -> impl Iterator<Item = (TaskHandle, &Task)> + '_ {
        self.ring.iter()
    }

    /// What the scheduler has done so far.
    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    /// The OS collaborators.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The OS collaborators, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Summarize the state of the scheduler (verbose).
    pub fn full_summary(&self) -> String {
        let mut buf = String::new();
        writeln!(
            &mut buf,
            "  cursor: {}",
            match self.cursor {
                Some(h) => h.to_string(),
                None => "none".to_string(),
            }
        )
        .unwrap();
        write!(&mut buf, "  {}", &self.ring).unwrap();
        let tids: Vec<String> = self.index.tids().map(|t| t.to_string()).collect();
        writeln!(&mut buf, "  index: [{}]", tids.join(", ")).unwrap();
        buf
    }

    fn live(&self, h: TaskHandle) -> &Task {
        match self.ring.get(h) {
            Some(t) => t,
            None => panic!(
                "Invariant violation! handle {} does not name a live task:\n{}",
                h,
                self.full_summary()
            ),
        }
    }

    fn live_mut(&mut self, h: TaskHandle) -> &mut Task {
        if !self.ring.contains(h) {
            panic!(
                "Invariant violation! handle {} does not name a live task:\n{}",
                h,
                self.full_summary()
            );
        }
        self.ring.get_mut(h).expect("checked above")
    }

    fn check_counts(&self) {
        assert_eq!(
            self.ring.len(),
            self.index.len(),
            "Invariant violation! ring and index disagree:\n{}",
            self.full_summary()
        );
    }
}

fn backend_err(op: &'static str, tid: Tid) -> impl FnOnce(Errno) -> Error {
    move |source| Error::Backend { op, tid, source }
}

/// Tasks still registered at this point are never detached; hosts are expected to call
/// `terminate_all` first.
impl<B> Drop for Scheduler<B> {
    fn drop(&mut self) {
        if !self.ring.is_empty() {
            warn!(
                "Scheduler dropped with {} live task(s) still registered",
                self.ring.len()
            );
        }
    }
}
